use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;

static RE_TIME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"time=\s*(\d+:\d{1,2}:\d{1,2}(?:\.\d+)?)").expect("Failed to create regex pattern for elapsed time")
});

static RE_SPEED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"speed=\s*(\d+(?:\.\d+)?)x").expect("Failed to create regex pattern for speed"));

/// Elapsed time and speed extracted from one diagnostic line.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSample {
    /// Seconds of output written so far.
    pub elapsed_seconds: f64,
    /// Encoding speed relative to real time, if reported.
    pub speed_multiplier: Option<f64>,
}

/// Tracks the progress of one running job.
///
/// A new tracker is created for every job.
/// Lines without a time marker leave the previous state untouched.
#[derive(Debug, Clone, Default)]
pub struct ProgressTracker {
    total_duration: Option<f64>,
    last: Option<ProgressSample>,
}

impl ProgressSample {
    /// Extract a sample from a single diagnostic line.
    ///
    /// ```rust
    /// use vbatch_tools::convert::ProgressSample;
    ///
    /// let sample = ProgressSample::parse("frame=100 time=00:01:30.50 speed=2.0x").unwrap();
    /// assert_eq!(sample.elapsed_seconds, 90.5);
    /// assert_eq!(sample.speed_multiplier, Some(2.0));
    /// ```
    #[must_use]
    pub fn parse(line: &str) -> Option<Self> {
        let time = RE_TIME.captures(line)?;
        let elapsed_seconds = parse_time_to_seconds(&time[1])?;
        let speed_multiplier = RE_SPEED
            .captures(line)
            .and_then(|caps| caps[1].parse::<f64>().ok())
            .filter(|speed| *speed > 0.0);

        Some(Self {
            elapsed_seconds,
            speed_multiplier,
        })
    }
}

impl ProgressTracker {
    /// Create a tracker for a job with the given total duration in seconds.
    #[must_use]
    pub const fn new(total_duration: Option<f64>) -> Self {
        Self {
            total_duration,
            last: None,
        }
    }

    /// Feed one diagnostic line.
    /// Returns the new sample if the line contained a time marker.
    pub fn update(&mut self, line: &str) -> Option<ProgressSample> {
        let sample = ProgressSample::parse(line)?;
        self.last = Some(sample);
        Some(sample)
    }

    /// Last recognised sample.
    #[must_use]
    pub const fn last(&self) -> Option<ProgressSample> {
        self.last
    }

    /// Completion percentage in the range `0..=100`.
    ///
    /// Undefined when the total duration is unknown or zero.
    #[must_use]
    pub fn percentage(&self) -> Option<f64> {
        let total = self.known_total()?;
        let sample = self.last?;
        Some((sample.elapsed_seconds / total * 100.0).min(100.0))
    }

    /// Estimated remaining time for the current job.
    ///
    /// Uses the reported speed when present, otherwise assumes real-time speed.
    /// Undefined when the estimate does not fit in a [`Duration`].
    #[must_use]
    pub fn eta(&self) -> Option<Duration> {
        let total = self.known_total()?;
        let sample = self.last?;
        let remaining = (total - sample.elapsed_seconds).max(0.0);
        let seconds = sample.speed_multiplier.map_or(remaining, |speed| remaining / speed);
        Duration::try_from_secs_f64(seconds).ok()
    }

    fn known_total(&self) -> Option<f64> {
        self.total_duration.filter(|total| *total > 0.0)
    }
}

/// Convert `HH:MM:SS[.fraction]` to seconds.
///
/// ```rust
/// use vbatch_tools::convert::parse_time_to_seconds;
///
/// assert_eq!(parse_time_to_seconds("01:02:03.5"), Some(3723.5));
/// assert_eq!(parse_time_to_seconds("1:02"), None);
/// ```
#[must_use]
pub fn parse_time_to_seconds(time: &str) -> Option<f64> {
    let mut parts = time.trim().split(':');
    let hours = parts.next()?.parse::<f64>().ok()?;
    let minutes = parts.next()?.parse::<f64>().ok()?;
    let seconds = parts.next()?.parse::<f64>().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}
