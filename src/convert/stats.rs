use std::time::Duration;

use colored::Colorize;

use crate::convert::batch::{JobOutcome, OutputDisposition, SkipReason};

/// Elapsed times of completed jobs in one batch run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchStatistics {
    per_job_elapsed: Vec<Duration>,
}

/// Statistics for the conversion run
#[derive(Debug, Default)]
pub struct RunStats {
    pub files_converted: usize,
    pub files_discarded: usize,
    pub files_replaced: usize,
    pub files_skipped_no_info: usize,
    pub files_skipped_bitrate: usize,
    pub files_skipped_existing: usize,
    pub files_skipped_dryrun: usize,
    pub files_failed: usize,
    pub files_aborted: usize,
    pub total_original_size: u64,
    pub total_converted_size: u64,
    pub total_duration: Duration,
}

impl BatchStatistics {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            per_job_elapsed: Vec::new(),
        }
    }

    pub fn record(&mut self, elapsed: Duration) {
        self.per_job_elapsed.push(elapsed);
    }

    pub fn reset(&mut self) {
        self.per_job_elapsed.clear();
    }

    #[must_use]
    pub fn elapsed(&self) -> &[Duration] {
        &self.per_job_elapsed
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.per_job_elapsed.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.per_job_elapsed.is_empty()
    }

    /// Mean elapsed time per completed job.
    #[must_use]
    pub fn average(&self) -> Option<Duration> {
        if self.per_job_elapsed.is_empty() {
            return None;
        }
        let total: Duration = self.per_job_elapsed.iter().sum();
        let count = u32::try_from(self.per_job_elapsed.len()).ok()?;
        Some(total / count)
    }

    /// Estimated time for the remaining files at the current average.
    #[must_use]
    pub fn eta(&self, remaining: usize) -> Option<Duration> {
        let average = self.average()?;
        Some(average.mul_f64(remaining as f64))
    }
}

impl RunStats {
    pub fn add_outcome(&mut self, outcome: &JobOutcome, duration: Duration) {
        self.total_duration += duration;
        match outcome {
            JobOutcome::Completed(job) => {
                self.files_converted += 1;
                self.total_original_size += job.input_size;
                self.total_converted_size += job.final_size();
                match job.disposition {
                    OutputDisposition::Kept => {}
                    OutputDisposition::DiscardedNotSmaller => self.files_discarded += 1,
                    OutputDisposition::ReplacedOriginal => self.files_replaced += 1,
                }
            }
            JobOutcome::Skipped(reason) => match reason {
                SkipReason::NoVideoInfo | SkipReason::InvalidDimensions => self.files_skipped_no_info += 1,
                SkipReason::BelowThreshold { .. } => self.files_skipped_bitrate += 1,
                SkipReason::OutputExists { .. } => self.files_skipped_existing += 1,
                SkipReason::DryRun => self.files_skipped_dryrun += 1,
            },
            JobOutcome::Failed(_) => self.files_failed += 1,
            JobOutcome::Aborted => self.files_aborted += 1,
        }
    }

    #[must_use]
    pub const fn total_skipped(&self) -> usize {
        self.files_skipped_no_info + self.files_skipped_bitrate + self.files_skipped_existing + self.files_skipped_dryrun
    }

    #[must_use]
    #[allow(clippy::cast_possible_wrap)]
    pub const fn space_saved(&self) -> i64 {
        self.total_original_size as i64 - self.total_converted_size as i64
    }

    pub fn print_summary(&self) {
        println!("{}", "\n--- Conversion Summary ---".bold().magenta());
        println!("Files converted:        {}", self.files_converted);
        if self.files_discarded > 0 {
            println!("  - Not smaller:        {}", self.files_discarded);
        }
        if self.files_replaced > 0 {
            println!("  - Replaced original:  {}", self.files_replaced);
        }
        println!(
            "Files failed:           {}",
            if self.files_failed > 0 {
                self.files_failed.to_string().red()
            } else {
                "0".normal()
            }
        );
        if self.files_aborted > 0 {
            println!("Files aborted:          {}", self.files_aborted.to_string().yellow());
        }
        println!("Files skipped:          {}", self.total_skipped());
        if self.total_skipped() > 0 {
            println!("  - No video info:      {}", self.files_skipped_no_info);
            println!("  - Below bitrate:      {}", self.files_skipped_bitrate);
            println!("  - Output exists:      {}", self.files_skipped_existing);
            println!("  - Dry run:            {}", self.files_skipped_dryrun);
        }
        println!();

        if self.files_converted > 0 {
            println!("Total original size:    {}", crate::format_size(self.total_original_size));
            println!("Total converted size:   {}", crate::format_size(self.total_converted_size));

            if self.total_original_size > 0 {
                let saved = self.space_saved();
                let ratio = saved.unsigned_abs() as f64 / self.total_original_size as f64 * 100.0;

                if saved >= 0 {
                    println!(
                        "Space saved:            {} ({:.1}%)",
                        crate::format_size(saved.unsigned_abs()),
                        ratio
                    );
                } else {
                    println!(
                        "Space increased:        {} ({:.1}%)",
                        crate::format_size(saved.unsigned_abs()),
                        ratio
                    );
                }
            }
        }

        println!("Total time:             {}", crate::format_duration(self.total_duration));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::path::PathBuf;

    use crate::convert::batch::CompletedJob;
    use crate::convert::error::ConvertError;

    #[test]
    fn average_and_eta() {
        let mut stats = BatchStatistics::new();
        assert!(stats.average().is_none());
        assert!(stats.eta(3).is_none());

        stats.record(Duration::from_secs(10));
        stats.record(Duration::from_secs(20));
        assert_eq!(stats.len(), 2);
        assert_eq!(stats.average(), Some(Duration::from_secs(15)));
        assert_eq!(stats.eta(4), Some(Duration::from_secs(60)));
        assert_eq!(stats.eta(0), Some(Duration::ZERO));

        stats.reset();
        assert!(stats.is_empty());
    }

    #[test]
    fn run_stats_counts_outcomes() {
        let mut stats = RunStats::default();
        let completed = JobOutcome::Completed(CompletedJob {
            output: PathBuf::from("a_nw.mp4"),
            input_size: 1000,
            output_size: 400,
            disposition: OutputDisposition::Kept,
        });
        stats.add_outcome(&completed, Duration::from_secs(5));
        stats.add_outcome(&JobOutcome::Skipped(SkipReason::DryRun), Duration::ZERO);
        stats.add_outcome(&JobOutcome::Skipped(SkipReason::NoVideoInfo), Duration::ZERO);
        stats.add_outcome(
            &JobOutcome::Failed(ConvertError::EncodeFailure {
                code: Some(1),
                tail: Vec::new(),
            }),
            Duration::from_secs(1),
        );
        stats.add_outcome(&JobOutcome::Aborted, Duration::from_secs(2));

        assert_eq!(stats.files_converted, 1);
        assert_eq!(stats.total_skipped(), 2);
        assert_eq!(stats.files_failed, 1);
        assert_eq!(stats.files_aborted, 1);
        assert_eq!(stats.space_saved(), 600);
        assert_eq!(stats.total_duration, Duration::from_secs(8));
    }

    #[test]
    fn discarded_output_saves_nothing() {
        let mut stats = RunStats::default();
        let discarded = JobOutcome::Completed(CompletedJob {
            output: PathBuf::from("a_nw.mp4"),
            input_size: 1000,
            output_size: 1200,
            disposition: OutputDisposition::DiscardedNotSmaller,
        });
        stats.add_outcome(&discarded, Duration::from_secs(1));
        assert_eq!(stats.files_discarded, 1);
        assert_eq!(stats.space_saved(), 0);
    }
}
