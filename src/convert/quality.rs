use crate::convert::config::Resolution;

/// Bounds and reference resolution for the resolution-adaptive quality value.
///
/// The value is a CRF or CQ level where lower means better quality and a bigger file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QualityRange {
    pub min: u32,
    pub max: u32,
    pub reference: Resolution,
}

impl QualityRange {
    #[must_use]
    pub const fn new(min: u32, max: u32, reference: Resolution) -> Self {
        Self { min, max, reference }
    }
}

/// Pick a quality value for a video of the given size.
///
/// Sources at the reference resolution get `min`.
/// Larger sources move towards `max` in proportion to how much their area exceeds the reference,
/// reaching it at twice the reference area.
/// Smaller sources are pushed towards `min` but never below it.
///
/// Returns `None` for a zero width or height.
///
/// ```rust
/// use vbatch_tools::convert::{QualityRange, Resolution, dynamic_quality};
///
/// let range = QualityRange::new(18, 28, Resolution::new(1280, 720));
/// assert_eq!(dynamic_quality(1280, 720, &range), Some(18));
/// assert_eq!(dynamic_quality(1920, 1080, &range), Some(28));
/// assert_eq!(dynamic_quality(0, 720, &range), None);
/// ```
#[must_use]
pub fn dynamic_quality(width: u32, height: u32, range: &QualityRange) -> Option<u32> {
    if width == 0 || height == 0 {
        return None;
    }
    let reference_area = range.reference.area();
    if reference_area == 0 {
        return None;
    }

    let video_area = f64::from(width) * f64::from(height);
    let reference_area = reference_area as f64;
    let min = f64::from(range.min);
    let max = f64::from(range.max);

    let quality = if video_area >= reference_area {
        let excess = video_area / reference_area - 1.0;
        min + excess * (max - min)
    } else {
        let scale = (reference_area / video_area).sqrt();
        min / scale
    };

    Some(quality.clamp(min, max).trunc() as u32)
}
