use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Per-file failures of the conversion pipeline.
///
/// None of these terminate a batch on their own,
/// they are logged and folded into the outcome of the file that caused them.
#[derive(Debug, Error)]
pub enum ConvertError {
    /// The external tool is missing or could not be started.
    #[error("Failed to launch {tool}: {source}")]
    Launch {
        tool: String,
        #[source]
        source: io::Error,
    },

    /// The probe tool failed or produced unusable output.
    #[error("Probe failed for {}: {message}", .path.display())]
    Probe { path: PathBuf, message: String },

    /// Width or height is missing or not positive.
    #[error("Invalid video dimensions: {width:?}x{height:?}")]
    InvalidDimensions { width: Option<u32>, height: Option<u32> },

    /// The encoder exited with a failure status.
    #[error("ffmpeg exited with status {}{}", format_code(.code), format_tail(.tail))]
    EncodeFailure { code: Option<i32>, tail: Vec<String> },

    /// A post-processing step failed. The encode itself is still considered successful.
    #[error("{step} failed for {}: {source}", .path.display())]
    PostProcess {
        step: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The user stopped the batch.
    #[error("Conversion aborted by user")]
    AbortRequested,
}

impl ConvertError {
    pub(crate) fn post_process(step: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::PostProcess {
            step,
            path: path.into(),
            source,
        }
    }
}

fn format_code(code: &Option<i32>) -> String {
    code.map_or_else(|| "unknown".to_string(), |c| c.to_string())
}

fn format_tail(tail: &[String]) -> String {
    if tail.is_empty() {
        String::new()
    } else {
        format!(": {}", tail.join(" | "))
    }
}
