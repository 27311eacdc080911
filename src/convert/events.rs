use std::path::PathBuf;
use std::time::Duration;

use crate::convert::logger::LogLine;

/// Status updates sent from the batch worker to the presentation layer.
#[derive(Debug)]
pub enum BatchEvent {
    /// Enumeration finished.
    Started { total: usize },
    /// A file was picked up.
    JobStarted { index: usize, total: usize, input: PathBuf },
    /// Encoding progress of the current file.
    Progress {
        index: usize,
        total: usize,
        /// `None` when the source duration is unknown.
        percent: Option<f64>,
        eta: Option<Duration>,
    },
    /// A file reached its final outcome.
    JobFinished {
        index: usize,
        total: usize,
        /// Short label of the outcome, like `completed` or `skipped (dry run)`.
        status: String,
    },
    /// Running average and remaining time after a completed file.
    BatchEta { average: Duration, eta: Duration },
    Log(LogLine),
    Finished { interrupted: bool },
}
