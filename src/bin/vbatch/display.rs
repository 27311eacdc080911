//! Terminal presentation of batch events.

use std::time::Duration;

use crossbeam_channel::Receiver;
use indicatif::{ProgressBar, ProgressStyle};

use vbatch_tools::convert::BatchEvent;

const PROGRESS_BAR_CHARS: &str = "=>-";
const PROGRESS_BAR_TEMPLATE: &str = "[{elapsed_precise}] {bar:40.magenta/blue} {pos}/{len} {msg}";

/// Render events until the worker closes the channel.
pub fn show_events(receiver: &Receiver<BatchEvent>) {
    let bar = ProgressBar::new(0);
    if let Ok(style) = ProgressStyle::default_bar().template(PROGRESS_BAR_TEMPLATE) {
        bar.set_style(style.progress_chars(PROGRESS_BAR_CHARS));
    }
    bar.enable_steady_tick(Duration::from_millis(250));

    let mut current_name = String::new();
    let mut batch_eta: Option<Duration> = None;

    for event in receiver {
        match event {
            BatchEvent::Started { total } => bar.set_length(total as u64),
            BatchEvent::JobStarted { index, input, .. } => {
                bar.set_position(index.saturating_sub(1) as u64);
                current_name = vbatch_tools::path_to_filename_string(&input);
                bar.set_message(current_name.clone());
            }
            BatchEvent::Progress { percent, eta, .. } => {
                bar.set_message(progress_message(&current_name, percent, eta, batch_eta));
            }
            BatchEvent::JobFinished { index, .. } => bar.set_position(index as u64),
            BatchEvent::BatchEta { average, eta } => {
                batch_eta = Some(eta);
                bar.println(format!(
                    "Average {} per file, {} remaining",
                    vbatch_tools::format_duration(average),
                    vbatch_tools::format_duration(eta)
                ));
            }
            BatchEvent::Log(line) => bar.println(line.colored().to_string()),
            BatchEvent::Finished { .. } => bar.finish_and_clear(),
        }
    }

    if !bar.is_finished() {
        bar.finish_and_clear();
    }
}

fn progress_message(name: &str, percent: Option<f64>, eta: Option<Duration>, batch_eta: Option<Duration>) -> String {
    let mut message = name.to_string();
    // Unknown duration has no meaningful percentage
    if let Some(percent) = percent {
        message.push_str(&format!(" {percent:.1}%"));
    }
    if let Some(eta) = eta {
        message.push_str(&format!(" ETA {}", vbatch_tools::format_duration(eta)));
    }
    if let Some(batch_eta) = batch_eta {
        message.push_str(&format!(" | batch {}", vbatch_tools::format_duration(batch_eta)));
    }
    message
}
