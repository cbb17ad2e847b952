//! Progress bar construction.
//!
//! All bars hang off one [`MultiProgress`] so concurrent artifacts render on
//! separate lines. When progress is disabled every bar is hidden and the
//! pipeline code does not need to care.

use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::time::Duration;

const SPINNER_CHARS: &str = "⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏";
const TICK_INTERVAL: Duration = Duration::from_millis(100);

/// Factory for the bars shown while fetching and extracting.
#[derive(Clone)]
pub struct Progress {
    multi: Option<MultiProgress>,
}

impl Progress {
    pub fn new(enabled: bool) -> Self {
        if enabled {
            Self {
                multi: Some(MultiProgress::with_draw_target(ProgressDrawTarget::stderr())),
            }
        } else {
            Self::hidden()
        }
    }

    pub fn hidden() -> Self {
        Self { multi: None }
    }

    fn attach(&self, pb: ProgressBar) -> ProgressBar {
        match &self.multi {
            Some(multi) => multi.add(pb),
            None => {
                pb.set_draw_target(ProgressDrawTarget::hidden());
                pb
            }
        }
    }

    /// Indeterminate spinner, used when the total size is unknown.
    pub fn spinner(&self, message: impl Into<String>) -> ProgressBar {
        let pb = self.attach(ProgressBar::new_spinner());
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.cyan} {msg} {bytes} | {elapsed_precise} elapsed")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_chars(SPINNER_CHARS),
        );
        pb.set_message(message.into());
        if self.multi.is_some() {
            pb.enable_steady_tick(TICK_INTERVAL);
        }
        pb
    }

    /// Counter spinner for archive extraction.
    pub fn entries(&self, message: impl Into<String>) -> ProgressBar {
        let pb = self.attach(ProgressBar::new_spinner());
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.cyan} {msg} {pos} entries | {elapsed_precise} elapsed")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_chars(SPINNER_CHARS),
        );
        pb.set_message(message.into());
        if self.multi.is_some() {
            pb.enable_steady_tick(TICK_INTERVAL);
        }
        pb
    }
}

/// Switches a spinner to a byte bar once the total size is known.
pub fn upgrade_to_bytes(pb: &ProgressBar, total_bytes: u64) {
    pb.set_length(total_bytes);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.cyan} [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg} | ETA {eta_precise}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▓▒░ "),
    );
}
