//! Block progress display
//!
//! A passive observer: workers bump it, nothing reads it back.

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::time::Duration;

pub struct TransferProgress {
    bar: ProgressBar,
}

impl TransferProgress {
    pub fn new(visible: bool) -> Self {
        let bar = ProgressBar::new(0);
        if !visible {
            bar.set_draw_target(ProgressDrawTarget::hidden());
        }
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} {msg} [{bar:30.cyan/blue}] {pos}/{len} blocks ({elapsed})")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=> "),
        );
        Self { bar }
    }

    pub fn hidden() -> Self {
        Self::new(false)
    }

    /// Reset for a round that has `pending` blocks to send.
    pub fn begin_round(&self, round: u32, max_rounds: u32, pending: usize) {
        self.bar.set_length(pending as u64);
        self.bar.set_position(0);
        self.bar
            .set_message(format!("round {}/{}", round + 1, max_rounds));
        self.bar.enable_steady_tick(Duration::from_millis(120));
    }

    pub fn block_done(&self) {
        self.bar.inc(1);
    }

    /// Print a line above the bar without tearing it.
    pub fn println(&self, msg: &str) {
        self.bar.suspend(|| eprintln!("{msg}"));
    }

    pub fn finish(&self, msg: &str) {
        self.bar.finish_with_message(msg.to_string());
    }

    pub fn abandon(&self, msg: &str) {
        self.bar.abandon_with_message(msg.to_string());
    }
}
