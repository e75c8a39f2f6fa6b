use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use console::style;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};

use crate::batch::{OperationOutcome, Outcome};
use crate::dispatcher::BatchObserver;

/// Controls how batch progress is rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Spinner with a done/total counter; per-VM lines printed above it.
    Interactive,
    /// One plain line per VM, no ANSI (piped/non-TTY).
    Plain,
    /// Like Plain, and also logs each VM as it is picked up.
    Verbose,
    /// Nothing until the final result.
    Quiet,
}

impl OutputMode {
    pub fn resolve(verbose: bool, quiet: bool, terminal: bool) -> Self {
        if quiet {
            OutputMode::Quiet
        } else if verbose {
            OutputMode::Verbose
        } else if terminal {
            OutputMode::Interactive
        } else {
            OutputMode::Plain
        }
    }
}

fn spinner_style() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template("{spinner:.cyan} {msg} [{pos}/{len}]")
        .unwrap()
}

/// Terminal observer for one running batch. The total is learned from
/// [`BatchObserver::on_selected`] once the selection is resolved.
pub struct BatchProgress {
    bar: ProgressBar,
    message: String,
    mode: OutputMode,
    total: AtomicUsize,
    done: AtomicUsize,
}

impl BatchProgress {
    pub fn new(message: &str, mode: OutputMode) -> Self {
        let bar = if mode == OutputMode::Interactive {
            let bar = ProgressBar::new(0);
            bar.set_style(spinner_style());
            bar.set_message(message.to_string());
            bar.enable_steady_tick(Duration::from_millis(80));
            bar
        } else {
            ProgressBar::with_draw_target(None, ProgressDrawTarget::hidden())
        };
        Self {
            bar,
            message: message.to_string(),
            mode,
            total: AtomicUsize::new(0),
            done: AtomicUsize::new(0),
        }
    }

    /// Remove the spinner. Lines already printed stay.
    pub fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl BatchObserver for BatchProgress {
    fn on_selected(&self, total: usize) {
        self.total.store(total, Ordering::SeqCst);
        self.bar.set_length(total as u64);
        if self.mode == OutputMode::Verbose {
            println!("{} ({total})", self.message);
        }
    }

    fn on_start(&self, vm: &str) {
        if self.mode == OutputMode::Verbose {
            println!("  \u{2192} {vm}");
        }
    }

    fn on_outcome(&self, outcome: &OperationOutcome) {
        let done = self.done.fetch_add(1, Ordering::SeqCst) + 1;
        self.bar.inc(1);
        match self.mode {
            OutputMode::Quiet => {}
            OutputMode::Interactive => self.bar.println(styled_line(outcome)),
            OutputMode::Plain | OutputMode::Verbose => {
                let total = self.total.load(Ordering::SeqCst);
                println!("[{done}/{total}] {}", plain_line(outcome))
            }
        }
    }
}

fn marker(outcome: &Outcome) -> &'static str {
    match outcome {
        Outcome::Succeeded(_) => "\u{2713}",
        Outcome::Failed(_) => "\u{2717}",
        Outcome::Skipped(_) => "-",
    }
}

/// `✓ web1: started`
pub fn plain_line(outcome: &OperationOutcome) -> String {
    format!(
        "{} {}: {}",
        marker(&outcome.outcome),
        outcome.vm,
        outcome.outcome.detail()
    )
}

fn styled_line(outcome: &OperationOutcome) -> String {
    let marker = style(marker(&outcome.outcome));
    let marker = match outcome.outcome {
        Outcome::Succeeded(_) => marker.green(),
        Outcome::Failed(_) => marker.red(),
        Outcome::Skipped(_) => marker.yellow(),
    };
    format!(
        "{marker} {}: {}",
        style(&outcome.vm).bold(),
        outcome.outcome.detail()
    )
}
