use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::fmt;
use std::io::IsTerminal;

/// Stages reported during a marginal-utility sweep.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum UtilityProgressStage {
    Baseline,
    BudgetSweep,
}

impl UtilityProgressStage {
    pub fn describe(self) -> &'static str {
        match self {
            Self::Baseline => "baseline loss",
            Self::BudgetSweep => "design utility sweep",
        }
    }
}

impl fmt::Display for UtilityProgressStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// Observer for reporting incremental progress while evaluating designs.
pub trait UtilityProgressObserver {
    fn on_stage_start(&mut self, stage: UtilityProgressStage, total_evaluations: usize) {
        let _ = (stage, total_evaluations);
    }
    fn on_stage_advance(&mut self, stage: UtilityProgressStage, completed_evaluations: usize) {
        let _ = (stage, completed_evaluations);
    }
    fn on_stage_finish(&mut self, stage: UtilityProgressStage) {
        let _ = stage;
    }
}

#[derive(Default)]
pub struct NoopUtilityProgress;

impl UtilityProgressObserver for NoopUtilityProgress {}

fn create_progress_bar(len: u64, message: &str) -> ProgressBar {
    let draw_target = if std::io::stderr().is_terminal() {
        ProgressDrawTarget::stderr_with_hz(20)
    } else {
        ProgressDrawTarget::hidden()
    };

    let pb = ProgressBar::with_draw_target(Some(len), draw_target);
    let style = ProgressStyle::with_template(
        "\n> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
    )
    .map(|style| style.progress_chars("█▉▊▋▌▍▎▏  "))
    .unwrap_or_else(|_| ProgressStyle::default_bar());
    pb.set_style(style);
    pb.set_message(message.to_string());

    pb
}

/// Terminal progress bar for long sweeps. Draws nothing when stderr is not a
/// terminal.
#[derive(Default)]
pub struct ProgressBarObserver {
    bar: Option<ProgressBar>,
}

impl ProgressBarObserver {
    pub fn new() -> Self {
        Self::default()
    }
}

impl UtilityProgressObserver for ProgressBarObserver {
    fn on_stage_start(&mut self, stage: UtilityProgressStage, total_evaluations: usize) {
        if let Some(previous) = self.bar.take() {
            previous.finish_and_clear();
        }
        self.bar = Some(create_progress_bar(
            total_evaluations as u64,
            stage.describe(),
        ));
    }

    fn on_stage_advance(&mut self, _stage: UtilityProgressStage, completed_evaluations: usize) {
        if let Some(bar) = &self.bar {
            bar.set_position(completed_evaluations as u64);
        }
    }

    fn on_stage_finish(&mut self, stage: UtilityProgressStage) {
        if let Some(bar) = self.bar.take() {
            bar.finish_with_message(format!("{stage} complete"));
        }
    }
}
