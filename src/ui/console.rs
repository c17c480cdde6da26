use std::collections::HashMap;

use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};

use crate::engine::PresentationAdapter;
use crate::engine::state::{TaskId, UploadStatus};
use crate::engine::task::UploadTask;
use crate::util::format_speed;

const BAR_TEMPLATE: &str = "{prefix:.bold} [{bar:30.cyan/blue}] {bytes}/{total_bytes} {msg}";

/// Renders every task as one progress bar on stderr.
pub struct ConsoleAdapter {
    multi: MultiProgress,
    style: ProgressStyle,
    bars: HashMap<TaskId, ProgressBar>,
}

impl ConsoleAdapter {
    pub fn new() -> Self {
        Self::with_target(ProgressDrawTarget::stderr())
    }

    pub fn with_target(target: ProgressDrawTarget) -> Self {
        let style = ProgressStyle::with_template(BAR_TEMPLATE)
            .map(|style| style.progress_chars("=> "))
            .unwrap_or_else(|_| ProgressStyle::default_bar());
        Self {
            multi: MultiProgress::with_draw_target(target),
            style,
            bars: HashMap::new(),
        }
    }

    /// Print a line above the bars without tearing them.
    pub fn println(&self, line: &str) {
        if self.multi.println(line).is_err() {
            eprintln!("{line}");
        }
    }

    fn fresh_bar(&mut self, task: &UploadTask) -> &ProgressBar {
        let bar = self.multi.add(ProgressBar::new(task.bytes_total().unwrap_or(0)));
        bar.set_style(self.style.clone());
        bar.set_prefix(task.file_name().to_owned());
        if let Some(old) = self.bars.insert(task.id(), bar) {
            self.multi.remove(&old);
        }
        &self.bars[&task.id()]
    }

    #[cfg(test)]
    fn bar(&self, id: TaskId) -> Option<&ProgressBar> {
        self.bars.get(&id)
    }
}

impl PresentationAdapter for ConsoleAdapter {
    fn on_state_change(&mut self, task: &UploadTask) {
        match task.status() {
            UploadStatus::Pending => {
                self.fresh_bar(task).set_message("pending");
            }
            UploadStatus::Uploading => {
                let reuse = self
                    .bars
                    .get(&task.id())
                    .is_some_and(|bar| !bar.is_finished());
                let bar = if reuse {
                    &self.bars[&task.id()]
                } else {
                    self.fresh_bar(task)
                };
                bar.set_position(0);
                bar.set_message(format!("uploading (attempt {})", task.attempt()));
            }
            UploadStatus::Succeeded { resource_id } => {
                if let Some(bar) = self.bars.get(&task.id()) {
                    bar.set_position(task.bytes_loaded());
                    bar.finish_with_message(format!("stored as {resource_id}"));
                }
            }
            UploadStatus::Failed(reason) => {
                if let Some(bar) = self.bars.get(&task.id()) {
                    bar.abandon_with_message(format!("failed: {reason}"));
                }
            }
            UploadStatus::Cancelled => {
                if let Some(bar) = self.bars.get(&task.id()) {
                    bar.abandon_with_message("cancelled");
                }
            }
        }
    }

    fn on_progress(&mut self, task: &UploadTask, rate: Option<f64>) {
        let Some(bar) = self.bars.get(&task.id()) else {
            return;
        };
        if let Some(total) = task.bytes_total() {
            bar.set_length(total);
        }
        bar.set_position(task.bytes_loaded());
        if let Some(rate) = rate {
            bar.set_message(format_speed(rate));
        }
    }
}
