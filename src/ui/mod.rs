use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use eframe::egui::{self, Align, Color32, Layout, RichText};
use log::{error, warn};
use tokio::runtime::{Builder, Runtime};

use crate::config::UploaderConfig;
use crate::credentials::CredentialSource;
use crate::engine::models::{SelectedFile, UploadRecord};
use crate::engine::state::{TaskId, UploadStatus, UserIntent};
use crate::engine::task::UploadTask;
use crate::engine::{PresentationAdapter, UploadOptions, UploadRegistry};
use crate::networking::HttpTransport;
use crate::storage::StorageManager;
use crate::util::{format_speed, progress_fraction};

pub mod console;

const EXPLANATION: &str =
    "Pick one or more files to upload. Each file is sent on its own and can be cancelled or retried.";
const REPAINT_INTERVAL: Duration = Duration::from_millis(100);
const HISTORY_SHOWN: usize = 20;
const DANGER: Color32 = Color32::from_rgb(239, 117, 117);
const ACCENT: Color32 = Color32::from_rgb(92, 219, 195);

pub fn build_runtime() -> Arc<Runtime> {
    match Runtime::new() {
        Ok(rt) => Arc::new(rt),
        Err(err) => {
            warn!(
                "ui: failed to create multithreaded runtime ({}); trying single-threaded runtime",
                err
            );
            match Builder::new_current_thread().enable_all().build() {
                Ok(rt) => Arc::new(rt),
                Err(fallback_err) => {
                    error!(
                        "ui: failed to create any Tokio runtime ({}); terminating uploader",
                        fallback_err
                    );
                    std::process::exit(1);
                }
            }
        }
    }
}

/// Keeps the latest rate text per task and wakes the window on changes.
#[derive(Default)]
pub struct WindowAdapter {
    speeds: HashMap<TaskId, String>,
    ctx: Option<egui::Context>,
}

impl WindowAdapter {
    fn speed(&self, id: TaskId) -> Option<&str> {
        self.speeds.get(&id).map(String::as_str)
    }

    fn repaint(&self) {
        if let Some(ctx) = &self.ctx {
            ctx.request_repaint();
        }
    }
}

impl PresentationAdapter for WindowAdapter {
    fn on_state_change(&mut self, task: &UploadTask) {
        if task.status() != &UploadStatus::Uploading {
            self.speeds.remove(&task.id());
        }
        self.repaint();
    }

    fn on_progress(&mut self, task: &UploadTask, rate: Option<f64>) {
        if let Some(rate) = rate {
            self.speeds.insert(task.id(), format_speed(rate));
        }
        self.repaint();
    }
}

pub struct UploaderApp {
    // Transfers run on this runtime; it must outlive the registry.
    _runtime: Arc<Runtime>,
    registry: UploadRegistry<WindowAdapter>,
    config: UploaderConfig,
    history: Rc<RefCell<Vec<UploadRecord>>>,
}

impl UploaderApp {
    pub fn new(
        cc: &eframe::CreationContext<'_>,
        config: UploaderConfig,
        storage: StorageManager,
        credentials: Box<dyn CredentialSource>,
    ) -> Self {
        let runtime = build_runtime();
        let history = Rc::new(RefCell::new(storage.read_history()));

        let mut options = UploadOptions::new(config.store_endpoint());
        options.show_throughput = config.show_throughput;
        options.allow_cancel = config.allow_cancel;
        let sink_history = history.clone();
        let sink_config = config.clone();
        options.on_success = Some(Box::new(move |task: &UploadTask| {
            let Some(resource_id) = task.result() else {
                return;
            };
            let record = UploadRecord {
                file_name: task.file_name().to_owned(),
                resource_id: resource_id.to_owned(),
                page_url: sink_config.file_page_url(resource_id),
                uploaded_at: Utc::now().to_rfc3339(),
            };
            match storage.append_history(record) {
                Ok(updated) => *sink_history.borrow_mut() = updated,
                Err(err) => warn!("ui: failed to save upload history: {err}"),
            }
        }));

        let adapter = WindowAdapter {
            speeds: HashMap::new(),
            ctx: Some(cc.egui_ctx.clone()),
        };
        let registry = UploadRegistry::new(
            options,
            Box::new(HttpTransport::new(runtime.handle().clone())),
            credentials,
            adapter,
        );

        Self {
            _runtime: runtime,
            registry,
            config,
            history,
        }
    }

    fn render_task(&self, ui: &mut egui::Ui, task: &UploadTask, intents: &mut Vec<UserIntent>) {
        ui.group(|ui| {
            ui.set_width(ui.available_width());
            ui.horizontal(|ui| {
                match task.result() {
                    Some(resource_id) => {
                        if ui.link(RichText::new(task.file_name()).strong()).clicked() {
                            self.open_page(resource_id);
                        }
                    }
                    None => {
                        ui.label(RichText::new(task.file_name()).strong());
                    }
                }
                ui.with_layout(Layout::right_to_left(Align::Center), |ui| {
                    match task.status() {
                        UploadStatus::Uploading if self.registry.options().allow_cancel => {
                            if ui.button("Cancel").clicked() {
                                intents.push(UserIntent::Cancel(task.id()));
                            }
                        }
                        UploadStatus::Failed(_) => {
                            if ui.button("Retry").clicked() {
                                intents.push(UserIntent::Retry(task.id()));
                            }
                        }
                        UploadStatus::Succeeded { resource_id } => {
                            if ui.button("Copy link").clicked() {
                                ui.ctx().copy_text(self.config.file_page_url(resource_id));
                            }
                        }
                        _ => {}
                    }
                });
            });

            match task.status() {
                UploadStatus::Pending => {
                    ui.label(RichText::new("Waiting").weak());
                }
                UploadStatus::Uploading => {
                    let bar = match progress_fraction(task.bytes_loaded(), task.bytes_total()) {
                        Some(fraction) => egui::ProgressBar::new(fraction).show_percentage(),
                        None => egui::ProgressBar::new(0.0).animate(true),
                    };
                    ui.add(bar.fill(ACCENT));
                    if self.registry.options().show_throughput
                        && let Some(speed) = self.registry.adapter().speed(task.id())
                    {
                        ui.monospace(speed);
                    }
                }
                UploadStatus::Succeeded { resource_id } => {
                    ui.label(format!("Stored as {resource_id}"));
                }
                UploadStatus::Failed(reason) => {
                    ui.colored_label(DANGER, format!("Upload failed: {reason}"));
                }
                UploadStatus::Cancelled => {
                    ui.label(RichText::new("Cancelled").weak());
                }
            }
        });
    }

    fn render_history(&self, ui: &mut egui::Ui) {
        let history = self.history.borrow();
        if history.is_empty() {
            return;
        }
        egui::CollapsingHeader::new(format!("Recent uploads ({})", history.len()))
            .default_open(false)
            .show(ui, |ui| {
                for record in history.iter().take(HISTORY_SHOWN) {
                    ui.horizontal(|ui| {
                        if ui.link(record.file_name.as_str()).clicked()
                            && let Err(err) = open::that(&record.page_url)
                        {
                            warn!("ui: failed to open {}: {err}", record.page_url);
                        }
                        ui.label(RichText::new(record.uploaded_at.as_str()).weak().small());
                    });
                }
            });
    }

    fn open_page(&self, resource_id: &str) {
        let url = self.config.file_page_url(resource_id);
        if let Err(err) = open::that(&url) {
            warn!("ui: failed to open {url}: {err}");
        }
    }
}

impl eframe::App for UploaderApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        self.registry.pump();

        let mut picked: Option<Vec<std::path::PathBuf>> = None;
        egui::TopBottomPanel::top("top_bar").show(ctx, |ui| {
            ui.horizontal(|ui| {
                ui.heading(RichText::new("simplefiles").color(ACCENT));
                ui.label(RichText::new(self.config.server_url.as_str()).weak());
                ui.with_layout(Layout::right_to_left(Align::Center), |ui| {
                    if ui.button("Upload files…").clicked() {
                        picked = rfd::FileDialog::new()
                            .set_title("Choose files to upload")
                            .pick_files();
                    }
                });
            });
        });

        let mut intents = Vec::new();
        egui::CentralPanel::default().show(ctx, |ui| {
            egui::ScrollArea::vertical().show(ui, |ui| {
                if self.registry.tasks().is_empty() {
                    ui.label(EXPLANATION);
                }
                for task in self.registry.tasks() {
                    self.render_task(ui, task, &mut intents);
                }
                ui.add_space(12.0);
                self.render_history(ui);
            });
        });

        for path in picked.into_iter().flatten() {
            self.registry
                .create_from_selection(SelectedFile::from_path(&path));
        }
        for intent in intents {
            self.registry.handle_intent(intent);
        }
        if !self.registry.all_settled() {
            ctx.request_repaint_after(REPAINT_INTERVAL);
        }
    }
}
