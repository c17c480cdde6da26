use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use clap::Parser;
use env_logger::Env;
use log::{error, info, warn};

mod config;
mod credentials;
mod engine;
mod env;
mod networking;
mod storage;
mod ui;
mod util;

use crate::config::UploaderConfig;
use crate::credentials::{CredentialSource, StaticToken};
use crate::engine::models::SelectedFile;
use crate::engine::state::UploadStatus;
use crate::engine::task::UploadTask;
use crate::engine::{UploadOptions, UploadRegistry};
use crate::networking::HttpTransport;
use crate::storage::StorageManager;
use crate::ui::console::ConsoleAdapter;

const POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Parser, Debug)]
#[command(
    name = "simplefiles-uploader",
    author,
    version,
    about = "Upload files to a simplefiles server with live progress, cancel and retry"
)]
struct Cli {
    /// Files to upload from the terminal. Without files the window opens.
    files: Vec<PathBuf>,

    /// Server base URL, e.g. http://localhost:8080.
    #[arg(long)]
    server: Option<String>,

    /// Bearer token to use instead of the stored token file.
    #[arg(long)]
    token: Option<String>,

    /// Store a bearer token for later sessions and exit.
    #[arg(long, value_name = "TOKEN")]
    save_token: Option<String>,

    /// Hide the transfer rate.
    #[arg(long)]
    no_throughput: bool,

    /// Disable cancellation of running uploads.
    #[arg(long)]
    no_cancel: bool,

    /// Retry each failed upload up to this many times (terminal mode).
    #[arg(long, default_value_t = 0)]
    retries: u32,

    /// Persist --server, --no-throughput and --no-cancel to the config file.
    #[arg(long)]
    save_config: bool,

    /// Print uploader version and exit without starting the UI.
    #[arg(long)]
    version_only: bool,
}

impl Cli {
    fn apply_to(&self, config: &mut UploaderConfig) {
        if let Some(server) = &self.server {
            config.server_url = server.clone();
        }
        if self.no_throughput {
            config.show_throughput = false;
        }
        if self.no_cancel {
            config.allow_cancel = false;
        }
    }

    fn credentials(&self, storage: &StorageManager) -> Box<dyn CredentialSource> {
        match &self.token {
            Some(token) => Box::new(StaticToken(token.clone())),
            None => Box::new(storage.token_source()),
        }
    }
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    if cli.version_only {
        println!("simplefiles-uploader {}", env!("CARGO_PKG_VERSION"));
        return ExitCode::SUCCESS;
    }

    let storage = StorageManager::new();
    if let Some(token) = &cli.save_token {
        return match storage.write_token(token) {
            Ok(()) => {
                info!("token saved to {}", storage.token_path().display());
                ExitCode::SUCCESS
            }
            Err(err) => {
                error!("{err}");
                ExitCode::FAILURE
            }
        };
    }

    let mut config = storage.load_config();
    cli.apply_to(&mut config);
    if cli.save_config {
        match storage.save_config(&config) {
            Ok(()) => info!("settings saved to {}", storage.base_dir().display()),
            Err(err) => warn!("{err}"),
        }
    }
    let credentials = cli.credentials(&storage);

    if cli.files.is_empty() {
        return run_window(config, storage, credentials);
    }
    run_terminal(&cli, config, storage, credentials)
}

fn run_window(
    config: UploaderConfig,
    storage: StorageManager,
    credentials: Box<dyn CredentialSource>,
) -> ExitCode {
    info!(
        "opening uploader window for {} (data in {})",
        config.server_url,
        storage.base_dir().display()
    );
    let options = eframe::NativeOptions {
        viewport: eframe::egui::ViewportBuilder::default()
            .with_icon(default_icon())
            .with_inner_size(eframe::egui::vec2(720.0, 520.0)),
        ..Default::default()
    };
    let result = eframe::run_native(
        "simplefiles uploader",
        options,
        Box::new(move |cc| {
            Ok(Box::new(ui::UploaderApp::new(
                cc,
                config,
                storage,
                credentials,
            )))
        }),
    );
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("window failed: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run_terminal(
    cli: &Cli,
    config: UploaderConfig,
    storage: StorageManager,
    credentials: Box<dyn CredentialSource>,
) -> ExitCode {
    let runtime = ui::build_runtime();
    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = interrupted.clone();
    runtime.spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            flag.store(true, Ordering::SeqCst);
        }
    });

    let mut options = UploadOptions::new(config.store_endpoint());
    options.show_throughput = config.show_throughput;
    options.allow_cancel = config.allow_cancel;
    let sink_config = config.clone();
    options.on_success = Some(Box::new(move |task: &UploadTask| {
        let Some(resource_id) = task.result() else {
            return;
        };
        println!("{resource_id}\t{}", task.file_name());
        let record = engine::models::UploadRecord {
            file_name: task.file_name().to_owned(),
            resource_id: resource_id.to_owned(),
            page_url: sink_config.file_page_url(resource_id),
            uploaded_at: chrono::Utc::now().to_rfc3339(),
        };
        if let Err(err) = storage.append_history(record) {
            warn!("failed to save upload history: {err}");
        }
    }));

    let mut registry = UploadRegistry::new(
        options,
        Box::new(HttpTransport::new(runtime.handle().clone())),
        credentials,
        ConsoleAdapter::new(),
    );
    for path in &cli.files {
        registry.create_from_selection(SelectedFile::from_path(path));
    }

    let retries = cli.retries;
    runtime.block_on(async {
        let mut cancelled = false;
        loop {
            if !cancelled && interrupted.load(Ordering::SeqCst) {
                warn!("interrupted; cancelling running uploads");
                if !registry.options().allow_cancel {
                    registry.adapter().println("cancellation is disabled; exiting");
                    break;
                }
                registry.cancel_all();
                cancelled = true;
            }

            // Failed tasks get another attempt while the budget lasts.
            let to_retry: Vec<_> = registry
                .tasks()
                .iter()
                .filter(|task| task.can_retry() && task.attempt() <= retries && !cancelled)
                .map(|task| task.id())
                .collect();
            for id in to_retry {
                registry.handle_intent(engine::state::UserIntent::Retry(id));
            }

            if registry.all_settled() {
                break;
            }
            if let Ok(Some(message)) =
                tokio::time::timeout(POLL_INTERVAL, registry.next_message()).await
            {
                registry.dispatch(message);
            }
        }
    });

    let mut succeeded = true;
    for task in registry.tasks() {
        if matches!(task.status(), UploadStatus::Succeeded { .. }) {
            continue;
        }
        succeeded = false;
        match (task.error_kind(), task.failure_reason()) {
            (Some(kind), Some(reason)) => warn!(
                "{} not stored after {} attempt(s): {kind:?} ({reason})",
                task.file_name(),
                task.attempt()
            ),
            (Some(kind), None) => warn!("{} not stored: {kind:?}", task.file_name()),
            _ => warn!("{} still {}", task.file_name(), task.status()),
        }
    }
    if succeeded {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn default_icon() -> eframe::egui::IconData {
    // Simple 2x2 icon: dark background with a cyan accent.
    let rgba: Vec<u8> = vec![
        20, 24, 32, 255, 30, 196, 220, 255, //
        20, 24, 32, 255, 20, 150, 180, 255,
    ];
    eframe::egui::IconData {
        rgba,
        width: 2,
        height: 2,
    }
}
