mod checklist;
mod docs;
mod generator;
mod hub;
mod repostatus;
mod supervisor;
mod tailer;
mod watch;
mod web;

use std::{
    fs::OpenOptions,
    io::{self, Write},
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};

use clap::Parser;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};

use crate::checklist::ChecklistFile;
use crate::docs::DocumentStore;
use crate::generator::{DocumentGenerator, GeneratorConfig};
use crate::hub::{Hub, HubHandle};
use crate::repostatus::RepoStatusPoller;
use crate::supervisor::{Supervisor, SupervisorConfig};
use crate::tailer::LogTailer;
use crate::web::AppState;

#[derive(Parser, Debug)]
#[command(name = "loopdeck-server")]
struct Args {
    #[arg(long, default_value = "")]
    addr: String,
    #[arg(long, default_value = "")]
    project_root: String,
    #[arg(long, default_value = "")]
    loop_log: String,
    #[arg(long, default_value = "")]
    checklist: String,
    #[arg(long, default_value = "")]
    log_dir: String,
    #[arg(long, default_value_t = 5)]
    grace_seconds: u64,
    #[arg(long, default_value_t = 5)]
    poll_seconds: u64,
    #[arg(long, default_value_t = 300)]
    debounce_ms: u64,
    #[arg(long, default_value = "")]
    generator_cmd: String,
    /// The loop command itself, e.g. `-- my-loop --verbose`.
    #[arg(last = true)]
    loop_cmd: Vec<String>,
}

#[derive(Clone, Debug)]
struct Config {
    addr: String,
    project_root: PathBuf,
    loop_log: PathBuf,
    checklist: PathBuf,
    log_dir: String,
    grace_period: Duration,
    poll_interval: Duration,
    debounce: Duration,
    loop_command: Vec<String>,
    generator_command: Vec<String>,
}

#[tokio::main]
async fn main() {
    let config = load_config(Args::parse());
    let _log_guard = init_logging(&config);

    let addr: SocketAddr = match config.addr.parse() {
        Ok(value) => value,
        Err(err) => {
            error!(event = "invalid_addr", error = %err, addr = %config.addr);
            return;
        }
    };
    if !addr.ip().is_loopback() {
        error!(event = "invalid_addr", addr = %config.addr);
        return;
    }

    let (hub_tx, hub_rx) = mpsc::unbounded_channel();
    let handle = HubHandle::new(hub_tx);

    let documents = Arc::new(DocumentStore::new(config.project_root.clone()));
    let checklist_file = Arc::new(ChecklistFile::new(config.checklist.clone()));
    let supervisor = Arc::new(Supervisor::new(
        SupervisorConfig {
            loop_command: config.loop_command.clone(),
            project_root: config.project_root.clone(),
            grace_period: config.grace_period,
        },
        handle.clone(),
    ));
    let generator = Arc::new(DocumentGenerator::new(
        GeneratorConfig {
            command: config.generator_command.clone(),
            project_root: config.project_root.clone(),
        },
        documents.clone(),
        handle.clone(),
    ));

    let hub = Hub::new(
        hub_rx,
        supervisor.clone(),
        documents.clone(),
        checklist_file.clone(),
    );
    tokio::spawn(hub.run());
    tokio::spawn(tailer::run(
        LogTailer::new(config.loop_log.clone(), handle.clone()),
        config.debounce,
    ));
    tokio::spawn(checklist::run(
        checklist_file.clone(),
        handle.clone(),
        config.debounce,
    ));
    tokio::spawn(
        RepoStatusPoller::new(
            config.project_root.clone(),
            config.poll_interval,
            handle.clone(),
        )
        .run(),
    );

    let app = web::build_router(AppState {
        hub: handle,
        supervisor,
        documents,
        generator,
    });

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(value) => value,
        Err(err) => {
            error!(event = "bind_error", error = %err, addr = %config.addr);
            return;
        }
    };

    info!(event = "server_start", addr = %config.addr, project_root = %config.project_root.display());

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    if let Err(err) = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    {
        error!(event = "server_error", error = %err);
    }
}

fn load_config(args: Args) -> Config {
    let addr = resolve_value(&args.addr, "LOOPDECK_ADDR", "127.0.0.1:7717");
    let project_root = resolve_project_root(&args.project_root);
    let loop_log = resolve_file(&args.loop_log, "LOOPDECK_LOOP_LOG", &project_root, "loop.log");
    let checklist = resolve_file(&args.checklist, "LOOPDECK_CHECKLIST", &project_root, "TODO.md");
    let log_dir = resolve_value(&args.log_dir, "LOOPDECK_LOG_DIR", ".loopdeck/logs");
    let loop_command = resolve_command(args.loop_cmd, "LOOPDECK_LOOP_CMD");
    let generator_command = resolve_command(
        args.generator_cmd
            .split_whitespace()
            .map(|part| part.to_string())
            .collect(),
        "LOOPDECK_GENERATOR_CMD",
    );
    Config {
        addr,
        project_root,
        loop_log,
        checklist,
        log_dir,
        grace_period: Duration::from_secs(args.grace_seconds),
        poll_interval: Duration::from_secs(args.poll_seconds.max(1)),
        debounce: Duration::from_millis(args.debounce_ms.max(50)),
        loop_command,
        generator_command,
    }
}

fn resolve_value(flag: &str, env_key: &str, default: &str) -> String {
    if !flag.trim().is_empty() {
        return flag.to_string();
    }
    if let Ok(value) = std::env::var(env_key) {
        if !value.trim().is_empty() {
            return value;
        }
    }
    default.to_string()
}

fn resolve_project_root(flag: &str) -> PathBuf {
    if !flag.trim().is_empty() {
        return PathBuf::from(flag);
    }
    if let Ok(value) = std::env::var("LOOPDECK_PROJECT_ROOT") {
        if !value.trim().is_empty() {
            return PathBuf::from(value);
        }
    }
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}

fn resolve_file(flag: &str, env_key: &str, project_root: &Path, default_name: &str) -> PathBuf {
    if !flag.trim().is_empty() {
        return PathBuf::from(flag);
    }
    if let Ok(value) = std::env::var(env_key) {
        if !value.trim().is_empty() {
            return PathBuf::from(value);
        }
    }
    project_root.join(default_name)
}

fn resolve_command(flag_parts: Vec<String>, env_key: &str) -> Vec<String> {
    if !flag_parts.is_empty() {
        return flag_parts;
    }
    if let Ok(value) = std::env::var(env_key) {
        let parts: Vec<String> = value.split_whitespace().map(|p| p.to_string()).collect();
        if !parts.is_empty() {
            return parts;
        }
    }
    Vec::new()
}

fn init_logging(config: &Config) -> Option<LogGuard> {
    let level = std::env::var("LOOPDECK_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let writer = match open_log_file(&config.log_dir) {
        Ok(log_guard) => log_guard,
        Err(err) => {
            eprintln!("log_file_error: {err}");
            LogGuard { file: None }
        }
    };
    let file = writer.file.clone();
    let make_writer = BoxMakeWriter::new(move || MultiWriter::new(file.clone()));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(make_writer)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return None;
    }
    Some(writer)
}

struct LogGuard {
    file: Option<Arc<Mutex<std::fs::File>>>,
}

struct MultiWriter {
    stdout: io::Stdout,
    file: Option<Arc<Mutex<std::fs::File>>>,
}

impl MultiWriter {
    fn new(file: Option<Arc<Mutex<std::fs::File>>>) -> Self {
        Self {
            stdout: io::stdout(),
            file,
        }
    }
}

impl Write for MultiWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = self.stdout.write_all(buf);
        if let Some(file) = &self.file {
            let mut file = file.lock().unwrap();
            let _ = file.write_all(buf);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = self.stdout.flush();
        if let Some(file) = &self.file {
            let mut file = file.lock().unwrap();
            let _ = file.flush();
        }
        Ok(())
    }
}

fn open_log_file(log_dir: &str) -> io::Result<LogGuard> {
    if log_dir.trim().is_empty() {
        return Ok(LogGuard { file: None });
    }
    let dir = PathBuf::from(log_dir);
    if std::fs::create_dir_all(&dir).is_err() {
        return Ok(LogGuard { file: None });
    }
    let path = dir.join("loopdeck.log");
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .write(true)
        .open(path)?;
    Ok(LogGuard {
        file: Some(Arc::new(Mutex::new(file))),
    })
}
