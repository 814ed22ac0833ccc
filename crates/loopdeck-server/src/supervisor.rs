//! Lifecycle owner of the supervised loop process. At most one run exists at
//! a time; the state machine is Idle -> Starting -> Running -> Stopping ->
//! Idle, with Idle re-entrant. The supervisor is the only component allowed
//! to signal or reap the child.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use loopdeck_core::error::SupervisorError;
use loopdeck_core::parse::parse_iteration_marker;
use loopdeck_core::{LogEvent, LogSeverity, LoopMode, ProcessRunState};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

use crate::hub::{HubEvent, HubHandle};

/// Environment variable carrying the free-text scope label in scoped mode.
/// An env overlay keeps arbitrary operator text out of the argument vector.
const SCOPE_ENV_VAR: &str = "LOOPDECK_SCOPE";

#[derive(Clone, Debug)]
pub struct SupervisorConfig {
    /// Program plus base arguments; per-mode template args are appended.
    pub loop_command: Vec<String>,
    pub project_root: PathBuf,
    /// Window between the graceful interrupt and the forced kill.
    pub grace_period: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Starting,
    Running,
    Stopping,
}

struct Inner {
    phase: Phase,
    state: ProcessRunState,
    /// Increments on every spawn. The grace timer captures the generation it
    /// was armed for and re-validates before escalating, so it can never
    /// signal a later run.
    generation: u64,
    kill_tx: Option<mpsc::Sender<()>>,
}

pub struct Supervisor {
    config: SupervisorConfig,
    events: HubHandle,
    inner: Arc<Mutex<Inner>>,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig, events: HubHandle) -> Self {
        Self {
            config,
            events,
            inner: Arc::new(Mutex::new(Inner {
                phase: Phase::Idle,
                state: ProcessRunState::default(),
                generation: 0,
                kill_tx: None,
            })),
        }
    }

    pub async fn start(
        &self,
        mode: LoopMode,
        iteration_limit: u64,
        scope_label: Option<String>,
    ) -> Result<(), SupervisorError> {
        let mut inner = self.inner.lock().await;
        if inner.phase != Phase::Idle {
            return Err(SupervisorError::AlreadyRunning);
        }
        if self.config.loop_command.is_empty() {
            return Err(SupervisorError::Unconfigured);
        }
        inner.phase = Phase::Starting;

        let (program, args, env_overlay) = build_command(
            &self.config.loop_command,
            mode,
            iteration_limit,
            scope_label.as_deref(),
        );
        let mut command = Command::new(&program);
        command
            .args(&args)
            .envs(env_overlay)
            .current_dir(&self.config.project_root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                inner.phase = Phase::Idle;
                inner.state.is_running = false;
                let state = inner.state.clone();
                drop(inner);
                self.events.event(HubEvent::Log(LogEvent::new(
                    LogSeverity::Error,
                    format!("failed to start loop: {err}"),
                )));
                self.events.event(HubEvent::Process(state));
                return Err(SupervisorError::Spawn(err.to_string()));
            }
        };

        inner.generation += 1;
        let generation = inner.generation;
        let pid = child.id();
        inner.state = ProcessRunState {
            is_running: true,
            mode,
            iteration_count: 0,
            iteration_limit,
            scope_label,
            started_at: Some(Utc::now()),
            os_process_id: pid,
        };
        inner.phase = Phase::Running;
        let (kill_tx, kill_rx) = mpsc::channel(1);
        inner.kill_tx = Some(kill_tx);
        let state = inner.state.clone();
        drop(inner);

        info!(event = "loop_started", mode = %mode, pid = pid);
        self.events.event(HubEvent::Process(state));
        self.events.event(HubEvent::Log(LogEvent::new(
            LogSeverity::Info,
            format!(
                "loop started (mode {mode}, pid {})",
                pid.map(|p| p.to_string()).unwrap_or_else(|| "?".to_string())
            ),
        )));

        let mut reader_tasks = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            reader_tasks.push(tokio::spawn(read_stdout(
                stdout,
                self.events.clone(),
                self.inner.clone(),
                generation,
            )));
        }
        if let Some(stderr) = child.stderr.take() {
            reader_tasks.push(tokio::spawn(read_stderr(stderr, self.events.clone())));
        }
        tokio::spawn(wait_child(
            child,
            kill_rx,
            reader_tasks,
            self.events.clone(),
            self.inner.clone(),
            generation,
        ));
        Ok(())
    }

    /// Request a graceful stop. Never fails the caller: stopping a loop that
    /// is not running only produces a warning event.
    pub async fn stop(&self) {
        let mut inner = self.inner.lock().await;
        match inner.phase {
            Phase::Running | Phase::Starting => {
                inner.phase = Phase::Stopping;
                let generation = inner.generation;
                let pid = inner.state.os_process_id;
                drop(inner);

                if let Some(pid) = pid {
                    // Graceful interrupt; escalation happens on the timer.
                    unsafe {
                        libc::kill(pid as i32, libc::SIGINT);
                    }
                }
                self.events.event(HubEvent::Log(LogEvent::new(
                    LogSeverity::Info,
                    "stop requested; interrupting loop",
                )));

                let inner_arc = self.inner.clone();
                let grace = self.config.grace_period;
                tokio::spawn(async move {
                    tokio::time::sleep(grace).await;
                    let inner = inner_arc.lock().await;
                    if inner.generation != generation
                        || !matches!(inner.phase, Phase::Running | Phase::Stopping)
                    {
                        return;
                    }
                    let Some(kill_tx) = inner.kill_tx.clone() else {
                        return;
                    };
                    drop(inner);
                    warn!(event = "grace_expired", generation = generation);
                    let _ = kill_tx.send(()).await;
                });
            }
            Phase::Stopping => {
                drop(inner);
                self.events.event(HubEvent::Log(LogEvent::new(
                    LogSeverity::Warning,
                    "stop requested but a stop is already in progress",
                )));
            }
            Phase::Idle => {
                drop(inner);
                self.events.event(HubEvent::Log(LogEvent::new(
                    LogSeverity::Warning,
                    "stop requested but loop is not running",
                )));
            }
        }
    }
}

/// Mode templates: the external command itself comes from configuration; the
/// mode deterministically selects extra arguments and the env overlay.
fn build_command(
    loop_command: &[String],
    mode: LoopMode,
    iteration_limit: u64,
    scope_label: Option<&str>,
) -> (String, Vec<String>, Vec<(String, String)>) {
    let program = loop_command[0].clone();
    let mut args: Vec<String> = loop_command[1..].to_vec();
    let mut env_overlay = Vec::new();
    match mode {
        LoopMode::Standard => {
            if iteration_limit > 0 {
                args.push("--iterations".to_string());
                args.push(iteration_limit.to_string());
            }
        }
        LoopMode::Scoped => {
            args.push("--scoped".to_string());
            env_overlay.push((
                SCOPE_ENV_VAR.to_string(),
                scope_label.unwrap_or_default().to_string(),
            ));
        }
        LoopMode::Review => {
            args.push("--review".to_string());
            if iteration_limit > 0 {
                args.push("--iterations".to_string());
                args.push(iteration_limit.to_string());
            }
        }
    }
    (program, args, env_overlay)
}

async fn read_stdout<R>(
    stdout: R,
    events: HubHandle,
    inner: Arc<Mutex<Inner>>,
    generation: u64,
) where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stdout).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if let Some(count) = parse_iteration_marker(&line) {
            let mut inner = inner.lock().await;
            if inner.generation == generation && inner.state.is_running {
                inner.state.iteration_count = count;
                let state = inner.state.clone();
                drop(inner);
                events.event(HubEvent::Process(state));
            }
        }
        events.event(HubEvent::Log(LogEvent::new(LogSeverity::Info, line)));
    }
}

async fn read_stderr<R>(stderr: R, events: HubHandle)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        events.event(HubEvent::Log(LogEvent::new(LogSeverity::Error, line)));
    }
}

/// Owns the child handle until exit. The kill channel is the only escalation
/// path, so a forced kill happens at most once per stop cycle. The stream
/// readers are drained before the exit is published so every output line
/// precedes the termination events.
async fn wait_child(
    mut child: Child,
    mut kill_rx: mpsc::Receiver<()>,
    reader_tasks: Vec<tokio::task::JoinHandle<()>>,
    events: HubHandle,
    inner: Arc<Mutex<Inner>>,
    generation: u64,
) {
    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            Some(()) = kill_rx.recv() => {
                warn!(event = "force_kill", generation = generation);
                let _ = child.start_kill();
            }
        }
    };
    for task in reader_tasks {
        let _ = task.await;
    }

    let mut inner = inner.lock().await;
    if inner.generation != generation {
        return;
    }
    inner.phase = Phase::Idle;
    inner.kill_tx = None;
    inner.state.is_running = false;
    inner.state.os_process_id = None;
    inner.state.started_at = None;
    let state = inner.state.clone();
    drop(inner);

    let entry = match &status {
        Ok(status) if status.success() => {
            LogEvent::new(LogSeverity::Success, "loop exited cleanly (code 0)")
        }
        Ok(status) => match status.code() {
            Some(code) => LogEvent::new(LogSeverity::Error, format!("loop exited with code {code}")),
            None => LogEvent::new(LogSeverity::Error, "loop terminated by signal"),
        },
        Err(err) => LogEvent::new(LogSeverity::Error, format!("failed waiting on loop: {err}")),
    };
    info!(event = "loop_exited", generation = generation);
    events.event(HubEvent::Process(state));
    events.event(HubEvent::Log(entry));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::HubMessage;
    use std::time::Instant;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    fn test_supervisor(
        loop_command: Vec<String>,
        grace_period: Duration,
    ) -> (Supervisor, mpsc::UnboundedReceiver<HubMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let supervisor = Supervisor::new(
            SupervisorConfig {
                loop_command,
                project_root: std::env::temp_dir(),
                grace_period,
            },
            HubHandle::new(tx),
        );
        (supervisor, rx)
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<HubMessage>) -> HubEvent {
        loop {
            match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
                Ok(Some(HubMessage::Event(event))) => return event,
                Ok(Some(_)) => continue,
                _ => panic!("timed out waiting for supervisor event"),
            }
        }
    }

    async fn wait_for_exit_state(rx: &mut mpsc::UnboundedReceiver<HubMessage>) -> ProcessRunState {
        loop {
            if let HubEvent::Process(state) = next_event(rx).await {
                if !state.is_running {
                    return state;
                }
            }
        }
    }

    #[tokio::test]
    async fn start_while_running_is_rejected_without_republishing_state() {
        let (supervisor, mut rx) = test_supervisor(sh("sleep 2"), Duration::from_millis(200));
        supervisor
            .start(LoopMode::Standard, 0, None)
            .await
            .expect("first start");
        match next_event(&mut rx).await {
            HubEvent::Process(state) => assert!(state.is_running),
            other => panic!("expected run state first, got {other:?}"),
        }
        // Drain the start log so the channel is quiet.
        let _ = next_event(&mut rx).await;

        let err = supervisor
            .start(LoopMode::Review, 3, None)
            .await
            .expect_err("second start must fail");
        assert!(matches!(err, SupervisorError::AlreadyRunning));
        // The rejection goes to the caller only; nothing is republished.
        assert!(rx.try_recv().is_err());

        supervisor.stop().await;
        wait_for_exit_state(&mut rx).await;
    }

    #[tokio::test]
    async fn clean_run_tracks_iterations_and_reports_success() {
        let (supervisor, mut rx) = test_supervisor(
            sh("echo 'iteration 1'; echo 'iteration 2'; exit 0"),
            Duration::from_millis(200),
        );
        supervisor
            .start(LoopMode::Standard, 0, None)
            .await
            .expect("start");

        let final_state = wait_for_exit_state(&mut rx).await;
        assert_eq!(final_state.iteration_count, 2);
        assert!(final_state.os_process_id.is_none());

        loop {
            if let HubEvent::Log(entry) = next_event(&mut rx).await {
                if entry.severity == LogSeverity::Success {
                    assert!(entry.text.contains("code 0"));
                    break;
                }
            }
        }
    }

    #[tokio::test]
    async fn stderr_lines_surface_as_error_logs() {
        let (supervisor, mut rx) = test_supervisor(
            sh("echo oops >&2; exit 3"),
            Duration::from_millis(200),
        );
        supervisor
            .start(LoopMode::Standard, 0, None)
            .await
            .expect("start");

        let mut saw_stderr = false;
        let mut saw_exit = false;
        while !(saw_stderr && saw_exit) {
            match next_event(&mut rx).await {
                HubEvent::Log(entry) if entry.severity == LogSeverity::Error => {
                    if entry.text == "oops" {
                        saw_stderr = true;
                    }
                    if entry.text.contains("code 3") {
                        saw_exit = true;
                    }
                }
                _ => {}
            }
        }
    }

    #[tokio::test]
    async fn stop_when_idle_emits_warning_only() {
        let (supervisor, mut rx) = test_supervisor(Vec::new(), Duration::from_millis(200));
        supervisor.stop().await;
        match next_event(&mut rx).await {
            HubEvent::Log(entry) => {
                assert_eq!(entry.severity, LogSeverity::Warning);
                assert!(entry.text.contains("not running"));
            }
            other => panic!("expected warning log, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn stubborn_child_is_force_killed_no_earlier_than_grace() {
        let grace = Duration::from_millis(200);
        let (supervisor, mut rx) = test_supervisor(
            sh("trap '' INT; while :; do sleep 1; done"),
            grace,
        );
        supervisor
            .start(LoopMode::Standard, 0, None)
            .await
            .expect("start");
        // Give the shell time to install the trap before interrupting.
        tokio::time::sleep(Duration::from_millis(300)).await;

        let stopped_at = Instant::now();
        supervisor.stop().await;
        let final_state = wait_for_exit_state(&mut rx).await;
        assert!(!final_state.is_running);
        assert!(stopped_at.elapsed() >= grace);
    }

    #[test]
    fn mode_templates_are_deterministic() {
        let base = vec!["runner".to_string(), "--loop".to_string()];

        let (program, args, envs) = build_command(&base, LoopMode::Standard, 5, None);
        assert_eq!(program, "runner");
        assert_eq!(args, vec!["--loop", "--iterations", "5"]);
        assert!(envs.is_empty());

        let (_, args, envs) = build_command(&base, LoopMode::Standard, 0, None);
        assert_eq!(args, vec!["--loop"]);
        assert!(envs.is_empty());

        let (_, args, envs) =
            build_command(&base, LoopMode::Scoped, 0, Some("fix the tailer; rm -rf /"));
        assert_eq!(args, vec!["--loop", "--scoped"]);
        assert_eq!(
            envs,
            vec![(
                SCOPE_ENV_VAR.to_string(),
                "fix the tailer; rm -rf /".to_string()
            )]
        );

        let (_, args, _) = build_command(&base, LoopMode::Review, 2, None);
        assert_eq!(args, vec!["--loop", "--review", "--iterations", "2"]);
    }
}
