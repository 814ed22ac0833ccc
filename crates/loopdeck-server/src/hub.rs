//! Event broadcast hub. The hub is the single owner of the subscriber
//! registry and the retained snapshots; every mutation flows through its
//! inbox, so no locks guard the registry. Producers push events, observer
//! connections push subscribe/disconnect/command messages, and the HTTP
//! surface queries snapshots through a oneshot reply.

use std::collections::HashMap;
use std::sync::Arc;

use loopdeck_core::protocol::{ClientCommand, CombinedStatus, ServerMessage};
use loopdeck_core::{ChecklistSnapshot, LogEvent, ProcessRunState, RepositoryStatus};
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use crate::checklist::ChecklistFile;
use crate::docs::DocumentStore;
use crate::supervisor::Supervisor;

/// A producer event. Each variant replaces the hub's retained snapshot for
/// its category except `Log`, which is fan-out only.
#[derive(Debug, Clone)]
pub enum HubEvent {
    Process(ProcessRunState),
    Log(LogEvent),
    Checklist(ChecklistSnapshot),
    Repository(RepositoryStatus),
}

#[derive(Debug)]
pub enum HubMessage {
    Event(HubEvent),
    Subscribe {
        sender: mpsc::Sender<ServerMessage>,
        reply: oneshot::Sender<u64>,
    },
    Disconnect {
        conn_id: u64,
    },
    Command {
        conn_id: u64,
        command: ClientCommand,
    },
    Rejected {
        conn_id: u64,
        message: String,
    },
    Query {
        reply: oneshot::Sender<CombinedStatus>,
    },
}

#[derive(Clone)]
pub struct HubHandle {
    tx: mpsc::UnboundedSender<HubMessage>,
}

impl HubHandle {
    pub fn new(tx: mpsc::UnboundedSender<HubMessage>) -> Self {
        Self { tx }
    }

    pub fn event(&self, event: HubEvent) {
        let _ = self.tx.send(HubMessage::Event(event));
    }

    /// Register an observer channel. Resolves once the hub has delivered the
    /// snapshot replay, so no incremental event can precede it.
    pub async fn subscribe(&self, sender: mpsc::Sender<ServerMessage>) -> Option<u64> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(HubMessage::Subscribe {
                sender,
                reply: reply_tx,
            })
            .ok()?;
        reply_rx.await.ok()
    }

    pub fn disconnect(&self, conn_id: u64) {
        let _ = self.tx.send(HubMessage::Disconnect { conn_id });
    }

    pub fn command(&self, conn_id: u64, command: ClientCommand) {
        let _ = self.tx.send(HubMessage::Command { conn_id, command });
    }

    pub fn reject(&self, conn_id: u64, message: String) {
        let _ = self.tx.send(HubMessage::Rejected { conn_id, message });
    }

    pub async fn combined_status(&self) -> Option<CombinedStatus> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx.send(HubMessage::Query { reply: reply_tx }).ok()?;
        reply_rx.await.ok()
    }
}

pub struct Hub {
    rx: mpsc::UnboundedReceiver<HubMessage>,
    supervisor: Arc<Supervisor>,
    documents: Arc<DocumentStore>,
    checklist: Arc<ChecklistFile>,
    subscribers: HashMap<u64, mpsc::Sender<ServerMessage>>,
    next_conn_id: u64,
    process: ProcessRunState,
    checklist_snapshot: ChecklistSnapshot,
    repository: RepositoryStatus,
}

impl Hub {
    pub fn new(
        rx: mpsc::UnboundedReceiver<HubMessage>,
        supervisor: Arc<Supervisor>,
        documents: Arc<DocumentStore>,
        checklist: Arc<ChecklistFile>,
    ) -> Self {
        Self {
            rx,
            supervisor,
            documents,
            checklist,
            subscribers: HashMap::new(),
            next_conn_id: 0,
            process: ProcessRunState::default(),
            checklist_snapshot: ChecklistSnapshot::default(),
            repository: RepositoryStatus::default(),
        }
    }

    pub async fn run(mut self) {
        while let Some(message) = self.rx.recv().await {
            self.handle(message).await;
        }
    }

    async fn handle(&mut self, message: HubMessage) {
        match message {
            HubMessage::Event(event) => self.apply_event(event),
            HubMessage::Subscribe { sender, reply } => {
                self.next_conn_id += 1;
                let conn_id = self.next_conn_id;
                if self.replay_snapshots(&sender) {
                    self.subscribers.insert(conn_id, sender);
                    info!(event = "observer_connected", conn_id = conn_id);
                }
                let _ = reply.send(conn_id);
            }
            HubMessage::Disconnect { conn_id } => {
                if self.subscribers.remove(&conn_id).is_some() {
                    info!(event = "observer_disconnected", conn_id = conn_id);
                }
            }
            HubMessage::Command { conn_id, command } => {
                self.dispatch(conn_id, command).await;
            }
            HubMessage::Rejected { conn_id, message } => {
                self.unicast(
                    conn_id,
                    ServerMessage::Error {
                        code: "invalid_command".to_string(),
                        message,
                    },
                );
            }
            HubMessage::Query { reply } => {
                let _ = reply.send(CombinedStatus {
                    process: self.process.clone(),
                    checklist: self.checklist_snapshot.clone(),
                    repository: self.repository.clone(),
                });
            }
        }
    }

    fn apply_event(&mut self, event: HubEvent) {
        let message = match event {
            HubEvent::Process(state) => {
                self.process = state.clone();
                ServerMessage::ProcessStatus(state)
            }
            HubEvent::Log(entry) => ServerMessage::Log(entry),
            HubEvent::Checklist(snapshot) => {
                self.checklist_snapshot = snapshot.clone();
                ServerMessage::Checklist(snapshot)
            }
            HubEvent::Repository(status) => {
                self.repository = status.clone();
                ServerMessage::Repository(status)
            }
        };
        self.fan_out(message);
    }

    /// Deliver the three retained snapshots to one channel, in a fixed
    /// order, before the observer sees any incremental event. Returns false
    /// if the channel is already dead.
    fn replay_snapshots(&self, sender: &mpsc::Sender<ServerMessage>) -> bool {
        let snapshots = [
            ServerMessage::ProcessStatus(self.process.clone()),
            ServerMessage::Checklist(self.checklist_snapshot.clone()),
            ServerMessage::Repository(self.repository.clone()),
        ];
        for message in snapshots {
            if sender.try_send(message).is_err() {
                warn!(event = "snapshot_error");
                return false;
            }
        }
        true
    }

    /// Best-effort fan-out. A full or closed channel loses its membership;
    /// the failure never stops delivery to the remaining channels.
    fn fan_out(&mut self, message: ServerMessage) {
        let mut dead = Vec::new();
        for (conn_id, sender) in &self.subscribers {
            if sender.try_send(message.clone()).is_err() {
                warn!(event = "send_error", conn_id = *conn_id);
                dead.push(*conn_id);
            }
        }
        for conn_id in dead {
            self.subscribers.remove(&conn_id);
        }
    }

    fn unicast(&mut self, conn_id: u64, message: ServerMessage) {
        let failed = match self.subscribers.get(&conn_id) {
            Some(sender) => sender.try_send(message).is_err(),
            None => false,
        };
        if failed {
            warn!(event = "send_error", conn_id = conn_id);
            self.subscribers.remove(&conn_id);
        }
    }

    /// Observer commands dispatch inline to the owning component. Only
    /// synchronous read results and typed failures go back to the sender;
    /// every other effect re-enters through the normal event path.
    async fn dispatch(&mut self, conn_id: u64, command: ClientCommand) {
        let supervisor = self.supervisor.clone();
        let documents = self.documents.clone();
        let checklist = self.checklist.clone();
        match command {
            ClientCommand::StartLoop {
                mode,
                iteration_limit,
                scope_label,
            } => {
                if let Err(err) = supervisor.start(mode, iteration_limit, scope_label).await {
                    self.unicast_error(conn_id, err.code(), &err.to_string());
                }
            }
            ClientCommand::StopLoop {} => {
                supervisor.stop().await;
            }
            ClientCommand::ReadDocument { name } => {
                let result = documents.read(&name).await;
                match result {
                    Ok(content) => {
                        self.unicast(conn_id, ServerMessage::Document { name, content });
                    }
                    Err(err) => self.unicast_error(conn_id, err.code(), &err.to_string()),
                }
            }
            ClientCommand::WriteDocument { name, content } => {
                let result = documents.write(&name, &content).await;
                match result {
                    Ok(()) => {
                        self.unicast(conn_id, ServerMessage::DocumentWritten { name });
                    }
                    Err(err) => self.unicast_error(conn_id, err.code(), &err.to_string()),
                }
            }
            ClientCommand::ListDocuments {} => {
                let names = documents.names();
                self.unicast(conn_id, ServerMessage::DocumentList { names });
            }
            ClientCommand::ToggleChecklistItem { line } => {
                // The rewrite lands on disk; the differ's watcher re-parses
                // and broadcasts the resulting snapshot.
                if let Err(err) = checklist.toggle(line).await {
                    self.unicast_error(conn_id, err.code(), &err.to_string());
                }
            }
        }
    }

    fn unicast_error(&mut self, conn_id: u64, code: &str, message: &str) {
        self.unicast(
            conn_id,
            ServerMessage::Error {
                code: code.to_string(),
                message: message.to_string(),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::SupervisorConfig;
    use loopdeck_core::{LogSeverity, LoopMode};
    use std::time::Duration;
    use tempfile::TempDir;

    fn spawn_hub() -> (HubHandle, TempDir) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = HubHandle::new(tx);
        let dir = TempDir::new().expect("tempdir");
        let supervisor = Arc::new(Supervisor::new(
            SupervisorConfig {
                loop_command: Vec::new(),
                project_root: dir.path().to_path_buf(),
                grace_period: Duration::from_millis(200),
            },
            handle.clone(),
        ));
        let documents = Arc::new(DocumentStore::new(dir.path().to_path_buf()));
        let checklist = Arc::new(ChecklistFile::new(dir.path().join("TODO.md")));
        let hub = Hub::new(rx, supervisor, documents, checklist);
        tokio::spawn(hub.run());
        (handle, dir)
    }

    async fn recv(rx: &mut mpsc::Receiver<ServerMessage>) -> ServerMessage {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timely message")
            .expect("open channel")
    }

    #[tokio::test]
    async fn new_observer_gets_snapshots_before_any_event() {
        let (handle, _dir) = spawn_hub();

        let mut running = ProcessRunState::default();
        running.is_running = true;
        running.mode = LoopMode::Standard;
        running.iteration_count = 7;
        handle.event(HubEvent::Process(running.clone()));

        let (tx, mut rx) = mpsc::channel(16);
        handle.subscribe(tx).await.expect("subscribe");

        match recv(&mut rx).await {
            ServerMessage::ProcessStatus(state) => {
                assert!(state.is_running);
                assert_eq!(state.iteration_count, 7);
            }
            other => panic!("expected process snapshot first, got {other:?}"),
        }
        assert!(matches!(recv(&mut rx).await, ServerMessage::Checklist(_)));
        assert!(matches!(recv(&mut rx).await, ServerMessage::Repository(_)));
    }

    #[tokio::test]
    async fn dead_channel_does_not_block_the_rest() {
        let (handle, _dir) = spawn_hub();

        let (alive_tx, mut alive_rx) = mpsc::channel(16);
        handle.subscribe(alive_tx).await.expect("subscribe alive");
        let (dead_tx, dead_rx) = mpsc::channel(16);
        handle.subscribe(dead_tx).await.expect("subscribe dead");
        drop(dead_rx);

        for _ in 0..3 {
            recv(&mut alive_rx).await;
        }

        handle.event(HubEvent::Log(LogEvent::new(LogSeverity::Info, "first")));
        handle.event(HubEvent::Log(LogEvent::new(LogSeverity::Info, "second")));

        for expected in ["first", "second"] {
            match recv(&mut alive_rx).await {
                ServerMessage::Log(entry) => assert_eq!(entry.text, expected),
                other => panic!("expected log, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn read_results_are_unicast_and_typed() {
        let (handle, dir) = spawn_hub();
        std::fs::write(dir.path().join("PROMPT.md"), "keep going").expect("seed doc");

        let (tx, mut rx) = mpsc::channel(16);
        let conn_id = handle.subscribe(tx).await.expect("subscribe");
        for _ in 0..3 {
            recv(&mut rx).await;
        }

        handle.command(
            conn_id,
            ClientCommand::ReadDocument {
                name: "PROMPT.md".to_string(),
            },
        );
        match recv(&mut rx).await {
            ServerMessage::Document { name, content } => {
                assert_eq!(name, "PROMPT.md");
                assert_eq!(content, "keep going");
            }
            other => panic!("expected document, got {other:?}"),
        }

        handle.command(
            conn_id,
            ClientCommand::ReadDocument {
                name: "SECRETS.md".to_string(),
            },
        );
        match recv(&mut rx).await {
            ServerMessage::Error { code, .. } => assert_eq!(code, "not_found"),
            other => panic!("expected error, got {other:?}"),
        }
    }
}
