//! Wire contract between the server and its observers. Every frame is a
//! `{type, payload}` object; the same command set is mirrored by the HTTP
//! surface.

use serde::{Deserialize, Serialize};

use crate::{ChecklistSnapshot, LogEvent, LoopMode, ProcessRunState, RepositoryStatus};

/// Server-to-observer messages. Snapshot categories are broadcast to every
/// open channel; `document`, `document_list`, `document_written`, and
/// `error` are unicast to the requesting channel only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerMessage {
    ProcessStatus(ProcessRunState),
    Log(LogEvent),
    Checklist(ChecklistSnapshot),
    Repository(RepositoryStatus),
    Document { name: String, content: String },
    DocumentList { names: Vec<String> },
    DocumentWritten { name: String },
    Error { code: String, message: String },
}

/// Observer-to-server commands.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientCommand {
    StartLoop {
        mode: LoopMode,
        #[serde(default)]
        iteration_limit: u64,
        #[serde(default)]
        scope_label: Option<String>,
    },
    StopLoop {},
    ReadDocument {
        name: String,
    },
    WriteDocument {
        name: String,
        content: String,
    },
    ListDocuments {},
    ToggleChecklistItem {
        line: usize,
    },
}

/// The combined snapshot returned by the HTTP status endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CombinedStatus {
    pub process: ProcessRunState,
    pub checklist: ChecklistSnapshot,
    pub repository: RepositoryStatus,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LogSeverity;

    #[test]
    fn commands_decode_from_tagged_json() {
        let command: ClientCommand = serde_json::from_str(
            r#"{"type":"start_loop","payload":{"mode":"scoped","scope_label":"fix the parser"}}"#,
        )
        .expect("decode start_loop");
        assert_eq!(
            command,
            ClientCommand::StartLoop {
                mode: LoopMode::Scoped,
                iteration_limit: 0,
                scope_label: Some("fix the parser".to_string()),
            }
        );

        let command: ClientCommand =
            serde_json::from_str(r#"{"type":"stop_loop","payload":{}}"#).expect("decode stop_loop");
        assert_eq!(command, ClientCommand::StopLoop {});

        let command: ClientCommand = serde_json::from_str(
            r#"{"type":"write_document","payload":{"name":"PROMPT.md","content":"hello"}}"#,
        )
        .expect("decode write_document");
        assert_eq!(
            command,
            ClientCommand::WriteDocument {
                name: "PROMPT.md".to_string(),
                content: "hello".to_string(),
            }
        );
    }

    #[test]
    fn server_messages_carry_type_and_payload() {
        let message = ServerMessage::Log(LogEvent::new(LogSeverity::Info, "starting step 3"));
        let value = serde_json::to_value(&message).expect("encode log");
        assert_eq!(value["type"], "log");
        assert_eq!(value["payload"]["severity"], "info");
        assert_eq!(value["payload"]["text"], "starting step 3");

        let message = ServerMessage::ProcessStatus(ProcessRunState::default());
        let value = serde_json::to_value(&message).expect("encode status");
        assert_eq!(value["type"], "process_status");
        assert_eq!(value["payload"]["is_running"], false);
    }

    #[test]
    fn round_trip_for_snapshot_messages() {
        let message = ServerMessage::Checklist(crate::parse::parse_checklist(
            "- [x] one\n- [ ] two\n",
        ));
        let encoded = serde_json::to_string(&message).expect("encode");
        let decoded: ServerMessage = serde_json::from_str(&encoded).expect("decode");
        assert_eq!(decoded, message);
    }
}
