//! Host <-> worker message protocol.
//!
//! A single ordered channel carries tagged frames. Correlated requests
//! travel as [`HostFrame`] with a host-assigned monotonic id; the worker
//! answers every id exactly once with a [`WorkerReply`] (the success
//! variant or `Error`). Unsolicited [`WorkerEvent`]s carry no id and may
//! interleave at any time.
//!
//! The enums are closed sums: the dispatcher matches exhaustively, so a
//! new operation is a compile error until every side handles it.

use serde::{Deserialize, Serialize};

use crate::http::{HttpRequest, HttpResponse};
use crate::types::{ContainerStats, Pid, SpawnOptions};

/// Correlation id for host -> worker requests. Monotonic per container.
pub type RequestId = u64;

// ============================================================================
// Requests (Host -> Worker)
// ============================================================================

/// Operations the host may invoke on the worker. All carry an id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
#[serde(rename_all_fields = "camelCase")]
pub enum WorkerRequest {
    /// First message on the channel; latches worker configuration.
    Initialize {
        #[serde(default)]
        debug: bool,
        #[serde(default)]
        memory_limit: Option<u64>,
    },
    /// Start a process. Replies `Spawned{pid}`.
    Spawn {
        command: String,
        args: Vec<String>,
        #[serde(default)]
        options: SpawnOptions,
    },
    /// Deliver stdin to a process.
    WriteInput { pid: Pid, input: String },
    /// Stop a process.
    Terminate { pid: Pid },
    /// Tear the worker down after terminating every process.
    Dispose,
    /// Snapshot process + network stats.
    GetStats,
    WriteFile {
        path: String,
        content: String,
    },
    ReadFile {
        path: String,
    },
    DeleteFile {
        path: String,
        #[serde(default)]
        recursive: bool,
    },
    /// Flat file listing under `path` (whole tree when absent).
    ListFiles {
        #[serde(default)]
        path: Option<String>,
    },
    CreateDirectory {
        path: String,
    },
    ListDirectory {
        path: String,
    },
    DeleteDirectory {
        path: String,
    },
    /// Inject an HTTP request targeting a virtual port.
    HttpRequest {
        request: HttpRequest,
        port: u16,
    },
    /// Ports with running servers.
    ListServers,
}

impl WorkerRequest {
    /// Short operation name used in logs.
    pub fn op(&self) -> &'static str {
        match self {
            WorkerRequest::Initialize { .. } => "initialize",
            WorkerRequest::Spawn { .. } => "spawn",
            WorkerRequest::WriteInput { .. } => "writeInput",
            WorkerRequest::Terminate { .. } => "terminate",
            WorkerRequest::Dispose => "dispose",
            WorkerRequest::GetStats => "getStats",
            WorkerRequest::WriteFile { .. } => "writeFile",
            WorkerRequest::ReadFile { .. } => "readFile",
            WorkerRequest::DeleteFile { .. } => "deleteFile",
            WorkerRequest::ListFiles { .. } => "listFiles",
            WorkerRequest::CreateDirectory { .. } => "createDirectory",
            WorkerRequest::ListDirectory { .. } => "listDirectory",
            WorkerRequest::DeleteDirectory { .. } => "deleteDirectory",
            WorkerRequest::HttpRequest { .. } => "httpRequest",
            WorkerRequest::ListServers => "listServers",
        }
    }
}

// ============================================================================
// Replies (Worker -> Host)
// ============================================================================

/// Exactly one reply per request id: the matching success variant, or
/// `Error` carrying the failure message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
#[serde(rename_all_fields = "camelCase")]
pub enum WorkerReply {
    Initialized,
    Spawned { pid: Pid, command: String },
    InputWritten,
    Terminated { pid: Pid, exit_code: i32 },
    Disposed,
    Stats { stats: ContainerStats },
    FileWritten,
    FileRead { content: String },
    FileDeleted,
    FileList { files: Vec<String> },
    DirectoryCreated,
    DirectoryDeleted,
    DirectoryList { entries: Vec<String> },
    HttpResponse { response: HttpResponse, port: u16 },
    ServerList { ports: Vec<u16> },
    Error { error: String },
}

impl WorkerReply {
    /// Build an error reply from any displayable failure.
    pub fn error(err: impl std::fmt::Display) -> Self {
        WorkerReply::Error {
            error: err.to_string(),
        }
    }
}

// ============================================================================
// Events (Worker -> Host, no id)
// ============================================================================

/// Unsolicited events broadcast to every registered handler.
///
/// Per-pid ordering holds: outputs and errors in production order, then
/// exactly one `ProcessExit`, after which the pid is silent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
#[serde(rename_all_fields = "camelCase")]
pub enum WorkerEvent {
    ProcessOutput {
        pid: Pid,
        output: String,
        is_error: bool,
    },
    ProcessExit {
        pid: Pid,
        exit_code: i32,
    },
    ProcessError {
        pid: Pid,
        error: String,
    },
    #[serde(rename = "onServerListen")]
    ServerListen { port: u16 },
    #[serde(rename = "onServerClose")]
    ServerClose { port: u16 },
    NetworkError {
        port: u16,
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        error: String,
    },
}

impl WorkerEvent {
    /// The pid this event belongs to, when it is process-scoped.
    pub fn pid(&self) -> Option<Pid> {
        match self {
            WorkerEvent::ProcessOutput { pid, .. }
            | WorkerEvent::ProcessExit { pid, .. }
            | WorkerEvent::ProcessError { pid, .. } => Some(*pid),
            _ => None,
        }
    }
}

// ============================================================================
// Frames
// ============================================================================

/// Host -> worker frame: a correlated request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HostFrame {
    pub id: RequestId,
    pub request: WorkerRequest,
}

/// Worker -> host frame: a correlated reply or an id-less event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "frame", rename_all = "lowercase")]
pub enum WorkerFrame {
    Reply { id: RequestId, reply: WorkerReply },
    Event { event: WorkerEvent },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_serialization_uses_wire_names() {
        let req = WorkerRequest::WriteInput {
            pid: Pid::new(3),
            input: "hi\n".to_string(),
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("writeInput"));

        let parsed: WorkerRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, req);
    }

    #[test]
    fn spawn_options_default_when_omitted() {
        let json = r#"{"type":"spawn","payload":{"command":"echo","args":["hi"]}}"#;
        let parsed: WorkerRequest = serde_json::from_str(json).unwrap();
        match parsed {
            WorkerRequest::Spawn { command, options, .. } => {
                assert_eq!(command, "echo");
                assert_eq!(options.cwd, "/");
            }
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn event_wire_names_match_the_protocol() {
        let listen = WorkerEvent::ServerListen { port: 8080 };
        let json = serde_json::to_string(&listen).unwrap();
        assert!(json.contains("onServerListen"));

        let output = WorkerEvent::ProcessOutput {
            pid: Pid::new(1),
            output: "hi\n".to_string(),
            is_error: false,
        };
        let json = serde_json::to_string(&output).unwrap();
        assert!(json.contains("processOutput"));
        assert!(json.contains("isError"));
    }

    #[test]
    fn reply_error_helper_carries_message() {
        let reply = WorkerReply::error("port in use");
        match reply {
            WorkerReply::Error { error } => assert_eq!(error, "port in use"),
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn frames_roundtrip() {
        let frame = WorkerFrame::Reply {
            id: 7,
            reply: WorkerReply::FileRead {
                content: "data".to_string(),
            },
        };
        let json = serde_json::to_string(&frame).unwrap();
        let parsed: WorkerFrame = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, frame);

        let frame = WorkerFrame::Event {
            event: WorkerEvent::ProcessExit {
                pid: Pid::new(2),
                exit_code: 0,
            },
        };
        let json = serde_json::to_string(&frame).unwrap();
        let parsed: WorkerFrame = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, frame);
    }
}
