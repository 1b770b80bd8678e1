//! Worker-internal event funnel.
//!
//! Executors, the network manager, and the HTTP bridge all emit through
//! one channel; the dispatcher forwards in arrival order, which is what
//! preserves per-pid ordering end to end.

use tokio::sync::mpsc;
use vessel_protocol::{Pid, WorkerEvent};

/// Cloneable sender for unsolicited worker events.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<WorkerEvent>,
}

impl EventSink {
    pub fn new(tx: mpsc::UnboundedSender<WorkerEvent>) -> Self {
        Self { tx }
    }

    /// Create a sink together with its receiving half (test convenience).
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<WorkerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    pub fn emit(&self, event: WorkerEvent) {
        // A closed receiver means the dispatcher is gone; events are
        // fire-and-forget at that point.
        let _ = self.tx.send(event);
    }

    pub fn output(&self, pid: Pid, output: impl Into<String>, is_error: bool) {
        self.emit(WorkerEvent::ProcessOutput {
            pid,
            output: output.into(),
            is_error,
        });
    }

    pub fn process_error(&self, pid: Pid, error: impl Into<String>) {
        self.emit(WorkerEvent::ProcessError {
            pid,
            error: error.into(),
        });
    }

    pub fn exit(&self, pid: Pid, exit_code: i32) {
        self.emit(WorkerEvent::ProcessExit { pid, exit_code });
    }

    pub fn server_listen(&self, port: u16) {
        self.emit(WorkerEvent::ServerListen { port });
    }

    pub fn server_close(&self, port: u16) {
        self.emit(WorkerEvent::ServerClose { port });
    }

    pub fn network_error(&self, port: u16, request_id: Option<String>, error: impl Into<String>) {
        self.emit(WorkerEvent::NetworkError {
            port,
            request_id,
            error: error.into(),
        });
    }
}
