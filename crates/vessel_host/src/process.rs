//! Embedder-facing process handle.
//!
//! A read-through mirror of a worker process. It never mutates worker
//! state directly; `write` and `kill` travel through the bridge, and the
//! worker's events drive the mirror via the container's router.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, watch};
use tracing::debug;
use vessel_protocol::defaults::EXIT_CODE_TERMINATED;
use vessel_protocol::{ContainerError, Pid, Result, WorkerReply, WorkerRequest};

use crate::bridge::WorkerBridge;

const EVENT_CHANNEL_CAPACITY: usize = 256;
/// Replayed to late subscribers; older output is dropped beyond this.
const EVENT_HISTORY_CAP: usize = 1024;

/// Typed process events delivered to handle subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    Output { output: String, is_error: bool },
    Exit { exit_code: i32 },
    Error { error: String },
}

#[derive(Default)]
struct EventLog {
    seq: u64,
    entries: VecDeque<(u64, ProcessEvent)>,
}

/// Subscription to one process's events.
///
/// Events already recorded when the subscription was created are
/// replayed first, so a subscriber attached right after `spawn` returns
/// cannot miss early output.
pub struct ProcessEvents {
    backlog: VecDeque<(u64, ProcessEvent)>,
    last_seq: u64,
    live: broadcast::Receiver<(u64, ProcessEvent)>,
}

impl ProcessEvents {
    /// Next event; `None` once the process handle is gone and the log
    /// is drained.
    pub async fn recv(&mut self) -> Option<ProcessEvent> {
        if let Some((seq, event)) = self.backlog.pop_front() {
            self.last_seq = seq;
            return Some(event);
        }
        loop {
            match self.live.recv().await {
                Ok((seq, event)) => {
                    // Replay overlap: anything at or below the snapshot
                    // cursor was already delivered.
                    if seq <= self.last_seq {
                        continue;
                    }
                    self.last_seq = seq;
                    return Some(event);
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    debug!(missed, "process event subscriber lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn try_recv(&mut self) -> Option<ProcessEvent> {
        if let Some((seq, event)) = self.backlog.pop_front() {
            self.last_seq = seq;
            return Some(event);
        }
        loop {
            match self.live.try_recv() {
                Ok((seq, event)) => {
                    if seq <= self.last_seq {
                        continue;
                    }
                    self.last_seq = seq;
                    return Some(event);
                }
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}

/// Host-side mirror of one worker process.
pub struct ProcessHandle {
    pid: Pid,
    command: String,
    args: Vec<String>,
    bridge: Arc<WorkerBridge>,
    log: Mutex<EventLog>,
    live: broadcast::Sender<(u64, ProcessEvent)>,
    exit: watch::Sender<Option<i32>>,
    kill_sent: AtomicBool,
}

impl ProcessHandle {
    pub(crate) fn new(
        pid: Pid,
        command: String,
        args: Vec<String>,
        bridge: Arc<WorkerBridge>,
    ) -> Self {
        let (live, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (exit, _) = watch::channel(None);
        Self {
            pid,
            command,
            args,
            bridge,
            log: Mutex::new(EventLog::default()),
            live,
            exit,
            kill_sent: AtomicBool::new(false),
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn is_running(&self) -> bool {
        self.exit.borrow().is_none()
    }

    pub fn exit_code(&self) -> Option<i32> {
        *self.exit.borrow()
    }

    /// Subscribe to this process's typed event stream.
    pub fn events(&self) -> ProcessEvents {
        // Subscribe before snapshotting so nothing falls in the gap;
        // overlap is deduplicated by sequence number.
        let live = self.live.subscribe();
        let log = self.lock_log();
        ProcessEvents {
            backlog: log.entries.clone(),
            last_seq: 0,
            live,
        }
    }

    /// Wait for the exit code.
    pub async fn wait(&self) -> i32 {
        let mut exit = self.exit.subscribe();
        loop {
            if let Some(code) = *exit.borrow() {
                return code;
            }
            if exit.changed().await.is_err() {
                // Sender gone; fall back to whatever was recorded.
                return self.exit_code().unwrap_or(EXIT_CODE_TERMINATED);
            }
        }
    }

    /// Deliver stdin to the process.
    pub async fn write(&self, input: impl Into<String>) -> Result<()> {
        match self
            .bridge
            .request(WorkerRequest::WriteInput {
                pid: self.pid,
                input: input.into(),
            })
            .await?
        {
            WorkerReply::InputWritten => Ok(()),
            _ => Err(ContainerError::UnexpectedReply),
        }
    }

    /// Terminate the process. Idempotent: the terminate request is sent
    /// once, the local mirror flips to exited(-1) immediately, and the
    /// authoritative worker exit coalesces into the same single `Exit`.
    pub async fn kill(&self) -> Result<()> {
        if !self.kill_sent.swap(true, Ordering::SeqCst) {
            if let Err(err) = self
                .bridge
                .request(WorkerRequest::Terminate { pid: self.pid })
                .await
            {
                debug!(pid = %self.pid, %err, "terminate request failed");
            }
        }
        self.complete(EXIT_CODE_TERMINATED);
        Ok(())
    }

    pub(crate) fn emit_output(&self, output: String, is_error: bool) {
        // Per-pid ordering ends at exit; anything after the mirror
        // flipped is dropped.
        if self.is_running() {
            self.push_event(ProcessEvent::Output { output, is_error });
        }
    }

    pub(crate) fn emit_error(&self, error: String) {
        if self.is_running() {
            self.push_event(ProcessEvent::Error { error });
        }
    }

    /// Record the exit code. First caller wins; duplicates (optimistic
    /// kill vs the worker's authoritative event) coalesce into one
    /// `Exit` emission.
    pub(crate) fn complete(&self, exit_code: i32) {
        let first = self.exit.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = Some(exit_code);
                true
            } else {
                false
            }
        });
        if first {
            self.push_event(ProcessEvent::Exit { exit_code });
        }
    }

    fn push_event(&self, event: ProcessEvent) {
        let mut log = self.lock_log();
        log.seq += 1;
        let seq = log.seq;
        log.entries.push_back((seq, event.clone()));
        if log.entries.len() > EVENT_HISTORY_CAP {
            log.entries.pop_front();
        }
        let _ = self.live.send((seq, event));
    }

    fn lock_log(&self) -> std::sync::MutexGuard<'_, EventLog> {
        self.log.lock().expect("event log poisoned")
    }
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("pid", &self.pid)
            .field("command", &self.command)
            .field("exit_code", &self.exit_code())
            .finish()
    }
}
