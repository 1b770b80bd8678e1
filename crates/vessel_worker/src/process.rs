//! Process table: pid allocation and per-process bookkeeping.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use thiserror::Error;
use tokio::sync::mpsc;
use vessel_protocol::{Pid, ProcessKind, ProcessSnapshot, ProcessState};

use crate::cancel::CancelToken;
use crate::http_bridge::HttpBridge;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProcessError {
    #[error("No process with pid {0}")]
    NotFound(Pid),

    #[error("Process {0} does not accept input")]
    InputClosed(Pid),
}

/// Worker-side record of one live process.
#[derive(Debug)]
pub struct ProcessEntry {
    pub pid: Pid,
    pub kind: ProcessKind,
    pub state: ProcessState,
    pub command: String,
    pub args: Vec<String>,
    pub started_at: Instant,
    pub stdin: mpsc::UnboundedSender<String>,
    pub cancel: CancelToken,
    /// Present for script processes; the inbound half lives in the
    /// executor loop.
    pub http: Option<Arc<HttpBridge>>,
}

/// Table of live processes. Entries are removed once the executor has
/// finished and the exit event has been recorded.
#[derive(Debug)]
pub struct ProcessTable {
    next_pid: AtomicU32,
    entries: Mutex<HashMap<Pid, ProcessEntry>>,
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTable {
    pub fn new() -> Self {
        Self {
            next_pid: AtomicU32::new(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Allocate the next pid. Monotonic from 1, never reused.
    pub fn allocate(&self) -> Pid {
        Pid::new(self.next_pid.fetch_add(1, Ordering::SeqCst))
    }

    pub fn insert(&self, entry: ProcessEntry) {
        self.lock().insert(entry.pid, entry);
    }

    pub fn set_running(&self, pid: Pid) {
        if let Some(entry) = self.lock().get_mut(&pid) {
            entry.state = ProcessState::Running;
        }
    }

    pub fn remove(&self, pid: Pid) -> Option<ProcessEntry> {
        self.lock().remove(&pid)
    }

    pub fn count(&self) -> usize {
        self.lock().len()
    }

    pub fn pids(&self) -> Vec<Pid> {
        self.lock().keys().copied().collect()
    }

    pub fn contains(&self, pid: Pid) -> bool {
        self.lock().contains_key(&pid)
    }

    /// Request cooperative termination.
    pub fn cancel(&self, pid: Pid) -> Result<(), ProcessError> {
        let entries = self.lock();
        let entry = entries.get(&pid).ok_or(ProcessError::NotFound(pid))?;
        entry.cancel.cancel();
        Ok(())
    }

    /// Deliver stdin to a process's executor.
    pub fn write_input(&self, pid: Pid, input: &str) -> Result<(), ProcessError> {
        let entries = self.lock();
        let entry = entries.get(&pid).ok_or(ProcessError::NotFound(pid))?;
        entry
            .stdin
            .send(input.to_string())
            .map_err(|_| ProcessError::InputClosed(pid))
    }

    /// The HTTP bridge of a script-capable process.
    pub fn http_bridge(&self, pid: Pid) -> Option<Arc<HttpBridge>> {
        self.lock().get(&pid).and_then(|entry| entry.http.clone())
    }

    pub fn snapshot(&self) -> Vec<ProcessSnapshot> {
        let mut processes: Vec<ProcessSnapshot> = self
            .lock()
            .values()
            .map(|entry| ProcessSnapshot {
                pid: entry.pid,
                kind: entry.kind,
                state: entry.state,
                command: entry.command.clone(),
                uptime_ms: entry.started_at.elapsed().as_millis() as u64,
            })
            .collect();
        processes.sort_by_key(|snapshot| snapshot.pid);
        processes
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Pid, ProcessEntry>> {
        self.entries.lock().expect("process table poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(table: &ProcessTable) -> (ProcessEntry, mpsc::UnboundedReceiver<String>) {
        let (stdin, stdin_rx) = mpsc::unbounded_channel();
        let pid = table.allocate();
        (
            ProcessEntry {
                pid,
                kind: ProcessKind::Shell,
                state: ProcessState::Created,
                command: "echo".to_string(),
                args: vec![],
                started_at: Instant::now(),
                stdin,
                cancel: CancelToken::new(),
                http: None,
            },
            stdin_rx,
        )
    }

    #[test]
    fn pids_are_monotonic_from_one() {
        let table = ProcessTable::new();
        assert_eq!(table.allocate(), Pid::new(1));
        assert_eq!(table.allocate(), Pid::new(2));
        assert_eq!(table.allocate(), Pid::new(3));
    }

    #[test]
    fn write_input_reaches_the_stdin_sink() {
        let table = ProcessTable::new();
        let (entry, mut stdin_rx) = entry(&table);
        let pid = entry.pid;
        table.insert(entry);

        table.write_input(pid, "hello").unwrap();
        assert_eq!(stdin_rx.try_recv().unwrap(), "hello");

        assert_eq!(
            table.write_input(Pid::new(99), "x"),
            Err(ProcessError::NotFound(Pid::new(99)))
        );
    }

    #[test]
    fn cancel_flips_the_token() {
        let table = ProcessTable::new();
        let (entry, _stdin_rx) = entry(&table);
        let pid = entry.pid;
        let token = entry.cancel.clone();
        table.insert(entry);

        table.cancel(pid).unwrap();
        assert!(token.is_cancelled());
    }

    #[test]
    fn snapshot_reports_live_processes_in_pid_order() {
        let table = ProcessTable::new();
        let (a, _rx_a) = entry(&table);
        let (b, _rx_b) = entry(&table);
        let (pid_a, pid_b) = (a.pid, b.pid);
        table.insert(a);
        table.insert(b);
        table.set_running(pid_b);

        let snapshot = table.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].pid, pid_a);
        assert_eq!(snapshot[0].state, ProcessState::Created);
        assert_eq!(snapshot[1].state, ProcessState::Running);

        table.remove(pid_a);
        assert_eq!(table.count(), 1);
    }
}
