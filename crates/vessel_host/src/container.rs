//! The embedder-facing container API.
//!
//! One container owns one worker task and the bridge to it. Process
//! handles are read-through mirrors driven by the event router; the
//! container never mutates worker state except through messages.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use vessel_protocol::defaults::{
    DEFAULT_MAX_PROCESSES, DEFAULT_MEMORY_LIMIT, DEFAULT_REQUEST_TIMEOUT_MS, EXIT_CODE_TERMINATED,
};
use vessel_protocol::{
    ContainerError, ContainerStats, HttpRequest, HttpResponse, Pid, Result, SpawnOptions,
    WorkerEvent, WorkerReply, WorkerRequest,
};
use vessel_worker::runtime::RuntimeFactory;
use vessel_worker::Worker;

use crate::bridge::WorkerBridge;
use crate::process::ProcessHandle;

const NETWORK_EVENT_CAPACITY: usize = 64;
/// Bound on events buffered for a pid whose handle is not registered yet.
const EVENT_BUFFER_CAP: usize = 256;

/// Embedder-facing container options.
#[derive(Debug, Clone)]
pub struct ContainerOptions {
    pub debug: bool,
    pub max_processes: usize,
    pub memory_limit: u64,
    pub request_timeout: Duration,
}

impl Default for ContainerOptions {
    fn default() -> Self {
        Self {
            debug: false,
            max_processes: DEFAULT_MAX_PROCESSES,
            memory_limit: DEFAULT_MEMORY_LIMIT,
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
        }
    }
}

/// Server lifecycle events observable by the embedder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkEvent {
    Listen { port: u16 },
    Close { port: u16 },
    Error { port: u16, message: String },
}

#[derive(Default)]
struct RouterState {
    handles: HashMap<Pid, Arc<ProcessHandle>>,
    buffered: HashMap<Pid, Vec<WorkerEvent>>,
    /// Spawn slots claimed before their pid is known. Counted by the
    /// process-limit gate so concurrent spawns cannot overshoot it.
    reserved: usize,
}

/// One claimed spawn slot. Dropping it (spawn failed or was cancelled
/// mid-flight) releases the slot; a successful spawn releases it under
/// the same lock that registers the handle.
struct SlotReservation {
    state: Arc<Mutex<RouterState>>,
}

impl SlotReservation {
    /// Release under a lock the caller already holds, so the handle
    /// insert and the release are one atomic step for the gate.
    fn release(self, state: &mut RouterState) {
        state.reserved = state.reserved.saturating_sub(1);
        std::mem::forget(self);
    }
}

impl Drop for SlotReservation {
    fn drop(&mut self) {
        let mut state = self.state.lock().expect("router state poisoned");
        state.reserved = state.reserved.saturating_sub(1);
    }
}

/// The pair (host supervisor, worker sandbox) with one message channel.
pub struct Container {
    options: ContainerOptions,
    bridge: Arc<WorkerBridge>,
    state: Arc<Mutex<RouterState>>,
    network_events: broadcast::Sender<NetworkEvent>,
    disposed: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
    router: Mutex<Option<JoinHandle<()>>>,
}

impl Container {
    /// Boot a container: spawn the worker task, wire the bridge, and
    /// perform the latched initialize round trip. A failure tears the
    /// worker down and surfaces as the error.
    pub async fn start(
        options: ContainerOptions,
        runtime_factory: Arc<dyn RuntimeFactory>,
    ) -> Result<Self> {
        let (host_tx, worker_rx) = mpsc::unbounded_channel();
        let (worker_tx, host_rx) = mpsc::unbounded_channel();

        let worker = Worker::spawn(worker_rx, worker_tx, runtime_factory);
        let bridge = Arc::new(WorkerBridge::new(host_tx, host_rx, options.request_timeout));

        let state = Arc::new(Mutex::new(RouterState::default()));
        let (network_events, _) = broadcast::channel(NETWORK_EVENT_CAPACITY);
        let router = Self::spawn_router(
            bridge.subscribe(),
            Arc::clone(&state),
            network_events.clone(),
        );

        let container = Self {
            options: options.clone(),
            bridge,
            state,
            network_events,
            disposed: AtomicBool::new(false),
            worker: Mutex::new(Some(worker)),
            router: Mutex::new(Some(router)),
        };

        match container
            .bridge
            .request(WorkerRequest::Initialize {
                debug: options.debug,
                memory_limit: Some(options.memory_limit),
            })
            .await
        {
            Ok(WorkerReply::Initialized) => {
                info!("container initialized");
                Ok(container)
            }
            Ok(_) => {
                container.dispose().await;
                Err(ContainerError::UnexpectedReply)
            }
            Err(err) => {
                container.dispose().await;
                Err(err)
            }
        }
    }

    fn spawn_router(
        mut events: broadcast::Receiver<WorkerEvent>,
        state: Arc<Mutex<RouterState>>,
        network_events: broadcast::Sender<NetworkEvent>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => route_event(&state, &network_events, event),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "event router lagged; process mirrors may be stale");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    pub fn options(&self) -> &ContainerOptions {
        &self.options
    }

    /// Start a process. The handle is registered before this returns,
    /// so no event can be missed by the caller.
    pub async fn spawn(
        &self,
        command: impl Into<String>,
        args: Vec<String>,
    ) -> Result<Arc<ProcessHandle>> {
        self.spawn_with(command, args, SpawnOptions::default()).await
    }

    pub async fn spawn_with(
        &self,
        command: impl Into<String>,
        args: Vec<String>,
        options: SpawnOptions,
    ) -> Result<Arc<ProcessHandle>> {
        self.ensure_live()?;
        let command = command.into();

        // Claim a slot before the worker round trip; concurrent spawns
        // racing past the count check would otherwise all pass the gate.
        let reservation = self.reserve_slot()?;

        let reply = self
            .bridge
            .request(WorkerRequest::Spawn {
                command: command.clone(),
                args: args.clone(),
                options,
            })
            .await;

        match reply {
            Ok(WorkerReply::Spawned { pid, .. }) => {
                let handle = Arc::new(ProcessHandle::new(
                    pid,
                    command,
                    args,
                    Arc::clone(&self.bridge),
                ));
                let mut state = self.lock_state();
                reservation.release(&mut state);
                state.handles.insert(pid, Arc::clone(&handle));
                // Replay anything that raced ahead of registration.
                if let Some(buffered) = state.buffered.remove(&pid) {
                    for event in buffered {
                        apply_process_event(&mut state, event);
                    }
                }
                Ok(handle)
            }
            Ok(_) => Err(ContainerError::UnexpectedReply),
            Err(ContainerError::Worker(message)) => Err(ContainerError::SpawnFailed(message)),
            Err(err) => Err(err),
        }
    }

    /// Atomically check the process-limit gate and claim a spawn slot.
    fn reserve_slot(&self) -> Result<SlotReservation> {
        let mut state = self.lock_state();
        if state.handles.len() + state.reserved >= self.options.max_processes {
            return Err(ContainerError::MaxProcesses {
                limit: self.options.max_processes,
            });
        }
        state.reserved += 1;
        Ok(SlotReservation {
            state: Arc::clone(&self.state),
        })
    }

    /// Handle for a pid still tracked by this container.
    pub fn process(&self, pid: Pid) -> Option<Arc<ProcessHandle>> {
        self.lock_state().handles.get(&pid).cloned()
    }

    /// Snapshot of active handles.
    pub fn processes(&self) -> Vec<Arc<ProcessHandle>> {
        let mut handles: Vec<_> = self.lock_state().handles.values().cloned().collect();
        handles.sort_by_key(|handle| handle.pid());
        handles
    }

    pub fn process_count(&self) -> usize {
        self.lock_state().handles.len()
    }

    /// Worker-reported stats.
    pub async fn stats(&self) -> Result<ContainerStats> {
        self.ensure_live()?;
        match self.bridge.request(WorkerRequest::GetStats).await? {
            WorkerReply::Stats { stats } => Ok(stats),
            _ => Err(ContainerError::UnexpectedReply),
        }
    }

    /// Inject an HTTP request targeting a virtual port.
    pub async fn fetch(&self, request: HttpRequest, port: u16) -> Result<HttpResponse> {
        self.ensure_live()?;
        match self
            .bridge
            .request(WorkerRequest::HttpRequest { request, port })
            .await?
        {
            WorkerReply::HttpResponse { response, .. } => Ok(response),
            _ => Err(ContainerError::UnexpectedReply),
        }
    }

    /// Ports with running virtual servers.
    pub async fn servers(&self) -> Result<Vec<u16>> {
        self.ensure_live()?;
        match self.bridge.request(WorkerRequest::ListServers).await? {
            WorkerReply::ServerList { ports } => Ok(ports),
            _ => Err(ContainerError::UnexpectedReply),
        }
    }

    pub async fn write_file(&self, path: &str, content: &str) -> Result<()> {
        self.ensure_live()?;
        match self
            .bridge
            .request(WorkerRequest::WriteFile {
                path: path.to_string(),
                content: content.to_string(),
            })
            .await?
        {
            WorkerReply::FileWritten => Ok(()),
            _ => Err(ContainerError::UnexpectedReply),
        }
    }

    pub async fn read_file(&self, path: &str) -> Result<String> {
        self.ensure_live()?;
        match self
            .bridge
            .request(WorkerRequest::ReadFile {
                path: path.to_string(),
            })
            .await?
        {
            WorkerReply::FileRead { content } => Ok(content),
            _ => Err(ContainerError::UnexpectedReply),
        }
    }

    pub async fn delete_file(&self, path: &str, recursive: bool) -> Result<()> {
        self.ensure_live()?;
        match self
            .bridge
            .request(WorkerRequest::DeleteFile {
                path: path.to_string(),
                recursive,
            })
            .await?
        {
            WorkerReply::FileDeleted => Ok(()),
            _ => Err(ContainerError::UnexpectedReply),
        }
    }

    pub async fn list_files(&self, path: Option<&str>) -> Result<Vec<String>> {
        self.ensure_live()?;
        match self
            .bridge
            .request(WorkerRequest::ListFiles {
                path: path.map(str::to_string),
            })
            .await?
        {
            WorkerReply::FileList { files } => Ok(files),
            _ => Err(ContainerError::UnexpectedReply),
        }
    }

    pub async fn create_directory(&self, path: &str) -> Result<()> {
        self.ensure_live()?;
        match self
            .bridge
            .request(WorkerRequest::CreateDirectory {
                path: path.to_string(),
            })
            .await?
        {
            WorkerReply::DirectoryCreated => Ok(()),
            _ => Err(ContainerError::UnexpectedReply),
        }
    }

    pub async fn list_directory(&self, path: &str) -> Result<Vec<String>> {
        self.ensure_live()?;
        match self
            .bridge
            .request(WorkerRequest::ListDirectory {
                path: path.to_string(),
            })
            .await?
        {
            WorkerReply::DirectoryList { entries } => Ok(entries),
            _ => Err(ContainerError::UnexpectedReply),
        }
    }

    pub async fn delete_directory(&self, path: &str) -> Result<()> {
        self.ensure_live()?;
        match self
            .bridge
            .request(WorkerRequest::DeleteDirectory {
                path: path.to_string(),
            })
            .await?
        {
            WorkerReply::DirectoryDeleted => Ok(()),
            _ => Err(ContainerError::UnexpectedReply),
        }
    }

    /// Subscribe to server lifecycle events.
    pub fn network_events(&self) -> broadcast::Receiver<NetworkEvent> {
        self.network_events.subscribe()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Tear the container down. Idempotent. After this resolves, every
    /// public call rejects with "disposed" and the worker task is gone.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("disposing container");

        let handles: Vec<Arc<ProcessHandle>> = {
            let mut state = self.lock_state();
            state.buffered.clear();
            state.handles.drain().map(|(_, handle)| handle).collect()
        };
        for handle in handles {
            handle.complete(EXIT_CODE_TERMINATED);
        }

        // Rejects pendings with "worker disposed", then a best-effort
        // dispose round trip.
        self.bridge.dispose().await;

        if let Some(router) = self.router.lock().expect("router slot poisoned").take() {
            router.abort();
        }
        if let Some(worker) = self.worker.lock().expect("worker slot poisoned").take() {
            worker.abort();
        }
    }

    fn ensure_live(&self) -> Result<()> {
        if self.is_disposed() {
            return Err(ContainerError::Disposed);
        }
        Ok(())
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, RouterState> {
        self.state.lock().expect("router state poisoned")
    }
}

fn route_event(
    state: &Mutex<RouterState>,
    network_events: &broadcast::Sender<NetworkEvent>,
    event: WorkerEvent,
) {
    match event {
        WorkerEvent::ServerListen { port } => {
            let _ = network_events.send(NetworkEvent::Listen { port });
        }
        WorkerEvent::ServerClose { port } => {
            let _ = network_events.send(NetworkEvent::Close { port });
        }
        WorkerEvent::NetworkError { port, error, .. } => {
            let _ = network_events.send(NetworkEvent::Error {
                port,
                message: error,
            });
        }
        other => {
            let mut state = state.lock().expect("router state poisoned");
            apply_process_event(&mut state, other);
        }
    }
}

/// Deliver one process-scoped event to its handle, buffering when the
/// handle has not registered yet (the reply/event race at spawn).
fn apply_process_event(state: &mut RouterState, event: WorkerEvent) {
    let Some(pid) = event.pid() else { return };
    let Some(handle) = state.handles.get(&pid).cloned() else {
        let buffered = state.buffered.entry(pid).or_default();
        if buffered.len() < EVENT_BUFFER_CAP {
            buffered.push(event);
        } else {
            debug!(%pid, "event buffer full; dropping event for unregistered pid");
        }
        return;
    };

    match event {
        WorkerEvent::ProcessOutput {
            output, is_error, ..
        } => handle.emit_output(output, is_error),
        WorkerEvent::ProcessError { error, .. } => handle.emit_error(error),
        WorkerEvent::ProcessExit { exit_code, .. } => {
            handle.complete(exit_code);
            state.handles.remove(&pid);
        }
        _ => {}
    }
}
