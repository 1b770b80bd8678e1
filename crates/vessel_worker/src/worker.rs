//! Worker dispatcher: the untrusted domain's message pump.
//!
//! Single task draining host frames in arrival order. Every correlated
//! request gets exactly one reply echoing its id (the success variant or
//! `error`); subsystem events are forwarded id-less as they arrive. HTTP
//! injections are handled concurrently so a slow sandbox handler never
//! stalls the pump.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use vessel_protocol::defaults::{
    DEFAULT_MEMORY_LIMIT, EXIT_CODE_TERMINATED, REQUEST_LOG_CLEANUP_SECS,
};
use vessel_protocol::{
    ContainerStats, HostFrame, Pid, ProcessKind, ProcessState, RequestId, SpawnOptions,
    WorkerFrame, WorkerReply, WorkerRequest,
};

use crate::cancel::CancelToken;
use crate::events::EventSink;
use crate::executor::{ExecContext, ExecutorRegistry, HttpChannel};
use crate::fs::{FileSystem, SharedFs};
use crate::http_bridge::HttpBridge;
use crate::net::NetworkManager;
use crate::process::{ProcessEntry, ProcessTable};
use crate::runtime::{RuntimeFactory, ScriptExecutor};
use crate::shell::ShellExecutor;

/// Latched by `initialize`.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub debug: bool,
    pub memory_limit: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            debug: false,
            memory_limit: DEFAULT_MEMORY_LIMIT,
        }
    }
}

/// The untrusted execution domain.
pub struct Worker {
    rx: mpsc::UnboundedReceiver<HostFrame>,
    tx: mpsc::UnboundedSender<WorkerFrame>,
    events_rx: mpsc::UnboundedReceiver<vessel_protocol::WorkerEvent>,
    events: EventSink,
    table: Arc<ProcessTable>,
    registry: ExecutorRegistry,
    fs: SharedFs,
    net: Arc<NetworkManager>,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(
        rx: mpsc::UnboundedReceiver<HostFrame>,
        tx: mpsc::UnboundedSender<WorkerFrame>,
        runtime_factory: Arc<dyn RuntimeFactory>,
    ) -> Self {
        let (events, events_rx) = EventSink::channel();
        let net = Arc::new(NetworkManager::new(events.clone()));
        let mut registry = ExecutorRegistry::new();
        registry.register(Arc::new(ShellExecutor));
        registry.register(Arc::new(ScriptExecutor::new(runtime_factory, Arc::clone(&net))));
        Self {
            rx,
            tx,
            events_rx,
            events,
            table: Arc::new(ProcessTable::new()),
            registry,
            fs: FileSystem::shared(),
            net,
            config: WorkerConfig::default(),
        }
    }

    /// Spawn the worker onto its own task.
    pub fn spawn(
        rx: mpsc::UnboundedReceiver<HostFrame>,
        tx: mpsc::UnboundedSender<WorkerFrame>,
        runtime_factory: Arc<dyn RuntimeFactory>,
    ) -> JoinHandle<()> {
        tokio::spawn(Self::new(rx, tx, runtime_factory).run())
    }

    /// Main event loop. Ends on `dispose` or when the host hangs up.
    pub async fn run(mut self) {
        info!("worker event loop starting");
        let mut cleanup = tokio::time::interval(Duration::from_secs(REQUEST_LOG_CLEANUP_SECS));
        cleanup.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick completes immediately.
        cleanup.tick().await;

        loop {
            tokio::select! {
                frame = self.rx.recv() => {
                    let Some(frame) = frame else { break };
                    if !self.handle_frame(frame) {
                        break;
                    }
                }
                event = self.events_rx.recv() => {
                    // The worker holds a sender, so the channel cannot close here.
                    if let Some(event) = event {
                        let _ = self.tx.send(WorkerFrame::Event { event });
                    }
                }
                _ = cleanup.tick() => {
                    self.net.prune_request_log();
                }
            }
        }
        info!("worker event loop stopped");
    }

    /// Returns false once the pump should stop.
    fn handle_frame(&mut self, frame: HostFrame) -> bool {
        let HostFrame { id, request } = frame;
        debug!(id, op = request.op(), "request");
        match request {
            WorkerRequest::HttpRequest { request, port } => {
                // Handled off the pump; the reply is correlated by id and
                // may complete out of submission order.
                let net = Arc::clone(&self.net);
                let table = Arc::clone(&self.table);
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    let response = net.handle_request(&table, request, port).await;
                    let _ = tx.send(WorkerFrame::Reply {
                        id,
                        reply: WorkerReply::HttpResponse { response, port },
                    });
                });
                true
            }
            WorkerRequest::Dispose => {
                self.dispose_all();
                self.reply(id, WorkerReply::Disposed);
                false
            }
            other => {
                let reply = self.dispatch(other);
                self.reply(id, reply);
                true
            }
        }
    }

    fn reply(&self, id: RequestId, reply: WorkerReply) {
        let _ = self.tx.send(WorkerFrame::Reply { id, reply });
    }

    fn dispatch(&mut self, request: WorkerRequest) -> WorkerReply {
        match request {
            WorkerRequest::Initialize {
                debug: debug_flag,
                memory_limit,
            } => {
                self.config = WorkerConfig {
                    debug: debug_flag,
                    memory_limit: memory_limit.unwrap_or(DEFAULT_MEMORY_LIMIT),
                };
                info!(debug = debug_flag, memory_limit = self.config.memory_limit, "initialized");
                WorkerReply::Initialized
            }
            WorkerRequest::Spawn {
                command,
                args,
                options,
            } => match self.spawn_process(command.clone(), args, options) {
                Ok(pid) => WorkerReply::Spawned { pid, command },
                Err(err) => WorkerReply::error(err),
            },
            WorkerRequest::WriteInput { pid, input } => {
                match self.table.write_input(pid, &input) {
                    Ok(()) => WorkerReply::InputWritten,
                    Err(err) => WorkerReply::error(err),
                }
            }
            WorkerRequest::Terminate { pid } => match self.table.cancel(pid) {
                Ok(()) => WorkerReply::Terminated {
                    pid,
                    exit_code: EXIT_CODE_TERMINATED,
                },
                Err(err) => WorkerReply::error(err),
            },
            WorkerRequest::GetStats => {
                let memory_bytes = self.fs.lock().expect("filesystem poisoned").total_bytes();
                if memory_bytes > self.config.memory_limit {
                    warn!(
                        memory_bytes,
                        limit = self.config.memory_limit,
                        "soft memory hint exceeded"
                    );
                }
                WorkerReply::Stats {
                    stats: ContainerStats {
                        processes: self.table.snapshot(),
                        network: self.net.network_stats(),
                    },
                }
            }
            WorkerRequest::WriteFile { path, content } => {
                let mut fs = self.fs.lock().expect("filesystem poisoned");
                match fs.write_file(&path, &content) {
                    Ok(()) => WorkerReply::FileWritten,
                    Err(err) => WorkerReply::error(err),
                }
            }
            WorkerRequest::ReadFile { path } => {
                let fs = self.fs.lock().expect("filesystem poisoned");
                match fs.read_file(&path) {
                    Ok(content) => WorkerReply::FileRead { content },
                    Err(err) => WorkerReply::error(err),
                }
            }
            WorkerRequest::DeleteFile { path, recursive } => {
                let mut fs = self.fs.lock().expect("filesystem poisoned");
                match fs.delete_file(&path, recursive) {
                    Ok(()) => WorkerReply::FileDeleted,
                    Err(err) => WorkerReply::error(err),
                }
            }
            WorkerRequest::ListFiles { path } => {
                let fs = self.fs.lock().expect("filesystem poisoned");
                match fs.list_files(path.as_deref()) {
                    Ok(files) => WorkerReply::FileList { files },
                    Err(err) => WorkerReply::error(err),
                }
            }
            WorkerRequest::CreateDirectory { path } => {
                let mut fs = self.fs.lock().expect("filesystem poisoned");
                match fs.create_directory(&path) {
                    Ok(()) => WorkerReply::DirectoryCreated,
                    Err(err) => WorkerReply::error(err),
                }
            }
            WorkerRequest::ListDirectory { path } => {
                let fs = self.fs.lock().expect("filesystem poisoned");
                match fs.list_directory(&path) {
                    Ok(entries) => WorkerReply::DirectoryList { entries },
                    Err(err) => WorkerReply::error(err),
                }
            }
            WorkerRequest::DeleteDirectory { path } => {
                let mut fs = self.fs.lock().expect("filesystem poisoned");
                match fs.delete_directory(&path) {
                    Ok(()) => WorkerReply::DirectoryDeleted,
                    Err(err) => WorkerReply::error(err),
                }
            }
            WorkerRequest::ListServers => WorkerReply::ServerList {
                ports: self.net.running_ports(),
            },
            // Handled before dispatch.
            WorkerRequest::HttpRequest { .. } | WorkerRequest::Dispose => {
                unreachable!("handled in handle_frame")
            }
        }
    }

    fn spawn_process(
        &self,
        command: String,
        args: Vec<String>,
        options: SpawnOptions,
    ) -> Result<Pid, String> {
        let executor = self
            .registry
            .find(&command)
            .ok_or_else(|| format!("no executor for command '{}'", command))?;

        let pid = self.table.allocate();
        let (stdin_tx, stdin_rx) = mpsc::unbounded_channel();
        let cancel = CancelToken::new();
        let kind = executor.kind();

        let (bridge, http_channel) = if kind == ProcessKind::Script {
            let (bridge, inbound) = HttpBridge::channel(pid);
            (
                Some(Arc::clone(&bridge)),
                Some(HttpChannel { bridge, inbound }),
            )
        } else {
            (None, None)
        };

        self.table.insert(ProcessEntry {
            pid,
            kind,
            state: ProcessState::Created,
            command: command.clone(),
            args: args.clone(),
            started_at: Instant::now(),
            stdin: stdin_tx,
            cancel: cancel.clone(),
            http: bridge,
        });

        let ctx = ExecContext {
            pid,
            command: command.clone(),
            args,
            cwd: vessel_protocol::paths::normalize(&options.cwd),
            env: options.env,
            fs: Arc::clone(&self.fs),
            events: self.events.clone(),
            stdin: stdin_rx,
            cancel,
            http: http_channel,
        };

        let future = executor.launch(ctx);
        self.table.set_running(pid);
        info!(%pid, %command, "process started");

        let table = Arc::clone(&self.table);
        let net = Arc::clone(&self.net);
        let events = self.events.clone();
        tokio::spawn(async move {
            let exit_code = future.await;
            // Exit bookkeeping: table entry out, servers gone, then the
            // single exit event for this pid.
            table.remove(pid);
            net.unregister_process(pid);
            events.exit(pid, exit_code);
            debug!(%pid, exit_code, "process finished");
        });

        Ok(pid)
    }

    fn dispose_all(&self) {
        info!("disposing worker");
        for pid in self.table.pids() {
            let _ = self.table.cancel(pid);
        }
    }
}
