//! Script runtime seam and the executor that drives it.
//!
//! The concrete scripting engine is an opaque capability injected by the
//! embedder as a [`RuntimeFactory`]. The worker gives each runtime a
//! [`SandboxHooks`] handle (output, server registration, connections)
//! and feeds it stdin and inbound HTTP requests; everything else about
//! program evaluation is the engine's business.

use std::sync::Arc;
use thiserror::Error;
use tracing::debug;
use vessel_protocol::defaults::EXIT_CODE_TERMINATED;
use vessel_protocol::{paths, Pid, ProcessKind, ServerId, ServerKind, ServerOptions};

use crate::events::EventSink;
use crate::executor::{ExecContext, ExecFuture, Executor, HttpChannel};
use crate::http_bridge::{HttpBridge, IncomingRequest, ResponseWriter};
use crate::net::{NetError, NetworkManager};
use crate::sock::{socket_pair, VirtualSocket};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    /// Evaluation failure inside the engine; surfaced as `processError`.
    #[error("{0}")]
    Evaluation(String),

    /// The program never bound a handler for this port.
    #[error("no handler bound to port {0}")]
    NoHandler(u16),
}

/// Capability handle the engine uses to reach out of the sandbox.
pub struct SandboxHooks {
    pid: Pid,
    events: EventSink,
    net: Arc<NetworkManager>,
    bridge: Arc<HttpBridge>,
}

impl SandboxHooks {
    pub fn new(
        pid: Pid,
        events: EventSink,
        net: Arc<NetworkManager>,
        bridge: Arc<HttpBridge>,
    ) -> Self {
        Self {
            pid,
            events,
            net,
            bridge,
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Emit program output (stdout when `is_error` is false).
    pub fn emit(&self, output: impl Into<String>, is_error: bool) {
        self.events.output(self.pid, output, is_error);
    }

    /// Bind an HTTP server on `port`. Registers with the network manager
    /// and marks the port serveable on this process's bridge.
    pub fn listen(&self, port: u16, options: ServerOptions) -> Result<(), NetError> {
        self.listen_kind(ServerKind::Http, port, options)
    }

    /// Bind a server of an arbitrary kind on `port`.
    pub fn listen_kind(
        &self,
        kind: ServerKind,
        port: u16,
        options: ServerOptions,
    ) -> Result<(), NetError> {
        self.net
            .register_server(self.pid, ServerId::new(kind, port), options)?;
        if kind == ServerKind::Http {
            self.bridge.bind_port(port);
        }
        Ok(())
    }

    /// Close a previously bound server.
    pub fn close(&self, kind: ServerKind, port: u16) {
        self.net.unregister_server(ServerId::new(kind, port));
        if kind == ServerKind::Http {
            self.bridge.unbind_port(port);
        }
    }

    /// Open a tracked connection to a server this sandbox bound.
    ///
    /// Both socket ends stay inside the sandbox; traffic never leaves
    /// the host.
    pub fn connect(&self, kind: ServerKind, port: u16) -> Result<VirtualConnection, NetError> {
        let id = ServerId::new(kind, port);
        let connection = self.net.open_connection(id)?;
        let (client, server) = socket_pair();
        Ok(VirtualConnection {
            client,
            server,
            guard: ConnectionGuard {
                net: Arc::clone(&self.net),
                connection,
            },
        })
    }
}

/// A tracked in-sandbox connection; untracked on drop.
pub struct VirtualConnection {
    pub client: VirtualSocket,
    pub server: VirtualSocket,
    #[allow(dead_code)]
    guard: ConnectionGuard,
}

struct ConnectionGuard {
    net: Arc<NetworkManager>,
    connection: u64,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.net.close_connection(self.connection);
    }
}

/// The opaque scripting engine contract.
///
/// Calls arrive from a single task, in order: `start` once, then any
/// interleaving of `stdin` and `handle_request`, then `shutdown`.
pub trait ScriptRuntime: Send {
    /// Load and evaluate the program. Server registrations happen here
    /// through the hooks.
    fn start(&mut self, source: &str, hooks: &SandboxHooks) -> Result<(), RuntimeError>;

    /// Deliver one chunk of stdin.
    fn stdin(&mut self, input: &str, hooks: &SandboxHooks) -> Result<(), RuntimeError> {
        let _ = (input, hooks);
        Ok(())
    }

    /// Deliver an inbound HTTP request to the handler bound to the
    /// request's port. The handler resolves by calling `response.end`.
    fn handle_request(
        &mut self,
        request: IncomingRequest,
        response: ResponseWriter,
        hooks: &SandboxHooks,
    ) -> Result<(), RuntimeError>;

    /// True once the program has nothing left to do. A runtime with
    /// live servers should return false so the process stays up.
    fn idle(&self) -> bool;

    fn shutdown(&mut self) {}
}

/// Creates one engine instance per script process.
pub trait RuntimeFactory: Send + Sync {
    fn create(&self) -> Box<dyn ScriptRuntime>;
}

/// Factory for embedders without a scripting engine; every script spawn
/// fails with a process error.
pub struct NullRuntimeFactory;

impl RuntimeFactory for NullRuntimeFactory {
    fn create(&self) -> Box<dyn ScriptRuntime> {
        Box::new(NullRuntime)
    }
}

struct NullRuntime;

impl ScriptRuntime for NullRuntime {
    fn start(&mut self, _source: &str, _hooks: &SandboxHooks) -> Result<(), RuntimeError> {
        Err(RuntimeError::Evaluation(
            "no script runtime installed".to_string(),
        ))
    }

    fn handle_request(
        &mut self,
        request: IncomingRequest,
        _response: ResponseWriter,
        _hooks: &SandboxHooks,
    ) -> Result<(), RuntimeError> {
        Err(RuntimeError::NoHandler(
            vessel_protocol::http::port_from_url(&request.url),
        ))
    }

    fn idle(&self) -> bool {
        true
    }
}

/// Executor for script processes (`node <file>` or a bare `*.js` path).
pub struct ScriptExecutor {
    factory: Arc<dyn RuntimeFactory>,
    net: Arc<NetworkManager>,
}

impl ScriptExecutor {
    pub fn new(factory: Arc<dyn RuntimeFactory>, net: Arc<NetworkManager>) -> Self {
        Self { factory, net }
    }
}

impl Executor for ScriptExecutor {
    fn kind(&self) -> ProcessKind {
        ProcessKind::Script
    }

    fn matches(&self, command: &str) -> bool {
        command == "node" || command.ends_with(".js")
    }

    fn launch(&self, ctx: ExecContext) -> ExecFuture {
        let factory = Arc::clone(&self.factory);
        let net = Arc::clone(&self.net);
        Box::pin(run_script(factory, net, ctx))
    }
}

async fn run_script(
    factory: Arc<dyn RuntimeFactory>,
    net: Arc<NetworkManager>,
    mut ctx: ExecContext,
) -> i32 {
    let Some(HttpChannel {
        bridge,
        mut inbound,
    }) = ctx.http.take()
    else {
        ctx.events
            .process_error(ctx.pid, "script process launched without http channel");
        return 1;
    };

    let program = if ctx.command == "node" {
        match ctx.args.first() {
            Some(path) => path.clone(),
            None => {
                ctx.events
                    .process_error(ctx.pid, "node: missing script path");
                return 1;
            }
        }
    } else {
        ctx.command.clone()
    };
    let path = paths::join(&ctx.cwd, &program);

    let source = {
        let fs = ctx.fs.lock().expect("filesystem poisoned");
        match fs.read_file(&path) {
            Ok(source) => source,
            Err(err) => {
                ctx.events.process_error(ctx.pid, err.to_string());
                return 1;
            }
        }
    };

    let hooks = SandboxHooks::new(
        ctx.pid,
        ctx.events.clone(),
        net,
        Arc::clone(&bridge),
    );
    let mut runtime = factory.create();

    if let Err(err) = runtime.start(&source, &hooks) {
        ctx.events.process_error(ctx.pid, err.to_string());
        runtime.shutdown();
        return 1;
    }

    let cancel = ctx.cancel.clone();
    let mut stdin_open = true;
    loop {
        if runtime.idle() && !bridge.has_ports() {
            break;
        }
        tokio::select! {
            _ = cancel.cancelled() => {
                runtime.shutdown();
                return EXIT_CODE_TERMINATED;
            }
            input = ctx.stdin.recv(), if stdin_open => {
                match input {
                    Some(input) => {
                        if let Err(err) = runtime.stdin(&input, &hooks) {
                            ctx.events.process_error(ctx.pid, err.to_string());
                        }
                    }
                    // Stdin gone; keep serving.
                    None => stdin_open = false,
                }
            }
            request = inbound.recv() => {
                let Some(request) = request else { break };
                debug!(pid = %ctx.pid, url = %request.request.url, "dispatching request into sandbox");
                // A handler error drops the responder, which the bridge
                // maps to a 500 on the injector's side.
                if let Err(err) = runtime.handle_request(request.request, request.responder, &hooks) {
                    ctx.events.process_error(ctx.pid, err.to_string());
                }
            }
        }
    }

    runtime.shutdown();
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelToken;
    use crate::fs::FileSystem;
    use std::collections::HashMap;
    use tokio::sync::mpsc;
    use vessel_protocol::{HttpRequest, WorkerEvent};

    /// Engine that binds the port named in the source ("listen <port>")
    /// and answers every request with 200 "ok".
    struct FixtureRuntime {
        serving: bool,
    }

    impl ScriptRuntime for FixtureRuntime {
        fn start(&mut self, source: &str, hooks: &SandboxHooks) -> Result<(), RuntimeError> {
            if let Some(port) = source
                .strip_prefix("listen ")
                .and_then(|rest| rest.trim().parse::<u16>().ok())
            {
                hooks
                    .listen(port, ServerOptions::default())
                    .map_err(|err| RuntimeError::Evaluation(err.to_string()))?;
                self.serving = true;
            }
            Ok(())
        }

        fn handle_request(
            &mut self,
            _request: IncomingRequest,
            mut response: ResponseWriter,
            _hooks: &SandboxHooks,
        ) -> Result<(), RuntimeError> {
            response.write_head(
                200,
                HashMap::from([("Content-Type".to_string(), "text/plain".to_string())]),
            );
            response.end(Some("ok"));
            Ok(())
        }

        fn idle(&self) -> bool {
            !self.serving
        }
    }

    struct FixtureFactory;

    impl RuntimeFactory for FixtureFactory {
        fn create(&self) -> Box<dyn ScriptRuntime> {
            Box::new(FixtureRuntime { serving: false })
        }
    }

    fn script_context(
        source: &str,
    ) -> (
        ExecContext,
        Arc<HttpBridge>,
        Arc<NetworkManager>,
        mpsc::UnboundedReceiver<WorkerEvent>,
        CancelToken,
    ) {
        let (events, events_rx) = EventSink::channel();
        let net = Arc::new(NetworkManager::new(events.clone()));
        let fs = FileSystem::shared();
        fs.lock().unwrap().write_file("/app.js", source).unwrap();
        let (bridge, inbound) = HttpBridge::channel(Pid::new(1));
        let (_stdin_tx, stdin) = mpsc::unbounded_channel();
        let cancel = CancelToken::new();
        let ctx = ExecContext {
            pid: Pid::new(1),
            command: "node".to_string(),
            args: vec!["/app.js".to_string()],
            cwd: "/".to_string(),
            env: HashMap::new(),
            fs,
            events,
            stdin,
            cancel: cancel.clone(),
            http: Some(HttpChannel {
                bridge: Arc::clone(&bridge),
                inbound,
            }),
        };
        (ctx, bridge, net, events_rx, cancel)
    }

    #[tokio::test]
    async fn server_program_stays_up_and_answers_requests() {
        let (ctx, bridge, net, _events_rx, cancel) = script_context("listen 8080");
        let factory: Arc<dyn RuntimeFactory> = Arc::new(FixtureFactory);
        let task = tokio::spawn(run_script(factory, Arc::clone(&net), ctx));

        // Wait for the runtime to bind.
        let mut tries = 0;
        while net.running_ports().is_empty() && tries < 100 {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            tries += 1;
        }
        assert_eq!(net.running_ports(), vec![8080]);

        let response = bridge
            .dispatch(HttpRequest::get("http://localhost:8080/"))
            .await
            .unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body.as_deref(), Some("ok"));

        cancel.cancel();
        assert_eq!(task.await.unwrap(), EXIT_CODE_TERMINATED);
    }

    #[tokio::test]
    async fn non_server_program_exits_zero() {
        let (ctx, _bridge, net, _events_rx, _cancel) = script_context("plain program");
        let factory: Arc<dyn RuntimeFactory> = Arc::new(FixtureFactory);
        assert_eq!(run_script(factory, net, ctx).await, 0);
    }

    #[tokio::test]
    async fn missing_source_is_a_process_error() {
        let (mut ctx, _bridge, net, mut events_rx, _cancel) = script_context("listen 8080");
        ctx.args = vec!["/missing.js".to_string()];
        let factory: Arc<dyn RuntimeFactory> = Arc::new(FixtureFactory);
        assert_eq!(run_script(factory, net, ctx).await, 1);

        let mut saw_error = false;
        while let Ok(event) = events_rx.try_recv() {
            if matches!(event, WorkerEvent::ProcessError { .. }) {
                saw_error = true;
            }
        }
        assert!(saw_error);
    }

    #[tokio::test]
    async fn null_runtime_rejects_scripts() {
        let (ctx, _bridge, net, mut events_rx, _cancel) = script_context("anything");
        let factory: Arc<dyn RuntimeFactory> = Arc::new(NullRuntimeFactory);
        assert_eq!(run_script(factory, net, ctx).await, 1);
        match events_rx.try_recv().unwrap() {
            WorkerEvent::ProcessError { error, .. } => {
                assert!(error.contains("no script runtime installed"));
            }
            other => panic!("expected process error, got {:?}", other),
        }
    }
}
