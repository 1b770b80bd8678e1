//! Executor framework: how the worker turns a spawn into running code.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::mpsc;
use vessel_protocol::{Pid, ProcessKind};

use crate::cancel::CancelToken;
use crate::events::EventSink;
use crate::fs::SharedFs;
use crate::http_bridge::{HttpBridge, InboundRequest};

/// Future driving one process to its exit code.
pub type ExecFuture = Pin<Box<dyn Future<Output = i32> + Send>>;

/// The HTTP plumbing handed to script executors.
#[derive(Debug)]
pub struct HttpChannel {
    pub bridge: Arc<HttpBridge>,
    pub inbound: mpsc::UnboundedReceiver<InboundRequest>,
}

/// Everything an executor needs to run one process.
pub struct ExecContext {
    pub pid: Pid,
    pub command: String,
    pub args: Vec<String>,
    pub cwd: String,
    pub env: HashMap<String, String>,
    pub fs: SharedFs,
    pub events: EventSink,
    pub stdin: mpsc::UnboundedReceiver<String>,
    pub cancel: CancelToken,
    /// Present only for script processes.
    pub http: Option<HttpChannel>,
}

/// One way of executing commands. Implementations must honor the cancel
/// token and let the exit code be the future's output; the worker does
/// the exit bookkeeping.
pub trait Executor: Send + Sync {
    fn kind(&self) -> ProcessKind;

    /// Whether this executor can run `command`.
    fn matches(&self, command: &str) -> bool;

    fn launch(&self, ctx: ExecContext) -> ExecFuture;
}

/// Ordered executor registry; the first match wins.
#[derive(Default)]
pub struct ExecutorRegistry {
    executors: Vec<Arc<dyn Executor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, executor: Arc<dyn Executor>) {
        self.executors.push(executor);
    }

    pub fn find(&self, command: &str) -> Option<Arc<dyn Executor>> {
        self.executors
            .iter()
            .find(|executor| executor.matches(command))
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(ProcessKind, &'static str);

    impl Executor for Fixed {
        fn kind(&self) -> ProcessKind {
            self.0
        }

        fn matches(&self, command: &str) -> bool {
            command == self.1
        }

        fn launch(&self, _ctx: ExecContext) -> ExecFuture {
            Box::pin(async { 0 })
        }
    }

    #[test]
    fn registration_order_breaks_ties() {
        let mut registry = ExecutorRegistry::new();
        registry.register(Arc::new(Fixed(ProcessKind::Shell, "run")));
        registry.register(Arc::new(Fixed(ProcessKind::Script, "run")));

        let found = registry.find("run").unwrap();
        assert_eq!(found.kind(), ProcessKind::Shell);
        assert!(registry.find("other").is_none());
    }
}
