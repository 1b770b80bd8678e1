//! The untrusted execution domain of the Vessel container.
//!
//! Everything the sandbox owns lives here: the process table and
//! executors, the in-memory filesystem, the virtual server registry, and
//! the HTTP-interception bridge. The only way in or out is the message
//! channel drained by [`worker::Worker`].

pub mod cancel;
pub mod events;
pub mod executor;
pub mod fs;
pub mod http_bridge;
pub mod net;
pub mod process;
pub mod runtime;
pub mod shell;
pub mod sock;
pub mod worker;

pub use cancel::CancelToken;
pub use events::EventSink;
pub use executor::{ExecContext, Executor, ExecutorRegistry};
pub use fs::{FileSystem, FsError, SharedFs};
pub use http_bridge::{BridgeError, HttpBridge, IncomingRequest, ResponseWriter};
pub use net::{NetError, NetworkManager};
pub use runtime::{
    NullRuntimeFactory, RuntimeFactory, RuntimeError, SandboxHooks, ScriptRuntime,
};
pub use worker::{Worker, WorkerConfig};
