//! Message protocol for the Vessel container.
//!
//! Wire format for host <-> worker communication: the trusted supervisor
//! domain (host) and the untrusted execution domain (worker) exchange
//! tagged frames over a single ordered in-process channel.
//!
//! - Correlated requests carry a monotonic id; the worker echoes it in
//!   exactly one reply (success variant or `error`).
//! - Unsolicited events (process output/exit, server lifecycle) carry no
//!   id and fan out to every subscriber.
//!
//! The types serialize with strict enum tagging so the same shapes cross
//! JSON boundaries (the network interceptor) unchanged.

pub mod defaults;
pub mod error;
pub mod http;
pub mod message;
pub mod paths;
pub mod types;

pub use error::{ContainerError, Result};
pub use http::{HttpRequest, HttpResponse};
pub use message::{HostFrame, RequestId, WorkerEvent, WorkerFrame, WorkerReply, WorkerRequest};
pub use types::{
    ContainerStats, NetworkStats, Pid, ProcessKind, ProcessSnapshot, ProcessState, ServerId,
    ServerInfo, ServerKind, ServerOptions, ServerStats, ServerStatus, SpawnOptions, TrafficStats,
};
