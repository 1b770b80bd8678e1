//! The trusted supervisor domain of the Vessel container.
//!
//! Embedders start a [`Container`], spawn processes, stream their I/O
//! through [`ProcessHandle`]s, read and write the virtual filesystem,
//! and inject HTTP requests into in-sandbox servers. All of it travels
//! over one correlated message channel owned by [`WorkerBridge`].

pub mod bridge;
pub mod container;
pub mod interceptor;
pub mod process;

pub use bridge::WorkerBridge;
pub use container::{Container, ContainerOptions, NetworkEvent};
pub use interceptor::NetworkInterceptor;
pub use process::{ProcessEvent, ProcessEvents, ProcessHandle};

// The protocol and the runtime seam are part of the embedder surface.
pub use vessel_protocol::{
    ContainerError, ContainerStats, HttpRequest, HttpResponse, Pid, Result, SpawnOptions,
};
pub use vessel_worker::runtime::{NullRuntimeFactory, RuntimeFactory, ScriptRuntime};
