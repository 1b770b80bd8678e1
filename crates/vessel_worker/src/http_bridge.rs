//! HTTP interception bridge, one per script process.
//!
//! Turns an injected HTTP request into an in-sandbox (request, response)
//! pair and awaits `end`. Correlation is carried by the `ResponseWriter`
//! itself: each inbound request gets a fresh random id and a one-shot
//! resolution slot, so an `end` arriving after the budget expired has
//! nowhere to land and is dropped.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;
use uuid::Uuid;
use vessel_protocol::defaults::HTTP_BRIDGE_TIMEOUT_MS;
use vessel_protocol::http;
use vessel_protocol::{HttpRequest, HttpResponse, Pid};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    #[error("Request timeout after {0}ms")]
    Timeout(u64),

    #[error("HTTP bridge disposed")]
    Disposed,

    #[error("handler finished without a response")]
    NoResponse,
}

/// Sandbox-side view of an injected request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingRequest {
    pub method: String,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub body: Option<String>,
}

impl From<HttpRequest> for IncomingRequest {
    fn from(request: HttpRequest) -> Self {
        Self {
            method: request.method,
            url: request.url,
            headers: request.headers,
            body: request.body,
        }
    }
}

/// Final payload produced by `end`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: String,
}

/// Sandbox-side response object handed to the runtime's handler.
///
/// Guarantees: at most one `end`; `write_head` and `write` are no-ops
/// after `end`; `write` before `end` appends to the internal buffer.
#[derive(Debug)]
pub struct ResponseWriter {
    request_id: String,
    status: u16,
    headers: HashMap<String, String>,
    body: String,
    ended: bool,
    done: Option<oneshot::Sender<SandboxResponse>>,
}

impl ResponseWriter {
    fn new(request_id: String, done: oneshot::Sender<SandboxResponse>) -> Self {
        Self {
            request_id,
            status: 200,
            headers: HashMap::new(),
            body: String::new(),
            ended: false,
            done: Some(done),
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn write_head(&mut self, status: u16, headers: HashMap<String, String>) {
        if self.ended {
            return;
        }
        self.status = status;
        self.headers.extend(headers);
    }

    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        if self.ended {
            return;
        }
        self.headers.insert(name.into(), value.into());
    }

    /// Snapshot of the accumulated headers.
    pub fn headers(&self) -> HashMap<String, String> {
        self.headers.clone()
    }

    pub fn write(&mut self, chunk: &str) {
        if self.ended {
            return;
        }
        self.body.push_str(chunk);
    }

    /// Finish the response. The first call resolves the pending request;
    /// later calls (and calls after the budget expired) are dropped.
    pub fn end(&mut self, chunk: Option<&str>) {
        if self.ended {
            return;
        }
        if let Some(chunk) = chunk {
            self.body.push_str(chunk);
        }
        self.ended = true;
        if let Some(done) = self.done.take() {
            let payload = SandboxResponse {
                status: self.status,
                headers: self.headers.clone(),
                body: self.body.clone(),
            };
            if done.send(payload).is_err() {
                debug!(request_id = %self.request_id, "late response dropped");
            }
        }
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }
}

/// One request travelling into the sandbox.
#[derive(Debug)]
pub struct InboundRequest {
    pub request: IncomingRequest,
    pub responder: ResponseWriter,
}

/// Per-process bridge state shared between the network manager (caller
/// side) and the script executor (sandbox side).
#[derive(Debug)]
pub struct HttpBridge {
    pid: Pid,
    ports: Mutex<HashSet<u16>>,
    inbound: mpsc::UnboundedSender<InboundRequest>,
    timeout_ms: u64,
}

impl HttpBridge {
    /// Create a bridge and the receiving half the executor loop drains.
    pub fn channel(pid: Pid) -> (std::sync::Arc<Self>, mpsc::UnboundedReceiver<InboundRequest>) {
        Self::channel_with_timeout(pid, HTTP_BRIDGE_TIMEOUT_MS)
    }

    pub fn channel_with_timeout(
        pid: Pid,
        timeout_ms: u64,
    ) -> (std::sync::Arc<Self>, mpsc::UnboundedReceiver<InboundRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            std::sync::Arc::new(Self {
                pid,
                ports: Mutex::new(HashSet::new()),
                inbound: tx,
                timeout_ms,
            }),
            rx,
        )
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn bind_port(&self, port: u16) {
        self.ports.lock().expect("bridge port set poisoned").insert(port);
    }

    pub fn unbind_port(&self, port: u16) {
        self.ports.lock().expect("bridge port set poisoned").remove(&port);
    }

    pub fn has_ports(&self) -> bool {
        !self.ports.lock().expect("bridge port set poisoned").is_empty()
    }

    /// Inject one request and await the sandbox response.
    ///
    /// A port the sandbox never bound yields a 404 without entering the
    /// sandbox. Handler failures surface as `Err` and become 500s at the
    /// network layer.
    pub async fn dispatch(&self, request: HttpRequest) -> Result<HttpResponse, BridgeError> {
        let port = http::port_from_url(&request.url);
        if !self
            .ports
            .lock()
            .expect("bridge port set poisoned")
            .contains(&port)
        {
            return Ok(HttpResponse::not_found(&request.url));
        }

        let request_id = Uuid::new_v4().to_string();
        let (done_tx, done_rx) = oneshot::channel();
        let responder = ResponseWriter::new(request_id, done_tx);
        self.inbound
            .send(InboundRequest {
                request: request.into(),
                responder,
            })
            .map_err(|_| BridgeError::Disposed)?;

        match tokio::time::timeout(Duration::from_millis(self.timeout_ms), done_rx).await {
            Ok(Ok(response)) => {
                let body = if response.body.is_empty() {
                    None
                } else {
                    Some(response.body)
                };
                Ok(HttpResponse::new(response.status, response.headers, body))
            }
            Ok(Err(_)) => Err(BridgeError::NoResponse),
            Err(_) => Err(BridgeError::Timeout(self.timeout_ms)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vessel_protocol::Pid;

    fn get(url: &str) -> HttpRequest {
        HttpRequest::get(url)
    }

    #[tokio::test]
    async fn dispatch_resolves_when_handler_ends() {
        let (bridge, mut rx) = HttpBridge::channel(Pid::new(1));
        bridge.bind_port(8080);

        let driver = tokio::spawn(async move {
            let mut inbound = rx.recv().await.unwrap();
            assert_eq!(inbound.request.method, "GET");
            inbound.responder.write_head(
                200,
                HashMap::from([("Content-Type".to_string(), "text/plain".to_string())]),
            );
            inbound.responder.write("o");
            inbound.responder.end(Some("k"));
        });

        let response = bridge.dispatch(get("http://localhost:8080/")).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body.as_deref(), Some("ok"));
        assert_eq!(
            response.headers.get("Content-Type").map(String::as_str),
            Some("text/plain")
        );
        driver.await.unwrap();
    }

    #[tokio::test]
    async fn unbound_port_is_a_404_without_entering_the_sandbox() {
        let (bridge, mut rx) = HttpBridge::channel(Pid::new(1));
        let response = bridge.dispatch(get("http://localhost:9999/")).await.unwrap();
        assert_eq!(response.status, 404);
        // Nothing was delivered inbound.
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn handler_timeout_rejects_and_late_end_is_dropped() {
        let (bridge, mut rx) = HttpBridge::channel_with_timeout(Pid::new(1), 50);
        bridge.bind_port(8080);

        let err = bridge.dispatch(get("http://localhost:8080/")).await.unwrap_err();
        assert_eq!(err, BridgeError::Timeout(50));
        assert_eq!(err.to_string(), "Request timeout after 50ms");

        // The handler finally answers; end() must not panic and the
        // payload silently disappears.
        let mut inbound = rx.recv().await.unwrap();
        inbound.responder.end(Some("too late"));
        assert!(inbound.responder.is_ended());
    }

    #[tokio::test]
    async fn dropped_responder_surfaces_as_no_response() {
        let (bridge, mut rx) = HttpBridge::channel(Pid::new(1));
        bridge.bind_port(8080);

        let driver = tokio::spawn(async move {
            let inbound = rx.recv().await.unwrap();
            drop(inbound);
        });

        let err = bridge.dispatch(get("http://localhost:8080/")).await.unwrap_err();
        assert_eq!(err, BridgeError::NoResponse);
        driver.await.unwrap();
    }

    #[test]
    fn response_writer_end_is_single_shot() {
        let (tx, mut rx) = oneshot::channel();
        let mut writer = ResponseWriter::new("r1".to_string(), tx);
        writer.set_header("X-One", "1");
        writer.write("a");
        writer.end(Some("b"));
        writer.write_head(500, HashMap::new());
        writer.write("ignored");
        writer.end(Some("ignored"));

        let payload = rx.try_recv().unwrap();
        assert_eq!(payload.status, 200);
        assert_eq!(payload.body, "ab");
        assert_eq!(writer.headers().get("X-One").map(String::as_str), Some("1"));
    }
}
