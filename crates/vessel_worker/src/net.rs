//! Network manager: virtual server registry and request routing.
//!
//! Owns the `(type, port)` server table, per-server counters, and the
//! rolling request log that backs the aggregate stats. Requests for
//! absent or stopped servers never reach a process; they short-circuit
//! into synthetic 503s at this gate.

use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};
use vessel_protocol::defaults::{
    REQUEST_LOG_WINDOW_SECS, REQUEST_RATE_WINDOW_SECS,
};
use vessel_protocol::{
    HttpRequest, HttpResponse, NetworkStats, Pid, ServerId, ServerInfo, ServerOptions, ServerStats,
    ServerStatus, TrafficStats,
};

use crate::events::EventSink;
use crate::process::ProcessTable;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetError {
    #[error("Port in use: {0}")]
    PortInUse(ServerId),

    #[error("No server registered for {0}")]
    NoServer(ServerId),
}

/// One entry in the rolling request log.
#[derive(Debug, Clone)]
struct RequestRecord {
    at: Instant,
    duration_ms: f64,
    bytes_received: u64,
    bytes_sent: u64,
    success: bool,
}

#[derive(Debug)]
struct VirtualServer {
    pid: Pid,
    status: ServerStatus,
    options: ServerOptions,
    started_at: chrono::DateTime<Utc>,
}

#[derive(Debug, Default)]
struct NetInner {
    servers: HashMap<ServerId, VirtualServer>,
    stats: HashMap<ServerId, ServerStats>,
    connections: HashMap<u64, ServerId>,
    next_connection: u64,
    request_log: VecDeque<RequestRecord>,
}

/// Worker-owned registry of virtual servers and traffic accounting.
#[derive(Debug)]
pub struct NetworkManager {
    inner: Mutex<NetInner>,
    events: EventSink,
}

impl NetworkManager {
    pub fn new(events: EventSink) -> Self {
        Self {
            inner: Mutex::new(NetInner::default()),
            events,
        }
    }

    /// Register a server for `pid`. At most one server per `(type, port)`.
    pub fn register_server(
        &self,
        pid: Pid,
        id: ServerId,
        options: ServerOptions,
    ) -> Result<(), NetError> {
        {
            let mut inner = self.lock();
            if inner.servers.contains_key(&id) {
                return Err(NetError::PortInUse(id));
            }
            let now = Utc::now();
            inner.servers.insert(
                id,
                VirtualServer {
                    pid,
                    status: ServerStatus::Running,
                    options,
                    started_at: now,
                },
            );
            inner.stats.insert(id, ServerStats::new(now));
        }
        debug!(%id, %pid, "server registered");
        self.events.server_listen(id.port);
        Ok(())
    }

    /// Remove a server and every connection attached to it.
    pub fn unregister_server(&self, id: ServerId) -> bool {
        let removed = {
            let mut inner = self.lock();
            let removed = inner.servers.remove(&id).is_some();
            if removed {
                inner.stats.remove(&id);
                inner.connections.retain(|_, server| *server != id);
            }
            removed
        };
        if removed {
            debug!(%id, "server unregistered");
            self.events.server_close(id.port);
        }
        removed
    }

    /// Drop everything a process registered. Called on process exit.
    pub fn unregister_process(&self, pid: Pid) {
        let ids: Vec<ServerId> = {
            let inner = self.lock();
            inner
                .servers
                .iter()
                .filter(|(_, server)| server.pid == pid)
                .map(|(id, _)| *id)
                .collect()
        };
        for id in ids {
            self.unregister_server(id);
        }
    }

    /// Ports with running servers, deduplicated and sorted.
    pub fn running_ports(&self) -> Vec<u16> {
        let inner = self.lock();
        let mut ports: Vec<u16> = inner
            .servers
            .iter()
            .filter(|(_, server)| server.status == ServerStatus::Running)
            .map(|(id, _)| id.port)
            .collect();
        ports.sort_unstable();
        ports.dedup();
        ports
    }

    /// Track one open connection against a server.
    pub fn open_connection(&self, id: ServerId) -> Result<u64, NetError> {
        let mut inner = self.lock();
        if !inner.servers.contains_key(&id) {
            return Err(NetError::NoServer(id));
        }
        inner.next_connection += 1;
        let connection = inner.next_connection;
        inner.connections.insert(connection, id);
        if let Some(stats) = inner.stats.get_mut(&id) {
            stats.active_connections += 1;
        }
        Ok(connection)
    }

    pub fn close_connection(&self, connection: u64) {
        let mut inner = self.lock();
        if let Some(id) = inner.connections.remove(&connection) {
            if let Some(stats) = inner.stats.get_mut(&id) {
                stats.active_connections = stats.active_connections.saturating_sub(1);
            }
        }
    }

    /// Route an injected HTTP request to the owning process.
    ///
    /// Absent or stopped server: synthetic 503. Owner without an HTTP
    /// bridge: 500. Bridge failures (timeout, teardown): 500 carrying
    /// the error message, plus a `networkError` event.
    pub async fn handle_request(
        &self,
        table: &ProcessTable,
        request: HttpRequest,
        port: u16,
    ) -> HttpResponse {
        let id = ServerId::http(port);
        let owner = {
            let inner = self.lock();
            inner
                .servers
                .get(&id)
                .filter(|server| server.status == ServerStatus::Running)
                .map(|server| server.pid)
        };
        let Some(pid) = owner else {
            debug!(port, "request for unbound port");
            return HttpResponse::unavailable(port);
        };

        let Some(bridge) = table.http_bridge(pid) else {
            warn!(%pid, port, "server owner cannot serve http");
            return HttpResponse::server_error(format!(
                "Process {} cannot serve HTTP requests",
                pid
            ));
        };

        let bytes_received = request.wire_size();
        let started = Instant::now();
        {
            let mut inner = self.lock();
            if let Some(stats) = inner.stats.get_mut(&id) {
                stats.active_connections += 1;
            }
        }

        let outcome = bridge.dispatch(request).await;
        let duration_ms = started.elapsed().as_secs_f64() * 1000.0;

        let response = match outcome {
            Ok(response) => response,
            Err(err) => {
                self.events.network_error(port, None, err.to_string());
                HttpResponse::server_error(err.to_string())
            }
        };

        let bytes_sent = response.wire_size();
        let success = response.is_success();
        {
            let mut inner = self.lock();
            if let Some(stats) = inner.stats.get_mut(&id) {
                stats.requests_total += 1;
                if success {
                    stats.requests_success += 1;
                } else {
                    stats.requests_failed += 1;
                }
                stats.bytes_received += bytes_received;
                stats.bytes_sent += bytes_sent;
                stats.active_connections = stats.active_connections.saturating_sub(1);
            }
            inner.request_log.push_back(RequestRecord {
                at: started,
                duration_ms,
                bytes_received,
                bytes_sent,
                success,
            });
        }
        response
    }

    /// Drop request-log entries older than the retention window.
    pub fn prune_request_log(&self) {
        let cutoff = Duration::from_secs(REQUEST_LOG_WINDOW_SECS);
        let mut inner = self.lock();
        while inner
            .request_log
            .front()
            .is_some_and(|record| record.at.elapsed() > cutoff)
        {
            inner.request_log.pop_front();
        }
    }

    /// Aggregates over the server table and the retained request log.
    pub fn network_stats(&self) -> NetworkStats {
        let retention = Duration::from_secs(REQUEST_LOG_WINDOW_SECS);
        let rate_window = Duration::from_secs(REQUEST_RATE_WINDOW_SECS);
        let inner = self.lock();

        let mut servers: Vec<ServerInfo> = inner
            .servers
            .iter()
            .map(|(id, server)| ServerInfo {
                id: *id,
                pid: server.pid,
                status: server.status,
                options: server.options.clone(),
                started_at: server.started_at,
            })
            .collect();
        servers.sort_by_key(|info| (info.id.port, info.id.kind.as_str()));

        let mut traffic = TrafficStats::default();
        let mut total_duration = 0.0;
        for record in inner.request_log.iter() {
            let age = record.at.elapsed();
            if age > retention {
                continue;
            }
            traffic.requests_total += 1;
            if record.success {
                traffic.requests_success += 1;
            } else {
                traffic.requests_failed += 1;
            }
            traffic.bytes_received += record.bytes_received;
            traffic.bytes_sent += record.bytes_sent;
            total_duration += record.duration_ms;
            if age <= rate_window {
                traffic.requests_per_minute += 1;
            }
        }
        if traffic.requests_total > 0 {
            traffic.avg_response_time_ms = total_duration / traffic.requests_total as f64;
        }
        traffic.active_connections = inner
            .stats
            .values()
            .map(|stats| stats.active_connections)
            .sum();

        NetworkStats { servers, traffic }
    }

    /// Per-server counters, if the server is still registered.
    pub fn server_stats(&self, id: ServerId) -> Option<ServerStats> {
        self.lock().stats.get(&id).cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, NetInner> {
        self.inner.lock().expect("network state poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vessel_protocol::WorkerEvent;

    fn manager() -> (NetworkManager, tokio::sync::mpsc::UnboundedReceiver<WorkerEvent>) {
        let (events, rx) = EventSink::channel();
        (NetworkManager::new(events), rx)
    }

    #[test]
    fn duplicate_registration_is_port_in_use() {
        let (net, mut rx) = manager();
        let id = ServerId::http(8080);
        net.register_server(Pid::new(1), id, ServerOptions::default())
            .unwrap();
        let err = net
            .register_server(Pid::new(2), id, ServerOptions::default())
            .unwrap_err();
        assert_eq!(err, NetError::PortInUse(id));
        assert!(matches!(
            rx.try_recv().unwrap(),
            WorkerEvent::ServerListen { port: 8080 }
        ));
    }

    #[test]
    fn unregister_process_closes_all_its_servers() {
        let (net, mut rx) = manager();
        net.register_server(Pid::new(1), ServerId::http(80), ServerOptions::default())
            .unwrap();
        net.register_server(Pid::new(1), ServerId::http(81), ServerOptions::default())
            .unwrap();
        net.register_server(Pid::new(2), ServerId::http(90), ServerOptions::default())
            .unwrap();
        // Drain the three listen events.
        for _ in 0..3 {
            rx.try_recv().unwrap();
        }

        net.unregister_process(Pid::new(1));
        let mut closed = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let WorkerEvent::ServerClose { port } = event {
                closed.push(port);
            }
        }
        closed.sort_unstable();
        assert_eq!(closed, vec![80, 81]);
        assert_eq!(net.running_ports(), vec![90]);
    }

    #[tokio::test]
    async fn request_for_unknown_port_is_503_and_not_logged() {
        let (net, _rx) = manager();
        let table = ProcessTable::new();
        let response = net
            .handle_request(&table, HttpRequest::get("http://localhost:9999/"), 9999)
            .await;
        assert_eq!(response.status, 503);
        assert_eq!(net.network_stats().traffic.requests_total, 0);
    }

    #[tokio::test]
    async fn owner_without_bridge_is_500() {
        let (net, _rx) = manager();
        let table = ProcessTable::new();
        net.register_server(Pid::new(7), ServerId::http(8080), ServerOptions::default())
            .unwrap();
        let response = net
            .handle_request(&table, HttpRequest::get("http://localhost:8080/"), 8080)
            .await;
        assert_eq!(response.status, 500);
        assert!(response.body.unwrap().contains("cannot serve HTTP"));
    }

    #[test]
    fn connections_are_torn_down_with_the_server() {
        let (net, _rx) = manager();
        let id = ServerId::http(8080);
        net.register_server(Pid::new(1), id, ServerOptions::default())
            .unwrap();
        let conn = net.open_connection(id).unwrap();
        assert_eq!(net.server_stats(id).unwrap().active_connections, 1);

        net.unregister_server(id);
        assert!(net.server_stats(id).is_none());
        // Closing after teardown is a no-op.
        net.close_connection(conn);
    }

    #[test]
    fn stats_track_servers_and_empty_traffic() {
        let (net, _rx) = manager();
        net.register_server(Pid::new(1), ServerId::http(8080), ServerOptions::default())
            .unwrap();
        let stats = net.network_stats();
        assert_eq!(stats.servers.len(), 1);
        assert_eq!(stats.servers[0].pid, Pid::new(1));
        assert_eq!(stats.traffic.requests_total, 0);
        assert_eq!(stats.traffic.avg_response_time_ms, 0.0);
    }
}
