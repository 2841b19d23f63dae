use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Instant,
};

use serde::Serialize;
use warp::{Filter, Rejection, Reply};

/// Environment variable that enables the diagnostics endpoint.
pub const PROFILING_ENV: &str = "PROFILING";
pub const PROFILING_ADDR: ([u8; 4], u16) = ([127, 0, 0, 1], 16060);

/// Process-wide counters. The layout is fixed at startup; only the
/// atomics inside change.
#[derive(Debug)]
pub struct Status {
    started: Instant,
    clients: Vec<Arc<ClientStatus>>,
    routers: Vec<Arc<RouterStatus>>,
    heartbeat: Arc<HeartbeatStatus>,
}

impl Status {
    pub fn new(client_names: Vec<String>, router_names: Vec<String>) -> Self {
        Self {
            started: Instant::now(),
            clients: client_names
                .into_iter()
                .map(|name| Arc::new(ClientStatus::new(name)))
                .collect(),
            routers: router_names
                .into_iter()
                .map(|name| Arc::new(RouterStatus::new(name)))
                .collect(),
            heartbeat: Arc::new(HeartbeatStatus::default()),
        }
    }

    pub fn clients(&self) -> &[Arc<ClientStatus>] {
        &self.clients
    }

    pub fn routers(&self) -> &[Arc<RouterStatus>] {
        &self.routers
    }

    pub fn heartbeat(&self) -> &Arc<HeartbeatStatus> {
        &self.heartbeat
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            uptime_secs: self.started.elapsed().as_secs(),
            clients: self
                .clients
                .iter()
                .map(|client| ClientSnapshot {
                    name: client.name.clone(),
                    sessions: client.sessions(),
                    failures: client.failures(),
                })
                .collect(),
            routers: self
                .routers
                .iter()
                .map(|router| RouterSnapshot {
                    route: router.name.clone(),
                    serving: router.is_serving(),
                })
                .collect(),
            heartbeat: HeartbeatSnapshot {
                attempts: self.heartbeat.attempts(),
                failed: self.heartbeat.failed(),
            },
        }
    }
}

#[derive(Debug)]
pub struct ClientStatus {
    name: String,
    sessions: AtomicU64,
    failures: AtomicU64,
}

impl ClientStatus {
    pub fn new(name: String) -> Self {
        Self {
            name,
            sessions: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    /// Counts a new session attempt and returns its 1-based number.
    pub fn begin_session(&self) -> u64 {
        self.sessions.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn sessions(&self) -> u64 {
        self.sessions.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

#[derive(Debug)]
pub struct RouterStatus {
    name: String,
    serving: AtomicBool,
}

impl RouterStatus {
    pub fn new(name: String) -> Self {
        Self {
            name,
            serving: AtomicBool::new(false),
        }
    }

    pub fn set_serving(&self, serving: bool) {
        self.serving.store(serving, Ordering::Relaxed);
    }

    pub fn is_serving(&self) -> bool {
        self.serving.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct HeartbeatStatus {
    attempts: AtomicU64,
    failed: AtomicU64,
}

impl HeartbeatStatus {
    pub fn record(&self, ok: bool) {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Every ping made, successful or not.
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Serialize)]
pub struct StatusSnapshot {
    pub uptime_secs: u64,
    pub clients: Vec<ClientSnapshot>,
    pub routers: Vec<RouterSnapshot>,
    pub heartbeat: HeartbeatSnapshot,
}

#[derive(Debug, Serialize)]
pub struct ClientSnapshot {
    pub name: String,
    pub sessions: u64,
    pub failures: u64,
}

#[derive(Debug, Serialize)]
pub struct RouterSnapshot {
    pub route: String,
    pub serving: bool,
}

#[derive(Debug, Serialize)]
pub struct HeartbeatSnapshot {
    pub attempts: u64,
    pub failed: u64,
}

pub fn routes(
    status: Arc<Status>,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let health = warp::path!("debug" / "health")
        .and(warp::get())
        .map(|| "ok");

    let snapshot = warp::path!("debug" / "status")
        .and(warp::get())
        .and(warp::any().map(move || status.clone()))
        .map(|status: Arc<Status>| warp::reply::json(&status.snapshot()));

    health.or(snapshot)
}

/// Starts the loopback diagnostics endpoint when `PROFILING` is set to a
/// non-empty value.
pub fn spawn_if_enabled(status: Arc<Status>) {
    match std::env::var(PROFILING_ENV) {
        Ok(value) if !value.is_empty() => {
            tokio::spawn(start(status, SocketAddr::from(PROFILING_ADDR)));
        }
        _ => {}
    }
}

pub async fn start(status: Arc<Status>, addr: SocketAddr) {
    match warp::serve(routes(status)).try_bind_ephemeral(addr) {
        Ok((bound, server)) => {
            log::info!("diagnostics endpoint listening on http://{}", bound);
            server.await;
        }
        Err(error) => log::warn!("failed to start diagnostics endpoint on {}: {}", addr, error),
    }
}
