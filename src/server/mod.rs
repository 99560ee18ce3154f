//! Listener, protocol detection, and composition
//!
//! One TCP listener serves both stratum dialects: the first bytes of a
//! connection pick the codec, then a per-connection driver task owns the
//! socket until close. The [`PoolContext`] bundles the shared subsystems a
//! driver needs; it is assembled once at startup.

use crate::batch::repository::ShareRepository;
use crate::batch::BatchProcessor;
use crate::config::PoolConfig;
use crate::job::{ExtranoncePool, JobDistributor};
use crate::session::{ProtocolKind, SessionShared};
use crate::stratum::v2::noise::HandshakeResponder;
use crate::stratum::v2::V2_MAGIC;
use crate::template::{TemplateProvider, TemplateStore};
use crate::utils::current_timestamp;
use crate::vardiff::VardiffController;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Server-level errors
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("listener error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid listen address: {0}")]
    BadAddress(String),
}

/// Shared subsystems handed to every connection driver.
pub struct PoolContext {
    pub config: PoolConfig,
    pub store: Arc<TemplateStore>,
    pub distributor: Arc<JobDistributor>,
    pub extranonces: Arc<ExtranoncePool>,
    pub batch: Arc<BatchProcessor>,
    pub vardiff: Arc<VardiffController>,
    pub repository: Arc<dyn ShareRepository>,
    pub sessions: SessionRegistry,
}

impl PoolContext {
    /// Wire the subsystems together. The provider is shared with the batch
    /// pipeline (block submission); the template pump receives its own
    /// handle separately.
    pub fn new(
        config: PoolConfig,
        engine: Arc<dyn crate::hashing::HashEngine>,
        repository: Arc<dyn ShareRepository>,
        provider: Arc<dyn TemplateProvider>,
    ) -> Arc<Self> {
        let store = Arc::new(TemplateStore::new(
            config.template.stale_grace(),
            config.template.retired_capacity,
        ));
        let validator = Arc::new(crate::validation::ShareValidator::new(
            Arc::clone(&store),
            engine,
            config.stratum.extranonce2_size,
        ));
        let batch = BatchProcessor::start(
            &config.batch,
            validator,
            Arc::clone(&repository),
            provider,
        );
        let vardiff = Arc::new(VardiffController::new(config.vardiff.clone()));

        Arc::new(Self {
            config,
            store,
            distributor: Arc::new(JobDistributor::new()),
            extranonces: Arc::new(ExtranoncePool::new()),
            batch,
            vardiff,
            repository,
            sessions: SessionRegistry::new(),
        })
    }
}

/// Feed upstream templates into the store and fan them out. Re-subscribes
/// with capped exponential backoff when the upstream stream drops; the
/// current template stays live throughout an outage.
pub async fn run_template_pump(
    store: Arc<TemplateStore>,
    distributor: Arc<JobDistributor>,
    provider: Arc<dyn TemplateProvider>,
    cancel: CancellationToken,
) {
    let mut backoff = Duration::from_secs(1);
    loop {
        let mut templates = provider.subscribe().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                template = templates.recv() => match template {
                    Some(template) => {
                        backoff = Duration::from_secs(1);
                        match store.publish(template) {
                            Ok((job_id, published)) => {
                                distributor.announce(job_id, published, true);
                            }
                            Err(e) => warn!(error = %e, "discarded non-advancing template"),
                        }
                    }
                    None => break,
                }
            }
        }
        warn!(retry_in_secs = backoff.as_secs(), "template subscription ended, retrying");
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(Duration::from_secs(30));
    }
}

/// Live-session index for observability snapshots.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<Uuid, Arc<SessionShared>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, session: &Arc<SessionShared>) {
        let mut sessions = self.sessions.lock().expect("session registry lock poisoned");
        sessions.insert(session.id, Arc::clone(session));
    }

    pub fn remove(&self, session_id: &Uuid) {
        let mut sessions = self.sessions.lock().expect("session registry lock poisoned");
        sessions.remove(session_id);
    }

    pub fn count(&self) -> usize {
        self.sessions.lock().expect("session registry lock poisoned").len()
    }

    pub fn snapshot(&self) -> Vec<Arc<SessionShared>> {
        let sessions = self.sessions.lock().expect("session registry lock poisoned");
        sessions.values().cloned().collect()
    }
}

/// Sliding-window limit on connection attempts per source IP.
pub struct ConnectionRateLimiter {
    attempts: Mutex<HashMap<IpAddr, Vec<u64>>>,
    max_per_window: usize,
    window_secs: u64,
}

impl ConnectionRateLimiter {
    pub fn new(max_per_window: usize, window_secs: u64) -> Self {
        Self { attempts: Mutex::new(HashMap::new()), max_per_window, window_secs }
    }

    /// Record an attempt; false means the IP is over its budget.
    pub fn check(&self, ip: IpAddr) -> bool {
        let now = current_timestamp();
        let cutoff = now.saturating_sub(self.window_secs);
        let mut attempts = self.attempts.lock().expect("rate limiter lock poisoned");
        let entry = attempts.entry(ip).or_default();
        entry.retain(|&at| at > cutoff);
        if entry.len() >= self.max_per_window {
            warn!(%ip, attempts = entry.len(), "connection rate limit exceeded");
            return false;
        }
        entry.push(now);
        true
    }

    /// Periodic maintenance: drop IPs with no recent attempts.
    pub fn cleanup(&self) {
        let cutoff = current_timestamp().saturating_sub(self.window_secs);
        let mut attempts = self.attempts.lock().expect("rate limiter lock poisoned");
        attempts.retain(|_, stamps| {
            stamps.retain(|&at| at > cutoff);
            !stamps.is_empty()
        });
    }
}

/// Time allowed for a client's opening bytes.
const DETECT_DEADLINE: Duration = Duration::from_secs(1);

/// Outcome of peeking a connection's first bytes.
#[derive(Debug, PartialEq, Eq)]
pub enum Detected {
    Protocol(ProtocolKind),
    /// Nothing recognizable arrived; the connection is dropped
    Unknown,
}

/// Peek up to 16 bytes: `{` (after whitespace) selects v1, the v2 magic
/// selects v2, anything else is rejected.
pub async fn detect_protocol(stream: &TcpStream) -> std::io::Result<Detected> {
    let result = tokio::time::timeout(DETECT_DEADLINE, async {
        let mut buf = [0u8; 16];
        loop {
            let n = stream.peek(&mut buf).await?;
            if n == 0 {
                return Ok::<Detected, std::io::Error>(Detected::Unknown);
            }
            match classify_prefix(&buf[..n]) {
                Some(detected) => return Ok(detected),
                // Not enough bytes yet; wait for more.
                None => tokio::time::sleep(Duration::from_millis(10)).await,
            }
        }
    })
    .await;

    match result {
        Ok(inner) => inner,
        Err(_) => Ok(Detected::Unknown),
    }
}

fn classify_prefix(bytes: &[u8]) -> Option<Detected> {
    let first = bytes.iter().position(|b| !b.is_ascii_whitespace());
    match first {
        Some(at) => {
            let rest = &bytes[at..];
            if rest[0] == b'{' {
                return Some(Detected::Protocol(ProtocolKind::V1));
            }
            if rest.len() >= V2_MAGIC.len() {
                return Some(if rest[..V2_MAGIC.len()] == V2_MAGIC {
                    Detected::Protocol(ProtocolKind::V2)
                } else {
                    Detected::Unknown
                });
            }
            if V2_MAGIC.starts_with(rest) {
                // Plausible magic prefix; keep waiting.
                None
            } else {
                Some(Detected::Unknown)
            }
        }
        // All whitespace so far.
        None if bytes.len() >= 16 => Some(Detected::Unknown),
        None => None,
    }
}

/// The stratum listener: accepts, rate-limits, detects, and spawns one
/// driver task per connection.
pub struct PoolServer {
    context: Arc<PoolContext>,
    responder: Arc<HandshakeResponder>,
    limiter: Arc<ConnectionRateLimiter>,
}

impl PoolServer {
    pub fn new(context: Arc<PoolContext>) -> Self {
        let stratum = &context.config.stratum;
        let limiter = Arc::new(ConnectionRateLimiter::new(
            stratum.max_connections_per_ip_window,
            stratum.connection_window_secs,
        ));
        Self { context, responder: Arc::new(HandshakeResponder::new()), limiter }
    }

    /// Bind the configured endpoint and serve until cancelled.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), ServerError> {
        let stratum = &self.context.config.stratum;
        let addr: SocketAddr = format!("{}:{}", stratum.bind_addr, stratum.stratum_port)
            .parse()
            .map_err(|e| ServerError::BadAddress(format!("{e}")))?;

        let socket = if addr.is_ipv4() { TcpSocket::new_v4()? } else { TcpSocket::new_v6()? };
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        let listener = socket.listen(stratum.accept_backlog)?;
        info!(%addr, "stratum listener bound");

        self.serve(listener, cancel).await
    }

    /// Accept loop over an already-bound listener (tests bind port 0).
    pub async fn serve(
        &self,
        listener: TcpListener,
        cancel: CancellationToken,
    ) -> Result<(), ServerError> {
        let mut connections: JoinSet<()> = JoinSet::new();
        let mut maintenance = tokio::time::interval(Duration::from_secs(60));

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = maintenance.tick() => self.limiter.cleanup(),
                // Reap finished connection tasks.
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, remote)) => {
                            if !self.limiter.check(remote.ip()) {
                                drop(stream);
                                continue;
                            }
                            let context = Arc::clone(&self.context);
                            let responder = Arc::clone(&self.responder);
                            let conn_cancel = cancel.child_token();
                            connections.spawn(async move {
                                handle_connection(context, responder, stream, remote, conn_cancel)
                                    .await;
                            });
                        }
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                            tokio::time::sleep(Duration::from_millis(50)).await;
                        }
                    }
                }
            }
        }

        info!(active = connections.len(), "listener stopping, closing sessions");
        let drain = async {
            while connections.join_next().await.is_some() {}
        };
        if tokio::time::timeout(Duration::from_secs(5), drain).await.is_err() {
            warn!("session stop timeout, aborting remaining tasks");
        }
        Ok(())
    }
}

async fn handle_connection(
    context: Arc<PoolContext>,
    responder: Arc<HandshakeResponder>,
    stream: TcpStream,
    remote: SocketAddr,
    cancel: CancellationToken,
) {
    let detected = match detect_protocol(&stream).await {
        Ok(detected) => detected,
        Err(e) => {
            debug!(%remote, error = %e, "detection failed");
            return;
        }
    };

    match detected {
        Detected::Protocol(ProtocolKind::V1) => {
            debug!(%remote, "v1 connection");
            crate::session::v1::run(context, stream, remote, cancel).await;
        }
        Detected::Protocol(ProtocolKind::V2) => {
            debug!(%remote, "v2 connection");
            crate::session::v2::run(context, responder, stream, remote, cancel).await;
        }
        Detected::Unknown => {
            debug!(%remote, "unrecognized protocol, closing");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_classification() {
        assert_eq!(
            classify_prefix(b"{\"id\":1}"),
            Some(Detected::Protocol(ProtocolKind::V1))
        );
        assert_eq!(
            classify_prefix(b"  \n{\"id\":1}"),
            Some(Detected::Protocol(ProtocolKind::V1))
        );
        assert_eq!(
            classify_prefix(b"STR2\x02\x03"),
            Some(Detected::Protocol(ProtocolKind::V2))
        );
        // Incomplete magic: undecided.
        assert_eq!(classify_prefix(b"ST"), None);
        // Definitely neither.
        assert_eq!(classify_prefix(b"GET / HTTP/1.1"), Some(Detected::Unknown));
        assert_eq!(classify_prefix(b"XY"), Some(Detected::Unknown));
        // Whitespace only, 16 bytes: give up.
        assert_eq!(classify_prefix(&[b' '; 16]), Some(Detected::Unknown));
        assert_eq!(classify_prefix(&[b' '; 4]), None);
    }

    #[test]
    fn connection_limiter_enforces_window() {
        let limiter = ConnectionRateLimiter::new(3, 60);
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        assert!(limiter.check(ip));
        assert!(limiter.check(ip));
        assert!(limiter.check(ip));
        assert!(!limiter.check(ip));

        // A different IP is unaffected.
        let other: IpAddr = "10.0.0.2".parse().unwrap();
        assert!(limiter.check(other));
    }

    #[test]
    fn registry_tracks_sessions() {
        let registry = SessionRegistry::new();
        let session = Arc::new(SessionShared::new(
            "127.0.0.1:9999".parse().unwrap(),
            ProtocolKind::V1,
            [0; 4],
            1.0,
        ));
        registry.insert(&session);
        assert_eq!(registry.count(), 1);
        registry.remove(&session.id);
        assert_eq!(registry.count(), 0);
    }
}
