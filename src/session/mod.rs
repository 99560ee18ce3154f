//! Per-connection session state
//!
//! Each accepted connection owns exactly one session. The driver task for
//! the wire dialect holds the [`SessionShared`] handle; the batch workers
//! and the job distributor reach the session only through that shared state
//! (short critical sections) or its weak mailbox handle, so a disconnect
//! never leaves dangling strong references.

pub mod v1;
pub mod v2;

use crate::job::Extranonce1;
use crate::template::JobId;
use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;
use uuid::Uuid;

/// Upper bound on remembered share tuples per session. Evicted tuples are
/// far older than anything the stale-grace ring can still resolve.
const SUBMITTED_SET_CAP: usize = 100_000;

/// Submissions sampled for the bad-share disconnect ratio.
const OUTCOME_WINDOW: usize = 100;

/// Minimum sampled submissions before the ratio can trip.
const OUTCOME_MIN_SAMPLES: usize = 20;

/// Rejected fraction of the window that closes the session.
const OUTCOME_TRIP_RATIO: f64 = 0.5;

/// Wire dialect spoken by a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolKind {
    V1,
    V2,
}

/// Session lifecycle; transitions are driven by the connection task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Fresh,
    Subscribed,
    Authorized,
    Closed,
}

/// Why a session ended; reported in the close log line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    ClientDisconnect,
    IdleTimeout,
    Oversize,
    IoError(String),
    ProtocolError(String),
    TooManyErrors,
    Shutdown,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::ClientDisconnect => write!(f, "client disconnect"),
            CloseReason::IdleTimeout => write!(f, "idle timeout"),
            CloseReason::Oversize => write!(f, "oversize frame"),
            CloseReason::IoError(e) => write!(f, "i/o error: {e}"),
            CloseReason::ProtocolError(e) => write!(f, "protocol error: {e}"),
            CloseReason::TooManyErrors => write!(f, "too many invalid shares"),
            CloseReason::Shutdown => write!(f, "server shutdown"),
        }
    }
}

/// Miner identity in the `account.rig` convention; a bare account maps to
/// the default rig name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerName {
    pub account: String,
    pub rig: String,
}

impl WorkerName {
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        match raw.split_once('.') {
            Some((account, rig)) if !account.is_empty() => Some(Self {
                account: account.to_string(),
                rig: if rig.is_empty() { "default".to_string() } else { rig.to_string() },
            }),
            Some(_) => None,
            None => Some(Self { account: raw.to_string(), rig: "default".to_string() }),
        }
    }

    pub fn full(&self) -> String {
        format!("{}.{}", self.account, self.rig)
    }
}

/// A share tuple as remembered for at-most-once accounting.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShareKey {
    pub job_id: JobId,
    pub extranonce2: Vec<u8>,
    pub ntime: u32,
    pub nonce: u32,
}

struct SubmittedSet {
    seen: HashSet<ShareKey>,
    order: VecDeque<ShareKey>,
}

impl SubmittedSet {
    fn new() -> Self {
        Self { seen: HashSet::new(), order: VecDeque::new() }
    }

    fn contains(&self, key: &ShareKey) -> bool {
        self.seen.contains(key)
    }

    fn insert(&mut self, key: ShareKey) {
        if self.seen.insert(key.clone()) {
            self.order.push_back(key);
            while self.order.len() > SUBMITTED_SET_CAP {
                if let Some(evicted) = self.order.pop_front() {
                    self.seen.remove(&evicted);
                }
            }
        }
    }

    fn len(&self) -> usize {
        self.seen.len()
    }
}

struct OutcomeWindow {
    recent: VecDeque<bool>,
}

impl OutcomeWindow {
    fn new() -> Self {
        Self { recent: VecDeque::with_capacity(OUTCOME_WINDOW) }
    }

    fn record(&mut self, accepted: bool) -> bool {
        if self.recent.len() == OUTCOME_WINDOW {
            self.recent.pop_front();
        }
        self.recent.push_back(accepted);
        if self.recent.len() < OUTCOME_MIN_SAMPLES {
            return false;
        }
        let rejected = self.recent.iter().filter(|ok| !**ok).count();
        (rejected as f64 / self.recent.len() as f64) > OUTCOME_TRIP_RATIO
    }
}

struct WorkSample {
    at: Instant,
    difficulty: f64,
}

/// Rolling window for the hashrate estimate exposed to observability.
struct WorkWindow {
    samples: VecDeque<WorkSample>,
}

impl WorkWindow {
    const SPAN_SECS: u64 = 600;

    fn new() -> Self {
        Self { samples: VecDeque::new() }
    }

    fn record(&mut self, difficulty: f64, now: Instant) {
        self.samples.push_back(WorkSample { at: now, difficulty });
        if let Some(cutoff) = now.checked_sub(std::time::Duration::from_secs(Self::SPAN_SECS)) {
            while self.samples.front().map(|s| s.at < cutoff).unwrap_or(false) {
                self.samples.pop_front();
            }
        }
    }

    fn hashrate(&self, now: Instant) -> f64 {
        let Some(front) = self.samples.front() else {
            return 0.0;
        };
        let elapsed = now.duration_since(front.at).as_secs_f64().max(1.0);
        let work: f64 = self.samples.iter().map(|s| s.difficulty).sum();
        // One difficulty-1 share represents ~2^32 hash attempts.
        work * 4_294_967_296.0 / elapsed
    }
}

/// State shared between a session's connection task, the batch workers
/// validating its shares, and the snapshot API.
pub struct SessionShared {
    pub id: Uuid,
    pub remote_addr: SocketAddr,
    pub protocol: ProtocolKind,
    pub extranonce1: Extranonce1,
    /// Miner/user ids resolved by the repository at authorize time.
    identity: Mutex<Option<SessionIdentity>>,
    difficulty_bits: AtomicU64,
    submitted: Mutex<SubmittedSet>,
    outcomes: Mutex<OutcomeWindow>,
    work: Mutex<WorkWindow>,
    accepted: AtomicU64,
    rejected: AtomicU64,
}

/// Repository-assigned identity for an authorized session.
#[derive(Debug, Clone)]
pub struct SessionIdentity {
    pub worker: WorkerName,
    pub miner_id: i64,
    pub user_id: i64,
}

impl SessionShared {
    pub fn new(
        remote_addr: SocketAddr,
        protocol: ProtocolKind,
        extranonce1: Extranonce1,
        initial_difficulty: f64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            remote_addr,
            protocol,
            extranonce1,
            identity: Mutex::new(None),
            difficulty_bits: AtomicU64::new(initial_difficulty.to_bits()),
            submitted: Mutex::new(SubmittedSet::new()),
            outcomes: Mutex::new(OutcomeWindow::new()),
            work: Mutex::new(WorkWindow::new()),
            accepted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    pub fn difficulty(&self) -> f64 {
        f64::from_bits(self.difficulty_bits.load(Ordering::Relaxed))
    }

    pub fn set_difficulty(&self, difficulty: f64) {
        self.difficulty_bits.store(difficulty.to_bits(), Ordering::Relaxed);
    }

    pub fn set_identity(&self, identity: SessionIdentity) {
        *self.identity.lock().expect("session identity lock poisoned") = Some(identity);
    }

    pub fn identity(&self) -> Option<SessionIdentity> {
        self.identity.lock().expect("session identity lock poisoned").clone()
    }

    pub fn contains_submitted(&self, key: &ShareKey) -> bool {
        self.submitted.lock().expect("submitted set lock poisoned").contains(key)
    }

    pub fn record_submitted(&self, key: ShareKey) {
        self.submitted.lock().expect("submitted set lock poisoned").insert(key);
    }

    pub fn submitted_len(&self) -> usize {
        self.submitted.lock().expect("submitted set lock poisoned").len()
    }

    /// Track an accept/reject outcome; true means the bad-share ratio
    /// tripped and the session should close.
    pub fn record_outcome(&self, accepted: bool) -> bool {
        if accepted {
            self.accepted.fetch_add(1, Ordering::Relaxed);
            let now = Instant::now();
            self.work
                .lock()
                .expect("work window lock poisoned")
                .record(self.difficulty(), now);
        } else {
            self.rejected.fetch_add(1, Ordering::Relaxed);
        }
        self.outcomes.lock().expect("outcome window lock poisoned").record(accepted)
    }

    pub fn accepted_count(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    pub fn rejected_count(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// Hashrate estimate over the last ten minutes, in hashes per second.
    pub fn hashrate(&self) -> f64 {
        self.work.lock().expect("work window lock poisoned").hashrate(Instant::now())
    }
}
