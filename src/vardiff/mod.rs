//! Variable difficulty control
//!
//! One state per session, sharded by session id. Each accepted share appends
//! an inter-arrival interval; once the window is full and the retarget
//! interval has elapsed, the controller compares the trimmed median cadence
//! against the configured target and nudges difficulty with a clamped,
//! smoothed ratio. Small corrections inside the deadband or under the 2%
//! minimum change are suppressed.

use crate::config::VardiffConfig;
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::Mutex;
use std::time::Instant;
use tracing::debug;
use uuid::Uuid;

const SHARD_COUNT: usize = 16;

/// Smoothing weight applied to the clamped adjustment ratio.
const SMOOTHING: f64 = 0.4;

/// Minimum relative change worth pushing to a miner.
const MIN_CHANGE: f64 = 0.02;

/// Per-miner retarget state.
#[derive(Debug)]
pub struct VardiffState {
    difficulty: f64,
    intervals: VecDeque<f64>,
    last_share: Option<Instant>,
    last_retarget: Instant,
    total_shares: u64,
}

impl VardiffState {
    fn new(difficulty: f64, now: Instant) -> Self {
        Self {
            difficulty,
            intervals: VecDeque::new(),
            last_share: None,
            last_retarget: now,
            total_shares: 0,
        }
    }
}

/// Sharded registry of per-session vardiff state.
pub struct VardiffController {
    config: VardiffConfig,
    shards: Vec<Mutex<HashMap<Uuid, VardiffState>>>,
}

impl VardiffController {
    pub fn new(config: VardiffConfig) -> Self {
        let shards = (0..SHARD_COUNT).map(|_| Mutex::new(HashMap::new())).collect();
        Self { config, shards }
    }

    fn shard(&self, session_id: &Uuid) -> &Mutex<HashMap<Uuid, VardiffState>> {
        let mut hasher = DefaultHasher::new();
        session_id.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % SHARD_COUNT]
    }

    /// Create state for a session; returns its starting difficulty.
    pub fn register(&self, session_id: Uuid) -> f64 {
        let difficulty = self.config.initial_difficulty;
        let mut shard = self.shard(&session_id).lock().expect("vardiff shard poisoned");
        shard.insert(session_id, VardiffState::new(difficulty, Instant::now()));
        difficulty
    }

    /// Drop state on disconnect.
    pub fn remove(&self, session_id: &Uuid) {
        let mut shard = self.shard(session_id).lock().expect("vardiff shard poisoned");
        shard.remove(session_id);
    }

    pub fn current(&self, session_id: &Uuid) -> Option<f64> {
        let shard = self.shard(session_id).lock().expect("vardiff shard poisoned");
        shard.get(session_id).map(|s| s.difficulty)
    }

    pub fn total_shares(&self, session_id: &Uuid) -> u64 {
        let shard = self.shard(session_id).lock().expect("vardiff shard poisoned");
        shard.get(session_id).map(|s| s.total_shares).unwrap_or(0)
    }

    /// Record an accepted share at `now`; returns the new difficulty when a
    /// retarget fires.
    pub fn record_share(&self, session_id: &Uuid, now: Instant) -> Option<f64> {
        let mut shard = self.shard(session_id).lock().expect("vardiff shard poisoned");
        let state = shard.get_mut(session_id)?;

        state.total_shares += 1;
        if let Some(last) = state.last_share.replace(now) {
            let delta = now.duration_since(last).as_secs_f64();
            state.intervals.push_back(delta);
            while state.intervals.len() > self.config.share_window {
                state.intervals.pop_front();
            }
        }

        if state.intervals.len() < self.config.share_window {
            return None;
        }
        if now.duration_since(state.last_retarget) < self.config.retarget_interval() {
            return None;
        }

        state.last_retarget = now;
        let average = trimmed_median(&state.intervals);
        let target = self.config.target_share_time_secs;
        let deadband = self.config.variance_percent / 100.0;
        let deviation = (average - target).abs() / target;
        if deviation <= deadband {
            return None;
        }

        let raw_ratio = target / average;
        let max_change = (0.10 + 0.05 * deviation).min(0.15);
        let clamped = raw_ratio.clamp(1.0 - max_change, 1.0 + max_change);
        let smoothed = SMOOTHING * clamped + (1.0 - SMOOTHING);
        let new_difficulty = (state.difficulty * smoothed)
            .clamp(self.config.min_difficulty, self.config.max_difficulty);

        if (new_difficulty - state.difficulty).abs() / state.difficulty < MIN_CHANGE {
            return None;
        }

        debug!(
            %session_id,
            old = state.difficulty,
            new = new_difficulty,
            cadence = average,
            "vardiff retarget"
        );
        state.difficulty = new_difficulty;
        state.intervals.clear();
        Some(new_difficulty)
    }
}

/// Median of the window after trimming the top and bottom 10% when the
/// window is large; the plain middle otherwise.
fn trimmed_median(intervals: &VecDeque<f64>) -> f64 {
    let mut sorted: Vec<f64> = intervals.iter().copied().collect();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let trim = if sorted.len() > 10 { sorted.len() / 10 } else { 0 };
    let trimmed = &sorted[trim..sorted.len() - trim];

    let mid = trimmed.len() / 2;
    if trimmed.len() % 2 == 0 {
        (trimmed[mid - 1] + trimmed[mid]) / 2.0
    } else {
        trimmed[mid]
    }
}
