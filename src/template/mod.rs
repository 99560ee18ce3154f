//! Block templates and the template store
//!
//! The store holds the template work is currently built from plus a short
//! ring of superseded templates. A share referencing a retired template is
//! still countable until that template's grace deadline passes; afterwards it
//! is stale.

pub mod merkle;
pub mod provider;

use crate::hashing::{compact_to_target, target_to_difficulty, Target};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info};

pub use provider::{ProviderError, SubmitResult, SubmittedBlock, TemplateProvider};

/// Monotonic job identifier; rendered as hex on the v1 wire.
pub type JobId = u64;

/// Template-store errors
#[derive(Error, Debug)]
pub enum TemplateError {
    /// Publish would move the chain view backwards (violates monotonicity)
    #[error("template not newer than current: height {height}, timestamp {timestamp}")]
    NotNewer { height: u64, timestamp: u32 },
}

/// An immutable unit of work derived from the upstream node.
///
/// The coinbase is split around the extranonce region; the full coinbase for
/// a submission is `prefix || extranonce1 || extranonce2 || suffix`.
#[derive(Debug, Clone)]
pub struct BlockTemplate {
    pub version: u32,
    pub prev_hash: [u8; 32],
    pub timestamp: u32,
    pub bits: u32,
    pub height: u64,
    /// Total coinbase payout in base units; forwarded as the reward hint
    /// when a block is recorded.
    pub coinbase_value: u64,
    pub coinbase_prefix: Vec<u8>,
    pub coinbase_suffix: Vec<u8>,
    /// Transaction ids of the non-coinbase transactions, template order.
    pub tx_ids: Vec<[u8; 32]>,
    /// Serialized non-coinbase transactions, for block assembly on a solve.
    pub transactions: Vec<Vec<u8>>,
    /// Network target expanded from `bits`.
    pub block_target: Target,
    /// Network difficulty derived from the target.
    pub difficulty: u64,
    /// Merkle path from the coinbase to the root, derived from `tx_ids`.
    pub merkle_branches: Vec<[u8; 32]>,
}

impl BlockTemplate {
    /// Build a template, deriving the network target, difficulty, and the
    /// coinbase merkle path.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        version: u32,
        prev_hash: [u8; 32],
        timestamp: u32,
        bits: u32,
        height: u64,
        coinbase_value: u64,
        coinbase_prefix: Vec<u8>,
        coinbase_suffix: Vec<u8>,
        tx_ids: Vec<[u8; 32]>,
        transactions: Vec<Vec<u8>>,
    ) -> Self {
        let block_target = compact_to_target(bits);
        let difficulty = target_to_difficulty(&block_target);
        let merkle_branches = merkle::coinbase_branches(&tx_ids);
        Self {
            version,
            prev_hash,
            timestamp,
            bits,
            height,
            coinbase_value,
            coinbase_prefix,
            coinbase_suffix,
            tx_ids,
            transactions,
            block_target,
            difficulty,
            merkle_branches,
        }
    }
}

/// Result of resolving a job id against the store.
#[derive(Debug, Clone)]
pub enum JobLookup {
    /// The job belongs to the current template
    Current(Arc<BlockTemplate>),
    /// The job's template was superseded but is within the grace window
    Graced(Arc<BlockTemplate>),
    /// Unknown, evicted, or past the grace deadline
    Stale,
}

impl JobLookup {
    pub fn template(&self) -> Option<&Arc<BlockTemplate>> {
        match self {
            JobLookup::Current(t) | JobLookup::Graced(t) => Some(t),
            JobLookup::Stale => None,
        }
    }
}

struct RetiredTemplate {
    job_id: JobId,
    template: Arc<BlockTemplate>,
    deadline: Instant,
}

struct StoreInner {
    current: Option<(JobId, Arc<BlockTemplate>)>,
    retired: VecDeque<RetiredTemplate>,
}

/// Read-mostly holder of the current template and the stale-grace ring.
pub struct TemplateStore {
    inner: RwLock<StoreInner>,
    next_job_id: AtomicU64,
    stale_grace: Duration,
    retired_capacity: usize,
}

impl TemplateStore {
    pub fn new(stale_grace: Duration, retired_capacity: usize) -> Self {
        Self {
            inner: RwLock::new(StoreInner { current: None, retired: VecDeque::new() }),
            next_job_id: AtomicU64::new(1),
            stale_grace,
            retired_capacity,
        }
    }

    /// Atomically replace the current template.
    ///
    /// The previous template moves into the grace ring with a deadline of
    /// now + stale_grace. Publishing a template that does not advance by
    /// height, or by timestamp within the same height, is rejected.
    pub fn publish(&self, template: BlockTemplate) -> Result<(JobId, Arc<BlockTemplate>), TemplateError> {
        let template = Arc::new(template);
        let mut inner = self.inner.write().expect("template store lock poisoned");

        if let Some((_, current)) = &inner.current {
            let advances = template.height > current.height
                || (template.height == current.height && template.timestamp > current.timestamp);
            if !advances {
                return Err(TemplateError::NotNewer {
                    height: template.height,
                    timestamp: template.timestamp,
                });
            }
        }

        let job_id = self.next_job_id.fetch_add(1, Ordering::Relaxed);
        if let Some((old_id, old_template)) = inner.current.take() {
            inner.retired.push_back(RetiredTemplate {
                job_id: old_id,
                template: old_template,
                deadline: Instant::now() + self.stale_grace,
            });
            while inner.retired.len() > self.retired_capacity {
                inner.retired.pop_front();
            }
        }
        inner.current = Some((job_id, Arc::clone(&template)));

        info!(
            job_id,
            height = template.height,
            bits = %format_args!("{:#x}", template.bits),
            "published block template"
        );
        Ok((job_id, template))
    }

    /// Resolve a job id to its template, if still countable.
    pub fn lookup(&self, job_id: JobId) -> JobLookup {
        let inner = self.inner.read().expect("template store lock poisoned");
        if let Some((current_id, template)) = &inner.current {
            if *current_id == job_id {
                return JobLookup::Current(Arc::clone(template));
            }
        }
        for retired in inner.retired.iter().rev() {
            if retired.job_id == job_id {
                if Instant::now() <= retired.deadline {
                    return JobLookup::Graced(Arc::clone(&retired.template));
                }
                debug!(job_id, "job past stale grace");
                return JobLookup::Stale;
            }
        }
        JobLookup::Stale
    }

    /// Snapshot of the current template, if any.
    pub fn current(&self) -> Option<(JobId, Arc<BlockTemplate>)> {
        let inner = self.inner.read().expect("template store lock poisoned");
        inner.current.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template(height: u64, timestamp: u32) -> BlockTemplate {
        BlockTemplate::new(
            0x2000_0000,
            [0xab; 32],
            timestamp,
            0x1d00ffff,
            height,
            50_0000_0000,
            vec![1, 2, 3],
            vec![4, 5, 6],
            vec![],
            vec![],
        )
    }

    #[test]
    fn publish_assigns_monotonic_job_ids() {
        let store = TemplateStore::new(Duration::from_secs(15), 4);
        let (id1, _) = store.publish(template(100, 1000)).unwrap();
        let (id2, _) = store.publish(template(101, 1001)).unwrap();
        assert!(id2 > id1);
    }

    #[test]
    fn publish_rejects_non_advancing_template() {
        let store = TemplateStore::new(Duration::from_secs(15), 4);
        store.publish(template(100, 1000)).unwrap();
        assert!(store.publish(template(100, 1000)).is_err());
        assert!(store.publish(template(99, 2000)).is_err());
        // Same height, newer timestamp advances.
        assert!(store.publish(template(100, 1001)).is_ok());
    }

    #[test]
    fn lookup_distinguishes_current_graced_stale() {
        let store = TemplateStore::new(Duration::from_secs(15), 4);
        let (id1, _) = store.publish(template(100, 1000)).unwrap();
        let (id2, _) = store.publish(template(101, 1001)).unwrap();

        assert!(matches!(store.lookup(id2), JobLookup::Current(_)));
        assert!(matches!(store.lookup(id1), JobLookup::Graced(_)));
        assert!(matches!(store.lookup(9999), JobLookup::Stale));
    }

    #[test]
    fn grace_window_expires() {
        let store = TemplateStore::new(Duration::from_millis(0), 4);
        let (id1, _) = store.publish(template(100, 1000)).unwrap();
        store.publish(template(101, 1001)).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        assert!(matches!(store.lookup(id1), JobLookup::Stale));
    }

    #[test]
    fn ring_evicts_beyond_capacity() {
        let store = TemplateStore::new(Duration::from_secs(60), 2);
        let (id1, _) = store.publish(template(100, 1000)).unwrap();
        for h in 101..=104 {
            store.publish(template(h, 1000 + h as u32)).unwrap();
        }
        // id1 was pushed out of the two-entry ring.
        assert!(matches!(store.lookup(id1), JobLookup::Stale));
    }

    #[test]
    fn template_derives_target_and_difficulty() {
        let t = template(100, 1000);
        assert_eq!(t.block_target, crate::hashing::MAX_TARGET);
        assert_eq!(t.difficulty, 1);
    }
}
