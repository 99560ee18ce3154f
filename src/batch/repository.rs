//! Storage boundary
//!
//! The pool core keeps no durable state; classified shares, miner identity,
//! and found blocks cross this interface. [`MemoryRepository`] backs tests
//! and standalone development runs.

use crate::session::WorkerName;
use crate::template::JobId;
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use thiserror::Error;
use uuid::Uuid;

/// Storage-side errors
#[derive(Error, Debug)]
pub enum RepositoryError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("constraint violation: {0}")]
    Constraint(String),
}

/// Identity assigned to a worker by storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MinerRecord {
    pub miner_id: i64,
    pub user_id: i64,
}

/// One classified share bound for storage. Persistence must be idempotent
/// on (session_id, job_id, extranonce2, ntime, nonce).
#[derive(Debug, Clone)]
pub struct ShareRow {
    pub session_id: Uuid,
    pub miner_id: i64,
    pub user_id: i64,
    pub job_id: JobId,
    pub extranonce2: Vec<u8>,
    pub ntime: u32,
    pub nonce: u32,
    pub difficulty: f64,
    pub classification: &'static str,
    pub hash: Option<[u8; 32]>,
    pub rx_time: u64,
}

/// A block found by the pool.
#[derive(Debug, Clone)]
pub struct BlockRecord {
    pub height: u64,
    pub hash: [u8; 32],
    pub finder_user_id: i64,
    pub reward_hint: u64,
    pub difficulty: u64,
}

/// Capability set the storage collaborator must provide.
#[async_trait]
pub trait ShareRepository: Send + Sync {
    /// Resolve (or create) the miner row for a worker connecting from
    /// `remote_ip`.
    async fn get_or_create_miner(
        &self,
        worker: &WorkerName,
        remote_ip: IpAddr,
    ) -> Result<MinerRecord, RepositoryError>;

    /// Persist a batch of classified shares.
    async fn persist_share_batch(&self, rows: &[ShareRow]) -> Result<(), RepositoryError>;

    /// Record a found block.
    async fn record_block(&self, block: &BlockRecord) -> Result<(), RepositoryError>;
}

#[derive(Default)]
struct MemoryState {
    miners: HashMap<String, MinerRecord>,
    shares: Vec<ShareRow>,
    share_keys: HashMap<(Uuid, JobId, Vec<u8>, u32, u32), usize>,
    blocks: Vec<BlockRecord>,
    next_miner_id: i64,
}

/// In-memory repository for tests and development runs.
pub struct MemoryRepository {
    state: Mutex<MemoryState>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self { state: Mutex::new(MemoryState { next_miner_id: 1, ..Default::default() }) }
    }

    pub fn share_count(&self) -> usize {
        self.state.lock().expect("memory repository lock poisoned").shares.len()
    }

    pub fn shares(&self) -> Vec<ShareRow> {
        self.state.lock().expect("memory repository lock poisoned").shares.clone()
    }

    pub fn blocks(&self) -> Vec<BlockRecord> {
        self.state.lock().expect("memory repository lock poisoned").blocks.clone()
    }
}

impl Default for MemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ShareRepository for MemoryRepository {
    async fn get_or_create_miner(
        &self,
        worker: &WorkerName,
        _remote_ip: IpAddr,
    ) -> Result<MinerRecord, RepositoryError> {
        let mut state = self.state.lock().expect("memory repository lock poisoned");
        let key = worker.full();
        if let Some(record) = state.miners.get(&key) {
            return Ok(*record);
        }
        let record = MinerRecord {
            miner_id: state.next_miner_id,
            // One user per account name in the in-memory model.
            user_id: state.next_miner_id,
        };
        state.next_miner_id += 1;
        state.miners.insert(key, record);
        Ok(record)
    }

    async fn persist_share_batch(&self, rows: &[ShareRow]) -> Result<(), RepositoryError> {
        let mut state = self.state.lock().expect("memory repository lock poisoned");
        for row in rows {
            let key = (
                row.session_id,
                row.job_id,
                row.extranonce2.clone(),
                row.ntime,
                row.nonce,
            );
            match state.share_keys.get(&key) {
                // Idempotent replay: overwrite in place.
                Some(&index) => state.shares[index] = row.clone(),
                None => {
                    state.shares.push(row.clone());
                    let index = state.shares.len() - 1;
                    state.share_keys.insert(key, index);
                }
            }
        }
        Ok(())
    }

    async fn record_block(&self, block: &BlockRecord) -> Result<(), RepositoryError> {
        let mut state = self.state.lock().expect("memory repository lock poisoned");
        state.blocks.push(block.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(nonce: u32) -> ShareRow {
        ShareRow {
            session_id: Uuid::nil(),
            miner_id: 1,
            user_id: 1,
            job_id: 1,
            extranonce2: vec![0, 0, 0, 1],
            ntime: 1000,
            nonce,
            difficulty: 1.0,
            classification: "valid",
            hash: None,
            rx_time: 0,
        }
    }

    #[tokio::test]
    async fn miner_records_are_stable_per_worker() {
        let repo = MemoryRepository::new();
        let worker = WorkerName::parse("alice.rig1").unwrap();
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        let first = repo.get_or_create_miner(&worker, ip).await.unwrap();
        let second = repo.get_or_create_miner(&worker, ip).await.unwrap();
        assert_eq!(first, second);

        let other = WorkerName::parse("bob").unwrap();
        let third = repo.get_or_create_miner(&other, ip).await.unwrap();
        assert_ne!(first.miner_id, third.miner_id);
    }

    #[tokio::test]
    async fn share_persistence_is_idempotent_on_the_tuple() {
        let repo = MemoryRepository::new();
        repo.persist_share_batch(&[row(1), row(2)]).await.unwrap();
        repo.persist_share_batch(&[row(1)]).await.unwrap();
        assert_eq!(repo.share_count(), 2);
    }
}
