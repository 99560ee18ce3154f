//! Share validation
//!
//! A submission resolves its job, is screened for replays and malformed
//! fields, then has its full 80-byte header rebuilt and hashed. The outcome
//! is a classification value, never an error: rejects are data the pipeline
//! counts and replies with, not failures.

use crate::hashing::{difficulty_to_target_f64, meets_target, HashEngine};
use crate::session::{SessionShared, ShareKey};
use crate::stratum::RejectCode;
use crate::template::merkle::{double_sha256, fold_branches};
use crate::template::provider::SubmittedBlock;
use crate::template::{BlockTemplate, JobId, JobLookup, TemplateStore};
use std::sync::Arc;
use tracing::{debug, warn};

/// Accepted ntime drift from the template timestamp, either direction.
const NTIME_WINDOW_SECS: u32 = 2 * 60 * 60;

/// Why a share failed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidReason {
    /// Hash above the per-miner share target
    AboveTarget,
    /// Extranonce2 length does not match the subscribed size
    BadExtranonce2Length { expected: u8, got: usize },
    /// ntime outside the allowed window around the template timestamp
    NtimeOutOfWindow,
    /// Hash engine refused the header
    HashFailure,
}

/// Final classification of one submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// Meets the share target
    Valid,
    /// Meets the share target and the network block target
    Block,
    /// Job unknown or past the stale grace window
    Stale,
    /// Tuple already counted for this session
    Duplicate,
    Invalid(InvalidReason),
}

impl Classification {
    /// Accepted shares earn credit and feed vardiff.
    pub fn is_accepted(&self) -> bool {
        matches!(self, Classification::Valid | Classification::Block)
    }

    /// Reject code for the wire reply; `None` for accepted shares.
    pub fn reject_code(&self) -> Option<RejectCode> {
        match self {
            Classification::Valid | Classification::Block => None,
            Classification::Stale => Some(RejectCode::Stale),
            Classification::Duplicate => Some(RejectCode::Duplicate),
            Classification::Invalid(InvalidReason::AboveTarget) => Some(RejectCode::LowDifficulty),
            Classification::Invalid(_) => Some(RejectCode::Other),
        }
    }

    /// Stable label for logs and persisted rows.
    pub fn label(&self) -> &'static str {
        match self {
            Classification::Valid => "valid",
            Classification::Block => "block",
            Classification::Stale => "stale",
            Classification::Duplicate => "duplicate",
            Classification::Invalid(InvalidReason::AboveTarget) => "above_target",
            Classification::Invalid(InvalidReason::BadExtranonce2Length { .. }) => {
                "bad_extranonce2"
            }
            Classification::Invalid(InvalidReason::NtimeOutOfWindow) => "ntime_out_of_window",
            Classification::Invalid(InvalidReason::HashFailure) => "hash_failure",
        }
    }
}

/// One submission traveling through the pipeline. The session handle gives
/// the validator the extranonce, current target, and replay set.
#[derive(Clone)]
pub struct Share {
    pub session: Arc<SessionShared>,
    pub job_id: JobId,
    pub extranonce2: Vec<u8>,
    pub ntime: u32,
    pub nonce: u32,
    /// Header version; defaults to the template version when the dialect
    /// does not carry one.
    pub version: Option<u32>,
    /// Session difficulty at submission time, persisted for credit.
    pub claimed_difficulty: f64,
    /// Unix receive timestamp
    pub rx_time: u64,
}

impl Share {
    fn key(&self) -> ShareKey {
        ShareKey {
            job_id: self.job_id,
            extranonce2: self.extranonce2.clone(),
            ntime: self.ntime,
            nonce: self.nonce,
        }
    }
}

/// A share that met the network target, packaged for upstream submission
/// and block accounting.
pub struct BlockSolve {
    pub submission: SubmittedBlock,
    pub network_difficulty: u64,
    pub coinbase_value: u64,
}

/// Validation outcome: the classification plus the artifacts the pipeline
/// needs downstream (digest for logging, assembled block on a solve).
pub struct Validation {
    pub classification: Classification,
    pub hash: Option<[u8; 32]>,
    pub block: Option<BlockSolve>,
}

impl Validation {
    fn reject(classification: Classification) -> Self {
        Self { classification, hash: None, block: None }
    }
}

/// Stateless share validator; all mutable state lives in the session and
/// the template store.
pub struct ShareValidator {
    store: Arc<TemplateStore>,
    engine: Arc<dyn HashEngine>,
    extranonce2_size: u8,
}

impl ShareValidator {
    pub fn new(store: Arc<TemplateStore>, engine: Arc<dyn HashEngine>, extranonce2_size: u8) -> Self {
        Self { store, engine, extranonce2_size }
    }

    pub fn validate(&self, share: &Share) -> Validation {
        // Stale jobs are decided before any target work.
        let template = match self.store.lookup(share.job_id) {
            JobLookup::Current(t) | JobLookup::Graced(t) => t,
            JobLookup::Stale => return Validation::reject(Classification::Stale),
        };

        let key = share.key();
        if share.session.contains_submitted(&key) {
            return Validation::reject(Classification::Duplicate);
        }

        if share.extranonce2.len() != self.extranonce2_size as usize {
            return Validation::reject(Classification::Invalid(
                InvalidReason::BadExtranonce2Length {
                    expected: self.extranonce2_size,
                    got: share.extranonce2.len(),
                },
            ));
        }

        if ntime_out_of_window(share.ntime, template.timestamp) {
            return Validation::reject(Classification::Invalid(InvalidReason::NtimeOutOfWindow));
        }

        let coinbase = assemble_coinbase(&template, &share.session.extranonce1, &share.extranonce2);
        let header = assemble_header(&template, &coinbase, share);

        let hash = match self.engine.hash_header(&header) {
            Ok(hash) => hash,
            Err(e) => {
                warn!(session = %share.session.id, error = %e, "hash engine rejected header");
                return Validation::reject(Classification::Invalid(InvalidReason::HashFailure));
            }
        };

        let share_target = difficulty_to_target_f64(share.session.difficulty());
        if !meets_target(&hash, &share_target) {
            return Validation::reject(Classification::Invalid(InvalidReason::AboveTarget));
        }

        // The tuple is countable; remember it before reporting acceptance.
        share.session.record_submitted(key);

        if meets_target(&hash, &template.block_target) {
            debug!(
                session = %share.session.id,
                job_id = share.job_id,
                hash = %hex::encode(hash),
                "share meets network target"
            );
            let solve = BlockSolve {
                submission: SubmittedBlock {
                    header: header.to_vec(),
                    coinbase,
                    transactions: template.transactions.clone(),
                    height: template.height,
                },
                network_difficulty: template.difficulty,
                coinbase_value: template.coinbase_value,
            };
            return Validation {
                classification: Classification::Block,
                hash: Some(hash),
                block: Some(solve),
            };
        }

        Validation { classification: Classification::Valid, hash: Some(hash), block: None }
    }
}

fn ntime_out_of_window(ntime: u32, template_time: u32) -> bool {
    ntime.abs_diff(template_time) > NTIME_WINDOW_SECS
}

fn assemble_coinbase(template: &BlockTemplate, extranonce1: &[u8], extranonce2: &[u8]) -> Vec<u8> {
    let mut coinbase = Vec::with_capacity(
        template.coinbase_prefix.len()
            + extranonce1.len()
            + extranonce2.len()
            + template.coinbase_suffix.len(),
    );
    coinbase.extend_from_slice(&template.coinbase_prefix);
    coinbase.extend_from_slice(extranonce1);
    coinbase.extend_from_slice(extranonce2);
    coinbase.extend_from_slice(&template.coinbase_suffix);
    coinbase
}

/// Serialize the 80-byte header: version, prev hash, merkle root, ntime,
/// bits, nonce; integers little-endian.
fn assemble_header(template: &BlockTemplate, coinbase: &[u8], share: &Share) -> [u8; 80] {
    let coinbase_id = double_sha256(coinbase);
    let merkle_root = fold_branches(coinbase_id, &template.merkle_branches);

    let mut header = [0u8; 80];
    let version = share.version.unwrap_or(template.version);
    header[0..4].copy_from_slice(&version.to_le_bytes());
    header[4..36].copy_from_slice(&template.prev_hash);
    header[36..68].copy_from_slice(&merkle_root);
    header[68..72].copy_from_slice(&share.ntime.to_le_bytes());
    header[72..76].copy_from_slice(&template.bits.to_le_bytes());
    header[76..80].copy_from_slice(&share.nonce.to_le_bytes());
    header
}
