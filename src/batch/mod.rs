//! Batched share processing
//!
//! Submissions enter a bounded queue and are drained by a worker pool in
//! batches. Overload never blocks the submitting connection: a full queue
//! or an exhausted rate budget drops the share and counts it. Callers that
//! need the classification use [`BatchProcessor::submit_sync`], which
//! preserves reply ordering per caller.

pub mod repository;

use crate::template::{SubmitResult, TemplateProvider};
use crate::validation::{Classification, Share, ShareValidator, Validation};
use repository::{BlockRecord, ShareRepository, ShareRow};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::BatchConfig;

/// Batch pipeline errors surfaced to submitters.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum BatchError {
    #[error("share queue full")]
    QueueFull,

    #[error("rate_limit_exceeded")]
    RateLimited,

    #[error("processor stopped")]
    Closed,

    #[error("timed out waiting for classification")]
    Timeout,

    #[error("worker dropped before replying")]
    Canceled,
}

/// Monotonic pipeline counters, snapshot form.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchStatistics {
    pub received: u64,
    pub processed: u64,
    pub valid: u64,
    pub invalid: u64,
    pub stale: u64,
    pub dropped: u64,
    pub blocks: u64,
    pub queue_high_water: u64,
}

#[derive(Default)]
struct Counters {
    received: AtomicU64,
    processed: AtomicU64,
    valid: AtomicU64,
    invalid: AtomicU64,
    stale: AtomicU64,
    dropped: AtomicU64,
    blocks: AtomicU64,
    queue_high_water: AtomicU64,
}

impl Counters {
    fn in_flight(&self) -> u64 {
        let received = self.received.load(Ordering::Relaxed);
        let done = self.processed.load(Ordering::Relaxed) + self.dropped.load(Ordering::Relaxed);
        received.saturating_sub(done)
    }

    fn note_depth(&self) {
        self.queue_high_water.fetch_max(self.in_flight(), Ordering::Relaxed);
    }

    fn snapshot(&self) -> BatchStatistics {
        BatchStatistics {
            received: self.received.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            valid: self.valid.load(Ordering::Relaxed),
            invalid: self.invalid.load(Ordering::Relaxed),
            stale: self.stale.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            blocks: self.blocks.load(Ordering::Relaxed),
            queue_high_water: self.queue_high_water.load(Ordering::Relaxed),
        }
    }
}

/// Refilled once per second; 0 capacity disables the limiter.
struct TokenBucket {
    capacity: u64,
    tokens: u64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: u64) -> Self {
        Self { capacity, tokens: capacity, last_refill: Instant::now() }
    }

    fn try_take(&mut self) -> bool {
        let now = Instant::now();
        if now.duration_since(self.last_refill) >= Duration::from_secs(1) {
            self.tokens = self.capacity;
            self.last_refill = now;
        }
        if self.tokens == 0 {
            return false;
        }
        self.tokens -= 1;
        true
    }
}

struct WorkItem {
    share: Share,
    reply: Option<oneshot::Sender<Classification>>,
}

/// Bounded-queue worker pool classifying and persisting shares.
pub struct BatchProcessor {
    tx: mpsc::Sender<WorkItem>,
    counters: Arc<Counters>,
    limiter: Option<Mutex<TokenBucket>>,
    closed: AtomicBool,
    cancel: CancellationToken,
    workers: Mutex<Option<JoinSet<()>>>,
    drain_timeout: Duration,
}

impl BatchProcessor {
    /// Spawn the worker pool and return the shared handle.
    pub fn start(
        config: &BatchConfig,
        validator: Arc<ShareValidator>,
        repository: Arc<dyn ShareRepository>,
        provider: Arc<dyn TemplateProvider>,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel::<WorkItem>(config.queue_size);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let counters = Arc::new(Counters::default());
        let cancel = CancellationToken::new();

        let mut workers = JoinSet::new();
        for worker_id in 0..config.worker_count {
            workers.spawn(worker_loop(
                worker_id,
                Arc::clone(&rx),
                Arc::clone(&counters),
                Arc::clone(&validator),
                Arc::clone(&repository),
                Arc::clone(&provider),
                cancel.clone(),
                config.batch_size,
                config.batch_timeout(),
            ));
        }
        info!(workers = config.worker_count, queue = config.queue_size, "batch processor started");

        Arc::new(Self {
            tx,
            counters,
            limiter: (config.max_shares_per_second > 0)
                .then(|| Mutex::new(TokenBucket::new(config.max_shares_per_second))),
            closed: AtomicBool::new(false),
            cancel,
            workers: Mutex::new(Some(workers)),
            drain_timeout: config.drain_timeout(),
        })
    }

    fn admit(&self, item: WorkItem) -> Result<(), BatchError> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(BatchError::Closed);
        }
        self.counters.received.fetch_add(1, Ordering::Relaxed);

        if let Some(limiter) = &self.limiter {
            let allowed = limiter.lock().expect("rate limiter lock poisoned").try_take();
            if !allowed {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                return Err(BatchError::RateLimited);
            }
        }

        match self.tx.try_send(item) {
            Ok(()) => {
                self.counters.note_depth();
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                Err(BatchError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                Err(BatchError::Closed)
            }
        }
    }

    /// Fire-and-forget enqueue; overload drops the share and counts it.
    pub fn submit(&self, share: Share) -> Result<(), BatchError> {
        self.admit(WorkItem { share, reply: None })
    }

    /// Enqueue and wait for the classification, bounded by `timeout`.
    pub async fn submit_sync(
        &self,
        share: Share,
        timeout: Duration,
    ) -> Result<Classification, BatchError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.admit(WorkItem { share, reply: Some(reply_tx) })?;
        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(classification)) => Ok(classification),
            Ok(Err(_)) => Err(BatchError::Canceled),
            Err(_) => Err(BatchError::Timeout),
        }
    }

    pub fn statistics(&self) -> BatchStatistics {
        self.counters.snapshot()
    }

    pub fn in_flight(&self) -> u64 {
        self.counters.in_flight()
    }

    /// Close the submit port, drain within the configured timeout, then
    /// stop the workers.
    pub async fn stop(&self) {
        if self.closed.swap(true, Ordering::Relaxed) {
            return;
        }

        let deadline = Instant::now() + self.drain_timeout;
        while self.counters.in_flight() > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let leftover = self.counters.in_flight();
        if leftover > 0 {
            warn!(leftover, "batch drain timeout expired with items in flight");
        }

        self.cancel.cancel();
        let workers = self.workers.lock().expect("worker set lock poisoned").take();
        if let Some(mut workers) = workers {
            let join_all = async {
                while workers.join_next().await.is_some() {}
            };
            if tokio::time::timeout(Duration::from_secs(1), join_all).await.is_err() {
                warn!("aborting batch workers that ignored cancellation");
            }
        }
        info!("batch processor stopped");
    }
}

#[allow(clippy::too_many_arguments)]
async fn worker_loop(
    worker_id: usize,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<WorkItem>>>,
    counters: Arc<Counters>,
    validator: Arc<ShareValidator>,
    repository: Arc<dyn ShareRepository>,
    provider: Arc<dyn TemplateProvider>,
    cancel: CancellationToken,
    batch_size: usize,
    batch_timeout: Duration,
) {
    loop {
        let batch = tokio::select! {
            _ = cancel.cancelled() => break,
            batch = next_batch(&rx, batch_size, batch_timeout) => batch,
        };
        let Some(batch) = batch else { break };
        process_batch(&counters, &validator, &repository, &provider, batch).await;
    }
    debug!(worker_id, "batch worker exited");
}

/// Pull up to `batch_size` items, waiting at most `batch_timeout` after the
/// first. Returns `None` when the channel is closed and empty.
async fn next_batch(
    rx: &tokio::sync::Mutex<mpsc::Receiver<WorkItem>>,
    batch_size: usize,
    batch_timeout: Duration,
) -> Option<Vec<WorkItem>> {
    let mut rx = rx.lock().await;
    let first = rx.recv().await?;
    let mut batch = Vec::with_capacity(batch_size);
    batch.push(first);

    let deadline = tokio::time::sleep(batch_timeout);
    tokio::pin!(deadline);
    while batch.len() < batch_size {
        tokio::select! {
            _ = &mut deadline => break,
            item = rx.recv() => match item {
                Some(item) => batch.push(item),
                None => break,
            },
        }
    }
    Some(batch)
}

async fn process_batch(
    counters: &Counters,
    validator: &ShareValidator,
    repository: &Arc<dyn ShareRepository>,
    provider: &Arc<dyn TemplateProvider>,
    batch: Vec<WorkItem>,
) {
    let mut rows = Vec::with_capacity(batch.len());

    for item in batch {
        let WorkItem { share, reply } = item;
        let validation = validator.validate(&share);
        tally(counters, &validation.classification);

        if let Some(solve) = &validation.block {
            handle_block_solve(repository, provider, &share, &validation, solve).await;
        }

        rows.push(build_row(&share, &validation));
        counters.processed.fetch_add(1, Ordering::Relaxed);

        if let Some(reply) = reply {
            let _ = reply.send(validation.classification);
        }
    }

    if let Err(e) = repository.persist_share_batch(&rows).await {
        // Accounting is repository-side idempotent; a failed batch is
        // logged and surfaced through storage monitoring, not the miner.
        error!(rows = rows.len(), error = %e, "failed to persist share batch");
    }
}

fn tally(counters: &Counters, classification: &Classification) {
    match classification {
        Classification::Valid => {
            counters.valid.fetch_add(1, Ordering::Relaxed);
        }
        Classification::Block => {
            counters.valid.fetch_add(1, Ordering::Relaxed);
            counters.blocks.fetch_add(1, Ordering::Relaxed);
        }
        Classification::Stale => {
            counters.stale.fetch_add(1, Ordering::Relaxed);
        }
        Classification::Duplicate | Classification::Invalid(_) => {
            counters.invalid.fetch_add(1, Ordering::Relaxed);
        }
    }
}

fn build_row(share: &Share, validation: &Validation) -> ShareRow {
    let identity = share.session.identity();
    ShareRow {
        session_id: share.session.id,
        miner_id: identity.as_ref().map(|i| i.miner_id).unwrap_or(0),
        user_id: identity.as_ref().map(|i| i.user_id).unwrap_or(0),
        job_id: share.job_id,
        extranonce2: share.extranonce2.clone(),
        ntime: share.ntime,
        nonce: share.nonce,
        difficulty: share.claimed_difficulty,
        classification: validation.classification.label(),
        hash: validation.hash,
        rx_time: share.rx_time,
    }
}

async fn handle_block_solve(
    repository: &Arc<dyn ShareRepository>,
    provider: &Arc<dyn TemplateProvider>,
    share: &Share,
    validation: &Validation,
    solve: &crate::validation::BlockSolve,
) {
    let height = solve.submission.height;
    info!(
        height,
        session = %share.session.id,
        hash = %validation.hash.map(hex::encode).unwrap_or_default(),
        "block-worthy share, submitting upstream"
    );

    match provider.submit_block(solve.submission.clone()).await {
        Ok(SubmitResult::Accepted) => info!(height, "upstream accepted block"),
        Ok(SubmitResult::Rejected(reason)) => {
            warn!(height, %reason, "upstream rejected block")
        }
        Err(e) => error!(height, error = %e, "block submission failed"),
    }

    let record = BlockRecord {
        height,
        hash: validation.hash.unwrap_or_default(),
        finder_user_id: share.session.identity().map(|i| i.user_id).unwrap_or(0),
        reward_hint: solve.coinbase_value,
        difficulty: solve.network_difficulty,
    };
    if let Err(e) = repository.record_block(&record).await {
        error!(height, error = %e, "failed to record block");
    }
}

#[cfg(test)]
mod tests {
    use super::repository::MemoryRepository;
    use super::*;
    use crate::hashing::{HashEngine, HashError};
    use crate::session::{ProtocolKind, SessionShared};
    use crate::template::provider::{ProviderError, SubmittedBlock};
    use crate::template::{BlockTemplate, TemplateStore};
    use crate::utils::current_timestamp;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    struct ZeroEngine;

    impl HashEngine for ZeroEngine {
        fn hash(&self, _data: &[u8]) -> Result<[u8; 32], HashError> {
            Ok([0u8; 32])
        }
    }

    struct CountingProvider {
        submissions: AtomicUsize,
    }

    #[async_trait]
    impl TemplateProvider for CountingProvider {
        async fn subscribe(&self) -> mpsc::Receiver<BlockTemplate> {
            let (_tx, rx) = mpsc::channel(1);
            rx
        }

        async fn submit_block(
            &self,
            _block: SubmittedBlock,
        ) -> Result<SubmitResult, ProviderError> {
            self.submissions.fetch_add(1, Ordering::Relaxed);
            Ok(SubmitResult::Accepted)
        }
    }

    struct Fixture {
        processor: Arc<BatchProcessor>,
        repository: Arc<MemoryRepository>,
        provider: Arc<CountingProvider>,
        session: Arc<SessionShared>,
        job_id: crate::template::JobId,
    }

    fn fixture(config: BatchConfig) -> Fixture {
        let store = Arc::new(TemplateStore::new(Duration::from_secs(15), 4));
        let template = BlockTemplate::new(
            0x2000_0000,
            [0xab; 32],
            1_700_000_000,
            0x1d00ffff,
            100,
            50_0000_0000,
            vec![0x01],
            vec![0x02],
            vec![],
            vec![],
        );
        let (job_id, _) = store.publish(template).unwrap();

        let validator = Arc::new(ShareValidator::new(store, Arc::new(ZeroEngine), 4));
        let repository = Arc::new(MemoryRepository::new());
        let provider = Arc::new(CountingProvider { submissions: AtomicUsize::new(0) });
        let processor = BatchProcessor::start(
            &config,
            validator,
            Arc::clone(&repository) as Arc<dyn ShareRepository>,
            Arc::clone(&provider) as Arc<dyn TemplateProvider>,
        );
        let session = Arc::new(SessionShared::new(
            "127.0.0.1:5555".parse().unwrap(),
            ProtocolKind::V1,
            [0xa1, 0xb2, 0xc3, 0xd4],
            1.0,
        ));
        Fixture { processor, repository, provider, session, job_id }
    }

    fn share(fixture: &Fixture, nonce: u32) -> Share {
        Share {
            session: Arc::clone(&fixture.session),
            job_id: fixture.job_id,
            extranonce2: vec![0, 0, 0, 1],
            ntime: 1_700_000_000,
            nonce,
            version: None,
            claimed_difficulty: 1.0,
            rx_time: current_timestamp(),
        }
    }

    #[tokio::test]
    async fn submit_sync_returns_classification_and_persists() {
        let f = fixture(BatchConfig::default());
        let classification =
            f.processor.submit_sync(share(&f, 1), Duration::from_secs(2)).await.unwrap();
        assert_eq!(classification, Classification::Block);

        let stats = f.processor.statistics();
        assert_eq!(stats.received, 1);
        assert_eq!(stats.valid, 1);
        assert_eq!(stats.blocks, 1);
        assert_eq!(f.repository.share_count(), 1);
        assert_eq!(f.provider.submissions.load(Ordering::Relaxed), 1);
        assert_eq!(f.repository.blocks().len(), 1);
        assert_eq!(f.repository.blocks()[0].reward_hint, 50_0000_0000);
        f.processor.stop().await;
    }

    #[tokio::test]
    async fn duplicate_counts_as_invalid_without_second_submit() {
        let f = fixture(BatchConfig::default());
        let first = f.processor.submit_sync(share(&f, 9), Duration::from_secs(2)).await.unwrap();
        assert!(first.is_accepted());
        let replay = f.processor.submit_sync(share(&f, 9), Duration::from_secs(2)).await.unwrap();
        assert_eq!(replay, Classification::Duplicate);

        let stats = f.processor.statistics();
        assert_eq!(stats.valid, 1);
        assert_eq!(stats.invalid, 1);
        assert_eq!(f.provider.submissions.load(Ordering::Relaxed), 1);
        f.processor.stop().await;
    }

    #[tokio::test]
    async fn rate_limit_drops_and_counts() {
        let config = BatchConfig { max_shares_per_second: 100, ..BatchConfig::default() };
        let f = fixture(config);

        let mut dropped = 0;
        for nonce in 0..200 {
            match f.processor.submit(share(&f, nonce)) {
                Ok(()) => {}
                Err(BatchError::RateLimited) => dropped += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert!(dropped >= 50, "only {dropped} shares were rate limited");

        let stats = f.processor.statistics();
        assert_eq!(stats.received, 200);
        assert!(stats.dropped >= 50);
        f.processor.stop().await;
    }

    #[tokio::test]
    async fn received_balances_processed_dropped_after_stop() {
        let f = fixture(BatchConfig::default());
        for nonce in 0..50 {
            let _ = f.processor.submit(share(&f, nonce));
        }
        // Drain fully, then check the ledger identity.
        tokio::time::sleep(Duration::from_millis(200)).await;
        f.processor.stop().await;

        let stats = f.processor.statistics();
        assert_eq!(stats.received, stats.processed + stats.dropped);
        assert_eq!(f.processor.in_flight(), 0);
        assert_eq!(f.repository.share_count() as u64, stats.processed);
    }

    #[tokio::test]
    async fn closed_processor_rejects_submissions() {
        let f = fixture(BatchConfig::default());
        f.processor.stop().await;
        assert_eq!(f.processor.submit(share(&f, 1)), Err(BatchError::Closed));
        let result = f.processor.submit_sync(share(&f, 2), Duration::from_millis(100)).await;
        assert_eq!(result.unwrap_err(), BatchError::Closed);
    }

    #[tokio::test]
    async fn queue_full_drops_shares() {
        let config = BatchConfig {
            worker_count: 1,
            queue_size: 1,
            batch_size: 1,
            batch_timeout_ms: 1,
            ..BatchConfig::default()
        };
        let f = fixture(config);
        let mut saw_queue_full = false;
        for nonce in 0..500 {
            if f.processor.submit(share(&f, nonce)) == Err(BatchError::QueueFull) {
                saw_queue_full = true;
                break;
            }
        }
        assert!(saw_queue_full, "queue never filled");
        f.processor.stop().await;
    }
}
