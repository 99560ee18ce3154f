//! Job distribution
//!
//! A job binds the current block template to one session's extranonce space.
//! The distributor fans new templates out to every authorized session
//! through small bounded mailboxes; overload drops the lowest-value work
//! (old non-clean jobs) instead of blocking the publisher.

use crate::template::{BlockTemplate, JobId};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, Weak};
use thiserror::Error;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// Extranonce1 width in bytes.
pub const EXTRANONCE1_SIZE: usize = 4;

/// Pool-assigned per-session extranonce.
pub type Extranonce1 = [u8; EXTRANONCE1_SIZE];

/// Extranonce allocation errors
#[derive(Error, Debug)]
pub enum ExtranonceError {
    /// All 2^32 values are in use; new subscribes are rejected
    #[error("extranonce pool exhausted")]
    Exhausted,
}

struct ExtranonceInner {
    next: u64,
    free: Vec<u32>,
}

/// Allocator guaranteeing extranonce1 uniqueness across live sessions.
///
/// Allocation and release are O(1): released values go to a free list,
/// otherwise a counter hands out fresh ones.
pub struct ExtranoncePool {
    inner: Mutex<ExtranonceInner>,
}

impl ExtranoncePool {
    pub fn new() -> Self {
        Self { inner: Mutex::new(ExtranonceInner { next: 0, free: Vec::new() }) }
    }

    pub fn allocate(&self) -> Result<Extranonce1, ExtranonceError> {
        let mut inner = self.inner.lock().expect("extranonce pool lock poisoned");
        let value = if let Some(reused) = inner.free.pop() {
            reused
        } else if inner.next <= u32::MAX as u64 {
            let fresh = inner.next as u32;
            inner.next += 1;
            fresh
        } else {
            return Err(ExtranonceError::Exhausted);
        };
        Ok(value.to_be_bytes())
    }

    pub fn release(&self, extranonce: Extranonce1) {
        let mut inner = self.inner.lock().expect("extranonce pool lock poisoned");
        inner.free.push(u32::from_be_bytes(extranonce));
    }
}

impl Default for ExtranoncePool {
    fn default() -> Self {
        Self::new()
    }
}

/// One session's view of a published template.
#[derive(Debug, Clone)]
pub struct Job {
    pub job_id: JobId,
    pub template: Arc<BlockTemplate>,
    pub extranonce1: Extranonce1,
    pub extranonce2_size: u8,
    /// True when prior jobs must be abandoned (new chain tip)
    pub clean_jobs: bool,
}

/// Bounded outbound job queue owned by a session.
///
/// A clean job evicts everything pending; when full, the oldest pending
/// non-clean job is dropped to make room.
pub struct JobMailbox {
    queue: Mutex<VecDeque<Arc<Job>>>,
    notify: Notify,
    capacity: usize,
}

impl JobMailbox {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    /// Non-blocking push with the eviction policy above.
    pub fn push(&self, job: Arc<Job>) {
        {
            let mut queue = self.queue.lock().expect("mailbox lock poisoned");
            if job.clean_jobs {
                queue.clear();
            } else if queue.len() >= self.capacity {
                if let Some(pos) = queue.iter().position(|j| !j.clean_jobs) {
                    let _ = queue.remove(pos);
                } else {
                    // Only clean jobs pending; the newcomer is the lowest
                    // value work, so drop it.
                    trace!(job_id = job.job_id, "mailbox full of clean jobs, dropping update");
                    return;
                }
            }
            queue.push_back(job);
        }
        self.notify.notify_one();
    }

    pub fn pop(&self) -> Option<Arc<Job>> {
        self.queue.lock().expect("mailbox lock poisoned").pop_front()
    }

    /// Await the next pending job.
    pub async fn recv(&self) -> Arc<Job> {
        loop {
            let notified = self.notify.notified();
            if let Some(job) = self.pop() {
                return job;
            }
            notified.await;
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.queue.lock().expect("mailbox lock poisoned").len()
    }
}

struct Subscription {
    mailbox: Weak<JobMailbox>,
    extranonce1: Extranonce1,
    extranonce2_size: u8,
}

struct PendingPublish {
    job_id: JobId,
    template: Arc<BlockTemplate>,
    clean_jobs: bool,
}

/// Fan-out of published templates to authorized sessions.
///
/// The registry holds weak mailbox handles only; a disconnected session is
/// reaped on the next fan-out. Publishes arriving while a fan-out is in
/// flight coalesce into a single latest-wins slot.
pub struct JobDistributor {
    registry: Mutex<HashMap<Uuid, Subscription>>,
    pending: Mutex<Option<PendingPublish>>,
    notify: Notify,
}

impl JobDistributor {
    pub fn new() -> Self {
        Self {
            registry: Mutex::new(HashMap::new()),
            pending: Mutex::new(None),
            notify: Notify::new(),
        }
    }

    /// Register an authorized session for job delivery.
    pub fn subscribe(
        &self,
        session_id: Uuid,
        extranonce1: Extranonce1,
        extranonce2_size: u8,
        mailbox: &Arc<JobMailbox>,
    ) {
        let mut registry = self.registry.lock().expect("distributor lock poisoned");
        registry.insert(
            session_id,
            Subscription {
                mailbox: Arc::downgrade(mailbox),
                extranonce1,
                extranonce2_size,
            },
        );
        debug!(%session_id, subscribers = registry.len(), "session subscribed for jobs");
    }

    pub fn unsubscribe(&self, session_id: &Uuid) {
        let mut registry = self.registry.lock().expect("distributor lock poisoned");
        registry.remove(session_id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry.lock().expect("distributor lock poisoned").len()
    }

    /// Queue a publish for fan-out, replacing any not-yet-delivered one.
    pub fn announce(&self, job_id: JobId, template: Arc<BlockTemplate>, clean_jobs: bool) {
        {
            let mut pending = self.pending.lock().expect("distributor lock poisoned");
            if let Some(old) = pending.replace(PendingPublish { job_id, template, clean_jobs }) {
                debug!(superseded = old.job_id, by = job_id, "coalesced template publish");
            }
        }
        self.notify.notify_one();
    }

    /// Drive fan-outs until cancelled. Run as a dedicated task.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            let notified = self.notify.notified();
            if let Some(publish) = self.take_pending() {
                self.fan_out(&publish);
                continue;
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = notified => {}
            }
        }
        debug!("job distributor stopped");
    }

    fn take_pending(&self) -> Option<PendingPublish> {
        self.pending.lock().expect("distributor lock poisoned").take()
    }

    fn fan_out(&self, publish: &PendingPublish) {
        let mut dead = Vec::new();
        let mut delivered = 0usize;
        {
            let registry = self.registry.lock().expect("distributor lock poisoned");
            for (session_id, subscription) in registry.iter() {
                match subscription.mailbox.upgrade() {
                    Some(mailbox) => {
                        mailbox.push(Arc::new(Job {
                            job_id: publish.job_id,
                            template: Arc::clone(&publish.template),
                            extranonce1: subscription.extranonce1,
                            extranonce2_size: subscription.extranonce2_size,
                            clean_jobs: publish.clean_jobs,
                        }));
                        delivered += 1;
                    }
                    None => dead.push(*session_id),
                }
            }
        }
        if !dead.is_empty() {
            let mut registry = self.registry.lock().expect("distributor lock poisoned");
            for session_id in &dead {
                registry.remove(session_id);
            }
            warn!(reaped = dead.len(), "dropped dead job subscriptions");
        }
        debug!(job_id = publish.job_id, delivered, clean = publish.clean_jobs, "job fan-out complete");
    }
}

impl Default for JobDistributor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::BlockTemplate;
    use std::time::Duration;

    fn template(height: u64) -> Arc<BlockTemplate> {
        Arc::new(BlockTemplate::new(
            0x2000_0000,
            [0; 32],
            1000,
            0x1d00ffff,
            height,
            50_0000_0000,
            vec![],
            vec![],
            vec![],
            vec![],
        ))
    }

    fn job(id: JobId, clean: bool) -> Arc<Job> {
        Arc::new(Job {
            job_id: id,
            template: template(100),
            extranonce1: [0, 0, 0, 1],
            extranonce2_size: 4,
            clean_jobs: clean,
        })
    }

    #[test]
    fn extranonce_values_are_unique_until_released() {
        let pool = ExtranoncePool::new();
        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();
        assert_ne!(a, b);
        pool.release(a);
        let c = pool.allocate().unwrap();
        assert_eq!(a, c);
    }

    #[test]
    fn mailbox_drops_oldest_non_clean_when_full() {
        let mailbox = JobMailbox::new(2);
        mailbox.push(job(1, false));
        mailbox.push(job(2, false));
        mailbox.push(job(3, false));
        assert_eq!(mailbox.len(), 2);
        assert_eq!(mailbox.pop().unwrap().job_id, 2);
        assert_eq!(mailbox.pop().unwrap().job_id, 3);
    }

    #[test]
    fn clean_job_evicts_all_pending() {
        let mailbox = JobMailbox::new(4);
        mailbox.push(job(1, false));
        mailbox.push(job(2, false));
        mailbox.push(job(3, true));
        assert_eq!(mailbox.len(), 1);
        assert!(mailbox.pop().unwrap().clean_jobs);
    }

    #[tokio::test]
    async fn distributor_delivers_bound_jobs() {
        let distributor = Arc::new(JobDistributor::new());
        let mailbox = Arc::new(JobMailbox::new(4));
        let session_id = Uuid::new_v4();
        distributor.subscribe(session_id, [0xa1, 0xb2, 0xc3, 0xd4], 4, &mailbox);

        let cancel = CancellationToken::new();
        let runner = tokio::spawn(Arc::clone(&distributor).run(cancel.clone()));

        distributor.announce(7, template(100), true);

        let job = tokio::time::timeout(Duration::from_secs(1), mailbox.recv())
            .await
            .expect("fan-out timed out");
        assert_eq!(job.job_id, 7);
        assert_eq!(job.extranonce1, [0xa1, 0xb2, 0xc3, 0xd4]);
        assert!(job.clean_jobs);

        cancel.cancel();
        runner.await.unwrap();
    }

    #[tokio::test]
    async fn dropped_mailbox_is_reaped() {
        let distributor = Arc::new(JobDistributor::new());
        let mailbox = Arc::new(JobMailbox::new(4));
        let session_id = Uuid::new_v4();
        distributor.subscribe(session_id, [0; 4], 4, &mailbox);
        drop(mailbox);

        distributor.fan_out(&PendingPublish {
            job_id: 1,
            template: template(100),
            clean_jobs: true,
        });
        assert_eq!(distributor.subscriber_count(), 0);
    }
}
