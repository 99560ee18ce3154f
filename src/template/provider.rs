//! Upstream template source
//!
//! The pool consumes the blockchain node through this narrow interface:
//! a stream of templates in, candidate blocks out.

use super::BlockTemplate;
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

/// Upstream communication errors
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("upstream unavailable: {0}")]
    Unavailable(String),

    #[error("upstream rejected request: {0}")]
    Rejected(String),
}

/// A solved block ready for upstream submission.
#[derive(Debug, Clone)]
pub struct SubmittedBlock {
    /// Serialized 80-byte header
    pub header: Vec<u8>,
    /// Full coinbase with both extranonces spliced in
    pub coinbase: Vec<u8>,
    /// Serialized non-coinbase transactions, template order
    pub transactions: Vec<Vec<u8>>,
    pub height: u64,
}

/// Upstream verdict on a submitted block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitResult {
    Accepted,
    Rejected(String),
}

/// Capability set the upstream node must provide.
#[async_trait]
pub trait TemplateProvider: Send + Sync {
    /// Subscribe to template updates. The provider owns the producing task;
    /// dropping the receiver cancels the subscription.
    async fn subscribe(&self) -> mpsc::Receiver<BlockTemplate>;

    /// Submit a candidate block upstream.
    async fn submit_block(&self, block: SubmittedBlock) -> Result<SubmitResult, ProviderError>;
}

/// Hand-driven provider for tests and standalone bring-up: templates are
/// pushed explicitly, submitted blocks are retained for inspection. A new
/// subscriber immediately receives the most recent template, like a real
/// upstream subscription seeding the current chain tip.
pub struct ManualTemplateProvider {
    subscribers: std::sync::Mutex<Vec<mpsc::Sender<BlockTemplate>>>,
    latest: std::sync::Mutex<Option<BlockTemplate>>,
    submissions: std::sync::Mutex<Vec<SubmittedBlock>>,
}

impl ManualTemplateProvider {
    pub fn new() -> Self {
        Self {
            subscribers: std::sync::Mutex::new(Vec::new()),
            latest: std::sync::Mutex::new(None),
            submissions: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Deliver a template to every live subscriber.
    pub fn push(&self, template: BlockTemplate) {
        *self.latest.lock().expect("provider lock poisoned") = Some(template.clone());
        let mut subscribers = self.subscribers.lock().expect("provider lock poisoned");
        subscribers.retain(|tx| tx.try_send(template.clone()).is_ok());
    }

    pub fn submissions(&self) -> Vec<SubmittedBlock> {
        self.submissions.lock().expect("provider lock poisoned").clone()
    }

    pub fn submission_count(&self) -> usize {
        self.submissions.lock().expect("provider lock poisoned").len()
    }
}

impl Default for ManualTemplateProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TemplateProvider for ManualTemplateProvider {
    async fn subscribe(&self) -> mpsc::Receiver<BlockTemplate> {
        let (tx, rx) = mpsc::channel(8);
        if let Some(latest) = self.latest.lock().expect("provider lock poisoned").clone() {
            let _ = tx.try_send(latest);
        }
        self.subscribers.lock().expect("provider lock poisoned").push(tx);
        rx
    }

    async fn submit_block(&self, block: SubmittedBlock) -> Result<SubmitResult, ProviderError> {
        self.submissions.lock().expect("provider lock poisoned").push(block);
        Ok(SubmitResult::Accepted)
    }
}
