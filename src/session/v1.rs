//! V1 connection driver
//!
//! One task reads line-JSON requests and drives the state machine; a writer
//! task owns the outbound half so frames stay strictly ordered even when
//! job fan-out and submit replies interleave. Job delivery always re-sends
//! the difficulty first when it changed since the last push.

use crate::batch::BatchError;
use crate::job::{Job, JobMailbox};
use crate::server::PoolContext;
use crate::session::{CloseReason, ProtocolKind, SessionIdentity, SessionShared, SessionState, WorkerName};
use crate::stratum::v1::{self, methods, AuthorizeParams, Message, SubmitParams};
use crate::stratum::RejectCode;
use crate::template::JobId;
use crate::utils::current_timestamp;
use crate::validation::Share;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Subscription id echoed in the subscribe reply.
const SUBSCRIPTION_ID: &str = "fp0001";

/// Ceiling on waiting for a share classification before telling the miner
/// to retry.
const SUBMIT_REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Outbound line queue depth per connection.
const OUTBOUND_QUEUE: usize = 64;

/// Drive a v1 connection to completion.
pub async fn run<S>(
    context: Arc<PoolContext>,
    stream: S,
    remote: SocketAddr,
    cancel: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let mut reader = FramedRead::new(
        read_half,
        LinesCodec::new_with_max_length(context.config.stratum.max_frame_bytes),
    );

    let (out_tx, mut out_rx) = mpsc::channel::<String>(OUTBOUND_QUEUE);
    let write_timeout = context.config.stratum.write_timeout();
    let session_cancel = cancel.child_token();

    let writer_cancel = session_cancel.clone();
    let writer = tokio::spawn(async move {
        let mut writer = FramedWrite::new(write_half, LinesCodec::new());
        while let Some(line) = out_rx.recv().await {
            match tokio::time::timeout(write_timeout, writer.send(line)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    debug!(error = %e, "v1 write failed");
                    writer_cancel.cancel();
                    break;
                }
                Err(_) => {
                    warn!("v1 write deadline exceeded");
                    writer_cancel.cancel();
                    break;
                }
            }
        }
    });

    let mut conn = Connection {
        context: Arc::clone(&context),
        remote,
        state: SessionState::Fresh,
        session: None,
        mailbox: None,
        last_sent_difficulty: None,
        last_job_sent: None,
        out_tx,
    };

    let idle_timeout = context.config.stratum.idle_timeout();
    let mut last_inbound = Instant::now();

    let reason = loop {
        let idle_at = tokio::time::Instant::from_std(last_inbound + idle_timeout);
        // The mailbox handle is cloned out so the branch future owns it and
        // the handlers below can borrow the connection mutably.
        let mailbox = conn.mailbox.clone();
        tokio::select! {
            _ = session_cancel.cancelled() => break CloseReason::Shutdown,
            _ = tokio::time::sleep_until(idle_at) => break CloseReason::IdleTimeout,
            job = recv_job(mailbox) => {
                if !conn.deliver_job(&job).await {
                    break CloseReason::IoError("outbound queue closed".into());
                }
            }
            line = reader.next() => match line {
                None => break CloseReason::ClientDisconnect,
                Some(Err(LinesCodecError::MaxLineLengthExceeded)) => break CloseReason::Oversize,
                Some(Err(LinesCodecError::Io(e))) => break CloseReason::IoError(e.to_string()),
                Some(Ok(line)) => {
                    last_inbound = Instant::now();
                    match conn.handle_line(&line).await {
                        Ok(()) => {}
                        Err(reason) => break reason,
                    }
                }
            }
        }
    };

    conn.close(&reason);
    session_cancel.cancel();
    drop(conn);
    let _ = writer.await;
}

async fn recv_job(mailbox: Option<Arc<JobMailbox>>) -> Arc<Job> {
    match mailbox {
        Some(mailbox) => mailbox.recv().await,
        None => std::future::pending().await,
    }
}

struct Connection {
    context: Arc<PoolContext>,
    remote: SocketAddr,
    state: SessionState,
    session: Option<Arc<SessionShared>>,
    mailbox: Option<Arc<JobMailbox>>,
    last_sent_difficulty: Option<f64>,
    last_job_sent: Option<JobId>,
    out_tx: mpsc::Sender<String>,
}

impl Connection {
    async fn send(&self, message: &Message) -> bool {
        let line = match message.to_line() {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "failed to serialize v1 message");
                return false;
            }
        };
        self.out_tx.send(line).await.is_ok()
    }

    async fn reply_ok(&self, id: Value, result: Value) -> bool {
        self.send(&Message::ok(id, result)).await
    }

    async fn reply_reject(&self, id: Value, code: RejectCode) -> bool {
        self.send(&Message::err(id, code.into_reply())).await
    }

    async fn reply_error(&self, id: Value, code: i32, message: &str) -> bool {
        self.send(&Message::err(id, json!([code, message, Value::Null]))).await
    }

    /// Push a job, preceded by the current difficulty when it changed.
    async fn deliver_job(&mut self, job: &Job) -> bool {
        if let Some(session) = &self.session {
            let difficulty = session.difficulty();
            if self.last_sent_difficulty != Some(difficulty) {
                if !self.send(&v1::set_difficulty(difficulty)).await {
                    return false;
                }
                self.last_sent_difficulty = Some(difficulty);
            }
        }
        self.last_job_sent = Some(job.job_id);
        self.send(&v1::notify(job)).await
    }

    async fn handle_line(&mut self, line: &str) -> Result<(), CloseReason> {
        let message = Message::from_line(line)
            .map_err(|e| CloseReason::ProtocolError(format!("malformed frame: {e}")))?;

        let (id, method, params) = match message {
            Message::Request { id, method, params } => (id, method, params),
            // Clients have no business sending notifications or responses;
            // ignore them rather than punish a chatty miner.
            other => {
                debug!(?other, "ignoring non-request v1 message");
                return Ok(());
            }
        };

        match method.as_str() {
            methods::SUBSCRIBE => self.on_subscribe(id).await,
            methods::AUTHORIZE => self.on_authorize(id, params).await,
            methods::SUBMIT => self.on_submit(id, params).await,
            "mining.configure" => {
                // No extensions negotiated; an empty result keeps miners going.
                self.reply_ok(id, json!({})).await;
                Ok(())
            }
            other => Err(CloseReason::ProtocolError(format!("unknown method {other}"))),
        }
    }

    async fn on_subscribe(&mut self, id: Value) -> Result<(), CloseReason> {
        if self.state != SessionState::Fresh {
            self.reply_error(id, RejectCode::Other.code(), "already subscribed").await;
            return Ok(());
        }

        let extranonce1 = match self.context.extranonces.allocate() {
            Ok(extranonce1) => extranonce1,
            Err(e) => {
                // Existing sessions keep working; only new subscribes fail.
                warn!(%self.remote, error = %e, "subscribe rejected");
                self.reply_error(id, RejectCode::Other.code(), "extranonce pool exhausted").await;
                return Ok(());
            }
        };

        let session = Arc::new(SessionShared::new(
            self.remote,
            ProtocolKind::V1,
            extranonce1,
            self.context.config.vardiff.initial_difficulty,
        ));
        let mailbox = Arc::new(JobMailbox::new(self.context.config.stratum.mailbox_depth));
        self.context.sessions.insert(&session);

        let extranonce2_size = self.context.config.stratum.extranonce2_size;
        let result = v1::subscribe_result(&session.extranonce1, extranonce2_size, SUBSCRIPTION_ID);

        debug!(
            session = %session.id,
            %self.remote,
            extranonce1 = %hex::encode(session.extranonce1),
            "subscribed"
        );

        self.session = Some(session);
        self.mailbox = Some(mailbox);
        self.state = SessionState::Subscribed;
        self.reply_ok(id, result).await;
        Ok(())
    }

    async fn on_authorize(&mut self, id: Value, params: Value) -> Result<(), CloseReason> {
        if self.state != SessionState::Subscribed {
            let message = if self.state == SessionState::Authorized {
                "already authorized"
            } else {
                "subscribe first"
            };
            self.reply_error(id, RejectCode::NotSubscribed.code(), message).await;
            return Ok(());
        }

        let authorize: AuthorizeParams = match serde_json::from_value(params) {
            Ok(authorize) => authorize,
            Err(e) => {
                return Err(CloseReason::ProtocolError(format!("bad authorize params: {e}")))
            }
        };

        let Some(worker) = WorkerName::parse(authorize.worker_name()) else {
            self.reply_reject(id, RejectCode::Unauthorized).await;
            return Ok(());
        };

        let session = self.session.as_ref().expect("subscribed session").clone();
        let record = match self
            .context
            .repository
            .get_or_create_miner(&worker, self.remote.ip())
            .await
        {
            Ok(record) => record,
            Err(e) => {
                warn!(%self.remote, error = %e, "miner lookup failed");
                self.reply_reject(id, RejectCode::Unauthorized).await;
                return Ok(());
            }
        };

        session.set_identity(SessionIdentity {
            worker: worker.clone(),
            miner_id: record.miner_id,
            user_id: record.user_id,
        });

        let difficulty = self.context.vardiff.register(session.id);
        session.set_difficulty(difficulty);

        let mailbox = self.mailbox.as_ref().expect("subscribed mailbox");
        self.context.distributor.subscribe(
            session.id,
            session.extranonce1,
            self.context.config.stratum.extranonce2_size,
            mailbox,
        );

        self.state = SessionState::Authorized;
        info!(session = %session.id, worker = %worker.full(), %self.remote, "authorized");
        self.reply_ok(id, json!(true)).await;

        // Seed the miner: difficulty, then the current job if one exists.
        if !self.send(&v1::set_difficulty(difficulty)).await {
            return Err(CloseReason::IoError("outbound queue closed".into()));
        }
        self.last_sent_difficulty = Some(difficulty);

        if let Some((job_id, template)) = self.context.store.current() {
            let job = Job {
                job_id,
                template,
                extranonce1: session.extranonce1,
                extranonce2_size: self.context.config.stratum.extranonce2_size,
                clean_jobs: true,
            };
            self.last_job_sent = Some(job_id);
            if !self.send(&v1::notify(&job)).await {
                return Err(CloseReason::IoError("outbound queue closed".into()));
            }
        }
        Ok(())
    }

    async fn on_submit(&mut self, id: Value, params: Value) -> Result<(), CloseReason> {
        if self.state != SessionState::Authorized {
            self.reply_reject(id, RejectCode::Unauthorized).await;
            return Ok(());
        }
        let session = self.session.as_ref().expect("authorized session").clone();

        let submit: SubmitParams = match serde_json::from_value(params) {
            Ok(submit) => submit,
            Err(e) => {
                return Err(CloseReason::ProtocolError(format!("bad submit params: {e}")))
            }
        };

        // Malformed fields reject without touching the pipeline.
        let parsed = submit.job_id().and_then(|job_id| {
            Ok((job_id, submit.extranonce2()?, submit.ntime()?, submit.nonce()?))
        });
        let (job_id, extranonce2, ntime, nonce) = match parsed {
            Ok(parsed) => parsed,
            Err(e) => {
                debug!(session = %session.id, error = %e, "malformed submit");
                self.reply_reject(id, RejectCode::Other).await;
                return self.note_outcome(&session, false);
            }
        };

        let share = Share {
            session: Arc::clone(&session),
            job_id,
            extranonce2,
            ntime,
            nonce,
            version: None,
            claimed_difficulty: session.difficulty(),
            rx_time: current_timestamp(),
        };

        match self.context.batch.submit_sync(share, SUBMIT_REPLY_TIMEOUT).await {
            Ok(classification) if classification.is_accepted() => {
                self.reply_ok(id, json!(true)).await;
                self.note_outcome(&session, true)?;
                if let Some(new_difficulty) =
                    self.context.vardiff.record_share(&session.id, Instant::now())
                {
                    session.set_difficulty(new_difficulty);
                    if self.send(&v1::set_difficulty(new_difficulty)).await {
                        self.last_sent_difficulty = Some(new_difficulty);
                    }
                }
                Ok(())
            }
            Ok(classification) => {
                let code = classification
                    .reject_code()
                    .unwrap_or(RejectCode::Other);
                self.reply_reject(id, code).await;
                self.note_outcome(&session, false)
            }
            Err(BatchError::QueueFull | BatchError::RateLimited | BatchError::Timeout) => {
                // Backpressure is the pool's problem, not the miner's; do
                // not count it toward the bad-share ratio.
                self.reply_reject(id, RejectCode::TryAgainLater).await;
                Ok(())
            }
            Err(BatchError::Closed | BatchError::Canceled) => {
                self.reply_reject(id, RejectCode::TryAgainLater).await;
                Ok(())
            }
        }
    }

    fn note_outcome(
        &self,
        session: &Arc<SessionShared>,
        accepted: bool,
    ) -> Result<(), CloseReason> {
        if session.record_outcome(accepted) {
            Err(CloseReason::TooManyErrors)
        } else {
            Ok(())
        }
    }

    fn close(&mut self, reason: &CloseReason) {
        self.state = SessionState::Closed;
        if let Some(session) = self.session.take() {
            self.context.sessions.remove(&session.id);
            self.context.distributor.unsubscribe(&session.id);
            self.context.vardiff.remove(&session.id);
            self.context.extranonces.release(session.extranonce1);
            info!(
                session = %session.id,
                %self.remote,
                accepted = session.accepted_count(),
                rejected = session.rejected_count(),
                last_job = ?self.last_job_sent,
                %reason,
                "v1 session closed"
            );
        } else {
            debug!(%self.remote, %reason, "v1 connection closed before subscribe");
        }
    }
}
