//! V2 connection driver
//!
//! After the NX handshake, a reader task decrypts records into frames and
//! the main task drives the channel state machine, submits shares, and
//! pushes jobs. Setup and channel-open replace the v1 subscribe/authorize
//! pair; the channel target plays the role of `mining.set_difficulty`.

use crate::batch::BatchError;
use crate::hashing::difficulty_to_target_f64;
use crate::job::{Job, JobMailbox};
use crate::server::PoolContext;
use crate::session::{CloseReason, ProtocolKind, SessionIdentity, SessionShared, SessionState, WorkerName};
use crate::stratum::v2::codec::Frame;
use crate::stratum::v2::messages::*;
use crate::stratum::v2::noise::{CipherState, HandshakeResponder, PUBKEY_LEN, V2_MAGIC};
use crate::template::BlockTemplate;
use crate::utils::current_timestamp;
use crate::validation::{Classification, InvalidReason, Share};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Protocol version this pool speaks.
const PROTOCOL_VERSION: u16 = 2;

/// Mining protocol discriminator in SetupConnection.
const MINING_PROTOCOL: u8 = 0;

/// The single standard channel id per connection.
const CHANNEL_ID: u32 = 1;

/// Handshake must complete within this window.
const HANDSHAKE_DEADLINE: Duration = Duration::from_secs(5);

const SUBMIT_REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Drive a v2 connection to completion.
pub async fn run<S>(
    context: Arc<PoolContext>,
    responder: Arc<HandshakeResponder>,
    stream: S,
    remote: SocketAddr,
    cancel: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut read_half, mut write_half) = tokio::io::split(stream);

    let handshake = tokio::time::timeout(
        HANDSHAKE_DEADLINE,
        perform_handshake(&responder, &mut read_half, &mut write_half),
    )
    .await;
    let transport = match handshake {
        Ok(Ok(transport)) => transport,
        Ok(Err(e)) => {
            debug!(%remote, error = %e, "v2 handshake failed");
            return;
        }
        Err(_) => {
            debug!(%remote, "v2 handshake deadline exceeded");
            return;
        }
    };
    let (send_cipher, recv_cipher) = transport.into_split();

    let session_cancel = cancel.child_token();
    let max_frame_bytes = context.config.stratum.max_frame_bytes;

    // Reader task: records → frames. Fatal read problems surface as a
    // close reason on the channel.
    let (inbound_tx, mut inbound_rx) = mpsc::channel::<Result<Frame, CloseReason>>(32);
    let reader_cancel = session_cancel.clone();
    let reader = tokio::spawn(async move {
        let mut recv_cipher = recv_cipher;
        loop {
            let result = read_frame(&mut read_half, &mut recv_cipher, max_frame_bytes).await;
            let fatal = result.is_err();
            if inbound_tx.send(result).await.is_err() {
                break;
            }
            if fatal {
                break;
            }
        }
        reader_cancel.cancel();
    });

    let mut conn = Connection {
        context: Arc::clone(&context),
        remote,
        state: SessionState::Fresh,
        session: None,
        mailbox: None,
        last_sent_difficulty: None,
        send_cipher,
        write_half,
        write_timeout: context.config.stratum.write_timeout(),
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
                if let Err(reason) = conn.deliver_job(&job).await {
                    break reason;
                }
            }
            inbound = inbound_rx.recv() => match inbound {
                None => break CloseReason::ClientDisconnect,
                Some(Err(reason)) => break reason,
                Some(Ok(frame)) => {
                    last_inbound = Instant::now();
                    match conn.handle_frame(frame).await {
                        Ok(true) => {}
                        Ok(false) => break CloseReason::ClientDisconnect,
                        Err(reason) => break reason,
                    }
                }
            }
        }
    };

    conn.send_farewell(&reason).await;
    conn.close(&reason);
    session_cancel.cancel();
    reader.abort();
    let _ = reader.await;
}

async fn perform_handshake<S>(
    responder: &HandshakeResponder,
    read_half: &mut ReadHalf<S>,
    write_half: &mut WriteHalf<S>,
) -> std::io::Result<crate::stratum::v2::noise::NoiseTransport>
where
    S: AsyncRead + AsyncWrite,
{
    let mut opening = [0u8; 4 + PUBKEY_LEN];
    read_half.read_exact(&mut opening).await?;
    if opening[..4] != V2_MAGIC {
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "bad v2 magic"));
    }

    let (response, transport) = responder
        .respond(&opening[4..])
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
    write_half.write_all(&response).await?;
    write_half.flush().await?;
    Ok(transport)
}

/// Read one encrypted record and decode the plaintext frame inside.
async fn read_frame<S>(
    read_half: &mut ReadHalf<S>,
    recv_cipher: &mut CipherState,
    max_frame_bytes: usize,
) -> Result<Frame, CloseReason>
where
    S: AsyncRead,
{
    let mut len_bytes = [0u8; 2];
    read_half
        .read_exact(&mut len_bytes)
        .await
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => CloseReason::ClientDisconnect,
            _ => CloseReason::IoError(e.to_string()),
        })?;
    let len = u16::from_le_bytes(len_bytes) as usize;
    if len == 0 {
        return Err(CloseReason::ProtocolError("empty record".into()));
    }

    let mut ciphertext = vec![0u8; len];
    read_half
        .read_exact(&mut ciphertext)
        .await
        .map_err(|e| CloseReason::IoError(e.to_string()))?;

    let plaintext = recv_cipher
        .open_record(&ciphertext)
        .map_err(|e| CloseReason::ProtocolError(e.to_string()))?;
    if plaintext.len() > max_frame_bytes {
        return Err(CloseReason::Oversize);
    }
    Frame::from_bytes(&plaintext).map_err(|e| CloseReason::ProtocolError(e.to_string()))
}

async fn recv_job(mailbox: Option<Arc<JobMailbox>>) -> Arc<Job> {
    match mailbox {
        Some(mailbox) => mailbox.recv().await,
        None => std::future::pending().await,
    }
}

struct Connection<S> {
    context: Arc<PoolContext>,
    remote: SocketAddr,
    state: SessionState,
    session: Option<Arc<SessionShared>>,
    mailbox: Option<Arc<JobMailbox>>,
    last_sent_difficulty: Option<f64>,
    send_cipher: CipherState,
    write_half: WriteHalf<S>,
    write_timeout: Duration,
}

impl<S: AsyncRead + AsyncWrite> Connection<S> {
    async fn send_frame(&mut self, frame: Frame) -> Result<(), CloseReason> {
        let record = self
            .send_cipher
            .seal_record(&frame.to_bytes())
            .map_err(|e| CloseReason::ProtocolError(e.to_string()))?;
        let write = async {
            self.write_half.write_all(&record).await?;
            self.write_half.flush().await
        };
        match tokio::time::timeout(self.write_timeout, write).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(CloseReason::IoError(e.to_string())),
            Err(_) => Err(CloseReason::IoError("write deadline exceeded".into())),
        }
    }

    async fn send<M: V2Payload>(&mut self, message: M) -> Result<(), CloseReason> {
        self.send_frame(message.into_frame()).await
    }

    /// Push a job; a clean job is announced with the new prev-hash first,
    /// and a changed target always precedes the work it applies to.
    async fn deliver_job(&mut self, job: &Job) -> Result<(), CloseReason> {
        if let Some(session) = self.session.clone() {
            let difficulty = session.difficulty();
            if self.last_sent_difficulty != Some(difficulty) {
                self.send(SetTarget {
                    channel_id: CHANNEL_ID,
                    maximum_target: difficulty_to_target_f64(difficulty),
                })
                .await?;
                self.last_sent_difficulty = Some(difficulty);
            }
        }
        if job.clean_jobs {
            self.send(SetNewPrevHash {
                channel_id: CHANNEL_ID,
                job_id: job.job_id,
                prev_hash: job.template.prev_hash,
                min_ntime: job.template.timestamp,
                nbits: job.template.bits,
            })
            .await?;
        }
        self.send(new_mining_job(job)).await
    }

    /// Returns Ok(false) when the client asked to close.
    async fn handle_frame(&mut self, frame: Frame) -> Result<bool, CloseReason> {
        let msg_type = MessageType::try_from(frame.msg_type)
            .map_err(|e| CloseReason::ProtocolError(e.to_string()))?;

        match msg_type {
            MessageType::SetupConnection => {
                let setup = SetupConnection::from_frame(&frame)
                    .map_err(|e| CloseReason::ProtocolError(e.to_string()))?;
                self.on_setup(setup).await?;
                Ok(true)
            }
            MessageType::OpenStandardMiningChannel => {
                let open = OpenStandardMiningChannel::from_frame(&frame)
                    .map_err(|e| CloseReason::ProtocolError(e.to_string()))?;
                self.on_open_channel(open).await?;
                Ok(true)
            }
            MessageType::SubmitSharesStandard => {
                let submit = SubmitSharesStandard::from_frame(&frame)
                    .map_err(|e| CloseReason::ProtocolError(e.to_string()))?;
                self.on_submit(submit).await?;
                Ok(true)
            }
            MessageType::UpdateChannel => {
                let update = UpdateChannel::from_frame(&frame)
                    .map_err(|e| CloseReason::ProtocolError(e.to_string()))?;
                debug!(
                    channel = update.channel_id,
                    hash_rate = %update.nominal_hash_rate,
                    "channel update noted"
                );
                Ok(true)
            }
            MessageType::CloseChannel => {
                let close = CloseChannel::from_frame(&frame)
                    .map_err(|e| CloseReason::ProtocolError(e.to_string()))?;
                debug!(channel = close.channel_id, reason = %close.reason_code, "channel closed");
                Ok(false)
            }
            other => Err(CloseReason::ProtocolError(format!(
                "unexpected message type {other:?} from client"
            ))),
        }
    }

    async fn on_setup(&mut self, setup: SetupConnection) -> Result<(), CloseReason> {
        if self.state != SessionState::Fresh {
            return Err(CloseReason::ProtocolError("duplicate setup".into()));
        }
        if setup.protocol != MINING_PROTOCOL {
            self.send(SetupConnectionError {
                flags: setup.flags,
                error_code: "unsupported-protocol".into(),
            })
            .await?;
            return Err(CloseReason::ProtocolError(format!(
                "unsupported protocol {}",
                setup.protocol
            )));
        }
        if setup.min_version > PROTOCOL_VERSION || setup.max_version < PROTOCOL_VERSION {
            self.send(SetupConnectionError {
                flags: setup.flags,
                error_code: "protocol-version-mismatch".into(),
            })
            .await?;
            return Err(CloseReason::ProtocolError("version mismatch".into()));
        }

        debug!(
            %self.remote,
            vendor = %setup.vendor,
            device = %setup.device_id,
            "v2 setup accepted"
        );
        self.send(SetupConnectionSuccess { used_version: PROTOCOL_VERSION, flags: 0 }).await?;
        self.state = SessionState::Subscribed;
        Ok(())
    }

    async fn on_open_channel(
        &mut self,
        open: OpenStandardMiningChannel,
    ) -> Result<(), CloseReason> {
        if self.state != SessionState::Subscribed {
            return Err(CloseReason::ProtocolError("channel open before setup".into()));
        }

        let Some(worker) = WorkerName::parse(&open.user_identity) else {
            self.send(OpenMiningChannelError {
                request_id: open.request_id,
                error_code: "unauthorized".into(),
            })
            .await?;
            return Ok(());
        };

        let extranonce1 = match self.context.extranonces.allocate() {
            Ok(extranonce1) => extranonce1,
            Err(e) => {
                warn!(%self.remote, error = %e, "channel open rejected");
                self.send(OpenMiningChannelError {
                    request_id: open.request_id,
                    error_code: "try-later".into(),
                })
                .await?;
                return Ok(());
            }
        };

        let session = Arc::new(SessionShared::new(
            self.remote,
            ProtocolKind::V2,
            extranonce1,
            self.context.config.vardiff.initial_difficulty,
        ));

        let record = match self
            .context
            .repository
            .get_or_create_miner(&worker, self.remote.ip())
            .await
        {
            Ok(record) => record,
            Err(e) => {
                warn!(%self.remote, error = %e, "miner lookup failed");
                self.context.extranonces.release(extranonce1);
                self.send(OpenMiningChannelError {
                    request_id: open.request_id,
                    error_code: "unauthorized".into(),
                })
                .await?;
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

        let mailbox = Arc::new(JobMailbox::new(self.context.config.stratum.mailbox_depth));
        self.context.sessions.insert(&session);
        self.context.distributor.subscribe(
            session.id,
            session.extranonce1,
            self.context.config.stratum.extranonce2_size,
            &mailbox,
        );

        info!(session = %session.id, worker = %worker.full(), %self.remote, "v2 channel open");
        self.send(OpenStandardMiningChannelSuccess {
            request_id: open.request_id,
            channel_id: CHANNEL_ID,
            target: difficulty_to_target_f64(difficulty),
            extranonce_prefix: session.extranonce1.to_vec(),
            group_channel_id: 0,
        })
        .await?;
        self.last_sent_difficulty = Some(difficulty);

        self.session = Some(Arc::clone(&session));
        self.mailbox = Some(mailbox);
        self.state = SessionState::Authorized;

        // Seed current work so the miner does not wait for the next publish.
        if let Some((job_id, template)) = self.context.store.current() {
            let job = Job {
                job_id,
                template,
                extranonce1: session.extranonce1,
                extranonce2_size: self.context.config.stratum.extranonce2_size,
                clean_jobs: true,
            };
            self.deliver_job(&job).await?;
        }
        Ok(())
    }

    async fn on_submit(&mut self, submit: SubmitSharesStandard) -> Result<(), CloseReason> {
        if self.state != SessionState::Authorized {
            self.send(SubmitSharesError {
                channel_id: submit.channel_id,
                sequence_number: submit.sequence_number,
                error_code: "unauthorized".into(),
            })
            .await?;
            return Ok(());
        }
        let session = self.session.as_ref().expect("authorized session").clone();

        if submit.channel_id != CHANNEL_ID {
            self.send(SubmitSharesError {
                channel_id: submit.channel_id,
                sequence_number: submit.sequence_number,
                error_code: "invalid-channel-id".into(),
            })
            .await?;
            return self.note_outcome(&session, false);
        }

        let share = Share {
            session: Arc::clone(&session),
            job_id: submit.job_id,
            extranonce2: submit.extranonce2.clone(),
            ntime: submit.ntime,
            nonce: submit.nonce,
            version: Some(submit.version),
            claimed_difficulty: session.difficulty(),
            rx_time: current_timestamp(),
        };

        match self.context.batch.submit_sync(share, SUBMIT_REPLY_TIMEOUT).await {
            Ok(classification) if classification.is_accepted() => {
                self.send(SubmitSharesSuccess {
                    channel_id: CHANNEL_ID,
                    last_sequence_number: submit.sequence_number,
                    new_submits_accepted_count: 1,
                    new_shares_sum: session.difficulty().round() as u64,
                })
                .await?;
                self.note_outcome(&session, true)?;
                if let Some(new_difficulty) =
                    self.context.vardiff.record_share(&session.id, Instant::now())
                {
                    session.set_difficulty(new_difficulty);
                    self.send(SetTarget {
                        channel_id: CHANNEL_ID,
                        maximum_target: difficulty_to_target_f64(new_difficulty),
                    })
                    .await?;
                    self.last_sent_difficulty = Some(new_difficulty);
                }
                Ok(())
            }
            Ok(classification) => {
                self.send(SubmitSharesError {
                    channel_id: CHANNEL_ID,
                    sequence_number: submit.sequence_number,
                    error_code: reject_code_str(&classification).into(),
                })
                .await?;
                self.note_outcome(&session, false)
            }
            Err(BatchError::QueueFull | BatchError::RateLimited | BatchError::Timeout) => {
                self.send(SubmitSharesError {
                    channel_id: CHANNEL_ID,
                    sequence_number: submit.sequence_number,
                    error_code: "try-later".into(),
                })
                .await?;
                Ok(())
            }
            Err(BatchError::Closed | BatchError::Canceled) => {
                self.send(SubmitSharesError {
                    channel_id: CHANNEL_ID,
                    sequence_number: submit.sequence_number,
                    error_code: "try-later".into(),
                })
                .await?;
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

    /// Best-effort goodbye before the socket drops. A pool shutdown points
    /// the miner back at the same endpoint with `Reconnect`; a
    /// server-initiated close tears the channel down with a reason code.
    /// A dead peer gets nothing.
    async fn send_farewell(&mut self, reason: &CloseReason) {
        let result = match reason {
            CloseReason::Shutdown => {
                if self.state == SessionState::Fresh {
                    return;
                }
                // Empty host: reconnect to the endpoint the miner already
                // knows once the pool is back.
                self.send(Reconnect { new_host: String::new(), new_port: 0 }).await
            }
            CloseReason::TooManyErrors
            | CloseReason::IdleTimeout
            | CloseReason::Oversize
            | CloseReason::ProtocolError(_) => {
                if self.state != SessionState::Authorized {
                    return;
                }
                self.send(CloseChannel {
                    channel_id: CHANNEL_ID,
                    reason_code: farewell_reason(reason).into(),
                })
                .await
            }
            CloseReason::ClientDisconnect | CloseReason::IoError(_) => return,
        };
        if let Err(e) = result {
            debug!(%self.remote, error = %e, "farewell push failed");
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
                %reason,
                "v2 session closed"
            );
        } else {
            debug!(%self.remote, %reason, "v2 connection closed before channel open");
        }
    }
}

fn new_mining_job(job: &Job) -> NewMiningJob {
    let template: &BlockTemplate = &job.template;
    NewMiningJob {
        channel_id: CHANNEL_ID,
        job_id: job.job_id,
        clean_jobs: job.clean_jobs,
        version: template.version,
        nbits: template.bits,
        ntime: template.timestamp,
        coinbase_prefix: prefix_with_extranonce(template, &job.extranonce1),
        coinbase_suffix: template.coinbase_suffix.clone(),
        merkle_path: template.merkle_branches.clone(),
    }
}

/// The miner only appends extranonce2, so its coinbase prefix already
/// carries the pool-assigned extranonce1.
fn prefix_with_extranonce(template: &BlockTemplate, extranonce1: &[u8]) -> Vec<u8> {
    let mut prefix =
        Vec::with_capacity(template.coinbase_prefix.len() + extranonce1.len());
    prefix.extend_from_slice(&template.coinbase_prefix);
    prefix.extend_from_slice(extranonce1);
    prefix
}

fn farewell_reason(reason: &CloseReason) -> &'static str {
    match reason {
        CloseReason::TooManyErrors => "too-many-errors",
        CloseReason::IdleTimeout => "idle-timeout",
        CloseReason::Oversize => "oversize-frame",
        CloseReason::ProtocolError(_) => "protocol-error",
        _ => "closing",
    }
}

fn reject_code_str(classification: &Classification) -> &'static str {
    match classification {
        Classification::Stale => "stale-share",
        Classification::Duplicate => "duplicate-share",
        Classification::Invalid(InvalidReason::AboveTarget) => "difficulty-too-low",
        Classification::Invalid(_) => "invalid-share",
        Classification::Valid | Classification::Block => "accepted",
    }
}
