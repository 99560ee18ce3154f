//! V2 message types and payload codecs
//!
//! Message numbering follows the public mining-protocol profile. Integers
//! are little-endian; strings carry a one-byte length prefix; variable byte
//! fields a two-byte prefix; targets and hashes are raw 32 bytes.

use super::{codec::Frame, V2Error};
use crate::template::JobId;

/// Message type tags, mining-protocol numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    SetupConnection = 0x00,
    SetupConnectionSuccess = 0x01,
    SetupConnectionError = 0x02,
    ChannelEndpointChanged = 0x03,
    OpenStandardMiningChannel = 0x10,
    OpenStandardMiningChannelSuccess = 0x11,
    OpenMiningChannelError = 0x12,
    OpenExtendedMiningChannel = 0x13,
    OpenExtendedMiningChannelSuccess = 0x14,
    UpdateChannel = 0x16,
    UpdateChannelError = 0x17,
    CloseChannel = 0x18,
    SetExtranoncePrefix = 0x19,
    SubmitSharesStandard = 0x1a,
    SubmitSharesExtended = 0x1b,
    SubmitSharesSuccess = 0x1c,
    SubmitSharesError = 0x1d,
    NewMiningJob = 0x1e,
    NewExtendedMiningJob = 0x1f,
    SetNewPrevHash = 0x20,
    SetTarget = 0x21,
    SetCustomMiningJob = 0x22,
    SetCustomMiningJobSuccess = 0x23,
    SetCustomMiningJobError = 0x24,
    Reconnect = 0x25,
    SetGroupChannel = 0x26,
}

impl TryFrom<u8> for MessageType {
    type Error = V2Error;

    fn try_from(value: u8) -> Result<Self, V2Error> {
        use MessageType::*;
        Ok(match value {
            0x00 => SetupConnection,
            0x01 => SetupConnectionSuccess,
            0x02 => SetupConnectionError,
            0x03 => ChannelEndpointChanged,
            0x10 => OpenStandardMiningChannel,
            0x11 => OpenStandardMiningChannelSuccess,
            0x12 => OpenMiningChannelError,
            0x13 => OpenExtendedMiningChannel,
            0x14 => OpenExtendedMiningChannelSuccess,
            0x16 => UpdateChannel,
            0x17 => UpdateChannelError,
            0x18 => CloseChannel,
            0x19 => SetExtranoncePrefix,
            0x1a => SubmitSharesStandard,
            0x1b => SubmitSharesExtended,
            0x1c => SubmitSharesSuccess,
            0x1d => SubmitSharesError,
            0x1e => NewMiningJob,
            0x1f => NewExtendedMiningJob,
            0x20 => SetNewPrevHash,
            0x21 => SetTarget,
            0x22 => SetCustomMiningJob,
            0x23 => SetCustomMiningJobSuccess,
            0x24 => SetCustomMiningJobError,
            0x25 => Reconnect,
            0x26 => SetGroupChannel,
            other => return Err(V2Error::UnknownMessageType(other)),
        })
    }
}

/// Sequential little-endian payload reader.
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize, field: &'static str) -> Result<&'a [u8], V2Error> {
        if self.pos + n > self.data.len() {
            return Err(V2Error::Truncated(field));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self, field: &'static str) -> Result<u8, V2Error> {
        Ok(self.take(1, field)?[0])
    }

    fn u16(&mut self, field: &'static str) -> Result<u16, V2Error> {
        let b = self.take(2, field)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self, field: &'static str) -> Result<u32, V2Error> {
        let b = self.take(4, field)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self, field: &'static str) -> Result<u64, V2Error> {
        let b = self.take(8, field)?;
        Ok(u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
    }

    fn f32(&mut self, field: &'static str) -> Result<f32, V2Error> {
        let b = self.take(4, field)?;
        Ok(f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn hash(&mut self, field: &'static str) -> Result<[u8; 32], V2Error> {
        let b = self.take(32, field)?;
        let mut out = [0u8; 32];
        out.copy_from_slice(b);
        Ok(out)
    }

    fn str0_255(&mut self, field: &'static str) -> Result<String, V2Error> {
        let len = self.u8(field)? as usize;
        let bytes = self.take(len, field)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| V2Error::BadField(field))
    }

    fn bytes_u16(&mut self, field: &'static str) -> Result<Vec<u8>, V2Error> {
        let len = self.u16(field)? as usize;
        Ok(self.take(len, field)?.to_vec())
    }

    fn finish(&self, field: &'static str) -> Result<(), V2Error> {
        if self.pos == self.data.len() {
            Ok(())
        } else {
            Err(V2Error::BadField(field))
        }
    }
}

fn put_str0_255(buf: &mut Vec<u8>, s: &str) {
    let bytes = s.as_bytes();
    let len = bytes.len().min(255);
    buf.push(len as u8);
    buf.extend_from_slice(&bytes[..len]);
}

fn put_bytes_u16(buf: &mut Vec<u8>, b: &[u8]) {
    let len = b.len().min(u16::MAX as usize);
    buf.extend_from_slice(&(len as u16).to_le_bytes());
    buf.extend_from_slice(&b[..len]);
}

/// Common shape for payload codecs.
pub trait V2Payload: Sized {
    const MSG_TYPE: MessageType;

    fn encode_payload(&self, buf: &mut Vec<u8>);
    fn decode_payload(payload: &[u8]) -> Result<Self, V2Error>;

    fn into_frame(self) -> Frame
    where
        Self: Sized,
    {
        let mut buf = Vec::new();
        self.encode_payload(&mut buf);
        Frame::new(Self::MSG_TYPE as u8, buf)
    }

    fn from_frame(frame: &Frame) -> Result<Self, V2Error> {
        if frame.msg_type != Self::MSG_TYPE as u8 {
            return Err(V2Error::UnknownMessageType(frame.msg_type));
        }
        Self::decode_payload(&frame.payload)
    }
}

/// Client → server: first message after the handshake.
#[derive(Debug, Clone, PartialEq)]
pub struct SetupConnection {
    pub protocol: u8,
    pub min_version: u16,
    pub max_version: u16,
    pub flags: u32,
    pub endpoint_host: String,
    pub endpoint_port: u16,
    pub vendor: String,
    pub hardware_version: String,
    pub firmware: String,
    pub device_id: String,
}

impl V2Payload for SetupConnection {
    const MSG_TYPE: MessageType = MessageType::SetupConnection;

    fn encode_payload(&self, buf: &mut Vec<u8>) {
        buf.push(self.protocol);
        buf.extend_from_slice(&self.min_version.to_le_bytes());
        buf.extend_from_slice(&self.max_version.to_le_bytes());
        buf.extend_from_slice(&self.flags.to_le_bytes());
        put_str0_255(buf, &self.endpoint_host);
        buf.extend_from_slice(&self.endpoint_port.to_le_bytes());
        put_str0_255(buf, &self.vendor);
        put_str0_255(buf, &self.hardware_version);
        put_str0_255(buf, &self.firmware);
        put_str0_255(buf, &self.device_id);
    }

    fn decode_payload(payload: &[u8]) -> Result<Self, V2Error> {
        let mut r = Reader::new(payload);
        let message = Self {
            protocol: r.u8("protocol")?,
            min_version: r.u16("min_version")?,
            max_version: r.u16("max_version")?,
            flags: r.u32("flags")?,
            endpoint_host: r.str0_255("endpoint_host")?,
            endpoint_port: r.u16("endpoint_port")?,
            vendor: r.str0_255("vendor")?,
            hardware_version: r.str0_255("hardware_version")?,
            firmware: r.str0_255("firmware")?,
            device_id: r.str0_255("device_id")?,
        };
        r.finish("setup_connection")?;
        Ok(message)
    }
}

/// Server → client: connection accepted at `used_version`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetupConnectionSuccess {
    pub used_version: u16,
    pub flags: u32,
}

impl V2Payload for SetupConnectionSuccess {
    const MSG_TYPE: MessageType = MessageType::SetupConnectionSuccess;

    fn encode_payload(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.used_version.to_le_bytes());
        buf.extend_from_slice(&self.flags.to_le_bytes());
    }

    fn decode_payload(payload: &[u8]) -> Result<Self, V2Error> {
        let mut r = Reader::new(payload);
        let message = Self { used_version: r.u16("used_version")?, flags: r.u32("flags")? };
        r.finish("setup_connection_success")?;
        Ok(message)
    }
}

/// Server → client: connection refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetupConnectionError {
    pub flags: u32,
    pub error_code: String,
}

impl V2Payload for SetupConnectionError {
    const MSG_TYPE: MessageType = MessageType::SetupConnectionError;

    fn encode_payload(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.flags.to_le_bytes());
        put_str0_255(buf, &self.error_code);
    }

    fn decode_payload(payload: &[u8]) -> Result<Self, V2Error> {
        let mut r = Reader::new(payload);
        let message = Self { flags: r.u32("flags")?, error_code: r.str0_255("error_code")? };
        r.finish("setup_connection_error")?;
        Ok(message)
    }
}

/// Client → server: open a mining channel.
#[derive(Debug, Clone, PartialEq)]
pub struct OpenStandardMiningChannel {
    pub request_id: u32,
    pub user_identity: String,
    pub nominal_hash_rate: f32,
    pub max_target: [u8; 32],
}

impl V2Payload for OpenStandardMiningChannel {
    const MSG_TYPE: MessageType = MessageType::OpenStandardMiningChannel;

    fn encode_payload(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.request_id.to_le_bytes());
        put_str0_255(buf, &self.user_identity);
        buf.extend_from_slice(&self.nominal_hash_rate.to_le_bytes());
        buf.extend_from_slice(&self.max_target);
    }

    fn decode_payload(payload: &[u8]) -> Result<Self, V2Error> {
        let mut r = Reader::new(payload);
        let message = Self {
            request_id: r.u32("request_id")?,
            user_identity: r.str0_255("user_identity")?,
            nominal_hash_rate: r.f32("nominal_hash_rate")?,
            max_target: r.hash("max_target")?,
        };
        r.finish("open_standard_mining_channel")?;
        Ok(message)
    }
}

/// Server → client: channel open, extranonce prefix assigned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenStandardMiningChannelSuccess {
    pub request_id: u32,
    pub channel_id: u32,
    pub target: [u8; 32],
    pub extranonce_prefix: Vec<u8>,
    pub group_channel_id: u32,
}

impl V2Payload for OpenStandardMiningChannelSuccess {
    const MSG_TYPE: MessageType = MessageType::OpenStandardMiningChannelSuccess;

    fn encode_payload(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.request_id.to_le_bytes());
        buf.extend_from_slice(&self.channel_id.to_le_bytes());
        buf.extend_from_slice(&self.target);
        put_bytes_u16(buf, &self.extranonce_prefix);
        buf.extend_from_slice(&self.group_channel_id.to_le_bytes());
    }

    fn decode_payload(payload: &[u8]) -> Result<Self, V2Error> {
        let mut r = Reader::new(payload);
        let message = Self {
            request_id: r.u32("request_id")?,
            channel_id: r.u32("channel_id")?,
            target: r.hash("target")?,
            extranonce_prefix: r.bytes_u16("extranonce_prefix")?,
            group_channel_id: r.u32("group_channel_id")?,
        };
        r.finish("open_standard_mining_channel_success")?;
        Ok(message)
    }
}

/// Server → client: channel refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenMiningChannelError {
    pub request_id: u32,
    pub error_code: String,
}

impl V2Payload for OpenMiningChannelError {
    const MSG_TYPE: MessageType = MessageType::OpenMiningChannelError;

    fn encode_payload(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.request_id.to_le_bytes());
        put_str0_255(buf, &self.error_code);
    }

    fn decode_payload(payload: &[u8]) -> Result<Self, V2Error> {
        let mut r = Reader::new(payload);
        let message =
            Self { request_id: r.u32("request_id")?, error_code: r.str0_255("error_code")? };
        r.finish("open_mining_channel_error")?;
        Ok(message)
    }
}

/// Client → server: revised hash-rate estimate for a channel.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateChannel {
    pub channel_id: u32,
    pub nominal_hash_rate: f32,
    pub maximum_target: [u8; 32],
}

impl V2Payload for UpdateChannel {
    const MSG_TYPE: MessageType = MessageType::UpdateChannel;

    fn encode_payload(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.channel_id.to_le_bytes());
        buf.extend_from_slice(&self.nominal_hash_rate.to_le_bytes());
        buf.extend_from_slice(&self.maximum_target);
    }

    fn decode_payload(payload: &[u8]) -> Result<Self, V2Error> {
        let mut r = Reader::new(payload);
        let message = Self {
            channel_id: r.u32("channel_id")?,
            nominal_hash_rate: r.f32("nominal_hash_rate")?,
            maximum_target: r.hash("maximum_target")?,
        };
        r.finish("update_channel")?;
        Ok(message)
    }
}

/// Either direction: tear down a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseChannel {
    pub channel_id: u32,
    pub reason_code: String,
}

impl V2Payload for CloseChannel {
    const MSG_TYPE: MessageType = MessageType::CloseChannel;

    fn encode_payload(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.channel_id.to_le_bytes());
        put_str0_255(buf, &self.reason_code);
    }

    fn decode_payload(payload: &[u8]) -> Result<Self, V2Error> {
        let mut r = Reader::new(payload);
        let message =
            Self { channel_id: r.u32("channel_id")?, reason_code: r.str0_255("reason_code")? };
        r.finish("close_channel")?;
        Ok(message)
    }
}

/// Client → server: one share.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitSharesStandard {
    pub channel_id: u32,
    pub sequence_number: u32,
    pub job_id: JobId,
    pub nonce: u32,
    pub ntime: u32,
    pub version: u32,
    pub extranonce2: Vec<u8>,
}

impl V2Payload for SubmitSharesStandard {
    const MSG_TYPE: MessageType = MessageType::SubmitSharesStandard;

    fn encode_payload(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.channel_id.to_le_bytes());
        buf.extend_from_slice(&self.sequence_number.to_le_bytes());
        buf.extend_from_slice(&self.job_id.to_le_bytes());
        buf.extend_from_slice(&self.nonce.to_le_bytes());
        buf.extend_from_slice(&self.ntime.to_le_bytes());
        buf.extend_from_slice(&self.version.to_le_bytes());
        put_bytes_u16(buf, &self.extranonce2);
    }

    fn decode_payload(payload: &[u8]) -> Result<Self, V2Error> {
        let mut r = Reader::new(payload);
        let message = Self {
            channel_id: r.u32("channel_id")?,
            sequence_number: r.u32("sequence_number")?,
            job_id: r.u64("job_id")?,
            nonce: r.u32("nonce")?,
            ntime: r.u32("ntime")?,
            version: r.u32("version")?,
            extranonce2: r.bytes_u16("extranonce2")?,
        };
        r.finish("submit_shares_standard")?;
        Ok(message)
    }
}

/// Server → client: shares accepted up to `last_sequence_number`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitSharesSuccess {
    pub channel_id: u32,
    pub last_sequence_number: u32,
    pub new_submits_accepted_count: u32,
    pub new_shares_sum: u64,
}

impl V2Payload for SubmitSharesSuccess {
    const MSG_TYPE: MessageType = MessageType::SubmitSharesSuccess;

    fn encode_payload(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.channel_id.to_le_bytes());
        buf.extend_from_slice(&self.last_sequence_number.to_le_bytes());
        buf.extend_from_slice(&self.new_submits_accepted_count.to_le_bytes());
        buf.extend_from_slice(&self.new_shares_sum.to_le_bytes());
    }

    fn decode_payload(payload: &[u8]) -> Result<Self, V2Error> {
        let mut r = Reader::new(payload);
        let message = Self {
            channel_id: r.u32("channel_id")?,
            last_sequence_number: r.u32("last_sequence_number")?,
            new_submits_accepted_count: r.u32("new_submits_accepted_count")?,
            new_shares_sum: r.u64("new_shares_sum")?,
        };
        r.finish("submit_shares_success")?;
        Ok(message)
    }
}

/// Server → client: share rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitSharesError {
    pub channel_id: u32,
    pub sequence_number: u32,
    pub error_code: String,
}

impl V2Payload for SubmitSharesError {
    const MSG_TYPE: MessageType = MessageType::SubmitSharesError;

    fn encode_payload(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.channel_id.to_le_bytes());
        buf.extend_from_slice(&self.sequence_number.to_le_bytes());
        put_str0_255(buf, &self.error_code);
    }

    fn decode_payload(payload: &[u8]) -> Result<Self, V2Error> {
        let mut r = Reader::new(payload);
        let message = Self {
            channel_id: r.u32("channel_id")?,
            sequence_number: r.u32("sequence_number")?,
            error_code: r.str0_255("error_code")?,
        };
        r.finish("submit_shares_error")?;
        Ok(message)
    }
}

/// Server → client: new work for a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMiningJob {
    pub channel_id: u32,
    pub job_id: JobId,
    pub clean_jobs: bool,
    pub version: u32,
    pub nbits: u32,
    pub ntime: u32,
    pub coinbase_prefix: Vec<u8>,
    pub coinbase_suffix: Vec<u8>,
    pub merkle_path: Vec<[u8; 32]>,
}

impl V2Payload for NewMiningJob {
    const MSG_TYPE: MessageType = MessageType::NewMiningJob;

    fn encode_payload(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.channel_id.to_le_bytes());
        buf.extend_from_slice(&self.job_id.to_le_bytes());
        buf.push(self.clean_jobs as u8);
        buf.extend_from_slice(&self.version.to_le_bytes());
        buf.extend_from_slice(&self.nbits.to_le_bytes());
        buf.extend_from_slice(&self.ntime.to_le_bytes());
        put_bytes_u16(buf, &self.coinbase_prefix);
        put_bytes_u16(buf, &self.coinbase_suffix);
        buf.push(self.merkle_path.len().min(255) as u8);
        for node in self.merkle_path.iter().take(255) {
            buf.extend_from_slice(node);
        }
    }

    fn decode_payload(payload: &[u8]) -> Result<Self, V2Error> {
        let mut r = Reader::new(payload);
        let channel_id = r.u32("channel_id")?;
        let job_id = r.u64("job_id")?;
        let clean_jobs = r.u8("clean_jobs")? != 0;
        let version = r.u32("version")?;
        let nbits = r.u32("nbits")?;
        let ntime = r.u32("ntime")?;
        let coinbase_prefix = r.bytes_u16("coinbase_prefix")?;
        let coinbase_suffix = r.bytes_u16("coinbase_suffix")?;
        let path_len = r.u8("merkle_path_len")? as usize;
        let mut merkle_path = Vec::with_capacity(path_len);
        for _ in 0..path_len {
            merkle_path.push(r.hash("merkle_path")?);
        }
        r.finish("new_mining_job")?;
        Ok(Self {
            channel_id,
            job_id,
            clean_jobs,
            version,
            nbits,
            ntime,
            coinbase_prefix,
            coinbase_suffix,
            merkle_path,
        })
    }
}

/// Server → client: chain tip moved; prior jobs are void.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetNewPrevHash {
    pub channel_id: u32,
    pub job_id: JobId,
    pub prev_hash: [u8; 32],
    pub min_ntime: u32,
    pub nbits: u32,
}

impl V2Payload for SetNewPrevHash {
    const MSG_TYPE: MessageType = MessageType::SetNewPrevHash;

    fn encode_payload(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.channel_id.to_le_bytes());
        buf.extend_from_slice(&self.job_id.to_le_bytes());
        buf.extend_from_slice(&self.prev_hash);
        buf.extend_from_slice(&self.min_ntime.to_le_bytes());
        buf.extend_from_slice(&self.nbits.to_le_bytes());
    }

    fn decode_payload(payload: &[u8]) -> Result<Self, V2Error> {
        let mut r = Reader::new(payload);
        let message = Self {
            channel_id: r.u32("channel_id")?,
            job_id: r.u64("job_id")?,
            prev_hash: r.hash("prev_hash")?,
            min_ntime: r.u32("min_ntime")?,
            nbits: r.u32("nbits")?,
        };
        r.finish("set_new_prev_hash")?;
        Ok(message)
    }
}

/// Server → client: new share target for a channel (vardiff push).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetTarget {
    pub channel_id: u32,
    pub maximum_target: [u8; 32],
}

impl V2Payload for SetTarget {
    const MSG_TYPE: MessageType = MessageType::SetTarget;

    fn encode_payload(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.channel_id.to_le_bytes());
        buf.extend_from_slice(&self.maximum_target);
    }

    fn decode_payload(payload: &[u8]) -> Result<Self, V2Error> {
        let mut r = Reader::new(payload);
        let message =
            Self { channel_id: r.u32("channel_id")?, maximum_target: r.hash("maximum_target")? };
        r.finish("set_target")?;
        Ok(message)
    }
}

/// Server → client: drop this connection and dial the given endpoint; an
/// empty host means reconnect to the endpoint already in use. Pushed during
/// graceful shutdown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconnect {
    pub new_host: String,
    pub new_port: u16,
}

impl V2Payload for Reconnect {
    const MSG_TYPE: MessageType = MessageType::Reconnect;

    fn encode_payload(&self, buf: &mut Vec<u8>) {
        put_str0_255(buf, &self.new_host);
        buf.extend_from_slice(&self.new_port.to_le_bytes());
    }

    fn decode_payload(payload: &[u8]) -> Result<Self, V2Error> {
        let mut r = Reader::new(payload);
        let message = Self { new_host: r.str0_255("new_host")?, new_port: r.u16("new_port")? };
        r.finish("reconnect")?;
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip<T: V2Payload + PartialEq + std::fmt::Debug>(message: T) {
        let frame = message.into_frame();
        let decoded = T::from_frame(&frame).unwrap();
        let frame2 = decoded.into_frame();
        assert_eq!(frame, frame2);
    }

    #[test]
    fn setup_connection_round_trip() {
        round_trip(SetupConnection {
            protocol: 0,
            min_version: 2,
            max_version: 2,
            flags: 0,
            endpoint_host: "pool.example".into(),
            endpoint_port: 3333,
            vendor: "testvendor".into(),
            hardware_version: "hw1".into(),
            firmware: "fw1".into(),
            device_id: "dev-01".into(),
        });
    }

    #[test]
    fn submit_shares_round_trip() {
        round_trip(SubmitSharesStandard {
            channel_id: 1,
            sequence_number: 42,
            job_id: 7,
            nonce: 0xdeadbeef,
            ntime: 0x5f5e0ff0,
            version: 0x2000_0000,
            extranonce2: vec![0, 0, 0, 1],
        });
    }

    #[test]
    fn new_mining_job_round_trip() {
        round_trip(NewMiningJob {
            channel_id: 1,
            job_id: 9,
            clean_jobs: true,
            version: 0x2000_0000,
            nbits: 0x1d00ffff,
            ntime: 1000,
            coinbase_prefix: vec![1, 2, 3],
            coinbase_suffix: vec![4, 5],
            merkle_path: vec![[0x11; 32], [0x22; 32]],
        });
    }

    #[test]
    fn decode_rejects_trailing_garbage() {
        let mut frame = SetTarget { channel_id: 1, maximum_target: [0xff; 32] }.into_frame();
        let mut payload = frame.payload.to_vec();
        payload.push(0);
        frame = Frame::new(MessageType::SetTarget as u8, payload);
        assert!(SetTarget::from_frame(&frame).is_err());
    }

    #[test]
    fn decode_rejects_truncation() {
        let frame = SubmitSharesSuccess {
            channel_id: 1,
            last_sequence_number: 5,
            new_submits_accepted_count: 1,
            new_shares_sum: 8,
        }
        .into_frame();
        let truncated = Frame::new(frame.msg_type, frame.payload[..frame.payload.len() - 1].to_vec());
        assert!(matches!(
            SubmitSharesSuccess::from_frame(&truncated),
            Err(V2Error::Truncated(_))
        ));
    }

    #[test]
    fn unknown_message_type_is_rejected() {
        assert!(MessageType::try_from(0xee).is_err());
        assert!(MessageType::try_from(0x1a).is_ok());
    }

    #[test]
    fn wrong_frame_type_is_rejected() {
        let frame = SetTarget { channel_id: 1, maximum_target: [0; 32] }.into_frame();
        assert!(Reconnect::from_frame(&frame).is_err());
    }
}
