//! Proof-of-work hashing
//!
//! The pool's mining digest is a two-pass scrypt derivative: the first pass
//! keys scrypt with the input as its own salt, the second pass re-keys with a
//! byte-reflection XOR of the first digest. Target arithmetic (difficulty,
//! compact bits) lives in [`target`].

pub mod target;

use scrypt::Params;
use thiserror::Error;

pub use target::{
    compact_to_target, difficulty_to_target, difficulty_to_target_f64, meets_target,
    target_to_compact, target_to_difficulty, Target, MAX_TARGET,
};

/// Serialized block header length in bytes.
pub const HEADER_LEN: usize = 80;

/// Digest length in bytes.
pub const DIGEST_LEN: usize = 32;

/// Hashing errors
#[derive(Error, Debug)]
pub enum HashError {
    /// Input was empty
    #[error("cannot hash empty input")]
    EmptyInput,

    /// Header hashing requires exactly 80 bytes
    #[error("invalid header size: expected {HEADER_LEN} bytes, got {0}")]
    InvalidHeaderSize(usize),

    /// Scrypt parameter set was rejected
    #[error("invalid scrypt parameters: {0}")]
    InvalidParams(String),
}

/// Capability consumed by the share validator: turn bytes into a 32-byte
/// mining digest. Production uses [`ScryptVariant`]; tests may substitute a
/// contrived engine.
pub trait HashEngine: Send + Sync {
    /// Hash arbitrary non-empty input.
    fn hash(&self, data: &[u8]) -> Result<[u8; DIGEST_LEN], HashError>;

    /// Hash a serialized 80-byte block header.
    fn hash_header(&self, header: &[u8]) -> Result<[u8; DIGEST_LEN], HashError> {
        if header.len() != HEADER_LEN {
            return Err(HashError::InvalidHeaderSize(header.len()));
        }
        self.hash(header)
    }
}

/// Scrypt parameter set for the variant hash.
///
/// `n` must be a power of two. Defaults match the deployed network
/// (N=1024, r=1, p=1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScryptParams {
    pub n: u32,
    pub r: u32,
    pub p: u32,
}

impl Default for ScryptParams {
    fn default() -> Self {
        Self { n: 1024, r: 1, p: 1 }
    }
}

impl ScryptParams {
    fn to_params(self) -> Result<Params, HashError> {
        if !self.n.is_power_of_two() || self.n < 2 {
            return Err(HashError::InvalidParams(format!(
                "scrypt N must be a power of two >= 2, got {}",
                self.n
            )));
        }
        let log_n = self.n.trailing_zeros() as u8;
        Params::new(log_n, self.r, self.p, DIGEST_LEN)
            .map_err(|e| HashError::InvalidParams(e.to_string()))
    }
}

/// The two-pass scrypt-variant engine.
#[derive(Debug, Clone)]
pub struct ScryptVariant {
    params: ScryptParams,
}

impl ScryptVariant {
    pub fn new(params: ScryptParams) -> Result<Self, HashError> {
        // Reject bad parameter sets at construction, not per share.
        params.to_params()?;
        Ok(Self { params })
    }

    pub fn params(&self) -> ScryptParams {
        self.params
    }

    fn scrypt_pass(&self, input: &[u8], salt: &[u8]) -> Result<[u8; DIGEST_LEN], HashError> {
        let params = self.params.to_params()?;
        let mut out = [0u8; DIGEST_LEN];
        scrypt::scrypt(input, salt, &params, &mut out)
            .map_err(|e| HashError::InvalidParams(e.to_string()))?;
        Ok(out)
    }
}

impl Default for ScryptVariant {
    fn default() -> Self {
        Self { params: ScryptParams::default() }
    }
}

impl HashEngine for ScryptVariant {
    fn hash(&self, data: &[u8]) -> Result<[u8; DIGEST_LEN], HashError> {
        if data.is_empty() {
            return Err(HashError::EmptyInput);
        }

        // Pass 1: the input salts itself.
        let pass1 = self.scrypt_pass(data, data)?;

        // Byte reflection: transformed[i] = pass1[i] ^ pass1[31 - i].
        let mut transformed = [0u8; DIGEST_LEN];
        for i in 0..DIGEST_LEN {
            transformed[i] = pass1[i] ^ pass1[DIGEST_LEN - 1 - i];
        }

        // Pass 2: first digest keyed against its reflection.
        self.scrypt_pass(&pass1, &transformed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_deterministic() {
        let engine = ScryptVariant::default();
        let header = [0x5au8; HEADER_LEN];
        let h1 = engine.hash_header(&header).unwrap();
        let h2 = engine.hash_header(&header).unwrap();
        assert_eq!(h1, h2);
    }

    #[test]
    fn distinct_inputs_produce_distinct_digests() {
        let engine = ScryptVariant::default();
        let mut a = [0u8; HEADER_LEN];
        let mut b = [0u8; HEADER_LEN];
        a[79] = 1;
        b[79] = 2;
        assert_ne!(engine.hash_header(&a).unwrap(), engine.hash_header(&b).unwrap());
    }

    #[test]
    fn rejects_wrong_header_size() {
        let engine = ScryptVariant::default();
        let err = engine.hash_header(&[0u8; 79]).unwrap_err();
        assert!(matches!(err, HashError::InvalidHeaderSize(79)));
    }

    #[test]
    fn rejects_empty_input() {
        let engine = ScryptVariant::default();
        assert!(matches!(engine.hash(&[]), Err(HashError::EmptyInput)));
    }

    #[test]
    fn rejects_non_power_of_two_n() {
        let err = ScryptVariant::new(ScryptParams { n: 1000, r: 1, p: 1 }).unwrap_err();
        assert!(matches!(err, HashError::InvalidParams(_)));
    }

    #[test]
    fn second_pass_changes_the_digest() {
        // The reflection pass must actually feed the second scrypt call:
        // pass1 of an 80-byte header differs from the final digest.
        let engine = ScryptVariant::default();
        let header = [0x11u8; HEADER_LEN];
        let pass1 = engine.scrypt_pass(&header, &header).unwrap();
        let full = engine.hash_header(&header).unwrap();
        assert_ne!(pass1, full);
    }
}
