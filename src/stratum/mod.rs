//! Stratum wire dialects
//!
//! Two dialects share one listener: the line-JSON v1 dialect and the
//! encrypted binary v2 dialect. Reject codes are shared so the share
//! pipeline can classify independently of the wire format.

pub mod v1;
pub mod v2;

use serde_json::{json, Value};

/// Stratum reject codes, v1 numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectCode {
    Other,
    Stale,
    Duplicate,
    LowDifficulty,
    Unauthorized,
    NotSubscribed,
    TryAgainLater,
}

impl RejectCode {
    pub fn code(self) -> i32 {
        match self {
            RejectCode::Other => 20,
            RejectCode::Stale => 21,
            RejectCode::Duplicate => 22,
            RejectCode::LowDifficulty => 23,
            RejectCode::Unauthorized => 24,
            RejectCode::NotSubscribed => 25,
            RejectCode::TryAgainLater => 26,
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            RejectCode::Other => "other/unknown",
            RejectCode::Stale => "job not found (stale)",
            RejectCode::Duplicate => "duplicate share",
            RejectCode::LowDifficulty => "low difficulty share",
            RejectCode::Unauthorized => "unauthorized worker",
            RejectCode::NotSubscribed => "not subscribed",
            RejectCode::TryAgainLater => "try again later",
        }
    }

    /// JSON-RPC error triple used in v1 reject replies.
    pub fn into_reply(self) -> Value {
        json!([self.code(), self.message(), Value::Null])
    }
}
