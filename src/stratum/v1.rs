//! Stratum v1 dialect
//!
//! UTF-8 lines, one JSON object per line. Requests carry positional params;
//! byte strings are lowercase hex, numerics decimal. Server pushes are
//! id-less notifications (`mining.notify`, `mining.set_difficulty`).

use crate::job::Job;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

/// Methods the server accepts.
pub mod methods {
    pub const SUBSCRIBE: &str = "mining.subscribe";
    pub const AUTHORIZE: &str = "mining.authorize";
    pub const SUBMIT: &str = "mining.submit";
    pub const NOTIFY: &str = "mining.notify";
    pub const SET_DIFFICULTY: &str = "mining.set_difficulty";
}

/// V1 dialect errors
#[derive(Error, Debug)]
pub enum V1Error {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("bad params for {method}: {reason}")]
    BadParams { method: &'static str, reason: String },
}

/// A single v1 line, any direction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    Request {
        id: Value,
        method: String,
        params: Value,
    },
    Notification {
        method: String,
        params: Value,
    },
    Response {
        id: Value,
        result: Option<Value>,
        error: Option<Value>,
    },
}

impl Message {
    /// Parse one line off the wire.
    pub fn from_line(line: &str) -> Result<Self, V1Error> {
        Ok(serde_json::from_str(line)?)
    }

    /// Serialize for the wire (no trailing newline; the framer adds it).
    pub fn to_line(&self) -> Result<String, V1Error> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn ok(id: Value, result: Value) -> Self {
        Message::Response { id, result: Some(result), error: None }
    }

    pub fn err(id: Value, error: Value) -> Self {
        Message::Response { id, result: None, error: Some(error) }
    }
}

/// `mining.subscribe` params: [user_agent?, session_id?]
#[derive(Debug, Clone, Deserialize)]
pub struct SubscribeParams(
    #[serde(default)] pub Option<String>,
    #[serde(default)] pub Option<String>,
);

impl SubscribeParams {
    pub fn user_agent(&self) -> Option<&str> {
        self.0.as_deref()
    }
}

/// `mining.authorize` params: [worker_name, password]
#[derive(Debug, Clone, Deserialize)]
pub struct AuthorizeParams(pub String, #[serde(default)] pub Option<String>);

impl AuthorizeParams {
    pub fn worker_name(&self) -> &str {
        &self.0
    }

    pub fn password(&self) -> Option<&str> {
        self.1.as_deref()
    }
}

/// `mining.submit` params: [worker, job_id, extranonce2, ntime, nonce],
/// the last three lowercase hex.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitParams(pub String, pub String, pub String, pub String, pub String);

impl SubmitParams {
    pub fn worker_name(&self) -> &str {
        &self.0
    }

    pub fn job_id(&self) -> Result<u64, V1Error> {
        u64::from_str_radix(&self.1, 16).map_err(|e| V1Error::BadParams {
            method: methods::SUBMIT,
            reason: format!("job_id: {e}"),
        })
    }

    pub fn extranonce2(&self) -> Result<Vec<u8>, V1Error> {
        hex::decode(&self.2).map_err(|e| V1Error::BadParams {
            method: methods::SUBMIT,
            reason: format!("extranonce2: {e}"),
        })
    }

    pub fn ntime(&self) -> Result<u32, V1Error> {
        u32::from_str_radix(&self.3, 16).map_err(|e| V1Error::BadParams {
            method: methods::SUBMIT,
            reason: format!("ntime: {e}"),
        })
    }

    pub fn nonce(&self) -> Result<u32, V1Error> {
        u32::from_str_radix(&self.4, 16).map_err(|e| V1Error::BadParams {
            method: methods::SUBMIT,
            reason: format!("nonce: {e}"),
        })
    }
}

/// Result payload for a successful subscribe.
pub fn subscribe_result(extranonce1: &[u8], extranonce2_size: u8, subscription_id: &str) -> Value {
    json!([
        [
            [methods::SET_DIFFICULTY, subscription_id],
            [methods::NOTIFY, subscription_id]
        ],
        hex::encode(extranonce1),
        extranonce2_size
    ])
}

/// Build the `mining.notify` push for a job.
pub fn notify(job: &Job) -> Message {
    let template = &job.template;
    let branches: Vec<String> = template
        .merkle_branches
        .iter()
        .map(hex::encode)
        .collect();
    Message::Notification {
        method: methods::NOTIFY.to_string(),
        params: json!([
            format!("{:x}", job.job_id),
            hex::encode(template.prev_hash),
            hex::encode(&template.coinbase_prefix),
            hex::encode(&template.coinbase_suffix),
            branches,
            format!("{:08x}", template.version),
            format!("{:08x}", template.bits),
            format!("{:08x}", template.timestamp),
            job.clean_jobs
        ]),
    }
}

/// Build the `mining.set_difficulty` push.
pub fn set_difficulty(difficulty: f64) -> Message {
    Message::Notification {
        method: methods::SET_DIFFICULTY.to_string(),
        params: json!([difficulty]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::BlockTemplate;
    use std::sync::Arc;

    #[test]
    fn parses_submit_request() {
        let line = r#"{"id":4,"method":"mining.submit","params":["alice.rig1","1f","00000001","5f5e0ff0","deadbeef"]}"#;
        let message = Message::from_line(line).unwrap();
        let Message::Request { id, method, params } = message else {
            panic!("expected request");
        };
        assert_eq!(id, json!(4));
        assert_eq!(method, methods::SUBMIT);

        let submit: SubmitParams = serde_json::from_value(params).unwrap();
        assert_eq!(submit.worker_name(), "alice.rig1");
        assert_eq!(submit.job_id().unwrap(), 0x1f);
        assert_eq!(submit.extranonce2().unwrap(), vec![0, 0, 0, 1]);
        assert_eq!(submit.ntime().unwrap(), 0x5f5e0ff0);
        assert_eq!(submit.nonce().unwrap(), 0xdeadbeef);
    }

    #[test]
    fn parses_subscribe_with_and_without_params() {
        for params in [json!([]), json!(["cgminer/4.9"]), json!(["cgminer/4.9", "sess"])] {
            let subscribe: SubscribeParams = serde_json::from_value(params).unwrap();
            let _ = subscribe.user_agent();
        }
    }

    #[test]
    fn rejects_malformed_hex_fields() {
        let submit = SubmitParams(
            "w".into(),
            "zz".into(),
            "xx".into(),
            "gg".into(),
            "hh".into(),
        );
        assert!(submit.job_id().is_err());
        assert!(submit.extranonce2().is_err());
        assert!(submit.ntime().is_err());
        assert!(submit.nonce().is_err());
    }

    #[test]
    fn notification_has_no_id() {
        let message = set_difficulty(8.0);
        let line = message.to_line().unwrap();
        let value: Value = serde_json::from_str(&line).unwrap();
        assert!(value.get("id").is_none());
        assert_eq!(value["method"], methods::SET_DIFFICULTY);
        assert_eq!(value["params"][0], 8.0);
    }

    #[test]
    fn notify_carries_job_fields() {
        let template = Arc::new(BlockTemplate::new(
            0x2000_0000,
            [0xab; 32],
            0x5f5e0ff0,
            0x1d00ffff,
            100,
            50_0000_0000,
            vec![0x01],
            vec![0x02],
            vec![[0x33; 32]],
            vec![vec![0xde]],
        ));
        let job = Job {
            job_id: 0x2a,
            template,
            extranonce1: [0xa1, 0xb2, 0xc3, 0xd4],
            extranonce2_size: 4,
            clean_jobs: true,
        };
        let Message::Notification { method, params } = notify(&job) else {
            panic!("expected notification");
        };
        assert_eq!(method, methods::NOTIFY);
        assert_eq!(params[0], "2a");
        assert_eq!(params[1], hex::encode([0xab; 32]));
        assert_eq!(params[2], "01");
        assert_eq!(params[3], "02");
        assert_eq!(params[4][0], hex::encode([0x33; 32]));
        assert_eq!(params[8], true);
    }

    #[test]
    fn untagged_round_trip_distinguishes_shapes() {
        let request = Message::Request {
            id: json!(1),
            method: methods::SUBSCRIBE.into(),
            params: json!([]),
        };
        let reparsed = Message::from_line(&request.to_line().unwrap()).unwrap();
        assert!(matches!(reparsed, Message::Request { .. }));

        let response = Message::ok(json!(1), json!(true));
        let reparsed = Message::from_line(&response.to_line().unwrap()).unwrap();
        assert!(matches!(reparsed, Message::Response { .. }));
    }
}
