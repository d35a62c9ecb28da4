//! Wire envelopes
//!
//! Every line on the wire is one of four envelopes, discriminated by `Type`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "Type", rename_all = "lowercase")]
pub enum Envelope {
    Request(RequestEnvelope),
    Response(ResponseEnvelope),
    Event(EventEnvelope),
    Cancel(CancelEnvelope),
}

/// Client to server request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RequestEnvelope {
    pub seq: u64,
    pub command: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub arguments: Value,
}

/// Server answer to a request, matched by `Request_seq`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ResponseEnvelope {
    #[serde(rename = "Request_seq")]
    pub request_seq: u64,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub body: Value,
}

/// Unsolicited server notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EventEnvelope {
    pub event: String,
    #[serde(default)]
    pub body: Value,
}

/// Best-effort cancellation of an in-flight request; never acknowledged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CancelEnvelope {
    pub seq: u64,
}

impl Envelope {
    pub fn request(seq: u64, command: impl Into<String>, arguments: Value) -> Self {
        Envelope::Request(RequestEnvelope {
            seq,
            command: command.into(),
            arguments,
        })
    }

    pub fn cancel(seq: u64) -> Self {
        Envelope::Cancel(CancelEnvelope { seq })
    }

    /// Serialize as a single line (no terminator)
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }

    /// Short label for logs
    pub fn describe(&self) -> String {
        match self {
            Envelope::Request(r) => format!("request #{} {}", r.seq, r.command),
            Envelope::Response(r) => format!("response #{} {}", r.request_seq, r.command),
            Envelope::Event(e) => format!("event {}", e.event),
            Envelope::Cancel(c) => format!("cancel #{}", c.seq),
        }
    }
}
