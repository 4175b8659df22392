//! Wire protocol for the control socket: length-free JSON records, one
//! request and one response per connection. The client writes its
//! request and half-closes; the daemon answers and closes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::analysis::AnalysisOptions;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Command {
    Start,
    Stop,
    List,
    Inspect,
    Cleanup,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Request {
    pub command: Command,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Response {
    pub fn success(data: impl Serialize) -> Response {
        Response {
            ok: true,
            error: None,
            data: Some(serde_json::to_value(data).expect("response data serializes")),
        }
    }

    pub fn empty() -> Response {
        Response {
            ok: true,
            error: None,
            data: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Response {
        Response {
            ok: false,
            error: Some(message.into()),
            data: None,
        }
    }
}

/// One row of `list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisSummary {
    pub id: String,
    pub sample: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub c2_ip: Option<String>,
    pub running: bool,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Payload of `inspect`.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InspectReport {
    pub status: String,
    pub options: AnalysisOptions,
    /// Seconds since start, up to completion for finished analyses.
    pub duration: f64,
}
