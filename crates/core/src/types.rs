use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Prefix carried by every listener API key.
pub const API_KEY_PREFIX: &str = "wh_";

/// Flat string map used for headers, query parameters and form fields.
pub type StringMap = BTreeMap<String, String>;

/// A disposable webhook endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Listener {
    pub id: String,
    pub name: Option<String>,
    pub api_key: String,
    pub created_at: DateTime<Utc>,
}

/// Stored record of one inbound HTTP exchange against a listener.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapturedRequest {
    pub id: String,
    pub listener_id: String,
    pub method: String,
    pub path: String,
    pub headers: StringMap,
    pub body: Option<String>,
    pub query_params: Option<StringMap>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub received_at: DateTime<Utc>,
}

/// Normalized exchange that has not been assigned an id or timestamp yet.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CapturedRequestDraft {
    pub method: String,
    pub path: String,
    pub headers: StringMap,
    pub body: Option<String>,
    pub query_params: Option<StringMap>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

impl CapturedRequestDraft {
    /// Attaches the identity assigned at persistence time.
    pub fn into_record(
        self,
        id: String,
        listener_id: String,
        received_at: DateTime<Utc>,
    ) -> CapturedRequest {
        CapturedRequest {
            id,
            listener_id,
            method: self.method,
            path: self.path,
            headers: self.headers,
            body: self.body,
            query_params: self.query_params,
            ip_address: self.ip_address,
            user_agent: self.user_agent,
            received_at,
        }
    }
}
