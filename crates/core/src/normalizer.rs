use serde_json::{Map, Value};
use thiserror::Error;

use crate::types::{CapturedRequestDraft, StringMap};

/// Header priority used when no explicit policy is configured.
pub const DEFAULT_CLIENT_IP_HEADERS: [&str; 4] =
    ["x-real-ip", "x-forwarded-for", "cf-connecting-ip", "x-client-ip"];

/// Errors raised while decoding a request body.
///
/// These never abort ingestion; the body is simply dropped.
#[derive(Debug, Error)]
pub enum BodyError {
    #[error("invalid json body: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid form body: {0}")]
    Form(#[from] serde_urlencoded::de::Error),
    #[error("request body could not be read")]
    Unreadable,
}

/// Inbound HTTP exchange as seen by the transport.
#[derive(Debug, Clone)]
pub struct RawExchange<'a> {
    pub method: &'a str,
    pub path_and_query: &'a str,
    /// Headers in wire order; repeated names appear once per occurrence.
    pub headers: Vec<(String, String)>,
    /// `None` when the transport could not deliver the body.
    pub body: Option<&'a [u8]>,
}

/// Body decoding strategy selected from the `Content-Type` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    Json,
    Form,
    Text,
}

impl ContentKind {
    pub fn from_content_type(value: Option<&str>) -> Self {
        let Some(value) = value else {
            return Self::Text;
        };
        let value = value.to_ascii_lowercase();
        if value.contains("application/json") {
            Self::Json
        } else if value.contains("application/x-www-form-urlencoded") {
            Self::Form
        } else {
            Self::Text
        }
    }

    /// Produces the stored representation of `body`.
    pub fn decode(self, body: &[u8]) -> Result<String, BodyError> {
        match self {
            Self::Json => {
                let value: Value = serde_json::from_slice(body)?;
                Ok(serde_json::to_string(&canonicalize(value))?)
            }
            Self::Form => {
                let pairs: Vec<(String, String)> = serde_urlencoded::from_bytes(body)?;
                let fields: StringMap = pairs.into_iter().collect();
                Ok(serde_json::to_string(&fields)?)
            }
            Self::Text => Ok(String::from_utf8_lossy(body).into_owned()),
        }
    }
}

/// Sorts object keys recursively so equal documents serialize identically.
fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let mut sorted = Map::new();
            for (key, value) in entries {
                sorted.insert(key, canonicalize(value));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}

/// Ordered list of headers trusted to carry the original client address.
///
/// Each header is read as a comma separated list and only its first segment is
/// used, which covers both single-value headers and `X-Forwarded-For` chains.
/// A header repeated over several lines is read from its first line, as if the
/// lines had been joined.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIpPolicy {
    headers: Vec<String>,
}

impl ClientIpPolicy {
    pub fn new<I, S>(headers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            headers: headers
                .into_iter()
                .map(|name| name.into().to_ascii_lowercase())
                .collect(),
        }
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn resolve(&self, headers: &[(String, String)]) -> Option<String> {
        self.headers.iter().find_map(|name| {
            let (_, value) = headers
                .iter()
                .find(|(key, _)| key.eq_ignore_ascii_case(name))?;
            let first = value.split(',').next()?.trim();
            (!first.is_empty()).then(|| first.to_string())
        })
    }
}

impl Default for ClientIpPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_CLIENT_IP_HEADERS)
    }
}

fn last_header<'h>(headers: &'h [(String, String)], name: &str) -> Option<&'h str> {
    headers
        .iter()
        .rev()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

/// Converts raw exchanges into [`CapturedRequestDraft`] values.
#[derive(Debug, Clone, Default)]
pub struct RequestNormalizer {
    ip_policy: ClientIpPolicy,
}

impl RequestNormalizer {
    pub fn new(ip_policy: ClientIpPolicy) -> Self {
        Self { ip_policy }
    }

    pub fn ip_policy(&self) -> &ClientIpPolicy {
        &self.ip_policy
    }

    /// GET and DELETE bodies are ignored even when present on the wire.
    pub fn carries_body(method: &str) -> bool {
        !matches!(method, "GET" | "DELETE")
    }

    pub fn normalize(&self, exchange: &RawExchange<'_>) -> CapturedRequestDraft {
        self.normalize_with_diagnostics(exchange).0
    }

    /// Like [`normalize`](Self::normalize), also returning the body decoding failure if any.
    pub fn normalize_with_diagnostics(
        &self,
        exchange: &RawExchange<'_>,
    ) -> (CapturedRequestDraft, Option<BodyError>) {
        // Later duplicates overwrite earlier ones.
        let headers: StringMap = exchange.headers.iter().cloned().collect();

        let (body, body_error) = if Self::carries_body(exchange.method) {
            let kind = ContentKind::from_content_type(last_header(&exchange.headers, "content-type"));
            match exchange.body.map(|bytes| kind.decode(bytes)) {
                Some(Ok(text)) => (Some(text), None),
                Some(Err(err)) => (None, Some(err)),
                None => (None, Some(BodyError::Unreadable)),
            }
        } else {
            (None, None)
        };

        let draft = CapturedRequestDraft {
            method: exchange.method.to_string(),
            path: exchange.path_and_query.to_string(),
            query_params: parse_query(exchange.path_and_query),
            ip_address: self.ip_policy.resolve(&exchange.headers),
            user_agent: last_header(&exchange.headers, "user-agent").map(str::to_string),
            headers,
            body,
        };

        (draft, body_error)
    }
}

/// Returns `None` unless the query string yields at least one parameter.
fn parse_query(path_and_query: &str) -> Option<StringMap> {
    let (_, query) = path_and_query.split_once('?')?;
    let params: StringMap = url::form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect();
    (!params.is_empty()).then_some(params)
}
