use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::IngestError;

/// A per-task override for the LLM filter credential.
///
/// `Debug`/`Display` never render the underlying value: a type-level
/// backstop for spec.md's "MUST be redacted from all logs" invariant,
/// independent of any particular log call remembering to redact.
#[derive(Clone, Deserialize, Serialize)]
pub struct ApiKey(String);

impl ApiKey {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Build an `ApiKey` from the config-level fallback credential.
    pub fn from_config(value: &str) -> Self {
        Self(value.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<redacted>")
    }
}

impl fmt::Display for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<redacted>")
    }
}

/// A decoded task body, the one that `original_payload` must preserve
/// verbatim on failure so an orchestrator can resubmit it.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Task {
    Web {
        id: String,
        url: String,
        #[serde(default)]
        depth: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        gemini_api_key: Option<ApiKey>,
    },
    File {
        id: String,
        path: String,
        #[serde(default)]
        depth: i64,
    },
}

impl Task {
    pub fn id(&self) -> &str {
        match self {
            Task::Web { id, .. } => id,
            Task::File { id, .. } => id,
        }
    }

    pub fn depth(&self) -> i64 {
        match self {
            Task::Web { depth, .. } => *depth,
            Task::File { depth, .. } => *depth,
        }
    }

    pub fn task_type(&self) -> &'static str {
        match self {
            Task::Web { .. } => "web",
            Task::File { .. } => "file",
        }
    }

    pub fn url_for_failure(&self) -> String {
        match self {
            Task::Web { url, .. } => url.clone(),
            Task::File { path, .. } => path.clone(),
        }
    }
}

/// Outcome of decoding a message body: either a known task type, or an
/// unrecognized `type` field (spec.md §9 "Dynamic message decoding": unknown
/// types map to an empty result).
pub enum DecodedBody {
    Known(Task),
    UnknownType { id: Option<String>, raw: Value },
}

/// Decode a message body as strict JSON. A body that is not valid JSON at all
/// is a hard decode failure (the message is best-effort finished with no
/// publish, per spec.md §4.E step 2). A body that parses but carries an
/// unrecognized `type` is [`DecodedBody::UnknownType`], which the dispatch
/// step treats as an empty result set.
pub fn decode_body(bytes: &[u8]) -> Result<DecodedBody, serde_json::Error> {
    let value: Value = serde_json::from_slice(bytes)?;
    match serde_json::from_value::<Task>(value.clone()) {
        Ok(task) => Ok(DecodedBody::Known(task)),
        Err(_) => {
            let id = value.get("id").and_then(|v| v.as_str()).map(|s| s.to_string());
            Ok(DecodedBody::UnknownType { id, raw: value })
        }
    }
}

/// Redact `gemini_api_key` from a decoded body before it is ever logged.
/// Returns a `serde_json::Value` safe to attach to a log record.
pub fn redacted_for_log(raw: &Value) -> Value {
    let mut v = raw.clone();
    if let Some(obj) = v.as_object_mut() {
        if obj.contains_key("gemini_api_key") {
            obj.insert("gemini_api_key".to_string(), Value::String("<redacted>".to_string()));
        }
    }
    v
}

/// Per-document-or-page metadata. File tasks populate the document fields;
/// web tasks leave this empty (spec.md §3).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default)]
    pub pages: u64,
    #[serde(default = "default_language")]
    pub language: String,
}

fn default_language() -> String {
    "en".to_string()
}

/// One handler-produced content record (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentRecord {
    pub url: String,
    pub path: String,
    pub title: String,
    pub content: String,
    pub links: BTreeSet<String>,
    pub metadata: Metadata,
}

/// The payload published back to the result topic (spec.md §3, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResultPayload {
    Success {
        source_id: String,
        correlation_id: String,
        status: SuccessStatus,
        url: String,
        path: String,
        title: String,
        content: String,
        links: BTreeSet<String>,
        metadata: Metadata,
        depth: i64,
    },
    Failure {
        source_id: String,
        correlation_id: String,
        status: FailureStatus,
        code: String,
        error: String,
        url: String,
        original_payload: Value,
    },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SuccessStatus {
    Success,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FailureStatus {
    Failed,
}

impl ResultPayload {
    pub fn success(source_id: &str, record: ContentRecord, depth: i64) -> Self {
        ResultPayload::Success {
            source_id: source_id.to_string(),
            correlation_id: source_id.to_string(),
            status: SuccessStatus::Success,
            url: record.url,
            path: record.path,
            title: record.title,
            content: record.content,
            links: record.links,
            metadata: record.metadata,
            depth,
        }
    }

    pub fn failure(source_id: &str, err: &IngestError, url: &str, original_payload: Value) -> Self {
        ResultPayload::Failure {
            source_id: source_id.to_string(),
            correlation_id: source_id.to_string(),
            status: FailureStatus::Failed,
            code: err.kind.as_code().to_string(),
            error: err.message.clone(),
            url: url.to_string(),
            original_payload,
        }
    }

    pub fn failure_with_message(source_id: &str, code: &str, message: &str, url: &str, original_payload: Value) -> Self {
        ResultPayload::Failure {
            source_id: source_id.to_string(),
            correlation_id: source_id.to_string(),
            status: FailureStatus::Failed,
            code: code.to_string(),
            error: message.to_string(),
            url: url.to_string(),
            original_payload,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}
