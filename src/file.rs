//! File handler: `handle_file` (spec.md §4.C).

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{ErrorKind, IngestError};
use crate::pool::WorkerPool;
use crate::task::{ContentRecord, Metadata};

const MAX_FILE_SIZE_BYTES: u64 = 200 * 1024 * 1024;

/// Output of a concrete conversion engine: Markdown plus a raw metadata bag
/// whose shape depends on the source format (PDF, DOCX, ...). Field lookups
/// in [`extract_metadata`] treat every field as optional.
pub struct ConversionOutput {
    pub markdown: String,
    pub metadata: Value,
}

/// The document-to-Markdown conversion engine itself is out of scope (spec.md
/// §1 Non-goals). This trait is the seam a real OCR/table-extraction engine
/// would plug into. [`PlaintextConverter`] is the minimal concrete
/// implementation, handling plain-text and Markdown sources directly so the
/// pool/timeout/recovery machinery around it is exercisable end to end.
#[async_trait]
pub trait DocumentConverter: Send + Sync {
    async fn convert(&self, path: &Path) -> Result<ConversionOutput, IngestError>;
}

pub struct PlaintextConverter;

#[async_trait]
impl DocumentConverter for PlaintextConverter {
    async fn convert(&self, path: &Path) -> Result<ConversionOutput, IngestError> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| IngestError::new(ErrorKind::InvalidFormat, format!("failed to read {}: {e}", path.display())))?;

        let text = String::from_utf8(bytes)
            .map_err(|_| IngestError::new(ErrorKind::InvalidFormat, "not a UTF-8 text document"))?;

        let title = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        Ok(ConversionOutput {
            markdown: text,
            metadata: serde_json::json!({ "title": title }),
        })
    }
}

pub fn default_converter() -> Arc<dyn DocumentConverter> {
    Arc::new(PlaintextConverter)
}

/// Pre-flight checks run synchronously in the caller's context before any
/// conversion is attempted (spec.md §4.C).
async fn preflight(path: &Path) -> Result<(), IngestError> {
    let meta = tokio::fs::metadata(path)
        .await
        .map_err(|_| IngestError::new(ErrorKind::InvalidFormat, "not found"))?;

    if !meta.is_file() {
        return Err(IngestError::new(ErrorKind::InvalidFormat, "not found"));
    }
    if meta.len() == 0 {
        return Err(IngestError::new(ErrorKind::Empty, "file is empty"));
    }
    if meta.len() > MAX_FILE_SIZE_BYTES {
        return Err(IngestError::new(ErrorKind::InvalidFormat, "too large"));
    }
    Ok(())
}

/// Map a raw, lower-cased worker-reported error message to the taxonomy
/// (spec.md §4.C "Failure mapping").
fn classify_conversion_failure(raw_message: &str) -> IngestError {
    let lower = raw_message.to_lowercase();
    let kind = if lower.contains("timeout") {
        ErrorKind::Timeout
    } else if lower.contains("password") || lower.contains("encrypted") {
        ErrorKind::Encrypted
    } else if lower.contains("format") {
        ErrorKind::InvalidFormat
    } else {
        // Spec: "otherwise -> re-raise unclassified". There is no further
        // taxonomy kind for this; surface it as INVALID_FORMAT, the closest
        // terminal kind, rather than silently defaulting to a transient one.
        ErrorKind::InvalidFormat
    };
    IngestError::new(kind, raw_message)
}

fn basename(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.to_string())
}

/// Extract `{title, author, created_at, pages, language}` from a converter's
/// raw metadata bag, falling back to `{title: basename, ...}` on any
/// extraction failure (spec.md §4.C "Result mapping").
fn extract_metadata(path: &str, raw: &Value) -> Metadata {
    let fallback = || Metadata {
        title: Some(basename(path)),
        author: None,
        created_at: None,
        pages: 0,
        language: "en".to_string(),
    };

    let Some(obj) = raw.as_object() else {
        return fallback();
    };

    let title = obj
        .get("title")
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| obj.get("origin_filename").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| basename(path));

    let author = match obj.get("author") {
        Some(Value::Array(items)) => {
            let joined = items
                .iter()
                .filter_map(Value::as_str)
                .collect::<Vec<_>>()
                .join(", ");
            if joined.is_empty() { None } else { Some(joined) }
        }
        Some(Value::String(s)) => Some(s.clone()),
        _ => None,
    };

    let created_at = obj.get("created_at").map(value_to_string);

    let pages = obj
        .get("pages")
        .and_then(Value::as_u64)
        .or_else(|| obj.get("pages").and_then(Value::as_array).map(|a| a.len() as u64))
        .unwrap_or(0);

    let language = obj
        .get("language")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| "en".to_string());

    Metadata {
        title: Some(title),
        author,
        created_at,
        pages,
        language,
    }
}

fn value_to_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub async fn handle_file(path: &str, pool: &WorkerPool) -> Result<Vec<ContentRecord>, IngestError> {
    let path_buf = PathBuf::from(path);
    preflight(&path_buf).await?;

    let response = pool.submit(&path_buf).await?;

    if !response.ok {
        let message = response.error.unwrap_or_default();
        return Err(classify_conversion_failure(&message));
    }

    let markdown = response.markdown.unwrap_or_default();
    if markdown.trim().is_empty() {
        return Err(IngestError::new(ErrorKind::Empty, "converted document has no content"));
    }

    let metadata = response
        .metadata
        .map(|raw| extract_metadata(path, &raw))
        .unwrap_or_else(|| extract_metadata(path, &Value::Null));

    Ok(vec![ContentRecord {
        url: path.to_string(),
        path: path.to_string(),
        title: metadata.title.clone().unwrap_or_default(),
        content: markdown,
        links: BTreeSet::new(),
        metadata,
    }])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn preflight_rejects_missing_file() {
        let err = preflight(Path::new("/no/such/file-ever")).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidFormat);
    }

    #[tokio::test]
    async fn preflight_rejects_empty_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let err = preflight(file.path()).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Empty);
    }

    #[tokio::test]
    async fn preflight_accepts_nonempty_file_under_limit() {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"hello").unwrap();
        assert!(preflight(file.path()).await.is_ok());
    }

    #[test]
    fn classify_conversion_failure_matches_spec_priority() {
        assert_eq!(classify_conversion_failure("operation timeout").kind, ErrorKind::Timeout);
        assert_eq!(classify_conversion_failure("file is password protected").kind, ErrorKind::Encrypted);
        assert_eq!(classify_conversion_failure("unsupported format").kind, ErrorKind::InvalidFormat);
    }

    #[test]
    fn extract_metadata_falls_back_on_malformed_bag() {
        let meta = extract_metadata("/docs/report.pdf", &Value::Null);
        assert_eq!(meta.title.as_deref(), Some("report.pdf"));
        assert_eq!(meta.language, "en");
        assert_eq!(meta.pages, 0);
        assert!(meta.author.is_none());
    }

    #[test]
    fn extract_metadata_joins_list_authors() {
        let raw = serde_json::json!({
            "title": "Doc",
            "author": ["Alice", "Bob"],
            "pages": [1, 2, 3],
        });
        let meta = extract_metadata("/x.pdf", &raw);
        assert_eq!(meta.author.as_deref(), Some("Alice, Bob"));
        assert_eq!(meta.pages, 3);
    }

    #[tokio::test]
    async fn plaintext_converter_reads_utf8_files() {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"hello world").unwrap();
        let output = PlaintextConverter.convert(file.path()).await.unwrap();
        assert_eq!(output.markdown, "hello world");
    }
}
