use thiserror::Error;

/// The closed set of error kinds the rest of the pipeline reasons about.
///
/// `TRANSIENT` kinds are eligible for backoff-requeue; everything else is
/// terminal (one failure result published, message finished).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Encrypted,
    InvalidFormat,
    Empty,
    Timeout,
    CrawlTimeout,
    CrawlDns,
    CrawlRefused,
    CrawlBlocked,
}

impl ErrorKind {
    pub fn as_code(&self) -> &'static str {
        match self {
            ErrorKind::Encrypted => "ENCRYPTED",
            ErrorKind::InvalidFormat => "INVALID_FORMAT",
            ErrorKind::Empty => "EMPTY",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::CrawlTimeout => "CRAWL_TIMEOUT",
            ErrorKind::CrawlDns => "CRAWL_DNS",
            ErrorKind::CrawlRefused => "CRAWL_REFUSED",
            ErrorKind::CrawlBlocked => "CRAWL_BLOCKED",
        }
    }

    /// Parse a code previously produced by [`ErrorKind::as_code`]. Used by the
    /// round-trip property: classify -> format -> reclassify is idempotent.
    pub fn from_code(code: &str) -> Option<Self> {
        Some(match code {
            "ENCRYPTED" => ErrorKind::Encrypted,
            "INVALID_FORMAT" => ErrorKind::InvalidFormat,
            "EMPTY" => ErrorKind::Empty,
            "TIMEOUT" => ErrorKind::Timeout,
            "CRAWL_TIMEOUT" => ErrorKind::CrawlTimeout,
            "CRAWL_DNS" => ErrorKind::CrawlDns,
            "CRAWL_REFUSED" => ErrorKind::CrawlRefused,
            "CRAWL_BLOCKED" => ErrorKind::CrawlBlocked,
            _ => return None,
        })
    }

    /// The canonical transient set (spec.md §3).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ErrorKind::Timeout | ErrorKind::CrawlTimeout | ErrorKind::CrawlDns | ErrorKind::CrawlRefused
        )
    }
}

/// A taxonomy-tagged error carried through the pipeline.
#[derive(Debug, Error, Clone)]
#[error("{kind:?}: {message}")]
pub struct IngestError {
    pub kind: ErrorKind,
    pub message: String,
}

impl IngestError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }
}

/// Classify a raw crawler/browser error string into a taxonomy kind.
///
/// Priority order per spec.md §4.A; an unrecognized message defaults to
/// `CrawlTimeout` (biasing towards retry rather than dropping the message).
pub fn classify(raw_message: &str) -> IngestError {
    let upper = raw_message.to_uppercase();

    let kind = if upper.contains("TIMED_OUT") || upper.contains("TIMEOUT") {
        ErrorKind::CrawlTimeout
    } else if upper.contains("ERR_NAME_NOT_RESOLVED") || upper.contains("DNS") {
        ErrorKind::CrawlDns
    } else if upper.contains("ERR_CONNECTION_REFUSED")
        || upper.contains("ERR_CONNECTION_RESET")
        || upper.contains("ERR_CONNECTION_CLOSED")
        || upper.contains("ECONNREFUSED")
        || upper.contains("ECONNRESET")
    {
        ErrorKind::CrawlRefused
    } else if upper.contains("ROBOTS") || upper.contains("BLOCKED") || upper.contains("FORBIDDEN") {
        ErrorKind::CrawlBlocked
    } else {
        ErrorKind::CrawlTimeout
    };

    IngestError::new(kind, raw_message)
}

/// String-based catch-all transience check, applied to exceptions that never
/// went through [`classify`] (spec.md §4.A, §4.E step 8).
pub fn is_transient_message(raw_message: &str) -> bool {
    let upper = raw_message.to_uppercase();
    upper.contains("TIMEOUT")
        || upper.contains("TIMED_OUT")
        || upper.contains("CONNECTION")
        || upper.contains("ERR_NAME_NOT_RESOLVED")
        || upper.contains("ECONNREFUSED")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_priority_order() {
        assert_eq!(classify("net::ERR_TIMED_OUT").kind, ErrorKind::CrawlTimeout);
        assert_eq!(classify("net::ERR_NAME_NOT_RESOLVED").kind, ErrorKind::CrawlDns);
        assert_eq!(classify("ECONNREFUSED").kind, ErrorKind::CrawlRefused);
        assert_eq!(classify("blocked by robots.txt").kind, ErrorKind::CrawlBlocked);
        assert_eq!(classify("something weird").kind, ErrorKind::CrawlTimeout);
    }

    #[test]
    fn dns_before_refused_and_blocked() {
        // DNS errors mentioning "timeout" still classify as CrawlTimeout (priority 1 wins).
        assert_eq!(classify("DNS lookup timed out").kind, ErrorKind::CrawlTimeout);
    }

    #[test]
    fn transient_set_matches_spec() {
        assert!(ErrorKind::Timeout.is_transient());
        assert!(ErrorKind::CrawlTimeout.is_transient());
        assert!(ErrorKind::CrawlDns.is_transient());
        assert!(ErrorKind::CrawlRefused.is_transient());
        assert!(!ErrorKind::CrawlBlocked.is_transient());
        assert!(!ErrorKind::Encrypted.is_transient());
        assert!(!ErrorKind::InvalidFormat.is_transient());
        assert!(!ErrorKind::Empty.is_transient());
    }

    #[test]
    fn classify_format_reclassify_round_trip() {
        for raw in ["ERR_TIMED_OUT", "DNS failure", "ECONNRESET", "robots disallow"] {
            let once = classify(raw);
            let code = once.kind.as_code();
            let reparsed = ErrorKind::from_code(code).unwrap();
            assert_eq!(once.kind, reparsed);
        }
    }

    #[test]
    fn is_transient_message_catch_all() {
        assert!(is_transient_message("socket TIMEOUT while connecting"));
        assert!(is_transient_message("Connection refused (ECONNREFUSED)"));
        assert!(!is_transient_message("file is password protected"));
    }
}
