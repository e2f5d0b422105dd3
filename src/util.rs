use std::time::Instant;

use url::Url;

/// Milliseconds elapsed since `start`, for `duration_ms` log fields
/// (spec.md §4.E step 9 uses the monotonic clock, not wall time).
pub fn elapsed_ms(start: Instant) -> u128 {
    start.elapsed().as_millis()
}

/// `www.`-prefixed and bare variants of a host, used when deciding whether a
/// link discovered on a page belongs to the "same site" as the request.
pub fn host_variants(host: &str) -> Vec<String> {
    let h = host.to_ascii_lowercase();
    if let Some(rest) = h.strip_prefix("www.") {
        vec![h.clone(), rest.to_string()]
    } else {
        vec![h.clone(), format!("www.{h}")]
    }
}

/// True when `candidate` shares a network location (host, ignoring the
/// `www.` prefix) with `base` (spec.md §3 invariant on `links`).
pub fn same_site(base: &Url, candidate: &Url) -> bool {
    match (base.host_str(), candidate.host_str()) {
        (Some(b), Some(c)) => host_variants(b).contains(&c.to_ascii_lowercase()),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_site_ignores_www_prefix() {
        let base = Url::parse("https://example.com/docs").unwrap();
        let with_www = Url::parse("https://www.example.com/about").unwrap();
        let other = Url::parse("https://evil.com/").unwrap();
        assert!(same_site(&base, &with_www));
        assert!(!same_site(&base, &other));
    }
}
