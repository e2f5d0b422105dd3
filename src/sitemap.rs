use std::collections::HashSet;
use std::io::Read;

use flate2::read::GzDecoder;
use quick_xml::events::Event;
use quick_xml::Reader;
use reqwest::Client;
use url::Url;

use crate::http::{self, HttpOptions};
use crate::util::host_variants;

/// Sitemap index recursion is bounded to this depth (spec.md §4.B, §8 property 9).
const MAX_RECURSION_DEPTH: u32 = 3;

/// Per-request time budget (spec.md §4.B).
const SITEMAP_TIMEOUT_SECS: u64 = 15;

#[derive(Debug, Default)]
struct ParsedSitemap {
    urls: Vec<Url>,
    child_sitemaps: Vec<Url>,
}

/// Fetch and parse `{origin}/sitemap.xml`, recursively resolving any
/// `sitemapindex` children (bounded to [`MAX_RECURSION_DEPTH`]), and return
/// every `loc` URL whose host matches `base`'s.
///
/// Never raises: any failure (non-200, timeout, connect error, invalid XML,
/// unrecognized root element, empty body) collapses to an empty result for
/// that branch, matching spec.md §4.B's "never raises to its caller".
pub async fn fetch_sitemap(base: &Url) -> Vec<Url> {
    let opts = HttpOptions {
        timeout: std::time::Duration::from_secs(SITEMAP_TIMEOUT_SECS),
        ..HttpOptions::default()
    };

    let allowed_hosts: HashSet<String> = base.host_str().map(|h| host_variants(h).into_iter().collect()).unwrap_or_default();

    // Redirects are confined to the request's own host variants, so a
    // `sitemap.xml` that 302s off-site can't pivot this fetch elsewhere.
    let client = match http::build_client_restricted_to(&opts, allowed_hosts.clone()) {
        Ok(c) => c,
        Err(_) => return Vec::new(),
    };

    let Ok(origin) = origin_url(base) else {
        return Vec::new();
    };
    let Ok(sitemap_url) = origin.join("sitemap.xml") else {
        return Vec::new();
    };

    let mut seen = HashSet::new();
    let mut urls = resolve(&client, sitemap_url, 0, &mut seen).await;
    urls.retain(|u| {
        u.host_str()
            .map(|h| allowed_hosts.contains(&h.to_ascii_lowercase()))
            .unwrap_or(false)
    });

    // Stable, deduplicated output.
    let mut dedup = HashSet::new();
    urls.retain(|u| dedup.insert(u.as_str().to_string()));
    urls
}

async fn resolve(client: &Client, url: Url, depth: u32, seen: &mut HashSet<String>) -> Vec<Url> {
    if depth > MAX_RECURSION_DEPTH {
        return Vec::new();
    }
    let key = url.as_str().to_string();
    if !seen.insert(key) {
        return Vec::new();
    }

    let resp = match http::fetch_limited(client, url, 8 * 1024 * 1024).await {
        Ok(r) => r,
        Err(_) => return Vec::new(),
    };
    if !resp.status.is_success() || resp.body.is_empty() {
        return Vec::new();
    }

    let Ok(bytes) = maybe_gunzip(&resp.body) else {
        return Vec::new();
    };

    let Ok(parsed) = parse_sitemap_xml(&bytes) else {
        return Vec::new();
    };

    let mut out = parsed.urls;
    for child in parsed.child_sitemaps {
        // Use Box::pin to allow this async fn to recurse.
        let nested = Box::pin(resolve(client, child, depth + 1, seen)).await;
        out.extend(nested);
    }
    out
}

fn origin_url(base: &Url) -> anyhow::Result<Url> {
    let host = base
        .host_str()
        .ok_or_else(|| anyhow::anyhow!("base URL has no host: {base}"))?;
    Url::parse(&format!("{}://{host}/", base.scheme()))
        .map_err(|e| anyhow::anyhow!("failed to build origin for {base}: {e}"))
}

fn maybe_gunzip(bytes: &[u8]) -> anyhow::Result<Vec<u8>> {
    if bytes.len() >= 2 && bytes[0] == 0x1F && bytes[1] == 0x8B {
        let mut d = GzDecoder::new(bytes);
        let mut out = Vec::new();
        d.read_to_end(&mut out)?;
        return Ok(out);
    }
    Ok(bytes.to_vec())
}

/// Parse `urlset`/`sitemapindex` XML. `quick-xml` performs no DTD or external
/// entity resolution, so this is inherently hardened against XXE and
/// billion-laughs style expansion attacks: there is no entity expansion to
/// exploit.
fn parse_sitemap_xml(bytes: &[u8]) -> anyhow::Result<ParsedSitemap> {
    let mut reader = Reader::from_reader(bytes);
    reader.config_mut().trim_text(true);

    let mut buf = Vec::new();
    let mut parsed = ParsedSitemap::default();

    enum Ctx {
        None,
        Url,
        Sitemap,
    }

    let mut ctx = Ctx::None;
    let mut in_loc = false;
    let mut loc = String::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                let name = e.local_name();
                match name.as_ref() {
                    b"url" => ctx = Ctx::Url,
                    b"sitemap" => ctx = Ctx::Sitemap,
                    b"loc" => {
                        in_loc = true;
                        loc.clear();
                    }
                    _ => {}
                }
            }
            Ok(Event::Text(e)) => {
                if in_loc {
                    loc.push_str(&e.unescape().unwrap_or_default());
                }
            }
            Ok(Event::End(e)) => {
                let name = e.local_name();
                match name.as_ref() {
                    b"loc" => {
                        in_loc = false;
                        let u = loc.trim();
                        if !u.is_empty() {
                            if let Ok(url) = Url::parse(u) {
                                match ctx {
                                    Ctx::Url => parsed.urls.push(url),
                                    Ctx::Sitemap => parsed.child_sitemaps.push(url),
                                    Ctx::None => {}
                                }
                            }
                        }
                    }
                    b"url" | b"sitemap" => ctx = Ctx::None,
                    _ => {}
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(anyhow::anyhow!("sitemap XML parse error: {e}")),
            _ => {}
        }
        buf.clear();
    }

    Ok(parsed)
}
