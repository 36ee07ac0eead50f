//! Web page fetching and text extraction
//!
//! Fetching validates the hostname before the request (literal private,
//! loopback, link-local and reserved IPs are blocked, as are well-known
//! internal hostnames) and re-validates the final URL after redirects, which
//! closes the open-redirect route to internal addresses. Responses must be
//! HTML or plain text and are capped at 10 MiB.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, ToSocketAddrs};
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{info, warn};

use crate::error::{GroundedError, Result};
use crate::types::{Metadata, Scalar, TextBlock};

const TIMEOUT: Duration = Duration::from_secs(30);
pub const MAX_CONTENT_LENGTH: usize = 10 * 1024 * 1024;
const USER_AGENT: &str = "GroundedRAG/1.0 (knowledge-base crawler)";

const BLOCKED_HOSTNAMES: &[&str] = &["localhost", "0.0.0.0", "metadata.google.internal"];

const REMOVE_TAGS: &[&str] = &[
    "script", "style", "nav", "footer", "header", "aside", "form", "noscript", "iframe",
];

static REMOVE_BLOCK_RES: Lazy<Vec<Regex>> = Lazy::new(|| {
    REMOVE_TAGS
        .iter()
        .map(|tag| {
            Regex::new(&format!(r"(?is)<{tag}\b[^>]*>.*?</{tag}>")).expect("valid regex")
        })
        .collect()
});
static TITLE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<title[^>]*>(.*?)</title>").expect("valid regex"));
static HEADING_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<h([1-6])[^>]*>(.*?)</h[1-6]>").expect("valid regex"));
static LI_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)<li[^>]*>(.*?)</li>").expect("valid regex"));
static BLOCKQUOTE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<blockquote[^>]*>(.*?)</blockquote>").expect("valid regex"));
static PRE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<pre[^>]*>(.*?)</pre>").expect("valid regex"));
static BREAK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)<(br|/p|/div|/tr)[^>]*>").expect("valid regex"));
static TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<[^>]+>").expect("valid regex"));
static BLANK_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").expect("valid regex"));

fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_private()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_unspecified()
                || v4.is_documentation()
                // Carrier-grade NAT 100.64.0.0/10 and reserved ranges
                || (v4.octets()[0] == 100 && (v4.octets()[1] & 0xC0) == 64)
                || v4.octets()[0] >= 240
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                // Unique-local fc00::/7 and link-local fe80::/10
                || (v6.segments()[0] & 0xFE00) == 0xFC00
                || (v6.segments()[0] & 0xFFC0) == 0xFE80
                || v6.to_ipv4_mapped().map(|v4| is_private_ip(&IpAddr::V4(v4))).unwrap_or(false)
        }
    }
}

/// True if the hostname is a private/internal target, either literally or
/// after DNS resolution
fn resolves_to_private(hostname: &str) -> bool {
    if let Ok(ip) = hostname.parse::<IpAddr>() {
        return is_private_ip(&ip);
    }
    if let Ok(v4) = hostname.parse::<Ipv4Addr>() {
        return is_private_ip(&IpAddr::V4(v4));
    }
    if let Ok(v6) = hostname.trim_matches(['[', ']']).parse::<Ipv6Addr>() {
        return is_private_ip(&IpAddr::V6(v6));
    }
    match (hostname, 0u16).to_socket_addrs() {
        Ok(addrs) => addrs.into_iter().any(|addr| is_private_ip(&addr.ip())),
        Err(_) => false,
    }
}

/// Validate that a URL is a fetchable public HTTP(S) endpoint
pub fn is_valid_url(url: &str) -> bool {
    let Ok(parsed) = reqwest::Url::parse(url) else {
        return false;
    };
    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return false;
    }
    let Some(hostname) = parsed.host_str() else {
        return false;
    };
    if BLOCKED_HOSTNAMES.contains(&hostname.to_lowercase().as_str()) {
        return false;
    }
    if resolves_to_private(hostname) {
        warn!("SSRF blocked: {} resolves to private/internal IP", hostname);
        return false;
    }
    true
}

fn decode_entities(s: &str) -> String {
    s.replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
}

/// Extract readable text from HTML. Returns (text, title).
pub fn extract_text_from_html(html: &str) -> (String, String) {
    let title = TITLE_RE
        .captures(html)
        .map(|cap| decode_entities(TAG_RE.replace_all(&cap[1], "").trim()))
        .unwrap_or_default();

    let mut body = html.to_string();
    for re in REMOVE_BLOCK_RES.iter() {
        body = re.replace_all(&body, "").into_owned();
    }
    let body = HEADING_RE.replace_all(&body, |cap: &regex::Captures<'_>| {
        let level: usize = cap[1].parse().unwrap_or(1);
        format!("\n{} {}\n", "#".repeat(level), &cap[2])
    });
    let body = LI_RE.replace_all(&body, "\n- $1");
    let body = BLOCKQUOTE_RE.replace_all(&body, "\n> $1\n");
    let body = PRE_RE.replace_all(&body, "\n```\n$1\n```\n");
    let body = BREAK_RE.replace_all(&body, "\n");
    let body = TAG_RE.replace_all(&body, "");
    let body = decode_entities(&body);

    let text: String = body
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n");
    let text = BLANK_RE.replace_all(&text, "\n\n").trim().to_string();
    (text, title)
}

/// SSRF-validated HTTP fetcher for URL ingestion
pub struct WebFetcher {
    client: reqwest::Client,
}

impl WebFetcher {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(TIMEOUT)
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()?;
        Ok(Self { client })
    }

    /// Fetch a URL. Returns (html, final_url).
    pub async fn fetch(&self, url: &str) -> Result<(String, String)> {
        if !is_valid_url(url) {
            return Err(GroundedError::BlockedUrl(format!(
                "URL refused by SSRF protection: {}",
                url
            )));
        }

        let response = self.client.get(url).send().await?;
        let final_url = response.url().to_string();

        // Re-validate after redirects: a public URL may 302 to an internal IP
        if final_url != url && !is_valid_url(&final_url) {
            return Err(GroundedError::BlockedUrl(format!(
                "Redirect target refused by SSRF protection: {}",
                final_url
            )));
        }

        if !response.status().is_success() {
            return Err(GroundedError::Extraction(format!(
                "Fetch failed with status {}",
                response.status()
            )));
        }

        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        if !content_type.contains("text/html") && !content_type.contains("text/plain") {
            return Err(GroundedError::Extraction(format!(
                "Unsupported content type: {}",
                content_type
            )));
        }

        let bytes = response.bytes().await?;
        if bytes.len() > MAX_CONTENT_LENGTH {
            return Err(GroundedError::Extraction(format!(
                "Content too large: {:.1}MB (max {}MB)",
                bytes.len() as f64 / 1024.0 / 1024.0,
                MAX_CONTENT_LENGTH / 1024 / 1024
            )));
        }

        Ok((String::from_utf8_lossy(&bytes).into_owned(), final_url))
    }

    /// Fetch a URL and extract its text into blocks
    pub async fn process_url(&self, url: &str) -> Result<Vec<TextBlock>> {
        info!("Fetching URL: {}", url);
        let (html, final_url) = self.fetch(url).await?;
        let (text, title) = extract_text_from_html(&html);

        let domain = reqwest::Url::parse(&final_url)
            .ok()
            .and_then(|u| u.host_str().map(String::from))
            .unwrap_or_else(|| "unknown".to_string());

        if text.trim().chars().count() < 50 {
            return Err(GroundedError::Extraction(
                "No meaningful text content found on this page".into(),
            ));
        }

        let mut metadata = Metadata::new();
        metadata.insert("file_type".into(), Scalar::Str("web".into()));
        metadata.insert("source_url".into(), Scalar::Str(final_url.clone()));
        metadata.insert("domain".into(), Scalar::Str(domain.clone()));
        metadata.insert(
            "title".into(),
            Scalar::Str(if title.is_empty() { domain } else { title }),
        );

        info!("Extracted {} chars from {}", text.chars().count(), final_url);
        Ok(vec![TextBlock::new(text, metadata)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_private_ips_blocked() {
        assert!(!is_valid_url("http://127.0.0.1/admin"));
        assert!(!is_valid_url("http://10.1.2.3/"));
        assert!(!is_valid_url("http://172.16.0.1/"));
        assert!(!is_valid_url("http://192.168.1.1/"));
        assert!(!is_valid_url("http://169.254.169.254/latest/meta-data/"));
        assert!(!is_valid_url("http://localhost:8080/"));
        assert!(!is_valid_url("http://[::1]/"));
        assert!(!is_valid_url("http://metadata.google.internal/"));
    }

    #[test]
    fn test_schemes_and_shapes() {
        assert!(!is_valid_url("ftp://example.com/file"));
        assert!(!is_valid_url("not a url"));
        assert!(!is_valid_url("file:///etc/passwd"));
    }

    #[test]
    fn test_html_extraction_structure() {
        let html = r#"<html><head><title>Guide</title><style>body{}</style></head>
            <body><script>evil()</script><h1>Programs</h1>
            <p>Strength first.</p><ul><li>Squat</li><li>Bench</li></ul></body></html>"#;
        let (text, title) = extract_text_from_html(html);
        assert_eq!(title, "Guide");
        assert!(text.contains("# Programs"));
        assert!(text.contains("- Squat"));
        assert!(text.contains("Strength first."));
        assert!(!text.contains("evil"));
        assert!(!text.contains("body{}"));
    }

    #[test]
    fn test_entity_decoding() {
        let (text, _) = extract_text_from_html("<p>Sets &amp; reps &lt;5</p>");
        assert!(text.contains("Sets & reps <5"));
    }
}
