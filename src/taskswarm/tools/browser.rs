//! Sandbox browser tool: web search and page fetch for non-native models.
//!
//! Roles that rely on the provider's built-in `web_search` / `web_extractor`
//! capabilities lose them when their model is not provider-native. This tool
//! closes the gap through function calling with two operations:
//!
//! - `search` — query a search engine, returning `{title, url, snippet}`
//!   triples; a fallback engine is tried when the primary fails.
//! - `fetch` — GET a URL with browser-like headers and extract the readable
//!   text (two passes: a regex pre-strip of script/style/head/svg blocks,
//!   then a tag-tracking text extractor), truncated at 15 000 characters.

use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use lazy_static::lazy_static;
use regex::Regex;

use crate::taskswarm::clients::common::get_shared_http_client;
use crate::taskswarm::clients::retry::{classify_message, ErrorClass};
use crate::taskswarm::tool_registry::{ToolRegistry, ToolRegistryError, ToolSpec};

/// Registry name of the browser tool.
pub const SANDBOX_BROWSER_TOOL: &str = "sandbox_browser";

/// Maximum characters of extracted page text.
const MAX_CONTENT_CHARS: usize = 15_000;
/// Fetch retry budget for transient failures.
const FETCH_RETRIES: u32 = 2;

const PRIMARY_SEARCH_URL: &str = "https://html.duckduckgo.com/html/?q=";
const FALLBACK_SEARCH_URL: &str = "https://lite.duckduckgo.com/lite/?q=";

const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

lazy_static! {
    // Pass 1: drop whole invisible blocks before character-level scanning.
    static ref PRE_STRIP: Regex = Regex::new(
        r"(?is)<script\b.*?</script>|<style\b.*?</style>|<head\b.*?</head>|<svg\b.*?</svg>|<!--.*?-->"
    )
    .expect("invalid pre-strip pattern");

    static ref TITLE: Regex =
        Regex::new(r"(?is)<title[^>]*>(.*?)</title>").expect("invalid title pattern");

    // DuckDuckGo HTML results: anchor with result__a class, snippet sibling.
    static ref RESULT_LINK: Regex = Regex::new(
        r#"(?is)<a[^>]+class="[^"]*result__a[^"]*"[^>]+href="([^"]+)"[^>]*>(.*?)</a>"#
    )
    .expect("invalid result-link pattern");
    static ref RESULT_SNIPPET: Regex = Regex::new(
        r#"(?is)<a[^>]+class="[^"]*result__snippet[^"]*"[^>]*>(.*?)</a>"#
    )
    .expect("invalid result-snippet pattern");

    // Lite fallback: bare anchors in the results table.
    static ref LITE_LINK: Regex = Regex::new(
        r#"(?is)<a[^>]+rel="nofollow"[^>]+href="(https?://[^"]+)"[^>]*>(.*?)</a>"#
    )
    .expect("invalid lite-link pattern");
}

/// One parsed search hit.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SearchHit {
    /// Result title with markup removed.
    pub title: String,
    /// Result URL.
    pub url: String,
    /// Result snippet with markup removed; may be empty.
    pub snippet: String,
}

/// Search + fetch backend shared by every worker through the registry.
pub struct SandboxBrowser {
    http: reqwest::Client,
}

impl Default for SandboxBrowser {
    fn default() -> Self {
        Self::new()
    }
}

impl SandboxBrowser {
    /// Create a browser on the shared pooled HTTP client.
    pub fn new() -> Self {
        Self {
            http: get_shared_http_client().clone(),
        }
    }

    /// Search the web, trying the fallback engine when the primary fails.
    pub async fn search(
        &self,
        query: &str,
        num_results: usize,
    ) -> Result<Vec<SearchHit>, Box<dyn Error + Send + Sync>> {
        let encoded = urlencoding::encode(query);
        let primary = format!("{}{}", PRIMARY_SEARCH_URL, encoded);

        match self.search_one_engine(&primary, num_results, false).await {
            Ok(hits) if !hits.is_empty() => Ok(hits),
            Ok(_) | Err(_) => {
                log::warn!("primary search engine failed for '{}', trying fallback", query);
                let fallback = format!("{}{}", FALLBACK_SEARCH_URL, encoded);
                self.search_one_engine(&fallback, num_results, true).await
            }
        }
    }

    async fn search_one_engine(
        &self,
        url: &str,
        num_results: usize,
        lite: bool,
    ) -> Result<Vec<SearchHit>, Box<dyn Error + Send + Sync>> {
        let html = self.get_with_browser_headers(url, Duration::from_secs(20)).await?;
        let hits = if lite {
            parse_lite_results(&html, num_results)
        } else {
            parse_search_results(&html, num_results)
        };
        Ok(hits)
    }

    /// Fetch a page and extract its readable text.
    ///
    /// Always returns a JSON object `{success, url, title, content, error}`;
    /// failures are reported inside the object so the model can adapt.
    pub async fn fetch(&self, url: &str, extract_content: bool) -> serde_json::Value {
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return serde_json::json!({
                "success": false,
                "url": url,
                "title": "",
                "content": "",
                "error": "url must start with http:// or https://",
            });
        }

        let mut last_error = String::new();
        for attempt in 0..=FETCH_RETRIES {
            match self.get_with_browser_headers(url, Duration::from_secs(30)).await {
                Ok(html) => {
                    let title = extract_title(&html);
                    let content = if extract_content {
                        let mut text = extract_visible_text(&html);
                        if text.chars().count() > MAX_CONTENT_CHARS {
                            text = text.chars().take(MAX_CONTENT_CHARS).collect();
                            text.push_str("\n...[truncated]");
                        }
                        text
                    } else {
                        String::new()
                    };
                    return serde_json::json!({
                        "success": true,
                        "url": url,
                        "title": title,
                        "content": content,
                        "error": serde_json::Value::Null,
                    });
                }
                Err(e) => {
                    last_error = e.to_string();
                    if classify_message(&last_error) == ErrorClass::Permanent
                        || attempt == FETCH_RETRIES
                    {
                        break;
                    }
                    log::debug!("fetch retry {}/{} for {}: {}", attempt + 1, FETCH_RETRIES, url, last_error);
                    tokio::time::sleep(Duration::from_secs(1 << attempt)).await;
                }
            }
        }

        serde_json::json!({
            "success": false,
            "url": url,
            "title": "",
            "content": "",
            "error": last_error,
        })
    }

    async fn get_with_browser_headers(
        &self,
        url: &str,
        timeout: Duration,
    ) -> Result<String, Box<dyn Error + Send + Sync>> {
        let resp = self
            .http
            .get(url)
            .header("User-Agent", BROWSER_USER_AGENT)
            .header(
                "Accept",
                "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
            )
            .header("Accept-Language", "en-US,en;q=0.9")
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| -> Box<dyn Error + Send + Sync> { Box::new(e) })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(format!("HTTP {} fetching {}", status, url).into());
        }
        resp.text()
            .await
            .map_err(|e| -> Box<dyn Error + Send + Sync> { Box::new(e) })
    }
}

/// Extract the page title, entity-decoded and whitespace-collapsed.
pub fn extract_title(html: &str) -> String {
    TITLE
        .captures(html)
        .and_then(|c| c.get(1))
        .map(|m| collapse_whitespace(&decode_entities(&strip_tags(m.as_str()))))
        .unwrap_or_default()
}

/// Two-pass readable-text extraction.
///
/// Pass 1 removes script/style/head/svg blocks and comments wholesale with
/// the [`PRE_STRIP`] pattern. Pass 2 walks the remaining characters tracking
/// tag boundaries, emitting text nodes with block tags mapped to newlines
/// and runs of whitespace collapsed.
pub fn extract_visible_text(html: &str) -> String {
    let pre_stripped = PRE_STRIP.replace_all(html, " ");

    let mut out = String::with_capacity(pre_stripped.len() / 4);
    let mut in_tag = false;
    let mut tag_buf = String::new();
    let mut pending_space = false;
    let mut pending_newline = false;

    for ch in pre_stripped.chars() {
        if in_tag {
            if ch == '>' {
                in_tag = false;
                let tag = tag_buf
                    .trim_start_matches('/')
                    .split(|c: char| c.is_whitespace() || c == '/')
                    .next()
                    .unwrap_or("")
                    .to_ascii_lowercase();
                if matches!(
                    tag.as_str(),
                    "p" | "div"
                        | "br"
                        | "li"
                        | "tr"
                        | "h1"
                        | "h2"
                        | "h3"
                        | "h4"
                        | "h5"
                        | "h6"
                        | "section"
                        | "article"
                        | "table"
                        | "ul"
                        | "ol"
                        | "blockquote"
                        | "pre"
                ) {
                    pending_newline = true;
                }
                tag_buf.clear();
            } else {
                tag_buf.push(ch);
            }
            continue;
        }
        if ch == '<' {
            in_tag = true;
            continue;
        }
        if ch.is_whitespace() {
            pending_space = true;
            continue;
        }
        if pending_newline {
            if !out.is_empty() {
                out.push('\n');
            }
            pending_newline = false;
            pending_space = false;
        } else if pending_space {
            if !out.is_empty() && !out.ends_with('\n') {
                out.push(' ');
            }
            pending_space = false;
        }
        out.push(ch);
    }

    decode_entities(&out)
}

fn parse_search_results(html: &str, num_results: usize) -> Vec<SearchHit> {
    let snippets: Vec<String> = RESULT_SNIPPET
        .captures_iter(html)
        .filter_map(|c| c.get(1))
        .map(|m| collapse_whitespace(&decode_entities(&strip_tags(m.as_str()))))
        .collect();

    RESULT_LINK
        .captures_iter(html)
        .take(num_results)
        .enumerate()
        .filter_map(|(i, caps)| {
            let url = caps.get(1)?.as_str().to_string();
            let title = collapse_whitespace(&decode_entities(&strip_tags(caps.get(2)?.as_str())));
            Some(SearchHit {
                title,
                url: normalize_result_url(&url),
                snippet: snippets.get(i).cloned().unwrap_or_default(),
            })
        })
        .collect()
}

fn parse_lite_results(html: &str, num_results: usize) -> Vec<SearchHit> {
    LITE_LINK
        .captures_iter(html)
        .take(num_results)
        .filter_map(|caps| {
            let url = caps.get(1)?.as_str().to_string();
            let title = collapse_whitespace(&decode_entities(&strip_tags(caps.get(2)?.as_str())));
            if title.is_empty() {
                return None;
            }
            Some(SearchHit {
                title,
                url,
                snippet: String::new(),
            })
        })
        .collect()
}

/// DuckDuckGo wraps result URLs in a redirect; unwrap the `uddg` parameter.
fn normalize_result_url(url: &str) -> String {
    if let Some(idx) = url.find("uddg=") {
        let encoded = &url[idx + 5..];
        let encoded = encoded.split('&').next().unwrap_or(encoded);
        if let Ok(decoded) = urlencoding::decode(encoded) {
            return decoded.into_owned();
        }
    }
    url.to_string()
}

fn strip_tags(fragment: &str) -> String {
    let mut out = String::with_capacity(fragment.len());
    let mut in_tag = false;
    for ch in fragment.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            c if !in_tag => out.push(c),
            _ => {}
        }
    }
    out
}

fn decode_entities(text: &str) -> String {
    text.replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&#x27;", "'")
        .replace("&nbsp;", " ")
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Register the browser under [`SANDBOX_BROWSER_TOOL`].
pub fn register_sandbox_browser(
    registry: &mut ToolRegistry,
    browser: Arc<SandboxBrowser>,
) -> Result<(), ToolRegistryError> {
    let schema = serde_json::json!({
        "type": "object",
        "properties": {
            "action": {
                "type": "string",
                "enum": ["search", "fetch"],
                "description": "search = query a search engine; fetch = read one URL"
            },
            "query": {
                "type": "string",
                "description": "Search keywords (required for action=search)"
            },
            "url": {
                "type": "string",
                "description": "Page URL starting with http:// or https:// (required for action=fetch)"
            },
            "num_results": {
                "type": "integer",
                "description": "Number of search hits to return (default 8)",
                "default": 8
            },
            "extract_content": {
                "type": "boolean",
                "description": "Whether fetch extracts page text (default true)",
                "default": true
            }
        },
        "required": ["action"]
    });

    let spec = ToolSpec::new(
        SANDBOX_BROWSER_TOOL,
        "Web search and page reading. Two modes: 'search' returns a list of \
         {title, url, snippet} results for a query; 'fetch' downloads one URL \
         and extracts its title and readable text. Typical flow: search for \
         keywords, pick a relevant URL, fetch it for details.",
        schema,
        Arc::new(move |args| {
            let browser = browser.clone();
            Box::pin(async move {
                let action = args.get("action").and_then(|a| a.as_str()).unwrap_or("");
                match action {
                    "search" => {
                        let query = args
                            .get("query")
                            .and_then(|q| q.as_str())
                            .unwrap_or("")
                            .trim()
                            .to_string();
                        if query.is_empty() {
                            return Err("action=search requires a 'query' argument".into());
                        }
                        let num_results = args
                            .get("num_results")
                            .and_then(|n| n.as_u64())
                            .unwrap_or(8) as usize;
                        let hits = browser.search(&query, num_results.max(1)).await?;
                        Ok(serde_json::json!({
                            "success": true,
                            "query": query,
                            "results": hits,
                        }))
                    }
                    "fetch" => {
                        let url = args.get("url").and_then(|u| u.as_str()).unwrap_or("");
                        if url.is_empty() {
                            return Err("action=fetch requires a 'url' argument".into());
                        }
                        let extract = args
                            .get("extract_content")
                            .and_then(|e| e.as_bool())
                            .unwrap_or(true);
                        Ok(browser.fetch(url, extract).await)
                    }
                    other => Err(format!(
                        "unknown action '{}'; supported actions are search and fetch",
                        other
                    )
                    .into()),
                }
            })
        }),
    )
    .with_timeout(Duration::from_secs(35))
    .with_retry();

    registry.register(spec)
}
