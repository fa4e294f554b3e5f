//! 网页搜索能力：以任务描述为查询词请求 DuckDuckGo HTML 版，提取前 N 条结果
//!
//! 每条结果格式化为 "序号. 标题 / URL / 摘要"；跳转链接（/l/?uddg=...）还原为目标地址。
//! 网络错误、429 与 5xx 视为瞬时失败，其余 4xx 视为永久失败；没有结果时返回 "No search results found."。

use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE};
use reqwest::{Client, Url};

use crate::abilities::web_scrape::{retry_after_header, status_error};
use crate::abilities::{Ability, AbilityError, AbilityOutput, AbilityRequest};
use crate::config::WebSearchSection;

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";

/// 一条搜索结果
#[derive(Debug, Clone, PartialEq)]
pub struct SearchResult {
    pub title: String,
    pub link: String,
    pub snippet: String,
}

pub struct WebSearchAbility {
    client: Client,
    endpoint: String,
    max_results: usize,
}

fn title_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r#"(?s)<a\s([^>]*class="[^"]*\bresult__a\b[^"]*"[^>]*)>(.*?)</a>"#).ok())
        .as_ref()
}

fn snippet_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(r#"(?s)<(a|div|td)\s[^>]*class="[^"]*\bresult__snippet\b[^"]*"[^>]*>(.*?)</(?:a|div|td)>"#).ok()
        })
        .as_ref()
}

fn href_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r#"href="([^"]*)""#).ok()).as_ref()
}

/// 去掉内联标签、还原常见实体并压缩空白
fn clean_fragment(html: &str) -> String {
    let mut text = String::with_capacity(html.len());
    let mut in_tag = false;
    for c in html.chars() {
        match c {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => text.push(c),
            _ => {}
        }
    }
    let text = decode_entities(&text);
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#x27;", "'")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

/// DuckDuckGo 跳转链接还原为目标 URL；普通链接原样返回
pub fn resolve_link(href: &str) -> String {
    let href = decode_entities(href.trim());
    let absolute = if href.starts_with("//") {
        format!("https:{href}")
    } else {
        href.clone()
    };
    Url::parse(&absolute)
        .ok()
        .and_then(|url| {
            url.query_pairs()
                .find(|(key, _)| key == "uddg")
                .map(|(_, target)| target.into_owned())
        })
        .unwrap_or(absolute)
}

/// 从结果页 HTML 中按出现顺序提取至多 max_results 条结果；摘要取标题之后、下一个标题之前的第一段
pub fn extract_results(html: &str, max_results: usize) -> Vec<SearchResult> {
    let (Some(titles), Some(snippets), Some(hrefs)) = (title_pattern(), snippet_pattern(), href_pattern()) else {
        return Vec::new();
    };
    let anchors: Vec<_> = titles.captures_iter(html).collect();
    let mut results = Vec::new();
    for (i, caps) in anchors.iter().enumerate() {
        if results.len() >= max_results {
            break;
        }
        let (Some(whole), Some(attrs), Some(inner)) = (caps.get(0), caps.get(1), caps.get(2)) else {
            continue;
        };
        let Some(href) = hrefs.captures(attrs.as_str()).and_then(|c| c.get(1)) else {
            continue;
        };
        let title = clean_fragment(inner.as_str());
        if title.is_empty() {
            continue;
        }
        let region_end = anchors
            .get(i + 1)
            .and_then(|next| next.get(0))
            .map_or(html.len(), |m| m.start());
        let snippet = snippets
            .captures(&html[whole.end()..region_end])
            .and_then(|c| c.get(2))
            .map(|m| clean_fragment(m.as_str()))
            .unwrap_or_default();
        results.push(SearchResult {
            title,
            link: resolve_link(href.as_str()),
            snippet,
        });
    }
    results
}

pub fn format_results(results: &[SearchResult]) -> String {
    if results.is_empty() {
        return "No search results found.".to_string();
    }
    results
        .iter()
        .enumerate()
        .map(|(i, r)| format!("{}. {}\n   URL: {}\n   {}", i + 1, r.title, r.link, r.snippet))
        .collect::<Vec<_>>()
        .join("\n\n")
}

impl WebSearchAbility {
    pub fn new(endpoint: impl Into<String>, timeout_secs: u64, max_results: usize) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("text/html,application/xhtml+xml;q=0.9,*/*;q=0.8"));
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.9"));
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs.max(1)))
            .user_agent(USER_AGENT)
            .default_headers(headers)
            .build()
            .unwrap_or_default();
        Self {
            client,
            endpoint: endpoint.into(),
            max_results: max_results.max(1),
        }
    }

    pub fn from_config(cfg: &WebSearchSection) -> Self {
        Self::new(cfg.endpoint.clone(), cfg.timeout_secs, cfg.results_count)
    }

    async fn search(&self, query: &str) -> Result<Vec<SearchResult>, AbilityError> {
        let url = Url::parse_with_params(&self.endpoint, &[("q", query)])
            .map_err(|e| AbilityError::permanent(format!("Invalid search endpoint {}: {e}", self.endpoint)))?;
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| AbilityError::transient(format!("Search request failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(status_error(status, retry_after_header(resp.headers())));
        }
        let body = resp
            .text()
            .await
            .map_err(|e| AbilityError::transient(format!("Read body: {e}")))?;
        Ok(extract_results(&body, self.max_results))
    }
}

#[async_trait]
impl Ability for WebSearchAbility {
    fn name(&self) -> &str {
        "web-search"
    }

    fn description(&self) -> &str {
        "Search the web for the task description and return the top results (title, URL, snippet)."
    }

    async fn invoke(&self, request: AbilityRequest) -> Result<AbilityOutput, AbilityError> {
        let query = request.instruction.trim();
        if query.is_empty() {
            return Err(AbilityError::permanent("Empty search query"));
        }
        tracing::info!(task_id = request.task_id, query = %query, "web search");
        let results = self.search(query).await?;
        tracing::debug!(task_id = request.task_id, count = results.len(), "web search results");
        Ok(AbilityOutput::text(format_results(&results)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RESULTS_PAGE: &str = r#"
<div class="result results_links results_links_deep web-result ">
  <div class="links_main links_deep result__body">
    <h2 class="result__title">
      <a rel="nofollow" class="result__a" href="//duckduckgo.com/l/?uddg=https%3A%2F%2Ftokio.rs%2Ftokio%2Ftutorial&amp;rut=abc">Tokio <b>Tutorial</b></a>
    </h2>
    <a class="result__url" href="//duckduckgo.com/l/?uddg=https%3A%2F%2Ftokio.rs">tokio.rs</a>
    <a class="result__snippet" href="//duckduckgo.com/l/?uddg=x">Learn &quot;async&quot; Rust with <b>Tokio</b> &amp; friends.</a>
  </div>
</div>
<div class="result results_links web-result ">
  <div class="links_main result__body">
    <h2 class="result__title">
      <a class="result__a" rel="nofollow" href="https://docs.rs/tokio">tokio - Rust</a>
    </h2>
  </div>
</div>
<div class="result results_links web-result ">
  <h2 class="result__title"><a rel="nofollow" class="result__a" href="https://crates.io/crates/tokio">tokio on crates.io</a></h2>
  <div class="result__snippet">An event-driven, non-blocking I/O platform.</div>
</div>
"#;

    #[test]
    fn test_extract_results_in_page_order() {
        let results = extract_results(RESULTS_PAGE, 10);
        assert_eq!(results.len(), 3);
        assert_eq!(
            results[0],
            SearchResult {
                title: "Tokio Tutorial".into(),
                link: "https://tokio.rs/tokio/tutorial".into(),
                snippet: "Learn \"async\" Rust with Tokio & friends.".into(),
            }
        );
        assert_eq!(results[1].link, "https://docs.rs/tokio");
        assert_eq!(results[1].snippet, "");
        assert_eq!(results[2].snippet, "An event-driven, non-blocking I/O platform.");
    }

    #[test]
    fn test_extract_results_respects_limit() {
        let results = extract_results(RESULTS_PAGE, 2);
        assert_eq!(results.len(), 2);
        assert!(extract_results("<html><body>No results.</body></html>", 5).is_empty());
    }

    #[test]
    fn test_resolve_link() {
        assert_eq!(
            resolve_link("//duckduckgo.com/l/?uddg=https%3A%2F%2Fexample.com%2Fa%3Fb%3D1&amp;rut=z"),
            "https://example.com/a?b=1"
        );
        assert_eq!(resolve_link("https://example.com/x"), "https://example.com/x");
    }

    #[test]
    fn test_format_results() {
        assert_eq!(format_results(&[]), "No search results found.");
        let out = format_results(&extract_results(RESULTS_PAGE, 1));
        assert_eq!(
            out,
            "1. Tokio Tutorial\n   URL: https://tokio.rs/tokio/tutorial\n   Learn \"async\" Rust with Tokio & friends."
        );
    }

    #[tokio::test]
    async fn test_empty_query_is_permanent() {
        let ability = WebSearchAbility::new("https://html.duckduckgo.com/html/", 5, 5);
        let err = ability.invoke(AbilityRequest::new(1, "   ")).await.unwrap_err();
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_bad_endpoint_is_permanent() {
        let ability = WebSearchAbility::new("not a url", 5, 5);
        let err = ability.invoke(AbilityRequest::new(1, "rust")).await.unwrap_err();
        assert!(!err.is_transient());
    }
}
