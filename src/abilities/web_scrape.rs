//! 网页抓取能力：从任务描述中取出第一个 URL，GET 后提取可读文本
//!
//! 可选域名白名单（为空表示不限制）；请求带超时与 User-Agent；
//! 正文超过 max_result_chars 时截断并追加 ...[truncated]。
//! 网络错误、429 与 5xx 视为瞬时失败，其余 4xx 视为永久失败。

use std::collections::HashSet;
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use html2text::from_read;
use regex::Regex;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, RETRY_AFTER};
use reqwest::{Client, StatusCode};

use crate::abilities::{Ability, AbilityError, AbilityOutput, AbilityRequest};
use crate::config::WebScrapeSection;

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";

pub struct WebScrapeAbility {
    client: Client,
    allowed_domains: HashSet<String>,
    max_result_chars: usize,
}

fn url_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"https?://[^\s]+").ok()).as_ref()
}

/// 取文本中第一个 http(s) URL，去掉句尾标点
pub fn extract_url(text: &str) -> Option<String> {
    let found = url_pattern()?.find(text)?.as_str();
    let trimmed = found.trim_end_matches(|c: char| matches!(c, '.' | ',' | ';' | ')' | ']' | '"' | '\''));
    Some(trimmed.to_string())
}

/// 简易去除 HTML 标签（html2text 失败时的回退）
fn strip_html_tags(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut in_tag = false;
    for c in html.chars() {
        match c {
            '<' => in_tag = true,
            '>' => {
                in_tag = false;
                out.push(' ');
            }
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn looks_like_html(s: &str) -> bool {
    let s = s.trim_start();
    s.starts_with("<!")
        || s.starts_with("<html")
        || s.starts_with("<HTML")
        || (s.len() > 20 && s.contains('<') && (s.contains("</") || s.contains("<head") || s.contains("<title")))
}

fn extract_domain(url: &str) -> Option<String> {
    let url = url.trim();
    let rest = url.strip_prefix("https://").or_else(|| url.strip_prefix("http://"))?;
    let host = rest.split(['/', '?', '#']).next()?;
    let host = host.rsplit('@').next()?.split(':').next()?;
    if host.is_empty() {
        None
    } else {
        Some(host.to_lowercase())
    }
}

fn truncate_chars(body: String, max_chars: usize) -> String {
    if body.chars().count() > max_chars {
        body.chars().take(max_chars).collect::<String>() + "\n...[truncated]"
    } else {
        body
    }
}

/// 按 HTTP 状态码区分瞬时 / 永久失败
pub(crate) fn status_error(status: StatusCode, retry_after: Option<Duration>) -> AbilityError {
    let message = format!("HTTP {status}");
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        AbilityError::Transient {
            message,
            retry_after,
            usage: None,
        }
    } else {
        AbilityError::Permanent(message)
    }
}

/// Retry-After 头（秒数形式）
pub(crate) fn retry_after_header(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

impl WebScrapeAbility {
    pub fn new(allowed_domains: Vec<String>, timeout_secs: u64, max_result_chars: usize) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8"),
        );
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.9"));
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs.max(1)))
            .user_agent(USER_AGENT)
            .default_headers(headers)
            .build()
            .unwrap_or_default();
        Self {
            client,
            allowed_domains: allowed_domains.into_iter().map(|d| d.to_lowercase()).collect(),
            max_result_chars,
        }
    }

    pub fn from_config(cfg: &WebScrapeSection) -> Self {
        Self::new(cfg.allowed_domains.clone(), cfg.timeout_secs, cfg.max_result_chars)
    }

    fn check_allowed(&self, url: &str) -> Result<(), AbilityError> {
        let domain = extract_domain(url).ok_or_else(|| AbilityError::permanent(format!("Invalid URL: {url}")))?;
        if self.allowed_domains.is_empty() || self.allowed_domains.contains(&domain) {
            Ok(())
        } else {
            Err(AbilityError::permanent(format!("Domain not in allowlist: {domain}")))
        }
    }

    fn html_to_text(&self, html: &str) -> String {
        match from_read(html.as_bytes(), 120) {
            Ok(text) if !text.trim().is_empty() => text,
            _ => strip_html_tags(html),
        }
    }

    async fn fetch(&self, url: &str) -> Result<String, AbilityError> {
        self.check_allowed(url)?;
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| AbilityError::transient(format!("Request failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(status_error(status, retry_after_header(resp.headers())));
        }

        let body = resp
            .text()
            .await
            .map_err(|e| AbilityError::transient(format!("Read body: {e}")))?;
        let body = body.trim_start_matches('\u{FEFF}');
        let text = if looks_like_html(body) {
            self.html_to_text(body)
        } else {
            body.to_string()
        };
        Ok(truncate_chars(text, self.max_result_chars))
    }
}

#[async_trait]
impl Ability for WebScrapeAbility {
    fn name(&self) -> &str {
        "web-scrape"
    }

    fn description(&self) -> &str {
        "Fetch the first http(s) URL mentioned in the task and return its readable text."
    }

    async fn invoke(&self, request: AbilityRequest) -> Result<AbilityOutput, AbilityError> {
        let url = extract_url(&request.instruction)
            .ok_or_else(|| AbilityError::permanent("No URL found in task description"))?;
        tracing::info!(task_id = request.task_id, url = %url, "web scrape fetch");
        let text = self.fetch(&url).await?;
        Ok(AbilityOutput::text(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_url_trims_trailing_punctuation() {
        assert_eq!(
            extract_url("Scrape https://example.com/docs/page. Then summarize").as_deref(),
            Some("https://example.com/docs/page")
        );
        assert_eq!(extract_url("see (http://a.org/x)").as_deref(), Some("http://a.org/x"));
        assert_eq!(extract_url("no link here"), None);
    }

    #[test]
    fn test_extract_domain() {
        assert_eq!(extract_domain("https://Docs.RS/tokio/latest").as_deref(), Some("docs.rs"));
        assert_eq!(extract_domain("http://localhost:8080/x?q=1").as_deref(), Some("localhost"));
        assert_eq!(extract_domain("ftp://example.com"), None);
    }

    #[test]
    fn test_allowlist_empty_means_any() {
        let open = WebScrapeAbility::new(vec![], 5, 100);
        assert!(open.check_allowed("https://anything.example/").is_ok());

        let restricted = WebScrapeAbility::new(vec!["docs.rs".into()], 5, 100);
        assert!(restricted.check_allowed("https://docs.rs/serde").is_ok());
        let err = restricted.check_allowed("https://evil.example/").unwrap_err();
        assert!(!err.is_transient());
    }

    #[test]
    fn test_status_classification() {
        assert!(status_error(StatusCode::TOO_MANY_REQUESTS, Some(Duration::from_secs(3))).is_transient());
        assert!(status_error(StatusCode::BAD_GATEWAY, None).is_transient());
        assert!(!status_error(StatusCode::NOT_FOUND, None).is_transient());
        assert_eq!(
            status_error(StatusCode::TOO_MANY_REQUESTS, Some(Duration::from_secs(3))).retry_after(),
            Some(Duration::from_secs(3))
        );
    }

    #[test]
    fn test_html_helpers_and_truncation() {
        assert!(looks_like_html("<!DOCTYPE html><html></html>"));
        assert!(!looks_like_html("plain text body"));
        assert_eq!(strip_html_tags("<p>Hello <b>world</b></p>"), "Hello world");
        let out = truncate_chars("abcdef".to_string(), 3);
        assert_eq!(out, "abc\n...[truncated]");
        assert_eq!(truncate_chars("ab".to_string(), 3), "ab");
    }

    #[tokio::test]
    async fn test_invoke_without_url_is_permanent() {
        let ability = WebScrapeAbility::new(vec![], 5, 100);
        let err = ability.invoke(AbilityRequest::new(1, "just words")).await.unwrap_err();
        assert!(!err.is_transient());
    }
}
