//! Top-level browse pipeline: engine → extraction → optional semantic filter
//! → optional truncation.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use webscope_core::{Payload, Result, Tier, TierFetcher};

use crate::browser::FullBrowserFetcher;
use crate::engine::{EngineConfig, EngineSession};
use crate::extract::{self, ExtractOptions};
use crate::render_dom::ScriptedDomFetcher;
use crate::semantic::{SearchOptions, SemanticFilter};
use crate::truncate::{self, TruncateOptions};
use crate::StaticFetcher;

#[derive(Debug, Clone)]
pub struct BrowseRequest {
    pub url: String,
    /// Highest tier the engine may escalate to.
    pub max_tier: Tier,
    /// Pin a single tier instead of auto-escalating.
    pub forced_tier: Option<Tier>,
    /// Return readable plain text (html2text rendering) instead of
    /// structured nodes.
    pub text_only: bool,
    /// Keep only content semantically relevant to this query.
    pub query: Option<String>,
    /// Token budget for the returned content.
    pub max_tokens: Option<usize>,
    pub include_media: bool,
    pub exclude_selectors: Vec<String>,
    pub timeout_ms: u64,
}

impl BrowseRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_tier: Tier::MAX,
            forced_tier: None,
            text_only: false,
            query: None,
            max_tokens: None,
            include_media: false,
            exclude_selectors: Vec::new(),
            timeout_ms: 20_000,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BrowseResponse {
    pub final_url: String,
    pub title: Option<String>,
    pub status: u16,
    pub tier_used: Tier,
    pub redirect_chain: Vec<String>,
    pub content: Payload,
    /// Absolute link targets harvested from the page, deduped.
    pub links: Vec<String>,
    pub total_chunks: Option<usize>,
    pub matched_chunks: Option<usize>,
    pub truncated: bool,
    pub items_omitted: usize,
    pub original_tokens: usize,
    pub returned_tokens: usize,
    pub warnings: Vec<&'static str>,
    pub timings_ms: BTreeMap<String, u128>,
}

/// Build a session over the three default tier fetchers.
pub fn default_session(config: EngineConfig) -> Result<EngineSession> {
    let static_fetcher = StaticFetcher::new()?;
    let fetchers: Vec<Arc<dyn TierFetcher>> = vec![
        Arc::new(static_fetcher.clone()),
        Arc::new(ScriptedDomFetcher::from_static(static_fetcher)),
        Arc::new(FullBrowserFetcher::new()),
    ];
    Ok(EngineSession::new(config, fetchers))
}

/// One-shot browse with a throwaway session. The session is closed before
/// returning, so a browser launched for this call is released.
pub async fn browse(req: &BrowseRequest) -> Result<BrowseResponse> {
    let mut session = default_session(EngineConfig {
        ceiling: req.max_tier,
        timeout_ms: req.timeout_ms,
        ..EngineConfig::default()
    })?;
    let result = browse_with(&mut session, req).await;
    let closed = session.close().await;
    let response = result?;
    closed?;
    Ok(response)
}

/// Browse using an existing session (tier pinning and browser reuse persist
/// across calls).
pub async fn browse_with(
    session: &mut EngineSession,
    req: &BrowseRequest,
) -> Result<BrowseResponse> {
    let total_start = Instant::now();
    let mut timings_ms: BTreeMap<String, u128> = BTreeMap::new();
    let mut warnings: Vec<&'static str> = Vec::new();

    if let Some(tier) = req.forced_tier {
        session.set_tier(tier)?;
    }

    let fetch_start = Instant::now();
    let page = session.fetch(&req.url).await?;
    timings_ms.insert("fetch".to_string(), fetch_start.elapsed().as_millis());

    let extract_start = Instant::now();
    let mut opts = ExtractOptions::new();
    opts.include_media = req.include_media;
    opts.exclude_selectors = req.exclude_selectors.clone();
    let extracted = extract::extract(&page.raw_markup, Some(&page.final_url), &opts);
    warnings.extend(extracted.warnings.iter().copied());
    let links: Vec<String> = extracted.links.into_iter().map(|l| l.url).collect();
    timings_ms.insert("extract".to_string(), extract_start.elapsed().as_millis());

    let mut content = if req.text_only {
        Payload::Text(extract::html_to_text(&page.raw_markup, 80))
    } else {
        Payload::Structured(extracted.nodes)
    };
    let mut total_chunks = None;
    let mut matched_chunks = None;

    if let Some(query) = req.query.as_deref() {
        let filter_start = Instant::now();
        let filter = SemanticFilter::with_default_provider().await;
        let outcome = filter
            .filter_by_query(&content, query, &SearchOptions::default())
            .await?;
        total_chunks = Some(outcome.total_chunks);
        matched_chunks = Some(outcome.matched_chunks);
        if outcome.matched_chunks == 0 {
            warnings.push("semantic_no_match");
        }
        content = Payload::Text(outcome.filtered_content);
        timings_ms.insert(
            "semantic_filter".to_string(),
            filter_start.elapsed().as_millis(),
        );
    }

    let (content, original_tokens, returned_tokens, truncated, items_omitted) =
        match req.max_tokens {
            Some(budget) => {
                let truncate_start = Instant::now();
                let r = truncate::truncate(content, budget, &TruncateOptions::new());
                timings_ms.insert(
                    "truncate".to_string(),
                    truncate_start.elapsed().as_millis(),
                );
                if r.truncated {
                    warnings.push("truncated");
                }
                (
                    r.content,
                    r.original_tokens,
                    r.returned_tokens,
                    r.truncated,
                    r.items_omitted,
                )
            }
            None => {
                let tokens = truncate::payload_tokens(&content);
                (content, tokens, tokens, false, 0)
            }
        };

    timings_ms.insert("total".to_string(), total_start.elapsed().as_millis());

    Ok(BrowseResponse {
        final_url: page.final_url,
        title: extracted.title.or(page.title),
        status: page.status,
        tier_used: page.tier_used,
        redirect_chain: page.redirect_chain,
        content,
        links,
        total_chunks,
        matched_chunks,
        truncated,
        items_omitted,
        original_tokens,
        returned_tokens,
        warnings,
        timings_ms,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::header, routing::get, Router};
    use std::net::SocketAddr;
    use webscope_core::ContentNode;

    const ARTICLE: &str = r#"<html>
<head><title>Async Runtimes</title></head>
<body>
  <nav><a href="/home">home</a></nav>
  <article>
    <h1>Async Runtimes in Rust</h1>
    <p>The async runtime handles scheduling of tasks across worker threads.</p>
    <p>Runtime scheduling is cooperative: async tasks yield at await points.</p>
    <p>The farmers market sells excellent sourdough bread on Saturday mornings.</p>
    <ul><li>lightweight tasks over system threads</li><li>non-blocking network input and output</li></ul>
    <a href="/docs/scheduler">scheduler docs</a>
  </article>
</body></html>"#;

    async fn serve_article() -> SocketAddr {
        let app = Router::new().route(
            "/",
            get(|| async { ([(header::CONTENT_TYPE, "text/html")], ARTICLE) }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    fn static_only(url: &str) -> BrowseRequest {
        let mut req = BrowseRequest::new(url);
        req.max_tier = Tier::Static;
        req
    }

    #[tokio::test]
    async fn browse_returns_structured_content_and_links() {
        let addr = serve_article().await;
        let resp = browse(&static_only(&format!("http://{addr}/"))).await.unwrap();

        assert_eq!(resp.status, 200);
        assert_eq!(resp.tier_used, Tier::Static);
        assert_eq!(resp.title.as_deref(), Some("Async Runtimes"));
        let Payload::Structured(nodes) = &resp.content else {
            panic!("expected structured content");
        };
        assert!(matches!(
            nodes.first(),
            Some(ContentNode::Heading { level: 1, .. })
        ));
        assert!(resp.links.iter().any(|l| l.ends_with("/docs/scheduler")));
        assert!(!resp.truncated);
        assert!(resp.timings_ms.contains_key("fetch"));
        assert!(resp.timings_ms.contains_key("total"));
    }

    #[tokio::test]
    async fn browse_text_only_returns_readable_plain_text() {
        let addr = serve_article().await;
        let mut req = static_only(&format!("http://{addr}/"));
        req.text_only = true;
        let resp = browse(&req).await.unwrap();

        let Payload::Text(text) = &resp.content else {
            panic!("expected plain text content");
        };
        assert!(text.contains("sourdough bread"));
        assert!(text.contains("worker threads"));
        assert!(!text.contains("<p>"));
    }

    #[tokio::test]
    async fn browse_with_query_filters_to_relevant_text() {
        let addr = serve_article().await;
        let mut req = static_only(&format!("http://{addr}/"));
        req.query = Some("async runtime scheduling".to_string());
        let resp = browse(&req).await.unwrap();

        let Payload::Text(text) = &resp.content else {
            panic!("expected filtered text content");
        };
        assert!(resp.matched_chunks.unwrap() >= 1);
        assert!(resp.matched_chunks.unwrap() < resp.total_chunks.unwrap());
        assert!(text.contains("schedule") || text.contains("scheduling"));
        assert!(!text.contains("sourdough"));
    }

    #[tokio::test]
    async fn browse_with_unrelated_query_fails_narrow() {
        let addr = serve_article().await;
        let mut req = static_only(&format!("http://{addr}/"));
        req.query = Some("zebra migration photography underwater".to_string());
        let resp = browse(&req).await.unwrap();

        assert_eq!(resp.matched_chunks, Some(0));
        assert_eq!(resp.content, Payload::Text(String::new()));
        assert!(resp.warnings.contains(&"semantic_no_match"));
    }

    #[tokio::test]
    async fn browse_with_budget_truncates_and_reports_it() {
        let addr = serve_article().await;
        let mut req = static_only(&format!("http://{addr}/"));
        req.max_tokens = Some(30);
        let resp = browse(&req).await.unwrap();

        assert!(resp.truncated);
        assert!(resp.items_omitted >= 1);
        assert!(resp.returned_tokens < resp.original_tokens);
        assert!(resp.warnings.contains(&"truncated"));
        // The heading survives: highest priority.
        let Payload::Structured(nodes) = &resp.content else {
            panic!("expected structured content");
        };
        assert!(nodes
            .iter()
            .any(|n| matches!(n, ContentNode::Heading { .. })));
    }

    #[tokio::test]
    async fn browse_response_serializes_to_json() {
        let addr = serve_article().await;
        let resp = browse(&static_only(&format!("http://{addr}/"))).await.unwrap();
        let v = serde_json::to_value(&resp).unwrap();
        assert_eq!(v["tier_used"], "static");
        assert!(v["timings_ms"].is_object());
    }
}
