use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use webscope_core::{Error, FetchOptions, PageResult, PageTiming, Result, Tier, TierFetcher};

pub mod browser;
pub mod chunk;
pub mod embedder;
pub mod engine;
pub mod extract;
pub mod heuristics;
pub mod pipeline;
pub mod render_dom;
pub mod semantic;
pub mod truncate;

/// Static tier: plain HTTP GET + parse, no script execution.
///
/// Redirects are followed manually (not via a client policy) so the
/// intermediate URLs can be reported in `PageResult.redirect_chain`.
#[derive(Debug, Clone)]
pub struct StaticFetcher {
    client: reqwest::Client,
}

impl StaticFetcher {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            // Safety defaults: avoid "hang forever" on DNS/TLS/body stalls.
            // The per-fetch timeout (FetchOptions.timeout_ms) bounds the whole call.
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::Network(e.to_string()))?;
        Ok(Self { client })
    }

    fn is_sensitive_request_header(name: &reqwest::header::HeaderName) -> bool {
        // Do not forward secrets to arbitrary URLs.
        // (Header names are case-insensitive; HeaderName::as_str() is canonical lower-case.)
        matches!(
            name.as_str(),
            "authorization" | "cookie" | "proxy-authorization"
        )
    }

    fn apply_headers(
        mut rb: reqwest::RequestBuilder,
        headers: &BTreeMap<String, String>,
    ) -> reqwest::RequestBuilder {
        for (k, v) in headers {
            if let (Ok(name), Ok(value)) = (
                reqwest::header::HeaderName::from_bytes(k.as_bytes()),
                reqwest::header::HeaderValue::from_str(v),
            ) {
                if Self::is_sensitive_request_header(&name) {
                    continue;
                }
                rb = rb.header(name, value);
            }
        }
        rb
    }

    fn classify_reqwest_error(e: reqwest::Error, elapsed: Duration) -> Error {
        if e.is_timeout() {
            Error::Timeout {
                elapsed_ms: elapsed.as_millis() as u64,
            }
        } else {
            Error::Network(e.to_string())
        }
    }

    async fn fetch_inner(&self, url: &url::Url, opts: &FetchOptions) -> Result<PageResult> {
        let t0 = Instant::now();
        let mut current = url.clone();
        let mut redirect_chain: Vec<String> = Vec::new();

        loop {
            let rb = self
                .client
                .get(current.clone())
                .header(reqwest::header::USER_AGENT, &opts.user_agent)
                .timeout(opts.timeout());
            let rb = Self::apply_headers(rb, &opts.headers);
            let resp = rb
                .send()
                .await
                .map_err(|e| Self::classify_reqwest_error(e, t0.elapsed()))?;

            let status = resp.status();
            if status.is_redirection() && opts.follow_redirects {
                if redirect_chain.len() >= opts.max_redirects {
                    return Err(Error::Network(format!(
                        "too many redirects (> {})",
                        opts.max_redirects
                    )));
                }
                let Some(loc) = resp
                    .headers()
                    .get(reqwest::header::LOCATION)
                    .and_then(|v| v.to_str().ok())
                else {
                    return Err(Error::Network(format!(
                        "redirect {status} without a Location header"
                    )));
                };
                let next = current
                    .join(loc)
                    .map_err(|e| Error::InvalidUrl(format!("bad redirect target: {e}")))?;
                redirect_chain.push(current.to_string());
                current = next;
                continue;
            }

            if status.is_client_error() || status.is_server_error() {
                return Err(Error::HttpStatus {
                    status: status.as_u16(),
                });
            }

            let mut headers = BTreeMap::new();
            for (k, v) in resp.headers().iter() {
                if let Ok(s) = v.to_str() {
                    headers.insert(k.as_str().to_string(), s.to_string());
                }
            }

            let max_bytes = opts.max_bytes as usize;
            let mut bytes: Vec<u8> = Vec::new();
            let mut stream = resp.bytes_stream();
            use futures_util::StreamExt;
            while let Some(chunk) = stream.next().await {
                let chunk = chunk.map_err(|e| Self::classify_reqwest_error(e, t0.elapsed()))?;
                if bytes.len().saturating_add(chunk.len()) > max_bytes {
                    let can_take = max_bytes.saturating_sub(bytes.len());
                    bytes.extend_from_slice(&chunk[..can_take]);
                    break;
                }
                bytes.extend_from_slice(&chunk);
            }

            let raw_markup = String::from_utf8_lossy(&bytes).to_string();
            let title = extract::page_title(&raw_markup);
            let fetch_ms = t0.elapsed().as_millis() as u64;

            return Ok(PageResult {
                final_url: current.to_string(),
                title,
                raw_markup,
                status: status.as_u16(),
                headers,
                redirect_chain,
                tier_used: Tier::Static,
                timing: PageTiming {
                    fetch_ms,
                    total_ms: fetch_ms,
                },
            });
        }
    }
}

#[async_trait::async_trait]
impl TierFetcher for StaticFetcher {
    fn tier(&self) -> Tier {
        Tier::Static
    }

    async fn fetch(&self, url: &url::Url, opts: &FetchOptions) -> Result<PageResult> {
        // One wall-clock budget over the whole redirect chain, not per hop.
        match tokio::time::timeout(opts.timeout(), self.fetch_inner(url, opts)).await {
            Ok(r) => r,
            Err(_) => Err(Error::Timeout {
                elapsed_ms: opts.timeout_ms,
            }),
        }
    }
}
