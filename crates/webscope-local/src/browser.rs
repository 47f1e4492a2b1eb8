//! FullBrowser tier: a real headless browser behind a persistent Node.js
//! Playwright child.
//!
//! The child is a process-wide singleton, lazily launched on first use and
//! reused across sessions for cost amortization. It speaks JSON-lines over
//! stdio: one request line in, one response line out. Requests are serialized
//! under the singleton mutex (single active browsing flow; logical isolation
//! only, not process isolation).

use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::sync::{Mutex, OnceCell};
use webscope_core::{Error, FetchOptions, PageResult, Result, Tier, TierFetcher};

use crate::extract;
use crate::render_dom::env_truthy;

// Expected setup: Node.js, the `playwright` npm package resolvable by Node,
// and browsers installed (`npx playwright install chromium`). No runtime
// auto-install.
const JS: &str = r#"
const readline = require('readline');

function out(obj) { process.stdout.write(JSON.stringify(obj) + '\n'); }

let pw = null;
let browser = null;
let context = null;

async function ensureBrowser() {
  if (browser) return;
  pw = require('playwright');
  browser = await pw.chromium.launch({ headless: true });
  context = await browser.newContext({ serviceWorkers: 'block' });
}

async function handle(req) {
  const id = req.id || 0;
  const url = String(req.url || '').trim();
  const timeoutMs = Number(req.timeout_ms || 20000);
  if (!url) return out({ id, ok: false, error: { code: 'invalid_params', message: 'url must be non-empty' } });

  try {
    await ensureBrowser();
  } catch (e) {
    return out({ id, ok: false, error: {
      code: 'not_configured',
      message: 'Playwright is not available to Node.js: ' + String(e && e.message ? e.message : e),
      hint: 'Install Playwright (`npm i -g playwright`) and a browser (`npx playwright install chromium`).',
    } });
  }

  const t0 = Date.now();
  let page;
  try {
    page = await context.newPage();
    const resp = await page.goto(url, { waitUntil: 'domcontentloaded', timeout: timeoutMs });
    // Best-effort settle; never block on long-polling pages.
    try { await page.waitForLoadState('networkidle', { timeout: Math.min(5000, timeoutMs) }); } catch (_) {}
    const html = await page.content();
    out({ id, ok: true, final_url: page.url(), status: resp ? resp.status() : null, html, elapsed_ms: Date.now() - t0 });
  } catch (e) {
    out({ id, ok: false, error: { code: 'fetch_failed', message: String(e && e.message ? e.message : e) } });
  } finally {
    try { if (page) await page.close(); } catch (_) {}
  }
}

const rl = readline.createInterface({ input: process.stdin });
let queue = Promise.resolve();
rl.on('line', (line) => {
  queue = queue.then(() => {
    let req;
    try { req = JSON.parse(line); } catch (e) {
      out({ id: 0, ok: false, error: { code: 'invalid_params', message: 'bad JSON request line' } });
      return;
    }
    return handle(req);
  });
});
rl.on('close', async () => {
  try { if (browser) await browser.close(); } catch (_) {}
  process.exit(0);
});
"#;

fn playwright_node_path() -> Option<String> {
    fn has_playwright(path: &str) -> bool {
        path.split(':')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .any(|p| std::path::Path::new(p).join("playwright").is_dir())
    }

    if let Ok(v) = std::env::var("WEBSCOPE_NODE_PATH") {
        let v = v.trim();
        if !v.is_empty() {
            return Some(v.to_string());
        }
    }

    let existing = std::env::var("NODE_PATH").unwrap_or_default();
    if has_playwright(&existing) {
        return None;
    }

    let mut candidates: Vec<String> = Vec::new();
    if let Some(home) = std::env::var_os("HOME").map(std::path::PathBuf::from) {
        candidates.push(
            home.join(".npm-global")
                .join("lib")
                .join("node_modules")
                .to_string_lossy()
                .to_string(),
        );
    }
    candidates.push("/opt/homebrew/lib/node_modules".to_string());
    candidates.push("/usr/local/lib/node_modules".to_string());
    candidates.push("/usr/lib/node_modules".to_string());

    let found = candidates
        .into_iter()
        .find(|r| std::path::Path::new(r).join("playwright").is_dir())?;
    if existing.trim().is_empty() {
        Some(found)
    } else {
        Some(format!("{existing}:{found}"))
    }
}

#[derive(Debug, Clone)]
pub struct RenderedPage {
    pub final_url: String,
    pub status: Option<u16>,
    pub html: String,
    pub elapsed_ms: u64,
}

/// Parse one JSON-lines response from the browser child.
fn parse_browser_line(line: &str, fallback_url: &str, max_chars: usize) -> Result<RenderedPage> {
    let v: serde_json::Value = serde_json::from_str(line.trim())
        .map_err(|e| Error::Network(format!("browser returned invalid JSON: {e}")))?;

    if v.get("ok").and_then(|x| x.as_bool()) != Some(true) {
        let code = v
            .pointer("/error/code")
            .and_then(|x| x.as_str())
            .unwrap_or("fetch_failed");
        let message = v
            .pointer("/error/message")
            .and_then(|x| x.as_str())
            .unwrap_or("browser render failed");
        let hint = v
            .pointer("/error/hint")
            .and_then(|x| x.as_str())
            .unwrap_or("")
            .trim();
        let full = if hint.is_empty() {
            message.to_string()
        } else {
            format!("{message}. {hint}")
        };
        return Err(match code {
            "not_configured" => Error::NotConfigured(full),
            "invalid_params" => Error::InvalidUrl(full),
            _ => Error::Network(full),
        });
    }

    let html = v
        .get("html")
        .and_then(|x| x.as_str())
        .unwrap_or("")
        .to_string();
    // A "successful" render with no markup is a failure in disguise.
    if html.trim().is_empty() {
        return Err(Error::Extract(
            "browser render returned empty HTML".to_string(),
        ));
    }
    if html.len() > max_chars {
        return Err(Error::Extract(format!(
            "browser render HTML too large ({} chars > {max_chars})",
            html.len()
        )));
    }

    Ok(RenderedPage {
        final_url: v
            .get("final_url")
            .and_then(|x| x.as_str())
            .unwrap_or(fallback_url)
            .to_string(),
        status: v.get("status").and_then(|x| x.as_u64()).map(|n| n as u16),
        html,
        elapsed_ms: v.get("elapsed_ms").and_then(|x| x.as_u64()).unwrap_or(0),
    })
}

struct BrowserServer {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
    next_id: u64,
}

impl BrowserServer {
    fn spawn() -> Result<Self> {
        let node_bin = std::env::var("WEBSCOPE_NODE").unwrap_or_else(|_| "node".to_string());
        let mut cmd = tokio::process::Command::new(node_bin);
        if let Some(node_path) = playwright_node_path() {
            cmd.env("NODE_PATH", node_path);
        }
        let mut child = cmd
            .arg("-e")
            .arg(JS)
            .kill_on_drop(true)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .spawn()
            .map_err(|e| {
                Error::NotConfigured(format!(
                    "browser render requires Node.js (`node`) and the Playwright npm package: {e}"
                ))
            })?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Internal("browser child: missing stdin pipe".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Internal("browser child: missing stdout pipe".to_string()))?;
        tracing::debug!("launched shared browser child");
        Ok(Self {
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
            next_id: 1,
        })
    }

    async fn request(&mut self, url: &str, timeout_ms: u64) -> Result<RenderedPage> {
        let id = self.next_id;
        self.next_id += 1;
        let mut line = serde_json::json!({
            "id": id,
            "url": url,
            "timeout_ms": timeout_ms,
        })
        .to_string();
        line.push('\n');
        self.stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| Error::Network(format!("browser child stdin closed: {e}")))?;
        self.stdin
            .flush()
            .await
            .map_err(|e| Error::Network(format!("browser child stdin closed: {e}")))?;

        let hard_ms = std::env::var("WEBSCOPE_RENDER_HARD_TIMEOUT_MS")
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok())
            .unwrap_or(timeout_ms.saturating_add(10_000));
        let reply = tokio::time::timeout(Duration::from_millis(hard_ms), self.stdout.next_line())
            .await
            .map_err(|_| Error::Timeout { elapsed_ms: hard_ms })?
            .map_err(|e| Error::Network(format!("browser child stdout failed: {e}")))?
            .ok_or_else(|| Error::Network("browser child exited".to_string()))?;

        let max_chars = std::env::var("WEBSCOPE_RENDER_MAX_HTML_CHARS")
            .ok()
            .and_then(|s| s.trim().parse::<usize>().ok())
            .unwrap_or(2_000_000);
        parse_browser_line(&reply, url, max_chars)
    }

    async fn kill(mut self) {
        let _ = self.child.kill().await;
        let _ = self.child.wait().await;
    }
}

static SHARED_BROWSER: OnceCell<Mutex<Option<BrowserServer>>> = OnceCell::const_new();

async fn shared_slot() -> &'static Mutex<Option<BrowserServer>> {
    SHARED_BROWSER
        .get_or_init(|| async { Mutex::new(None) })
        .await
}

/// Load `url` in the shared browser, launching the child on first use.
///
/// The slot mutex is held for the whole request: page loads are serialized.
/// A dead or timed-out child is killed and cleared so the next call relaunches.
pub async fn render_page(url: &str, timeout_ms: u64) -> Result<RenderedPage> {
    if env_truthy("WEBSCOPE_RENDER_DISABLE") {
        return Err(Error::NotConfigured(
            "render backend disabled (WEBSCOPE_RENDER_DISABLE)".to_string(),
        ));
    }

    let slot = shared_slot().await;
    let mut guard = slot.lock().await;
    if guard.is_none() {
        *guard = Some(BrowserServer::spawn()?);
    }
    let server = guard
        .as_mut()
        .ok_or_else(|| Error::Internal("browser slot empty after launch".to_string()))?;

    match server.request(url, timeout_ms).await {
        Ok(page) => Ok(page),
        Err(e) => {
            // The child may be wedged; relaunch on the next call.
            if let Some(server) = guard.take() {
                server.kill().await;
            }
            Err(e)
        }
    }
}

/// Tear the shared browser down. No-op if it was never launched.
pub async fn shutdown_shared_browser() -> Result<()> {
    let slot = shared_slot().await;
    let mut guard = slot.lock().await;
    if let Some(server) = guard.take() {
        tracing::debug!("shutting down shared browser child");
        server.kill().await;
    }
    Ok(())
}

/// FullBrowser tier fetcher over the shared browser singleton.
///
/// Response headers and the redirect chain are not observable through page
/// content rendering; those fields come back empty at this tier.
#[derive(Debug, Clone, Default)]
pub struct FullBrowserFetcher;

impl FullBrowserFetcher {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl TierFetcher for FullBrowserFetcher {
    fn tier(&self) -> Tier {
        Tier::FullBrowser
    }

    async fn fetch(&self, url: &url::Url, opts: &FetchOptions) -> Result<PageResult> {
        let rendered = render_page(url.as_str(), opts.timeout_ms).await?;
        let status = rendered.status.unwrap_or(200);
        if (400..600).contains(&status) {
            return Err(Error::HttpStatus { status });
        }
        Ok(PageResult {
            final_url: rendered.final_url,
            title: extract::page_title(&rendered.html),
            raw_markup: rendered.html,
            status,
            headers: Default::default(),
            redirect_chain: Vec::new(),
            tier_used: Tier::FullBrowser,
            timing: webscope_core::PageTiming {
                fetch_ms: rendered.elapsed_ms,
                total_ms: rendered.elapsed_ms,
            },
        })
    }

    async fn shutdown(&self) -> Result<()> {
        shutdown_shared_browser().await
    }
}
