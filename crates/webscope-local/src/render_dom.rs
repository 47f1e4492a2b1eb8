//! ScriptedDom tier: scripts run against a simulated DOM (jsdom), no real
//! browser.
//!
//! The static fetch supplies status, headers, and the redirect chain; the
//! Node.js shellout then executes the page's inline scripts against that
//! markup and waits for DOM mutation quiescence before serializing. Stdout
//! from the child is JSON-only, args go over stdin to avoid argv quoting
//! issues.

use std::time::Duration;
use tokio::io::AsyncWriteExt;
use webscope_core::{Error, FetchOptions, PageResult, Result, Tier, TierFetcher};

use crate::{extract, StaticFetcher};

pub(crate) fn env_truthy(k: &str) -> bool {
    matches!(
        std::env::var(k)
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase()
            .as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn node_bin() -> String {
    std::env::var("WEBSCOPE_NODE").unwrap_or_else(|_| "node".to_string())
}

fn hard_timeout_ms(timeout_ms: u64) -> u64 {
    std::env::var("WEBSCOPE_RENDER_HARD_TIMEOUT_MS")
        .ok()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .unwrap_or(timeout_ms.saturating_add(10_000))
}

fn max_html_chars() -> usize {
    std::env::var("WEBSCOPE_RENDER_MAX_HTML_CHARS")
        .ok()
        .and_then(|s| s.trim().parse::<usize>().ok())
        .unwrap_or(2_000_000)
}

#[derive(Debug, Clone)]
pub struct RenderedDom {
    pub html: String,
    pub elapsed_ms: u64,
}

// Expected setup: Node.js present and the `jsdom` npm package resolvable by
// Node (global install or NODE_PATH). No runtime auto-install.
const JS: &str = r#"
const fs = require('fs');

function ok(obj) { process.stdout.write(JSON.stringify(obj)); }
function bad(code, message, hint) { ok({ ok: false, error: { code, message, hint } }); }

async function main() {
  let arg = '';
  try { arg = fs.readFileSync(0, 'utf8'); } catch (_) {}
  let req;
  try { req = JSON.parse(arg); } catch (e) { return bad('invalid_params', 'bad JSON args', 'Internal error: could not parse render args.'); }

  let jsdom;
  try { jsdom = require('jsdom'); } catch (e) {
    return bad('not_configured',
      'jsdom is not installed for Node.js (require("jsdom") failed)',
      'Install jsdom: `npm i -g jsdom` (or install it in your project so Node can require it).');
  }

  const html = String(req.html || '');
  const url = String(req.url || 'http://localhost/').trim();
  const timeoutMs = Number(req.timeout_ms || 20000);
  if (!html.trim()) return bad('invalid_params', 'html must be non-empty', 'Pass the fetched markup to render.');

  const t0 = Date.now();
  try {
    const virtualConsole = new jsdom.VirtualConsole();
    const dom = new jsdom.JSDOM(html, {
      url,
      runScripts: 'dangerously',
      pretendToBeVisual: true,
      virtualConsole,
    });

    // Wait for mutation quiescence: the DOM is considered settled after two
    // consecutive poll intervals without mutations, bounded by timeoutMs.
    let mutations = 0;
    const observer = new dom.window.MutationObserver((list) => { mutations += list.length; });
    observer.observe(dom.window.document, { childList: true, subtree: true, attributes: true, characterData: true });

    const pollMs = 100;
    let quietPolls = 0;
    while (Date.now() - t0 < timeoutMs && quietPolls < 2) {
      const before = mutations;
      await new Promise((r) => setTimeout(r, pollMs));
      quietPolls = (mutations === before) ? quietPolls + 1 : 0;
    }
    observer.disconnect();

    const out = dom.serialize();
    dom.window.close();
    ok({ ok: true, html: out, elapsed_ms: Date.now() - t0 });
  } catch (e) {
    bad('render_failed', String(e && e.message ? e.message : e), 'jsdom render failed. The page scripts may need a real browser.');
  }
}

main().catch((e) => bad('render_failed', String(e && e.message ? e.message : e), 'jsdom render failed.'));
"#;

/// Map one JSON response from the render child into the error taxonomy.
///
/// Render failures classify as `Extract` so the engine may still escalate to
/// the full browser; a missing jsdom install classifies as `NotConfigured`
/// for the same reason.
fn parse_render_response(stdout: &str, max_chars: usize) -> Result<RenderedDom> {
    let v: serde_json::Value = serde_json::from_str(stdout.trim())
        .map_err(|e| Error::Extract(format!("scripted DOM render returned invalid JSON: {e}")))?;

    if v.get("ok").and_then(|x| x.as_bool()) != Some(true) {
        let code = v
            .pointer("/error/code")
            .and_then(|x| x.as_str())
            .unwrap_or("render_failed");
        let message = v
            .pointer("/error/message")
            .and_then(|x| x.as_str())
            .unwrap_or("scripted DOM render failed");
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
            _ => Error::Extract(full),
        });
    }

    let html = v
        .get("html")
        .and_then(|x| x.as_str())
        .unwrap_or("")
        .to_string();
    if html.trim().is_empty() {
        return Err(Error::Extract(
            "scripted DOM render returned empty HTML".to_string(),
        ));
    }
    if html.len() > max_chars {
        return Err(Error::Extract(format!(
            "scripted DOM render HTML too large ({} chars > {max_chars})",
            html.len()
        )));
    }
    let elapsed_ms = v.get("elapsed_ms").and_then(|x| x.as_u64()).unwrap_or(0);
    Ok(RenderedDom { html, elapsed_ms })
}

/// Run the fetched markup through the Node/jsdom child and return the
/// post-script DOM.
pub async fn render_markup(html: &str, url: &str, timeout_ms: u64) -> Result<RenderedDom> {
    if env_truthy("WEBSCOPE_RENDER_DISABLE") {
        return Err(Error::NotConfigured(
            "render backend disabled (WEBSCOPE_RENDER_DISABLE)".to_string(),
        ));
    }

    let args_json = serde_json::json!({
        "html": html,
        "url": url,
        "timeout_ms": timeout_ms,
    })
    .to_string();

    let mut child = tokio::process::Command::new(node_bin())
        .arg("-e")
        .arg(JS)
        .kill_on_drop(true)
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .spawn()
        .map_err(|e| {
            Error::NotConfigured(format!(
                "scripted DOM render requires Node.js (`node`) and the jsdom npm package: {e}"
            ))
        })?;

    if let Some(mut stdin) = child.stdin.take() {
        // Best-effort: a failed write surfaces as a JSON error from the child
        // or a failed wait below.
        let _ = stdin.write_all(args_json.as_bytes()).await;
        let _ = stdin.shutdown().await;
    }

    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::Internal("scripted DOM render: missing stdout pipe".to_string()))?;
    let stdout_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = tokio::io::AsyncReadExt::read_to_end(&mut stdout, &mut buf).await;
        buf
    });

    // The hard wall-clock timeout must wrap the child wait; checking elapsed
    // after completion would not prevent hangs.
    let hard_ms = hard_timeout_ms(timeout_ms);
    match tokio::time::timeout(Duration::from_millis(hard_ms), child.wait()).await {
        Ok(r) => {
            r.map_err(|e| Error::Extract(format!("scripted DOM render child failed: {e}")))?;
        }
        Err(_) => {
            let _ = child.kill().await;
            let _ = child.wait().await;
            stdout_task.abort();
            return Err(Error::Timeout {
                elapsed_ms: hard_ms,
            });
        }
    }

    let out = stdout_task.await.unwrap_or_default();
    parse_render_response(&String::from_utf8_lossy(&out), max_html_chars())
}

/// ScriptedDom tier fetcher: a static fetch (for status, headers, and the
/// redirect chain) followed by a jsdom pass over the markup.
#[derive(Debug, Clone)]
pub struct ScriptedDomFetcher {
    inner: StaticFetcher,
}

impl ScriptedDomFetcher {
    pub fn new() -> Result<Self> {
        Ok(Self {
            inner: StaticFetcher::new()?,
        })
    }

    pub fn from_static(inner: StaticFetcher) -> Self {
        Self { inner }
    }
}

#[async_trait::async_trait]
impl TierFetcher for ScriptedDomFetcher {
    fn tier(&self) -> Tier {
        Tier::ScriptedDom
    }

    async fn fetch(&self, url: &url::Url, opts: &FetchOptions) -> Result<PageResult> {
        let mut page = self.inner.fetch(url, opts).await?;
        let rendered = render_markup(&page.raw_markup, &page.final_url, opts.timeout_ms).await?;
        tracing::debug!(
            url = %page.final_url,
            elapsed_ms = rendered.elapsed_ms,
            "scripted DOM render settled"
        );
        page.title = extract::page_title(&rendered.html).or(page.title);
        page.raw_markup = rendered.html;
        page.tier_used = Tier::ScriptedDom;
        page.timing.fetch_ms = page.timing.fetch_ms.saturating_add(rendered.elapsed_ms);
        page.timing.total_ms = page.timing.fetch_ms;
        Ok(page)
    }
}
