use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("unsupported scheme: {0}")]
    UnsupportedScheme(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },
    #[error("HTTP {status}")]
    HttpStatus { status: u16 },
    #[error("extract failed: {0}")]
    Extract(String),
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("not configured: {0}")]
    NotConfigured(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether retrying the same URL at a more capable tier could plausibly
    /// change the outcome.
    ///
    /// HTTP status errors are a property of the URL, not the tier, so they
    /// never escalate. Invalid input fails before any tier is attempted.
    pub fn escalation_may_help(&self) -> bool {
        matches!(
            self,
            Error::Network(_) | Error::Timeout { .. } | Error::Extract(_) | Error::NotConfigured(_)
        )
    }

    /// Actionable hint for the caller, when one exists.
    ///
    /// `None` is meaningful: there is nothing useful to suggest.
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            Error::InvalidUrl(_) | Error::UnsupportedScheme(_) => {
                Some("check the URL (must be absolute http or https)")
            }
            Error::Timeout { .. } => Some("try a longer timeout_ms, or retry"),
            Error::HttpStatus { status: 429 } => Some("rate limited; wait before retrying"),
            Error::HttpStatus { status } if (500..600).contains(status) => {
                Some("server error; retry later")
            }
            Error::NotConfigured(_) => Some("install the missing local tooling, or lower max_tier"),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Rendering strategies in increasing cost and capability.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Plain HTTP GET + parse. No script execution.
    #[default]
    Static = 1,
    /// Scripted DOM (jsdom-style): scripts run against a simulated DOM.
    ScriptedDom = 2,
    /// Real headless browser.
    FullBrowser = 3,
}

impl Tier {
    pub const MAX: Tier = Tier::FullBrowser;

    pub const fn rank(self) -> u8 {
        self as u8
    }

    /// The next more capable tier, if any.
    pub const fn next(self) -> Option<Tier> {
        match self {
            Tier::Static => Some(Tier::ScriptedDom),
            Tier::ScriptedDom => Some(Tier::FullBrowser),
            Tier::FullBrowser => None,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::Static => write!(f, "static"),
            Tier::ScriptedDom => write!(f, "scripted_dom"),
            Tier::FullBrowser => write!(f, "full_browser"),
        }
    }
}

impl TryFrom<u8> for Tier {
    type Error = Error;

    fn try_from(v: u8) -> Result<Tier> {
        match v {
            1 => Ok(Tier::Static),
            2 => Ok(Tier::ScriptedDom),
            3 => Ok(Tier::FullBrowser),
            other => Err(Error::InvalidUrl(format!("no such tier: {other}"))),
        }
    }
}

/// Parse and validate a URL for fetching.
///
/// Only absolute `http`/`https` URLs are fetchable; anything else fails
/// before any tier is attempted.
pub fn validate_url(s: &str) -> Result<url::Url> {
    let u = url::Url::parse(s.trim()).map_err(|e| Error::InvalidUrl(e.to_string()))?;
    match u.scheme() {
        "http" | "https" => Ok(u),
        other => Err(Error::UnsupportedScheme(other.to_string())),
    }
}

/// Per-fetch knobs shared by all tiers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchOptions {
    /// Timeout for the operation (network + rendering).
    pub timeout_ms: u64,
    pub user_agent: String,
    /// Optional headers to add (best-effort; fetchers drop unsafe headers).
    pub headers: BTreeMap<String, String>,
    pub follow_redirects: bool,
    pub max_redirects: usize,
    /// Hard cap on bytes read from the response body.
    pub max_bytes: u64,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            timeout_ms: 20_000,
            user_agent: "webscope/0.1".to_string(),
            headers: BTreeMap::new(),
            follow_redirects: true,
            max_redirects: 10,
            max_bytes: 2_000_000,
        }
    }
}

impl FetchOptions {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PageTiming {
    /// Time spent in the winning tier's fetch.
    pub fetch_ms: u64,
    /// Wall-clock for the whole engine call, across all attempted tiers.
    pub total_ms: u64,
}

/// One successful fetch attempt. Immutable once produced; the engine may
/// produce several internally before returning the one it keeps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageResult {
    pub final_url: String,
    pub title: Option<String>,
    pub raw_markup: String,
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    /// Intermediate URLs visited before `final_url`, in order.
    pub redirect_chain: Vec<String>,
    pub tier_used: Tier,
    pub timing: PageTiming,
}

/// Content-type tag shared by content nodes and chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Heading,
    Paragraph,
    List,
    ListItem,
    Blockquote,
    Code,
    Image,
    Link,
}

/// Structured content node. An extracted page is an ordered forest of these.
///
/// Invariant: `level` exists only on headings and is clamped to 1..=6 at
/// extraction time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentNode {
    Heading { level: u8, text: String },
    Paragraph { text: String },
    List { items: Vec<ContentNode> },
    ListItem { text: String },
    Blockquote { text: String },
    Code { text: String },
    Image { src: String, alt: Option<String> },
    Link { href: String, text: String },
}

impl ContentNode {
    pub fn kind(&self) -> NodeKind {
        match self {
            ContentNode::Heading { .. } => NodeKind::Heading,
            ContentNode::Paragraph { .. } => NodeKind::Paragraph,
            ContentNode::List { .. } => NodeKind::List,
            ContentNode::ListItem { .. } => NodeKind::ListItem,
            ContentNode::Blockquote { .. } => NodeKind::Blockquote,
            ContentNode::Code { .. } => NodeKind::Code,
            ContentNode::Image { .. } => NodeKind::Image,
            ContentNode::Link { .. } => NodeKind::Link,
        }
    }

    /// Flattened text of this node, recursing through list children.
    pub fn text(&self) -> String {
        match self {
            ContentNode::Heading { text, .. }
            | ContentNode::Paragraph { text }
            | ContentNode::ListItem { text }
            | ContentNode::Blockquote { text }
            | ContentNode::Code { text }
            | ContentNode::Link { text, .. } => text.clone(),
            ContentNode::Image { alt, .. } => alt.clone().unwrap_or_default(),
            ContentNode::List { items } => items
                .iter()
                .map(|n| n.text())
                .filter(|t| !t.is_empty())
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

/// Dual-shape content flowing through the truncator and chunker.
///
/// One tagged union instead of overloading on a runtime type check; each
/// consumer dispatches once at its entry point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Payload {
    Structured(Vec<ContentNode>),
    Text(String),
}

impl Payload {
    pub fn is_empty(&self) -> bool {
        match self {
            Payload::Structured(nodes) => nodes.is_empty(),
            Payload::Text(t) => t.trim().is_empty(),
        }
    }
}

/// A minimally-sized unit of extracted text, eligible for semantic scoring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentChunk {
    pub text: String,
    /// Position in the original traversal order.
    pub original_index: usize,
    pub kind: NodeKind,
    /// Caller-supplied precomputed embedding; recomputed per search if absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SemanticMatch {
    pub chunk: ContentChunk,
    /// Cosine similarity in [-1, 1].
    pub score: f32,
}

/// Outcome of one truncation call.
#[derive(Debug, Clone, Serialize)]
pub struct TruncationResult {
    /// Same shape as the input payload.
    pub content: Payload,
    pub original_tokens: usize,
    pub returned_tokens: usize,
    pub truncated: bool,
    pub items_omitted: usize,
}

/// One rendering strategy. Implementations are the engine's only way to
/// touch the network.
#[async_trait::async_trait]
pub trait TierFetcher: Send + Sync {
    fn tier(&self) -> Tier;

    async fn fetch(&self, url: &url::Url, opts: &FetchOptions) -> Result<PageResult>;

    /// Release any expensive shared resource this tier holds. Default no-op.
    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

/// Black-box text embedding: text in, fixed-length vector out.
///
/// Both methods may trigger one-time lazy model initialization on first call.
#[async_trait::async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Batched embedding. Default implementation loops; backends with real
    /// batch inference should override.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for t in texts {
            out.push(self.embed(t).await?);
        }
        Ok(out)
    }

    /// Constant for the lifetime of the provider.
    fn dimension(&self) -> usize;

    /// Stable identifier for this backend.
    fn id(&self) -> &str;
}
