//! Tiered fetch engine.
//!
//! Tiers are attempted in strictly increasing cost order. After each attempt
//! the pure [`decide`] function maps (state, outcome) to one action; the
//! session's `current_tier` field is a diagnostic projection and never feeds
//! back into the next decision.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use webscope_core::{
    validate_url, Error, FetchOptions, PageResult, Result, Tier, TierFetcher,
};

use crate::heuristics;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Highest tier the engine may ever invoke.
    pub ceiling: Tier,
    pub auto_escalate: bool,
    pub timeout_ms: u64,
    pub user_agent: String,
    pub max_redirects: usize,
    pub max_bytes: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let opts = FetchOptions::default();
        Self {
            ceiling: Tier::MAX,
            auto_escalate: true,
            timeout_ms: opts.timeout_ms,
            user_agent: opts.user_agent,
            max_redirects: opts.max_redirects,
            max_bytes: opts.max_bytes,
        }
    }
}

impl EngineConfig {
    pub fn fetch_options(&self) -> FetchOptions {
        FetchOptions {
            timeout_ms: self.timeout_ms,
            user_agent: self.user_agent.clone(),
            max_redirects: self.max_redirects,
            max_bytes: self.max_bytes,
            ..FetchOptions::default()
        }
    }
}

/// Inputs the escalation decision is allowed to see.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineState {
    pub tier: Tier,
    pub ceiling: Tier,
    pub auto_escalate: bool,
}

/// A fetch attempt, reduced to what the decision needs.
pub enum Outcome<'a> {
    Success { markup: &'a str },
    Failure { error: &'a Error },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Escalate { to: Tier, reason: &'static str },
    Return,
    Fail,
}

/// Pure transition function for one tier attempt.
///
/// HTTP status errors are a property of the URL, not the tier, so they always
/// `Fail`. A successful fetch escalates only when the markup heuristics for
/// the current tier boundary fire and a permitted tier remains.
pub fn decide(state: EngineState, outcome: &Outcome<'_>) -> Action {
    let room = state.auto_escalate && state.tier < state.ceiling;
    match outcome {
        Outcome::Success { markup } => {
            if room {
                if let (Some(reason), Some(to)) =
                    (heuristics::needs_escalation(state.tier, markup), state.tier.next())
                {
                    return Action::Escalate { to, reason };
                }
            }
            Action::Return
        }
        Outcome::Failure { error } => {
            if room && error.escalation_may_help() {
                if let Some(to) = state.tier.next() {
                    return Action::Escalate {
                        to,
                        reason: "fetch_failed",
                    };
                }
            }
            Action::Fail
        }
    }
}

/// One browsing session over a set of tier fetchers.
pub struct EngineSession {
    config: EngineConfig,
    fetchers: BTreeMap<Tier, Arc<dyn TierFetcher>>,
    forced_tier: Option<Tier>,
    auto_escalate: bool,
    /// Last tier attempted. Diagnostic only.
    current_tier: Tier,
    used_full_browser: bool,
}

impl EngineSession {
    pub fn new(config: EngineConfig, fetchers: Vec<Arc<dyn TierFetcher>>) -> Self {
        let auto_escalate = config.auto_escalate;
        Self {
            config,
            fetchers: fetchers.into_iter().map(|f| (f.tier(), f)).collect(),
            forced_tier: None,
            auto_escalate,
            current_tier: Tier::Static,
            used_full_browser: false,
        }
    }

    pub fn current_tier(&self) -> Tier {
        self.current_tier
    }

    pub fn used_full_browser(&self) -> bool {
        self.used_full_browser
    }

    /// Pin subsequent fetches to `tier` and disable auto-escalation until
    /// [`enable_auto_escalation`](Self::enable_auto_escalation).
    pub fn set_tier(&mut self, tier: Tier) -> Result<()> {
        if tier > self.config.ceiling {
            return Err(Error::NotConfigured(format!(
                "tier {tier} exceeds the configured ceiling {}",
                self.config.ceiling
            )));
        }
        self.forced_tier = Some(tier);
        self.auto_escalate = false;
        self.current_tier = tier;
        Ok(())
    }

    pub fn enable_auto_escalation(&mut self) {
        self.forced_tier = None;
        self.auto_escalate = true;
    }

    /// Fetch `url`, escalating through tiers as needed.
    pub async fn fetch(&mut self, url: &str) -> Result<PageResult> {
        let parsed = validate_url(url)?;
        let opts = self.config.fetch_options();
        let started = Instant::now();

        let auto = self.forced_tier.is_none() && self.auto_escalate;
        let mut tier = match self.forced_tier {
            Some(t) => t,
            None if auto => Tier::Static,
            None => self.config.ceiling,
        };

        loop {
            self.current_tier = tier;
            if tier == Tier::FullBrowser {
                self.used_full_browser = true;
            }
            let attempt = match self.fetchers.get(&tier) {
                Some(fetcher) => fetcher.fetch(&parsed, &opts).await,
                None => Err(Error::NotConfigured(format!(
                    "no fetcher registered for tier {tier}"
                ))),
            };

            let state = EngineState {
                tier,
                ceiling: self.config.ceiling,
                auto_escalate: auto,
            };
            let outcome = match &attempt {
                Ok(page) => Outcome::Success {
                    markup: &page.raw_markup,
                },
                Err(error) => Outcome::Failure { error },
            };

            match (decide(state, &outcome), attempt) {
                (Action::Escalate { to, reason }, _) => {
                    tracing::debug!(from = %tier, %to, reason, "escalating");
                    tier = to;
                }
                (_, Ok(mut page)) => {
                    page.tier_used = tier;
                    page.timing.total_ms = started.elapsed().as_millis() as u64;
                    return Ok(page);
                }
                (_, Err(e)) => return Err(e),
            }
        }
    }

    /// Release the shared browser, but only if this session ever fetched at
    /// the FullBrowser tier. Sessions that never escalated that far are
    /// no-ops here.
    pub async fn close(&mut self) -> Result<()> {
        if !self.used_full_browser {
            return Ok(());
        }
        self.used_full_browser = false;
        match self.fetchers.get(&Tier::FullBrowser) {
            Some(fetcher) => fetcher.shutdown().await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    const SPA_SHELL: &str = r#"<html><body><div id="root"></div></body></html>"#;

    fn rich_markup() -> String {
        let body = "Plenty of real visible prose content on this page. ".repeat(10);
        format!("<html><body><article><p>{body}</p></article></body></html>")
    }

    fn page(markup: &str) -> PageResult {
        PageResult {
            final_url: "http://example.test/".to_string(),
            title: None,
            raw_markup: markup.to_string(),
            status: 200,
            headers: BTreeMap::new(),
            redirect_chain: Vec::new(),
            tier_used: Tier::Static,
            timing: Default::default(),
        }
    }

    type Respond = Box<dyn Fn() -> Result<PageResult> + Send + Sync>;

    struct ScriptedFetcher {
        tier: Tier,
        respond: Respond,
        log: Arc<Mutex<Vec<Tier>>>,
        shutdowns: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl TierFetcher for ScriptedFetcher {
        fn tier(&self) -> Tier {
            self.tier
        }

        async fn fetch(&self, _url: &url::Url, _opts: &FetchOptions) -> Result<PageResult> {
            self.log.lock().unwrap().push(self.tier);
            (self.respond)()
        }

        async fn shutdown(&self) -> Result<()> {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Harness {
        log: Arc<Mutex<Vec<Tier>>>,
        shutdowns: Arc<AtomicUsize>,
        fetchers: Vec<Arc<dyn TierFetcher>>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                log: Arc::new(Mutex::new(Vec::new())),
                shutdowns: Arc::new(AtomicUsize::new(0)),
                fetchers: Vec::new(),
            }
        }

        fn tier(mut self, tier: Tier, respond: Respond) -> Self {
            self.fetchers.push(Arc::new(ScriptedFetcher {
                tier,
                respond,
                log: self.log.clone(),
                shutdowns: self.shutdowns.clone(),
            }));
            self
        }

        fn session(&self, ceiling: Tier) -> EngineSession {
            EngineSession::new(
                EngineConfig {
                    ceiling,
                    ..EngineConfig::default()
                },
                self.fetchers.clone(),
            )
        }

        fn attempts(&self) -> Vec<Tier> {
            self.log.lock().unwrap().clone()
        }
    }

    fn ok(markup: String) -> Respond {
        Box::new(move || Ok(page(&markup)))
    }

    #[test]
    fn decide_returns_on_sufficient_markup() {
        let state = EngineState {
            tier: Tier::Static,
            ceiling: Tier::MAX,
            auto_escalate: true,
        };
        let markup = rich_markup();
        let action = decide(state, &Outcome::Success { markup: &markup });
        assert_eq!(action, Action::Return);
    }

    #[test]
    fn decide_never_escalates_past_the_ceiling() {
        let state = EngineState {
            tier: Tier::Static,
            ceiling: Tier::Static,
            auto_escalate: true,
        };
        let action = decide(state, &Outcome::Success { markup: SPA_SHELL });
        assert_eq!(action, Action::Return);
    }

    #[test]
    fn decide_fails_http_errors_without_escalating() {
        let state = EngineState {
            tier: Tier::Static,
            ceiling: Tier::MAX,
            auto_escalate: true,
        };
        let err = Error::HttpStatus { status: 404 };
        assert_eq!(decide(state, &Outcome::Failure { error: &err }), Action::Fail);
        let err = Error::Network("connection refused".into());
        assert!(matches!(
            decide(state, &Outcome::Failure { error: &err }),
            Action::Escalate {
                to: Tier::ScriptedDom,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn tiers_are_attempted_in_increasing_order_and_capped() {
        let h = Harness::new()
            .tier(Tier::Static, ok(SPA_SHELL.to_string()))
            .tier(Tier::ScriptedDom, ok(SPA_SHELL.to_string()))
            .tier(
                Tier::FullBrowser,
                Box::new(|| panic!("tier above the ceiling must never run")),
            );
        let mut session = h.session(Tier::ScriptedDom);
        let result = session.fetch("http://example.test/").await.unwrap();
        assert_eq!(h.attempts(), vec![Tier::Static, Tier::ScriptedDom]);
        assert_eq!(result.tier_used, Tier::ScriptedDom);
    }

    #[tokio::test]
    async fn http_404_short_circuits_remaining_tiers() {
        let h = Harness::new()
            .tier(
                Tier::Static,
                Box::new(|| Err(Error::HttpStatus { status: 404 })),
            )
            .tier(Tier::ScriptedDom, ok(rich_markup()))
            .tier(Tier::FullBrowser, ok(rich_markup()));
        let mut session = h.session(Tier::FullBrowser);
        let err = session.fetch("http://example.test/missing").await.unwrap_err();
        assert!(matches!(err, Error::HttpStatus { status: 404 }));
        assert_eq!(h.attempts(), vec![Tier::Static]);
    }

    #[tokio::test]
    async fn sparse_markup_triggers_tier_two() {
        let h = Harness::new()
            .tier(Tier::Static, ok("<html><body>hi</body></html>".to_string()))
            .tier(Tier::ScriptedDom, ok(rich_markup()));
        let mut session = h.session(Tier::ScriptedDom);
        let result = session.fetch("http://example.test/").await.unwrap();
        assert!(h.attempts().contains(&Tier::ScriptedDom));
        assert_eq!(result.tier_used, Tier::ScriptedDom);
    }

    #[tokio::test]
    async fn spa_shell_never_returns_tier_one() {
        let h = Harness::new()
            .tier(Tier::Static, ok(SPA_SHELL.to_string()))
            .tier(Tier::ScriptedDom, ok(rich_markup()))
            .tier(Tier::FullBrowser, ok(rich_markup()));
        let mut session = h.session(Tier::FullBrowser);
        let result = session.fetch("http://example.test/app").await.unwrap();
        assert_ne!(result.tier_used, Tier::Static);
        assert!(matches!(
            result.tier_used,
            Tier::ScriptedDom | Tier::FullBrowser
        ));
    }

    #[tokio::test]
    async fn network_failure_escalates_then_propagates_at_ceiling() {
        let h = Harness::new()
            .tier(
                Tier::Static,
                Box::new(|| Err(Error::Network("connection reset".into()))),
            )
            .tier(
                Tier::ScriptedDom,
                Box::new(|| Err(Error::Timeout { elapsed_ms: 500 })),
            );
        let mut session = h.session(Tier::ScriptedDom);
        let err = session.fetch("http://example.test/").await.unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
        assert_eq!(h.attempts(), vec![Tier::Static, Tier::ScriptedDom]);
    }

    #[tokio::test]
    async fn invalid_url_fails_before_any_tier() {
        let h = Harness::new().tier(Tier::Static, ok(rich_markup()));
        let mut session = h.session(Tier::MAX);
        let err = session.fetch("ftp://example.test/").await.unwrap_err();
        assert!(matches!(err, Error::UnsupportedScheme(_)));
        assert!(h.attempts().is_empty());
    }

    #[tokio::test]
    async fn forced_tier_pins_the_fetch_and_disables_escalation() {
        let h = Harness::new()
            .tier(Tier::Static, ok(rich_markup()))
            .tier(Tier::ScriptedDom, ok(SPA_SHELL.to_string()))
            .tier(
                Tier::FullBrowser,
                Box::new(|| panic!("forced tier must not escalate")),
            );
        let mut session = h.session(Tier::FullBrowser);
        session.set_tier(Tier::ScriptedDom).unwrap();
        let result = session.fetch("http://example.test/").await.unwrap();
        assert_eq!(h.attempts(), vec![Tier::ScriptedDom]);
        assert_eq!(result.tier_used, Tier::ScriptedDom);

        session.enable_auto_escalation();
        let result = session.fetch("http://example.test/").await.unwrap();
        assert_eq!(result.tier_used, Tier::Static);
    }

    #[tokio::test]
    async fn set_tier_rejects_tiers_above_the_ceiling() {
        let h = Harness::new().tier(Tier::Static, ok(rich_markup()));
        let mut session = h.session(Tier::Static);
        let err = session.set_tier(Tier::FullBrowser).unwrap_err();
        assert!(matches!(err, Error::NotConfigured(_)));
    }

    #[tokio::test]
    async fn close_releases_the_browser_only_after_use() {
        let h = Harness::new()
            .tier(Tier::Static, ok(rich_markup()))
            .tier(Tier::FullBrowser, ok(rich_markup()));

        let mut idle = h.session(Tier::FullBrowser);
        idle.fetch("http://example.test/").await.unwrap();
        idle.close().await.unwrap();
        assert_eq!(h.shutdowns.load(Ordering::SeqCst), 0);

        let mut heavy = h.session(Tier::FullBrowser);
        heavy.set_tier(Tier::FullBrowser).unwrap();
        heavy.fetch("http://example.test/").await.unwrap();
        assert!(heavy.used_full_browser());
        heavy.close().await.unwrap();
        assert_eq!(h.shutdowns.load(Ordering::SeqCst), 1);
        // Idempotent: a second close is a no-op.
        heavy.close().await.unwrap();
        assert_eq!(h.shutdowns.load(Ordering::SeqCst), 1);
    }
}
