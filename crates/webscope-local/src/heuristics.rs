//! Escalation heuristics: pure predicates over raw markup.
//!
//! Each tier boundary has an ordered list of named checks, OR-ed with
//! short-circuit. New checks slot into the lists without touching the engine
//! state machine. Thresholds are hand-tuned constants, kept as-is.

use crate::extract;
use html_scraper::{Html, Selector};

/// Below this much visible body text, a static fetch is presumed to be an
/// unhydrated app shell.
pub const MIN_VISIBLE_CHARS: usize = 100;

/// A `<noscript>` block longer than this signals content that only renders
/// with scripts off, i.e. the scripted path differs from what we fetched.
pub const MIN_NOSCRIPT_CHARS: usize = 50;

/// Literal markers of single-page-app roots. Matched case-insensitively.
const SPA_ROOT_MARKERS: &[&str] = &[
    "id=\"root\"",
    "id='root'",
    "id=\"app\"",
    "id='app'",
    "id=\"__next\"",
    "data-reactroot",
    "__next_data__",
    "ng-version",
    "data-v-app",
];

/// Markers of bundler/hydration complexity a scripted DOM cannot faithfully
/// execute: real browser APIs (custom elements, shadow DOM) or framework
/// hydration protocols.
const HYDRATION_MARKERS: &[&str] = &[
    "webpackchunk",
    "__webpack",
    "self.__next_s",
    "suppresshydrationwarning",
    "window.__nuxt",
    "customelements.define",
    "attachshadow",
];

fn contains_any_ci(markup: &str, needles: &[&str]) -> bool {
    let lc = markup.to_ascii_lowercase();
    needles.iter().any(|n| lc.contains(n))
}

fn sparse_visible_text(markup: &str) -> bool {
    extract::visible_text(markup).chars().count() < MIN_VISIBLE_CHARS
}

fn meaningful_noscript(markup: &str) -> bool {
    let doc = Html::parse_document(markup);
    let Ok(sel) = Selector::parse("noscript") else {
        return false;
    };
    let total: usize = doc
        .select(&sel)
        .map(|el| {
            el.text()
                .map(|t| t.trim().chars().count())
                .sum::<usize>()
        })
        .sum();
    total > MIN_NOSCRIPT_CHARS
}

fn spa_root_markers(markup: &str) -> bool {
    contains_any_ci(markup, SPA_ROOT_MARKERS)
}

fn hydration_markers(markup: &str) -> bool {
    contains_any_ci(markup, HYDRATION_MARKERS)
}

/// One named escalation predicate.
pub struct EscalationCheck {
    pub name: &'static str,
    pub check: fn(&str) -> bool,
}

/// Checks that promote Static → ScriptedDom.
pub static SCRIPTED_DOM_CHECKS: &[EscalationCheck] = &[
    EscalationCheck {
        name: "sparse_visible_text",
        check: sparse_visible_text,
    },
    EscalationCheck {
        name: "meaningful_noscript",
        check: meaningful_noscript,
    },
    EscalationCheck {
        name: "spa_root_markers",
        check: spa_root_markers,
    },
];

/// Checks that promote ScriptedDom → FullBrowser.
pub static FULL_BROWSER_CHECKS: &[EscalationCheck] = &[EscalationCheck {
    name: "hydration_markers",
    check: hydration_markers,
}];

/// Whether markup fetched at `from` is judged insufficient, and by which
/// check. No heuristic exists beyond the highest tier.
pub fn needs_escalation(from: webscope_core::Tier, markup: &str) -> Option<&'static str> {
    let checks: &[EscalationCheck] = match from {
        webscope_core::Tier::Static => SCRIPTED_DOM_CHECKS,
        webscope_core::Tier::ScriptedDom => FULL_BROWSER_CHECKS,
        webscope_core::Tier::FullBrowser => return None,
    };
    checks.iter().find(|c| (c.check)(markup)).map(|c| c.name)
}
