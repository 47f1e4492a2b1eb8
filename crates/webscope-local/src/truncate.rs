//! Token-budgeted truncation.
//!
//! Token counts are a chars/4 heuristic, not a real tokenizer; the budget is
//! a best-effort bound and callers should treat it with a small tolerance.

use webscope_core::{ContentNode, NodeKind, Payload, TruncationResult};

pub const CHARS_PER_TOKEN: usize = 4;

/// Tokens set aside for the omission indicator when it is enabled.
pub const INDICATOR_RESERVE_TOKENS: usize = 20;

/// `ceil(chars / 4)`; empty text is 0.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

/// Token estimate for one node, summing recursively through list children.
pub fn node_tokens(node: &ContentNode) -> usize {
    match node {
        ContentNode::List { items } => items.iter().map(node_tokens).sum(),
        other => estimate_tokens(&other.text()),
    }
}

/// Token estimate for a whole payload, either shape.
pub fn payload_tokens(payload: &Payload) -> usize {
    match payload {
        Payload::Structured(nodes) => nodes.iter().map(node_tokens).sum(),
        Payload::Text(t) => estimate_tokens(t),
    }
}

/// How plain text is cut down to the budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TextMode {
    /// Hard cut at the character budget, indicator appended.
    #[default]
    End,
    /// Keep a prefix and suffix of roughly equal size, indicator spliced
    /// between them.
    Middle,
    /// Keep whole paragraphs (blank-line boundaries) while they fit; never
    /// emits a partial paragraph.
    Smart,
}

#[derive(Debug, Clone, Default)]
pub struct TruncateOptions {
    /// Custom type-priority order, earlier = higher. Types not listed keep
    /// their default score.
    pub priority_order: Option<Vec<NodeKind>>,
    /// Append a synthetic node / trailing marker reporting what was omitted.
    pub add_indicator: bool,
    pub text_mode: TextMode,
}

impl TruncateOptions {
    pub fn new() -> Self {
        Self {
            priority_order: None,
            add_indicator: true,
            text_mode: TextMode::End,
        }
    }
}

/// Priority score: primary sort key for structured truncation.
///
/// Headings always outrank body text; within headings, h1 outranks h6. A
/// custom order lifts listed kinds above every default score.
fn priority(node: &ContentNode, custom: Option<&[NodeKind]>) -> u32 {
    let level = match node {
        ContentNode::Heading { level, .. } => *level as u32,
        _ => 0,
    };
    if let Some(order) = custom {
        if let Some(pos) = order.iter().position(|k| *k == node.kind()) {
            return 2_000u32
                .saturating_sub(pos as u32 * 10)
                .saturating_sub(level);
        }
    }
    match node.kind() {
        NodeKind::Heading => 1_000 - level,
        NodeKind::Paragraph => 800,
        NodeKind::List => 700,
        NodeKind::ListItem => 650,
        NodeKind::Blockquote => 600,
        NodeKind::Code => 550,
        NodeKind::Link => 400,
        NodeKind::Image => 300,
    }
}

fn indicator_node(omitted: usize) -> ContentNode {
    ContentNode::Paragraph {
        text: format!("[{omitted} items omitted to fit the token budget]"),
    }
}

fn truncate_structured(
    nodes: Vec<ContentNode>,
    max_tokens: usize,
    opts: &TruncateOptions,
) -> TruncationResult {
    let costs: Vec<usize> = nodes.iter().map(node_tokens).collect();
    let original_tokens: usize = costs.iter().sum();

    if original_tokens <= max_tokens {
        return TruncationResult {
            content: Payload::Structured(nodes),
            original_tokens,
            returned_tokens: original_tokens,
            truncated: false,
            items_omitted: 0,
        };
    }

    let reserve = if opts.add_indicator {
        INDICATOR_RESERVE_TOKENS
    } else {
        0
    };
    let budget = max_tokens.saturating_sub(reserve);

    let custom = opts.priority_order.as_deref();
    let mut order: Vec<usize> = (0..nodes.len()).collect();
    // Priority descending, original position ascending as the tie-break.
    order.sort_by(|&a, &b| {
        priority(&nodes[b], custom)
            .cmp(&priority(&nodes[a], custom))
            .then(a.cmp(&b))
    });

    let mut keep = vec![false; nodes.len()];
    let mut running = 0usize;
    for (rank, &i) in order.iter().enumerate() {
        // Never return an empty selection: the top-priority node survives
        // even when it alone overflows the budget.
        if rank == 0 || running + costs[i] <= budget {
            keep[i] = true;
            running += costs[i];
        }
    }

    // Re-emit survivors in original relative order; truncation must not
    // reorder content.
    let mut kept: Vec<ContentNode> = Vec::new();
    for (i, node) in nodes.into_iter().enumerate() {
        if keep[i] {
            kept.push(node);
        }
    }
    let items_omitted = keep.iter().filter(|k| !**k).count();

    let mut returned_tokens = running;
    if items_omitted > 0 && opts.add_indicator {
        let ind = indicator_node(items_omitted);
        returned_tokens += node_tokens(&ind);
        kept.push(ind);
    }

    TruncationResult {
        content: Payload::Structured(kept),
        original_tokens,
        returned_tokens,
        truncated: true,
        items_omitted,
    }
}

fn take_chars(s: &str, n: usize) -> &str {
    match s.char_indices().nth(n) {
        Some((i, _)) => &s[..i],
        None => s,
    }
}

fn skip_chars(s: &str, n: usize) -> &str {
    match s.char_indices().nth(n) {
        Some((i, _)) => &s[i..],
        None => "",
    }
}

/// Paragraph spans: runs of two or more newlines separate paragraphs.
pub fn split_paragraphs(text: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut rest = text;
    while let Some(pos) = rest.find("\n\n") {
        let (head, tail) = rest.split_at(pos);
        if !head.trim().is_empty() {
            out.push(head);
        }
        rest = tail.trim_start_matches('\n');
    }
    if !rest.trim().is_empty() {
        out.push(rest);
    }
    out
}

fn truncate_text(text: String, max_tokens: usize, opts: &TruncateOptions) -> TruncationResult {
    let original_tokens = estimate_tokens(&text);
    if original_tokens <= max_tokens {
        return TruncationResult {
            content: Payload::Text(text),
            original_tokens,
            returned_tokens: original_tokens,
            truncated: false,
            items_omitted: 0,
        };
    }

    let reserve = if opts.add_indicator {
        INDICATOR_RESERVE_TOKENS
    } else {
        0
    };
    let budget_chars = max_tokens.saturating_sub(reserve) * CHARS_PER_TOKEN;

    let (out, items_omitted) = match opts.text_mode {
        TextMode::End => {
            let mut out = take_chars(&text, budget_chars).trim_end().to_string();
            if opts.add_indicator {
                out.push_str("\n\n[... truncated]");
            }
            (out, 0)
        }
        TextMode::Middle => {
            let total = text.chars().count();
            let half = budget_chars / 2;
            let head = take_chars(&text, half).trim_end();
            let tail = skip_chars(&text, total.saturating_sub(half)).trim_start();
            let omitted_chars = total.saturating_sub(head.chars().count() + tail.chars().count());
            let splice = if opts.add_indicator {
                format!("\n\n[... {omitted_chars} chars omitted ...]\n\n")
            } else {
                "\n\n".to_string()
            };
            (format!("{head}{splice}{tail}"), 0)
        }
        TextMode::Smart => {
            let paras = split_paragraphs(&text);
            let mut out = String::new();
            let mut used = 0usize;
            let mut omitted = 0usize;
            let mut stopped = false;
            for p in &paras {
                let p = p.trim();
                let cost = p.chars().count() + if out.is_empty() { 0 } else { 2 };
                // Whole paragraphs only; stop at the first one that overflows.
                if stopped || used + cost > budget_chars {
                    stopped = true;
                    omitted += 1;
                    continue;
                }
                if !out.is_empty() {
                    out.push_str("\n\n");
                }
                out.push_str(p);
                used += cost;
            }
            if opts.add_indicator && omitted > 0 {
                out.push_str(&format!("\n\n[... {omitted} paragraphs omitted]"));
            }
            (out, omitted)
        }
    };

    let returned_tokens = estimate_tokens(&out);
    TruncationResult {
        content: Payload::Text(out),
        original_tokens,
        returned_tokens,
        truncated: true,
        items_omitted,
    }
}

/// Cut a payload down to `max_tokens`. One entry point; dispatches on shape.
pub fn truncate(payload: Payload, max_tokens: usize, opts: &TruncateOptions) -> TruncationResult {
    match payload {
        Payload::Structured(nodes) => truncate_structured(nodes, max_tokens, opts),
        Payload::Text(text) => truncate_text(text, max_tokens, opts),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn para(text: &str) -> ContentNode {
        ContentNode::Paragraph {
            text: text.to_string(),
        }
    }

    fn paras_of_tokens(count: usize, tokens_each: usize) -> Vec<ContentNode> {
        (0..count)
            .map(|i| {
                // First char distinguishes the paragraph; the rest pads to size.
                let mut t = format!("{i}");
                while t.chars().count() < tokens_each * CHARS_PER_TOKEN {
                    t.push('x');
                }
                para(&t)
            })
            .collect()
    }

    #[test]
    fn estimate_is_ceil_chars_over_four() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens(&"a".repeat(100)), 25);
        assert_eq!(estimate_tokens("a"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[test]
    fn payload_tokens_covers_both_shapes() {
        let text = Payload::Text("a".repeat(100));
        assert_eq!(payload_tokens(&text), 25);
        let structured = Payload::Structured(vec![para(&"b".repeat(40)), para(&"c".repeat(40))]);
        assert_eq!(payload_tokens(&structured), 20);
    }

    #[test]
    fn under_budget_is_identity() {
        let nodes = vec![para("short one"), para("short two")];
        let before = nodes.clone();
        let r = truncate(
            Payload::Structured(nodes),
            1_000,
            &TruncateOptions::new(),
        );
        assert!(!r.truncated);
        assert_eq!(r.items_omitted, 0);
        assert_eq!(r.original_tokens, r.returned_tokens);
        assert_eq!(r.content, Payload::Structured(before));
    }

    #[test]
    fn heading_survives_over_earlier_paragraphs() {
        let mut nodes = paras_of_tokens(4, 30);
        nodes.push(ContentNode::Heading {
            level: 1,
            text: "The Heading".to_string(),
        });
        let r = truncate(Payload::Structured(nodes), 40, &TruncateOptions::new());
        assert!(r.truncated);
        let Payload::Structured(kept) = &r.content else {
            panic!("expected structured content");
        };
        assert!(
            kept.iter()
                .any(|n| matches!(n, ContentNode::Heading { text, .. } if text == "The Heading")),
            "heading must always be preferred over body text; kept={kept:?}"
        );
    }

    #[test]
    fn survivors_keep_original_relative_order() {
        let mut nodes = vec![ContentNode::Heading {
            level: 2,
            text: "B heading".to_string(),
        }];
        nodes.insert(
            0,
            ContentNode::Heading {
                level: 1,
                text: "A heading".to_string(),
            },
        );
        nodes.extend(paras_of_tokens(5, 25));
        let r = truncate(Payload::Structured(nodes), 60, &TruncateOptions::new());
        let Payload::Structured(kept) = &r.content else {
            panic!("expected structured content");
        };
        // Both headings fit; they must come out in document order even though
        // selection walked them priority-first.
        let texts: Vec<String> = kept.iter().map(|n| n.text()).collect();
        let a = texts.iter().position(|t| t == "A heading").unwrap();
        let b = texts.iter().position(|t| t == "B heading").unwrap();
        assert!(a < b);
    }

    #[test]
    fn indicator_reports_omitted_count() {
        // Five ~20-token paragraphs, budget 20: one survives plus the marker.
        let nodes = paras_of_tokens(5, 20);
        let r = truncate(Payload::Structured(nodes), 20, &TruncateOptions::new());
        assert!(r.truncated);
        assert!(r.items_omitted >= 1);
        let Payload::Structured(kept) = &r.content else {
            panic!("expected structured content");
        };
        let originals = kept
            .iter()
            .filter(|n| !n.text().contains("omitted"))
            .count();
        let markers: Vec<&ContentNode> = kept
            .iter()
            .filter(|n| n.text().contains("omitted"))
            .collect();
        assert!(originals >= 1);
        assert_eq!(markers.len(), 1);
        assert!(markers[0].text().contains(&r.items_omitted.to_string()));
    }

    #[test]
    fn no_indicator_when_disabled() {
        let nodes = paras_of_tokens(5, 20);
        let opts = TruncateOptions {
            add_indicator: false,
            ..TruncateOptions::new()
        };
        let r = truncate(Payload::Structured(nodes), 20, &opts);
        let Payload::Structured(kept) = &r.content else {
            panic!("expected structured content");
        };
        assert!(kept.iter().all(|n| !n.text().contains("omitted")));
        assert!(r.items_omitted >= 1);
    }

    #[test]
    fn custom_priority_order_outranks_defaults() {
        let nodes = vec![
            ContentNode::Heading {
                level: 1,
                text: "head ".repeat(20),
            },
            ContentNode::Code {
                text: "let code = 1; ".repeat(10),
            },
        ];
        let opts = TruncateOptions {
            priority_order: Some(vec![NodeKind::Code]),
            ..TruncateOptions::new()
        };
        // Budget fits one node only (plus reserve); code must win now.
        let r = truncate(Payload::Structured(nodes), 35, &opts);
        let Payload::Structured(kept) = &r.content else {
            panic!("expected structured content");
        };
        assert!(matches!(kept[0], ContentNode::Code { .. }), "kept={kept:?}");
    }

    #[test]
    fn text_end_mode_cuts_and_marks() {
        let text = "z".repeat(2_000);
        let r = truncate(Payload::Text(text), 100, &TruncateOptions::new());
        assert!(r.truncated);
        let Payload::Text(out) = &r.content else {
            panic!("expected text content");
        };
        assert!(out.ends_with("[... truncated]"));
        assert!(r.returned_tokens <= 100);
    }

    #[test]
    fn text_middle_mode_keeps_both_ends() {
        let text = format!("STARTSTART{}ENDEND", "m".repeat(4_000));
        let opts = TruncateOptions {
            text_mode: TextMode::Middle,
            ..TruncateOptions::new()
        };
        let r = truncate(Payload::Text(text), 100, &opts);
        let Payload::Text(out) = &r.content else {
            panic!("expected text content");
        };
        assert!(out.starts_with("STARTSTART"));
        assert!(out.ends_with("ENDEND"));
        assert!(out.contains("chars omitted"));
    }

    #[test]
    fn text_smart_mode_never_splits_a_paragraph() {
        let paras: Vec<String> = (0..10).map(|i| format!("paragraph {i} {}", "w".repeat(100))).collect();
        let text = paras.join("\n\n");
        let opts = TruncateOptions {
            text_mode: TextMode::Smart,
            ..TruncateOptions::new()
        };
        let r = truncate(Payload::Text(text), 80, &opts);
        let Payload::Text(out) = &r.content else {
            panic!("expected text content");
        };
        // Every surviving paragraph is intact: full padding run present.
        for line in split_paragraphs(out) {
            if line.starts_with("paragraph") {
                assert!(line.contains(&"w".repeat(100)), "partial paragraph: {line}");
            }
        }
        assert!(r.items_omitted >= 1);
        assert!(out.contains("paragraphs omitted"));
    }

    #[test]
    fn split_paragraphs_handles_extra_blank_lines() {
        let got = split_paragraphs("one\n\n\n\ntwo\n\nthree");
        assert_eq!(got, vec!["one", "two", "three"]);
    }

    proptest! {
        #[test]
        fn budget_is_respected_within_indicator_allowance(
            sizes in prop::collection::vec(1usize..60, 1..30),
            budget in 1usize..400,
        ) {
            let nodes: Vec<ContentNode> = sizes
                .iter()
                .map(|s| para(&"p".repeat(s * CHARS_PER_TOKEN)))
                .collect();
            let n = nodes.len();
            let r = truncate(Payload::Structured(nodes), budget, &TruncateOptions::new());
            let max_cost = sizes.iter().copied().max().unwrap_or(0);
            // Best-effort bound: budget, plus the indicator allowance, plus the
            // one guaranteed-kept node when it alone overflows.
            let tolerance = INDICATOR_RESERVE_TOKENS + max_cost;
            prop_assert!(r.returned_tokens <= budget + tolerance);
            prop_assert!(r.items_omitted < n + 1);
            if !r.truncated {
                prop_assert_eq!(r.items_omitted, 0);
                prop_assert!(r.original_tokens <= budget);
            }
        }

        #[test]
        fn estimate_tokens_matches_ceil(chars in 0usize..10_000) {
            let s = "a".repeat(chars);
            prop_assert_eq!(estimate_tokens(&s), chars.div_ceil(4));
        }
    }
}
