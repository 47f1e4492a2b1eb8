//! HTML → structured content.
//!
//! This is intentionally "good enough" and deterministic, not a full
//! readability engine. Callers bound output themselves (token budgets live in
//! `truncate`).

use ego_tree::NodeId;
use html_scraper::{ElementRef, Html, Selector};
use std::collections::HashSet;
use std::io::Cursor;
use webscope_core::ContentNode;

/// Convert HTML to readable plain text.
pub fn html_to_text(html: &str, width: usize) -> String {
    // html2text expects bytes; Cursor avoids allocating a second large buffer.
    html2text::from_read(Cursor::new(html.as_bytes()), width).unwrap_or_else(|_| html.to_string())
}

fn norm_ws(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Elements whose subtree never contributes visible text.
const INVISIBLE_TAGS: &[&str] = &["script", "style", "noscript", "template", "head", "svg"];

fn is_invisible_tag(tag: &str) -> bool {
    INVISIBLE_TAGS.contains(&tag)
}

/// `<title>` text, whitespace-normalized.
pub fn page_title(html: &str) -> Option<String> {
    let doc = Html::parse_document(html);
    let sel = Selector::parse("title").ok()?;
    let el = doc.select(&sel).next()?;
    let t = norm_ws(&el.text().collect::<Vec<_>>().join(" "));
    (!t.is_empty()).then_some(t)
}

fn collect_visible(el: ElementRef<'_>, out: &mut String) {
    let tag = el.value().name();
    if is_invisible_tag(tag) {
        return;
    }
    if tag == "table" {
        linearize_table(el, out);
        return;
    }
    for child in el.children() {
        match child.value() {
            html_scraper::Node::Text(t) => {
                let t = t.trim();
                if !t.is_empty() {
                    if !out.is_empty() && !out.ends_with(char::is_whitespace) {
                        out.push(' ');
                    }
                    out.push_str(t);
                }
            }
            html_scraper::Node::Element(_) => {
                if let Some(c) = ElementRef::wrap(child) {
                    collect_visible(c, out);
                }
            }
            _ => {}
        }
    }
    // Block boundaries become blank lines so paragraph splitting sees one
    // span per block; a bare <br> is a soft break within its block.
    if tag == "br" {
        if !out.ends_with('\n') {
            out.push('\n');
        }
    } else if matches!(
        tag,
        "p" | "div" | "li" | "tr" | "h1" | "h2" | "h3" | "h4" | "h5" | "h6" | "blockquote"
    ) && !out.is_empty()
    {
        while !out.ends_with("\n\n") {
            out.push('\n');
        }
    }
}

fn linearize_table(table: ElementRef<'_>, out: &mut String) {
    let Ok(row_sel) = Selector::parse("tr") else {
        return;
    };
    let Ok(cell_sel) = Selector::parse("td, th") else {
        return;
    };
    for row in table.select(&row_sel) {
        let cells: Vec<String> = row
            .select(&cell_sel)
            .map(|c| norm_ws(&c.text().collect::<Vec<_>>().join(" ")))
            .filter(|t| !t.is_empty())
            .collect();
        if !cells.is_empty() {
            if !out.is_empty() && !out.ends_with('\n') {
                out.push('\n');
            }
            out.push_str(&cells.join(" | "));
            out.push('\n');
        }
    }
    // The table as a whole is one block.
    if !out.is_empty() && !out.ends_with("\n\n") {
        out.push('\n');
    }
}

/// Visible page text: script/style/noscript/head stripped, tables linearized
/// one row per line with " | " between cells.
pub fn visible_text(html: &str) -> String {
    let doc = Html::parse_document(html);
    let mut out = String::new();
    collect_visible(doc.root_element(), &mut out);
    out.trim().to_string()
}

#[derive(Debug, Clone)]
pub struct LinkCandidate {
    pub url: String,
    pub text: String,
}

/// Extract (deduped) absolute links from HTML with anchor text.
///
/// - Resolves relative links against `base_url` when provided.
/// - Drops fragments.
/// - Skips javascript:/mailto:-like URLs.
/// - Returns at most `max_links`.
pub fn links(html: &str, base_url: Option<&str>, max_links: usize) -> Vec<LinkCandidate> {
    let max_links = max_links.min(500);
    if max_links == 0 {
        return Vec::new();
    }

    let base = base_url.and_then(|u| url::Url::parse(u).ok());
    let doc = Html::parse_document(html);
    let sel = match Selector::parse("a[href]") {
        Ok(s) => s,
        Err(_) => return Vec::new(),
    };

    let mut seen = HashSet::<String>::new();
    let mut out: Vec<LinkCandidate> = Vec::new();
    for el in doc.select(&sel) {
        if out.len() >= max_links {
            break;
        }
        let href = match el.value().attr("href") {
            Some(h) => h.trim(),
            None => continue,
        };
        if href.is_empty() {
            continue;
        }
        let href_lc = href.to_ascii_lowercase();
        if href_lc.starts_with("javascript:") || href_lc.starts_with("mailto:") {
            continue;
        }

        let abs = if let Ok(u) = url::Url::parse(href) {
            u
        } else if let Some(b) = &base {
            match b.join(href) {
                Ok(u) => u,
                Err(_) => continue,
            }
        } else {
            continue;
        };

        let mut u = abs;
        u.set_fragment(None);
        let u = u.to_string();
        if !seen.insert(u.clone()) {
            continue;
        }
        let text = norm_ws(&el.text().collect::<Vec<_>>().join(" "));
        out.push(LinkCandidate { url: u, text });
    }
    out
}

#[derive(Debug, Clone, Default)]
pub struct ExtractOptions {
    /// CSS selectors naming containers to extract from; empty means the whole
    /// document.
    pub selectors: Vec<String>,
    /// CSS selectors naming subtrees to drop.
    pub exclude_selectors: Vec<String>,
    /// Emit image nodes.
    pub include_media: bool,
    /// Upper bound on emitted top-level nodes.
    pub max_nodes: usize,
}

impl ExtractOptions {
    pub fn new() -> Self {
        Self {
            selectors: Vec::new(),
            exclude_selectors: Vec::new(),
            include_media: true,
            max_nodes: 2_000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Extracted {
    pub title: Option<String>,
    pub nodes: Vec<ContentNode>,
    pub links: Vec<LinkCandidate>,
    /// Total chars across node texts.
    pub text_chars: usize,
    pub warnings: Vec<&'static str>,
}

fn class_or_id_lc(el: &ElementRef) -> String {
    let mut out = String::new();
    if let Some(c) = el.value().attr("class") {
        out.push_str(c);
        out.push(' ');
    }
    if let Some(i) = el.value().attr("id") {
        out.push_str(i);
    }
    out.to_ascii_lowercase()
}

fn is_generic_boilerplate_container(el: &ElementRef) -> bool {
    // Keep this generic: avoid site/host heuristics; only structural UI words.
    let tag = el.value().name();
    if matches!(tag, "nav" | "footer" | "aside") {
        return true;
    }
    let s = class_or_id_lc(el);
    if s.is_empty() {
        return false;
    }
    for bad in [
        "navbar",
        "menu",
        "sidebar",
        "footer",
        "banner",
        "cookie",
        "consent",
        "ads",
        "advert",
        "promo",
        "subscribe",
        "newsletter",
    ] {
        if s.contains(bad) {
            return true;
        }
    }
    false
}

fn subtree_ids(el: ElementRef<'_>, out: &mut HashSet<NodeId>) {
    for d in el.descendants() {
        out.insert(d.id());
    }
}

fn node_set_for_selectors(doc: &Html, selectors: &[String]) -> HashSet<NodeId> {
    let mut out = HashSet::new();
    for s in selectors {
        let Ok(sel) = Selector::parse(s) else {
            continue;
        };
        for el in doc.select(&sel) {
            subtree_ids(el, &mut out);
        }
    }
    out
}

fn has_boilerplate_ancestor(el: &ElementRef) -> bool {
    let mut cur = el.parent();
    while let Some(n) = cur {
        if let Some(p) = ElementRef::wrap(n) {
            if is_generic_boilerplate_container(&p) {
                return true;
            }
        }
        cur = n.parent();
    }
    false
}

fn has_ancestor_tag(el: &ElementRef, tags: &[&str]) -> bool {
    let mut cur = el.parent();
    while let Some(n) = cur {
        if let Some(p) = ElementRef::wrap(n) {
            if tags.contains(&p.value().name()) {
                return true;
            }
        }
        cur = n.parent();
    }
    false
}

fn heading_level(tag: &str) -> Option<u8> {
    match tag {
        "h1" => Some(1),
        "h2" => Some(2),
        "h3" => Some(3),
        "h4" => Some(4),
        "h5" => Some(5),
        "h6" => Some(6),
        _ => None,
    }
}

fn list_items(el: ElementRef<'_>) -> Vec<ContentNode> {
    // Direct li children only; nested lists surface through their parent item's text.
    el.children()
        .filter_map(ElementRef::wrap)
        .filter(|c| c.value().name() == "li")
        .map(|li| {
            let text = norm_ws(&li.text().collect::<Vec<_>>().join(" "));
            ContentNode::ListItem { text }
        })
        .filter(|n| !n.text().is_empty())
        .collect()
}

/// Extract an ordered forest of content nodes, plus links and a title.
///
/// Pure function of (markup, base URL, options); the escalation engine's
/// output feeds straight into this.
pub fn extract(html: &str, base_url: Option<&str>, opts: &ExtractOptions) -> Extracted {
    let doc = Html::parse_document(html);
    let title = {
        let sel = Selector::parse("title").ok();
        sel.and_then(|s| {
            doc.select(&s)
                .next()
                .map(|el| norm_ws(&el.text().collect::<Vec<_>>().join(" ")))
        })
        .filter(|t| !t.is_empty())
    };

    let included = if opts.selectors.is_empty() {
        None
    } else {
        Some(node_set_for_selectors(&doc, &opts.selectors))
    };
    let excluded = node_set_for_selectors(&doc, &opts.exclude_selectors);

    let max_nodes = opts.max_nodes.clamp(1, 20_000);
    let mut nodes: Vec<ContentNode> = Vec::new();
    let mut warnings: Vec<&'static str> = Vec::new();

    let sel = Selector::parse("h1, h2, h3, h4, h5, h6, p, ul, ol, blockquote, pre, img").ok();
    if let Some(sel) = sel {
        for el in doc.select(&sel) {
            if nodes.len() >= max_nodes {
                warnings.push("node_limit_reached");
                break;
            }
            if excluded.contains(&el.id()) {
                continue;
            }
            if let Some(inc) = &included {
                if !inc.contains(&el.id()) {
                    continue;
                }
            }
            if has_boilerplate_ancestor(&el) || is_generic_boilerplate_container(&el) {
                continue;
            }
            // Nested block elements are covered by their container.
            if has_ancestor_tag(&el, &["blockquote", "li", "pre"]) {
                continue;
            }
            let tag = el.value().name();
            if let Some(level) = heading_level(tag) {
                let text = norm_ws(&el.text().collect::<Vec<_>>().join(" "));
                if !text.is_empty() {
                    nodes.push(ContentNode::Heading {
                        level: level.clamp(1, 6),
                        text,
                    });
                }
                continue;
            }
            match tag {
                "p" => {
                    let text = norm_ws(&el.text().collect::<Vec<_>>().join(" "));
                    if !text.is_empty() {
                        nodes.push(ContentNode::Paragraph { text });
                    }
                }
                "ul" | "ol" => {
                    let items = list_items(el);
                    if !items.is_empty() {
                        nodes.push(ContentNode::List { items });
                    }
                }
                "blockquote" => {
                    let text = norm_ws(&el.text().collect::<Vec<_>>().join(" "));
                    if !text.is_empty() {
                        nodes.push(ContentNode::Blockquote { text });
                    }
                }
                "pre" => {
                    let text = el.text().collect::<Vec<_>>().join("");
                    let text = text.trim_matches('\n').to_string();
                    if !text.trim().is_empty() {
                        nodes.push(ContentNode::Code { text });
                    }
                }
                "img" => {
                    if !opts.include_media {
                        continue;
                    }
                    let Some(src) = el.value().attr("src").map(str::trim).filter(|s| !s.is_empty())
                    else {
                        continue;
                    };
                    let src = match base_url.and_then(|b| url::Url::parse(b).ok()) {
                        Some(b) => b.join(src).map(|u| u.to_string()).unwrap_or_default(),
                        None => src.to_string(),
                    };
                    if src.is_empty() {
                        continue;
                    }
                    let alt = el
                        .value()
                        .attr("alt")
                        .map(norm_ws)
                        .filter(|a| !a.is_empty());
                    nodes.push(ContentNode::Image { src, alt });
                }
                _ => {}
            }
        }
    }

    if nodes.is_empty() {
        warnings.push("empty_extraction");
    }

    let text_chars = nodes.iter().map(|n| n.text().chars().count()).sum();
    let links = links(html, base_url, 200);

    Extracted {
        title,
        nodes,
        links,
        text_chars,
        warnings,
    }
}
