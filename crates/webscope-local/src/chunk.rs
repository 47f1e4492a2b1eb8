//! Splitting content into scored-searchable units.

use webscope_core::{ContentChunk, ContentNode, NodeKind, Payload};

/// Chunks shorter than this (trimmed) carry too little signal for
/// embedding-based matching and would dilute results.
pub const MIN_CHUNK_CHARS: usize = 10;

fn push_chunk(out: &mut Vec<ContentChunk>, index: &mut usize, kind: NodeKind, text: &str) {
    let i = *index;
    *index += 1;
    let trimmed = text.trim();
    if trimmed.chars().count() < MIN_CHUNK_CHARS {
        return;
    }
    out.push(ContentChunk {
        text: trimmed.to_string(),
        original_index: i,
        kind,
        embedding: None,
    });
}

/// One chunk per node, and one per list child. Traversal order is preserved
/// in `original_index` (dropped nodes still consume an index, so surviving
/// indexes map back to source positions).
pub fn chunks_from_nodes(nodes: &[ContentNode]) -> Vec<ContentChunk> {
    let mut out = Vec::new();
    let mut index = 0usize;
    for node in nodes {
        match node {
            ContentNode::List { items } => {
                for item in items {
                    push_chunk(&mut out, &mut index, item.kind(), &item.text());
                }
            }
            other => push_chunk(&mut out, &mut index, other.kind(), &other.text()),
        }
    }
    out
}

/// Plain-text chunking: blank-line paragraph boundaries, same minimum length.
pub fn chunks_from_text(text: &str) -> Vec<ContentChunk> {
    let mut out = Vec::new();
    let mut index = 0usize;
    for para in crate::truncate::split_paragraphs(text) {
        push_chunk(&mut out, &mut index, NodeKind::Paragraph, para);
    }
    out
}

pub fn chunks_from_payload(payload: &Payload) -> Vec<ContentChunk> {
    match payload {
        Payload::Structured(nodes) => chunks_from_nodes(nodes),
        Payload::Text(text) => chunks_from_text(text),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_nodes_are_silently_dropped() {
        let nodes = vec![
            ContentNode::Heading {
                level: 1,
                text: "A substantial heading".into(),
            },
            ContentNode::Paragraph { text: "tiny".into() },
            ContentNode::Paragraph {
                text: "A paragraph long enough to keep around.".into(),
            },
        ];
        let chunks = chunks_from_nodes(&nodes);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].original_index, 0);
        assert_eq!(chunks[0].kind, NodeKind::Heading);
        // The dropped paragraph still consumed index 1.
        assert_eq!(chunks[1].original_index, 2);
    }

    #[test]
    fn list_children_chunk_individually() {
        let nodes = vec![ContentNode::List {
            items: vec![
                ContentNode::ListItem {
                    text: "first list entry with enough text".into(),
                },
                ContentNode::ListItem { text: "short".into() },
                ContentNode::ListItem {
                    text: "third list entry with enough text".into(),
                },
            ],
        }];
        let chunks = chunks_from_nodes(&nodes);
        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|c| c.kind == NodeKind::ListItem));
        assert_eq!(chunks[1].original_index, 2);
    }

    #[test]
    fn text_chunking_splits_on_blank_lines() {
        let text = "First paragraph of text.\n\nshort\n\n\nThird paragraph of text here.";
        let chunks = chunks_from_text(text);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].text, "First paragraph of text.");
        assert_eq!(chunks[1].text, "Third paragraph of text here.");
    }

    #[test]
    fn chunks_are_trimmed_and_nonempty() {
        let chunks = chunks_from_text("   padded paragraph with spaces   \n\n   \n\n");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "padded paragraph with spaces");
    }
}
