//! Keeps hover listeners on cards that appear after first paint.

use super::dom::{Document, Listener, NodeId};
use crate::config::Cards;

/// Set on a card once its hover listeners are attached.
pub const ARMED_MARKER: &str = "data-trailer-preview";

const CARD_CLASSES: [&str; 3] = ["card", "itemTile", "listItem"];
const CARD_TYPES: [&str; 3] = ["Card", "Movie", "Series"];

pub struct DomWatcher {
    item_types: Vec<String>,
}

impl DomWatcher {
    pub fn new(cards: &Cards) -> Self {
        Self {
            item_types: cards.item_types.clone(),
        }
    }

    pub fn is_card(&self, doc: &Document, node: NodeId) -> bool {
        let shaped = CARD_CLASSES.iter().any(|c| doc.has_class(node, c))
            || doc
                .attr(node, "data-type")
                .is_some_and(|t| CARD_TYPES.contains(&t));
        if !shaped {
            return false;
        }
        if self.item_types.is_empty() {
            return true;
        }
        doc.attr(node, "data-type")
            .is_some_and(|t| self.item_types.iter().any(|it| it.eq_ignore_ascii_case(t)))
    }

    /// Arms every card under `body`. Run once at startup.
    pub fn scan_all(&self, doc: &mut Document) -> usize {
        let body = doc.body();
        self.scan(doc, &[body])
    }

    /// Arms unmarked cards inside the given inserted subtrees. Idempotent.
    pub fn scan(&self, doc: &mut Document, roots: &[NodeId]) -> usize {
        let fresh: Vec<NodeId> = roots
            .iter()
            .flat_map(|r| doc.descendants(*r))
            .filter(|n| !doc.has_attr(*n, ARMED_MARKER) && self.is_card(doc, *n))
            .collect();
        let mut armed = 0;
        for card in fresh {
            // a card reachable from two overlapping roots is only armed once
            if doc.has_attr(card, ARMED_MARKER) || card_item_id(doc, card).is_none() {
                continue;
            }
            doc.set_attr(card, ARMED_MARKER, "true");
            doc.add_listener(card, Listener::CardEnter);
            doc.add_listener(card, Listener::CardLeave);
            armed += 1;
        }
        armed
    }
}

/// `data-id`, then `data-itemid`, then the first descendant carrying `data-id`.
pub fn card_item_id(doc: &Document, card: NodeId) -> Option<String> {
    let direct = doc
        .attr(card, "data-id")
        .or_else(|| doc.attr(card, "data-itemid"))
        .filter(|s| !s.is_empty());
    if let Some(id) = direct {
        return Some(id.to_string());
    }
    doc.find_descendant(card, |d, n| d.attr(n, "data-id").is_some_and(|s| !s.is_empty()))
        .and_then(|n| doc.attr(n, "data-id"))
        .map(str::to_string)
}

pub fn card_title(doc: &Document, card: NodeId) -> String {
    doc.find_descendant(card, |d, n| d.has_class(n, "cardText"))
        .map(|n| doc.text_content(n).trim().to_string())
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| "Unknown".to_string())
}
