//! In-memory document tree the preview engine renders into.
//!
//! Nodes live in an arena and are addressed by copyable [`NodeId`]s. Removing a
//! node frees its whole subtree, listeners included, so a detached card can
//! never fire again. Insertions under an attached parent are recorded and
//! drained by the watcher, mirroring a subtree `MutationObserver`.

use anyhow::{bail, Result};
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use tokio::sync::watch;

/// Slot index plus the slot's generation; an id outlives its node but never
/// aliases whatever later reuses the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId {
    index: usize,
    generation: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DomEvent {
    PointerEnter,
    PointerLeave,
    Click,
    TimeUpdate,
}

/// Behaviour bound to a node. Events do not bubble: only the target's own
/// listeners run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Listener {
    CardEnter,
    CardLeave,
    /// Scrim: closes the preview it belongs to.
    Dismiss,
    CloseButton,
    ToggleMute { media: NodeId },
    Progress { bar: NodeId },
}

impl Listener {
    pub fn event(&self) -> DomEvent {
        match self {
            Self::CardEnter => DomEvent::PointerEnter,
            Self::CardLeave => DomEvent::PointerLeave,
            Self::Dismiss | Self::CloseButton | Self::ToggleMute { .. } => DomEvent::Click,
            Self::Progress { .. } => DomEvent::TimeUpdate,
        }
    }
}

/// Playback state of a `<video>` element.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaState {
    pub playing: bool,
    pub muted: bool,
    pub volume: f64,
    pub looped: bool,
    pub current_time: f64,
    pub duration: f64,
}

impl Default for MediaState {
    fn default() -> Self {
        Self {
            playing: false,
            muted: true,
            volume: 1.0,
            looped: false,
            current_time: 0.0,
            duration: 0.0,
        }
    }
}

#[derive(Debug)]
struct Node {
    tag: String,
    attrs: BTreeMap<String, String>,
    style: BTreeMap<String, String>,
    text: String,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    listeners: Vec<Listener>,
    media: Option<MediaState>,
}

impl Node {
    fn new(tag: &str) -> Self {
        Self {
            tag: tag.to_ascii_lowercase(),
            attrs: BTreeMap::new(),
            style: BTreeMap::new(),
            text: String::new(),
            parent: None,
            children: Vec::new(),
            listeners: Vec::new(),
            media: None,
        }
    }
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    node: Option<Node>,
}

#[derive(Debug)]
pub struct Document {
    nodes: Vec<Slot>,
    free: Vec<usize>,
    root: NodeId,
    body: NodeId,
    inserted: Vec<NodeId>,
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

impl Document {
    pub fn new() -> Self {
        let mut html = Node::new("html");
        let mut body = Node::new("body");
        let root = NodeId { index: 0, generation: 0 };
        let body_id = NodeId { index: 1, generation: 0 };
        body.parent = Some(root);
        html.children.push(body_id);
        Self {
            nodes: vec![
                Slot {
                    generation: 0,
                    node: Some(html),
                },
                Slot {
                    generation: 0,
                    node: Some(body),
                },
            ],
            free: Vec::new(),
            root,
            body: body_id,
            inserted: Vec::new(),
        }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn body(&self) -> NodeId {
        self.body
    }

    fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes
            .get(id.index)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.node.as_ref())
    }

    fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes
            .get_mut(id.index)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.node.as_mut())
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.node(id).is_some()
    }

    /// Reuses a freed slot when one exists.
    pub fn create_element(&mut self, tag: &str) -> NodeId {
        if let Some(index) = self.free.pop() {
            if let Some(slot) = self.nodes.get_mut(index) {
                slot.node = Some(Node::new(tag));
                return NodeId {
                    index,
                    generation: slot.generation,
                };
            }
        }
        let index = self.nodes.len();
        self.nodes.push(Slot {
            generation: 0,
            node: Some(Node::new(tag)),
        });
        NodeId { index, generation: 0 }
    }

    pub fn append_child(&mut self, parent: NodeId, child: NodeId) -> Result<()> {
        if !self.contains(parent) || !self.contains(child) {
            bail!("append_child on a freed node");
        }
        if self.node(child).and_then(|n| n.parent).is_some() || child == self.root {
            bail!("node {child:?} already has a parent");
        }
        if self.ancestors(parent).contains(&child) || parent == child {
            bail!("append_child would create a cycle");
        }
        if let Some(n) = self.node_mut(child) {
            n.parent = Some(parent);
        }
        if let Some(p) = self.node_mut(parent) {
            p.children.push(child);
        }
        if self.is_attached(parent) {
            self.inserted.push(child);
        }
        Ok(())
    }

    /// Detaches `id` and frees it with its whole subtree.
    pub fn remove(&mut self, id: NodeId) -> bool {
        if id == self.root || id == self.body || !self.contains(id) {
            return false;
        }
        if let Some(parent) = self.node(id).and_then(|n| n.parent) {
            if let Some(p) = self.node_mut(parent) {
                p.children.retain(|c| *c != id);
            }
        }
        for n in self.descendants(id) {
            if let Some(slot) = self.nodes.get_mut(n.index) {
                slot.node = None;
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(n.index);
            }
        }
        true
    }

    fn ancestors(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut cur = self.node(id).and_then(|n| n.parent);
        while let Some(p) = cur {
            out.push(p);
            cur = self.node(p).and_then(|n| n.parent);
        }
        out
    }

    pub fn is_attached(&self, id: NodeId) -> bool {
        id == self.root || (self.contains(id) && self.ancestors(id).contains(&self.root))
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).and_then(|n| n.parent)
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        self.node(id).map(|n| n.children.as_slice()).unwrap_or(&[])
    }

    /// Preorder walk including `id` itself.
    pub fn descendants(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(n) = stack.pop() {
            let Some(node) = self.node(n) else { continue };
            out.push(n);
            stack.extend(node.children.iter().rev().copied());
        }
        out
    }

    pub fn find_descendant(&self, id: NodeId, pred: impl Fn(&Self, NodeId) -> bool) -> Option<NodeId> {
        self.descendants(id)
            .into_iter()
            .skip(1)
            .find(|n| pred(self, *n))
    }

    pub fn tag(&self, id: NodeId) -> Option<&str> {
        self.node(id).map(|n| n.tag.as_str())
    }

    pub fn attr(&self, id: NodeId, name: &str) -> Option<&str> {
        self.node(id)
            .and_then(|n| n.attrs.get(name))
            .map(String::as_str)
    }

    pub fn has_attr(&self, id: NodeId, name: &str) -> bool {
        self.attr(id, name).is_some()
    }

    pub fn set_attr(&mut self, id: NodeId, name: &str, value: impl Into<String>) {
        if let Some(n) = self.node_mut(id) {
            n.attrs.insert(name.to_string(), value.into());
        }
    }

    pub fn has_class(&self, id: NodeId, class: &str) -> bool {
        self.attr(id, "class")
            .is_some_and(|c| c.split_whitespace().any(|t| t == class))
    }

    pub fn style(&self, id: NodeId, prop: &str) -> Option<&str> {
        self.node(id)
            .and_then(|n| n.style.get(prop))
            .map(String::as_str)
    }

    pub fn set_style(&mut self, id: NodeId, prop: &str, value: impl Into<String>) {
        if let Some(n) = self.node_mut(id) {
            n.style.insert(prop.to_string(), value.into());
        }
    }

    pub fn set_text(&mut self, id: NodeId, text: impl Into<String>) {
        if let Some(n) = self.node_mut(id) {
            n.text = text.into();
        }
    }

    pub fn text_content(&self, id: NodeId) -> String {
        self.descendants(id)
            .into_iter()
            .filter_map(|n| self.node(n).map(|node| node.text.as_str()))
            .collect()
    }

    pub fn add_listener(&mut self, id: NodeId, listener: Listener) {
        if let Some(n) = self.node_mut(id) {
            n.listeners.push(listener);
        }
    }

    pub fn listeners(&self, id: NodeId) -> &[Listener] {
        self.node(id).map(|n| n.listeners.as_slice()).unwrap_or(&[])
    }

    pub fn media(&self, id: NodeId) -> Option<&MediaState> {
        self.node(id).and_then(|n| n.media.as_ref())
    }

    pub fn media_mut(&mut self, id: NodeId) -> Option<&mut MediaState> {
        self.node_mut(id).and_then(|n| n.media.as_mut())
    }

    pub fn set_media(&mut self, id: NodeId, media: MediaState) {
        if let Some(n) = self.node_mut(id) {
            n.media = Some(media);
        }
    }

    /// Attached nodes under `body` matching `pred`, in document order.
    pub fn query(&self, pred: impl Fn(&Self, NodeId) -> bool) -> Vec<NodeId> {
        self.descendants(self.body)
            .into_iter()
            .filter(|n| pred(self, *n))
            .collect()
    }

    /// Attached media elements that are currently playing.
    pub fn playing_media(&self) -> Vec<NodeId> {
        self.query(|d, n| d.media(n).is_some_and(|m| m.playing))
    }

    pub fn has_pending_insertions(&self) -> bool {
        !self.inserted.is_empty()
    }

    /// Roots of the subtrees inserted since the last call, still attached.
    pub fn take_inserted(&mut self) -> Vec<NodeId> {
        let batch = std::mem::take(&mut self.inserted);
        batch.into_iter().filter(|n| self.is_attached(*n)).collect()
    }
}

// ------------------------- Shared handle -------------------------

/// The page's document, shared between the host and the engine.
///
/// Every `update` that inserts nodes bumps a generation counter, which the
/// engine watches to re-arm listeners. Locks are never held across awaits.
#[derive(Clone)]
pub struct SharedDocument {
    inner: Arc<Mutex<Document>>,
    generation: Arc<watch::Sender<u64>>,
}

impl Default for SharedDocument {
    fn default() -> Self {
        Self::new(Document::new())
    }
}

impl SharedDocument {
    pub fn new(doc: Document) -> Self {
        let (tx, _rx) = watch::channel(0);
        Self {
            inner: Arc::new(Mutex::new(doc)),
            generation: Arc::new(tx),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Document> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn read<R>(&self, f: impl FnOnce(&Document) -> R) -> R {
        f(&self.lock())
    }

    /// One mutation burst: observers are notified once, after `f` returns.
    pub fn update<R>(&self, f: impl FnOnce(&mut Document) -> R) -> R {
        let (out, inserted) = {
            let mut doc = self.lock();
            let out = f(&mut doc);
            (out, doc.has_pending_insertions())
        };
        if inserted {
            self.generation.send_modify(|g| *g = g.wrapping_add(1));
        }
        out
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.generation.subscribe()
    }
}
