//! Hover-triggered preview engine.
//!
//! One task owns every piece of session state and reacts to four sources:
//! commands from [`EngineHandle`], lookup completions, document mutations and
//! the earliest pending deadline (hover delay, fade-in tick, auto-close,
//! fade-out removal). Nothing else mutates that state, so no locking beyond
//! the shared document is needed.

pub mod dom;
pub mod overlay;
pub mod platform;
pub mod watcher;

use anyhow::Result;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, oneshot},
    time::{sleep_until, Instant},
};
use tracing::debug;

use crate::config::ConfigSnapshot;
use crate::descriptor::TrailerDescriptor;
use crate::lookup::TrailerLookup;
use dom::{DomEvent, Listener, NodeId, SharedDocument};
use overlay::{OverlayHandle, OverlayRenderer};
use platform::ClientEnvironment;
use watcher::DomWatcher;

/// One paint tick: the gap between inserting an overlay and starting its fade.
const FRAME: Duration = Duration::from_millis(16);

macro_rules! dlog {
    ($engine:expr, $($arg:tt)*) => {
        if $engine.config.debug {
            debug!($($arg)*);
        }
    };
}

#[derive(Debug)]
enum Command {
    HoverEnter { item_id: String, title: String },
    HoverLeave { item_id: String },
    RequestClose,
    KeyDown(String),
    Dispatch { node: NodeId, event: DomEvent },
    State(oneshot::Sender<EngineState>),
}

/// Point-in-time view of the engine, for diagnostics and tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineState {
    pub active_count: usize,
    /// Item ids with an open session, oldest first.
    pub open: Vec<String>,
    pub pending_hover: Option<String>,
    pub resolving: Option<String>,
    /// Overlays fading out, not yet removed.
    pub closing: usize,
    pub cached: usize,
}

/// Cheap, cloneable entry point into a running engine. A gated-off engine
/// hands out an inert handle on which every call is a no-op.
#[derive(Clone, Debug, Default)]
pub struct EngineHandle {
    tx: Option<mpsc::UnboundedSender<Command>>,
}

impl EngineHandle {
    pub fn inert() -> Self {
        Self { tx: None }
    }

    pub fn is_active(&self) -> bool {
        self.tx.as_ref().is_some_and(|tx| !tx.is_closed())
    }

    fn send(&self, cmd: Command) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(cmd);
        }
    }

    pub fn hover_enter(&self, item_id: impl Into<String>, title: impl Into<String>) {
        self.send(Command::HoverEnter {
            item_id: item_id.into(),
            title: title.into(),
        });
    }

    pub fn hover_leave(&self, item_id: impl Into<String>) {
        self.send(Command::HoverLeave {
            item_id: item_id.into(),
        });
    }

    pub fn request_close(&self) {
        self.send(Command::RequestClose);
    }

    /// Global key handler; `Escape` closes whatever is open.
    pub fn key_down(&self, key: impl Into<String>) {
        self.send(Command::KeyDown(key.into()));
    }

    /// Delivers a DOM event to the listeners bound on `node`.
    pub fn dispatch(&self, node: NodeId, event: DomEvent) {
        self.send(Command::Dispatch { node, event });
    }

    /// `None` when the engine is inert or gone.
    pub async fn state(&self) -> Option<EngineState> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::State(tx));
        rx.await.ok()
    }
}

/// Starts the engine for one page. Returns an inert handle when previews are
/// disabled or the platform is gated off. Must be called inside a tokio runtime.
pub fn initialize<L: TrailerLookup>(
    config: ConfigSnapshot,
    env: ClientEnvironment,
    doc: SharedDocument,
    lookup: L,
) -> EngineHandle {
    let config = config.sanitized();
    if let Some(reason) = platform::gate(&config, &env) {
        if config.debug {
            debug!("trailer preview inert: {reason}");
        }
        return EngineHandle::inert();
    }
    let (tx, rx) = mpsc::unbounded_channel();
    let (engine, results) = Engine::new(config, env, doc, Arc::new(lookup));
    tokio::spawn(engine.run(rx, results));
    EngineHandle { tx: Some(tx) }
}

// ------------------------- Engine state -------------------------

struct HoverTimer {
    item_id: String,
    title: String,
    fire_at: Instant,
}

/// The item currently being resolved; lookups for anything else are stale.
struct Intent {
    seq: u64,
    item_id: String,
    title: String,
}

struct Resolved {
    seq: u64,
    item_id: String,
    result: Result<TrailerDescriptor>,
}

struct PreviewSession {
    item_id: String,
    overlay: OverlayHandle,
    fade_in_at: Option<Instant>,
    close_at: Option<Instant>,
}

struct Closing {
    overlay: OverlayHandle,
    remove_at: Instant,
}

struct Engine<L> {
    config: ConfigSnapshot,
    env: ClientEnvironment,
    doc: SharedDocument,
    lookup: Arc<L>,
    renderer: OverlayRenderer,
    watcher: DomWatcher,
    cache: HashMap<String, TrailerDescriptor>,
    /// Item id → seq of the lookup already running for it.
    in_flight: HashMap<String, u64>,
    hover: Option<HoverTimer>,
    intent: Option<Intent>,
    sessions: Vec<PreviewSession>,
    closing: Vec<Closing>,
    seq: u64,
    results_tx: mpsc::UnboundedSender<Resolved>,
}

impl<L: TrailerLookup> Engine<L> {
    fn new(
        config: ConfigSnapshot,
        env: ClientEnvironment,
        doc: SharedDocument,
        lookup: Arc<L>,
    ) -> (Self, mpsc::UnboundedReceiver<Resolved>) {
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        let engine = Self {
            renderer: OverlayRenderer::new(config.clone()),
            watcher: DomWatcher::new(&config.cards),
            config,
            env,
            doc,
            lookup,
            cache: HashMap::new(),
            in_flight: HashMap::new(),
            hover: None,
            intent: None,
            sessions: Vec::new(),
            closing: Vec::new(),
            seq: 0,
            results_tx,
        };
        (engine, results_rx)
    }

    async fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<Command>,
        mut results: mpsc::UnboundedReceiver<Resolved>,
    ) {
        let mut mutations = self.doc.subscribe();
        let armed = self.doc.update(|d| {
            d.take_inserted();
            self.watcher.scan_all(d)
        });
        dlog!(self, "trailer preview engine started, {armed} cards armed");

        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(cmd) => self.handle(cmd),
                    None => break,
                },
                Some(resolved) = results.recv() => self.on_resolved(resolved),
                Ok(()) = mutations.changed() => self.rescan(),
                () = sleep_until_opt(deadline) => self.on_deadline(Instant::now()),
            }
        }

        self.shutdown();
    }

    fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::HoverEnter { item_id, title } => self.hover_enter(item_id, title),
            Command::HoverLeave { item_id } => self.hover_leave(&item_id),
            Command::RequestClose => self.request_close(),
            Command::KeyDown(key) => {
                if key == "Escape" && !self.sessions.is_empty() {
                    self.request_close();
                }
            }
            Command::Dispatch { node, event } => self.dispatch(node, event),
            Command::State(reply) => {
                let _ = reply.send(self.state());
            }
        }
    }

    fn state(&self) -> EngineState {
        EngineState {
            active_count: self.active_count(),
            open: self.sessions.iter().map(|s| s.item_id.clone()).collect(),
            pending_hover: self.hover.as_ref().map(|h| h.item_id.clone()),
            resolving: self.intent.as_ref().map(|i| i.item_id.clone()),
            closing: self.closing.len(),
            cached: self.cache.len(),
        }
    }

    fn active_count(&self) -> usize {
        self.sessions.len()
    }

    fn saturated(&self) -> bool {
        self.active_count() >= self.config.max_concurrent()
    }

    // ------------------------- Hover -------------------------

    fn hover_enter(&mut self, item_id: String, title: String) {
        if self.saturated() {
            dlog!(self, "max concurrent previews reached, ignoring hover on {item_id}");
            return;
        }
        if let Some(intent) = &self.intent {
            if intent.item_id == item_id {
                return;
            }
            dlog!(self, "hover moved on, abandoning lookup for {}", intent.item_id);
            self.intent = None;
        }
        // single pending timer: entering any card restarts the delay
        self.hover = Some(HoverTimer {
            item_id,
            title,
            fire_at: Instant::now() + self.config.timing.hover_delay(),
        });
    }

    fn hover_leave(&mut self, item_id: &str) {
        if self.hover.as_ref().is_some_and(|h| h.item_id == item_id) {
            self.hover = None;
        }
        if self.intent.as_ref().is_some_and(|i| i.item_id == item_id) {
            dlog!(self, "left {item_id} before its trailer resolved");
            self.intent = None;
        }
    }

    fn fire_hover(&mut self, timer: HoverTimer) {
        if self.saturated() {
            dlog!(self, "max concurrent previews reached, dropping {}", timer.item_id);
            return;
        }
        if let Some(descriptor) = self.cache.get(&timer.item_id).cloned() {
            self.show(&timer.item_id, &timer.title, &descriptor);
            return;
        }

        // one fetch per item: wait on the running lookup instead of starting another
        if let Some(&seq) = self.in_flight.get(&timer.item_id) {
            dlog!(self, "trailer for {} already resolving", timer.item_id);
            self.intent = Some(Intent {
                seq,
                item_id: timer.item_id,
                title: timer.title,
            });
            return;
        }

        self.seq += 1;
        let seq = self.seq;
        self.in_flight.insert(timer.item_id.clone(), seq);
        dlog!(self, "resolving trailer for {}", timer.item_id);
        let lookup = self.lookup.clone();
        let tx = self.results_tx.clone();
        let item_id = timer.item_id.clone();
        tokio::spawn(async move {
            let result = lookup.lookup(&item_id).await;
            let _ = tx.send(Resolved {
                seq,
                item_id,
                result,
            });
        });
        self.intent = Some(Intent {
            seq,
            item_id: timer.item_id,
            title: timer.title,
        });
    }

    fn on_resolved(&mut self, resolved: Resolved) {
        if self.in_flight.get(&resolved.item_id) == Some(&resolved.seq) {
            self.in_flight.remove(&resolved.item_id);
        }
        let current = self
            .intent
            .as_ref()
            .is_some_and(|i| i.seq == resolved.seq && i.item_id == resolved.item_id);
        let descriptor = match resolved.result {
            Ok(d) => d,
            Err(e) => {
                dlog!(self, "trailer lookup for {} failed: {e:#}", resolved.item_id);
                if current {
                    self.intent = None;
                }
                return;
            }
        };
        self.cache.insert(resolved.item_id.clone(), descriptor.clone());
        if !current {
            dlog!(self, "discarding stale trailer for {}", resolved.item_id);
            return;
        }
        if let Some(intent) = self.intent.take() {
            self.show(&intent.item_id, &intent.title, &descriptor);
        }
    }

    // ------------------------- Sessions -------------------------

    fn show(&mut self, item_id: &str, title: &str, descriptor: &TrailerDescriptor) {
        let Some(playable) = descriptor.playable() else {
            dlog!(self, "no trailer available for {item_id}");
            return;
        };
        if self.saturated() || self.sessions.iter().any(|s| s.item_id == item_id) {
            return;
        }
        // nothing from a previous preview may overlap the new one
        self.finish_closing(None);

        let token = self.env.access_token.as_deref();
        let mounted = self
            .doc
            .update(|d| self.renderer.mount(d, playable, title, token));
        let overlay = match mounted {
            Ok(o) => o,
            Err(e) => {
                dlog!(self, "mounting preview for {item_id} failed: {e:#}");
                return;
            }
        };
        let now = Instant::now();
        dlog!(self, "showing preview for {item_id}");
        self.sessions.push(PreviewSession {
            item_id: item_id.to_string(),
            overlay,
            fade_in_at: Some(now + FRAME),
            close_at: self.config.timing.preview_duration().map(|d| now + d),
        });
    }

    /// Closes every open session. Pending hovers and already-closing overlays
    /// are left alone, so a repeated call changes nothing.
    fn request_close(&mut self) {
        while !self.sessions.is_empty() {
            self.close_session(0);
        }
    }

    fn close_session(&mut self, index: usize) {
        if index >= self.sessions.len() {
            return;
        }
        let session = self.sessions.remove(index);
        dlog!(self, "closing preview for {}", session.item_id);
        self.doc
            .update(|d| self.renderer.dispose(d, &session.overlay));
        let fade = self.config.timing.fade_out();
        if fade.is_zero() {
            self.doc
                .update(|d| self.renderer.remove(d, &session.overlay));
        } else {
            self.closing.push(Closing {
                overlay: session.overlay,
                remove_at: Instant::now() + fade,
            });
        }
    }

    /// Removes fading overlays due by `now`, or all of them.
    fn finish_closing(&mut self, now: Option<Instant>) {
        let (due, keep): (Vec<_>, Vec<_>) = std::mem::take(&mut self.closing)
            .into_iter()
            .partition(|c| now.is_none_or(|n| c.remove_at <= n));
        self.closing = keep;
        if due.is_empty() {
            return;
        }
        self.doc.update(|d| {
            for c in &due {
                self.renderer.remove(d, &c.overlay);
            }
        });
    }

    fn session_owning(&self, node: NodeId) -> Option<usize> {
        self.doc.read(|d| {
            self.sessions.iter().position(|s| {
                let mut cur = Some(node);
                while let Some(n) = cur {
                    if n == s.overlay.scrim {
                        return true;
                    }
                    cur = d.parent(n);
                }
                false
            })
        })
    }

    // ------------------------- Events -------------------------

    fn dispatch(&mut self, node: NodeId, event: DomEvent) {
        let listeners: Vec<Listener> = self.doc.read(|d| {
            d.listeners(node)
                .iter()
                .filter(|l| l.event() == event)
                .cloned()
                .collect()
        });
        for listener in listeners {
            match listener {
                Listener::CardEnter => {
                    let card = self.doc.read(|d| {
                        watcher::card_item_id(d, node).map(|id| (id, watcher::card_title(d, node)))
                    });
                    if let Some((id, title)) = card {
                        self.hover_enter(id, title);
                    }
                }
                Listener::CardLeave => {
                    if let Some(id) = self.doc.read(|d| watcher::card_item_id(d, node)) {
                        self.hover_leave(&id);
                    }
                }
                // only the scrim itself: listeners do not bubble from the container
                Listener::Dismiss | Listener::CloseButton => {
                    if let Some(index) = self.session_owning(node) {
                        self.close_session(index);
                    }
                }
                Listener::ToggleMute { media } => {
                    if self.session_owning(node).is_some() {
                        self.doc.update(|d| overlay::toggle_mute(d, node, media));
                    }
                }
                Listener::Progress { bar } => {
                    self.doc.update(|d| overlay::update_progress(d, node, bar));
                }
            }
        }
    }

    fn rescan(&mut self) {
        let armed = self.doc.update(|d| {
            let batch = d.take_inserted();
            self.watcher.scan(d, &batch)
        });
        if armed > 0 {
            dlog!(self, "armed {armed} new cards");
        }
    }

    // ------------------------- Timers -------------------------

    fn next_deadline(&self) -> Option<Instant> {
        let hover = self.hover.as_ref().map(|h| h.fire_at);
        let sessions = self
            .sessions
            .iter()
            .flat_map(|s| [s.fade_in_at, s.close_at])
            .flatten();
        let closing = self.closing.iter().map(|c| c.remove_at);
        hover.into_iter().chain(sessions).chain(closing).min()
    }

    fn on_deadline(&mut self, now: Instant) {
        self.finish_closing(Some(now));

        let fading: Vec<OverlayHandle> = self
            .sessions
            .iter_mut()
            .filter(|s| s.fade_in_at.is_some_and(|t| t <= now))
            .map(|s| {
                s.fade_in_at = None;
                s.overlay.clone()
            })
            .collect();
        if !fading.is_empty() {
            self.doc.update(|d| {
                for o in &fading {
                    self.renderer.begin_fade_in(d, o);
                }
            });
        }

        while let Some(index) = self
            .sessions
            .iter()
            .position(|s| s.close_at.is_some_and(|t| t <= now))
        {
            self.close_session(index);
        }

        if self.hover.as_ref().is_some_and(|h| h.fire_at <= now) {
            if let Some(timer) = self.hover.take() {
                self.fire_hover(timer);
            }
        }
    }

    /// Tears everything down immediately once no handle is left.
    fn shutdown(&mut self) {
        self.hover = None;
        self.intent = None;
        self.request_close();
        self.finish_closing(None);
        dlog!(self, "trailer preview engine stopped");
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests;
