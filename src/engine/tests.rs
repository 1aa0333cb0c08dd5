use super::*;
use crate::descriptor::TrailerKind;
use anyhow::bail;
use std::{
    collections::HashSet,
    sync::atomic::{AtomicUsize, Ordering},
};
use tokio::time::sleep;

use super::dom::Document;
use super::overlay::OVERLAY_CLASS;

const FIREFOX: &str = "Mozilla/5.0 (X11; Linux x86_64; rv:128.0) Gecko/20100101 Firefox/128.0";

#[derive(Default)]
struct MockLookup {
    trailers: HashMap<String, TrailerDescriptor>,
    failing: HashSet<String>,
    delay: Duration,
    calls: Arc<AtomicUsize>,
}

impl MockLookup {
    fn with(ids: &[&str]) -> Self {
        let trailers = ids
            .iter()
            .map(|id| {
                (
                    (*id).to_string(),
                    TrailerDescriptor {
                        id: format!("t-{id}"),
                        url: format!("/Videos/t-{id}/stream?static=true&api_key={{API_KEY}}"),
                        kind: Some(TrailerKind::Local),
                        title: format!("Title {id}"),
                        is_available: true,
                        runtime_ticks: None,
                    },
                )
            })
            .collect();
        Self {
            trailers,
            ..Self::default()
        }
    }
}

impl TrailerLookup for MockLookup {
    async fn lookup(&self, item_id: &str) -> Result<TrailerDescriptor> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            sleep(self.delay).await;
        }
        if self.failing.contains(item_id) {
            bail!("connection reset");
        }
        Ok(self
            .trailers
            .get(item_id)
            .cloned()
            .unwrap_or_else(|| TrailerDescriptor::unavailable(item_id)))
    }
}

struct Page {
    doc: SharedDocument,
    engine: EngineHandle,
    calls: Arc<AtomicUsize>,
}

impl Page {
    fn start(config: ConfigSnapshot, lookup: MockLookup) -> Self {
        let doc = SharedDocument::default();
        let calls = lookup.calls.clone();
        let mut env = ClientEnvironment::with_user_agent(FIREFOX);
        env.access_token = Some("tok".into());
        let engine = initialize(config, env, doc.clone(), lookup);
        Self { doc, engine, calls }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    async fn state(&self) -> EngineState {
        self.engine.state().await.expect("engine is running")
    }

    fn overlays(&self) -> Vec<NodeId> {
        self.doc.read(|d| d.query(|d, n| d.has_class(n, OVERLAY_CLASS)))
    }

    fn playing(&self) -> usize {
        self.doc.read(Document::playing_media).len()
    }

    fn add_card(&self, id: &str, title: &str) -> NodeId {
        self.doc.update(|d| {
            let card = d.create_element("div");
            d.set_attr(card, "class", "card");
            d.set_attr(card, "data-id", id);
            let text = d.create_element("div");
            d.set_attr(text, "class", "cardText");
            d.set_text(text, title);
            d.append_child(card, text).expect("append title");
            let body = d.body();
            d.append_child(body, card).expect("attach card");
            card
        })
    }
}

async fn advance(ms: u64) {
    sleep(Duration::from_millis(ms)).await;
}

#[tokio::test(start_paused = true)]
async fn leaving_before_delay_never_fetches() {
    let page = Page::start(ConfigSnapshot::default(), MockLookup::with(&["a"]));
    page.engine.hover_enter("a", "A");
    advance(500).await;
    page.engine.hover_leave("a");
    advance(2_000).await;

    assert_eq!(page.calls(), 0);
    assert!(page.overlays().is_empty());
    assert_eq!(page.state().await, EngineState::default());
}

#[tokio::test(start_paused = true)]
async fn dwell_mounts_at_delay_and_auto_closes() {
    let page = Page::start(ConfigSnapshot::default(), MockLookup::with(&["a"]));
    page.engine.hover_enter("a", "A");

    advance(799).await;
    assert!(page.overlays().is_empty());
    assert_eq!(page.calls(), 0);

    advance(2).await; // t = 801
    let s = page.state().await;
    assert_eq!(s.open, vec!["a".to_string()]);
    assert_eq!(s.active_count, 1);
    assert_eq!(page.calls(), 1);
    let scrim = page.overlays()[0];
    assert_eq!(page.doc.read(|d| d.style(scrim, "opacity").map(str::to_string)).as_deref(), Some("0"));

    advance(20).await; // past the fade-in tick
    assert_eq!(page.doc.read(|d| d.style(scrim, "opacity").map(str::to_string)).as_deref(), Some("1"));
    assert_eq!(page.playing(), 1);

    advance(30_799 - 821).await; // t = 30799
    assert_eq!(page.state().await.active_count, 1);

    advance(2).await; // t = 30801
    let s = page.state().await;
    assert_eq!(s.active_count, 0);
    assert_eq!(s.closing, 1);
    assert_eq!(page.playing(), 0);
    assert_eq!(page.overlays(), vec![scrim]);

    advance(200).await; // fade-out done at 31000
    assert!(page.overlays().is_empty());
    assert_eq!(page.state().await.closing, 0);
}

#[tokio::test(start_paused = true)]
async fn access_token_is_substituted() {
    let page = Page::start(ConfigSnapshot::default(), MockLookup::with(&["a"]));
    page.engine.hover_enter("a", "A");
    advance(801).await;
    let src = page.doc.read(|d| {
        d.query(|d, n| d.tag(n) == Some("video"))
            .first()
            .and_then(|v| d.attr(*v, "src").map(str::to_string))
    });
    assert_eq!(src.as_deref(), Some("/Videos/t-a/stream?static=true&api_key=tok"));
}

#[tokio::test(start_paused = true)]
async fn second_card_is_dropped_while_one_is_open() {
    let page = Page::start(ConfigSnapshot::default(), MockLookup::with(&["a", "b"]));
    page.engine.hover_enter("a", "A");
    advance(801).await;
    assert_eq!(page.state().await.open, vec!["a".to_string()]);

    page.engine.hover_enter("b", "B");
    advance(2_000).await;
    let s = page.state().await;
    assert_eq!(s.open, vec!["a".to_string()]);
    assert_eq!(s.pending_hover, None);
    assert_eq!(page.calls(), 1);
    assert_eq!(page.playing(), 1);

    page.engine.request_close();
    page.engine.hover_enter("b", "B");
    advance(801).await;
    let s = page.state().await;
    assert_eq!(s.open, vec!["b".to_string()]);
    // the faded overlay of a is gone before b is mounted
    assert_eq!(page.overlays().len(), 1);
    assert_eq!(page.playing(), 1);
}

#[tokio::test(start_paused = true)]
async fn request_close_is_idempotent() {
    let page = Page::start(ConfigSnapshot::default(), MockLookup::with(&["a"]));
    page.engine.request_close();
    assert_eq!(page.state().await, EngineState::default());

    page.engine.hover_enter("a", "A");
    advance(801).await;
    page.engine.request_close();
    let first = page.state().await;
    page.engine.request_close();
    let second = page.state().await;
    assert_eq!(first, second);
    assert_eq!(first.active_count, 0);
    assert_eq!(first.closing, 1);
}

#[tokio::test(start_paused = true)]
async fn repeated_hovers_hit_the_cache() {
    let page = Page::start(ConfigSnapshot::default(), MockLookup::with(&["a"]));
    for _ in 0..3 {
        page.engine.hover_enter("a", "A");
        advance(801).await;
        assert_eq!(page.state().await.active_count, 1);
        page.engine.key_down("Escape");
        advance(300).await;
    }
    assert_eq!(page.calls(), 1);
    assert_eq!(page.state().await.cached, 1);
}

#[tokio::test(start_paused = true)]
async fn unavailable_trailer_leaves_document_untouched() {
    let page = Page::start(ConfigSnapshot::default(), MockLookup::default());
    let before = page.doc.read(|d| d.descendants(d.root()).len());
    page.engine.hover_enter("unknown", "Nope");
    advance(2_000).await;
    assert_eq!(page.calls(), 1);
    assert_eq!(page.doc.read(|d| d.descendants(d.root()).len()), before);
    let s = page.state().await;
    assert_eq!(s.active_count, 0);
    assert_eq!(s.cached, 1);

    page.engine.hover_enter("unknown", "Nope");
    advance(2_000).await;
    assert_eq!(page.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn failed_lookup_is_retried_by_next_hover() {
    let mut lookup = MockLookup::with(&["a"]);
    lookup.failing.insert("a".into());
    let page = Page::start(ConfigSnapshot::default(), lookup);
    page.engine.hover_enter("a", "A");
    advance(1_000).await;
    let s = page.state().await;
    assert_eq!(s.active_count, 0);
    assert_eq!(s.resolving, None);
    assert_eq!(s.cached, 0);

    page.engine.hover_enter("a", "A");
    advance(1_000).await;
    assert_eq!(page.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn stale_lookup_is_discarded() {
    let mut lookup = MockLookup::with(&["a", "b"]);
    lookup.delay = Duration::from_millis(500);
    let page = Page::start(ConfigSnapshot::default(), lookup);

    page.engine.hover_enter("a", "A");
    advance(900).await; // a fired at 800, resolves at 1300
    assert_eq!(page.state().await.resolving.as_deref(), Some("a"));
    page.engine.hover_leave("a");
    page.engine.hover_enter("b", "B"); // fires at 1700, resolves at 2200

    advance(500).await; // t = 1400
    let s = page.state().await;
    assert!(s.open.is_empty());
    assert_eq!(s.cached, 1);
    assert!(page.overlays().is_empty());

    advance(900).await; // t = 2300
    assert_eq!(page.state().await.open, vec!["b".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn rehover_joins_the_running_lookup() {
    let mut lookup = MockLookup::with(&["a"]);
    lookup.delay = Duration::from_millis(2_000);
    let page = Page::start(ConfigSnapshot::default(), lookup);

    page.engine.hover_enter("a", "A");
    advance(900).await; // fired at 800, resolves at 2800
    page.engine.hover_leave("a");
    assert_eq!(page.state().await.resolving, None);
    page.engine.hover_enter("a", "A"); // fires at 1700 while the first lookup runs

    advance(1_000).await; // t = 1900
    assert_eq!(page.state().await.resolving.as_deref(), Some("a"));
    assert!(page.overlays().is_empty());

    advance(3_000).await; // t = 4900
    assert_eq!(page.calls(), 1);
    assert_eq!(page.state().await.open, vec!["a".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn reentering_resets_the_delay() {
    let page = Page::start(ConfigSnapshot::default(), MockLookup::with(&["a"]));
    page.engine.hover_enter("a", "A");
    advance(600).await;
    page.engine.hover_leave("a");
    page.engine.hover_enter("a", "A");
    advance(600).await; // 1200: the first timer would have fired at 800
    assert_eq!(page.calls(), 0);
    advance(201).await;
    assert_eq!(page.state().await.active_count, 1);
    assert_eq!(page.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn scrim_click_closes_but_container_click_does_not() {
    let page = Page::start(ConfigSnapshot::default(), MockLookup::with(&["a"]));
    page.engine.hover_enter("a", "A");
    advance(801).await;
    let scrim = page.overlays()[0];
    let container = page.doc.read(|d| d.children(scrim)[0]);

    page.engine.dispatch(container, DomEvent::Click);
    assert_eq!(page.state().await.active_count, 1);

    page.engine.dispatch(scrim, DomEvent::Click);
    assert_eq!(page.state().await.active_count, 0);
}

#[tokio::test(start_paused = true)]
async fn controls_are_wired() {
    let page = Page::start(ConfigSnapshot::default(), MockLookup::with(&["a"]));
    page.engine.hover_enter("a", "A");
    advance(801).await;
    let buttons = page.doc.read(|d| d.query(|d, n| d.tag(n) == Some("button")));
    assert_eq!(buttons.len(), 2);
    let video = page.doc.read(|d| d.query(|d, n| d.tag(n) == Some("video"))[0]);

    page.engine.dispatch(buttons[0], DomEvent::Click);
    page.state().await;
    assert_eq!(page.doc.read(|d| d.media(video).map(|m| m.muted)), Some(false));

    page.doc.update(|d| {
        if let Some(m) = d.media_mut(video) {
            m.duration = 100.0;
            m.current_time = 50.0;
        }
    });
    page.engine.dispatch(video, DomEvent::TimeUpdate);
    page.state().await;
    let filled = page.doc.read(|d| {
        d.query(|d, n| d.style(n, "width") == Some("50.0%")).len()
    });
    assert_eq!(filled, 1);

    page.engine.dispatch(buttons[1], DomEvent::Click);
    assert_eq!(page.state().await.active_count, 0);
    assert_eq!(page.playing(), 0);
}

#[tokio::test(start_paused = true)]
async fn escape_only_closes_on_escape() {
    let page = Page::start(ConfigSnapshot::default(), MockLookup::with(&["a"]));
    page.engine.hover_enter("a", "A");
    advance(801).await;
    page.engine.key_down("Enter");
    assert_eq!(page.state().await.active_count, 1);
    page.engine.key_down("Escape");
    assert_eq!(page.state().await.active_count, 0);
}

#[tokio::test(start_paused = true)]
async fn late_cards_are_armed_and_hoverable() {
    let page = Page::start(ConfigSnapshot::default(), MockLookup::with(&["late"]));
    advance(10).await;
    let card = page.add_card("late", "Late Arrival");
    advance(10).await;
    assert!(page.doc.read(|d| d.has_attr(card, watcher::ARMED_MARKER)));

    page.engine.dispatch(card, DomEvent::PointerEnter);
    advance(801).await;
    assert_eq!(page.state().await.open, vec!["late".to_string()]);

    page.engine.request_close();
    advance(300).await;
    page.engine.dispatch(card, DomEvent::PointerEnter);
    advance(400).await;
    page.engine.dispatch(card, DomEvent::PointerLeave);
    advance(1_000).await;
    assert_eq!(page.state().await.active_count, 0);
}

#[tokio::test(start_paused = true)]
async fn removed_card_cannot_trigger() {
    let page = Page::start(ConfigSnapshot::default(), MockLookup::with(&["a"]));
    advance(10).await;
    let card = page.add_card("a", "A");
    advance(10).await;
    page.doc.update(|d| d.remove(card));
    page.engine.dispatch(card, DomEvent::PointerEnter);
    advance(1_000).await;
    assert_eq!(page.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn zero_duration_never_auto_closes() {
    let mut cfg = ConfigSnapshot::default();
    cfg.timing.preview_duration_ms = 0;
    let page = Page::start(cfg, MockLookup::with(&["a"]));
    page.engine.hover_enter("a", "A");
    advance(120_000).await;
    assert_eq!(page.state().await.active_count, 1);
}

#[tokio::test(start_paused = true)]
async fn concurrency_limit_above_one() {
    let cfg = ConfigSnapshot {
        max_concurrent_previews: 2,
        ..ConfigSnapshot::default()
    };
    let page = Page::start(cfg, MockLookup::with(&["a", "b", "c"]));
    for id in ["a", "b", "c"] {
        page.engine.hover_enter(id, id);
        advance(801).await;
    }
    let s = page.state().await;
    assert_eq!(s.open, vec!["a".to_string(), "b".to_string()]);
    assert_eq!(page.calls(), 2);

    page.engine.key_down("Escape");
    assert_eq!(page.state().await.active_count, 0);
}

#[tokio::test(start_paused = true)]
async fn gated_engine_is_inert() {
    let doc = SharedDocument::default();
    let env = ClientEnvironment::with_user_agent(
        "Mozilla/5.0 (iPhone; CPU iPhone OS 17_4 like Mac OS X) Mobile/15E148",
    );
    let lookup = MockLookup::with(&["a"]);
    let calls = lookup.calls.clone();
    let engine = initialize(ConfigSnapshot::default(), env, doc.clone(), lookup);
    assert!(!engine.is_active());
    engine.hover_enter("a", "A");
    advance(2_000).await;
    assert_eq!(engine.state().await, None);
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    let disabled = initialize(
        ConfigSnapshot {
            enabled: false,
            ..ConfigSnapshot::default()
        },
        ClientEnvironment::with_user_agent(FIREFOX),
        doc,
        MockLookup::default(),
    );
    assert!(!disabled.is_active());
}

#[tokio::test(start_paused = true)]
async fn dropping_every_handle_tears_down() {
    let page = Page::start(ConfigSnapshot::default(), MockLookup::with(&["a"]));
    page.engine.hover_enter("a", "A");
    advance(801).await;
    assert_eq!(page.overlays().len(), 1);
    let Page { doc, engine, .. } = page;
    drop(engine);
    advance(10).await;
    assert!(doc.read(|d| d.query(|d, n| d.has_class(n, OVERLAY_CLASS))).is_empty());
}
