//! Builds and tears down the visual tree of one preview.

use anyhow::{Context, Result};

use super::dom::{Document, Listener, MediaState, NodeId};
use crate::config::{ConfigSnapshot, Position, Sizing};
use crate::descriptor::{Playable, TrailerKind, API_KEY_PLACEHOLDER};

pub const OVERLAY_CLASS: &str = "trailer-preview-overlay";
const MUTED_LABEL: &str = "🔇";
const UNMUTED_LABEL: &str = "🔊";

/// Node handles of one mounted overlay. Borrowed by the renderer; the engine
/// owns it through its session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayHandle {
    pub scrim: NodeId,
    pub container: NodeId,
    pub media: NodeId,
    pub kind: TrailerKind,
    pub title: Option<NodeId>,
    pub mute_button: Option<NodeId>,
    pub progress_bar: Option<NodeId>,
    pub close_button: Option<NodeId>,
}

pub struct OverlayRenderer {
    config: ConfigSnapshot,
}

impl OverlayRenderer {
    pub fn new(config: ConfigSnapshot) -> Self {
        Self { config }
    }

    /// Builds the overlay detached, then attaches it under `body` in one
    /// insertion. Starts transparent and scaled down; see [`Self::begin_fade_in`].
    pub fn mount(
        &self,
        doc: &mut Document,
        trailer: Playable<'_>,
        fallback_title: &str,
        access_token: Option<&str>,
    ) -> Result<OverlayHandle> {
        let scrim = doc.create_element("div");
        match self.build(doc, scrim, trailer, fallback_title, access_token) {
            Ok(handle) => Ok(handle),
            Err(e) => {
                doc.remove(scrim);
                Err(e)
            }
        }
    }

    fn build(
        &self,
        doc: &mut Document,
        scrim: NodeId,
        trailer: Playable<'_>,
        fallback_title: &str,
        access_token: Option<&str>,
    ) -> Result<OverlayHandle> {
        self.style_scrim(doc, scrim);
        doc.add_listener(scrim, Listener::Dismiss);

        let container = doc.create_element("div");
        doc.set_attr(container, "class", "trailer-preview-container");
        self.style_container(doc, container);
        doc.append_child(scrim, container).context("attaching container")?;

        let media = match trailer.kind {
            TrailerKind::Local => self.video(doc, trailer.url, access_token),
            TrailerKind::Remote => self.iframe(doc, trailer.url),
        };
        doc.set_style(media, "width", "100%");
        doc.set_style(media, "height", "100%");
        doc.set_style(media, "border", "none");
        doc.set_style(media, "display", "block");
        doc.append_child(container, media).context("attaching media")?;

        let label = if trailer.title.is_empty() {
            fallback_title
        } else {
            trailer.title
        };
        let title = if self.config.visual.show_title && !label.is_empty() {
            let t = doc.create_element("div");
            doc.set_attr(t, "class", "trailer-preview-title");
            doc.set_text(t, label);
            doc.set_style(t, "position", "absolute");
            doc.set_style(t, "top", "20px");
            doc.set_style(t, "left", "20px");
            doc.set_style(t, "pointer-events", "none");
            doc.append_child(container, t).context("attaching title")?;
            Some(t)
        } else {
            None
        };

        let mut handle = OverlayHandle {
            scrim,
            container,
            media,
            kind: trailer.kind,
            title,
            mute_button: None,
            progress_bar: None,
            close_button: None,
        };
        self.controls(doc, &mut handle)?;

        let body = doc.body();
        doc.append_child(body, scrim).context("attaching overlay")?;
        Ok(handle)
    }

    fn style_scrim(&self, doc: &mut Document, scrim: NodeId) {
        let visual = &self.config.visual;
        doc.set_attr(scrim, "class", OVERLAY_CLASS);
        doc.set_style(scrim, "position", "fixed");
        doc.set_style(scrim, "inset", "0");
        doc.set_style(scrim, "z-index", "9999");
        doc.set_style(scrim, "display", "flex");
        doc.set_style(scrim, "align-items", "center");
        doc.set_style(scrim, "justify-content", "center");
        let dim = if visual.background_dim.enabled {
            visual.background_dim.opacity
        } else {
            0.0
        };
        doc.set_style(scrim, "background", format!("rgba(0, 0, 0, {dim})"));
        if visual.background_blur {
            doc.set_style(scrim, "backdrop-filter", "blur(8px)");
        }
        doc.set_style(scrim, "opacity", "0");
        doc.set_style(
            scrim,
            "transition",
            format!("opacity {}ms ease-in-out", self.config.timing.fade_in_ms),
        );
    }

    fn style_container(&self, doc: &mut Document, container: NodeId) {
        let (width, height) = match self.config.sizing {
            Sizing::Percentage {
                width_percent,
                height_percent,
            } => (format!("{width_percent}vw"), format!("{height_percent}vh")),
            Sizing::Fixed {
                width_px,
                height_px,
            } => (format!("{width_px}px"), format!("{height_px}px")),
        };
        doc.set_style(container, "position", "relative");
        doc.set_style(container, "width", width);
        doc.set_style(container, "height", height);
        doc.set_style(container, "max-width", "95vw");
        doc.set_style(container, "max-height", "95vh");
        doc.set_style(container, "background", "#000");
        doc.set_style(container, "overflow", "hidden");
        doc.set_style(
            container,
            "border-radius",
            format!("{}px", self.config.visual.border_radius_px),
        );
        doc.set_style(container, "opacity", self.config.visual.opacity.to_string());
        doc.set_style(container, "transform", self.transform(0.9));
        doc.set_style(
            container,
            "transition",
            format!(
                "transform {}ms cubic-bezier(0.34, 1.56, 0.64, 1)",
                self.config.timing.fade_in_ms
            ),
        );
    }

    fn transform(&self, scale: f64) -> String {
        let (x, y) = match self.config.position {
            Position::Center => (0, 0),
            Position::Custom { offset_x, offset_y } => (offset_x, offset_y),
        };
        format!("translate({x}px, {y}px) scale({scale})")
    }

    fn video(&self, doc: &mut Document, url: &str, access_token: Option<&str>) -> NodeId {
        let v = doc.create_element("video");
        let src = match access_token {
            Some(token) => url.replace(API_KEY_PLACEHOLDER, token),
            None => url.to_string(),
        };
        doc.set_attr(v, "src", src);
        doc.set_attr(v, "playsinline", "");
        doc.set_media(
            v,
            MediaState {
                playing: self.config.playback.autoplay,
                muted: self.config.audio.starts_muted(),
                volume: f64::from(self.config.audio.volume_percent) / 100.0,
                looped: self.config.playback.looped,
                ..MediaState::default()
            },
        );
        v
    }

    fn iframe(&self, doc: &mut Document, url: &str) -> NodeId {
        let f = doc.create_element("iframe");
        doc.set_attr(f, "src", self.embed_url(url));
        doc.set_attr(f, "allow", "autoplay; encrypted-media");
        doc.set_attr(
            f,
            "sandbox",
            "allow-scripts allow-same-origin allow-presentation",
        );
        doc.set_media(
            f,
            MediaState {
                playing: self.config.playback.autoplay,
                muted: self.config.audio.starts_muted(),
                looped: self.config.playback.looped,
                ..MediaState::default()
            },
        );
        f
    }

    /// Player parameters appended to a remote embed link.
    pub fn embed_url(&self, url: &str) -> String {
        let base = url.split(['?', '#']).next().unwrap_or(url);
        let video_id = base.rsplit('/').next().unwrap_or_default();
        let flag = |b: bool| if b { "1" } else { "0" };
        let playback = &self.config.playback;
        let mut params = vec![
            format!("autoplay={}", flag(playback.autoplay)),
            format!("mute={}", flag(self.config.audio.starts_muted())),
            "controls=0".to_string(),
        ];
        if playback.looped && !video_id.is_empty() {
            params.push("loop=1".into());
            params.push(format!("playlist={video_id}"));
        }
        params.push("playsinline=1".into());
        params.push("rel=0".into());
        params.push("modestbranding=1".into());
        if !playback.quality.is_empty() && !playback.quality.eq_ignore_ascii_case("auto") {
            params.push(format!("vq={}", playback.quality));
        }
        let sep = if url.contains('?') { '&' } else { '?' };
        format!("{url}{sep}{}", params.join("&"))
    }

    fn controls(&self, doc: &mut Document, handle: &mut OverlayHandle) -> Result<()> {
        let c = &self.config.controls;
        let local = handle.kind == TrailerKind::Local;
        if !c.show_close_button && !(local && (c.show_mute_button || c.show_progress_bar)) {
            return Ok(());
        }
        let bar = doc.create_element("div");
        doc.set_attr(bar, "class", "trailer-preview-controls");
        doc.set_style(bar, "position", "absolute");
        doc.set_style(bar, "bottom", "0");
        doc.set_style(bar, "display", "flex");

        if local && c.show_mute_button {
            let muted = doc.media(handle.media).is_none_or(|m| m.muted);
            let b = button(doc, if muted { MUTED_LABEL } else { UNMUTED_LABEL });
            doc.add_listener(
                b,
                Listener::ToggleMute {
                    media: handle.media,
                },
            );
            doc.append_child(bar, b).context("attaching mute button")?;
            handle.mute_button = Some(b);
        }

        if local && c.show_progress_bar {
            let track = doc.create_element("div");
            doc.set_attr(track, "class", "trailer-preview-progress");
            let fill = doc.create_element("div");
            doc.set_style(fill, "width", "0%");
            doc.append_child(track, fill).context("attaching progress fill")?;
            doc.append_child(bar, track).context("attaching progress")?;
            doc.add_listener(handle.media, Listener::Progress { bar: fill });
            handle.progress_bar = Some(fill);
        }

        if c.show_close_button {
            let b = button(doc, "✕");
            doc.add_listener(b, Listener::CloseButton);
            doc.append_child(bar, b).context("attaching close button")?;
            handle.close_button = Some(b);
        }

        doc.append_child(handle.container, bar)
            .context("attaching controls")
    }

    /// Second paint phase: fully opaque, full scale.
    pub fn begin_fade_in(&self, doc: &mut Document, handle: &OverlayHandle) {
        doc.set_style(handle.scrim, "opacity", "1");
        doc.set_style(handle.container, "transform", self.transform(1.0));
    }

    /// Stops playback and starts the fade-out. Safe on a partially or fully
    /// removed overlay.
    pub fn dispose(&self, doc: &mut Document, handle: &OverlayHandle) {
        stop_media(doc, handle.media);
        doc.set_attr(handle.scrim, "data-closing", "");
        doc.set_style(
            handle.scrim,
            "transition",
            format!("opacity {}ms ease-in-out", self.config.timing.fade_out_ms),
        );
        doc.set_style(handle.scrim, "opacity", "0");
    }

    /// Final phase of teardown, once the fade has run.
    pub fn remove(&self, doc: &mut Document, handle: &OverlayHandle) -> bool {
        stop_media(doc, handle.media);
        doc.remove(handle.scrim)
    }
}

fn button(doc: &mut Document, label: &str) -> NodeId {
    let b = doc.create_element("button");
    doc.set_text(b, label);
    doc.set_style(b, "cursor", "pointer");
    b
}

fn stop_media(doc: &mut Document, media: NodeId) {
    match doc.tag(media) {
        Some("video") => doc.set_attr(media, "src", ""),
        Some("iframe") => doc.set_attr(media, "src", "about:blank"),
        _ => return,
    }
    if let Some(m) = doc.media_mut(media) {
        m.playing = false;
    }
}

/// Flips the mute state and relabels the button.
pub fn toggle_mute(doc: &mut Document, button: NodeId, media: NodeId) {
    let Some(m) = doc.media_mut(media) else { return };
    m.muted = !m.muted;
    let label = if m.muted { MUTED_LABEL } else { UNMUTED_LABEL };
    doc.set_text(button, label);
}

/// Mirrors the media position onto the progress fill.
pub fn update_progress(doc: &mut Document, media: NodeId, bar: NodeId) {
    let Some(m) = doc.media(media) else { return };
    if m.duration <= 0.0 || !m.duration.is_finite() {
        return;
    }
    let percent = (m.current_time / m.duration * 100.0).clamp(0.0, 100.0);
    doc.set_style(bar, "width", format!("{percent:.1}%"));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Audio, Controls};

    fn local() -> Playable<'static> {
        Playable {
            kind: TrailerKind::Local,
            url: "/Videos/t1/stream?static=true&api_key={API_KEY}",
            title: "Heat",
        }
    }

    fn remote() -> Playable<'static> {
        Playable {
            kind: TrailerKind::Remote,
            url: "https://www.youtube-nocookie.com/embed/dQw4w9WgXcQ",
            title: "",
        }
    }

    #[test]
    fn local_mount_builds_full_tree() {
        let r = OverlayRenderer::new(ConfigSnapshot::default());
        let mut doc = Document::new();
        let h = r.mount(&mut doc, local(), "Card", Some("tok")).expect("mount");

        assert!(doc.is_attached(h.scrim));
        assert_eq!(doc.parent(h.scrim), Some(doc.body()));
        assert_eq!(doc.style(h.scrim, "opacity"), Some("0"));
        assert_eq!(doc.style(h.scrim, "background"), Some("rgba(0, 0, 0, 0.7)"));
        assert_eq!(doc.style(h.container, "width"), Some("40vw"));
        assert_eq!(doc.tag(h.media), Some("video"));
        assert_eq!(
            doc.attr(h.media, "src"),
            Some("/Videos/t1/stream?static=true&api_key=tok")
        );
        let m = doc.media(h.media).expect("media state");
        assert!(m.playing && m.muted && m.looped);
        assert!((m.volume - 0.3).abs() < f64::EPSILON);
        assert_eq!(h.title.map(|t| doc.text_content(t)), Some("Heat".to_string()));
        assert!(h.mute_button.is_some() && h.progress_bar.is_some() && h.close_button.is_some());
        assert_eq!(doc.listeners(h.scrim), &[Listener::Dismiss]);
    }

    #[test]
    fn remote_mount_has_no_local_controls() {
        let r = OverlayRenderer::new(ConfigSnapshot::default());
        let mut doc = Document::new();
        let h = r.mount(&mut doc, remote(), "Alien", None).expect("mount");
        assert_eq!(doc.tag(h.media), Some("iframe"));
        assert!(doc.has_attr(h.media, "sandbox"));
        assert!(h.mute_button.is_none());
        assert!(h.progress_bar.is_none());
        assert!(h.close_button.is_some());
        // card title stands in for an empty descriptor title
        assert_eq!(h.title.map(|t| doc.text_content(t)), Some("Alien".to_string()));
    }

    #[test]
    fn embed_parameters_follow_config() {
        let mut cfg = ConfigSnapshot::default();
        cfg.playback.quality = "hd720".into();
        cfg.audio = Audio {
            enabled: true,
            muted_by_default: false,
            volume_percent: 50,
        };
        let r = OverlayRenderer::new(cfg);
        assert_eq!(
            r.embed_url("https://www.youtube-nocookie.com/embed/dQw4w9WgXcQ"),
            "https://www.youtube-nocookie.com/embed/dQw4w9WgXcQ?autoplay=1&mute=0&controls=0&loop=1&playlist=dQw4w9WgXcQ&playsinline=1&rel=0&modestbranding=1&vq=hd720"
        );
    }

    #[test]
    fn token_placeholder_kept_without_token() {
        let r = OverlayRenderer::new(ConfigSnapshot::default());
        let mut doc = Document::new();
        let h = r.mount(&mut doc, local(), "", None).expect("mount");
        assert!(doc
            .attr(h.media, "src")
            .is_some_and(|s| s.ends_with("api_key={API_KEY}")));
    }

    #[test]
    fn no_controls_when_all_disabled() {
        let mut cfg = ConfigSnapshot::default();
        cfg.controls = Controls {
            show_progress_bar: false,
            show_close_button: false,
            show_mute_button: false,
        };
        cfg.visual.show_title = false;
        let r = OverlayRenderer::new(cfg);
        let mut doc = Document::new();
        let h = r.mount(&mut doc, local(), "Heat", None).expect("mount");
        assert_eq!(doc.children(h.container), &[h.media]);
    }

    #[test]
    fn fade_dispose_remove() {
        let r = OverlayRenderer::new(ConfigSnapshot::default());
        let mut doc = Document::new();
        let h = r.mount(&mut doc, remote(), "", None).expect("mount");
        r.begin_fade_in(&mut doc, &h);
        assert_eq!(doc.style(h.scrim, "opacity"), Some("1"));
        assert_eq!(
            doc.style(h.container, "transform"),
            Some("translate(0px, 0px) scale(1)")
        );

        r.dispose(&mut doc, &h);
        assert_eq!(doc.attr(h.media, "src"), Some("about:blank"));
        assert!(doc.playing_media().is_empty());
        assert_eq!(doc.style(h.scrim, "opacity"), Some("0"));
        assert!(doc.is_attached(h.scrim));

        assert!(r.remove(&mut doc, &h));
        assert!(!doc.contains(h.media));
        assert!(!r.remove(&mut doc, &h));
        // disposing a removed overlay is harmless
        r.dispose(&mut doc, &h);
    }

    #[test]
    fn mute_and_progress_helpers() {
        let r = OverlayRenderer::new(ConfigSnapshot::default());
        let mut doc = Document::new();
        let h = r.mount(&mut doc, local(), "", None).expect("mount");
        let button = h.mute_button.expect("mute button");
        toggle_mute(&mut doc, button, h.media);
        assert_eq!(doc.media(h.media).map(|m| m.muted), Some(false));
        assert_eq!(doc.text_content(button), UNMUTED_LABEL);

        let bar = h.progress_bar.expect("progress bar");
        update_progress(&mut doc, h.media, bar);
        assert_eq!(doc.style(bar, "width"), Some("0%"));
        if let Some(m) = doc.media_mut(h.media) {
            m.duration = 120.0;
            m.current_time = 30.0;
        }
        update_progress(&mut doc, h.media, bar);
        assert_eq!(doc.style(bar, "width"), Some("25.0%"));
    }
}
