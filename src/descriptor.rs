//! Trailer descriptors and their resolution from host library items.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

/// Placeholder the browser swaps for the session access token.
pub const API_KEY_PLACEHOLDER: &str = "{API_KEY}";

const EMBED_BASE: &str = "https://www.youtube-nocookie.com/embed/";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrailerKind {
    Local,
    Remote,
}

/// Resolved trailer metadata for one item. When `is_available` is false the
/// other fields carry no meaning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrailerDescriptor {
    pub id: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub kind: Option<TrailerKind>,
    #[serde(default)]
    pub title: String,
    pub is_available: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_ticks: Option<i64>,
}

/// The trusted part of an available descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Playable<'a> {
    pub kind: TrailerKind,
    pub url: &'a str,
    pub title: &'a str,
}

impl TrailerDescriptor {
    pub fn unavailable(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url: String::new(),
            kind: None,
            title: String::new(),
            is_available: false,
            runtime_ticks: None,
        }
    }

    pub fn playable(&self) -> Option<Playable<'_>> {
        if !self.is_available || self.url.is_empty() {
            return None;
        }
        Some(Playable {
            kind: self.kind?,
            url: &self.url,
            title: &self.title,
        })
    }
}

// ------------------------- Library items -------------------------

/// What the host's item-lookup service knows about one item.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LibraryItem {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub local_trailers: Vec<LocalTrailer>,
    #[serde(default)]
    pub remote_trailers: Vec<RemoteTrailer>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalTrailer {
    pub id: String,
    #[serde(default)]
    pub runtime_ticks: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteTrailer {
    pub url: String,
    #[serde(default)]
    pub name: Option<String>,
}

/// Local extras win over remote links; a remote link that cannot be turned
/// into an embed URL is skipped rather than guessed at.
pub fn describe(item: &LibraryItem, base_path: &str) -> TrailerDescriptor {
    if let Some(local) = item.local_trailers.first() {
        return TrailerDescriptor {
            id: local.id.clone(),
            url: local_stream_url(base_path, &local.id),
            kind: Some(TrailerKind::Local),
            title: item.name.clone(),
            is_available: true,
            runtime_ticks: local.runtime_ticks,
        };
    }
    for remote in &item.remote_trailers {
        if let Some(video_id) = youtube_id(&remote.url) {
            return TrailerDescriptor {
                id: video_id.to_string(),
                url: format!("{EMBED_BASE}{video_id}"),
                kind: Some(TrailerKind::Remote),
                title: item.name.clone(),
                is_available: true,
                runtime_ticks: None,
            };
        }
    }
    TrailerDescriptor::unavailable(item.id.clone())
}

pub fn local_stream_url(base_path: &str, trailer_id: &str) -> String {
    format!("{base_path}/Videos/{trailer_id}/stream?static=true&api_key={API_KEY_PLACEHOLDER}")
}

static YOUTUBE_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^https?://(?:www\.|m\.|music\.)?(?:youtube\.com/watch\?(?:[^#]*&)?v=|youtu\.be/|youtube(?:-nocookie)?\.com/embed/)([A-Za-z0-9_-]{11})(?:[&?#/]|$)",
    )
    .expect("static youtube pattern")
});

/// Extracts the 11-character video id from the common YouTube URL shapes.
pub fn youtube_id(url: &str) -> Option<&str> {
    YOUTUBE_ID
        .captures(url.trim())
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(local: &[&str], remote: &[&str]) -> LibraryItem {
        LibraryItem {
            id: "item-1".into(),
            name: "Heat".into(),
            local_trailers: local
                .iter()
                .map(|id| LocalTrailer {
                    id: (*id).to_string(),
                    runtime_ticks: Some(1_200_000_000),
                })
                .collect(),
            remote_trailers: remote
                .iter()
                .map(|url| RemoteTrailer {
                    url: (*url).to_string(),
                    name: None,
                })
                .collect(),
        }
    }

    #[test]
    fn youtube_shapes() {
        assert_eq!(youtube_id("https://www.youtube.com/watch?v=dQw4w9WgXcQ"), Some("dQw4w9WgXcQ"));
        assert_eq!(
            youtube_id("https://youtube.com/watch?feature=share&v=dQw4w9WgXcQ&t=3"),
            Some("dQw4w9WgXcQ")
        );
        assert_eq!(youtube_id("https://youtu.be/dQw4w9WgXcQ"), Some("dQw4w9WgXcQ"));
        assert_eq!(youtube_id("https://www.youtube.com/embed/dQw4w9WgXcQ?rel=0"), Some("dQw4w9WgXcQ"));
    }

    #[test]
    fn malformed_remote_urls_are_rejected() {
        assert_eq!(youtube_id(""), None);
        assert_eq!(youtube_id("not a url"), None);
        assert_eq!(youtube_id("https://www.youtube.com/watch?v=short"), None);
        assert_eq!(youtube_id("https://vimeo.com/123456"), None);
        assert_eq!(youtube_id("https://www.youtube.com/watch?v=dQw4w9WgXcQextra"), None);
    }

    #[test]
    fn local_trailer_wins() {
        let d = describe(&item(&["t1"], &["https://youtu.be/dQw4w9WgXcQ"]), "/jf");
        assert!(d.is_available);
        assert_eq!(d.kind, Some(TrailerKind::Local));
        assert_eq!(d.url, "/jf/Videos/t1/stream?static=true&api_key={API_KEY}");
        assert_eq!(d.runtime_ticks, Some(1_200_000_000));
        assert_eq!(d.title, "Heat");
    }

    #[test]
    fn first_parsable_remote_is_used() {
        let d = describe(
            &item(&[], &["https://vimeo.com/1", "https://youtu.be/dQw4w9WgXcQ"]),
            "",
        );
        let p = d.playable().expect("remote trailer is playable");
        assert_eq!(p.kind, TrailerKind::Remote);
        assert_eq!(p.url, "https://www.youtube-nocookie.com/embed/dQw4w9WgXcQ");
    }

    #[test]
    fn nothing_usable_is_unavailable() {
        let d = describe(&item(&[], &["https://vimeo.com/1"]), "");
        assert!(!d.is_available);
        assert_eq!(d.playable(), None);
        assert_eq!(d.id, "item-1");
    }

    #[test]
    fn unavailable_json_shape() {
        let json = serde_json::to_value(TrailerDescriptor::unavailable("x")).expect("serialize");
        assert_eq!(json["isAvailable"], false);
        assert!(json.get("runtimeTicks").is_none());
        let back: TrailerDescriptor =
            serde_json::from_str(r#"{"id":"x","isAvailable":false}"#).expect("sparse json parses");
        assert_eq!(back, TrailerDescriptor::unavailable("x"));
    }
}
