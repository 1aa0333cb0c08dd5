//! The browser bundle, with the page's [`ConfigSnapshot`] baked in.

use anyhow::{Context, Result};
use sha1::{Digest, Sha1};

use crate::config::ConfigSnapshot;

const TEMPLATE: &str = include_str!("../assets/trailer-preview.js");

const CONFIG_SLOT: &str = "__TRAILER_PREVIEW_CONFIG__";
const BASE_SLOT: &str = "__TRAILER_PREVIEW_BASE__";
const VERSION_SLOT: &str = "__TRAILER_PREVIEW_VERSION__";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientScript {
    pub body: String,
    /// Quoted strong validator, ready for the `ETag` header.
    pub etag: String,
}

/// Every value is substituted as a JSON literal, so no config string can break
/// out of its slot.
pub fn build(config: &ConfigSnapshot, base_path: &str, version: &str) -> Result<ClientScript> {
    let config_json = serde_json::to_string(config).context("serializing config snapshot")?;
    let base_json = serde_json::to_string(base_path).context("serializing base path")?;
    let version_json = serde_json::to_string(version).context("serializing version")?;
    let body = fill_slots(
        TEMPLATE,
        &[
            (CONFIG_SLOT, config_json.as_str()),
            (BASE_SLOT, base_json.as_str()),
            (VERSION_SLOT, version_json.as_str()),
        ],
    );

    let mut hasher = Sha1::new();
    hasher.update(body.as_bytes());
    let etag = format!("\"{:x}\"", hasher.finalize());
    Ok(ClientScript { body, etag })
}

/// Single left-to-right pass over `template`; substituted text is never rescanned.
fn fill_slots(template: &str, slots: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    loop {
        let next = slots
            .iter()
            .filter_map(|(slot, value)| rest.find(*slot).map(|at| (at, *slot, *value)))
            .min_by_key(|(at, _, _)| *at);
        let Some((at, slot, value)) = next else {
            out.push_str(rest);
            return out;
        };
        out.push_str(&rest[..at]);
        out.push_str(value);
        rest = &rest[at + slot.len()..];
    }
}

/// `If-None-Match` check: `*`, a single tag, or a list; weak tags compare by value.
pub fn etag_matches(if_none_match: &str, etag: &str) -> bool {
    let want = etag.trim_start_matches("W/");
    if_none_match
        .split(',')
        .map(str::trim)
        .any(|t| t == "*" || t.trim_start_matches("W/") == want)
}
