//! trailer-preview: hover-triggered trailer previews for a media-library web UI.
//!
//! - `engine`: the preview state machine, rendered into an in-memory document.
//! - `injection`: idempotent script-tag patcher for the host's `index.html`.
//! - `api`: the `/TrailerPreview/*` HTTP surface served by `trailer-previewd`.
//!
//! Notes:
//! - No unsafe. Locks are never held across awaits.
//! - Every failure on the preview path reduces to "no preview", never to a host error.

#![deny(unsafe_code)]
#![deny(clippy::all, clippy::pedantic, clippy::nursery, clippy::perf)]
#![allow(
    clippy::module_name_repetitions,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::must_use_candidate,
    clippy::too_many_lines
)]

pub mod api;
pub mod config;
pub mod descriptor;
pub mod engine;
pub mod injection;
pub mod library;
pub mod lookup;
pub mod script;
