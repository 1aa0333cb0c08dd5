//! Mounts the client script into the host's served `index.html`.
//!
//! Two strategies, tried in order: register an in-memory transform with the
//! [`FileTransformation`] capability, or rewrite the file on disk. Both apply
//! the same rule ([`apply_patch`]), so any number of runs in any order
//! converges to exactly one tag carrying the current version.

use anyhow::{Context, Result};
use regex::Regex;
use std::{
    fmt, fs,
    path::{Path, PathBuf},
    sync::{Arc, LazyLock, PoisonError, RwLock},
};
use tracing::{debug, info, warn};

use crate::config::{normalize_base_path, Injection, InjectionMode, Settings};

pub const PLUGIN_NAME: &str = "TrailerPreview";
pub const TRANSFORMATION_ID: &str = "a1b2c3d4-e5f6-7890-abcd-ef1234567890";
pub const INDEX_PATTERN: &str = "index.html";

/// Any script tag carrying this plugin's identity attribute. Scoped to the
/// attribute so unrelated scripts are never touched.
static PLUGIN_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)<script\b[^>]*\bplugin\s*=\s*"TrailerPreview"[^>]*>\s*</script>"#)
        .expect("static plugin tag pattern")
});

pub fn script_tag(base_path: &str, version: &str) -> String {
    format!(
        r#"<script plugin="{PLUGIN_NAME}" version="{version}" src="{base_path}/TrailerPreview/ClientScript" defer></script>"#
    )
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchOutcome {
    Unchanged,
    Patched(String),
    NoBodyMarker,
}

fn body_close(html: &str) -> Option<usize> {
    html.to_ascii_lowercase().rfind("</body>")
}

/// Strips every older copy of the tag and inserts `tag` right before the last
/// `</body>`. A document already holding exactly `tag` once is left alone; a
/// document without `</body>` is never modified.
pub fn apply_patch(html: &str, tag: &str) -> PatchOutcome {
    let mut existing = PLUGIN_TAG.find_iter(html);
    if let (Some(only), None) = (existing.next(), existing.next()) {
        if only.as_str() == tag {
            return PatchOutcome::Unchanged;
        }
    }
    if body_close(html).is_none() {
        return PatchOutcome::NoBodyMarker;
    }
    let stripped = PLUGIN_TAG.replace_all(html, "");
    let Some(at) = body_close(&stripped) else {
        return PatchOutcome::NoBodyMarker;
    };
    let mut out = String::with_capacity(stripped.len() + tag.len());
    out.push_str(&stripped[..at]);
    out.push_str(tag);
    out.push_str(&stripped[at..]);
    if out == html {
        PatchOutcome::Unchanged
    } else {
        PatchOutcome::Patched(out)
    }
}

/// Text-in, text-out form used by the delegated transform.
pub fn transform_index(html: &str, tag: &str) -> String {
    match apply_patch(html, tag) {
        PatchOutcome::Patched(out) => out,
        PatchOutcome::Unchanged | PatchOutcome::NoBodyMarker => html.to_string(),
    }
}

// ------------------------- Delegated transform -------------------------

pub type TransformFn = Arc<dyn Fn(&str) -> String + Send + Sync>;

struct Transformation {
    id: String,
    pattern: Regex,
    callback: TransformFn,
}

/// Host-side hook point: callbacks keyed by a file-name pattern rewrite served
/// files on their way out.
#[derive(Default)]
pub struct TransformRegistry {
    entries: RwLock<Vec<Transformation>>,
}

impl TransformRegistry {
    /// Registering the same id again replaces the earlier callback.
    pub fn register(&self, id: &str, file_name_pattern: &str, callback: TransformFn) -> Result<()> {
        let pattern = Regex::new(file_name_pattern)
            .with_context(|| format!("invalid file name pattern {file_name_pattern:?}"))?;
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.retain(|t| t.id != id);
        entries.push(Transformation {
            id: id.to_string(),
            pattern,
            callback,
        });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs every matching callback over `contents`, in registration order.
    pub fn apply(&self, file_name: &str, contents: &str) -> String {
        let callbacks: Vec<TransformFn> = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|t| t.pattern.is_match(file_name))
            .map(|t| t.callback.clone())
            .collect();
        callbacks
            .iter()
            .fold(contents.to_string(), |text, cb| cb(&text))
    }
}

impl fmt::Debug for TransformRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransformRegistry")
            .field("entries", &self.len())
            .finish()
    }
}

/// Whether a delegated transform hook exists in this process. Decided once at
/// startup.
#[derive(Debug, Clone)]
pub enum FileTransformation {
    Available(Arc<TransformRegistry>),
    Unavailable,
}

// ------------------------- Direct patch -------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InjectionReport {
    Disabled,
    Delegated,
    AlreadyCurrent(PathBuf),
    Patched(PathBuf),
    NoWebDir,
    FileMissing(PathBuf),
    NoBodyMarker(PathBuf),
    Failed(String),
}

impl InjectionReport {
    /// Whether the page will load the script after this run.
    pub fn script_reachable(&self) -> bool {
        matches!(
            self,
            Self::Delegated | Self::AlreadyCurrent(_) | Self::Patched(_)
        )
    }
}

impl fmt::Display for InjectionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disabled => write!(f, "injection disabled"),
            Self::Delegated => write!(f, "registered {INDEX_PATTERN} transformation"),
            Self::AlreadyCurrent(p) => write!(f, "script already injected in {}", p.display()),
            Self::Patched(p) => write!(f, "injected script into {}", p.display()),
            Self::NoWebDir => write!(f, "no web directory configured"),
            Self::FileMissing(p) => write!(f, "index file not found at {}", p.display()),
            Self::NoBodyMarker(p) => write!(f, "no closing body tag in {}", p.display()),
            Self::Failed(e) => write!(f, "injection failed: {e}"),
        }
    }
}

/// One read, at most one write. The file is replaced atomically.
pub fn patch_file(path: &Path, tag: &str) -> Result<InjectionReport> {
    if !path.is_file() {
        return Ok(InjectionReport::FileMissing(path.to_path_buf()));
    }
    let html = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    match apply_patch(&html, tag) {
        PatchOutcome::Unchanged => Ok(InjectionReport::AlreadyCurrent(path.to_path_buf())),
        PatchOutcome::NoBodyMarker => Ok(InjectionReport::NoBodyMarker(path.to_path_buf())),
        PatchOutcome::Patched(out) => {
            let tmp = path.with_extension("html.tmp");
            fs::write(&tmp, out.as_bytes())
                .with_context(|| format!("writing {}", tmp.display()))?;
            fs::rename(&tmp, path).with_context(|| format!("replacing {}", path.display()))?;
            Ok(InjectionReport::Patched(path.to_path_buf()))
        }
    }
}

pub struct InjectionPatcher {
    tag: String,
    mode: InjectionMode,
    index_path: Option<PathBuf>,
}

impl InjectionPatcher {
    pub fn new(base_path: &str, version: &str, injection: &Injection) -> Self {
        Self {
            tag: script_tag(base_path, version),
            mode: injection.mode,
            index_path: injection.index_path(),
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Never fails: every problem is reduced to a report and a log line.
    pub fn run(&self, transformation: &FileTransformation) -> InjectionReport {
        let report = self.run_inner(transformation);
        if report.script_reachable() || report == InjectionReport::Disabled {
            info!("{report}");
        } else {
            warn!("{report}; the preview script will not load automatically");
        }
        report
    }

    fn run_inner(&self, transformation: &FileTransformation) -> InjectionReport {
        if self.mode == InjectionMode::Off {
            return InjectionReport::Disabled;
        }
        if self.mode == InjectionMode::Auto {
            if let FileTransformation::Available(registry) = transformation {
                let tag = self.tag.clone();
                let callback: TransformFn = Arc::new(move |html: &str| transform_index(html, &tag));
                match registry.register(TRANSFORMATION_ID, INDEX_PATTERN, callback) {
                    Ok(()) => return InjectionReport::Delegated,
                    Err(e) => warn!("file transformation registration failed: {e:#}"),
                }
            } else {
                debug!("file transformation not available, patching directly");
            }
        }
        let Some(path) = &self.index_path else {
            return InjectionReport::NoWebDir;
        };
        patch_file(path, &self.tag).unwrap_or_else(|e| InjectionReport::Failed(format!("{e:#}")))
    }
}

/// After a reload: mounts the tag again when the base path moved, so the served
/// page points at the new script URL. `None` when nothing had to change.
pub fn reinject(
    previous_base: &str,
    settings: &Settings,
    version: &str,
    transformation: &FileTransformation,
) -> Option<InjectionReport> {
    let base = normalize_base_path(&settings.server.base_path);
    if base == normalize_base_path(previous_base) {
        return None;
    }
    info!("base path moved from {previous_base:?} to {base:?}, injecting again");
    Some(InjectionPatcher::new(&base, version, &settings.injection).run(transformation))
}
