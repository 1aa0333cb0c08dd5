//! Daemon settings (`config.toml`) and the per-page [`ConfigSnapshot`].
//!
//! The snapshot is the only part shipped to the browser; everything else stays
//! on the server side.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};
use tracing::warn;

// ------------------------- Daemon settings -------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: Server,
    #[serde(default)]
    pub library: LibrarySettings,
    #[serde(default)]
    pub injection: Injection,
    #[serde(default)]
    pub logging: Logging,
    #[serde(default)]
    pub preview: ConfigSnapshot,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Server {
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Host base URL, e.g. `/jellyfin`. Normalised by [`normalize_base_path`].
    #[serde(default)]
    pub base_path: String,
    /// Serve `injection.web_dir` under `/web/` and rewrite `index.html` in memory.
    #[serde(default)]
    pub serve_web: bool,
}
fn default_listen() -> String {
    "127.0.0.1:8097".into()
}
impl Default for Server {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            base_path: String::new(),
            serve_web: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum LibrarySettings {
    Catalog {
        #[serde(default)]
        path: Option<String>,
    },
    Jellyfin {
        url: String,
        api_key: String,
        #[serde(default = "d5000")]
        timeout_ms: u64,
    },
}
impl Default for LibrarySettings {
    fn default() -> Self {
        Self::Catalog { path: None }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InjectionMode {
    /// Delegated transform when available, direct patch otherwise.
    Auto,
    Direct,
    Off,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Injection {
    #[serde(default = "mode_auto")]
    pub mode: InjectionMode,
    #[serde(default)]
    pub web_dir: Option<String>,
    #[serde(default = "default_index")]
    pub index_file: String,
}
fn mode_auto() -> InjectionMode {
    InjectionMode::Auto
}
fn default_index() -> String {
    "index.html".into()
}
impl Default for Injection {
    fn default() -> Self {
        Self {
            mode: InjectionMode::Auto,
            web_dir: None,
            index_file: default_index(),
        }
    }
}
impl Injection {
    pub fn web_dir(&self) -> Option<PathBuf> {
        self.web_dir.as_deref().map(|d| PathBuf::from(expand(d)))
    }

    pub fn index_path(&self) -> Option<PathBuf> {
        self.web_dir().map(|d| d.join(&self.index_file))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Logging {
    #[serde(default = "default_level")]
    pub level: String,
}
fn default_level() -> String {
    "info".into()
}
impl Default for Logging {
    fn default() -> Self {
        Self {
            level: default_level(),
        }
    }
}

// ------------------------- ConfigSnapshot -------------------------

/// Read-only tunables baked into the client bundle once per page load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    #[serde(default = "dtrue")]
    pub enabled: bool,
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub timing: Timing,
    #[serde(default)]
    pub sizing: Sizing,
    #[serde(default)]
    pub position: Position,
    #[serde(default)]
    pub visual: Visual,
    #[serde(default)]
    pub audio: Audio,
    #[serde(default)]
    pub playback: Playback,
    #[serde(default)]
    pub controls: Controls,
    #[serde(default)]
    pub platforms: Platforms,
    #[serde(default)]
    pub cards: Cards,
    #[serde(default = "d1")]
    pub max_concurrent_previews: u32,
    #[serde(default)]
    pub disable_on_low_bandwidth: bool,
}
impl Default for ConfigSnapshot {
    fn default() -> Self {
        Self {
            enabled: true,
            debug: false,
            timing: Timing::default(),
            sizing: Sizing::default(),
            position: Position::default(),
            visual: Visual::default(),
            audio: Audio::default(),
            playback: Playback::default(),
            controls: Controls::default(),
            platforms: Platforms::default(),
            cards: Cards::default(),
            max_concurrent_previews: 1,
            disable_on_low_bandwidth: false,
        }
    }
}

impl ConfigSnapshot {
    /// Clamp every field into its valid range.
    #[must_use]
    pub fn sanitized(mut self) -> Self {
        if self.max_concurrent_previews == 0 {
            warn!("max_concurrent_previews = 0 is invalid, using 1");
            self.max_concurrent_previews = 1;
        }
        self.visual.opacity = clamp_unit(self.visual.opacity);
        self.visual.background_dim.opacity = clamp_unit(self.visual.background_dim.opacity);
        self.audio.volume_percent = self.audio.volume_percent.min(100);
        if let Sizing::Percentage {
            width_percent,
            height_percent,
        } = &mut self.sizing
        {
            *width_percent = (*width_percent).min(100);
            *height_percent = (*height_percent).min(100);
        }
        self
    }

    pub fn max_concurrent(&self) -> usize {
        usize::try_from(self.max_concurrent_previews.max(1)).unwrap_or(1)
    }
}

fn clamp_unit(v: f64) -> f64 {
    if v.is_nan() {
        return 1.0;
    }
    v.clamp(0.0, 1.0)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timing {
    #[serde(default = "d800")]
    pub hover_delay_ms: u64,
    /// 0 keeps the preview open until closed by the user.
    #[serde(default = "d30000")]
    pub preview_duration_ms: u64,
    #[serde(default = "d300")]
    pub fade_in_ms: u64,
    #[serde(default = "d200")]
    pub fade_out_ms: u64,
}
impl Default for Timing {
    fn default() -> Self {
        Self {
            hover_delay_ms: d800(),
            preview_duration_ms: d30000(),
            fade_in_ms: d300(),
            fade_out_ms: d200(),
        }
    }
}
impl Timing {
    pub fn hover_delay(&self) -> Duration {
        Duration::from_millis(self.hover_delay_ms)
    }

    pub fn preview_duration(&self) -> Option<Duration> {
        (self.preview_duration_ms > 0).then(|| Duration::from_millis(self.preview_duration_ms))
    }

    pub fn fade_out(&self) -> Duration {
        Duration::from_millis(self.fade_out_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Sizing {
    Percentage {
        #[serde(default = "d40")]
        width_percent: u32,
        #[serde(default = "d60")]
        height_percent: u32,
    },
    Fixed {
        #[serde(default = "d854")]
        width_px: u32,
        #[serde(default = "d480")]
        height_px: u32,
    },
}
impl Default for Sizing {
    fn default() -> Self {
        Self::Percentage {
            width_percent: d40(),
            height_percent: d60(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Position {
    #[default]
    Center,
    Custom {
        #[serde(default)]
        offset_x: u32,
        #[serde(default)]
        offset_y: u32,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Visual {
    #[serde(default = "one")]
    pub opacity: f64,
    #[serde(default = "d12u32")]
    pub border_radius_px: u32,
    #[serde(default)]
    pub background_dim: BackgroundDim,
    #[serde(default = "dtrue")]
    pub background_blur: bool,
    #[serde(default = "dtrue")]
    pub show_title: bool,
}
impl Default for Visual {
    fn default() -> Self {
        Self {
            opacity: 1.0,
            border_radius_px: d12u32(),
            background_dim: BackgroundDim::default(),
            background_blur: true,
            show_title: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackgroundDim {
    #[serde(default = "dtrue")]
    pub enabled: bool,
    #[serde(default = "dim_opacity")]
    pub opacity: f64,
}
impl Default for BackgroundDim {
    fn default() -> Self {
        Self {
            enabled: true,
            opacity: dim_opacity(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Audio {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "dtrue")]
    pub muted_by_default: bool,
    #[serde(default = "d30u32")]
    pub volume_percent: u32,
}
impl Default for Audio {
    fn default() -> Self {
        Self {
            enabled: false,
            muted_by_default: true,
            volume_percent: d30u32(),
        }
    }
}
impl Audio {
    /// Effective start state for inline media.
    pub fn starts_muted(&self) -> bool {
        !self.enabled || self.muted_by_default
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Playback {
    #[serde(default = "dtrue")]
    pub autoplay: bool,
    #[serde(default = "dtrue", rename = "loop")]
    pub looped: bool,
    #[serde(default = "quality_auto")]
    pub quality: String,
}
impl Default for Playback {
    fn default() -> Self {
        Self {
            autoplay: true,
            looped: true,
            quality: quality_auto(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Controls {
    #[serde(default = "dtrue")]
    pub show_progress_bar: bool,
    #[serde(default = "dtrue")]
    pub show_close_button: bool,
    #[serde(default = "dtrue")]
    pub show_mute_button: bool,
}
impl Default for Controls {
    fn default() -> Self {
        Self {
            show_progress_bar: true,
            show_close_button: true,
            show_mute_button: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platforms {
    #[serde(default = "dtrue")]
    pub enable_on_web: bool,
    #[serde(default = "dtrue")]
    pub enable_on_desktop: bool,
    // Off by default: the mobile apps handle hover badly.
    #[serde(default)]
    pub enable_on_mobile: bool,
    #[serde(default = "dtrue")]
    pub enable_on_tv: bool,
}
impl Default for Platforms {
    fn default() -> Self {
        Self {
            enable_on_web: true,
            enable_on_desktop: true,
            enable_on_mobile: false,
            enable_on_tv: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cards {
    /// `data-type` values allowed to arm a preview; empty allows every card.
    #[serde(default)]
    pub item_types: Vec<String>,
}

fn dtrue() -> bool {
    true
}
fn one() -> f64 {
    1.0
}
fn dim_opacity() -> f64 {
    0.7
}
fn quality_auto() -> String {
    "auto".into()
}
fn d1() -> u32 {
    1
}
fn d12u32() -> u32 {
    12
}
fn d30u32() -> u32 {
    30
}
fn d40() -> u32 {
    40
}
fn d60() -> u32 {
    60
}
fn d480() -> u32 {
    480
}
fn d854() -> u32 {
    854
}
fn d200() -> u64 {
    200
}
fn d300() -> u64 {
    300
}
fn d800() -> u64 {
    800
}
fn d5000() -> u64 {
    5000
}
fn d30000() -> u64 {
    30_000
}

// ------------------------- Utils -------------------------

/// `"/jellyfin/"` → `"/jellyfin"`, `"/"` or `""` → `""`.
pub fn normalize_base_path(raw: &str) -> String {
    let trimmed = raw.trim().trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("/{trimmed}")
    }
}

pub fn expand(path: &str) -> String {
    let mut s = path.to_string();
    if let Some(home) = dirs::home_dir() {
        s = s.replace("$HOME", home.to_string_lossy().as_ref());
    }
    if let Some(cfg) = dirs::config_dir() {
        s = s.replace("$XDG_CONFIG_HOME", cfg.to_string_lossy().as_ref());
    }
    if let Some(data) = dirs::data_dir() {
        s = s.replace("$XDG_DATA_HOME", data.to_string_lossy().as_ref());
    }
    s
}

// ------------------------- Config I/O -------------------------

pub fn config_path() -> Option<PathBuf> {
    if let Ok(p) = std::env::var("TRAILER_PREVIEW_CONFIG") {
        return Some(PathBuf::from(expand(&p)));
    }
    dirs::config_dir().map(|d| d.join("trailer-preview").join("config.toml"))
}

pub fn parse_settings(text: &str) -> Result<Settings> {
    let mut settings: Settings = toml::from_str(text).context("parsing toml")?;
    settings.preview = settings.preview.sanitized();
    Ok(settings)
}

/// A missing file is not an error: the daemon keeps serving its configuration
/// surface with defaults.
pub fn load_settings(path: &Path) -> Result<Settings> {
    if !path.exists() {
        warn!("config {} not found, using defaults", path.display());
        return Ok(Settings::default());
    }
    let text =
        fs::read_to_string(path).with_context(|| format!("reading config {}", path.display()))?;
    parse_settings(&text).with_context(|| format!("loading config {}", path.display()))
}
