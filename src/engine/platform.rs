//! Client platform detection and gating.

use regex::Regex;
use std::sync::LazyLock;

use crate::config::ConfigSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Web,
    Desktop,
    Mobile,
    Tv,
}

/// What the page knows about where it runs.
#[derive(Debug, Clone, Default)]
pub struct ClientEnvironment {
    pub user_agent: String,
    /// `navigator.connection.effectiveType`, when exposed.
    pub effective_connection: Option<String>,
    pub save_data: bool,
    /// Session token substituted into local trailer URLs.
    pub access_token: Option<String>,
}

impl ClientEnvironment {
    pub fn with_user_agent(ua: impl Into<String>) -> Self {
        Self {
            user_agent: ua.into(),
            ..Self::default()
        }
    }

    pub fn platform(&self) -> Platform {
        detect(&self.user_agent)
    }

    pub fn low_bandwidth(&self) -> bool {
        self.save_data
            || matches!(
                self.effective_connection.as_deref(),
                Some("slow-2g" | "2g")
            )
    }
}

static TV: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)smart-?tv|\btv\b|tizen|web0s|webos.*tv|android tv|\baft[a-z]|crkey|bravia|roku")
        .expect("static tv pattern")
});

static MOBILE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)android|webos|iphone|ipad|ipod|blackberry|iemobile|opera mini|mobile")
        .expect("static mobile pattern")
});

static DESKTOP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)jellyfinmediaplayer|jellyfin media player|electron|qtwebengine")
        .expect("static desktop pattern")
});

/// TV tokens are checked first: many TV agents also carry `Android`.
pub fn detect(user_agent: &str) -> Platform {
    if TV.is_match(user_agent) {
        Platform::Tv
    } else if MOBILE.is_match(user_agent) {
        Platform::Mobile
    } else if DESKTOP.is_match(user_agent) {
        Platform::Desktop
    } else {
        Platform::Web
    }
}

/// Why the engine stays inert, if it does.
pub fn gate(config: &ConfigSnapshot, env: &ClientEnvironment) -> Option<String> {
    if !config.enabled {
        return Some("previews are disabled".into());
    }
    let platform = env.platform();
    let allowed = match platform {
        Platform::Web => config.platforms.enable_on_web,
        Platform::Desktop => config.platforms.enable_on_desktop,
        Platform::Mobile => config.platforms.enable_on_mobile,
        Platform::Tv => config.platforms.enable_on_tv,
    };
    if !allowed {
        return Some(format!("previews are disabled on {platform:?}"));
    }
    if config.disable_on_low_bandwidth && env.low_bandwidth() {
        return Some("low bandwidth connection".into());
    }
    None
}
