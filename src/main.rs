//! trailer-previewd: serves the hover-preview bundle and trailer lookups.
//! - At startup the bundle is mounted into the host's `index.html` once, through the
//!   delegated transform when the daemon serves the web client itself, by patching the
//!   file otherwise.
//! - SIGHUP re-reads the config file; a broken file keeps the running config. A moved
//!   base path mounts the script tag again.
//!
//! Notes:
//! - No unsafe. Locks are never held across awaits.

#![deny(unsafe_code)]
#![deny(clippy::all, clippy::pedantic, clippy::nursery, clippy::perf)]
#![allow(
    clippy::module_name_repetitions,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::too_many_lines
)]

use anyhow::{Context, Result};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::{
    net::TcpListener,
    signal::unix::{signal, SignalKind},
    task,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use trailer_preview::{
    api::{self, AppState, VERSION},
    config::{self, normalize_base_path, Settings},
    injection::{self, FileTransformation, InjectionPatcher, TransformRegistry},
    library::{CatalogLibrary, Library},
};

// ------------------------- Setup -------------------------

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// A library that fails to load leaves the API up with an empty catalog.
fn open_library(settings: &Settings) -> Library {
    Library::from_settings(&settings.library).unwrap_or_else(|e| {
        error!("library unavailable, every lookup will miss: {e:#}");
        Library::Catalog(CatalogLibrary::default())
    })
}

fn file_transformation(settings: &Settings) -> FileTransformation {
    if settings.server.serve_web && settings.injection.web_dir().is_some() {
        FileTransformation::Available(Arc::new(TransformRegistry::default()))
    } else {
        FileTransformation::Unavailable
    }
}

// ------------------------- Reload -------------------------

async fn reload_on_hangup(state: Arc<AppState>, path: PathBuf, transformation: FileTransformation) {
    let mut hup = match signal(SignalKind::hangup()) {
        Ok(s) => s,
        Err(e) => {
            warn!("cannot install SIGHUP handler, reload disabled: {e}");
            return;
        }
    };
    while hup.recv().await.is_some() {
        let p = path.clone();
        let loaded = task::spawn_blocking(move || reload(&p)).await;
        match loaded {
            Ok(Ok((settings, library))) => {
                let previous_base = state.base_path();
                state.reload(settings, library);
                info!("reloaded {}", path.display());
                let settings = state.settings();
                let transformation = transformation.clone();
                let _ = task::spawn_blocking(move || {
                    injection::reinject(&previous_base, &settings, VERSION, &transformation)
                })
                .await;
            }
            Ok(Err(e)) => warn!("reload failed, keeping previous config: {e:#}"),
            Err(e) => warn!("reload task failed: {e}"),
        }
    }
}

fn reload(path: &Path) -> Result<(Settings, Library)> {
    let settings = config::load_settings(path)?;
    let library = Library::from_settings(&settings.library)?;
    Ok((settings, library))
}

// ------------------------- Main -------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let path = config::config_path().context("no config directory")?;
    let loaded = config::load_settings(&path);
    let level = loaded
        .as_ref()
        .map_or_else(|_| "info".to_string(), |s| s.logging.level.clone());
    init_tracing(&level);
    let settings = loaded?;
    info!("trailer-previewd {VERSION}, config {}", path.display());

    let library = open_library(&settings);
    let transformation = file_transformation(&settings);

    let base_path = normalize_base_path(&settings.server.base_path);
    let report = InjectionPatcher::new(&base_path, VERSION, &settings.injection).run(&transformation);
    if !report.script_reachable() {
        info!("configuration and API stay available without the injected script");
    }

    let listen = settings.server.listen.clone();
    let mut state = AppState::new(settings, library);
    if let FileTransformation::Available(registry) = &transformation {
        state = state.with_transforms(registry.clone());
    }
    let state = Arc::new(state);

    task::spawn(reload_on_hangup(state.clone(), path, transformation));

    let listener = TcpListener::bind(&listen)
        .await
        .with_context(|| format!("binding {listen}"))?;
    info!("listening on http://{listen}");
    axum::serve(listener, api::router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("serving http")?;

    Ok(())
}
