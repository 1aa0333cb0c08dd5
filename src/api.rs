//! HTTP surface the browser talks to.

use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::{
    any::Any,
    io::ErrorKind,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, PoisonError, RwLock,
    },
};
use tower_http::{catch_panic::CatchPanicLayer, services::ServeDir};
use tracing::{debug, error};

use crate::config::{normalize_base_path, Settings};
use crate::descriptor::{describe, TrailerDescriptor};
use crate::injection::TransformRegistry;
use crate::library::Library;
use crate::script;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

// ------------------------- State -------------------------

/// Shared by every handler. Settings and library are swapped whole on reload.
pub struct AppState {
    settings: RwLock<Arc<Settings>>,
    library: RwLock<Arc<Library>>,
    transforms: Option<Arc<TransformRegistry>>,
}

impl AppState {
    pub fn new(settings: Settings, library: Library) -> Self {
        Self {
            settings: RwLock::new(Arc::new(settings)),
            library: RwLock::new(Arc::new(library)),
            transforms: None,
        }
    }

    /// Serve the web client and rewrite its files through `registry`.
    #[must_use]
    pub fn with_transforms(mut self, registry: Arc<TransformRegistry>) -> Self {
        self.transforms = Some(registry);
        self
    }

    pub fn settings(&self) -> Arc<Settings> {
        self.settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn library(&self) -> Arc<Library> {
        self.library
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn reload(&self, settings: Settings, library: Library) {
        *self.settings.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(settings);
        *self.library.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(library);
    }

    pub fn base_path(&self) -> String {
        normalize_base_path(&self.settings().server.base_path)
    }
}

// ------------------------- Errors -------------------------

#[derive(Debug)]
pub enum ApiError {
    Disabled,
    NotFound,
    Internal(anyhow::Error),
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    message: String,
    status_code: u16,
    request_id: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let request_id = format!("{:08x}", NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed));
        let (status, message) = match self {
            ApiError::Disabled => (StatusCode::NOT_FOUND, "trailer preview is disabled".to_string()),
            ApiError::NotFound => (StatusCode::NOT_FOUND, "not found".to_string()),
            ApiError::Internal(e) => {
                // details stay in the log
                error!(request_id = %request_id, "request failed: {e:#}");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal server error".to_string())
            }
        };
        let body = ErrorBody {
            message,
            status_code: status.as_u16(),
            request_id,
        };
        (status, Json(body)).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        Self::Internal(e)
    }
}

fn panic_response(panic: Box<dyn Any + Send + 'static>) -> Response {
    let what = panic
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    ApiError::Internal(anyhow::anyhow!("handler panicked: {what}")).into_response()
}

// ------------------------- Routes -------------------------

pub fn router(state: Arc<AppState>) -> Router {
    let mut app = Router::new()
        .route("/TrailerPreview/ClientScript", get(client_script))
        .route("/TrailerPreview/TrailerInfo/:item_id", get(trailer_info))
        .route("/TrailerPreview/Status", get(status))
        .route("/TrailerPreview/Configuration", get(configuration));

    if let (Some(_), Some(dir)) = (&state.transforms, state.settings().injection.web_dir()) {
        let web = Router::new()
            .route("/", get(web_index))
            .route("/index.html", get(web_index))
            .fallback_service(ServeDir::new(dir));
        app = app.nest("/web", web);
    }

    app.layer(CatchPanicLayer::custom(panic_response))
        .with_state(state)
}

/// GET /TrailerPreview/ClientScript
async fn client_script(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let settings = state.settings();
    if !settings.preview.enabled {
        return Err(ApiError::Disabled);
    }
    let bundle = script::build(&settings.preview, &state.base_path(), VERSION)?;
    let etag = HeaderValue::from_str(&bundle.etag)
        .map_err(|e| ApiError::Internal(anyhow::anyhow!("etag header: {e}")))?;

    let fresh = headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| script::etag_matches(v, &bundle.etag));
    if fresh {
        return Ok((StatusCode::NOT_MODIFIED, [(header::ETAG, etag)]).into_response());
    }

    Ok((
        [
            (
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/javascript; charset=utf-8"),
            ),
            (header::CACHE_CONTROL, HeaderValue::from_static("no-cache")),
            (header::ETAG, etag),
        ],
        bundle.body,
    )
        .into_response())
}

/// GET /TrailerPreview/TrailerInfo/:item_id
async fn trailer_info(
    State(state): State<Arc<AppState>>,
    Path(item_id): Path<String>,
) -> Result<Response, ApiError> {
    let library = state.library();
    match library.item(&item_id).await? {
        Some(item) => {
            let descriptor = describe(&item, &state.base_path());
            debug!(item = %item_id, available = descriptor.is_available, "trailer info");
            Ok(Json(descriptor).into_response())
        }
        None => {
            debug!(item = %item_id, "trailer info for unknown item");
            Ok((
                StatusCode::NOT_FOUND,
                Json(TrailerDescriptor::unavailable(item_id)),
            )
                .into_response())
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    pub enabled: bool,
    pub hover_delay_ms: u64,
    pub version: &'static str,
}

/// GET /TrailerPreview/Status
async fn status(State(state): State<Arc<AppState>>) -> Json<Status> {
    let settings = state.settings();
    Json(Status {
        enabled: settings.preview.enabled,
        hover_delay_ms: settings.preview.timing.hover_delay_ms,
        version: VERSION,
    })
}

/// GET /TrailerPreview/Configuration
async fn configuration(State(state): State<Arc<AppState>>) -> Response {
    Json(state.settings().preview.clone()).into_response()
}

/// GET /web/ and /web/index.html, rewritten by the registered transforms.
async fn web_index(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    let settings = state.settings();
    let (Some(registry), Some(path)) = (&state.transforms, settings.injection.index_path()) else {
        return Err(ApiError::NotFound);
    };
    let html = match tokio::fs::read_to_string(&path).await {
        Ok(html) => html,
        Err(e) if e.kind() == ErrorKind::NotFound => return Err(ApiError::NotFound),
        Err(e) => {
            return Err(ApiError::Internal(
                anyhow::Error::new(e).context(format!("reading {}", path.display())),
            ))
        }
    };
    let html = registry.apply(&settings.injection.index_file, &html);
    Ok(([(header::CACHE_CONTROL, "no-cache")], Html(html)).into_response())
}
