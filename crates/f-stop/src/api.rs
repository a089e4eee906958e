use crate::assemble::{assemble, unsatisfiable};
use crate::{AssetClass, AssetError, CapabilityRegistry};
use axum::extract::{MatchedPath, Path, Query, State};
use axum::http::{header, HeaderMap, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use std::sync::Arc;
use uuid::Uuid;

/// App is the state shared by all handlers of the HTTP surface.
pub struct App {
    pub registry: CapabilityRegistry,
    /// Maximum number of ranges served of a single request.
    pub max_ranges: usize,
}

/// Error of an HTTP request, which is either a failure of the request
/// itself or a rejection of its malformed parameters.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Asset(#[from] AssetError),
    #[error("{0}")]
    BadRequest(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Asset(err) => err.into_response(),
            ApiError::BadRequest(error) => {
                tracing::debug!(%error, "rejecting malformed request");
                (
                    StatusCode::BAD_REQUEST,
                    axum::Json(serde_json::json!({ "error": error })),
                )
                    .into_response()
            }
        }
    }
}

/// Build the Router of the HTTP surface, serving from `app`.
pub fn build_router(app: Arc<App>) -> Router {
    Router::new()
        .route("/CAPS/HTT/TEST", get(test))
        .route("/CAPS/HTT/ADDCAP/:admin_token/:cap_id", get(add_cap))
        .route(
            "/CAPS/HTT/ADDCAP/:admin_token/:cap_id/:bandwidth",
            get(add_cap_with_limit),
        )
        .route("/CAPS/HTT/REMCAP/:admin_token/:cap_id", get(remove_cap))
        .route("/CAPS/HTT/PAUSE/:admin_token/:cap_id", get(pause_cap))
        .route("/CAPS/HTT/RESUME/:admin_token/:cap_id", get(resume_cap))
        .route("/CAPS/HTT/LIMIT/:admin_token/:cap_id", get(limit_cap))
        .route(
            "/CAPS/HTT/LIMIT/:admin_token/:cap_id/:bandwidth",
            get(limit_cap_with_limit),
        )
        .route("/CAPS/HTT/:cap_id", get(fetch_asset))
        .with_state(app)
        .layer(
            tower_http::trace::TraceLayer::new_for_http().make_span_with(request_span),
        )
}

// Admin routes carry the admin token within their path, so request spans
// record the matched route template rather than the request URI.
fn request_span(request: &Request<axum::body::Body>) -> tracing::Span {
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(MatchedPath::as_str)
        .unwrap_or("<unmatched>");

    tracing::debug_span!("request", method = %request.method(), route)
}

async fn test() -> &'static str {
    "OK"
}

fn parse_id(name: &str, value: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(value)
        .map_err(|err| ApiError::BadRequest(format!("invalid {name} {value:?}: {err}")))
}

fn parse_bandwidth(value: Option<&str>) -> Result<u32, ApiError> {
    let Some(value) = value else {
        return Ok(0);
    };
    value
        .parse::<u32>()
        .map_err(|err| ApiError::BadRequest(format!("invalid bandwidth {value:?}: {err}")))
}

// Map the outcome of an admin operation to its response.
fn applied(operation: &str, result: Result<bool, AssetError>) -> Result<StatusCode, ApiError> {
    if result? {
        Ok(StatusCode::OK)
    } else {
        Err(ApiError::BadRequest(format!("{operation} was not applied")))
    }
}

async fn add_cap(
    State(app): State<Arc<App>>,
    Path((admin_token, cap_id)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    add(&app, &admin_token, &cap_id, None)
}

async fn add_cap_with_limit(
    State(app): State<Arc<App>>,
    Path((admin_token, cap_id, bandwidth)): Path<(String, String, String)>,
) -> Result<StatusCode, ApiError> {
    add(&app, &admin_token, &cap_id, Some(&bandwidth))
}

fn add(
    app: &App,
    admin_token: &str,
    cap_id: &str,
    bandwidth: Option<&str>,
) -> Result<StatusCode, ApiError> {
    let cap_id = parse_id("capability id", cap_id)?;
    let bandwidth = parse_bandwidth(bandwidth)?;
    applied(
        "ADDCAP",
        app.registry.add_cap(admin_token, cap_id, bandwidth),
    )
}

async fn remove_cap(
    State(app): State<Arc<App>>,
    Path((admin_token, cap_id)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    let cap_id = parse_id("capability id", &cap_id)?;
    applied("REMCAP", app.registry.remove_cap(&admin_token, cap_id))
}

async fn pause_cap(
    State(app): State<Arc<App>>,
    Path((admin_token, cap_id)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    let cap_id = parse_id("capability id", &cap_id)?;
    applied("PAUSE", app.registry.pause_cap(&admin_token, cap_id))
}

async fn resume_cap(
    State(app): State<Arc<App>>,
    Path((admin_token, cap_id)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    let cap_id = parse_id("capability id", &cap_id)?;
    applied("RESUME", app.registry.resume_cap(&admin_token, cap_id))
}

async fn limit_cap(
    State(app): State<Arc<App>>,
    Path((admin_token, cap_id)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    limit(&app, &admin_token, &cap_id, None)
}

async fn limit_cap_with_limit(
    State(app): State<Arc<App>>,
    Path((admin_token, cap_id, bandwidth)): Path<(String, String, String)>,
) -> Result<StatusCode, ApiError> {
    limit(&app, &admin_token, &cap_id, Some(&bandwidth))
}

fn limit(
    app: &App,
    admin_token: &str,
    cap_id: &str,
    bandwidth: Option<&str>,
) -> Result<StatusCode, ApiError> {
    let cap_id = parse_id("capability id", cap_id)?;
    let bandwidth = parse_bandwidth(bandwidth)?;
    applied(
        "LIMIT",
        app.registry.limit_cap(admin_token, cap_id, bandwidth),
    )
}

/// Query parameters of an asset request, which selects exactly one asset.
#[derive(Debug, Default, serde::Deserialize)]
pub struct AssetQuery {
    pub texture_id: Option<String>,
    pub mesh_id: Option<String>,
}

impl AssetQuery {
    /// The class and id of the selected asset. Nil ids select nothing.
    pub fn selection(&self) -> Result<(AssetClass, Uuid), ApiError> {
        let texture = self
            .texture_id
            .as_deref()
            .map(|id| parse_id("texture_id", id))
            .transpose()?
            .filter(|id| !id.is_nil());
        let mesh = self
            .mesh_id
            .as_deref()
            .map(|id| parse_id("mesh_id", id))
            .transpose()?
            .filter(|id| !id.is_nil());

        match (texture, mesh) {
            (Some(id), None) => Ok((AssetClass::Texture, id)),
            (None, Some(id)) => Ok((AssetClass::Mesh, id)),
            (Some(_), Some(_)) => Err(ApiError::BadRequest(
                "only one of texture_id or mesh_id may be requested".to_string(),
            )),
            (None, None) => Err(ApiError::BadRequest(
                "one of texture_id or mesh_id is required".to_string(),
            )),
        }
    }
}

#[tracing::instrument(skip(app, headers))]
async fn fetch_asset(
    State(app): State<Arc<App>>,
    Path(cap_id): Path<String>,
    Query(query): Query<AssetQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let cap_id = parse_id("capability id", &cap_id)?;
    let (class, asset_id) = query.selection()?;

    let asset = app.registry.request_asset(class, cap_id, asset_id).await?;
    let length = asset.data.len() as u64;

    let range = match headers.get(header::RANGE).map(|value| value.to_str()) {
        None => None,
        Some(Ok(range)) => Some(range),
        Some(Err(_)) => {
            let err = byte_ranges::Error::Format("header is not visible ASCII".to_string());
            return Ok(unsatisfiable(err.into(), length));
        }
    };

    match byte_ranges::resolve(range, length, app.max_ranges) {
        Ok(spans) => Ok(assemble(&asset, class, spans.as_deref()).into_response()),
        Err(err) => {
            tracing::debug!(%err, ?range, length, "range is not satisfiable");
            Ok(unsatisfiable(err.into(), length))
        }
    }
}
