use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State, rejection::JsonRejection},
    http::{HeaderMap, StatusCode, header},
    response::{Html, IntoResponse, Response},
    routing,
};
use rearch::Container;
use serde::Serialize;
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument};
use uuid::Uuid;

use crate::{
    clock::{RequestClock, request_clock_capsule},
    paste_service::{
        CreatePasteError, CreatePastePayload, CreatedPaste, GetPasteError, PasteRestService,
        paste_rest_service_capsule,
    },
};

#[derive(Clone)]
pub struct AppState {
    service: Arc<dyn PasteRestService>,
    clock: RequestClock,
}

impl AppState {
    #[must_use]
    pub fn new(service: Arc<dyn PasteRestService>, clock: RequestClock) -> Self {
        Self { service, clock }
    }

    #[must_use]
    pub fn from_container(container: &Container) -> Self {
        let (service, clock) =
            container.read((paste_rest_service_capsule, request_clock_capsule));
        Self::new(service, clock)
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/pastes", routing::post(create_paste))
        .route("/api/pastes/{id}", routing::get(get_paste))
        .route("/api/healthz", routing::get(healthz))
        .route("/p/{id}", routing::get(paste_page))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
pub struct Error {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
    error_id: String,
}

impl Error {
    fn new(error: &str, error_id: Uuid) -> Self {
        Self {
            error: error.to_owned(),
            details: None,
            error_id: error_id.to_string(),
        }
    }

    fn with_details(error: &str, details: String, error_id: Uuid) -> Self {
        Self {
            details: Some(details),
            ..Self::new(error, error_id)
        }
    }
}

#[derive(Serialize)]
struct Health {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'static str>,
}

fn wants_html(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::ACCEPT)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .any(|value| value.contains("text/html"))
}

fn get_paste_error_response(error: GetPasteError) -> (StatusCode, Json<Error>) {
    let err_uuid = Uuid::new_v4();
    match error {
        GetPasteError::NotFound => (
            StatusCode::NOT_FOUND,
            Json(Error::new("Not found", err_uuid)),
        ),
        GetPasteError::StoreUnavailable(_) => {
            error!(?err_uuid, ?error, "Paste store is unavailable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(Error::new("Database unavailable", err_uuid)),
            )
        }
        GetPasteError::Internal(_) => {
            error!(?err_uuid, ?error, "Encountered an error during a request");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(Error::new("Internal server error", err_uuid)),
            )
        }
    }
}

#[instrument(skip(state, headers, payload))]
async fn create_paste(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<CreatePastePayload>, JsonRejection>,
) -> Result<(StatusCode, Json<CreatedPaste>), (StatusCode, Json<Error>)> {
    let err_uuid = Uuid::new_v4();
    let Json(payload) = payload.map_err(|rejection| {
        info!(?err_uuid, ?rejection, "User submitted a malformed request body");
        (
            StatusCode::BAD_REQUEST,
            Json(Error::with_details(
                "Invalid input",
                rejection.body_text(),
                err_uuid,
            )),
        )
    })?;

    state
        .service
        .create_paste(payload, state.clock.now(&headers))
        .await
        .map(|created| (StatusCode::CREATED, Json(created)))
        .map_err(|error: CreatePasteError| match error {
            CreatePasteError::InvalidInput(details) => {
                info!(?err_uuid, %details, "User submitted a bad request");
                (
                    StatusCode::BAD_REQUEST,
                    Json(Error::with_details("Invalid input", details, err_uuid)),
                )
            }
            CreatePasteError::StoreUnavailable(_) => {
                error!(?err_uuid, ?error, "Paste store is unavailable");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    Json(Error::new("Database unavailable", err_uuid)),
                )
            }
            CreatePasteError::Internal(_) => {
                error!(?err_uuid, ?error, "Encountered an error during a request");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(Error::new("Failed to create paste", err_uuid)),
                )
            }
        })
}

/// Browsers are redirected to the rendered page without counting a view;
/// every other caller consumes one view.
#[instrument(skip(state, headers))]
async fn get_paste(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let now = state.clock.now(&headers);

    if wants_html(&headers) {
        return match state.service.view_paste(&id, now).await {
            Ok(paste) => (
                StatusCode::FOUND,
                [(
                    header::LOCATION,
                    format!("/p/{}?from=api", paste.id.as_str()),
                )],
            )
                .into_response(),
            Err(error) => get_paste_error_response(error).into_response(),
        };
    }

    match state.service.consume_paste(&id, now).await {
        Ok(view) => Json(view).into_response(),
        Err(error) => get_paste_error_response(error).into_response(),
    }
}

#[instrument(skip(state, headers))]
async fn paste_page(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    match state
        .service
        .view_paste(&id, state.clock.now(&headers))
        .await
    {
        Ok(paste) => Html(render_paste_page(&paste.content)).into_response(),
        Err(GetPasteError::NotFound) => {
            (StatusCode::NOT_FOUND, Html(NOT_FOUND_PAGE)).into_response()
        }
        Err(error) => {
            let (status, _) = get_paste_error_response(error);
            (status, Html(UNAVAILABLE_PAGE)).into_response()
        }
    }
}

#[instrument(skip(state))]
async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    match state.service.check_health().await {
        Ok(()) => (
            StatusCode::OK,
            Json(Health {
                ok: true,
                error: None,
            }),
        ),
        Err(err) => {
            error!(?err, "Health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(Health {
                    ok: false,
                    error: Some("Database unavailable"),
                }),
            )
        }
    }
}

const NOT_FOUND_PAGE: &str = "<!DOCTYPE html>
<html lang=\"en\">
<head><meta charset=\"utf-8\"><title>Paste not found</title></head>
<body>
<h1>Paste not found</h1>
<p>This paste does not exist, has expired, or has reached its view limit.</p>
</body>
</html>
";

const UNAVAILABLE_PAGE: &str = "<!DOCTYPE html>
<html lang=\"en\">
<head><meta charset=\"utf-8\"><title>Unavailable</title></head>
<body>
<h1>Something went wrong</h1>
<p>Please try again later.</p>
</body>
</html>
";

fn render_paste_page(content: &str) -> String {
    let mut page = String::from(
        "<!DOCTYPE html>\n<html lang=\"en\">\n\
         <head><meta charset=\"utf-8\"><title>Paste</title></head>\n<body>\n<pre>",
    );
    for c in content.chars() {
        match c {
            '&' => page.push_str("&amp;"),
            '<' => page.push_str("&lt;"),
            '>' => page.push_str("&gt;"),
            '"' => page.push_str("&quot;"),
            '\'' => page.push_str("&#39;"),
            c => page.push(c),
        }
    }
    page.push_str("</pre>\n</body>\n</html>\n");
    page
}
