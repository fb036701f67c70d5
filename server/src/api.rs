use actix_web::{
    get,
    http::{header, StatusCode},
    route,
    web::{self, Json},
    HttpRequest, HttpResponse, Result,
};
use dicebox_session::models::SessionId;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::task::spawn_local;

use crate::ws::{handler, registry::SessionRegistry};

/// Why a session request never reached a coordinator.
///
/// All three are terminal for the attempt; callers must correct the request
/// before retrying. The response bodies are exact, stable strings.
#[derive(Debug, Error)]
pub enum SessionRouteError {
    /// Path carries no identifier segment
    #[error("Invalid session URL")]
    InvalidSessionUrl,
    /// Identifier fails the six-alphanumeric shape check
    #[error("Invalid session ID format")]
    InvalidSessionIdFormat,
    /// Request is not a protocol upgrade
    #[error("Expected WebSocket")]
    ExpectedWebsocket,
}

impl actix_web::ResponseError for SessionRouteError {
    fn status_code(&self) -> StatusCode {
        StatusCode::BAD_REQUEST
    }
}

#[route("/health", method = "GET")]
pub async fn health_endpoint() -> Result<Json<Value>> {
    Ok(Json(json!({"healthy": true})))
}

/// Single entry point for all session traffic: `/ws/<sessionId>`.
///
/// The identifier shape is checked before any coordinator lookup, and the
/// request must be a WebSocket upgrade. On success the coordinator for the
/// (case-preserved) identifier is resolved or created and the connection
/// handler is spawned; the upgrade response is returned unmodified.
#[get("/ws{tail:.*}")]
pub async fn websocket(
    req: HttpRequest,
    stream: web::Payload,
    path: web::Path<String>,
    registry: web::Data<SessionRegistry>,
) -> Result<HttpResponse, actix_web::Error> {
    let tail = path.into_inner();
    let segment = tail
        .strip_prefix('/')
        .filter(|segment| !segment.is_empty() && !segment.contains('/'))
        .ok_or(SessionRouteError::InvalidSessionUrl)?;

    let session_id =
        SessionId::parse(segment).map_err(|_| SessionRouteError::InvalidSessionIdFormat)?;

    if !is_websocket_upgrade(&req) {
        return Err(SessionRouteError::ExpectedWebsocket.into());
    }

    // create the coordinator eagerly so store failures surface before the
    // upgrade completes
    registry
        .get_or_create(&session_id)
        .await
        .map_err(actix_web::error::ErrorInternalServerError)?;

    let (res, session, msg_stream) = actix_ws::handle(&req, stream)?;

    // spawn websocket handler (and don't await it) so that the response is returned immediately
    spawn_local(handler::session_ws(
        (**registry).clone(),
        session_id,
        session,
        msg_stream,
    ));

    Ok(res)
}

fn is_websocket_upgrade(req: &HttpRequest) -> bool {
    req.headers()
        .get(header::UPGRADE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.eq_ignore_ascii_case("websocket"))
}
