use axum::{
    http::StatusCode,
    routing::{get, put},
    Json, Router,
};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tower_http::trace::TraceLayer;

use super::{users::UserRequest, ServiceError};

mod users;

#[derive(Clone)]
pub struct AppState {
    pub user_channel: mpsc::Sender<UserRequest>,
}

pub type ErrorResponse = (StatusCode, Json<Value>);
pub type HttpResult<T> = Result<(StatusCode, Json<T>), ErrorResponse>;

fn error_response(error: &ServiceError) -> ErrorResponse {
    let (status, kind) = match error {
        ServiceError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
        ServiceError::InvalidArgument(_) => (StatusCode::BAD_REQUEST, "invalid_argument"),
        ServiceError::InvalidOperation(_) => {
            (StatusCode::UNPROCESSABLE_ENTITY, "invalid_operation")
        }
        ServiceError::Conflict(_) => (StatusCode::CONFLICT, "conflict"),
        ServiceError::Repository(_, _) | ServiceError::Communication(_, _) => {
            log::error!("Request failed: {}", error);
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({
                    "error": "internal",
                    "details": "Internal server error."
                })),
            );
        }
    };

    let details = match error {
        ServiceError::NotFound(what) => format!("{} not found", what),
        ServiceError::InvalidArgument(message)
        | ServiceError::InvalidOperation(message)
        | ServiceError::Conflict(message) => message.clone(),
        _ => error.to_string(),
    };

    (status, Json(json!({ "error": kind, "details": details })))
}

/// Extractor rejections (bad query strings, malformed bodies) in the same
/// shape as every other error.
fn rejection_response(rejection: impl std::fmt::Display) -> ErrorResponse {
    error_response(&ServiceError::InvalidArgument(rejection.to_string()))
}

/// Sends a request to the user service and waits for its reply.
async fn dispatch<T>(
    channel: &mpsc::Sender<UserRequest>,
    request: impl FnOnce(oneshot::Sender<Result<T, ServiceError>>) -> UserRequest,
) -> Result<T, ErrorResponse> {
    let (response_tx, response_rx) = oneshot::channel();

    if let Err(e) = channel.send(request(response_tx)).await {
        return Err(error_response(&ServiceError::Communication(
            "HTTP => User".to_string(),
            e.to_string(),
        )));
    }

    match response_rx.await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(service_error)) => Err(error_response(&service_error)),
        Err(e) => Err(error_response(&ServiceError::Communication(
            "User => HTTP".to_string(),
            e.to_string(),
        ))),
    }
}

fn router(user_channel: mpsc::Sender<UserRequest>) -> Router {
    let app_state = AppState { user_channel };

    Router::new()
        .route("/network", get(users::get_network))
        .route("/network/missing", get(users::get_missing_referrals))
        .route("/users/search", get(users::search_users))
        .route("/users/{id}", get(users::get_user))
        .route("/users/{id}/sponsor-history", get(users::get_sponsor_history))
        .route(
            "/users/{id}/sponsor",
            put(users::reassign_sponsor).post(users::resolve_missing_referral),
        )
        .route("/health", get(|| async { "OK" }))
        .with_state(app_state)
        .layer(TraceLayer::new_for_http())
}

pub async fn start_http_server(
    listen: &str,
    user_channel: mpsc::Sender<UserRequest>,
) -> Result<(), anyhow::Error> {
    let app = router(user_channel);

    let listener = tokio::net::TcpListener::bind(listen).await?;
    log::info!("Listening on {}", listener.local_addr()?);

    axum::serve(listener, app).await?;

    Ok(())
}
