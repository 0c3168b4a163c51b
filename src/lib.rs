pub mod api;
pub mod audit;
pub mod blocklist;
pub mod cache;
pub mod database;
pub mod defense;
pub mod env;
pub mod error;
pub mod middleware;
pub mod parameters;
pub mod response;
pub mod session;
pub mod state;
pub mod tools;
pub mod views;

pub use error::{Error, FailureKind, Result};
pub use state::AppState;

use std::time::Duration;

use axum::{
    error_handling::HandleErrorLayer,
    http::{header, HeaderValue, Method, StatusCode},
    middleware as axum_middleware,
    routing::get,
    Router,
};
use tower::{BoxError, ServiceBuilder};
use tower_http::{catch_panic::CatchPanicLayer, cors::CorsLayer, trace::TraceLayer};

use defense::client_defense_middleware;
use middleware::{
    auth_middleware, error_containment_middleware, panic_response, session_timeout_middleware,
};
use session::session_middleware;

/// The full application: site views and admin API behind the defense
/// pipeline.
///
/// Layers run outermost first: tracing, error containment, panic capture,
/// session resolution, client defense, session timeout, view timeout.
pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(HeaderValue::from_static("*"))
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::OPTIONS])
        .allow_headers(vec![
            header::CONTENT_TYPE,
            header::ACCEPT,
            header::AUTHORIZATION,
        ]);

    let api_routes = api::router()
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ))
        .layer(cors);

    let timeouts = ServiceBuilder::new()
        .layer(HandleErrorLayer::new(|error: BoxError| async move {
            if error.is::<tower::timeout::error::Elapsed>() {
                Ok(StatusCode::REQUEST_TIMEOUT)
            } else {
                Err((
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("Unhandled internal error: {error}"),
                ))
            }
        }))
        .timeout(Duration::from_secs(10))
        .into_inner();

    Router::new()
        .merge(views::router(&state.env.routes))
        .nest("/api", api_routes)
        .route("/health", get(api::health))
        .fallback(views::not_found)
        // Bounds the view only, never the defense layers.
        .layer(timeouts)
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            session_timeout_middleware,
        ))
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            client_defense_middleware,
        ))
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            session_middleware,
        ))
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            error_containment_middleware,
        ))
        .layer(
            TraceLayer::new_for_http().on_failure(|error, _latency, _span: &tracing::Span| {
                tracing::error!(error = %error);
            }),
        )
        .with_state(state)
}
