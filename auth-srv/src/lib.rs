//! ESGF login service
//!
//! Serves the `/esg-orp/home.htm` login endpoint the THREDDS authentication
//! filter redirects to, runs the OAuth2 login against the user's identity
//! provider and hands back a signed session cookie.

pub mod errors;
pub mod handlers;
pub mod observability;
pub mod state;
pub mod views;

use axum::{Router, middleware, routing::get};
use handlers::{CALLBACK_PATH, HOME_PATH};
use observability::observability_middleware;
use state::AppState;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route(
            HOME_PATH,
            get(handlers::home_get).post(handlers::home_post),
        )
        .route(CALLBACK_PATH, get(handlers::callback))
        .route("/thredds", get(handlers::thredds))
        .route("/thredds/{*path}", get(handlers::thredds))
        .route("/health", get(handlers::health_check))
        .layer(middleware::from_fn(observability_middleware))
        .with_state(state)
}
