//! Route table and middleware.

use axum::{
    routing::{get, patch},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::handlers::{self, AppState};

pub const API_PREFIX: &str = "/api/todos";

/// Builds the full application router.
pub fn app(state: AppState) -> Router {
    // The frontend dev server runs on its own origin.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handlers::health))
        .nest(API_PREFIX, todo_routes())
        .fallback(handlers::not_found)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

fn todo_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(handlers::list_todos).post(handlers::create_todo))
        .route("/stats", get(handlers::todo_stats))
        .route(
            "/:id",
            get(handlers::get_todo)
                .put(handlers::update_todo)
                .delete(handlers::delete_todo),
        )
        .route("/:id/toggle", patch(handlers::toggle_todo))
}
