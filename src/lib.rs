//! JSON API for a simple todo list backed by SQLite.

pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod validation;

pub use db::Database;
pub use handlers::AppState;
pub use routes::app;
