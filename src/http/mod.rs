//! HTTP API and the websocket push channel.
//!
//! Thin axum handlers over the store, catalog, detector and bus; request
//! and response shapes live in [`dto`], the uniform error envelope in
//! [`error`].

pub mod dto;
pub mod error;
pub mod handlers;
pub mod router;
pub mod state;
pub mod ws;

pub use error::{ApiError, AppError};
pub use router::create_router;
pub use state::AppState;
