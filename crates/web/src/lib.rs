//! Webhook receiver and health/stats endpoints.

pub mod server;

pub use server::{router, serve, AppState};
