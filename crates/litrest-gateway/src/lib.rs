//! litrest gateway
//!
//! A SQLite-fronting HTTP gateway speaking the PostgREST conventions:
//! tables as URLs, filters/projection/ordering/embedding in the query
//! string, JSON bodies for mutations, bearer tokens for identity, and
//! row-level policies deciding visibility.
//!
//! Request flow:
//!
//! ```text
//! routes ─ auth ─ filter ─ schema ─ plan ─ policy ─ emit ─ pool ─ response
//! ```

pub mod auth;
pub mod engine;
pub mod policy;
pub mod pool;
pub mod response;
pub mod routes;
pub mod rpc;
pub mod state;
pub mod telemetry;

pub use routes::build_router;
pub use state::AppState;
