//! API server for BuildIt job dispatch.
//!
//! Front-ends submit, query and cancel build jobs over HTTP.

pub mod auth;
pub mod error;
pub mod routes;
pub mod state;

pub use state::AppState;
