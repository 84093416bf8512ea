//! HTTP server exposing the config cache and asset preloader.
//!
//! - [`api`]: Request/response types and route handlers
//! - [`streaming`]: SSE streaming of config changes

pub mod api;
pub mod streaming;
