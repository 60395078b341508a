//! # Modular Service
//!
//! The authenticated HTTP facade over installable command modules: identity
//! store, token lifecycle, policy-guarded request dispatch, audit trail, and
//! the admin CLI that manages all of it.
//!
//! The pure evaluation machinery lives in `modular-core`; this crate owns
//! everything that touches the environment.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms, future_incompatible)]

pub mod app;
pub mod bootstrap;
pub mod config;
pub mod dispatch;
pub mod errors;
pub mod handlers;
pub mod integrity;
pub mod meta;
pub mod models;
pub mod params;
pub mod password;
pub mod rate_limit;
pub mod registry;
pub mod services;
pub mod storage;

mod openapi;

pub use app::{app, serve, AppContext};
pub use config::Config;
pub use errors::{ApiError, ApiResult};

/// Current version of the modular-service crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
