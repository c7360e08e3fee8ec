//! Keygate Library
//!
//! Credential and quota enforcement: API-key and auth-token lifecycle,
//! role-based authorization, windowed per-(credential, endpoint) rate
//! limiting, and a usage ledger whose time-bucketed statistics stream to
//! live dashboards. Administrative changes land in an append-only audit
//! trail.
//!
//! [`engine::Engine`] ties the components together; [`api`] is the closed
//! request/response surface and [`server`] exposes it over HTTP.

pub mod api;
pub mod audit;
pub mod authz;
pub mod clock;
pub mod config;
pub mod credentials;
pub mod engine;
pub mod error;
pub mod journal;
pub mod ledger;
pub mod logging;
pub mod metrics;
pub mod rate_limit;
pub mod retry;
pub mod server;
pub mod sweeper;
pub mod telemetry;

pub use engine::Engine;
pub use error::{EngineError, EngineResult, ErrorKind};
