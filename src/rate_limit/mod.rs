//! Rate Limiting Module
//!
//! Windowed per-(credential, endpoint) rate limiting with an atomic
//! check-and-increment per key.
//!
//! # Features
//!
//! - Fixed windows aligned to `floor(now / period) * period`
//! - Optional sliding (previous-window weighted) strategy, per config
//! - Credential-wide wildcard configs (endpoint `*`)
//! - Explicit default policy for pairs without a config
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Rate Limiter                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  credential check ──► config resolve ──► counter lock       │
//! │   (CredentialStore)    exact / * / default   (per key)      │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────────┐   ┌─────────────────────────────┐  │
//! │  │ ConfigStore         │   │ Counter arena (DashMap)     │  │
//! │  │ RwLock, read-mostly │   │ Arc<Mutex<WindowCounter>>   │  │
//! │  └─────────────────────┘   └─────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Fixed windows can admit up to twice the limit across a window boundary.
//! That is accepted in exchange for O(1) state per key.

pub mod config;
pub mod limiter;
pub mod store;
pub mod window;

pub use config::{DefaultPolicy, LimiterSettings, RateLimitConfig, WindowStrategy};
pub use limiter::{Admission, RateLimiter};
pub use store::ConfigStore;
pub use window::{WindowCounter, WindowUsage};
