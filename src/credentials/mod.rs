//! Credential Store
//!
//! Owns API-key and auth-token records and every status transition on them:
//! issuance, validation, revocation, reactivation and the expiry sweep.
//!
//! # Lifecycle
//!
//! ```text
//!   issue ──► active ──revoke──► revoked
//!               ▲                   │
//!               └────reactivate─────┘
//!
//!   expires_at passed ──► validate fails Expired (regardless of status)
//!                     ──► cleanup_expired removes the record
//! ```
//!
//! Issuance, revocation, reactivation and sweep removals are appended to a
//! [`Journal`](crate::journal::Journal) before they become visible, so a
//! store rebuilt with [`CredentialStore::restore`] sees every acknowledged
//! change.

pub mod keygen;
pub mod model;
pub mod store;

pub use model::{Credential, CredentialEvent, CredentialKind, CredentialStatus};
pub use store::{CredentialConfig, CredentialStore, OwnerResolver};
