// src/lib.rs
// Public library surface for integration tests (and potential reuse).

pub mod api;
pub mod audit;
pub mod auth;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod fingerprint;
pub mod ingest;
pub mod insight;
pub mod judge;
pub mod metrics;
pub mod moderate;
pub mod queue;
pub mod retry;
pub mod store;

// ---- Re-exports for stable public API ----
pub use crate::api::{create_router, AppState, Audiences};
pub use crate::auth::{
    CredentialIssuer, CredentialValidator, Expectations, LocalSigner, ReplayMode,
    ServiceEntitlements,
};
pub use crate::error::{AuthError, AuthResult};
pub use crate::store::Store;
