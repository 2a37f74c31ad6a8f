// src/auth/mod.rs
//! The credential layer: issuance, offline verification, replay suppression.

pub mod claims;
pub mod issuer;
pub mod jwks;
pub mod replay;
pub mod validator;

pub use claims::{Audience, DelegatedClaims};
pub use issuer::{
    CredentialIssuer, HttpTokenBroker, LocalSigner, MintedCredential, ServiceEntitlements,
    TokenBroker,
};
pub use jwks::{HttpJwksFetcher, JwksCache, JwksFetch};
pub use replay::{InProcessReplayStore, ReplayMode, ReplayStore, SqliteReplayStore};
pub use validator::{CredentialValidator, Expectations};
