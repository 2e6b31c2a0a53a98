//! HTTP client for the relationship-based access-control source service.
//!
//! Provides the paged change-stream fetcher consumed by the sync loop and the
//! tuple write path used by the replica sink. Authentication supports no
//! credentials, a static bearer token, and an OIDC client-credentials grant
//! with cached refresh.

pub mod auth;
pub mod client;
pub mod fetcher;
pub mod parse;
pub mod retry;

pub use auth::{ClientCredentials, Credentials, TokenCache};
pub use client::{FgaApi, ReadChangesPage, TupleKeyDelete, TupleKeyWrite, WriteCondition};
pub use fetcher::{ChangeFetcher, FetchOptions};
pub use retry::RetryConfig;
