//! Async and blocking client core for a project-scoped, versioned REST API.
//!
//! Public API layers:
//! - [`ApiClient`]/[`BlockingApiClient`]: batch, listing and raw JSON
//!   operations against one project.
//! - [`ClientConfig`]: connection, retry, concurrency and batch-size settings.
//! - [`ClientError`]: unified error type used by all clients, classified by
//!   [`ErrorKind`].
//!
//! Every request goes through the same path: POST retryability is looked up
//! in [`retry::RETRYABLE_POST_ENDPOINTS`], each attempt holds an admission
//! ticket for its `(domain, operation, project)` pool, and batches are split
//! into chunks that run concurrently with their outcomes reported in input
//! order. The blocking client drives the async one on a private runtime.

pub mod admission;
mod blocking_client;
mod client;
pub mod config;
mod credentials;
mod error;
pub mod http;
mod identifiers;
pub mod pagination;
pub mod retry;
pub mod tasks;
mod update;

/// Blocking client and its iterator over paginated results.
pub use blocking_client::{BlockingApiClient, BlockingStream};
/// Async client and per-call options.
pub use client::{
    ApiClient, DeleteOptions, ResourceEndpoint, RetrieveOptions, Retrieved, WriteOptions,
};
/// Client configuration.
pub use config::{ClientConfig, Domain, OperationKind};
/// Credential seam and static token provider.
pub use credentials::{CredentialProvider, Token};
/// Error types returned by all client operations.
pub use error::{ApiError, BatchFailure, ClientError, ErrorKind, FailedItem};
pub use identifiers::{Identifier, IdentifierSequence};
pub use pagination::ListRequest;
pub use tasks::FailureMode;
pub use update::UpdateMode;
