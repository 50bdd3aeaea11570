//! SSRF-safe outbound HTTP fetch primitive.
//!
//! This crate is the single path to the network for the OpenTools client:
//! every fetch (discovery document, OpenAPI spec, tool invocation) goes
//! through [`guard::FetchGuard`], which enforces an [`policy::OutboundPolicy`]
//! on the initial URL *and on every redirect hop*, bounds each round trip
//! with a timeout, and supports cooperative cancellation.
//!
//! It intentionally knows nothing about discovery documents, OpenAPI, or
//! approval semantics.

pub mod guard;
pub mod policy;

pub use guard::{DEFAULT_TIMEOUT, FetchError, FetchGuard, FetchOptions, GuardedResponse};
pub use policy::OutboundPolicy;
