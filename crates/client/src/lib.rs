//! Client core for connecting LLM hosts to web apps that publish an
//! annotated OpenAPI document.
//!
//! The entry point is [`Connection`]: give it a base URL, a credential, and
//! a [`ConsentHandler`], then call [`Connection::tools`] to get callable
//! [`Tool`]s. Discovery fetches `/.well-known/llm.json`, the spec parser
//! extracts `x-llm`-annotated operations, and every invocation runs the
//! validate → consent → rate-limit → network pipeline. All outbound traffic
//! goes through [`opentools_http_guard`], which blocks private and
//! metadata address ranges and re-validates every redirect hop.

pub mod approval;
pub mod connection;
pub mod credentials;
pub mod discovery;
pub mod error;
pub mod ratelimit;
pub mod spec;
pub mod tools;

pub use approval::{ApprovalRequest, ConsentHandler, Decision, DenialReason, StandingDecision};
pub use connection::{Connection, ConnectionConfig};
pub use credentials::{Credential, TokenProvider};
pub use discovery::{AuthScheme, DiscoveryDocument};
pub use error::{ClientError, Result};
pub use spec::{ApprovalPolicy, CostIndicator, OperationDescriptor, ParsedSpec, RateLimitSpec, RootMetadata};
pub use tools::{InvokeOutcome, Tool, ToolSet};

pub use opentools_http_guard::{FetchError, FetchGuard, OutboundPolicy};
