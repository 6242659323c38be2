//! Order validation pipeline.
//!
//! Controller → template resolver → failover orchestrator → provider
//! adapters → response normalizer, with every attempt recorded.

pub mod context;
pub mod controller;
pub mod failover;
pub mod normalizer;
pub mod prompt_templates;
pub mod providers;
pub mod recorder;
pub mod session;

pub use controller::{
    SessionPolicy, ValidationController, ValidationError, ValidationErrorKind, ValidationOutcome,
};
pub use failover::{CancelToken, FailoverOrchestrator};
