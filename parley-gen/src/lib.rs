//! Client side of the generation service.
//!
//! The service turns conversation context into the next simulated message or
//! reaction. It is consumed through the [`GenerationService`] trait so the
//! scheduler can run against the HTTP endpoint or an in-process stand-in.

mod client;
mod error;
mod types;

pub use client::{GenerationService, HttpGenerationService};
pub use error::{GenerationError, Result};
pub use types::{GenerationRequest, GenerationResponse, ReactionProposal};
