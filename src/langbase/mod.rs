//! Langbase Pipes integration.
//!
//! [`LangbaseClient`] speaks the HTTP API; [`LangbaseProvider`] adapts it to
//! the pipeline's [`LlmProvider`](crate::generation::LlmProvider) seam.

mod client;
mod provider;
mod types;


pub use client::*;
pub use provider::*;
pub use types::*;
