//! Shared domain types and policies for the keymaster relay.
//!
//! Lives at the bottom of the dependency graph: no other workspace crate
//! is imported here.

pub mod config;
pub mod error;
pub mod retry;
pub mod routing;
pub mod types;
