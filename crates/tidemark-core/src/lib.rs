//! Core types and trait definitions for tidemark incremental extraction.
//!
//! This crate is deliberately free of HTTP and database dependencies. It holds
//! the domain model, the store traits, and the pure decision logic: the
//! reporting-period calculator, the pre-screen filter, and the eligibility
//! selector. All other crates depend on it.

// We intentionally use native `async fn` in traits (stabilised in Rust 1.75).
// Suppress the advisory lint about `Send` bounds on the returned futures.
#![allow(async_fn_in_trait)]

pub mod entity;
pub mod error;
pub mod outcome;
pub mod period;
pub mod screen;
pub mod select;
pub mod store;
pub mod watermark;

pub use error::{Error, Result};
