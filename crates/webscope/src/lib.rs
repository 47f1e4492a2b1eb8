//! Public facade crate for `webscope`.
//!
//! This crate intentionally contains no IO or backend-specific logic.
//! It re-exports the backend-agnostic types/traits from `webscope-core`.

pub use webscope_core::*;
