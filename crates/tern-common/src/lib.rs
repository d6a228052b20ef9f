//! # tern-common
//!
//! Shared utilities and types for the tern network engine.
//!
//! This crate provides common functionality used across all tern crates:
//! - Error types and their classification
//! - Name and ID-prefix matching
//! - Standard filesystem paths
//! - Label keys shared with the container runtime

#![warn(missing_docs)]

pub mod error;
pub mod id;
pub mod labels;
pub mod paths;

pub use error::{ErrorKind, ResultExt, TernError, TernResult};
pub use id::{IdMatcher, Identifiable, ResourceKind};
pub use paths::NetworkPaths;
