//! # tern
//!
//! Creates CNI networks, attaches containers to them at any point of their
//! lifecycle, and enforces inter-container communication policy with packet
//! filter rules.
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use tern::{CreateRequest, EngineConfig, NetworkService};
//! use tern::runtime::{CniOrchestrator, ContainerRuntime, NetworkStore};
//!
//! # async fn example(
//! #     store: Arc<dyn NetworkStore>,
//! #     containers: Arc<dyn ContainerRuntime>,
//! #     cni: Arc<dyn CniOrchestrator>,
//! # ) -> tern_common::TernResult<()> {
//! let service = NetworkService::new(EngineConfig::default(), store, containers, cni);
//!
//! let response = service
//!     .create(CreateRequest::new("nat1").with_option("enable_icc", "false"))
//!     .await?;
//! assert!(response.id.is_some());
//! service.connect("nat1", "web-1").await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod config;
pub mod connect;
pub mod create;
pub mod membership;
pub mod remove;
pub mod resolve;
pub mod runtime;
pub mod service;

pub use config::EngineConfig;
pub use create::{CreateRequest, CreateResponse, IpamConfig, IpamRequest};
pub use membership::{ContainerLockGuard, ContainerLocks, Membership, MembershipRollback};
pub use service::NetworkService;
