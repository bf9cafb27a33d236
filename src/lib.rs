//! # Devpush
//!
//! Platform-polymorphic core of a devfile-driven development tool. Given a
//! validated component descriptor, devpush reconciles declared container
//! units, volumes and command groups against a live runtime — a local
//! Docker/Podman daemon or a Kubernetes namespace — synchronizing project
//! sources and executing init/build/run/test commands inside the component's
//! containers.
//!
//! ## Architecture Overview
//!
//! - **[`devfile`]**: the in-memory component descriptor plus command group
//!   resolution (defaults, overrides, ambiguity detection)
//! - **[`runtime`]**: the capability facade ([`runtime::ContainerStore`],
//!   [`runtime::VolumeStore`], [`runtime::Execer`]) with Docker, Kubernetes
//!   and in-memory fake backends
//! - **[`adapter`]**: the reconciliation state machine driving push, delete,
//!   test, log and exec
//! - **[`events`]**: the machine-readable command event side channel
//! - **[`labels`]**: the identity label vocabulary shared by the create and
//!   garbage-collection paths
//!
//! CLI parsing, devfile YAML validation, file watching and platform
//! credential handling are external collaborators: the crate consumes their
//! products (a parsed descriptor, a filtered change set, an authenticated
//! client environment) and exposes the operations the CLI layer calls.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use devpush::adapter::{AdapterContext, ComponentAdapter, Platform, PushParameters};
//! use devpush::devfile::Devfile;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let devfile: Devfile = todo!("produced by the external devfile parser");
//!
//!     let adapter = ComponentAdapter::new(
//!         Platform::Docker,
//!         AdapterContext {
//!             component_name: "my-component".to_string(),
//!             devfile,
//!         },
//!     )
//!     .await?;
//!
//!     adapter.push(PushParameters::default()).await?;
//!     Ok(())
//! }
//! ```

/// The component adapter state machine: push, delete, test, log, exec.
pub mod adapter;

/// Component descriptor model and command group resolution.
pub mod devfile;

/// Environment variable names, supervisor paths and fixed defaults.
pub mod env;

/// Machine-readable command event side channel.
pub mod events;

/// Identity label vocabulary for managed containers and volumes.
pub mod labels;

/// Runtime client facade and its backends.
pub mod runtime;

// Re-export the main entry points.
pub use adapter::{
    AdapterContext, AdapterError, ComponentAdapter, Platform, PushParameters,
};
pub use devfile::{CommandGroupKind, Devfile, DevfileCommand, DevfileError};
pub use events::{ChannelEventSink, CommandEvent, EventSink, JsonEventSink, NoOpEventSink};
pub use runtime::{Runtime, RuntimeError};
