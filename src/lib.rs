//! meshgate - mesh peer forwarding over iptables
//!
//! Turns a list of mesh peers and their permissions into FORWARD and NAT rules
//! and keeps the live ruleset in step with them.
//!
//! # Architecture
//!
//! - [`core`] - Rule model, ordering, iptables interaction and the forwarder
//! - [`audit`] - Audit logging for every ruleset mutation
//! - [`validators`] - Input validation for ports, subnets and interfaces
//! - [`config`] - Configuration persistence
//! - [`utils`] - XDG directories and interface discovery
//!
//! # Guarantees
//!
//! - Rules are ordered by tier, so a kill switch block always outranks
//!   allowlist reachability and full access grants
//! - Every owned rule carries a comment tag; foreign rules are never touched
//! - Resyncs rebuild from scratch and converge when re-run after a failure
//! - Teardown is best effort and reports every step that failed

// Allow pedantic clippy warnings that are not worth fixing for this codebase
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::needless_lifetimes)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::missing_errors_doc)]

pub mod audit;
pub mod config;
pub mod core;
pub mod utils;
pub mod validators;

// Re-export commonly used types
pub use core::error::{Error, Result};
pub use core::executor::{CommandExecutor, DryRunExecutor, SystemExecutor};
pub use core::forwarder::{ForwardChainManager, Forwarder};
pub use core::model::{Allowlist, FirewallSettings, Peer};
