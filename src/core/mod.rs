//! Core forwarding policy engine
//!
//! This module turns mesh peer permissions into iptables rules and keeps the
//! live ruleset in step with them. It provides:
//!
//! - [`rule`]: Structured rules, tags and the `iptables -S` line format
//! - [`executor`]: The command seam and the typed `iptables` front-end
//! - [`introspect`]: Listing and tag-based clearing of owned rules
//! - [`composer`]: Five-tier FORWARD rule ordering
//! - [`baseline`]: Permanent default-deny rules
//! - [`masquerade`]: NAT for routing peers
//! - [`allowlist`]: Allowlist reachability for local peers
//! - [`forwarder`]: The serialized enable/resync/disable state machine
//! - [`kernel`]: IP forwarding sysctl toggle
//! - [`model`]: Peers, allowlist and settings supplied by the caller
//! - [`error`]: Error types for engine operations

pub mod allowlist;
pub mod baseline;
pub mod composer;
pub mod error;
pub mod executor;
pub mod forwarder;
pub mod introspect;
pub mod kernel;
pub mod masquerade;
pub mod model;
pub mod rule;

#[cfg(test)]
pub mod test_helpers;
