//! Integration tests for the fanout channel control plane
//!
//! These tests require a Kubernetes cluster (kind) to run and tell the story
//! of how channel owners and the two control-plane processes interact through
//! the Kubernetes API.
//!
//! # Test Organization
//!
//! - `crd_operations`: Stories about creating, reading and deleting
//!   FanoutChannel resources and their status subresource
//!
//! - `channel_lifecycle`: Stories about the controller and dispatcher passes
//!   running against a real API server
//!
//! # Running These Tests
//!
//! ```bash
//! cargo test --test kind -- --ignored
//! ```

mod channel_lifecycle;
mod crd_operations;
mod helpers;
