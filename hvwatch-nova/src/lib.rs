//! HVWatch OpenStack Integration
//!
//! Provides the Keystone session and the Nova client used by the hypervisor
//! watcher.

pub mod auth;
pub mod client;
mod wire;

pub use auth::{KeystoneAuth, Session};
pub use client::{NovaClient, NovaConfig};
