//! wsbridge-server: the WebSocket bridging engine.
//!
//! Accepts client WebSocket upgrades per connection entity, authorizes them
//! through a policy pipeline, lazily dials the matching backend and routes
//! frames both ways. The `wsbridge-server` binary wires these pieces to a
//! TOML config file; embedders can drive the [`supervisor::Supervisor`]
//! and [`inject::Injector`] directly.

pub mod admission;
pub mod bridge;
pub mod config;
pub mod deflate;
pub mod inbound;
pub mod index;
pub mod inject;
pub mod outbound;
pub mod policy;
pub mod registry;
pub mod socket;
pub mod supervisor;
pub mod tls;

#[cfg(test)]
mod testutil;
