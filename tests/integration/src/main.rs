//! End-to-end tests for the controller.
//!
//! Proxies and backend servers are faked in-process (`helpers.rs`); the
//! coordinator is the in-memory or filesystem store. Tests that need the
//! `topom-server` binary skip themselves when it has not been built.

mod helpers;

mod lock;
mod migration;
mod promotion;
mod proxy;
mod recovery;
mod server;
