//! HTTP surface of the gate.
//!
//! Health and metrics are served directly.  Everything else passes through
//! the request gate first and then reaches gate-pass issuance, the backend
//! REST passthrough, or the upstream application.

pub mod handler;
pub mod proxy;
