//! M4T node: relay hub and two-party peer on top of the host-driven `m4t-core`.
//!
//! - [`cli`] and [`config`] resolve settings (flags, then env, then file, then defaults).
//! - [`dispatcher`] drains a UDP socket into a bounded worker pool.
//! - [`hub`] relays between every session and reaps idle ones.
//! - [`endpoint`] runs the two-party handshake, keep-alive and local commands.
//! - [`frontend`] is the user-facing side of an endpoint.

pub mod cli;
pub mod config;
pub mod dispatcher;
pub mod endpoint;
pub mod frontend;
pub mod hub;
pub mod shutdown;
