#![forbid(unsafe_code)]

//! Core library for the mirrortube backend: configuration, the Piped
//! mirror pool with discovery, the fan-out upstream client, channel
//! identity resolution, and the feed ranking engine. The `backend`
//! binary wires these together behind an HTTP API.

pub mod categories;
pub mod channels;
pub mod config;
pub mod mirrors;
pub mod ranking;
pub mod security;
pub mod upstream;
