//! Networking and HTTP server runners.
//!
//! Provides listen addresses, connection-oriented listeners, a hyper-based HTTP server with coordinated shutdown, and
//! [`Runner`][ignition_core::Runner] adapters for serving HTTP, including one that drains gracefully.
#![deny(warnings)]
#![deny(missing_docs)]

pub mod net;

pub mod runner;
