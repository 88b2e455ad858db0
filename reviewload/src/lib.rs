//! The reviewload virtual-user load generator.
//!
//! This library supports the reviewload binary found elsewhere in this
//! project. It drives a pull-request review-assignment service with many
//! concurrent simulated users, each of which owns a pull request and keeps
//! asking the service to replace one of its reviewers. Sessions carry state
//! from one response into the next request so that generated traffic follows
//! a realistic usage pattern.

#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
#![deny(clippy::dbg_macro)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::multiple_crate_versions)]

pub mod action;
pub mod author;
mod common;
pub mod config;
pub mod scheduler;
pub mod seed;
pub mod session;
pub mod transport;
