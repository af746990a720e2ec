//! An embeddable engine that serializes update and read callbacks against a
//! shared object, without requiring the caller to hold a lock around it and
//! without a dedicated worker pool: submitted work runs on whichever caller
//! thread happens to be inside the library when it becomes eligible.
//!
//! Two kinds of work can be submitted against an [`Engine`]:
//!
//! - **updates** ([`Engine::submit_update`]), mutually exclusive with every
//!   other submitted node, in submission order;
//! - **reads** ([`Engine::submit_read`]), which may run concurrently with
//!   other reads but always after every update submitted before them.
//!
//! ## Module organization
//!
//! - [`gate`] - versioned reclamation gate (single-writer/many-reader
//!   snapshotting on top of `arc-swap`)
//! - [`node`] - the log node: one submitted unit of work
//! - [`segment`] - tail segments and their chained reclamation
//! - [`engine`] - submission, traversal, and tail advancement
//! - [`mod@backoff`] - exponential backoff for the two pause-spin points
//! - [`pr`] - atomic primitives and memory barriers
//!
//! ## Example
//!
//! ```
//! use std::sync::atomic::{AtomicU32, Ordering};
//! use std::sync::Arc;
//! use rwlog::Engine;
//!
//! let engine = Arc::new(Engine::new());
//! let counter = Arc::new(AtomicU32::new(0));
//!
//! let c = counter.clone();
//! engine.submit_update(None, move || {
//!     c.fetch_add(1, Ordering::SeqCst);
//! });
//!
//! let observed = Arc::new(AtomicU32::new(0));
//! let (c, o) = (counter.clone(), observed.clone());
//! engine.submit_read(None, move || {
//!     o.store(c.load(Ordering::SeqCst), Ordering::SeqCst);
//! });
//!
//! assert_eq!(observed.load(Ordering::SeqCst), 1);
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![allow(clippy::module_inception)]

/// Exponential backoff for contention management.
pub mod backoff;

/// Atomic primitives and memory barriers.
pub mod pr;

/// Versioned reclamation gate.
pub mod gate;

/// Log nodes: the unit of submitted work.
pub mod node;

/// Tail segments and their chained reclamation.
pub mod segment;

/// The engine: submission, traversal, and tail advancement.
pub mod engine;

pub use engine::Engine;
pub use node::{StatusCell, DONE, PENDING};
