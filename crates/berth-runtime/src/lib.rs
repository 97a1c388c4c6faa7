//! Container lifecycle control plane for the berth daemon.
//!
//! The [`engine::Engine`] owns the container table and drives lifecycle
//! transitions through three external collaborators, each behind a trait in
//! [`backend`]: the process supervisor, the image graph, and the filesystem
//! layers. Every transition is recorded on the shared [`events::EventBus`].

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod attach;
pub mod backend;
pub mod container;
pub mod engine;
pub mod events;
pub mod logs;
pub mod state;
pub mod stdio;
pub mod top;
