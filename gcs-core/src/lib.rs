//! GCS Core - Client for a cluster Global Control Store
//!
//! This crate provides typed asynchronous tables over a shared
//! key-value/pub-sub backend:
//! - Object locations, task scheduling state, resource heartbeats
//! - Cluster membership (join / leave records and a local cache)
//! - Conditional task updates for contended ownership changes
//! - Push notifications for subscribers

pub mod backend;
pub mod client;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod id;
pub mod metrics;
pub mod runtime;
pub mod tables;

pub use client::{AsyncGcsClient, GcsClientConfig};
pub use dispatch::{Completion, Notification, Subscription};
pub use error::{GcsError, Result};
pub use id::{ClientId, DriverId, JobId, ObjectId, TaskId, UniqueId};
pub use runtime::{EventLoop, EventLoopConfig, Reactor};

/// Default port of the backing Redis instance
pub const DEFAULT_GCS_PORT: u16 = 6379;
