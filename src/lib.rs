//! Coordinating authority for a fleet of sensor boards reporting through
//! relay servers.
//!
//! The authority keeps four JSON documents consistent with each other:
//! the identity registry, device records, server records and projects,
//! plus one frequency history log per device. All writes go through the
//! single writer in [`service`].

pub mod alert;
pub mod config;
pub mod device;
pub mod documents;
pub mod engine;
pub mod error;
pub mod history;
pub mod project;
pub mod registry;
pub mod server;
pub mod service;
pub mod timestamp;

pub use error::{Error, Result};

/// Small positive integer naming a sensor board. 0 is never a device.
pub type DeviceId = u32;
/// Relay server id. 0 means "no server".
pub type ServerId = u32;
/// Project id. 0 is the unassigned project.
pub type ProjectId = u32;
