//! Common utilities for rust-driver-host
//!
//! This crate provides functionality shared between the compatibility
//! layer crates: the kernel-style status code set, the boundary error set
//! returned to the host character-device facility, logging setup, and the
//! host configuration file.

pub mod config;
pub mod error;
pub mod logging;

pub use config::{DispatchSettings, HostConfig, UsbSettings};
pub use error::{BridgeError, Errno, Error, Result};
pub use logging::setup_logging;
