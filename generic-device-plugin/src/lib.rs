//! Generic device plugin library
//!
//! This module exports the components of the plugin daemon so they can be
//! driven by a transport harness and exercised in tests.

pub mod config;
pub mod discovery;
pub mod metrics;
pub mod plugin;
pub mod registry;
pub mod watch;
