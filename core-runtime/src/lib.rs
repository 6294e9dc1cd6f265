//! # Core Runtime Module
//!
//! Provides foundational runtime infrastructure for the offline sync core:
//! - Logging and tracing infrastructure
//! - Configuration management
//! - Event bus system
//!
//! ## Overview
//!
//! This crate contains the core runtime utilities the sync machinery depends
//! on. It establishes the logging conventions, the process-wide configuration
//! context object, and the event broadcasting mechanism used throughout the
//! system.

pub mod config;
pub mod error;
pub mod events;
pub mod logging;

pub use config::{CoreConfig, CoreConfigBuilder};
pub use error::{Error, Result};
pub use events::{ChangeEvent, CoreEvent, EventBus, SyncEvent};
