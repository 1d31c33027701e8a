//! psync - mirror platform entities into Git
//!
//! This crate provides the core functionality for the `psync` CLI tool.
//!
//! # Architecture
//!
//! - [`cli`] - Command-line interface using clap
//! - [`model`] - Data types (PlatformEntity, Workflow, WorkspaceFile)
//! - [`storage`] - SQLite database layer
//! - [`sync`] - Ref translation, virtual files, preview and execute
//! - [`config`] - Configuration management
//! - [`error`] - Error types and handling

#![allow(clippy::module_name_repetitions)]

pub mod cli;
pub mod config;
pub mod error;
pub mod model;
pub mod storage;
pub mod sync;
pub mod validate;

pub use error::{Error, Result};
