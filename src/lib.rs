//! # ACE - Analysis Correlation Engine Core
//!
//! The request-routing, caching, tracking and work-dispatch fabric of a
//! distributed analysis correlation engine.
//!
//! ## Architecture
//!
//! - `models`: Data model for module types, observables, analyses, roots
//!   and requests
//! - `registry`: Canonical registry of analysis module types
//! - `tracking`: Root store with optimistic concurrency and the in-flight
//!   request tracker
//! - `cache`: Analysis result cache with deterministic fingerprints
//! - `queues`: Per-module FIFO work queues with blocking pop
//! - `processing`: The request processor orchestrating dispatch, linking,
//!   merging and recursion to quiescence
//! - `events`: Event bus publishing lifecycle transitions
//! - `storage`: Content-addressed blob store with root-reference pinning
//! - `alerting`: Alert system registration and long-polling
//! - `config` / `auth`: Configuration settings and bearer api keys
//! - `system`: The assembled core behind explicit dependency injection
//! - `api`: HTTP facade with the stable error envelope

#![warn(missing_docs)]
#![warn(clippy::all)]

// System-wide constants and the error taxonomy
pub mod constants;
pub mod error;

// Data model
pub mod models;

// Core components
pub mod alerting;
pub mod auth;
pub mod cache;
pub mod config;
pub mod events;
pub mod queues;
pub mod registry;
pub mod storage;
pub mod tracking;

// Orchestration
pub mod processing;
pub mod retry;
pub mod system;

// HTTP facade
pub mod api;

// Re-export commonly used types
pub use error::{CoreError, CoreResult};
pub use models::{
    Analysis, AnalysisModuleType, AnalysisRequest, ApiKey, ContentMetadata, DetectionPoint,
    Event, Observable, RequestStatus, RootAnalysis,
};
pub use system::{CoreSystem, CoreSystemBuilder};

/// Re-export version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Re-export crate name
pub const NAME: &str = env!("CARGO_PKG_NAME");
