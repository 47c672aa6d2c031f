//! Core data model: analysis module types, observables, analyses, roots,
//! analysis requests, content metadata, api keys and events.
//!
//! Every model serializes to canonical JSON; roots and requests round-trip
//! through JSON at every persistence boundary.

pub mod analysis;
pub mod api_key;
pub mod content;
pub mod event;
pub mod module_type;
pub mod observable;
pub mod request;

pub use analysis::{Analysis, RootAnalysis};
pub use api_key::ApiKey;
pub use content::ContentMetadata;
pub use event::Event;
pub use module_type::AnalysisModuleType;
pub use observable::{DetectionPoint, Observable};
pub use request::{AnalysisRequest, RequestStatus};
