pub mod config;
pub mod error;
pub mod ffprobe;
pub mod identity;
pub mod scan;
pub mod sidecar;
pub mod stability;
pub mod validate;
pub mod catalog;
pub mod store;
pub mod handoff;
pub mod orphans;
pub mod resurrect;
pub mod refresh;
pub mod score;

#[cfg(test)]
mod test_support;

pub use config::IngestConfig;
pub use error::CatalogError;
pub use ffprobe::{FFProbeData, FFProbeFormat, FFProbeStream, FfprobeCommand, ProbeError, ProbeFacts, Prober};
pub use catalog::{Catalog, CatalogEntry, QualityScore};
pub use store::{CatalogStore, LoadPolicy};
pub use validate::{FailReason, ProbeResult, ValidationRules};
pub use handoff::{handoff, HandoffOptions, HandoffRequest};
pub use orphans::{cleanup, find_orphans, reconcile_orphans, CleanupMode, CleanupReport, CleanupRequest};
pub use resurrect::{resurrect, ResurrectOptions, ResurrectStats};
pub use refresh::{refresh, RefreshOptions, RefreshStats};
pub use score::record_score;
pub use stability::wait_stable;
pub use identity::sha256_file;
