//! Observability.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured log events via tracing)
//!     → metrics.rs (counters for scans and settlements)
//!
//! Consumers:
//!     → Log aggregation (stderr or file)
//!     → Metrics endpoint (Prometheus scrape)
//! ```
//!
//! # Design Decisions
//! - Request ID flows through all subsystems
//! - Metrics are cheap (atomic increments); the exporter is optional

pub mod logging;
pub mod metrics;
