//! Content scanning: the result model shared by the API and the proxy, the
//! heuristic scoring engine behind the API endpoints, and the HTTP client the
//! proxy uses to reach a scan API (paying per request when asked to).

pub mod client;
pub mod engine;
pub mod types;

pub use client::ScannerClient;
pub use engine::ScanEngine;
pub use types::{Decision, ScanResult, Threat};
