//! Transparent MITM proxy.
//!
//! ```text
//! agent ──TCP──► server (peek first byte)
//!                  ├─ 0x16: mitm (SNI peek, mint cert, terminate TLS)
//!                  └─ else: plaintext HTTP/1.x
//!                        │
//!                        ▼
//!               scan-and-forward (scanner client, allow/warn/block)
//!                        │
//!                        ▼
//!                    upstream
//! ```

pub mod ca;
pub mod cert_cache;
pub mod mitm;
pub mod original_dst;
pub mod server;

pub use ca::{CertAuthority, MintedCert};
pub use cert_cache::CertCache;
pub use server::ProxyServer;
