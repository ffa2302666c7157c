//! Request gates for the API server.
//!
//! Every paid route passes through the payment router, which picks one of
//! three ways to get paid:
//!
//! ```text
//! X-Payment header          → atomic x402 payment (reserve/execute/settle)
//! Bearer sk_live_… API key  → credit deduction, metered fallback
//! neither                   → 402 with the accepted payment options
//! ```

pub mod api_key;
pub mod atomic;
pub mod payment_router;
pub mod request_id;
pub mod session;

pub use payment_router::payment_router_mw;
pub use request_id::{request_id_mw, RequestId};
pub use session::Session;
