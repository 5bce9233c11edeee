//! Auth lifecycle event bus.
//!
//! The token service publishes lifecycle events here; the auth monitor and any
//! other interested component subscribe. Delivery is best-effort: a slow
//! receiver lags and loses the oldest events rather than blocking publishers.

mod broadcaster;
mod types;

pub use broadcaster::AuthEventBus;
pub use types::{AuthEvent, AuthEventType};
