//! Shared plumbing for the WiseUp session & telemetry core.
//!
//! - [`id`]: instance and correlation identifiers
//! - [`events`]: the auth lifecycle event bus
//! - [`fanout`]: cross-instance pub/sub abstraction and the in-process bus
//! - [`retry`]: bounded exponential backoff for idempotent calls

pub mod events;
pub mod fanout;
pub mod id;
pub mod retry;

pub use events::{AuthEvent, AuthEventBus, AuthEventType};
pub use fanout::{DynFanout, FanoutChannel, FanoutError, FanoutMessage, MemoryFanout};
pub use id::{CorrelationId, InstanceId, generate_id};
pub use retry::{BackoffPolicy, retry_with_backoff};
