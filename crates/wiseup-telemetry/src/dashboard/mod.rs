//! Live dashboard fan-out.

mod broadcaster;
mod merge;
mod message;

pub use broadcaster::{DashboardBroadcaster, DashboardConfig, SNAPSHOT_TOPIC, SubscriptionHandle};
pub use message::{DashboardMessage, DashboardSnapshot, FleetTotal, FleetView, ObserverMessage};
