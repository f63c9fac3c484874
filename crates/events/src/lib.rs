//! Task notifications and scheduler-wide events.
//!
//! - [`notification`]: the per-task event vocabulary (progress, error, liveness).
//! - [`notifier`]: per-task subscribe / unsubscribe fan-out.
//! - [`bus`]: process-wide broadcast of [`bus::SchedulerEvent`]s.
//! - [`journal`]: background consumer that logs and optionally records the bus.

pub mod bus;
pub mod journal;
pub mod notification;
pub mod notifier;

pub use bus::{EventBus, SchedulerEvent};
pub use notification::{FailureKind, Liveness, TaskEvent, TaskFailure, TaskKind, TaskNotification};
pub use notifier::{Notifier, SubscriptionId};
