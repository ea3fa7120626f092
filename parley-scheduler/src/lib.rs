//! Per-conversation scheduler for simulated replies.
//!
//! Each conversation gets an independent lane with its own queue, debounce
//! timer and version counter. A user message always preempts simulated work
//! that is queued or already in flight.

mod config;
mod error;
mod events;
mod lane;
mod scheduler;
mod task;

#[cfg(test)]
mod test_support;

pub use config::SchedulerConfig;
pub use error::{Result, SchedulerError};
pub use events::{ChannelEventSink, EventSink, SchedulerEvent};
pub use lane::{LaneStatus, LaneStatusSnapshot};
pub use scheduler::ConversationScheduler;
pub use task::TaskPriority;
