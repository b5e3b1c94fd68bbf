//! Task graph plumbing: typed channels between stages, the tool runner seam and the scheduler.

pub mod channel;
pub mod runner;
pub mod task;

pub use channel::{barrier, broadcast, Barrier, BarrierProducer, Broadcast, BroadcastPublisher, ChannelError, Collected};
pub use runner::{ProcessRunner, ToolOutput, ToolRunner};
pub use task::{Scheduler, Stage, StageTask, TaskLedger, TaskRecord, TaskStatus};
