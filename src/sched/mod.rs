//! Priority scheduler: run queue, wait queues, and the core state machine.

pub mod core;
pub mod run_queue;
pub mod wait_queue;

pub use self::core::{AbortOutcome, SchedStats, SchedulerState, SuspendAction, SwitchPair, WaitQueueId};
pub use run_queue::RunQueue;
pub use wait_queue::WaitQueue;
