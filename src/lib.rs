#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![forbid(unreachable_pub)]

//! Preemptive priority-based scheduler core.
//!
//! This library provides the scheduling heart of an RTOS as a standalone,
//! architecture-neutral crate: a priority run queue with cooperative and
//! preemptible priority bands, owner-validated spinlocks, SMP-aware
//! reschedule kicks, wait queues with timeout arbitration, work queues,
//! and thread lifecycle management (spawn, abort, join).
//!
//! # Priorities
//!
//! Priorities are signed; numerically lower runs first. Negative
//! priorities are **cooperative**: they run until they yield or block.
//! Non-negative priorities are **preemptible**: a more urgent thread
//! becoming ready takes the CPU at the next reschedule point. Threads of
//! equal priority run strictly in the order they became ready, unless the
//! round-robin time slice is enabled in [`SchedConfig`].
//!
//! # Architecture boundary
//!
//! Everything hardware-specific sits behind the [`Arch`] trait: register
//! save/restore, interrupt masking, and cross-CPU kicks. [`NoOpArch`]
//! stands in on hosts, which is how the scheduler state machine is unit
//! tested without a target board.
//!
//! # Quick start
//!
//! ```ignore
//! use preemptive_sched::{Kernel, MockTicks, SchedConfig};
//! use spin::Lazy;
//!
//! static TICKS: MockTicks = MockTicks::new();
//! static KERNEL: Lazy<Kernel<TargetArch>> =
//!     Lazy::new(|| Kernel::new(SchedConfig::new(1), alloc::sync::Arc::new(&TICKS)));
//!
//! fn main() {
//!     KERNEL.spawn(|| { /* thread work */ }, 5).expect("spawn");
//!     KERNEL.start_first_thread();
//! }
//! ```

// Core modules
pub mod arch;
pub mod config;
pub mod errors;
pub mod kernel;
pub mod mem;
pub mod sched;
pub mod spinlock;
pub mod sync;
pub mod thread;
pub mod time;
pub mod work;

#[cfg(test)]
mod tests;

#[cfg(test)]
extern crate std;

extern crate alloc;

// Panic handler for bare-metal
#[cfg(all(not(test), not(feature = "std-shim")))]
use core::panic::PanicInfo;

#[cfg(all(not(test), not(feature = "std-shim")))]
#[panic_handler]
fn panic(_info: &PanicInfo) -> ! {
    loop {
        core::hint::spin_loop();
    }
}

// ============================================================================
// Public API
// ============================================================================

// Architecture abstraction
pub use arch::{Arch, NoOpArch};

// Configuration
pub use config::{SchedConfig, MAX_PRIORITY, MIN_PRIORITY};

// Kernel
pub use kernel::Kernel;

// Scheduler state (directly constructible for isolated testing)
pub use sched::{SchedStats, SchedulerState, WaitQueueId};

// Spinlock
pub use spinlock::{Claimant, SpinGuard, SpinKey, SpinLock};

// Synchronization primitives
pub use sync::{CondVar, Mutex, Semaphore, WaitPrimitive};

// Threads
pub use thread::{JoinHandle, Priority, Thread, ThreadBuilder, ThreadId, ThreadState};

// Memory management
pub use mem::{Stack, StackPool, StackSizeClass};

// Time
pub use time::{Duration, Instant, MockTicks, Tick, TickSource, Timeout};

// Work queues
pub use work::{WorkItem, WorkQueue, WorkState};

// Errors
pub use errors::{SchedError, SchedResult, SpawnError};
