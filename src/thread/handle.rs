//! Join handle for observing thread completion.

use super::{Thread, ThreadId, ThreadState};

/// A handle for waiting on a thread to terminate.
///
/// Dropping the handle does not affect the thread; it only gives up the
/// ability to join it through this handle. Blocking joins go through
/// [`Kernel::join`](crate::kernel::Kernel::join); several handles (clones)
/// may join the same thread and all are woken when it dies.
pub struct JoinHandle {
    thread: Thread,
}

impl JoinHandle {
    pub(crate) fn new(thread: Thread) -> Self {
        Self { thread }
    }

    /// The thread this handle refers to.
    pub fn thread(&self) -> &Thread {
        &self.thread
    }

    /// ID of the thread this handle refers to.
    pub fn thread_id(&self) -> ThreadId {
        self.thread.id()
    }

    /// Whether the thread has terminated, without blocking.
    pub fn is_finished(&self) -> bool {
        self.thread.state() == ThreadState::Dead
    }

    /// Whether the thread is still ready, running, waiting, or suspended.
    pub fn is_alive(&self) -> bool {
        self.thread.is_alive()
    }
}

impl Clone for JoinHandle {
    fn clone(&self) -> Self {
        Self {
            thread: self.thread.clone(),
        }
    }
}

impl core::fmt::Debug for JoinHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("JoinHandle")
            .field("thread_id", &self.thread_id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn observes_completion() {
        let t = Thread::test_thread(1, 5);
        let handle = JoinHandle::new(t.clone());
        assert!(handle.is_alive());
        assert!(!handle.is_finished());

        t.set_state(ThreadState::Dead);
        assert!(!handle.is_alive());
        assert!(handle.is_finished());
        assert_eq!(handle.thread_id(), t.id());
    }
}
