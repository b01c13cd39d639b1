//! Architecture abstraction for context switching and interrupt control.
//!
//! The scheduler core never manipulates registers itself. Everything
//! architecture-specific funnels through the [`Arch`] trait: saving and
//! restoring thread register state, masking interrupts, and poking a remote
//! CPU when a reschedule is needed there.

/// Architecture abstraction trait.
///
/// Implementations involve direct hardware manipulation and inline assembly.
/// The unsafe methods have preconditions the caller must uphold.
pub trait Arch: 'static {
    /// Architecture-specific saved context type.
    ///
    /// Must hold every register and unit of CPU state needed to fully
    /// resume a thread. The scheduler treats it as an opaque blob owned by
    /// the thread.
    type SavedContext: Send + Default + 'static;

    /// Switch from one thread context to another.
    ///
    /// Control returns from this call only when some other thread switches
    /// back to `prev`.
    ///
    /// # Safety
    ///
    /// - `prev` and `next` must point to valid, properly aligned contexts
    ///   that stay alive for the duration of the call
    /// - `next` must represent a valid execution state
    /// - Must be called with interrupts disabled
    unsafe fn context_switch(prev: *mut Self::SavedContext, next: *const Self::SavedContext);

    /// Arrange for the first switch *into* `ctx` to begin executing
    /// `entry(arg)` on the stack whose highest address is `stack_bottom`.
    fn init_context(ctx: &mut Self::SavedContext, entry: fn(usize), stack_bottom: *mut u8, arg: usize);

    /// Enable interrupt delivery on the current CPU.
    fn enable_interrupts();

    /// Disable interrupt delivery on the current CPU.
    fn disable_interrupts();

    /// Whether interrupts are currently enabled on this CPU.
    fn interrupts_enabled() -> bool;

    /// Index of the executing CPU, in `0..num_cpus`.
    fn cpu_id() -> usize;

    /// Interrupt a remote CPU so it passes through a reschedule point.
    fn kick_cpu(cpu: usize);

    /// Park the CPU until an event or interrupt arrives.
    fn wait_for_event();
}

/// A no-op architecture for host testing and single-threaded harnesses.
///
/// Context switches do nothing, so code driven through this arch keeps
/// executing on the caller's stack; it exists so the scheduler state machine
/// can be exercised in isolation.
pub struct NoOpArch;

impl Arch for NoOpArch {
    type SavedContext = ();

    unsafe fn context_switch(_prev: *mut Self::SavedContext, _next: *const Self::SavedContext) {}

    fn init_context(_ctx: &mut Self::SavedContext, _entry: fn(usize), _stack_bottom: *mut u8, _arg: usize) {}

    fn enable_interrupts() {}

    fn disable_interrupts() {}

    fn interrupts_enabled() -> bool {
        true
    }

    fn cpu_id() -> usize {
        0
    }

    fn kick_cpu(_cpu: usize) {}

    fn wait_for_event() {
        core::hint::spin_loop();
    }
}
