//! Critical section collaborator.
//!
//! The only explicit mutual exclusion in the system.  It guards the few
//! registers touched from both the synchronous interrupt and the main loop,
//! normally by masking that single interrupt source.  Sections do not nest:
//! every `enter` is paired with exactly one `exit`.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

pub trait CriticalSection {
    /// Disable the interrupt source
    fn enter(&mut self);

    /// Re-enable the interrupt source
    fn exit(&mut self);
}

/// Run `f` inside the critical section.
pub fn with<C: CriticalSection, R>(cs: &mut C, f: impl FnOnce() -> R) -> R {
    cs.enter();
    let result = f();
    cs.exit();
    result
}

/// Critical section for targets where both contexts never preempt each other
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCriticalSection;

impl CriticalSection for NoCriticalSection {
    fn enter(&mut self) {}
    fn exit(&mut self) {}
}
