use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardState {
    Active,
    Suspended,
}

/// Keeps background refreshes away from the visible record list while a
/// detail screen is being edited. Only the engine flips it.
#[derive(Debug, Default)]
pub struct EditModeGuard {
    suspended: AtomicBool,
}

impl EditModeGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if this call moved the guard into Suspended.
    pub fn enter(&self) -> bool {
        !self.suspended.swap(true, Ordering::SeqCst)
    }

    /// Returns true if this call moved the guard back to Active.
    pub fn exit(&self) -> bool {
        self.suspended.swap(false, Ordering::SeqCst)
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> GuardState {
        if self.is_suspended() {
            GuardState::Suspended
        } else {
            GuardState::Active
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enter_is_idempotent() {
        let guard = EditModeGuard::new();
        assert_eq!(guard.state(), GuardState::Active);

        assert!(guard.enter());
        assert!(!guard.enter());
        assert_eq!(guard.state(), GuardState::Suspended);

        assert!(guard.exit());
        assert!(!guard.exit());
        assert_eq!(guard.state(), GuardState::Active);
    }
}
