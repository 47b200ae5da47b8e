//! # Scope Guards
//!
//! A deferred action that runs on every exit path of a scope, used to make
//! sure suspended tasks and threads are resumed no matter how a dump ends.

/// Runs the wrapped action when dropped, unless dismissed first.
pub struct ScopeGuard<F: FnOnce()>
{
    action: Option<F>,
}

impl<F: FnOnce()> ScopeGuard<F>
{
    pub fn new(action: F) -> Self
    {
        Self {
            action: Some(action),
        }
    }

    /// Disarm the guard; the action will not run.
    pub fn dismiss(mut self)
    {
        self.action = None;
    }
}

impl<F: FnOnce()> Drop for ScopeGuard<F>
{
    fn drop(&mut self)
    {
        if let Some(action) = self.action.take() {
            action();
        }
    }
}

#[cfg(test)]
mod tests
{
    use std::cell::Cell;

    use super::*;

    #[test]
    fn test_guard_runs_on_drop()
    {
        let ran = Cell::new(false);
        {
            let _guard = ScopeGuard::new(|| ran.set(true));
            assert!(!ran.get());
        }
        assert!(ran.get());
    }

    #[test]
    fn test_dismissed_guard_does_not_run()
    {
        let ran = Cell::new(false);
        {
            let guard = ScopeGuard::new(|| ran.set(true));
            guard.dismiss();
        }
        assert!(!ran.get());
    }

    #[test]
    fn test_guard_runs_on_early_return()
    {
        fn early_return(ran: &Cell<bool>) -> Option<()>
        {
            let _guard = ScopeGuard::new(|| ran.set(true));
            None?;
            Some(())
        }

        let ran = Cell::new(false);
        assert!(early_return(&ran).is_none());
        assert!(ran.get());
    }
}
