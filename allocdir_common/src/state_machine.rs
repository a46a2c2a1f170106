use std::sync::{Mutex, MutexGuard, PoisonError};

/// Bookkeeping guarded by a single mutex, mutated only through closures.
///
/// A panic inside one transition must not wedge every later caller (teardown in
/// particular), so a poisoned lock is recovered rather than propagated.
///
/// # Example
///
/// ```rust
/// use allocdir_common::state_machine::StateMachine;
///
/// #[derive(Default)]
/// struct Bookkeeping {
///     tasks: Vec<String>,
///     destroyed: bool,
/// }
///
/// let machine = StateMachine::new(Bookkeeping::default());
///
/// let registered = machine.transition(|state| {
///     if state.destroyed {
///         return false;
///     }
///     state.tasks.push("web".to_string());
///     true
/// });
/// assert!(registered);
/// assert_eq!(machine.read(|state| state.tasks.len()), 1);
/// ```
#[derive(Debug, Default)]
pub struct StateMachine<S> {
    state: Mutex<S>,
}

impl<S> StateMachine<S> {
    /// Creates a new `StateMachine` holding `initial_state`.
    pub fn new(initial_state: S) -> Self {
        Self {
            state: Mutex::new(initial_state),
        }
    }

    /// Lock the state for direct access.
    ///
    /// Never hold the guard across an `.await`.
    pub fn lock(&self) -> MutexGuard<'_, S> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` against a shared view of the state and return its result.
    pub fn read<R>(&self, f: impl FnOnce(&S) -> R) -> R {
        let state = self.lock();
        f(&state)
    }

    /// Perform an atomic transition on the state.
    ///
    /// The lock is held for the duration of the closure only.
    pub fn transition<R>(&self, f: impl FnOnce(&mut S) -> R) -> R {
        let mut state = self.lock();
        f(&mut state)
    }
}
