//! Critical-section gate.
//!
//! The heap brackets every change to its block chain with a disable/enable
//! pair on a [`Toggle`] supplied by the kernel, usually the interrupt mask of
//! the current core. The toggle is reached through a [`Gate`], a slot that
//! the kernel may rebind or clear at any time. This lets the heap be built
//! early in boot, before the interrupt controller exists, and start guarding
//! its mutations once the controller is bound.
//!
//! ```text
//!  Heap ──(Cell)──▶ Gate ──(RwLock)──▶ dyn Toggle
//!        set_gate()        bind()/unbind()
//! ```

use core::{fmt, marker::PhantomData};

use spin::RwLock;

/// An enable/disable capability of some controller.
pub trait Toggle {
    /// Disables the controller.
    ///
    /// Returns whether the controller was enabled before the call.
    fn disable(&self) -> bool;

    /// Enables the controller.
    ///
    /// `true` turns the controller on. `false` does nothing and leaves the
    /// controller in its current state, so passing back the value returned
    /// by [`disable`](Self::disable) restores the prior state.
    fn enable(&self, status: bool);
}

/// A toggle reference as stored in a [`Gate`].
pub type ToggleRef<'t> = &'t (dyn Toggle + Sync);

/// A rebindable slot holding an optional [`Toggle`].
///
/// An empty slot makes every critical section a no-op.
pub struct Gate<'t> {
    toggle: RwLock<Option<ToggleRef<'t>>>,
}

impl Default for Gate<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Gate<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Gate")
            .field("bound", &self.is_bound())
            .finish()
    }
}

impl<'t> Gate<'t> {
    /// Creates an empty gate.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            toggle: RwLock::new(None),
        }
    }

    /// Creates a gate bound to `toggle`.
    #[must_use]
    pub const fn with_toggle(toggle: ToggleRef<'t>) -> Self {
        Self {
            toggle: RwLock::new(Some(toggle)),
        }
    }

    /// Binds `toggle`, returning the previously bound one.
    ///
    /// Critical sections entered before the call keep using the toggle they
    /// disabled. Must not be called from a context that can interrupt a
    /// critical section entered through this gate.
    pub fn bind(&self, toggle: ToggleRef<'t>) -> Option<ToggleRef<'t>> {
        self.toggle.write().replace(toggle)
    }

    /// Clears the slot, returning the previously bound toggle.
    pub fn unbind(&self) -> Option<ToggleRef<'t>> {
        self.toggle.write().take()
    }

    #[must_use]
    pub fn is_bound(&self) -> bool {
        self.toggle.read().is_some()
    }

    /// Enters a critical section through the currently bound toggle.
    pub fn enter(&self) -> CriticalSection<'t> {
        let toggle = *self.toggle.read();
        CriticalSection::enter(toggle)
    }
}

/// RAII guard of a critical section.
///
/// Holds the toggle that was disabled and the status it reported; dropping
/// the guard passes that status back to [`Toggle::enable`].
#[must_use = "dropping the guard immediately leaves the critical section"]
pub struct CriticalSection<'t> {
    toggle: Option<ToggleRef<'t>>,
    status: bool,
    _not_send: PhantomData<*mut ()>,
}

impl fmt::Debug for CriticalSection<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CriticalSection")
            .field("guarded", &self.is_guarded())
            .field("status", &self.status)
            .finish()
    }
}

impl<'t> CriticalSection<'t> {
    fn enter(toggle: Option<ToggleRef<'t>>) -> Self {
        let status = toggle.is_some_and(|toggle| toggle.disable());
        Self {
            toggle,
            status,
            _not_send: PhantomData,
        }
    }

    /// A critical section that guards nothing.
    pub fn unguarded() -> Self {
        Self::enter(None)
    }

    /// Returns `true` if a toggle was disabled on entry.
    #[must_use]
    pub fn is_guarded(&self) -> bool {
        self.toggle.is_some()
    }
}

impl Drop for CriticalSection<'_> {
    fn drop(&mut self) {
        if let Some(toggle) = self.toggle {
            toggle.enable(self.status);
        }
    }
}
