use portable_atomic::{AtomicU8, Ordering};

use crate::{Error, Result};

/// Lifecycle of a generator: `Created -> Started -> Shutdown`.
///
/// Transitions only move forward. A generator that is shut down before it was
/// ever started goes straight to `Shutdown`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
#[repr(u8)]
pub enum LifecycleState {
    Created = 0,
    Started = 1,
    Shutdown = 2,
}

impl LifecycleState {
    const fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Created,
            1 => Self::Started,
            _ => Self::Shutdown,
        }
    }
}

#[derive(Debug)]
pub(crate) struct Lifecycle(AtomicU8);

impl Lifecycle {
    pub(crate) const fn new() -> Self {
        Self(AtomicU8::new(LifecycleState::Created as u8))
    }

    pub(crate) fn state(&self) -> LifecycleState {
        LifecycleState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Moves `Created -> Started`. Returns `Ok(true)` for the caller that
    /// performed the transition and `Ok(false)` if already started.
    pub(crate) fn start(&self) -> Result<bool> {
        match self.0.compare_exchange(
            LifecycleState::Created as u8,
            LifecycleState::Started as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => Ok(true),
            Err(raw) => match LifecycleState::from_u8(raw) {
                LifecycleState::Started => Ok(false),
                _ => Err(Error::Closed),
            },
        }
    }

    /// Moves to `Shutdown` and returns the previous state.
    pub(crate) fn shutdown(&self) -> LifecycleState {
        LifecycleState::from_u8(
            self.0
                .swap(LifecycleState::Shutdown as u8, Ordering::AcqRel),
        )
    }

    /// `Ok` only while started.
    #[inline]
    pub(crate) fn ensure_running(&self) -> Result<()> {
        match self.state() {
            LifecycleState::Started => Ok(()),
            LifecycleState::Created => Err(Error::NotStarted),
            LifecycleState::Shutdown => Err(Error::Closed),
        }
    }
}
