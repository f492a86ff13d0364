//! Workspace lock.
//!
//! A workspace is unlocked, locked by a run, or locked by a user. Runs may
//! take the lock over from other runs without an unlock in between (this is
//! how the lock is handed from a finishing run to the next queued one), but
//! never from a user. A user's lock can only be released by that user or by
//! force.

use serde::{Deserialize, Serialize};
use tfrun_id::{RunId, UserId};
use thiserror::Error;

/// Errors returned by lock transitions.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum LockError {
    #[error("workspace already locked")]
    AlreadyLocked,

    #[error("workspace already unlocked")]
    AlreadyUnlocked,

    /// The unlock request came from someone other than the holder.
    #[error("workspace locked by a different user")]
    LockedByDifferentUser,
}

/// The kind of principal holding a lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockKind {
    User,
    Run,
}

impl LockKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LockKind::User => "user",
            LockKind::Run => "run",
        }
    }
}

/// A principal that can hold a workspace lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum LockHolder {
    User(UserId),
    Run(RunId),
}

impl LockHolder {
    pub fn kind(&self) -> LockKind {
        match self {
            LockHolder::User(_) => LockKind::User,
            LockHolder::Run(_) => LockKind::Run,
        }
    }
}

impl std::fmt::Display for LockHolder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockHolder::User(id) => write!(f, "{id}"),
            LockHolder::Run(id) => write!(f, "{id}"),
        }
    }
}

/// Lock state of a workspace. `None` means unlocked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Lock {
    holder: Option<LockHolder>,
}

impl Lock {
    /// A lock already held by `holder`.
    pub fn held_by(holder: LockHolder) -> Self {
        Self {
            holder: Some(holder),
        }
    }

    pub fn holder(&self) -> Option<LockHolder> {
        self.holder
    }

    pub fn is_locked(&self) -> bool {
        self.holder.is_some()
    }

    pub fn is_user_locked(&self) -> bool {
        matches!(self.holder, Some(LockHolder::User(_)))
    }

    /// Lock on behalf of `holder`.
    ///
    /// A run replaces another run's lock. Any other attempt on a locked
    /// workspace fails with [`LockError::AlreadyLocked`].
    pub fn lock(&mut self, holder: LockHolder) -> Result<(), LockError> {
        match (self.holder, holder) {
            (None, _) | (Some(LockHolder::Run(_)), LockHolder::Run(_)) => {
                self.holder = Some(holder);
                Ok(())
            }
            (Some(_), _) => Err(LockError::AlreadyLocked),
        }
    }

    /// Unlock on behalf of `holder`. With `force` the lock is cleared
    /// regardless of who holds it.
    pub fn unlock(&mut self, holder: LockHolder, force: bool) -> Result<(), LockError> {
        let Some(current) = self.holder else {
            return Err(LockError::AlreadyUnlocked);
        };
        if force || current == holder {
            self.holder = None;
            return Ok(());
        }
        Err(LockError::LockedByDifferentUser)
    }
}
