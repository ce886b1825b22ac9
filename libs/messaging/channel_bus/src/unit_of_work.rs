//! Deferred actions tied to a transaction boundary
//!
//! Sends, acknowledgements and audit hooks register here instead of running
//! immediately. `commit` runs them in registration order; `clear` drops the
//! pending set so a failed attempt leaves no partial effects behind.

use crate::ChannelError;
use parking_lot::Mutex;
use std::fmt;

type Action = Box<dyn FnOnce() -> Result<(), ChannelError> + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitOfWorkState {
    Active,
    Committed,
    RolledBack,
}

/// A single transaction's pending side effects
pub struct UnitOfWork {
    state: Mutex<UnitOfWorkState>,
    actions: Mutex<Vec<Action>>,
    rollback_actions: Mutex<Vec<Action>>,
}

impl UnitOfWork {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(UnitOfWorkState::Active),
            actions: Mutex::new(Vec::new()),
            rollback_actions: Mutex::new(Vec::new()),
        }
    }

    pub fn state(&self) -> UnitOfWorkState {
        *self.state.lock()
    }

    pub fn is_active(&self) -> bool {
        self.state() == UnitOfWorkState::Active
    }

    pub fn pending(&self) -> usize {
        self.actions.lock().len()
    }

    /// Defer `action` until the unit of work commits
    pub fn register<F>(&self, action: F) -> Result<(), ChannelError>
    where
        F: FnOnce() -> Result<(), ChannelError> + Send + 'static,
    {
        let state = self.state.lock();
        if *state != UnitOfWorkState::Active {
            return Err(ChannelError::TransactionCompleted);
        }
        self.actions.lock().push(Box::new(action));
        Ok(())
    }

    /// Run `action` if the unit of work is rolled back instead of committed
    pub fn on_rollback<F>(&self, action: F) -> Result<(), ChannelError>
    where
        F: FnOnce() -> Result<(), ChannelError> + Send + 'static,
    {
        let state = self.state.lock();
        if *state != UnitOfWorkState::Active {
            return Err(ChannelError::TransactionCompleted);
        }
        self.rollback_actions.lock().push(Box::new(action));
        Ok(())
    }

    /// Drop every pending commit action; rollback hooks stay registered
    pub fn clear(&self) {
        let dropped = std::mem::take(&mut *self.actions.lock()).len();
        if dropped > 0 {
            tracing::debug!(dropped, "Cleared pending unit of work actions");
        }
    }

    /// Run all pending actions in order. Every action runs even if an earlier
    /// one fails; the first failure is returned.
    pub fn commit(&self) -> Result<(), ChannelError> {
        self.finish(UnitOfWorkState::Committed)?;
        self.rollback_actions.lock().clear();

        let actions = std::mem::take(&mut *self.actions.lock());
        run_all(actions, "commit")
    }

    /// Discard pending actions and run rollback hooks
    pub fn rollback(&self) -> Result<(), ChannelError> {
        self.finish(UnitOfWorkState::RolledBack)?;
        self.actions.lock().clear();

        let hooks = std::mem::take(&mut *self.rollback_actions.lock());
        run_all(hooks, "rollback")
    }

    fn finish(&self, target: UnitOfWorkState) -> Result<(), ChannelError> {
        let mut state = self.state.lock();
        if *state != UnitOfWorkState::Active {
            return Err(ChannelError::TransactionCompleted);
        }
        *state = target;
        Ok(())
    }
}

fn run_all(actions: Vec<Action>, phase: &str) -> Result<(), ChannelError> {
    let mut first_error = None;
    for action in actions {
        if let Err(e) = action() {
            tracing::warn!("Unit of work {} action failed: {}", phase, e);
            if first_error.is_none() {
                first_error = Some(e);
            }
        }
    }
    first_error.map_or(Ok(()), Err)
}

impl Default for UnitOfWork {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for UnitOfWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("state", &self.state())
            .field("pending", &self.pending())
            .finish()
    }
}
