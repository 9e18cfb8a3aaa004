//! Single-assignment output cells.
//!
//! An [`OutputCell`] holds a value that only exists once its owning resource
//! has been provisioned. The cell settles exactly once, either resolved or
//! failed, and every reader waiting on it is woken at that moment.

use std::sync::Arc;
use tokio::sync::watch;

use crate::error::NodeFailure;

/// Observable state of an output cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CellState<T> {
    /// The owning resource has not finished provisioning.
    Unresolved,
    /// The owning resource was provisioned.
    Resolved(T),
    /// The owning resource did not resolve.
    Failed(NodeFailure),
}

impl<T> CellState<T> {
    /// Returns true once the cell holds a terminal value.
    #[must_use]
    pub const fn is_settled(&self) -> bool {
        !matches!(self, Self::Unresolved)
    }

    /// Returns true if the cell resolved successfully.
    #[must_use]
    pub const fn is_resolved(&self) -> bool {
        matches!(self, Self::Resolved(_))
    }

    /// Returns true if the cell failed.
    #[must_use]
    pub const fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

/// A single-assignment future for a resource's outputs.
///
/// Cloning the cell clones the handle; all clones observe the same state.
#[derive(Debug)]
pub struct OutputCell<T> {
    /// Logical name of the owning resource.
    owner: Arc<str>,
    /// Shared state channel.
    sender: Arc<watch::Sender<CellState<T>>>,
}

impl<T> Clone for OutputCell<T> {
    fn clone(&self) -> Self {
        Self {
            owner: Arc::clone(&self.owner),
            sender: Arc::clone(&self.sender),
        }
    }
}

impl<T: Clone> OutputCell<T> {
    /// Creates an unresolved cell owned by the named resource.
    #[must_use]
    pub fn new(owner: &str) -> Self {
        let (sender, _receiver) = watch::channel(CellState::Unresolved);
        Self {
            owner: Arc::from(owner),
            sender: Arc::new(sender),
        }
    }

    /// Returns the logical name of the owning resource.
    #[must_use]
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Resolves the cell with the owning resource's outputs.
    ///
    /// # Panics
    ///
    /// Panics if the cell has already been settled. Only the owning node's
    /// execution step may settle a cell, and it does so once.
    pub fn resolve(&self, value: T) {
        self.settle(CellState::Resolved(value));
    }

    /// Fails the cell.
    ///
    /// # Panics
    ///
    /// Panics if the cell has already been settled.
    pub fn fail(&self, failure: NodeFailure) {
        self.settle(CellState::Failed(failure));
    }

    #[allow(clippy::panic)]
    fn settle(&self, next: CellState<T>) {
        let settled = self.sender.send_if_modified(move |state| {
            if state.is_settled() {
                return false;
            }
            *state = next;
            true
        });

        if !settled {
            panic!("output cell of '{}' settled twice", self.owner);
        }
    }

    /// Returns a snapshot of the current state without waiting.
    #[must_use]
    pub fn peek(&self) -> CellState<T> {
        self.sender.borrow().clone()
    }

    /// Returns true once the cell is settled.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.sender.borrow().is_settled()
    }

    /// Waits until the cell settles.
    ///
    /// # Errors
    ///
    /// Returns the owning resource's failure if the cell failed.
    pub async fn wait(&self) -> std::result::Result<T, NodeFailure> {
        let mut receiver = self.sender.subscribe();
        let state = match receiver.wait_for(CellState::is_settled).await {
            Ok(state) => state.clone(),
            // The sender lives as long as `self`, so the channel cannot close here.
            Err(_) => return Err(NodeFailure::Cancelled),
        };

        match state {
            CellState::Resolved(value) => Ok(value),
            CellState::Failed(failure) => Err(failure),
            CellState::Unresolved => Err(NodeFailure::Cancelled),
        }
    }
}
