//! Bounded undo/redo history over [`Command`]s.

use crate::command::{Command, CommandError};
use crate::graph::Graph;
use std::collections::VecDeque;
use thiserror::Error;

/// Default number of undo steps kept per session.
pub const DEFAULT_HISTORY_LIMIT: usize = 50;

/// History errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum HistoryError {
    #[error("Nothing to undo")]
    NothingToUndo,
    #[error("Nothing to redo")]
    NothingToRedo,
    #[error(transparent)]
    Command(#[from] CommandError),
}

/// Two-stack undo/redo controller for one session.
#[derive(Debug, Clone)]
pub struct History {
    /// Executed commands, oldest first.
    past: VecDeque<Command>,
    /// Undone commands, most recently undone last.
    future: Vec<Command>,
    max_size: usize,
}

impl Default for History {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LIMIT)
    }
}

impl History {
    /// Create an empty history keeping at most `max_size` undo steps.
    pub fn new(max_size: usize) -> Self {
        let max_size = max_size.max(1);
        Self {
            past: VecDeque::with_capacity(max_size),
            future: Vec::new(),
            max_size,
        }
    }

    /// Execute `cmd` against `graph` and record it.
    ///
    /// Any redo branch is discarded. On failure nothing is recorded.
    pub fn execute(&mut self, cmd: Command, graph: &Graph) -> Result<Graph, HistoryError> {
        let next = cmd.execute(graph)?;
        self.past.push_back(cmd);
        while self.past.len() > self.max_size {
            self.past.pop_front();
        }
        self.future.clear();
        Ok(next)
    }

    /// Undo the most recent command.
    ///
    /// A [`CommandError::PartialRestore`] still moves the command to the redo
    /// stack, since the deleted node is back; the error carries the graph to
    /// adopt.
    pub fn undo(&mut self, graph: &Graph) -> Result<Graph, HistoryError> {
        let cmd = self.past.back().ok_or(HistoryError::NothingToUndo)?;
        match cmd.undo(graph) {
            Ok(next) => {
                if let Some(cmd) = self.past.pop_back() {
                    self.future.push(cmd);
                }
                Ok(next)
            }
            Err(e @ CommandError::PartialRestore { .. }) => {
                if let Some(cmd) = self.past.pop_back() {
                    self.future.push(cmd);
                }
                Err(e.into())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Re-apply the most recently undone command.
    pub fn redo(&mut self, graph: &Graph) -> Result<Graph, HistoryError> {
        let cmd = self.future.last().ok_or(HistoryError::NothingToRedo)?;
        let next = cmd.execute(graph)?;
        if let Some(cmd) = self.future.pop() {
            self.past.push_back(cmd);
        }
        Ok(next)
    }

    pub fn can_undo(&self) -> bool {
        !self.past.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.future.is_empty()
    }

    pub fn next_undo_description(&self) -> Option<String> {
        self.past.back().map(Command::describe)
    }

    pub fn next_redo_description(&self) -> Option<String> {
        self.future.last().map(Command::describe)
    }

    pub fn past_count(&self) -> usize {
        self.past.len()
    }

    pub fn future_count(&self) -> usize {
        self.future.len()
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Drop both stacks.
    pub fn clear(&mut self) {
        self.past.clear();
        self.future.clear();
    }
}
