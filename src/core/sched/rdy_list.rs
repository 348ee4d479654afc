//! Ready list - tasks ready to run at one priority
//!
//! Tasks are added to the tail (FIFO for round-robin) and scheduled from the
//! head.

use std::collections::VecDeque;

use crate::task::TaskHandle;

/// Ready list for a single priority level
#[derive(Debug, Default)]
pub struct ReadyList {
    tasks: VecDeque<TaskHandle>,
}

impl ReadyList {
    pub const fn new() -> Self {
        ReadyList {
            tasks: VecDeque::new(),
        }
    }

    /// First task to be scheduled
    #[inline]
    pub fn head(&self) -> Option<&TaskHandle> {
        self.tasks.front()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Insert at the tail unless already present
    pub fn insert_tail(&mut self, task: TaskHandle) {
        if !self.tasks.contains(&task) {
            self.tasks.push_back(task);
        }
    }

    /// Remove a task; returns whether it was present
    pub fn remove(&mut self, task: &TaskHandle) -> bool {
        match self.tasks.iter().position(|t| t == task) {
            Some(idx) => {
                self.tasks.remove(idx);
                true
            }
            None => false,
        }
    }

    /// Move the head to the tail
    pub fn rotate(&mut self) {
        if self.tasks.len() > 1 {
            self.tasks.rotate_left(1);
        }
    }
}
