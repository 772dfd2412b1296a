use std::collections::VecDeque;

use crate::job::{Job, JobId};

/// FIFO of submitted jobs plus the admission rule for starting them.
#[derive(Debug)]
pub struct JobQueue {
    pending: VecDeque<Job>,
    max_active: usize,
}

impl JobQueue {
    pub fn new(max_active: usize) -> Self {
        Self {
            pending: VecDeque::new(),
            max_active: max_active.max(1),
        }
    }

    pub fn max_active(&self) -> usize {
        self.max_active
    }

    pub fn can_start(&self, active_count: usize) -> bool {
        active_count < self.max_active
    }

    pub fn push(&mut self, job: Job) {
        self.pending.push_back(job);
    }

    /// Oldest job, if another one may start alongside `active_count` others.
    pub fn pop_ready(&mut self, active_count: usize) -> Option<Job> {
        if !self.can_start(active_count) {
            return None;
        }
        self.pending.pop_front()
    }

    pub fn remove(&mut self, id: &JobId) -> Option<Job> {
        let index = self.pending.iter().position(|job| job.id == *id)?;
        self.pending.remove(index)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
