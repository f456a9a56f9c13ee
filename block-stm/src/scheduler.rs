//! Scheduler for coordinating parallel execution and validation tasks.
//!
//! Tasks are served lowest transaction index first. A finished execution
//! always schedules its own validation; if it changed the multi-version map
//! it also schedules revalidation of every higher transaction that has
//! already executed. A failed validation aborts the incarnation and queues
//! the next one.

use crate::types::{ExecutionStatus, Incarnation, TxnIndex};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Task for a worker thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Task {
    /// Execute a transaction at a specific incarnation.
    Execute(TxnIndex, Incarnation),
    /// Validate the read set of a finished incarnation.
    Validate(TxnIndex, Incarnation),
    /// No task currently available, retry later.
    Wait,
    /// All transactions are done, or execution was halted.
    Done,
}

struct State {
    statuses: Vec<ExecutionStatus>,
    execution_queue: BTreeSet<TxnIndex>,
    validation_queue: BTreeSet<TxnIndex>,
    active_tasks: usize,
}

/// Scheduler state for coordinating parallel execution.
pub struct Scheduler {
    num_txns: usize,
    state: Mutex<State>,
    halted: AtomicBool,
    executions: AtomicUsize,
    validations: AtomicUsize,
    aborts: AtomicUsize,
}

impl Scheduler {
    /// Creates a new scheduler with every transaction queued at incarnation 0.
    pub fn new(num_txns: usize) -> Self {
        Self {
            num_txns,
            state: Mutex::new(State {
                statuses: vec![ExecutionStatus::Pending(0); num_txns],
                execution_queue: (0..num_txns).collect(),
                validation_queue: BTreeSet::new(),
                active_tasks: 0,
            }),
            halted: AtomicBool::new(false),
            executions: AtomicUsize::new(0),
            validations: AtomicUsize::new(0),
            aborts: AtomicUsize::new(0),
        }
    }

    /// Gets the next task for a worker thread.
    pub fn next_task(&self) -> Task {
        if self.halted.load(Ordering::Acquire) {
            return Task::Done;
        }

        let mut state = self.state.lock();
        loop {
            let next_validation = state.validation_queue.first().copied();
            let next_execution = state.execution_queue.first().copied();

            match (next_validation, next_execution) {
                (Some(v), e) if e.map_or(true, |e| v <= e) => {
                    state.validation_queue.remove(&v);
                    // Validations for attempts that are not finished are stale:
                    // finishing the attempt schedules its own validation.
                    if let ExecutionStatus::Executed(incarnation) = state.statuses[v] {
                        state.active_tasks += 1;
                        return Task::Validate(v, incarnation);
                    }
                }
                (_, Some(e)) => {
                    state.execution_queue.remove(&e);
                    if let ExecutionStatus::Pending(incarnation) = state.statuses[e] {
                        state.statuses[e] = ExecutionStatus::Executing(incarnation);
                        state.active_tasks += 1;
                        return Task::Execute(e, incarnation);
                    }
                }
                (_, None) => {
                    return if state.active_tasks == 0 {
                        Task::Done
                    } else {
                        Task::Wait
                    };
                }
            }
        }
    }

    /// Marks an execution attempt as finished.
    ///
    /// `changed` reports whether the attempt wrote to, or removed entries
    /// from, the multi-version map.
    pub fn finish_execution(&self, txn_idx: TxnIndex, incarnation: Incarnation, changed: bool) {
        self.executions.fetch_add(1, Ordering::Relaxed);

        let mut state = self.state.lock();
        state.statuses[txn_idx] = ExecutionStatus::Executed(incarnation);
        state.validation_queue.insert(txn_idx);

        if changed {
            let State {
                statuses,
                validation_queue,
                ..
            } = &mut *state;
            validation_queue.extend(
                (txn_idx + 1..self.num_txns)
                    .filter(|&idx| matches!(statuses[idx], ExecutionStatus::Executed(_))),
            );
        }
        state.active_tasks -= 1;
    }

    /// Records a validation outcome. An invalid attempt is aborted and
    /// rescheduled with the next incarnation.
    ///
    /// Returns true if this call aborted the incarnation.
    pub fn finish_validation(&self, txn_idx: TxnIndex, incarnation: Incarnation, valid: bool) -> bool {
        self.validations.fetch_add(1, Ordering::Relaxed);

        let mut state = self.state.lock();
        state.active_tasks -= 1;

        if valid || state.statuses[txn_idx] != ExecutionStatus::Executed(incarnation) {
            return false;
        }

        state.statuses[txn_idx] = ExecutionStatus::Pending(incarnation + 1);
        state.execution_queue.insert(txn_idx);
        self.aborts.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(txn_idx, incarnation, "aborted incarnation");
        true
    }

    /// Stops handing out tasks. In-flight tasks still finish.
    pub fn halt(&self) {
        self.halted.store(true, Ordering::Release);
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    /// Gets the current status of a transaction.
    pub fn get_status(&self, txn_idx: TxnIndex) -> ExecutionStatus {
        self.state.lock().statuses[txn_idx]
    }

    /// Gets statistics about execution progress.
    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            executions: self.executions.load(Ordering::Relaxed),
            validations: self.validations.load(Ordering::Relaxed),
            aborts: self.aborts.load(Ordering::Relaxed),
        }
    }
}

/// Statistics about scheduler state.
#[derive(Debug, Clone, Default)]
pub struct SchedulerStats {
    pub executions: usize,
    pub validations: usize,
    pub aborts: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheduler_basic() {
        let scheduler = Scheduler::new(3);

        assert_eq!(scheduler.next_task(), Task::Execute(0, 0));
        assert_eq!(scheduler.next_task(), Task::Execute(1, 0));
        assert_eq!(scheduler.get_status(1), ExecutionStatus::Executing(0));
    }

    #[test]
    fn test_empty_block_is_done() {
        let scheduler = Scheduler::new(0);
        assert_eq!(scheduler.next_task(), Task::Done);
    }

    #[test]
    fn test_validation_precedes_higher_execution() {
        let scheduler = Scheduler::new(2);

        assert_eq!(scheduler.next_task(), Task::Execute(0, 0));
        scheduler.finish_execution(0, 0, true);

        assert_eq!(scheduler.next_task(), Task::Validate(0, 0));
        assert_eq!(scheduler.next_task(), Task::Execute(1, 0));
        assert_eq!(scheduler.next_task(), Task::Wait);
    }

    #[test]
    fn test_abort_and_reexecute() {
        let scheduler = Scheduler::new(2);

        // Execute both transactions
        assert_eq!(scheduler.next_task(), Task::Execute(0, 0));
        assert_eq!(scheduler.next_task(), Task::Execute(1, 0));
        scheduler.finish_execution(1, 0, true);

        assert_eq!(scheduler.next_task(), Task::Validate(1, 0));
        assert!(scheduler.finish_validation(1, 0, false));

        // Should get transaction 1 again with incarnation 1
        assert_eq!(scheduler.next_task(), Task::Execute(1, 1));
        scheduler.finish_execution(1, 1, true);
        scheduler.finish_execution(0, 0, false);

        assert_eq!(scheduler.next_task(), Task::Validate(0, 0));
        assert!(!scheduler.finish_validation(0, 0, true));
        assert_eq!(scheduler.next_task(), Task::Validate(1, 1));
        assert!(!scheduler.finish_validation(1, 1, true));
        assert_eq!(scheduler.next_task(), Task::Done);

        let stats = scheduler.stats();
        assert_eq!(stats.executions, 3);
        assert_eq!(stats.aborts, 1);
        assert_eq!(scheduler.get_status(0), ExecutionStatus::Executed(0));
        assert_eq!(scheduler.get_status(1), ExecutionStatus::Executed(1));
    }

    #[test]
    fn test_write_schedules_higher_revalidation() {
        let scheduler = Scheduler::new(3);
        for _ in 0..3 {
            scheduler.next_task();
        }
        scheduler.finish_execution(2, 0, false);
        scheduler.finish_execution(1, 0, false);
        assert_eq!(scheduler.next_task(), Task::Validate(1, 0));
        scheduler.finish_validation(1, 0, true);
        assert_eq!(scheduler.next_task(), Task::Validate(2, 0));
        scheduler.finish_validation(2, 0, true);

        // Transaction 0 writes: both higher transactions must revalidate.
        scheduler.finish_execution(0, 0, true);
        assert_eq!(scheduler.next_task(), Task::Validate(0, 0));
        assert_eq!(scheduler.next_task(), Task::Validate(1, 0));
        assert_eq!(scheduler.next_task(), Task::Validate(2, 0));
    }

    #[test]
    fn test_stale_abort_is_ignored() {
        let scheduler = Scheduler::new(1);
        scheduler.next_task();
        scheduler.finish_execution(0, 0, true);
        scheduler.next_task();
        assert!(scheduler.finish_validation(0, 0, false));

        // A second validation of the same incarnation finishing late.
        scheduler.state.lock().active_tasks += 1;
        assert!(!scheduler.finish_validation(0, 0, false));
        assert_eq!(scheduler.get_status(0), ExecutionStatus::Pending(1));
    }

    #[test]
    fn test_halt_stops_scheduling() {
        let scheduler = Scheduler::new(4);
        scheduler.halt();
        assert_eq!(scheduler.next_task(), Task::Done);
        assert!(scheduler.is_halted());
    }
}
