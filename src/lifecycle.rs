//! Task and step state machine.
//!
//! ```text
//! task:  PENDING -> RUNNING -> SUCCESS
//!           |          \
//!           +-------> FAILED
//!
//! step:  PENDING -> RUNNING -> SUCCESS | FAILED
//!           \-----------------------> FAILED
//! ```
//!
//! Statuses never move backwards. Steps run strictly by ascending order and the
//! first failed step halts the pipeline: later steps stay PENDING for good.

use serde_json::{Map, Value};
use thiserror::Error;

use crate::task::{StepStatus, TaskStatus, TaskStep};

/// An attempted status change that the lifecycle does not allow.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("illegal {entity} transition {from} -> {to}")]
pub struct TransitionError {
    pub entity: &'static str,
    pub from: &'static str,
    pub to: &'static str,
}

impl TaskStatus {
    /// Whether the task may move from `self` to `next`.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Running) | (Pending, Failed) | (Running, Success) | (Running, Failed)
        )
    }
}

impl StepStatus {
    /// Whether the step may move from `self` to `next`.
    ///
    /// PENDING -> FAILED covers a step whose dispatch broke before it started.
    pub fn can_transition_to(self, next: StepStatus) -> bool {
        use StepStatus::*;
        matches!(
            (self, next),
            (Pending, Running) | (Pending, Failed) | (Running, Success) | (Running, Failed)
        )
    }
}

pub fn check_task_transition(from: TaskStatus, to: TaskStatus) -> Result<(), TransitionError> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(TransitionError {
            entity: "task",
            from: from.as_str(),
            to: to.as_str(),
        })
    }
}

pub fn check_step_transition(from: StepStatus, to: StepStatus) -> Result<(), TransitionError> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(TransitionError {
            entity: "step",
            from: from.as_str(),
            to: to.as_str(),
        })
    }
}

/// Where a task stands in its pipeline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StepCursor<'a> {
    /// The lowest-order step that has not finished. It is either PENDING or a
    /// RUNNING step whose dispatch was interrupted.
    Next(&'a TaskStep),
    /// Every step reached SUCCESS.
    Complete,
    /// A step failed; nothing after it may run.
    Halted(&'a TaskStep),
}

/// Locate the next step to dispatch. `steps` must be sorted by `step_order`.
pub fn cursor(steps: &[TaskStep]) -> StepCursor<'_> {
    for step in steps {
        match step.status {
            StepStatus::Success => continue,
            StepStatus::Failed => return StepCursor::Halted(step),
            StepStatus::Pending | StepStatus::Running => return StepCursor::Next(step),
        }
    }
    StepCursor::Complete
}

/// A step may leave PENDING only once every lower-order step succeeded.
pub fn may_start(steps: &[TaskStep], step: &TaskStep) -> bool {
    steps
        .iter()
        .filter(|s| s.step_order < step.step_order)
        .all(|s| s.status == StepStatus::Success)
}

/// Results of all successful steps keyed by step key.
pub fn collect_results(steps: &[TaskStep]) -> Map<String, Value> {
    steps
        .iter()
        .filter(|s| s.status == StepStatus::Success)
        .map(|s| {
            (
                s.step_key.clone(),
                s.result.clone().unwrap_or_else(|| Value::Object(Map::new())),
            )
        })
        .collect()
}
