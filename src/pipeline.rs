//! Step pipeline definition.
//!
//! Every task walks the same fixed, ordered list of steps regardless of its
//! `type`. The pipeline is the single source of truth for how many steps a task
//! has and what they are called.

use serde::Serialize;
use std::collections::HashSet;
use thiserror::Error;

/// A template from which each task's steps are created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StepTemplate {
    /// 1-based execution order.
    pub order: u32,
    /// Symbolic name sent to the model service and used to key the task result.
    pub key: &'static str,
    /// Human-readable label.
    pub label: &'static str,
}

impl StepTemplate {
    pub const fn new(order: u32, key: &'static str, label: &'static str) -> Self {
        Self { order, key, label }
    }
}

/// The canonical six-step catalog.
pub const DEFAULT_STEPS: [StepTemplate; 6] = [
    StepTemplate::new(1, "image_processing", "Image processing"),
    StepTemplate::new(2, "image_model_call", "Image model call"),
    StepTemplate::new(3, "image_result_saved", "Image result saved"),
    StepTemplate::new(4, "prompt_building", "Prompt building"),
    StepTemplate::new(5, "llm_call", "LLM call"),
    StepTemplate::new(6, "final_result", "Final result"),
];

/// Error returned when a step list does not form a valid pipeline.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum PipelineError {
    #[error("pipeline has no steps")]
    Empty,

    #[error("step '{key}' has order {found}, expected {expected}")]
    OrderGap {
        key: &'static str,
        expected: u32,
        found: u32,
    },

    #[error("duplicate step key: {0}")]
    DuplicateKey(&'static str),
}

/// An ordered, validated list of step templates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepPipeline {
    steps: Vec<StepTemplate>,
}

impl StepPipeline {
    /// Build a pipeline from templates.
    ///
    /// Orders must run 1..=N in the given sequence and keys must be unique.
    pub fn new(steps: Vec<StepTemplate>) -> Result<Self, PipelineError> {
        if steps.is_empty() {
            return Err(PipelineError::Empty);
        }

        let mut seen = HashSet::new();
        for (index, step) in steps.iter().enumerate() {
            let expected = index as u32 + 1;
            if step.order != expected {
                return Err(PipelineError::OrderGap {
                    key: step.key,
                    expected,
                    found: step.order,
                });
            }
            if !seen.insert(step.key) {
                return Err(PipelineError::DuplicateKey(step.key));
            }
        }

        Ok(Self { steps })
    }

    pub fn steps(&self) -> &[StepTemplate] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

impl Default for StepPipeline {
    fn default() -> Self {
        Self {
            steps: DEFAULT_STEPS.to_vec(),
        }
    }
}
