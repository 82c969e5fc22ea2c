//! Task negotiation
//!
//! Both peers list the tasks they support in `client-auth`. When the relay
//! pairs an initiator with a responder it intersects the two lists and picks
//! one task with a [`TaskSelector`]. The chosen task name and the peer's data
//! for it are handed to each side; everything after that is opaque.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{Result, SignalError};

/// Longest task name accepted
pub const MAX_TASK_NAME_LENGTH: usize = 255;

/// Tasks offered by one client
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskOffer {
    tasks: Vec<String>,
    data: Map<String, Value>,
}

impl TaskOffer {
    /// Validate and build an offer: at least one task, no duplicates,
    /// no empty or oversized names.
    pub fn new(tasks: Vec<String>, data: Map<String, Value>) -> Result<Self> {
        if tasks.is_empty() {
            return Err(SignalError::InvalidTaskOffer("no tasks offered".to_string()));
        }
        let mut seen = HashSet::new();
        for task in &tasks {
            if task.is_empty() || task.len() > MAX_TASK_NAME_LENGTH {
                return Err(SignalError::InvalidTaskOffer(format!(
                    "invalid task name length {}",
                    task.len()
                )));
            }
            if !seen.insert(task.as_str()) {
                return Err(SignalError::InvalidTaskOffer(format!(
                    "duplicate task {}",
                    task
                )));
            }
        }
        Ok(Self { tasks, data })
    }

    pub fn tasks(&self) -> &[String] {
        &self.tasks
    }

    pub fn supports(&self, task: &str) -> bool {
        self.tasks.iter().any(|t| t == task)
    }

    /// Negotiation data for a task, `Value::Null` when none was given
    pub fn data_for(&self, task: &str) -> Value {
        self.data.get(task).cloned().unwrap_or(Value::Null)
    }
}

/// Policy that picks one task out of the tasks both peers support
pub trait TaskSelector: Send + Sync {
    fn select(&self, initiator: &TaskOffer, responder: &TaskOffer) -> Option<String>;
}

/// First task in the responder's list that the initiator also supports
#[derive(Debug, Clone, Copy, Default)]
pub struct ResponderPreference;

impl TaskSelector for ResponderPreference {
    fn select(&self, initiator: &TaskOffer, responder: &TaskOffer) -> Option<String> {
        responder
            .tasks()
            .iter()
            .find(|task| initiator.supports(task))
            .cloned()
    }
}

/// First task in the initiator's list that the responder also supports
#[derive(Debug, Clone, Copy, Default)]
pub struct InitiatorPreference;

impl TaskSelector for InitiatorPreference {
    fn select(&self, initiator: &TaskOffer, responder: &TaskOffer) -> Option<String> {
        initiator
            .tasks()
            .iter()
            .find(|task| responder.supports(task))
            .cloned()
    }
}

/// Named selection policy, as it appears in configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TaskPolicy {
    #[default]
    Responder,
    Initiator,
}

impl TaskPolicy {
    pub fn selector(&self) -> Box<dyn TaskSelector> {
        match self {
            TaskPolicy::Responder => Box::new(ResponderPreference),
            TaskPolicy::Initiator => Box::new(InitiatorPreference),
        }
    }
}

impl FromStr for TaskPolicy {
    type Err = SignalError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "responder" => Ok(TaskPolicy::Responder),
            "initiator" => Ok(TaskPolicy::Initiator),
            other => Err(SignalError::InvalidTaskOffer(format!(
                "unknown task policy {}",
                other
            ))),
        }
    }
}

/// Outcome of a successful negotiation
#[derive(Debug, Clone, PartialEq)]
pub struct NegotiatedTask {
    pub task: String,
    /// The initiator's data for the task, delivered to the responder
    pub initiator_data: Value,
    /// The responder's data for the task, delivered to the initiator
    pub responder_data: Value,
}

impl fmt::Display for NegotiatedTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.task)
    }
}

/// Intersect two offers and select a task.
///
/// Returns `None` when the offers share no task, or when the selector
/// returns a task one of the sides does not support.
pub fn negotiate(
    selector: &dyn TaskSelector,
    initiator: &TaskOffer,
    responder: &TaskOffer,
) -> Option<NegotiatedTask> {
    let task = selector.select(initiator, responder)?;
    if !initiator.supports(&task) || !responder.supports(&task) {
        return None;
    }
    Some(NegotiatedTask {
        initiator_data: initiator.data_for(&task),
        responder_data: responder.data_for(&task),
        task,
    })
}
