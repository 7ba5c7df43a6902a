//! Workflow and step types, persisted one file per workflow.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

/// Typed step configuration. The tag doubles as the step "type" in files.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepConfig {
    Llm {
        prompt: String,
        #[serde(default)]
        model: Option<String>,
    },
    Tool {
        /// Command template; tokenised before placeholder substitution so
        /// substituted values can never be re-parsed by a shell.
        command: String,
        #[serde(default)]
        timeout_secs: Option<u64>,
    },
    WaitInput {
        question: String,
        #[serde(default)]
        timeout_secs: Option<u64>,
    },
    Conditional {
        condition: String,
        /// Downstream step ids marked `skipped` when the condition is false.
        #[serde(default)]
        skip_if_false: Vec<String>,
    },
    Delay {
        seconds: u64,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    pub status: StepStatus,
    #[serde(default)]
    pub depends_on: Vec<String>,
    pub config: StepConfig,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub retries: u32,
    #[serde(default)]
    pub max_retries: u32,
    /// Rollback command (tool semantics) run when the step fails for good.
    #[serde(default)]
    pub rollback: Option<String>,
    #[serde(default)]
    pub skip_reason: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Step {
    pub fn new(id: impl Into<String>, config: StepConfig) -> Self {
        Self {
            id: id.into(),
            status: StepStatus::Pending,
            depends_on: Vec::new(),
            config,
            result: None,
            retries: 0,
            max_retries: 0,
            rollback: None,
            skip_reason: None,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn after(mut self, deps: &[&str]) -> Self {
        self.depends_on = deps.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn with_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_rollback(mut self, command: impl Into<String>) -> Self {
        self.rollback = Some(command.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: Uuid,
    pub name: String,
    pub status: WorkflowStatus,
    pub steps: Vec<Step>,
    /// Step id → result value, available to later steps via placeholders.
    #[serde(default)]
    pub context: BTreeMap<String, Value>,
    #[serde(default)]
    pub cost_usd: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub max_duration_secs: Option<u64>,
}

#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("step '{0}' depends on unknown step '{1}'")]
    UnknownDependency(String, String),

    #[error("duplicate step id '{0}'")]
    DuplicateStep(String),

    #[error("dependency cycle involving step '{0}'")]
    Cycle(String),
}

impl Workflow {
    pub fn new(name: impl Into<String>, steps: Vec<Step>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            status: WorkflowStatus::Pending,
            steps,
            context: BTreeMap::new(),
            cost_usd: 0.0,
            created_at: now,
            updated_at: now,
            completed_at: None,
            max_duration_secs: None,
        }
    }

    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn step_mut(&mut self, id: &str) -> Option<&mut Step> {
        self.steps.iter_mut().find(|s| s.id == id)
    }

    /// Validate the dependency graph: ids unique, edges resolve, no cycles.
    pub fn validate(&self) -> Result<(), GraphError> {
        let mut seen = HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.id.as_str()) {
                return Err(GraphError::DuplicateStep(step.id.clone()));
            }
        }
        for step in &self.steps {
            for dep in &step.depends_on {
                if !seen.contains(dep.as_str()) {
                    return Err(GraphError::UnknownDependency(step.id.clone(), dep.clone()));
                }
            }
        }

        // Kahn's algorithm: anything left unvisited sits on a cycle.
        let mut in_degree: BTreeMap<&str, usize> = self
            .steps
            .iter()
            .map(|s| (s.id.as_str(), s.depends_on.len()))
            .collect();
        let mut ready: Vec<&str> = in_degree
            .iter()
            .filter(|&(_, &d)| d == 0)
            .map(|(&id, _)| id)
            .collect();
        let mut visited = 0;
        while let Some(id) = ready.pop() {
            visited += 1;
            for step in &self.steps {
                if step.depends_on.iter().any(|d| d == id) {
                    if let Some(degree) = in_degree.get_mut(step.id.as_str()) {
                        *degree -= 1;
                        if *degree == 0 {
                            ready.push(step.id.as_str());
                        }
                    }
                }
            }
        }
        if visited != self.steps.len() {
            let stuck = in_degree
                .iter()
                .find(|&(_, &d)| d > 0)
                .map(|(&id, _)| id.to_string())
                .unwrap_or_default();
            return Err(GraphError::Cycle(stuck));
        }
        Ok(())
    }

    /// Steps whose dependencies are all `completed` or `skipped` and which
    /// are themselves still pending.
    pub fn eligible_steps(&self) -> Vec<String> {
        self.steps
            .iter()
            .filter(|step| step.status == StepStatus::Pending)
            .filter(|step| {
                step.depends_on.iter().all(|dep| {
                    self.step(dep)
                        .map(|d| matches!(d.status, StepStatus::Completed | StepStatus::Skipped))
                        .unwrap_or(false)
                })
            })
            .map(|step| step.id.clone())
            .collect()
    }

    /// All transitive dependents of `root` (not including `root`).
    pub fn descendants(&self, root: &str) -> Vec<String> {
        let mut out = Vec::new();
        let mut frontier = vec![root.to_string()];
        while let Some(current) = frontier.pop() {
            for step in &self.steps {
                if step.depends_on.iter().any(|d| *d == current) && !out.contains(&step.id) {
                    out.push(step.id.clone());
                    frontier.push(step.id.clone());
                }
            }
        }
        out
    }

    pub fn has_unfinished_steps(&self) -> bool {
        self.steps
            .iter()
            .any(|s| matches!(s.status, StepStatus::Pending | StepStatus::Running))
    }

    pub fn any_failed(&self) -> bool {
        self.steps.iter().any(|s| s.status == StepStatus::Failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool(id: &str) -> Step {
        Step::new(id, StepConfig::Tool { command: "true".to_string(), timeout_secs: None })
    }

    #[test]
    fn validate_accepts_a_diamond() {
        let wf = Workflow::new(
            "diamond",
            vec![
                tool("a"),
                tool("b").after(&["a"]),
                tool("c").after(&["a"]),
                tool("d").after(&["b", "c"]),
            ],
        );
        assert!(wf.validate().is_ok());
    }

    #[test]
    fn validate_rejects_cycles_and_bad_edges() {
        let wf = Workflow::new("cycle", vec![tool("a").after(&["b"]), tool("b").after(&["a"])]);
        assert!(matches!(wf.validate(), Err(GraphError::Cycle(_))));

        let wf = Workflow::new("dangling", vec![tool("a").after(&["ghost"])]);
        assert!(matches!(wf.validate(), Err(GraphError::UnknownDependency(..))));

        let wf = Workflow::new("dup", vec![tool("a"), tool("a")]);
        assert!(matches!(wf.validate(), Err(GraphError::DuplicateStep(_))));
    }

    #[test]
    fn eligibility_requires_completed_or_skipped_deps() {
        let mut wf = Workflow::new("e", vec![tool("a"), tool("b").after(&["a"])]);
        assert_eq!(wf.eligible_steps(), vec!["a".to_string()]);

        wf.step_mut("a").unwrap().status = StepStatus::Running;
        assert!(wf.eligible_steps().is_empty());

        wf.step_mut("a").unwrap().status = StepStatus::Completed;
        assert_eq!(wf.eligible_steps(), vec!["b".to_string()]);

        wf.step_mut("a").unwrap().status = StepStatus::Skipped;
        assert_eq!(wf.eligible_steps(), vec!["b".to_string()]);
    }

    #[test]
    fn descendants_are_transitive() {
        let wf = Workflow::new(
            "d",
            vec![
                tool("a"),
                tool("b").after(&["a"]),
                tool("c").after(&["b"]),
                tool("x"),
            ],
        );
        let mut desc = wf.descendants("a");
        desc.sort();
        assert_eq!(desc, vec!["b".to_string(), "c".to_string()]);
        assert!(wf.descendants("x").is_empty());
    }
}
