//! Watch plan YAML schema

use crate::runtime::{Behavior, ChildSpec, SchedulingHint};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Root watch plan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchPlan {
    /// Plan format version
    #[serde(default = "default_version")]
    pub version: String,

    /// Children to launch (ordered map for deterministic launch order)
    pub children: IndexMap<String, ChildConfig>,
}

fn default_version() -> String {
    "1.0".to_string()
}

/// One child entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildConfig {
    /// What the child does once forked
    pub behavior: Behavior,

    /// Optional scheduling request; applied best effort
    #[serde(default)]
    pub scheduling: Option<SchedulingHint>,
}

impl WatchPlan {
    /// Load a plan from a YAML file
    pub fn from_file(path: &str) -> Result<Self, WatchPlanError> {
        let content = std::fs::read_to_string(path).map_err(|e| WatchPlanError::Io {
            path: path.to_string(),
            source: e,
        })?;
        Self::from_yaml(&content)
    }

    /// Parse a plan from a YAML string
    pub fn from_yaml(content: &str) -> Result<Self, WatchPlanError> {
        let plan: WatchPlan = serde_yaml::from_str(content).map_err(WatchPlanError::Parse)?;
        plan.validate()?;
        Ok(plan)
    }

    /// Plan used when `supervise` gets no file: two children that wait for a
    /// signal, so the operator can stop, continue and kill them by hand
    pub fn supervisor_default() -> Self {
        let children = ["first", "second"]
            .into_iter()
            .map(|name| {
                (
                    name.to_string(),
                    ChildConfig {
                        behavior: Behavior::WaitForSignal,
                        scheduling: None,
                    },
                )
            })
            .collect();
        Self {
            version: default_version(),
            children,
        }
    }

    /// Validate the plan
    pub fn validate(&self) -> Result<(), WatchPlanError> {
        if self.children.is_empty() {
            return Err(WatchPlanError::Validation(
                "Plan must declare at least one child".to_string(),
            ));
        }

        for (name, child) in &self.children {
            if name.trim().is_empty() {
                return Err(WatchPlanError::Validation(
                    "Child names must not be empty".to_string(),
                ));
            }

            child.behavior.validate().map_err(|e| {
                WatchPlanError::Validation(format!("Child '{}': {}", name, e))
            })?;

            if let Some(hint) = &child.scheduling {
                hint.validate().map_err(|e| {
                    WatchPlanError::Validation(format!("Child '{}': {}", name, e))
                })?;
            }
        }

        Ok(())
    }

    /// Launch specs in plan order
    pub fn child_specs(&self) -> Vec<ChildSpec> {
        self.children
            .iter()
            .map(|(name, child)| ChildSpec {
                name: name.clone(),
                behavior: child.behavior,
                hint: child.scheduling,
            })
            .collect()
    }
}

/// Errors that can occur when loading a watch plan
#[derive(Debug, thiserror::Error)]
pub enum WatchPlanError {
    #[error("Failed to read watch plan '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse watch plan: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Validation error: {0}")]
    Validation(String),
}
