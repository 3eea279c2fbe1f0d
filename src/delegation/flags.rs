use std::collections::HashMap;

use crate::error::{Result, RunnerError};

/// Whitespace-separated job class names eligible for delegation.
pub const DELEGATION_FLAG: &str = "jobs.delegation.enabled_classes";

/// Named string flags, loaded from `name=value` assignments.
#[derive(Debug, Clone, Default)]
pub struct FeatureFlags {
    values: HashMap<String, String>,
}

impl FeatureFlags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_assignments<I, S>(assignments: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut flags = Self::new();
        for assignment in assignments {
            let assignment = assignment.as_ref();
            let (name, value) = assignment.split_once('=').ok_or_else(|| {
                RunnerError::Internal(format!("invalid flag assignment: {assignment}"))
            })?;
            flags.set(name.trim(), value.trim());
        }
        Ok(flags)
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.values.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    /// Class names listed in the delegation flag.
    pub fn delegated_classes(&self) -> Vec<&str> {
        self.get(DELEGATION_FLAG)
            .map(|value| value.split_whitespace().collect())
            .unwrap_or_default()
    }
}
