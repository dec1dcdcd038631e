use serde::{Deserialize, Serialize};

use super::errors::GateError;

const MAX_TASK_NAME_LEN: usize = 255;

/// The immutable half of a logical task: its unique name plus an executor
/// spec the gateway never interprets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub task_name: String,

    /// Opaque to the gateway; forwarded to workers as-is.
    #[serde(default)]
    pub executor: serde_json::Value,
}

impl TaskDefinition {
    pub fn new(task_name: impl Into<String>, executor: serde_json::Value) -> Self {
        Self {
            task_name: task_name.into(),
            executor,
        }
    }

    /// Task names become key suffixes, so they may not contain `/` or control characters.
    pub fn validate(&self) -> Result<(), GateError> {
        validate_task_name(&self.task_name)
    }
}

pub fn validate_task_name(name: &str) -> Result<(), GateError> {
    if name.is_empty() {
        return Err(GateError::Validation("task_name is empty".to_string()));
    }
    if name.len() > MAX_TASK_NAME_LEN {
        return Err(GateError::Validation(format!(
            "task_name longer than {MAX_TASK_NAME_LEN} bytes"
        )));
    }
    if name.contains('/') || name.chars().any(char::is_control) {
        return Err(GateError::Validation(format!(
            "task_name {name:?} contains '/' or control characters"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("build-1", true)]
    #[case("nightly.report_v2", true)]
    #[case("", false)]
    #[case("a/b", false)]
    #[case("tab\there", false)]
    fn task_names_are_validated(#[case] name: &str, #[case] ok: bool) {
        let def = TaskDefinition::new(name, serde_json::json!({}));
        assert_eq!(def.validate().is_ok(), ok);
    }

    #[test]
    fn overlong_names_are_rejected() {
        let name = "x".repeat(MAX_TASK_NAME_LEN + 1);
        assert!(matches!(
            validate_task_name(&name),
            Err(GateError::Validation(_))
        ));
    }

    #[test]
    fn executor_defaults_to_null() {
        let def: TaskDefinition = serde_json::from_str(r#"{"task_name":"a"}"#).unwrap();
        assert!(def.executor.is_null());
    }
}
