//! Wire messages exchanged with workers over a session.
//!
//! Frames are JSON text tagged by `type`. Worker messages after `whoami` all
//! count as heartbeats, whatever their payload.

use serde::{Deserialize, Serialize};

use super::task::TaskDefinition;

/// Messages a worker sends to the gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WorkerMessage {
    Whoami {
        name: String,
        #[serde(default)]
        prefix: String,
        #[serde(default)]
        address: String,
    },
    Heartbeat {
        /// Tasks the worker is executing right now, when it chooses to report them.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        running: Option<Vec<String>>,
    },
    Ack {
        task_name: String,
        command: CommandKind,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandKind {
    Run,
    Update,
    Stop,
    Delete,
}

/// Commands the gate pushes to a bound worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WorkerCommand {
    Run { definition: TaskDefinition },
    Update { definition: TaskDefinition },
    Stop { task_name: String },
    Delete { task_name: String },
}

impl WorkerCommand {
    pub fn kind(&self) -> CommandKind {
        match self {
            WorkerCommand::Run { .. } => CommandKind::Run,
            WorkerCommand::Update { .. } => CommandKind::Update,
            WorkerCommand::Stop { .. } => CommandKind::Stop,
            WorkerCommand::Delete { .. } => CommandKind::Delete,
        }
    }

    pub fn task_name(&self) -> &str {
        match self {
            WorkerCommand::Run { definition } | WorkerCommand::Update { definition } => {
                &definition.task_name
            }
            WorkerCommand::Stop { task_name } | WorkerCommand::Delete { task_name } => task_name,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whoami_parses_with_defaults() {
        let msg: WorkerMessage = serde_json::from_str(r#"{"type":"whoami","name":"w1"}"#).unwrap();
        assert_eq!(
            msg,
            WorkerMessage::Whoami {
                name: "w1".into(),
                prefix: String::new(),
                address: String::new(),
            }
        );
    }

    #[test]
    fn bare_heartbeat_has_no_report() {
        let msg: WorkerMessage = serde_json::from_str(r#"{"type":"heartbeat"}"#).unwrap();
        assert_eq!(msg, WorkerMessage::Heartbeat { running: None });
    }

    #[test]
    fn commands_are_tagged() {
        let cmd = WorkerCommand::Stop {
            task_name: "build-1".into(),
        };
        let v = serde_json::to_value(&cmd).unwrap();
        assert_eq!(v["type"], "stop");
        assert_eq!(cmd.kind(), CommandKind::Stop);
        assert_eq!(cmd.task_name(), "build-1");
    }
}
