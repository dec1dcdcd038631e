//! Coordination-service key layout.
//!
//! すべてのキーは `/scheduler` 以下に置きます。ノードとタスクの正本はここだけです。

use super::node::NodeKind;

pub const GATE_NODE_PREFIX: &str = "/scheduler/gate/node/";
pub const RUNTIME_NODE_PREFIX: &str = "/scheduler/runtime/node/";
pub const TASK_GLOBAL_PREFIX: &str = "/scheduler/task/global/";
pub const TASK_STATE_PREFIX: &str = "/scheduler/task/state/";
pub const TASK_LOCK_PREFIX: &str = "/scheduler/lock/task/";

pub fn node_prefix(kind: NodeKind) -> &'static str {
    match kind {
        NodeKind::Gate => GATE_NODE_PREFIX,
        NodeKind::Runtime => RUNTIME_NODE_PREFIX,
    }
}

pub fn node_path(kind: NodeKind, node_key: &str) -> String {
    format!("{}{}", node_prefix(kind), node_key)
}

pub fn task_path(task_name: &str) -> String {
    format!("{TASK_GLOBAL_PREFIX}{task_name}")
}

pub fn state_path(task_name: &str) -> String {
    format!("{TASK_STATE_PREFIX}{task_name}")
}

pub fn lock_path(task_name: &str) -> String {
    format!("{TASK_LOCK_PREFIX}{task_name}")
}

/// Strips `prefix` from a full key, returning the trailing name.
pub fn name_from_key<'a>(prefix: &str, key: &'a str) -> Option<&'a str> {
    key.strip_prefix(prefix).filter(|name| !name.is_empty())
}

/// Smallest key greater than every key starting with `prefix`.
///
/// Range ends are exclusive, so `[prefix, prefix_end(prefix))` is exactly the prefix range.
pub fn prefix_end(prefix: &str) -> String {
    let mut chars: Vec<char> = prefix.chars().collect();
    while let Some(last) = chars.pop() {
        if let Some(next) = char::from_u32(last as u32 + 1) {
            chars.push(next);
            return chars.into_iter().collect();
        }
    }
    // 全部 char::MAX なら上限なし
    String::from(char::MAX)
}
