//! Status - タスク状態の一覧と表示
//!
//! `OutputFormat` で表（テキスト）か JSON かを選びます。

use serde::{Deserialize, Serialize};

use crate::app::task_store::TaskStore;
use crate::domain::{Result, TaskState, validate_task_name};
use crate::ports::SortOrder;

pub const DEFAULT_LIMIT: usize = 10;

const TABLE_TITLE: [&str; 9] = [
    "id",
    "taskName",
    "status",
    "action",
    "runtimeNode",
    "InRuntime",
    "createTime",
    "updateTime",
    "runtimeIP",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Table,
    #[default]
    Json,
}

/// Query string of the status endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StatusQuery {
    /// A task name; when set only that task is reported.
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub start_key: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub sort: Option<String>,
    #[serde(default)]
    pub format: Option<OutputFormat>,
}

impl StatusQuery {
    pub fn list_query(&self) -> ListQuery {
        ListQuery {
            start_key: self.start_key.clone().filter(|k| !k.is_empty()),
            limit: self.limit.filter(|l| *l > 0).unwrap_or(DEFAULT_LIMIT),
            order: self
                .sort
                .as_deref()
                .map(SortOrder::from_sort_token)
                .unwrap_or_default(),
        }
    }

    pub fn format(&self) -> OutputFormat {
        self.format.unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListQuery {
    /// Full state key to resume from, as returned in [`TaskPage::start_key`].
    pub start_key: Option<String>,
    pub limit: usize,
    pub order: SortOrder,
}

impl Default for ListQuery {
    fn default() -> Self {
        Self {
            start_key: None,
            limit: DEFAULT_LIMIT,
            order: SortOrder::Ascend,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskStatusItem {
    #[serde(flatten)]
    pub state: TaskState,
    /// Address of the bound worker; empty when unbound or not registered.
    #[serde(rename = "ip")]
    pub runtime_ip: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskPage {
    pub total: usize,
    pub items: Vec<TaskStatusItem>,
    /// Token for the next page; empty on the last page.
    pub start_key: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StatusOutput {
    Table(String),
    Json(TaskPage),
}

pub async fn query_status(store: &TaskStore, query: &StatusQuery) -> Result<StatusOutput> {
    let page = match query.id.as_deref().filter(|id| !id.is_empty()) {
        Some(task_name) => {
            validate_task_name(task_name)?;
            TaskPage {
                total: store.count().await?,
                items: store.status(task_name).await?.into_iter().collect(),
                start_key: String::new(),
            }
        }
        None => store.list(&query.list_query()).await?,
    };

    Ok(match query.format() {
        OutputFormat::Table => StatusOutput::Table(render_table(&page)),
        OutputFormat::Json => StatusOutput::Json(page),
    })
}

pub fn render_table(page: &TaskPage) -> String {
    let rows: Vec<[String; 9]> = page
        .items
        .iter()
        .map(|item| {
            let s = &item.state;
            [
                s.task_id.to_string(),
                s.task_name.clone(),
                s.state.to_string(),
                s.action.to_string(),
                s.runtime_node.clone(),
                s.in_runtime.to_string(),
                s.create_time.to_rfc3339(),
                s.update_time.to_rfc3339(),
                item.runtime_ip.clone(),
            ]
        })
        .collect();

    let header = TABLE_TITLE.map(str::to_uppercase);
    let mut widths = header.clone().map(|h| h.chars().count());
    for row in &rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.chars().count());
        }
    }

    let border = {
        let mut line = String::from("+");
        for width in &widths {
            line.push_str(&"-".repeat(width + 2));
            line.push('+');
        }
        line.push('\n');
        line
    };
    let render_row = |cells: &[String; 9]| {
        let mut line = String::from("|");
        for (cell, width) in cells.iter().zip(&widths) {
            let pad = width - cell.chars().count();
            line.push(' ');
            line.push_str(cell);
            line.push_str(&" ".repeat(pad + 1));
            line.push('|');
        }
        line.push('\n');
        line
    };

    let mut out = border.clone();
    out.push_str(&render_row(&header));
    out.push_str(&border);
    for row in &rows {
        out.push_str(&render_row(row));
    }
    if !rows.is_empty() {
        out.push_str(&border);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::task_store::tests::{RecordingChannel, store_with};
    use crate::domain::{TaskDefinition, TaskId};
    use crate::impls::InMemoryCoordination;
    use chrono::{TimeZone, Utc};
    use rstest::rstest;
    use std::sync::Arc;
    use ulid::Ulid;

    #[rstest]
    #[case(None, None, SortOrder::Ascend, DEFAULT_LIMIT)]
    #[case(Some("-name"), Some(2), SortOrder::Descend, 2)]
    #[case(Some("name"), Some(0), SortOrder::Ascend, DEFAULT_LIMIT)]
    fn query_defaults(
        #[case] sort: Option<&str>,
        #[case] limit: Option<usize>,
        #[case] order: SortOrder,
        #[case] expected_limit: usize,
    ) {
        let query = StatusQuery {
            sort: sort.map(str::to_string),
            limit,
            start_key: Some(String::new()),
            ..StatusQuery::default()
        };
        let list = query.list_query();
        assert_eq!(list.order, order);
        assert_eq!(list.limit, expected_limit);
        assert_eq!(list.start_key, None);
        assert_eq!(query.format(), OutputFormat::Json);
    }

    #[test]
    fn table_has_title_and_one_row_per_item() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut state = TaskState::new(TaskId::from_ulid(Ulid::new()), "build-1", t0);
        state.bind("pool-w1", t0);
        let page = TaskPage {
            total: 1,
            items: vec![TaskStatusItem {
                state,
                runtime_ip: "10.0.0.5:7000".to_string(),
            }],
            start_key: String::new(),
        };

        let table = render_table(&page);
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines.len(), 5);
        assert!(lines[1].contains("TASKNAME"));
        assert!(lines[3].contains("build-1"));
        assert!(lines[3].contains("Running"));
        assert!(lines[3].contains("10.0.0.5:7000"));
        // 罫線と行の幅が揃っている
        assert!(lines.iter().all(|l| l.chars().count() == lines[0].chars().count()));
    }

    #[test]
    fn json_item_carries_ip_next_to_state_fields() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let item = TaskStatusItem {
            state: TaskState::new(TaskId::from_ulid(Ulid::new()), "t", t0),
            runtime_ip: String::new(),
        };
        let v = serde_json::to_value(&item).unwrap();
        assert_eq!(v["task_name"], "t");
        assert_eq!(v["ip"], "");
        assert_eq!(v["in_runtime"], false);
    }

    #[tokio::test]
    async fn id_query_reports_a_single_task() {
        let coord = Arc::new(InMemoryCoordination::new());
        let store = store_with(coord, Arc::new(RecordingChannel::default()));
        for name in ["a", "b", "c"] {
            store
                .create(TaskDefinition::new(name, serde_json::Value::Null))
                .await
                .unwrap();
        }

        let query = StatusQuery {
            id: Some("b".to_string()),
            ..StatusQuery::default()
        };
        let StatusOutput::Json(page) = query_status(&store, &query).await.unwrap() else {
            panic!("expected json");
        };
        assert_eq!(page.total, 3);
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].state.task_name, "b");

        let query = StatusQuery {
            format: Some(OutputFormat::Table),
            ..StatusQuery::default()
        };
        let StatusOutput::Table(table) = query_status(&store, &query).await.unwrap() else {
            panic!("expected table");
        };
        assert_eq!(table.lines().count(), 3 + 4);
    }
}
