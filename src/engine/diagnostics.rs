use std::fmt::{Display, Formatter, Write};
use std::time::Duration;

use serde::Serialize;

use crate::core::{TaskId, TaskState};
use crate::utils::as_overhead;

/// Time a task spent in its own `prepare` and `run` bodies.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct TaskExecution {
    pub prepare: Duration,
    pub run: Duration,
}

impl TaskExecution {
    pub fn total(&self) -> Duration {
        self.prepare + self.run
    }
}

/// What happened to one task of the tree.
#[derive(Debug, Clone, Serialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub name: String,
    pub parent: Option<TaskId>,
    pub state: TaskState,
    pub execution: TaskExecution,
    pub error: Option<String>,
    pub warnings: Vec<String>,
}

/// Per-task outcome of a finished tree, in the order tasks terminated.
///
/// Warnings raised by any task, failed cleanups and scratch directories that
/// could not be removed are all collected here; none of them changes the
/// outcome of the tree.
#[derive(Debug, Default, Clone, Serialize)]
pub struct Diagnostics {
    pub records: Vec<TaskRecord>,
}

impl Diagnostics {
    pub fn get(&self, id: TaskId) -> Option<&TaskRecord> {
        self.records.iter().find(|record| record.id == id)
    }

    pub fn find(&self, name: &str) -> impl Iterator<Item = &TaskRecord> {
        self.records.iter().filter(move |record| record.name == name)
    }

    /// All warnings, prefixed with the name of the task that raised them.
    pub fn warnings(&self) -> Vec<String> {
        self.records
            .iter()
            .flat_map(|record| {
                record
                    .warnings
                    .iter()
                    .map(move |warning| format!("{}: {}", record.name, warning))
            })
            .collect()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Renders the task tree as a Mermaid diagram, color-coded by outcome.
    ///
    /// * **Green**: Finished
    /// * **Red**: Failed
    /// * **Gray**: Canceled
    pub fn render_mermaid(&self) -> String {
        let mut f = String::new();
        f.push_str("graph TD\n");

        for record in &self.records {
            let name = record.name.replace('"', "\\\"");
            let time = record.execution.total();
            // Writing to a String cannot fail.
            let _ = writeln!(f, "    {}[\"{} ({:.2?})\"]", record.id.get(), name, time);

            let class = match record.state {
                TaskState::Finished => "finished",
                TaskState::Failed => "failed",
                _ => "canceled",
            };
            let _ = writeln!(f, "    class {} {}", record.id.get(), class);
        }

        for record in &self.records {
            if let Some(parent) = record.parent {
                let _ = writeln!(f, "    {} --> {}", parent.get(), record.id.get());
            }
        }

        f.push_str("    classDef finished fill:#bbf7d0,stroke:#15803d\n");
        f.push_str("    classDef failed fill:#fecaca,stroke:#b91c1c\n");
        f.push_str("    classDef canceled fill:#e5e7eb,stroke:#6b7280\n");
        f
    }
}

impl Display for Diagnostics {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for record in &self.records {
            write!(
                f,
                "{} {} {:?} {}",
                record.id,
                record.name,
                record.state,
                as_overhead(record.execution.total())
            )?;

            if let Some(error) = &record.error {
                write!(f, ": {error}")?;
            }

            writeln!(f)?;
        }

        Ok(())
    }
}
