//! Spreadsheet ingestion.
//!
//! Two table layouts are understood. Both skip the header row and rows
//! with fewer than three cells.
//! - Operations: `[task, owner, due (YYYY-MM-DD), status, ...]` → overdue tasks
//! - Tasks: `[task, status, priority, ...]` → open high-priority tasks

use chrono::NaiveDate;
use serde::Deserialize;

use crate::pipeline::types::NewSignal;

const SENDER: &str = "Sheets Monitor";

/// Table layout of a sheet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SheetLayout {
    Operations,
    Tasks,
}

/// A sheet as returned by the feed.
#[derive(Debug, Clone, Deserialize)]
pub struct SheetTable {
    pub layout: SheetLayout,
    #[serde(default)]
    pub rows: Vec<Vec<String>>,
}

impl SheetTable {
    pub fn signals(&self, today: NaiveDate) -> Vec<NewSignal> {
        match self.layout {
            SheetLayout::Operations => operations_signals(&self.rows, today),
            SheetLayout::Tasks => tasks_signals(&self.rows),
        }
    }
}

fn cell(row: &[String], idx: usize) -> &str {
    row.get(idx).map(|s| s.trim()).unwrap_or("")
}

/// Rows whose due date is before `today` and are not completed.
pub fn operations_signals(rows: &[Vec<String>], today: NaiveDate) -> Vec<NewSignal> {
    rows.iter()
        .enumerate()
        .skip(1)
        .filter(|(_, row)| row.len() >= 3)
        .filter_map(|(idx, row)| {
            let (task, owner, due, status) =
                (cell(row, 0), cell(row, 1), cell(row, 2), cell(row, 3));
            if status.eq_ignore_ascii_case("completed") {
                return None;
            }
            let due_date = NaiveDate::parse_from_str(due, "%Y-%m-%d").ok()?;
            if due_date >= today {
                return None;
            }
            let signal = NewSignal::new(
                "sheet",
                format!("Overdue Task: {task}"),
                format!("Task \"{task}\" assigned to {owner} was due on {due} and is still {status}"),
            )
            .with_attribute("sender", SENDER)
            .with_attribute("signal_type", "deadline")
            .with_attribute("sheet", "Operations")
            .with_attribute("row", idx + 1)
            .with_attribute("task", task)
            .with_attribute("owner", owner)
            .with_attribute("due_date", due)
            .with_attribute("status", status)
            .with_external_id(format!("operations:{task}:{due}"));
            Some(signal)
        })
        .collect()
}

/// Rows with high/critical priority that are not completed or done.
pub fn tasks_signals(rows: &[Vec<String>]) -> Vec<NewSignal> {
    rows.iter()
        .enumerate()
        .skip(1)
        .filter(|(_, row)| row.len() >= 3)
        .filter_map(|(idx, row)| {
            let (task, status, priority) = (cell(row, 0), cell(row, 1), cell(row, 2));
            let priority_lc = priority.to_lowercase();
            let status_lc = status.to_lowercase();
            if !matches!(priority_lc.as_str(), "high" | "critical")
                || matches!(status_lc.as_str(), "completed" | "done")
            {
                return None;
            }
            let signal = NewSignal::new(
                "sheet",
                format!("High Priority Task: {task}"),
                format!("Task \"{task}\" has {priority} priority and status is {status}"),
            )
            .with_attribute("sender", SENDER)
            .with_attribute("signal_type", "high_priority_task")
            .with_attribute("sheet", "Tasks")
            .with_attribute("row", idx + 1)
            .with_attribute("task", task)
            .with_attribute("status", status)
            .with_attribute("priority", priority)
            .with_external_id(format!("tasks:{task}:{priority_lc}"));
            Some(signal)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows(data: &[&[&str]]) -> Vec<Vec<String>> {
        data.iter()
            .map(|r| r.iter().map(|c| c.to_string()).collect())
            .collect()
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 10).unwrap()
    }

    #[test]
    fn overdue_rows_become_signals() {
        let data = rows(&[
            &["Task", "Owner", "Due", "Status"],
            &["Renew TLS cert", "dana", "2026-03-01", "in progress"],
            &["Ship invoices", "lee", "2026-03-01", "Completed"],
            &["Quarterly review", "kim", "2026-04-01", "open"],
            &["Fix backups", "sam", "not a date", "open"],
            &["short"],
        ]);
        let signals = operations_signals(&data, today());
        assert_eq!(signals.len(), 1);
        let s = &signals[0];
        assert_eq!(s.subject, "Overdue Task: Renew TLS cert");
        assert_eq!(s.attributes["row"], 2);
        assert_eq!(s.attributes["owner"], "dana");
        assert_eq!(s.external_id.as_deref(), Some("operations:Renew TLS cert:2026-03-01"));
    }

    #[test]
    fn due_today_is_not_overdue() {
        let data = rows(&[&["h", "h", "h", "h"], &["Pay rent", "ops", "2026-03-10", "open"]]);
        assert!(operations_signals(&data, today()).is_empty());
    }

    #[test]
    fn high_priority_open_tasks() {
        let data = rows(&[
            &["Task", "Status", "Priority"],
            &["Migrate DB", "blocked", "Critical"],
            &["Update docs", "open", "low"],
            &["Rotate keys", "Done", "high"],
        ]);
        let signals = tasks_signals(&data);
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].subject, "High Priority Task: Migrate DB");
        assert_eq!(signals[0].attributes["signal_type"], "high_priority_task");
    }

    #[test]
    fn header_only_table_yields_nothing() {
        let table = SheetTable {
            layout: SheetLayout::Tasks,
            rows: rows(&[&["Task", "Status", "Priority"]]),
        };
        assert!(table.signals(today()).is_empty());
    }
}
