//! The activity record: which task ran, when it started, and for how long.
//!
//! Three index-aligned sequences, so `names[i]`, `started_at[i]` and `elapsed[i]`
//! describe task `i`. Only the last entry can still be growing; earlier entries are
//! frozen the moment a new task starts.
use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityRecord {
    pub names: Vec<String>,
    pub started_at: Vec<DateTime<Utc>>,
    /// Whole seconds accumulated per task.
    pub elapsed: Vec<u64>,
}

/// One task of the record, as exported to the operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityRow<'a> {
    pub name: &'a str,
    pub started_at: DateTime<Utc>,
    pub elapsed: u64,
}

impl ActivityRecord {
    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// All three sequences have the same length.
    pub fn is_aligned(&self) -> bool {
        self.names.len() == self.started_at.len() && self.names.len() == self.elapsed.len()
    }

    /// Append a new task with zero elapsed time; it becomes the last (active) entry.
    pub fn start(&mut self, name: impl Into<String>, at: DateTime<Utc>) -> usize {
        self.names.push(name.into());
        self.started_at.push(at);
        self.elapsed.push(0);
        self.names.len() - 1
    }

    /// Overwrite the elapsed seconds of the last entry; never moves it backwards.
    pub fn set_last_elapsed(&mut self, secs: u64) {
        if let Some(last) = self.elapsed.last_mut() {
            *last = (*last).max(secs);
        }
    }

    pub fn last(&self) -> Option<ActivityRow<'_>> {
        self.rows().last()
    }

    pub fn rows(&self) -> impl Iterator<Item = ActivityRow<'_>> + '_ {
        self.names
            .iter()
            .zip(&self.started_at)
            .zip(&self.elapsed)
            .map(|((name, started_at), elapsed)| ActivityRow {
                name,
                started_at: *started_at,
                elapsed: *elapsed,
            })
    }

    /// Total seconds per task label, in first-seen order.
    pub fn totals(&self) -> Vec<(&str, u64)> {
        let mut totals: Vec<(&str, u64)> = Vec::new();
        for row in self.rows() {
            match totals.iter_mut().find(|(name, _)| *name == row.name) {
                Some((_, secs)) => *secs += row.elapsed,
                None => totals.push((row.name, row.elapsed)),
            }
        }
        totals
    }

    /// `task,date,duration` lines, one per entry.
    pub fn to_csv(&self) -> String {
        let mut out = String::new();
        for row in self.rows() {
            let _ = writeln!(
                out,
                "{},{},{}",
                csv_field(row.name),
                row.started_at.format("%Y-%m-%d %H:%M:%S"),
                row.elapsed
            );
        }
        out
    }
}

fn csv_field(s: &str) -> String {
    if s.contains(|c: char| matches!(c, ',' | '"' | '\n' | '\r')) {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}
