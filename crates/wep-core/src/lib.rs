//! Core data model for the webinar engagement pipeline.
//!
//! Every stage consumes a [`Table`] and produces a new one; nothing is mutated
//! after it has been handed to the next stage.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Column names shared across sheets and the enriched output.
pub mod columns {
    pub const BMID: &str = "BMID";
    pub const FIRST_NAME: &str = "First Name";
    pub const LAST_NAME: &str = "Last Name";
    pub const REGISTRANT_PROFILE: &str = "LinkedIn URL";
    pub const CRM_PROFILE: &str = "linkedin_url";
    pub const ATTENDANCE_STATUS: &str = "attendance_status";
    pub const POLL_RESPONSES: &str = "poll_responses";
    pub const EMOJI_REACTIONS: &str = "emoji_reactions";
    pub const QA_QUESTIONS: &str = "qa_questions";
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TableError {
    #[error("malformed table {source_name}: {reason}")]
    MalformedTable { source_name: String, reason: String },
    #[error("missing required input {role}: {path}")]
    MissingRequiredInput { role: String, path: String },
    #[error("duplicate column {0:?}")]
    DuplicateColumn(String),
    #[error("unknown column {0:?}")]
    UnknownColumn(String),
}

impl TableError {
    pub fn malformed(source_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedTable {
            source_name: source_name.into(),
            reason: reason.into(),
        }
    }
}

/// Ordered rows sharing one header. Empty string means "absent".
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Table {
    columns: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl Table {
    pub fn new(columns: Vec<String>) -> Result<Self, TableError> {
        for (i, column) in columns.iter().enumerate() {
            if columns[..i].contains(column) {
                return Err(TableError::DuplicateColumn(column.clone()));
            }
        }
        Ok(Self {
            columns,
            rows: Vec::new(),
        })
    }

    /// Builds a table from borrowed literals; handy for fixtures and tests.
    pub fn from_rows<C, R, V>(columns: C, rows: R) -> Result<Self, TableError>
    where
        C: IntoIterator,
        C::Item: Into<String>,
        R: IntoIterator<Item = V>,
        V: IntoIterator,
        V::Item: Into<String>,
    {
        let mut table = Self::new(columns.into_iter().map(Into::into).collect())?;
        for row in rows {
            table.push_row(row.into_iter().map(Into::into).collect());
        }
        Ok(table)
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<String>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn require_column(&self, name: &str) -> Result<usize, TableError> {
        self.column_index(name)
            .ok_or_else(|| TableError::UnknownColumn(name.to_string()))
    }

    /// Appends a row, padding short rows with empty values and dropping cells past the header width.
    pub fn push_row(&mut self, mut row: Vec<String>) {
        row.resize(self.columns.len(), String::new());
        self.rows.push(row);
    }

    pub fn record(&self, index: usize) -> Option<Record<'_>> {
        self.rows.get(index).map(|values| Record {
            columns: &self.columns,
            values,
        })
    }

    pub fn records(&self) -> impl Iterator<Item = Record<'_>> + '_ {
        self.rows.iter().map(|values| Record {
            columns: &self.columns,
            values,
        })
    }

    /// Stable filter into a new table.
    pub fn filter<F>(&self, mut keep: F) -> Table
    where
        F: FnMut(&Record<'_>) -> bool,
    {
        let rows = self
            .records()
            .filter(|record| keep(record))
            .map(|record| record.values.to_vec())
            .collect();
        Table {
            columns: self.columns.clone(),
            rows,
        }
    }

    /// Rewrites every cell through `f(column, value)`.
    pub fn map_values<F>(&self, mut f: F) -> Table
    where
        F: FnMut(&str, &str) -> String,
    {
        let rows = self
            .rows
            .iter()
            .map(|row| {
                self.columns
                    .iter()
                    .zip(row)
                    .map(|(column, value)| f(column, value))
                    .collect()
            })
            .collect();
        Table {
            columns: self.columns.clone(),
            rows,
        }
    }

    /// Returns a new table with `names` appended to the header and one value per
    /// new column computed for every record.
    pub fn append_columns<F>(&self, names: &[String], mut values_for: F) -> Result<Table, TableError>
    where
        F: FnMut(&Record<'_>) -> Vec<String>,
    {
        let mut columns = self.columns.clone();
        columns.extend(names.iter().cloned());
        let mut table = Table::new(columns)?;
        for record in self.records() {
            let mut extra = values_for(&record);
            extra.resize(names.len(), String::new());
            let mut row = record.values.to_vec();
            row.extend(extra);
            table.rows.push(row);
        }
        Ok(table)
    }

    /// Replaces the values of an existing column, or appends it when absent.
    pub fn set_column<F>(&self, name: &str, mut value_for: F) -> Table
    where
        F: FnMut(&Record<'_>) -> String,
    {
        match self.column_index(name) {
            Some(idx) => {
                let rows = self
                    .records()
                    .map(|record| {
                        let mut row = record.values.to_vec();
                        row[idx] = value_for(&record);
                        row
                    })
                    .collect();
                Table {
                    columns: self.columns.clone(),
                    rows,
                }
            }
            None => {
                let mut columns = self.columns.clone();
                columns.push(name.to_string());
                let rows = self
                    .records()
                    .map(|record| {
                        let mut row = record.values.to_vec();
                        row.push(value_for(&record));
                        row
                    })
                    .collect();
                Table { columns, rows }
            }
        }
    }
}

/// Borrowed view of one row, addressed by column name.
#[derive(Debug, Clone, Copy)]
pub struct Record<'a> {
    columns: &'a [String],
    values: &'a [String],
}

impl<'a> Record<'a> {
    pub fn get(&self, column: &str) -> Option<&'a str> {
        self.columns
            .iter()
            .position(|c| c == column)
            .map(|idx| self.values[idx].as_str())
    }

    /// Value of `column`, or the empty string when the column is absent.
    pub fn value(&self, column: &str) -> &'a str {
        self.get(column).unwrap_or_default()
    }

    pub fn at(&self, index: usize) -> &'a str {
        self.values.get(index).map(String::as_str).unwrap_or_default()
    }

    pub fn values(&self) -> &'a [String] {
        self.values
    }

    pub fn fields(&self) -> impl Iterator<Item = (&'a str, &'a str)> + 'a {
        self.columns
            .iter()
            .zip(self.values)
            .map(|(c, v)| (c.as_str(), v.as_str()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttendanceStatus {
    Attended,
    DidNotAttend,
    RegisteredOnly,
}

impl AttendanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Attended => "attended",
            Self::DidNotAttend => "did_not_attend",
            Self::RegisteredOnly => "registered_only",
        }
    }
}

impl fmt::Display for AttendanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttendanceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "attended" => Ok(Self::Attended),
            "did_not_attend" => Ok(Self::DidNotAttend),
            "registered_only" => Ok(Self::RegisteredOnly),
            other => Err(format!("unknown attendance status {other:?}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_header_is_rejected() {
        let err = Table::new(vec!["BMID".into(), "BMID".into()]).unwrap_err();
        assert_eq!(err, TableError::DuplicateColumn("BMID".into()));
    }

    #[test]
    fn short_rows_are_padded_to_header_width() {
        let table = Table::from_rows(["a", "b", "c"], [vec!["1"]]).unwrap();
        assert_eq!(table.rows()[0], vec!["1", "", ""]);
        let record = table.record(0).unwrap();
        assert_eq!(record.value("c"), "");
        assert_eq!(record.get("missing"), None);
    }

    #[test]
    fn filter_preserves_order_and_leaves_input_untouched() {
        let table = Table::from_rows(["k"], [["1"], ["2"], ["3"]]).unwrap();
        let odd = table.filter(|r| r.value("k") != "2");
        assert_eq!(odd.rows(), &[vec!["1".to_string()], vec!["3".to_string()]]);
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn set_column_appends_when_missing_and_replaces_when_present() {
        let table = Table::from_rows(["k"], [["a"], ["b"]]).unwrap();
        let added = table.set_column("n", |r| format!("{}!", r.value("k")));
        assert_eq!(added.columns(), &["k".to_string(), "n".to_string()]);
        assert_eq!(added.record(1).unwrap().value("n"), "b!");

        let replaced = added.set_column("n", |_| "0".to_string());
        assert_eq!(replaced.columns().len(), 2);
        assert_eq!(replaced.record(0).unwrap().value("n"), "0");
    }

    #[test]
    fn append_columns_rejects_collisions() {
        let table = Table::from_rows(["k"], [["a"]]).unwrap();
        let err = table.append_columns(&["k".to_string()], |_| vec![]).unwrap_err();
        assert_eq!(err, TableError::DuplicateColumn("k".into()));
    }

    #[test]
    fn attendance_status_round_trips_through_strings() {
        for status in [
            AttendanceStatus::Attended,
            AttendanceStatus::DidNotAttend,
            AttendanceStatus::RegisteredOnly,
        ] {
            assert_eq!(status.as_str().parse::<AttendanceStatus>().unwrap(), status);
        }
        assert!("maybe".parse::<AttendanceStatus>().is_err());
    }
}
