//! In-memory tabular input (rows × named columns) and its schema checks.

use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;

use crate::error::AgentError;

/// Columns that must be numeric whenever a table carries them.
pub const KNOWN_NUMERIC_COLUMNS: &[&str] = &[
    "quantity_sold",
    "unit_price",
    "unit_cost",
    "stock_remaining",
    "revenue",
];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataTable {
    columns: Vec<String>,
    rows: Vec<Vec<String>>,
}

/// Summary statistics for one numeric column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnStats {
    pub column: String,
    pub count: usize,
    pub sum: f64,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    pub std_dev: f64,
}

impl DataTable {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<String>>) -> Self {
        let columns = columns.into_iter().map(|c| c.trim().to_string()).collect();
        Self { columns, rows }
    }

    /// Parse comma separated text with a header row. Double quotes escape
    /// commas and `""` inside quoted fields.
    pub fn from_csv_str(raw: &str) -> Result<Self, AgentError> {
        let mut lines = raw
            .lines()
            .map(|line| line.trim_end_matches('\r'))
            .filter(|line| !line.trim().is_empty());

        let header = match lines.next() {
            Some(header) => split_csv_line(header, 1)?,
            None => return Ok(Self::default()),
        };

        let mut rows = Vec::new();
        for (idx, line) in lines.enumerate() {
            rows.push(split_csv_line(line, idx + 2)?);
        }

        Ok(Self::new(header, rows))
    }

    /// Parse `{"columns": [...], "rows": [[...], ...]}`. Numbers and booleans
    /// in cells are kept in their JSON textual form.
    pub fn from_json_str(raw: &str) -> Result<Self, AgentError> {
        #[derive(Deserialize)]
        struct RawTable {
            columns: Vec<String>,
            rows: Vec<Vec<serde_json::Value>>,
        }

        let parsed: RawTable = serde_json::from_str(raw)
            .map_err(|err| AgentError::invalid_input(format!("malformed table JSON: {err}")))?;

        let rows = parsed
            .rows
            .into_iter()
            .map(|row| {
                row.into_iter()
                    .map(|cell| match cell {
                        serde_json::Value::String(text) => text,
                        serde_json::Value::Null => String::new(),
                        other => other.to_string(),
                    })
                    .collect()
            })
            .collect();

        Ok(Self::new(parsed.columns, rows))
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

    pub fn has_column(&self, name: &str) -> bool {
        self.column_index(name).is_some()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|column| column.eq_ignore_ascii_case(name.trim()))
    }

    /// Raw cell values of a column, in row order.
    pub fn column(&self, name: &str) -> Option<Vec<&str>> {
        let idx = self.column_index(name)?;
        Some(
            self.rows
                .iter()
                .map(|row| row.get(idx).map(|cell| cell.trim()).unwrap_or(""))
                .collect(),
        )
    }

    /// Parse every cell of a column as a number. Blank or non-numeric cells
    /// are reported, never skipped.
    pub fn numeric_column(&self, name: &str) -> Result<Vec<f64>, AgentError> {
        let cells = self
            .column(name)
            .ok_or_else(|| AgentError::invalid_input(format!("column '{name}' not found")))?;

        cells
            .iter()
            .enumerate()
            .map(|(idx, cell)| {
                cell.parse::<f64>()
                    .ok()
                    .filter(|value| value.is_finite())
                    .ok_or_else(|| {
                        AgentError::invalid_input(format!(
                            "column '{name}' row {} is not numeric: '{cell}'",
                            idx + 1
                        ))
                    })
            })
            .collect()
    }

    pub fn is_numeric(&self, name: &str) -> bool {
        !self.is_empty() && self.numeric_column(name).is_ok()
    }

    pub fn numeric_columns(&self) -> Vec<&str> {
        self.columns
            .iter()
            .filter(|column| self.is_numeric(column))
            .map(String::as_str)
            .collect()
    }

    /// Minimal schema: non-empty, rectangular, unique headers, at least one
    /// numeric column, and well-known sales columns numeric when present.
    pub fn validate(&self) -> Result<(), AgentError> {
        if self.columns.is_empty() {
            return Err(AgentError::invalid_input("table has no columns"));
        }
        if self.rows.is_empty() {
            return Err(AgentError::invalid_input("table has no rows"));
        }

        for (idx, column) in self.columns.iter().enumerate() {
            if column.is_empty() {
                return Err(AgentError::invalid_input(format!(
                    "column {} has an empty header",
                    idx + 1
                )));
            }
            if self.columns[..idx]
                .iter()
                .any(|other| other.eq_ignore_ascii_case(column))
            {
                return Err(AgentError::invalid_input(format!(
                    "duplicate column '{column}'"
                )));
            }
        }

        for (idx, row) in self.rows.iter().enumerate() {
            if row.len() != self.columns.len() {
                return Err(AgentError::invalid_input(format!(
                    "row {} has {} cells, expected {}",
                    idx + 1,
                    row.len(),
                    self.columns.len()
                )));
            }
        }

        for known in KNOWN_NUMERIC_COLUMNS {
            if self.has_column(known) {
                self.numeric_column(known)?;
            }
        }

        if self.numeric_columns().is_empty() {
            return Err(AgentError::invalid_input(
                "table has no parseable numeric columns",
            ));
        }

        Ok(())
    }

    pub fn column_stats(&self, name: &str) -> Result<ColumnStats, AgentError> {
        let values = self.numeric_column(name)?;
        if values.is_empty() {
            return Err(AgentError::invalid_input(format!(
                "column '{name}' has no values"
            )));
        }

        Ok(ColumnStats {
            column: name.to_string(),
            count: values.len(),
            sum: values.iter().sum(),
            mean: Statistics::mean(&values),
            min: Statistics::min(&values),
            max: Statistics::max(&values),
            std_dev: Statistics::population_std_dev(&values),
        })
    }
}

fn split_csv_line(line: &str, line_no: usize) -> Result<Vec<String>, AgentError> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '"' if in_quotes && chars.peek() == Some(&'"') => {
                current.push('"');
                chars.next();
            }
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                fields.push(current.trim().to_string());
                current.clear();
            }
            other => current.push(other),
        }
    }

    if in_quotes {
        return Err(AgentError::invalid_input(format!(
            "unterminated quote on line {line_no}"
        )));
    }

    fields.push(current.trim().to_string());
    Ok(fields)
}
