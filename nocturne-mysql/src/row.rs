//! Text-protocol row abstraction for query results.

use crate::error::{MysqlError, MysqlResult};
use std::sync::Arc;

/// A row returned from a text-protocol query. Column names are shared
/// across all rows of one resultset.
#[derive(Debug, Clone)]
pub struct Row {
    columns: Arc<Vec<String>>,
    values: Vec<Option<String>>,
}

impl Row {
    pub fn new(columns: Arc<Vec<String>>, values: Vec<Option<String>>) -> Self {
        Self { columns, values }
    }

    /// Number of columns.
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Column value by index; `None` is SQL NULL.
    pub fn get(&self, index: usize) -> MysqlResult<Option<&str>> {
        self.values
            .get(index)
            .map(|v| v.as_deref())
            .ok_or_else(|| MysqlError::NoColumn(format!("index {}", index)))
    }

    /// Column value by name; `None` is SQL NULL.
    pub fn get_by_name(&self, name: &str) -> MysqlResult<Option<&str>> {
        let index = self
            .columns
            .iter()
            .position(|c| c == name)
            .ok_or_else(|| MysqlError::NoColumn(name.to_string()))?;
        self.get(index)
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }
}
