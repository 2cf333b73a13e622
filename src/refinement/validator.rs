//! Schema Validation
//!
//! A candidate is valid when it parses as exactly one read-only query and
//! every table and qualified column it names exists in the catalog.

use crate::error::{PipelineError, Result};
use crate::schema::SchemaCatalog;
use crate::sql;
use std::sync::Arc;

pub struct SchemaValidator {
    catalog: Arc<SchemaCatalog>,
}

impl SchemaValidator {
    pub fn new(catalog: Arc<SchemaCatalog>) -> Self {
        Self { catalog }
    }

    pub fn validate(&self, sql_text: &str) -> Result<()> {
        sql::check_syntax(sql_text)?;

        let unknown_tables: Vec<String> = sql::referenced_tables(sql_text)
            .into_iter()
            .filter(|t| !self.catalog.has_table(t))
            .collect();
        if !unknown_tables.is_empty() {
            return Err(PipelineError::Validation(format!(
                "no such table: {}",
                unknown_tables.join(", ")
            )));
        }

        let unknown_columns = sql::unknown_qualified_columns(sql_text, &self.catalog);
        if !unknown_columns.is_empty() {
            return Err(PipelineError::Validation(format!(
                "no such column: {}",
                unknown_columns.join(", ")
            )));
        }
        Ok(())
    }
}
