//! Error Recovery
//!
//! Builds revision prompts from an error classification, plus the local
//! rewrites tried before spending a model call.

use super::classifier::SqlErrorClass;
use crate::model::{CellHit, Question};
use crate::schema::{SchemaCatalog, SchemaView};
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref QUERY_START: Regex = Regex::new(r"(?i)\b(select|with)\b").unwrap();
    static ref TRAILING_PROSE: Regex = Regex::new(r"(?s);\s*\S.*$").unwrap();
}

pub struct ErrorRecovery;

impl ErrorRecovery {
    pub fn new() -> Self {
        Self
    }

    /// Prompt for a semantic revision guided by the latest error
    pub fn build_recovery_prompt(
        &self,
        error_class: &SqlErrorClass,
        error: &str,
        sql: &str,
        question: &Question,
        catalog: &SchemaCatalog,
        cells: &[CellHit],
        attempt: usize,
    ) -> String {
        let mut prompt_parts = Vec::new();

        prompt_parts.push(format!(
            "RETRY ATTEMPT {}: the query below failed for the question \"{}\".",
            attempt, question.raw
        ));
        prompt_parts.push(format!("Query:\n{}", sql));
        prompt_parts.push(format!("Error: {}", error));

        match error_class {
            SqlErrorClass::UnknownColumn => {
                prompt_parts.push("A column referenced in the query does not exist.".to_string());
                prompt_parts.push("Use only columns listed in the schema, qualified with their table.".to_string());
            }
            SqlErrorClass::UnknownTable => {
                prompt_parts.push("A table referenced in the query does not exist.".to_string());
                let names: Vec<&str> = catalog.tables.iter().map(|t| t.name.as_str()).collect();
                prompt_parts.push(format!("Available tables: {}", names.join(", ")));
            }
            SqlErrorClass::AmbiguousColumn => {
                prompt_parts.push("A column reference is ambiguous (exists in multiple tables).".to_string());
                prompt_parts.push("Qualify every column with its table name or alias.".to_string());
            }
            SqlErrorClass::TypeMismatch => {
                prompt_parts.push("A comparison or function received a value of the wrong type.".to_string());
                prompt_parts.push("Quote text literals, leave numbers unquoted, and CAST where types differ.".to_string());
            }
            SqlErrorClass::InvalidAggregation => {
                prompt_parts.push("An aggregate function is used where it is not allowed.".to_string());
                prompt_parts.push("Move aggregate conditions to HAVING and group by every non-aggregated column.".to_string());
            }
            SqlErrorClass::Syntax => {
                prompt_parts.push("The query is not valid SQLite syntax.".to_string());
            }
            SqlErrorClass::WriteRejected => {
                prompt_parts.push("Only a single read-only SELECT statement is allowed.".to_string());
            }
            SqlErrorClass::Timeout => {
                prompt_parts.push("The query ran too long.".to_string());
                prompt_parts.push("Avoid cross joins and unnecessary subqueries; join only on the listed join edges.".to_string());
            }
            SqlErrorClass::Other(_) => {
                prompt_parts.push("Please review the query and fix any issues.".to_string());
            }
        }

        prompt_parts.push(format!(
            "Schema:\n{}",
            catalog.render(SchemaView::Light, &question.matched_tables)
        ));
        if !cells.is_empty() {
            let values: Vec<String> = cells
                .iter()
                .take(8)
                .map(|c| format!("- {} = '{}'", c.column, c.value))
                .collect();
            prompt_parts.push(format!("Known database values:\n{}", values.join("\n")));
        }

        prompt_parts.push("Return only the corrected SQL query.".to_string());
        prompt_parts.join("\n\n")
    }
}

impl Default for ErrorRecovery {
    fn default() -> Self {
        Self::new()
    }
}

/// Cheap syntactic repairs: leading prose, code fences, trailing statements
/// and semicolons, unbalanced parentheses. `None` when nothing changed.
pub fn local_fix(sql: &str) -> Option<String> {
    let mut fixed = crate::llm::clean_sql_response(sql);

    if let Some(m) = QUERY_START.find(&fixed) {
        if m.start() > 0 {
            fixed = fixed[m.start()..].to_string();
        }
    }
    fixed = TRAILING_PROSE.replace(&fixed, "").trim().trim_end_matches(';').trim().to_string();

    let mut depth: i32 = 0;
    let mut balanced = String::with_capacity(fixed.len() + 2);
    let mut in_string = false;
    for ch in fixed.chars() {
        match ch {
            '\'' => in_string = !in_string,
            '(' if !in_string => depth += 1,
            ')' if !in_string => {
                if depth == 0 {
                    continue;
                }
                depth -= 1;
            }
            _ => {}
        }
        balanced.push(ch);
    }
    for _ in 0..depth {
        balanced.push(')');
    }

    if balanced != sql && !balanced.is_empty() {
        Some(balanced)
    } else {
        None
    }
}
