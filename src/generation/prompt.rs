//! Prompt Builders
//!
//! Renders generation prompts from the question, retrieval context and a
//! schema view.

use crate::config::PromptStyle;
use crate::model::{CellHit, ExampleHit, Question, RetrievalContext};
use crate::schema::{SchemaCatalog, SchemaView};

const MAX_CELL_HINTS: usize = 12;

fn render_examples(examples: &[ExampleHit], shots: usize) -> String {
    examples
        .iter()
        .take(shots)
        .map(|e| format!("Question: {}\nSQL: {}", e.question, e.sql))
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn render_cells(cells: &[CellHit]) -> String {
    cells
        .iter()
        .take(MAX_CELL_HINTS)
        .map(|c| format!("- {} = '{}'", c.column, c.value.replace('\'', "''")))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Few-shot prompt for one ICL sampling configuration
pub fn icl_prompt(
    style: PromptStyle,
    question: &Question,
    context: &RetrievalContext,
    catalog: &SchemaCatalog,
    shots: usize,
) -> String {
    let schema = catalog.render(SchemaView::Light, &question.matched_tables);
    let examples = render_examples(&context.examples, shots);
    let mut parts = Vec::new();

    match style {
        PromptStyle::Basic => {
            parts.push("Translate the question into a single SQLite SELECT statement.".to_string());
            parts.push(format!("Schema:\n{}", schema));
            if !examples.is_empty() {
                parts.push(format!("Examples:\n{}", examples));
            }
        }
        PromptStyle::ValueGrounded => {
            parts.push("Translate the question into a single SQLite SELECT statement.".to_string());
            parts.push(format!("Schema:\n{}", schema));
            if !context.cells.is_empty() {
                parts.push(format!(
                    "Database values that may be referenced (use them verbatim in filters):\n{}",
                    render_cells(&context.cells)
                ));
            }
            if !examples.is_empty() {
                parts.push(format!("Examples:\n{}", examples));
            }
        }
        PromptStyle::ExampleFirst => {
            if !examples.is_empty() {
                parts.push(format!("Solved examples:\n{}", examples));
            }
            parts.push(format!("Tables:\n{}", schema));
            parts.push("Write one SQLite SELECT statement in the same style.".to_string());
        }
    }

    parts.push(format!("Question: {}\nSQL:", question.raw));
    parts.join("\n\n")
}

/// Decomposition prompt over the full schema
pub fn reasoning_prompt(question: &Question, context: &RetrievalContext, catalog: &SchemaCatalog) -> String {
    let mut parts = vec![
        "You are answering a question over a SQLite database.".to_string(),
        format!("Full schema:\n{}", catalog.render(SchemaView::Full, &[])),
    ];
    if !context.cells.is_empty() {
        parts.push(format!("Known database values:\n{}", render_cells(&context.cells)));
    }
    parts.push(format!("Question: {}", question.raw));
    parts.push(
        "Work step by step:\n\
         1. List the tables and columns the question needs.\n\
         2. Decide the joins using the join edges above.\n\
         3. Decide filters, grouping and ordering.\n\
         4. Write the final query.\n\
         End with the final SQL in a ```sql code block."
            .to_string(),
    );
    parts.join("\n\n")
}

/// Prompt asking the model to repair a query that failed to parse or validate
pub fn syntax_fix_prompt(sql: &str, error: &str, catalog: &SchemaCatalog, matched_tables: &[String]) -> String {
    format!(
        "The following SQLite query is invalid.\n\nSchema:\n{}\n\nQuery:\n{}\n\nError: {}\n\n\
         Return only the corrected SQL query.",
        catalog.render(SchemaView::Light, matched_tables),
        sql,
        error
    )
}
