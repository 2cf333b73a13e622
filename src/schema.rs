//! Schema Catalog
//!
//! Tables, columns and foreign-key join edges of the target database, plus the
//! light and full schema views rendered into generation prompts.

use crate::error::{PipelineError, Result};
use rusqlite::{Connection, OpenFlags};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::path::Path;

/// Join distance covered by the light schema view
pub const MAX_JOIN_HOPS: usize = 2;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ColumnSchema {
    pub name: String,
    #[serde(default)]
    pub data_type: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TableSchema {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub columns: Vec<ColumnSchema>,
}

/// Foreign-key style edge `from_table.from_column -> to_table.to_column`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JoinEdge {
    pub from_table: String,
    pub from_column: String,
    pub to_table: String,
    pub to_column: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct SchemaCatalog {
    pub tables: Vec<TableSchema>,
    #[serde(default)]
    pub joins: Vec<JoinEdge>,
}

/// Which slice of the catalog a prompt gets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaView {
    Light,
    Full,
}

impl SchemaCatalog {
    pub fn new(tables: Vec<TableSchema>, joins: Vec<JoinEdge>) -> Self {
        Self { tables, joins }
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Introspect tables, columns and foreign keys from a SQLite database
    pub fn from_sqlite(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open_with_flags(path.as_ref(), OpenFlags::SQLITE_OPEN_READ_ONLY)?;

        let mut table_names = Vec::new();
        {
            let mut stmt = conn.prepare(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
            )?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                table_names.push(row.get::<_, String>(0)?);
            }
        }

        let mut tables = Vec::new();
        let mut joins = Vec::new();
        for table in &table_names {
            let mut columns = Vec::new();
            let mut stmt = conn.prepare("SELECT name, type FROM pragma_table_info(?1)")?;
            let mut rows = stmt.query([table])?;
            while let Some(row) = rows.next()? {
                let data_type: String = row.get(1)?;
                columns.push(ColumnSchema {
                    name: row.get(0)?,
                    data_type: if data_type.is_empty() { None } else { Some(data_type) },
                    description: None,
                });
            }
            tables.push(TableSchema {
                name: table.clone(),
                description: None,
                columns,
            });

            let mut stmt = conn.prepare("SELECT \"table\", \"from\", \"to\" FROM pragma_foreign_key_list(?1)")?;
            let mut rows = stmt.query([table])?;
            while let Some(row) = rows.next()? {
                let to_column: Option<String> = row.get(2)?;
                joins.push(JoinEdge {
                    from_table: table.clone(),
                    from_column: row.get(1)?,
                    to_table: row.get(0)?,
                    to_column: to_column.unwrap_or_else(|| "rowid".to_string()),
                });
            }
        }

        if tables.is_empty() {
            return Err(PipelineError::Config(format!(
                "No tables found in {}",
                path.as_ref().display()
            )));
        }

        Ok(Self { tables, joins })
    }

    pub fn table(&self, name: &str) -> Option<&TableSchema> {
        self.tables.iter().find(|t| t.name.eq_ignore_ascii_case(name))
    }

    pub fn has_table(&self, name: &str) -> bool {
        self.table(name).is_some()
    }

    pub fn has_column(&self, table: &str, column: &str) -> bool {
        self.table(table)
            .map(|t| t.columns.iter().any(|c| c.name.eq_ignore_ascii_case(column)))
            .unwrap_or(false)
    }

    /// Tables containing a column with this name
    pub fn tables_with_column(&self, column: &str) -> Vec<&TableSchema> {
        self.tables
            .iter()
            .filter(|t| t.columns.iter().any(|c| c.name.eq_ignore_ascii_case(column)))
            .collect()
    }

    /// Every lowercase table and column identifier
    pub fn identifiers(&self) -> BTreeSet<String> {
        let mut ids = BTreeSet::new();
        for table in &self.tables {
            ids.insert(table.name.to_lowercase());
            for column in &table.columns {
                ids.insert(column.name.to_lowercase());
            }
        }
        ids
    }

    /// Tables named in `seeds` plus every table within `MAX_JOIN_HOPS` join
    /// edges, so a linking table brings in the table on its far side.
    pub fn neighbourhood(&self, seeds: &[String]) -> Vec<&TableSchema> {
        let mut selected: HashSet<String> = seeds.iter().map(|s| s.to_lowercase()).collect();
        let mut frontier: HashSet<String> = selected.clone();
        for _ in 0..MAX_JOIN_HOPS {
            let mut next: HashSet<String> = HashSet::new();
            for edge in &self.joins {
                let from = edge.from_table.to_lowercase();
                let to = edge.to_table.to_lowercase();
                for (near, far) in [(&from, &to), (&to, &from)] {
                    if frontier.contains(near) && selected.insert(far.clone()) {
                        next.insert(far.clone());
                    }
                }
            }
            if next.is_empty() {
                break;
            }
            frontier = next;
        }
        self.tables
            .iter()
            .filter(|t| selected.contains(&t.name.to_lowercase()))
            .collect()
    }

    /// Render a schema view for prompts. The light view falls back to the full
    /// catalog when no table was matched.
    pub fn render(&self, view: SchemaView, matched_tables: &[String]) -> String {
        let tables: Vec<&TableSchema> = match view {
            SchemaView::Full => self.tables.iter().collect(),
            SchemaView::Light => {
                let subset = self.neighbourhood(matched_tables);
                if subset.is_empty() {
                    self.tables.iter().collect()
                } else {
                    subset
                }
            }
        };
        let names: HashSet<String> = tables.iter().map(|t| t.name.to_lowercase()).collect();

        let mut parts = Vec::new();
        for table in &tables {
            let columns: Vec<String> = table
                .columns
                .iter()
                .map(|c| match (&c.data_type, view) {
                    (Some(ty), SchemaView::Full) => format!("{} {}", c.name, ty),
                    _ => c.name.clone(),
                })
                .collect();
            let mut line = format!("{}({})", table.name, columns.join(", "));
            if view == SchemaView::Full {
                if let Some(ref desc) = table.description {
                    line.push_str(&format!(" -- {}", desc));
                }
            }
            parts.push(line);
        }

        let joins: Vec<String> = self
            .joins
            .iter()
            .filter(|j| {
                names.contains(&j.from_table.to_lowercase()) && names.contains(&j.to_table.to_lowercase())
            })
            .map(|j| format!("{}.{} = {}.{}", j.from_table, j.from_column, j.to_table, j.to_column))
            .collect();
        if !joins.is_empty() {
            parts.push(format!("Joins: {}", joins.join("; ")));
        }

        parts.join("\n")
    }
}

#[cfg(test)]
pub(crate) fn sales_catalog() -> SchemaCatalog {
    SchemaCatalog::new(
        vec![
            TableSchema {
                name: "employees".to_string(),
                description: Some("Sales staff".to_string()),
                columns: vec![
                    ColumnSchema { name: "id".to_string(), data_type: Some("INTEGER".to_string()), description: None },
                    ColumnSchema { name: "name".to_string(), data_type: Some("TEXT".to_string()), description: None },
                    ColumnSchema { name: "region".to_string(), data_type: Some("TEXT".to_string()), description: None },
                ],
            },
            TableSchema {
                name: "sales".to_string(),
                description: None,
                columns: vec![
                    ColumnSchema { name: "id".to_string(), data_type: Some("INTEGER".to_string()), description: None },
                    ColumnSchema { name: "employee_id".to_string(), data_type: Some("INTEGER".to_string()), description: None },
                    ColumnSchema { name: "amount".to_string(), data_type: Some("REAL".to_string()), description: None },
                    ColumnSchema { name: "sale_date".to_string(), data_type: Some("TEXT".to_string()), description: None },
                ],
            },
            TableSchema {
                name: "customers".to_string(),
                description: None,
                columns: vec![
                    ColumnSchema { name: "id".to_string(), data_type: Some("INTEGER".to_string()), description: None },
                    ColumnSchema { name: "name".to_string(), data_type: Some("TEXT".to_string()), description: None },
                ],
            },
        ],
        vec![JoinEdge {
            from_table: "sales".to_string(),
            from_column: "employee_id".to_string(),
            to_table: "employees".to_string(),
            to_column: "id".to_string(),
        }],
    )
}
