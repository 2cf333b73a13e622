//! SQL Analysis
//!
//! Parse checks, canonical forms and structural features of candidate SQL.
//! Uses the sqlparser AST where the statement parses and falls back to
//! pattern heuristics where it does not.

use crate::error::{PipelineError, Result};
use crate::schema::SchemaCatalog;
use lazy_static::lazy_static;
use regex::Regex;
use sqlparser::ast::{Query, SetExpr, Statement, TableFactor, TableWithJoins};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;
use std::collections::{BTreeSet, HashMap};

lazy_static! {
    static ref WHITESPACE: Regex = Regex::new(r"\s+").unwrap();
    static ref AGGREGATE: Regex =
        Regex::new(r"(?i)\b(count|sum|avg|min|max|group_concat|string_agg|array_agg|total)\s*\(").unwrap();
    static ref JOIN_KEYWORD: Regex = Regex::new(r"(?i)\bjoin\b").unwrap();
    static ref WHERE_CLAUSE: Regex = Regex::new(
        r"(?is)\bwhere\b(.*?)(\bgroup\s+by\b|\border\s+by\b|\bhaving\b|\blimit\b|\bunion\b|\)\s*$|$)"
    )
    .unwrap();
    static ref STRING_LITERAL: Regex = Regex::new(r"'((?:[^']|'')*)'").unwrap();
    static ref NUMBER_LITERAL: Regex = Regex::new(r"\b\d+(?:\.\d+)?\b").unwrap();
    static ref TABLE_AS: Regex = Regex::new(r"\b([A-Za-z_][\w.]*) AS ([A-Za-z_]\w*)\b").unwrap();
    static ref QUALIFIED_IDENT: Regex = Regex::new(r"\b([A-Za-z_]\w*)\.([A-Za-z_]\w*)\b").unwrap();
    static ref BARE_IDENT: Regex = Regex::new(r"\b([A-Za-z_]\w*)\b").unwrap();
    static ref FROM_TABLE: Regex = Regex::new(r"(?i)\b(?:from|join)\s+([A-Za-z_][\w.]*)").unwrap();
}

/// Parse with the generic dialect
pub fn parse(sql: &str) -> Result<Vec<Statement>> {
    Parser::parse_sql(&GenericDialect {}, sql).map_err(|e| PipelineError::Parse(e.to_string()))
}

/// A candidate must be exactly one read-only query statement
pub fn check_syntax(sql: &str) -> Result<Box<Query>> {
    let mut statements = parse(sql)?;
    if statements.len() != 1 {
        return Err(PipelineError::Parse(format!(
            "expected exactly one statement, found {}",
            statements.len()
        )));
    }
    match statements.remove(0) {
        Statement::Query(query) => Ok(query),
        other => Err(PipelineError::Validation(format!(
            "only read-only SELECT queries are allowed, got: {}",
            first_keyword(&other.to_string())
        ))),
    }
}

fn first_keyword(sql: &str) -> String {
    sql.split_whitespace().next().unwrap_or("").to_uppercase()
}

/// Whitespace and alias normalized text used for exact-duplicate detection.
/// String literals keep their case.
pub fn canonicalize(sql: &str) -> String {
    let trimmed = sql.trim().trim_end_matches(';').trim();
    match parse(trimmed) {
        Ok(statements) if statements.len() == 1 => {
            let rendered = statements[0].to_string();
            let aliases = match &statements[0] {
                Statement::Query(query) => table_aliases(query),
                _ => HashMap::new(),
            };
            lowercase_outside_literals(&normalize_aliases(&rendered, &aliases))
        }
        _ => lowercase_outside_literals(&WHITESPACE.replace_all(trimmed, " ")),
    }
}

/// Single pass per segment so one rewrite never feeds another; literals are copied as is.
fn normalize_aliases(rendered: &str, aliases: &HashMap<String, String>) -> String {
    if aliases.is_empty() {
        return rendered.to_string();
    }
    let mut out = String::with_capacity(rendered.len());
    let mut last = 0;
    for literal in STRING_LITERAL.find_iter(rendered) {
        out.push_str(&unalias(&rendered[last..literal.start()], aliases));
        out.push_str(literal.as_str());
        last = literal.end();
    }
    out.push_str(&unalias(&rendered[last..], aliases));
    out
}

fn unalias(segment: &str, aliases: &HashMap<String, String>) -> String {
    let declared = TABLE_AS.replace_all(segment, |caps: &regex::Captures| match aliases.get(&caps[2]) {
        Some(table) if *table == caps[1] => table.clone(),
        _ => caps[0].to_string(),
    });
    QUALIFIED_IDENT
        .replace_all(&declared, |caps: &regex::Captures| match aliases.get(&caps[1]) {
            Some(table) => format!("{}.{}", table, &caps[2]),
            None => caps[0].to_string(),
        })
        .into_owned()
}

fn lowercase_outside_literals(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut in_literal = false;
    for ch in sql.chars() {
        if ch == '\'' {
            in_literal = !in_literal;
            out.push(ch);
        } else if in_literal {
            out.push(ch);
        } else {
            out.extend(ch.to_lowercase());
        }
    }
    out
}

/// alias -> table, skipped for tables aliased more than once (self joins)
fn table_aliases(query: &Query) -> HashMap<String, String> {
    let mut pairs: Vec<(String, String)> = Vec::new();
    visit_tables(query, &mut |factor| {
        if let TableFactor::Table { name, alias: Some(alias), .. } = factor {
            pairs.push((alias.name.value.clone(), name.to_string()));
        }
    });
    let mut per_table: HashMap<String, usize> = HashMap::new();
    for (_, table) in &pairs {
        *per_table.entry(table.clone()).or_insert(0) += 1;
    }
    pairs
        .into_iter()
        .filter(|(alias, table)| per_table.get(table) == Some(&1) && alias != table)
        .collect()
}

fn visit_tables(query: &Query, f: &mut dyn FnMut(&TableFactor)) {
    if let Some(ref with) = query.with {
        for cte in &with.cte_tables {
            visit_tables(&cte.query, f);
        }
    }
    visit_set_expr(&query.body, f);
}

fn visit_set_expr(body: &SetExpr, f: &mut dyn FnMut(&TableFactor)) {
    match body {
        SetExpr::Select(select) => {
            for twj in &select.from {
                visit_table_with_joins(twj, f);
            }
        }
        SetExpr::Query(query) => visit_tables(query, f),
        SetExpr::SetOperation { left, right, .. } => {
            visit_set_expr(left, f);
            visit_set_expr(right, f);
        }
        _ => {}
    }
}

fn visit_table_with_joins(twj: &TableWithJoins, f: &mut dyn FnMut(&TableFactor)) {
    visit_factor(&twj.relation, f);
    for join in &twj.joins {
        visit_factor(&join.relation, f);
    }
}

fn visit_factor(factor: &TableFactor, f: &mut dyn FnMut(&TableFactor)) {
    f(factor);
    match factor {
        TableFactor::Derived { subquery, .. } => visit_tables(subquery, f),
        TableFactor::NestedJoin { table_with_joins, .. } => visit_table_with_joins(table_with_joins, f),
        _ => {}
    }
}

fn count_set_expr_joins(body: &SetExpr) -> usize {
    match body {
        SetExpr::Select(select) => {
            let explicit: usize = select.from.iter().map(|twj| twj.joins.len()).sum();
            // comma-separated FROM items are implicit joins
            explicit + select.from.len().saturating_sub(1)
        }
        SetExpr::Query(query) => count_query_joins(query),
        SetExpr::SetOperation { left, right, .. } => count_set_expr_joins(left) + count_set_expr_joins(right),
        _ => 0,
    }
}

fn count_query_joins(query: &Query) -> usize {
    let cte_joins: usize = query
        .with
        .as_ref()
        .map(|w| w.cte_tables.iter().map(|c| count_query_joins(&c.query)).sum())
        .unwrap_or(0);
    cte_joins + count_set_expr_joins(&query.body)
}

pub fn count_joins(sql: &str) -> usize {
    match check_syntax(sql) {
        Ok(query) => count_query_joins(&query),
        Err(_) => JOIN_KEYWORD.find_iter(&strip_literals(sql)).count(),
    }
}

pub fn count_aggregates(sql: &str) -> usize {
    AGGREGATE.find_iter(&strip_literals(sql)).count()
}

/// Whether the outermost query fixes its row order
pub fn has_order_by(sql: &str) -> bool {
    match check_syntax(sql) {
        Ok(query) => !query.order_by.is_empty(),
        Err(_) => sql.to_lowercase().contains("order by"),
    }
}

fn strip_literals(sql: &str) -> String {
    STRING_LITERAL.replace_all(sql, "''").into_owned()
}

/// String and numeric literals appearing in WHERE clauses
pub fn where_literals(sql: &str) -> Vec<String> {
    let mut literals = Vec::new();
    for caps in WHERE_CLAUSE.captures_iter(sql) {
        let clause = match caps.get(1) {
            Some(m) => m.as_str(),
            None => continue,
        };
        for lit in STRING_LITERAL.captures_iter(clause) {
            literals.push(lit[1].replace("''", "'"));
        }
        let without_strings = strip_literals(clause);
        // drop qualified identifiers like t1.col before collecting numbers
        let without_idents = QUALIFIED_IDENT.replace_all(&without_strings, "");
        for num in NUMBER_LITERAL.find_iter(&without_idents) {
            literals.push(num.as_str().to_string());
        }
    }
    literals
}

/// Fraction of WHERE literals that appear among the given values.
/// A query without WHERE literals scores 0.
pub fn where_values_match_ratio(sql: &str, values: &BTreeSet<String>) -> f64 {
    let literals = where_literals(sql);
    if literals.is_empty() {
        return 0.0;
    }
    let matched = literals
        .iter()
        .filter(|lit| values.contains(&lit.to_lowercase()))
        .count();
    matched as f64 / literals.len() as f64
}

/// Table names referenced in FROM/JOIN clauses, CTE names excluded
pub fn referenced_tables(sql: &str) -> Vec<String> {
    let mut tables = BTreeSet::new();
    match check_syntax(sql) {
        Ok(query) => {
            let ctes: BTreeSet<String> = query
                .with
                .as_ref()
                .map(|w| w.cte_tables.iter().map(|c| c.alias.name.value.to_lowercase()).collect())
                .unwrap_or_default();
            visit_tables(&query, &mut |factor| {
                if let TableFactor::Table { name, .. } = factor {
                    let table = name
                        .0
                        .last()
                        .map(|ident| ident.value.to_lowercase())
                        .unwrap_or_default();
                    if !table.is_empty() && !ctes.contains(&table) {
                        tables.insert(table);
                    }
                }
            });
        }
        Err(_) => {
            for caps in FROM_TABLE.captures_iter(&strip_literals(sql)) {
                let name = caps[1].rsplit('.').next().unwrap_or("").to_lowercase();
                if !name.is_empty() {
                    tables.insert(name);
                }
            }
        }
    }
    tables.into_iter().collect()
}

/// (table, column) pairs the query touches that exist in the catalog.
/// Qualified references are resolved through aliases; bare identifiers are
/// attributed to referenced tables that own such a column.
pub fn referenced_columns(sql: &str, catalog: &SchemaCatalog) -> Vec<(String, String)> {
    let tables = referenced_tables(sql);
    let aliases = check_syntax(sql).map(|q| table_aliases(&q)).unwrap_or_default();
    let stripped = strip_literals(sql);
    let mut found: BTreeSet<(String, String)> = BTreeSet::new();

    for caps in QUALIFIED_IDENT.captures_iter(&stripped) {
        let qualifier = caps[1].to_string();
        let table = aliases
            .iter()
            .find(|(alias, _)| alias.eq_ignore_ascii_case(&qualifier))
            .map(|(_, t)| t.clone())
            .unwrap_or(qualifier);
        let column = caps[2].to_string();
        if catalog.has_column(&table, &column) {
            found.insert((table.to_lowercase(), column.to_lowercase()));
        }
    }

    for caps in BARE_IDENT.captures_iter(&stripped) {
        let ident = &caps[1];
        for table in &tables {
            if catalog.has_column(table, ident) {
                found.insert((table.clone(), ident.to_lowercase()));
            }
        }
    }

    found.into_iter().collect()
}

/// Qualified `table.column` references to a catalog table that has no such column
pub fn unknown_qualified_columns(sql: &str, catalog: &SchemaCatalog) -> Vec<String> {
    let aliases = check_syntax(sql).map(|q| table_aliases(&q)).unwrap_or_default();
    let stripped = strip_literals(sql);
    let mut missing: BTreeSet<String> = BTreeSet::new();
    for caps in QUALIFIED_IDENT.captures_iter(&stripped) {
        let qualifier = &caps[1];
        let table = aliases
            .iter()
            .find(|(alias, _)| alias.eq_ignore_ascii_case(qualifier))
            .map(|(_, t)| t.as_str())
            .unwrap_or(qualifier);
        let column = &caps[2];
        if catalog.has_table(table) && !catalog.has_column(table, column) {
            missing.insert(format!("{}.{}", qualifier, column));
        }
    }
    missing.into_iter().collect()
}
