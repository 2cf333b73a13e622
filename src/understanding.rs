//! Task Understanding
//!
//! Normalizes the question, extracts keywords, builds the intent skeleton and
//! scores how well the question grounds in the schema.

use crate::model::Question;
use crate::schema::SchemaCatalog;
use chrono::NaiveDate;
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::{BTreeSet, HashSet};
use strsim::jaro_winkler;

lazy_static! {
    static ref SLASH_DATE: Regex = Regex::new(r"\b(\d{1,2})/(\d{1,2})/(\d{4})\b").unwrap();
    static ref DOT_DATE: Regex = Regex::new(r"\b(\d{1,2})\.(\d{1,2})\.(\d{4})\b").unwrap();
    static ref ISO_DATE: Regex = Regex::new(r"\b\d{4}-\d{2}-\d{2}\b").unwrap();
    static ref THOUSANDS: Regex = Regex::new(r"\b(\d{1,3}(?:,\d{3})+)(\.\d+)?\b").unwrap();
    static ref SCALED: Regex = Regex::new(r"\b(\d+(?:\.\d+)?)\s?([km])\b").unwrap();
    static ref QUOTED: Regex = Regex::new(r#""([^"]+)"|'([^']+)'"#).unwrap();
    static ref NUMBER: Regex = Regex::new(r"^\d+(?:\.\d+)?$").unwrap();
    static ref TOKEN: Regex = Regex::new(r"<[a-z]+>|[a-z0-9_]+(?:-[0-9]{2}-[0-9]{2})?").unwrap();
}

const STOPWORDS: &[&str] = &[
    "a", "an", "the", "of", "in", "on", "for", "to", "by", "with", "and", "or", "is", "are", "was",
    "were", "be", "what", "which", "who", "whom", "how", "many", "much", "show", "me", "list",
    "give", "find", "get", "all", "each", "every", "per", "from", "that", "this", "these", "those",
    "there", "their", "it", "its", "do", "does", "did", "have", "has", "had", "than", "as", "at",
    "please", "tell", "return", "display", "i", "we", "our", "my", "any", "into", "between",
];

/// Intent words shape the skeleton but are not grounding keywords
const INTENT_WORDS: &[&str] = &[
    "total", "sum", "count", "number", "average", "avg", "mean", "max", "maximum", "min",
    "minimum", "highest", "lowest", "top", "most", "least", "distinct", "unique", "first", "last",
    "year", "years", "month", "months", "week", "weeks", "day", "days", "today", "yesterday",
    "current", "previous", "recent", "ago", "since", "before", "after", "greater", "less", "more",
    "fewer", "over", "under", "above", "below", "order", "sorted", "ascending", "descending",
];

/// Fuzzy match floor for keyword-to-identifier grounding
const MATCH_THRESHOLD: f64 = 0.88;

pub struct TaskUnderstanding {
    identifiers: BTreeSet<String>,
    catalog: SchemaCatalog,
}

impl TaskUnderstanding {
    pub fn new(catalog: &SchemaCatalog) -> Self {
        Self {
            identifiers: catalog.identifiers(),
            catalog: catalog.clone(),
        }
    }

    pub fn understand(&self, raw: &str) -> Question {
        let normalized = normalize(raw);
        let tokens = tokenize(&normalized);
        let stop: HashSet<&str> = STOPWORDS.iter().copied().collect();
        let intent: HashSet<&str> = INTENT_WORDS.iter().copied().collect();

        let mut keywords: Vec<String> = Vec::new();
        let mut skeleton_parts: Vec<String> = Vec::new();
        let mut matched_tables: BTreeSet<String> = BTreeSet::new();
        let mut ambiguous = false;

        for token in &tokens {
            if token.starts_with('<') {
                skeleton_parts.push(token.clone());
                continue;
            }
            if ISO_DATE.is_match(token) {
                skeleton_parts.push("<date>".to_string());
                continue;
            }
            if NUMBER.is_match(token) {
                skeleton_parts.push("<num>".to_string());
                continue;
            }
            if stop.contains(token.as_str()) || intent.contains(token.as_str()) {
                skeleton_parts.push(token.clone());
                continue;
            }

            if !keywords.contains(token) {
                keywords.push(token.clone());
            }
            match self.ground(token) {
                Some(grounding) => {
                    if grounding.column_tables.len() > 1 && grounding.table.is_none() {
                        ambiguous = true;
                    }
                    if let Some(table) = grounding.table {
                        matched_tables.insert(table);
                    }
                    for table in grounding.column_tables {
                        matched_tables.insert(table);
                    }
                    skeleton_parts.push("<schema>".to_string());
                }
                None => skeleton_parts.push(token.clone()),
            }
        }

        // each keyword counts once even if repeated in the question
        let grounded = keywords.iter().filter(|k| self.ground(k).is_some()).count();
        let confidence_score = if keywords.is_empty() {
            0.0
        } else {
            grounded as f64 / keywords.len() as f64
        };

        Question {
            raw: raw.to_string(),
            normalized,
            skeleton: collapse_placeholders(&skeleton_parts),
            keywords,
            matched_tables: matched_tables.into_iter().collect(),
            confidence_score,
            ambiguous,
        }
    }

    /// Match a keyword to a table name or to columns, tolerating plurals and typos
    fn ground(&self, token: &str) -> Option<Grounding> {
        let table = self
            .catalog
            .tables
            .iter()
            .find(|t| token_matches(token, &t.name.to_lowercase()))
            .map(|t| t.name.to_lowercase());

        let column_tables: Vec<String> = self
            .catalog
            .tables
            .iter()
            .filter(|t| {
                t.columns.iter().any(|c| {
                    let name = c.name.to_lowercase();
                    token_matches(token, &name)
                        || name.split('_').any(|part| part.len() > 2 && token_matches(token, part))
                })
            })
            .map(|t| t.name.to_lowercase())
            .collect();

        if table.is_none() && column_tables.is_empty() {
            let fuzzy = self.identifiers.iter().any(|id| jaro_winkler(token, id) >= MATCH_THRESHOLD);
            if !fuzzy {
                return None;
            }
        }
        Some(Grounding { table, column_tables })
    }
}

struct Grounding {
    table: Option<String>,
    column_tables: Vec<String>,
}

fn token_matches(token: &str, identifier: &str) -> bool {
    if token == identifier {
        return true;
    }
    let singular = |s: &str| -> String {
        if let Some(stem) = s.strip_suffix("ies") {
            format!("{}y", stem)
        } else if s.len() > 3 {
            s.trim_end_matches('s').to_string()
        } else {
            s.to_string()
        }
    };
    let (a, b) = (singular(token), singular(identifier));
    a == b || (a.len() >= 4 && jaro_winkler(&a, &b) >= MATCH_THRESHOLD)
}

/// Lowercase, ISO dates, plain numbers, collapsed whitespace
pub fn normalize(raw: &str) -> String {
    let mut text = raw.trim().to_string();

    text = SLASH_DATE
        .replace_all(&text, |caps: &regex::Captures| iso_date(&caps[3], &caps[1], &caps[2], true, &caps[0]))
        .into_owned();
    text = DOT_DATE
        .replace_all(&text, |caps: &regex::Captures| iso_date(&caps[3], &caps[1], &caps[2], false, &caps[0]))
        .into_owned();
    text = THOUSANDS
        .replace_all(&text, |caps: &regex::Captures| {
            format!("{}{}", caps[1].replace(',', ""), caps.get(2).map(|m| m.as_str()).unwrap_or(""))
        })
        .into_owned();

    let mut text = text.to_lowercase();
    text = SCALED
        .replace_all(&text, |caps: &regex::Captures| {
            let base: f64 = caps[1].parse().unwrap_or(0.0);
            let factor = if &caps[2] == "k" { 1_000.0 } else { 1_000_000.0 };
            let value = base * factor;
            if value.fract() == 0.0 {
                format!("{}", value as i64)
            } else {
                format!("{}", value)
            }
        })
        .into_owned();

    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// US style month/day for slashes, day/month for dots; invalid dates are left as written
fn iso_date(year: &str, first: &str, second: &str, month_first: bool, original: &str) -> String {
    let (month, day) = if month_first { (first, second) } else { (second, first) };
    let parsed = NaiveDate::parse_from_str(&format!("{}-{}-{}", year, month, day), "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(&format!("{}-{}-{}", year, day, month), "%Y-%m-%d"));
    match parsed {
        Ok(date) => date.format("%Y-%m-%d").to_string(),
        Err(_) => original.to_string(),
    }
}

fn tokenize(normalized: &str) -> Vec<String> {
    let masked = QUOTED.replace_all(normalized, " <value> ");
    TOKEN
        .find_iter(&masked)
        .map(|m| m.as_str().to_string())
        .collect()
}

fn collapse_placeholders(parts: &[String]) -> String {
    let mut out: Vec<&str> = Vec::new();
    for part in parts {
        if part.starts_with('<') && out.last() == Some(&part.as_str()) {
            continue;
        }
        out.push(part.as_str());
    }
    out.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::sales_catalog;

    #[test]
    fn test_normalize_dates_and_numbers() {
        assert_eq!(normalize("Sales  after 03/15/2024"), "sales after 2024-03-15");
        assert_eq!(normalize("orders over 1,250,000"), "orders over 1250000");
        assert_eq!(normalize("Revenue above 10k"), "revenue above 10000");
        assert_eq!(normalize("on 15.03.2024"), "on 2024-03-15");
    }

    #[test]
    fn test_grounded_question_has_full_confidence() {
        let understanding = TaskUnderstanding::new(&sales_catalog());
        let question = understanding.understand("Total sales by employee this year");
        assert_eq!(question.keywords, vec!["sales".to_string(), "employee".to_string()]);
        assert_eq!(question.confidence_score, 1.0);
        assert!(!question.ambiguous);
        assert!(question.matched_tables.contains(&"sales".to_string()));
        assert!(question.matched_tables.contains(&"employees".to_string()));
        assert_eq!(question.skeleton, "total <schema> by <schema> this year");
    }

    #[test]
    fn test_ungrounded_question_has_low_confidence() {
        let understanding = TaskUnderstanding::new(&sales_catalog());
        let question = understanding.understand("weather forecast for tomorrow");
        assert!(question.confidence_score < 0.5);
    }

    #[test]
    fn test_column_shared_by_tables_is_ambiguous() {
        let understanding = TaskUnderstanding::new(&sales_catalog());
        let question = understanding.understand("list every name");
        assert!(question.ambiguous);
    }

    #[test]
    fn test_skeleton_masks_values() {
        let understanding = TaskUnderstanding::new(&sales_catalog());
        let question = understanding.understand("sales in region 'West' above 500");
        assert_eq!(question.skeleton, "<schema> in <schema> <value> above <num>");
    }
}
