//! Error Classifier
//!
//! Classifies parse, validation and execution errors into a taxonomy used to
//! pick recovery instructions.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SqlErrorClass {
    UnknownColumn,
    UnknownTable,
    AmbiguousColumn,
    TypeMismatch,
    InvalidAggregation,
    Syntax,
    WriteRejected,
    Timeout,
    Other(String),
}

impl fmt::Display for SqlErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlErrorClass::UnknownColumn => write!(f, "UnknownColumn"),
            SqlErrorClass::UnknownTable => write!(f, "UnknownTable"),
            SqlErrorClass::AmbiguousColumn => write!(f, "AmbiguousColumn"),
            SqlErrorClass::TypeMismatch => write!(f, "TypeMismatch"),
            SqlErrorClass::InvalidAggregation => write!(f, "InvalidAggregation"),
            SqlErrorClass::Syntax => write!(f, "Syntax"),
            SqlErrorClass::WriteRejected => write!(f, "WriteRejected"),
            SqlErrorClass::Timeout => write!(f, "Timeout"),
            SqlErrorClass::Other(msg) => write!(f, "Other({})", msg),
        }
    }
}

pub struct ErrorClassifier;

impl ErrorClassifier {
    pub fn new() -> Self {
        Self
    }

    pub fn classify(&self, error: &str) -> SqlErrorClass {
        let msg = error.to_lowercase();

        if msg.contains("ambiguous column") {
            return SqlErrorClass::AmbiguousColumn;
        }
        if msg.contains("no such column")
            || msg.contains("unknown column")
            || (msg.contains("column") && msg.contains("does not exist"))
        {
            return SqlErrorClass::UnknownColumn;
        }
        if msg.contains("no such table")
            || msg.contains("unknown table")
            || (msg.contains("table") && msg.contains("does not exist"))
        {
            return SqlErrorClass::UnknownTable;
        }
        if msg.contains("datatype mismatch") || msg.contains("type mismatch") || msg.contains("cannot cast") {
            return SqlErrorClass::TypeMismatch;
        }
        if msg.contains("misuse of aggregate") || msg.contains("aggregate functions are not allowed") {
            return SqlErrorClass::InvalidAggregation;
        }
        if msg.contains("timeout") || msg.contains("timed out") || msg.contains("interrupted") {
            return SqlErrorClass::Timeout;
        }
        if msg.contains("read-only") || msg.contains("readonly") || msg.contains("only read-only select") {
            return SqlErrorClass::WriteRejected;
        }
        if msg.contains("syntax error")
            || msg.contains("parse error")
            || msg.contains("incomplete input")
            || msg.contains("expected")
            || msg.contains("unrecognized token")
        {
            return SqlErrorClass::Syntax;
        }

        SqlErrorClass::Other(error.to_string())
    }
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::new()
    }
}
