//! Column-name casing used by the default column lookup.
//!
//! Column names are snake_case; upstream items usually are not. The casing
//! decides how `account_id` is spelled when it is looked up on a raw item.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::QuarryError;

/// Words rendered fully upper-case in Pascal/Camel output (`id` → `ID`).
const INITIALISMS: &[&str] = &[
    "ACL", "API", "ARN", "ASCII", "CPU", "CSS", "DNS", "EOF", "GUID", "HTML", "HTTP", "HTTPS",
    "ID", "IP", "IPV4", "IPV6", "JSON", "QPS", "RAM", "RPC", "SLA", "SMTP", "SQL", "SSH", "TCP",
    "TLS", "TTL", "UDP", "UI", "UID", "UUID", "URI", "URL", "VM", "XML",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NameCasing {
    /// `account_id` → `AccountID`
    #[default]
    Pascal,
    /// `account_id` → `accountID`
    Camel,
    /// `account_id` → `account_id`
    Snake,
}

impl NameCasing {
    /// Render a snake_case column name in this casing.
    pub fn convert(&self, column: &str) -> String {
        match self {
            NameCasing::Snake => column.to_string(),
            NameCasing::Pascal => column
                .split('_')
                .filter(|w| !w.is_empty())
                .map(pascal_word)
                .collect(),
            NameCasing::Camel => {
                let mut words = column.split('_').filter(|w| !w.is_empty());
                let mut out = match words.next() {
                    Some(first) => first.to_lowercase(),
                    None => return String::new(),
                };
                for w in words {
                    out.push_str(&pascal_word(w));
                }
                out
            }
        }
    }
}

fn pascal_word(word: &str) -> String {
    let upper = word.to_uppercase();
    if INITIALISMS.contains(&upper.as_str()) {
        return upper;
    }
    let mut chars = word.chars();
    match chars.next() {
        Some(c) => c.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

impl FromStr for NameCasing {
    type Err = QuarryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pascal" => Ok(NameCasing::Pascal),
            "camel" => Ok(NameCasing::Camel),
            "snake" => Ok(NameCasing::Snake),
            other => Err(QuarryError::Config(format!("unknown name casing '{other}'"))),
        }
    }
}

impl fmt::Display for NameCasing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NameCasing::Pascal => write!(f, "pascal"),
            NameCasing::Camel => write!(f, "camel"),
            NameCasing::Snake => write!(f, "snake"),
        }
    }
}
