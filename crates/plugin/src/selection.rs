//! Table selection: which parts of the table forest a sync covers.
//!
//! Patterns may contain `*` wildcards. A table is kept when it matches
//! `tables`, when one of its relations is kept (ancestors come along), or when
//! its parent is kept and dependent tables are not skipped. Anything matching
//! `skip_tables` is removed together with its relations.

use std::sync::Arc;

use quarry_core::{flatten, QuarryError, Result, Table};
use serde::{Deserialize, Serialize};

/// Selects every table.
pub const ALL_TABLES: &str = "*";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TableOptions {
    pub tables: Vec<String>,
    pub skip_tables: Vec<String>,
}

impl Default for TableOptions {
    fn default() -> Self {
        Self {
            tables: vec![ALL_TABLES.to_string()],
            skip_tables: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncOptions {
    #[serde(flatten)]
    pub selection: TableOptions,
    /// Only sync relations that were selected explicitly.
    pub skip_dependent_tables: bool,
    /// Derive each record id from its values instead of a random uuid.
    pub deterministic_id: bool,
}

impl SyncOptions {
    pub fn tables(tables: &[&str]) -> Self {
        Self {
            selection: TableOptions {
                tables: tables.iter().map(|t| t.to_string()).collect(),
                skip_tables: Vec::new(),
            },
            skip_dependent_tables: false,
            deterministic_id: false,
        }
    }
}

/// Apply `options` to the forest. Returned tables are pruned copies; the
/// input is left untouched.
pub fn select_tables(
    tables: &[Arc<Table>],
    options: &TableOptions,
    skip_dependent_tables: bool,
) -> Result<Vec<Arc<Table>>> {
    let include = normalize_include(&options.tables)?;
    let all = flatten(tables);
    for pattern in &include {
        if !all.iter().any(|t| glob_match(pattern, &t.name)) {
            return Err(QuarryError::Selection(format!(
                "tables include a pattern {pattern} with no matches"
            )));
        }
    }
    for pattern in &options.skip_tables {
        if !all.iter().any(|t| glob_match(pattern, &t.name)) {
            return Err(QuarryError::Selection(format!(
                "skip_tables include a pattern {pattern} with no matches"
            )));
        }
    }

    let filter = Filter {
        include: &include,
        skip: &options.skip_tables,
        skip_dependent_tables,
    };
    Ok(tables
        .iter()
        .filter_map(|t| filter.apply(t, false))
        .collect())
}

fn normalize_include(tables: &[String]) -> Result<Vec<String>> {
    if tables.is_empty() {
        return Ok(vec![ALL_TABLES.to_string()]);
    }
    if tables.len() > 1 && tables.iter().any(|t| t == ALL_TABLES) {
        return Err(QuarryError::Selection(
            "wildcard \"*\" cannot be combined with explicit table names".to_string(),
        ));
    }
    Ok(tables.to_vec())
}

struct Filter<'a> {
    include: &'a [String],
    skip: &'a [String],
    skip_dependent_tables: bool,
}

impl Filter<'_> {
    fn apply(&self, table: &Arc<Table>, parent_matched: bool) -> Option<Arc<Table>> {
        if self.skip.iter().any(|p| glob_match(p, &table.name)) {
            return None;
        }
        let mut matched = (parent_matched && !self.skip_dependent_tables)
            || self.include.iter().any(|p| glob_match(p, &table.name));

        let relations: Vec<Arc<Table>> = table
            .relations
            .iter()
            .filter_map(|r| self.apply(r, matched))
            .collect();
        if !relations.is_empty() {
            matched = true;
        }
        if !matched {
            return None;
        }

        let mut pruned = Table::clone(table);
        pruned.relations = relations;
        Some(Arc::new(pruned))
    }
}

/// `*` matches any run of characters, everything else matches literally.
pub fn glob_match(pattern: &str, name: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let n: Vec<char> = name.chars().collect();
    let (mut pi, mut ni) = (0, 0);
    let mut star: Option<usize> = None;
    let mut resume = 0;

    while ni < n.len() {
        if pi < p.len() && p[pi] != '*' && p[pi] == n[ni] {
            pi += 1;
            ni += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some(pi);
            resume = ni;
            pi += 1;
        } else if let Some(s) = star {
            pi = s + 1;
            resume += 1;
            ni = resume;
        } else {
            return false;
        }
    }
    p[pi..].iter().all(|&c| c == '*')
}
