// pgrotate/src/backup/partition.rs
//! Decides how many artifacts one logical database backup expands into.
//!
//! A `pg_dump` restricted to a schema subset cannot recreate the owning
//! database, so every filtered or per-schema backup is accompanied by a
//! database-shell dump (`no_schemas`) that excludes every schema.

use regex::Regex;
use tracing::warn;

use super::naming::SchemaSelector;
use crate::errors::{BackupError, Result};

/// Include-or-exclude pattern filter over database or schema names.
///
/// Patterns are regular expressions matched anywhere in the name, so `abc`
/// matches both `_abc_` and `abcdef`.
#[derive(Debug, Clone, Default)]
pub enum PatternFilter {
    #[default]
    None,
    Include(Vec<Regex>),
    Exclude(Vec<Regex>),
}

impl PatternFilter {
    /// Builds a filter, rejecting the case where both lists are non-empty.
    pub fn from_patterns(
        include: &[String],
        exclude: &[String],
        conflict: impl FnOnce() -> BackupError,
    ) -> Result<Self> {
        match (include.is_empty(), exclude.is_empty()) {
            (true, true) => Ok(PatternFilter::None),
            (false, true) => Ok(PatternFilter::Include(compile(include)?)),
            (true, false) => Ok(PatternFilter::Exclude(compile(exclude)?)),
            (false, false) => Err(conflict()),
        }
    }

    pub fn is_active(&self) -> bool {
        !matches!(self, PatternFilter::None)
    }

    pub fn matches(&self, name: &str) -> bool {
        match self {
            PatternFilter::None => true,
            PatternFilter::Include(patterns) => patterns.iter().any(|p| p.is_match(name)),
            PatternFilter::Exclude(patterns) => !patterns.iter().any(|p| p.is_match(name)),
        }
    }

    /// Names passing the filter, sorted and deduplicated.
    pub fn apply<'a>(&self, names: impl IntoIterator<Item = &'a String>) -> Vec<String> {
        let mut kept: Vec<String> = names.into_iter().filter(|n| self.matches(n)).cloned().collect();
        kept.sort();
        kept.dedup();
        kept
    }
}

fn compile(patterns: &[String]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|pattern| {
            Regex::new(pattern).map_err(|source| BackupError::InvalidPattern {
                pattern: pattern.clone(),
                source,
            })
        })
        .collect()
}

/// One database to back up, with its schema filter.
#[derive(Debug, Clone)]
pub struct BackupTarget {
    pub database: String,
    pub schema_filter: PatternFilter,
}

impl BackupTarget {
    /// Whether the partitioner needs the database's schema names.
    pub fn needs_schema_listing(&self, separate_schema_dumps: bool) -> bool {
        separate_schema_dumps || self.schema_filter.is_active()
    }
}

/// What a single `pg_dump` run covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DumpScope {
    Full,
    /// Restricted to these schemas (`-n`).
    Schemas(Vec<String>),
    /// Database object only; every listed schema is excluded (`-N`).
    Shell(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionItem {
    pub selector: SchemaSelector,
    pub scope: DumpScope,
}

/// Artifacts required for one tier-pass of `target`.
///
/// `schemas` is the database's full schema list; it is ignored when neither
/// filtering nor separate dumps are in effect.
pub fn partition(target: &BackupTarget, schemas: &[String], separate_schema_dumps: bool) -> Vec<PartitionItem> {
    if !target.needs_schema_listing(separate_schema_dumps) {
        return vec![PartitionItem {
            selector: SchemaSelector::AllSchemas,
            scope: DumpScope::Full,
        }];
    }

    let selected = target.schema_filter.apply(schemas);
    let mut all_schemas: Vec<String> = schemas.to_vec();
    all_schemas.sort();
    all_schemas.dedup();

    let mut items = Vec::with_capacity(selected.len() + 1);
    if separate_schema_dumps {
        items.extend(selected.into_iter().map(|schema| PartitionItem {
            selector: SchemaSelector::Schema(schema.clone()),
            scope: DumpScope::Schemas(vec![schema]),
        }));
    } else if selected.is_empty() {
        // pg_dump without -n would dump everything
        warn!(
            "No schemas of database {} match the schema filter; only the database shell is dumped",
            target.database
        );
    } else {
        items.push(PartitionItem {
            selector: SchemaSelector::AllSchemas,
            scope: DumpScope::Schemas(selected),
        });
    }

    items.push(PartitionItem {
        selector: SchemaSelector::NoSchemas,
        scope: DumpScope::Shell(all_schemas),
    });
    items
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    fn conflict() -> BackupError {
        BackupError::ConflictingSchemaFilter {
            scope: "test".to_string(),
        }
    }

    fn target(include: &[&str], exclude: &[&str]) -> anyhow::Result<BackupTarget> {
        Ok(BackupTarget {
            database: "app".to_string(),
            schema_filter: PatternFilter::from_patterns(&strings(include), &strings(exclude), conflict)?,
        })
    }

    #[test]
    fn test_filter_semantics() -> anyhow::Result<()> {
        let things = strings(&["apple", "banana", "cherry", "durian", "eggplant"]);

        let include = PatternFilter::from_patterns(&strings(&["a"]), &[], conflict)?;
        assert_eq!(include.apply(&things), strings(&["apple", "banana", "durian", "eggplant"]));

        let exclude = PatternFilter::from_patterns(&[], &strings(&["a"]), conflict)?;
        assert_eq!(exclude.apply(&things), strings(&["cherry"]));

        let anchored = PatternFilter::from_patterns(&strings(&["n$", "^c"]), &[], conflict)?;
        assert_eq!(anchored.apply(&things), strings(&["cherry", "durian"]));

        assert_eq!(PatternFilter::None.apply(&things), things);
        Ok(())
    }

    #[test]
    fn test_include_and_exclude_conflict() {
        let result = PatternFilter::from_patterns(&strings(&["a"]), &strings(&["b"]), conflict);
        assert!(matches!(result, Err(BackupError::ConflictingSchemaFilter { .. })));
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        let result = PatternFilter::from_patterns(&strings(&["(unclosed"]), &[], conflict);
        assert!(matches!(result, Err(BackupError::InvalidPattern { .. })));
    }

    #[test]
    fn test_unfiltered_single_artifact() -> anyhow::Result<()> {
        let items = partition(&target(&[], &[])?, &[], false);
        assert_eq!(
            items,
            vec![PartitionItem {
                selector: SchemaSelector::AllSchemas,
                scope: DumpScope::Full,
            }]
        );
        Ok(())
    }

    #[test]
    fn test_filtered_without_separate_dumps_adds_shell() -> anyhow::Result<()> {
        let schemas = strings(&["s1", "s2", "public", "audit"]);
        let items = partition(&target(&["^s1$", "^s2$"], &[])?, &schemas, false);
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].selector, SchemaSelector::AllSchemas);
        assert_eq!(items[0].scope, DumpScope::Schemas(strings(&["s1", "s2"])));
        assert_eq!(items[1].selector, SchemaSelector::NoSchemas);
        assert_eq!(items[1].scope, DumpScope::Shell(strings(&["audit", "public", "s1", "s2"])));
        Ok(())
    }

    #[test]
    fn test_separate_dumps_one_per_schema_plus_shell() -> anyhow::Result<()> {
        let schemas = strings(&["public", "billing", "audit"]);
        let items = partition(&target(&[], &["^audit$"])?, &schemas, true);
        let selectors: Vec<_> = items.iter().map(|i| i.selector.clone()).collect();
        assert_eq!(
            selectors,
            vec![
                SchemaSelector::Schema("billing".into()),
                SchemaSelector::Schema("public".into()),
                SchemaSelector::NoSchemas,
            ]
        );
        assert_eq!(items[0].scope, DumpScope::Schemas(strings(&["billing"])));
        Ok(())
    }

    #[test]
    fn test_filter_matching_nothing_keeps_only_shell() -> anyhow::Result<()> {
        let schemas = strings(&["public"]);
        let items = partition(&target(&["^nope$"], &[])?, &schemas, false);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].selector, SchemaSelector::NoSchemas);
        Ok(())
    }
}
