//! Translation of per-entity filters into WHERE fragments.
//!
//! The compiler never interprets entity filters itself. It hands each one to
//! a [`FilterTranslator`] together with the alias the entity carries in the
//! compiled query and merges whatever predicates come back.

use indexmap::IndexMap;

use crate::compiler::params::ParamMap;
use crate::error::TranslatorError;
use crate::model::{CommitFilter, IssueFilter, JobRunFilter, OrgUnitConfig, PullRequestFilter};

/// Predicates keyed by the filter field they came from, plus their bindings.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Translation {
    pub predicates: IndexMap<String, String>,
    pub params: ParamMap,
}

impl Translation {
    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }
}

pub type TranslationResult = std::result::Result<Translation, TranslatorError>;

/// Turns entity filters into predicates over a given table alias.
///
/// Implementations must be deterministic: the same filter and alias always
/// yield the same predicates in the same order.
pub trait FilterTranslator {
    fn issues(&self, filter: &IssueFilter, alias: &str, org_unit: &OrgUnitConfig) -> TranslationResult;

    fn pull_requests(
        &self,
        filter: &PullRequestFilter,
        alias: &str,
        org_unit: &OrgUnitConfig,
    ) -> TranslationResult;

    fn commits(&self, filter: &CommitFilter, alias: &str, org_unit: &OrgUnitConfig) -> TranslationResult;

    fn job_runs(&self, filter: &JobRunFilter, alias: &str, org_unit: &OrgUnitConfig) -> TranslationResult;
}

const EXCLUDE_PREFIX: &str = "exclude_";

/// Maps generic `field -> values` criteria onto `IN` lists.
///
/// `exclude_<field>` keys become `NOT IN`, and org-unit user ids restrict
/// the entity's user column when the filter asks for org-unit scoping.
#[derive(Debug, Clone, Copy, Default)]
pub struct CriteriaTranslator;

impl CriteriaTranslator {
    pub fn new() -> Self {
        Self
    }

    fn translate(
        criteria: &IndexMap<String, Vec<String>>,
        alias: &str,
        user_column: &str,
        apply_org_unit_scoping: bool,
        org_unit: &OrgUnitConfig,
    ) -> TranslationResult {
        let mut translation = Translation::default();

        for (key, values) in criteria {
            if values.is_empty() {
                continue;
            }
            let (field, negate) = match key.strip_prefix(EXCLUDE_PREFIX) {
                Some(field) => (field, true),
                None => (key.as_str(), false),
            };
            if !is_identifier(field) {
                return Err(format!("invalid filter field name: {key:?}").into());
            }
            let (name, op) = if negate {
                (format!("{alias}_excl_{field}"), "NOT IN")
            } else {
                (format!("{alias}_{field}"), "IN")
            };
            translation
                .predicates
                .insert(key.clone(), format!("{alias}.{field} {op} (:{name})"));
            translation.params.insert(name, values.clone().into());
        }

        if apply_org_unit_scoping && !org_unit.user_ids.is_empty() {
            let name = format!("{alias}_ou_user_ids");
            translation.predicates.insert(
                "org_unit".to_string(),
                format!("{alias}.{user_column} IN (:{name})"),
            );
            translation
                .params
                .insert(name, org_unit.user_ids.clone().into());
        }

        Ok(translation)
    }
}

impl FilterTranslator for CriteriaTranslator {
    fn issues(&self, filter: &IssueFilter, alias: &str, org_unit: &OrgUnitConfig) -> TranslationResult {
        Self::translate(
            &filter.criteria,
            alias,
            "assignee_id",
            filter.apply_org_unit_scoping,
            org_unit,
        )
    }

    fn pull_requests(
        &self,
        filter: &PullRequestFilter,
        alias: &str,
        org_unit: &OrgUnitConfig,
    ) -> TranslationResult {
        Self::translate(
            &filter.criteria,
            alias,
            "creator_id",
            filter.apply_org_unit_scoping,
            org_unit,
        )
    }

    fn commits(&self, filter: &CommitFilter, alias: &str, org_unit: &OrgUnitConfig) -> TranslationResult {
        Self::translate(
            &filter.criteria,
            alias,
            "author_id",
            filter.apply_org_unit_scoping,
            org_unit,
        )
    }

    fn job_runs(&self, filter: &JobRunFilter, alias: &str, org_unit: &OrgUnitConfig) -> TranslationResult {
        Self::translate(
            &filter.criteria,
            alias,
            "cicd_user_id",
            filter.apply_org_unit_scoping,
            org_unit,
        )
    }
}

fn is_identifier(field: &str) -> bool {
    !field.is_empty()
        && field
            .chars()
            .all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn criteria(entries: &[(&str, &[&str])]) -> IndexMap<String, Vec<String>> {
        entries
            .iter()
            .map(|(key, values)| {
                (
                    key.to_string(),
                    values.iter().map(|v| v.to_string()).collect(),
                )
            })
            .collect()
    }

    mod criteria_translator {
        use super::*;

        #[test]
        fn maps_includes_and_excludes() {
            let filter = IssueFilter {
                criteria: criteria(&[("priority", &["HIGH"]), ("exclude_status", &["WONTFIX"])]),
                ..IssueFilter::default()
            };
            let translation = CriteriaTranslator::new()
                .issues(&filter, "im", &OrgUnitConfig::default())
                .unwrap();
            assert_eq!(translation.predicates["priority"], "im.priority IN (:im_priority)");
            assert_eq!(
                translation.predicates["exclude_status"],
                "im.status NOT IN (:im_excl_status)"
            );
            assert_eq!(
                translation.params.keys().collect::<Vec<_>>(),
                vec!["im_priority", "im_excl_status"]
            );
        }

        #[test]
        fn skips_empty_value_lists() {
            let filter = CommitFilter {
                criteria: criteria(&[("repo_id", &[])]),
                ..CommitFilter::default()
            };
            let translation = CriteriaTranslator::new()
                .commits(&filter, "c", &OrgUnitConfig::default())
                .unwrap();
            assert!(translation.is_empty());
        }

        #[test]
        fn org_unit_users_restrict_user_column() {
            let filter = PullRequestFilter {
                apply_org_unit_scoping: true,
                ..PullRequestFilter::default()
            };
            let org_unit = OrgUnitConfig {
                ou_ref_id: Some(7),
                user_ids: vec!["u-1".into()],
            };
            let translation = CriteriaTranslator::new()
                .pull_requests(&filter, "pr", &org_unit)
                .unwrap();
            assert_eq!(
                translation.predicates["org_unit"],
                "pr.creator_id IN (:pr_ou_user_ids)"
            );
        }

        #[test]
        fn org_unit_users_ignored_without_scoping_flag() {
            let org_unit = OrgUnitConfig {
                ou_ref_id: Some(7),
                user_ids: vec!["u-1".into()],
            };
            let translation = CriteriaTranslator::new()
                .job_runs(&JobRunFilter::default(), "jr", &org_unit)
                .unwrap();
            assert!(translation.is_empty());
        }

        #[test]
        fn rejects_field_names_that_are_not_identifiers() {
            let filter = IssueFilter {
                criteria: criteria(&[("status; DROP TABLE", &["x"])]),
                ..IssueFilter::default()
            };
            let err = CriteriaTranslator::new()
                .issues(&filter, "im", &OrgUnitConfig::default())
                .unwrap_err();
            assert!(err.to_string().contains("invalid filter field name"));
        }
    }
}
