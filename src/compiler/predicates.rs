use log::{debug, warn};

use super::assembler::Pipeline;
use super::joins::{JoinKind, JoinRegistry};
use super::params::{
    ParamMap, StageParams, ISSUE_INTEGRATION_IDS, IS_ACTIVE, SCM_INTEGRATION_IDS, SPRINT_STATES,
    VALUE_STACKS, VALUE_TREND_KEYS,
};
use crate::error::{LeadLensError, Result};
use crate::filters::{FilterTranslator, Translation};
use crate::model::{EntityFilters, IssueSystem, VelocityQuery};

/// Alias the job-run filter is translated against, inside a stage sub-select.
pub const JOB_RUN_ALIAS: &str = "jr";

/// Merges scoping, collaborator and query restrictions into WHERE terms.
pub struct PredicateComposer<'a> {
    translator: &'a dyn FilterTranslator,
    filters: &'a EntityFilters,
    query: &'a VelocityQuery,
}

impl<'a> PredicateComposer<'a> {
    pub fn new(
        translator: &'a dyn FilterTranslator,
        filters: &'a EntityFilters,
        query: &'a VelocityQuery,
    ) -> Self {
        Self {
            translator,
            filters,
            query,
        }
    }

    /// Translates the job-run filter for the last job-run stage's sub-select.
    ///
    /// Returns no terms when the pipeline has no job-run stage.
    pub fn job_run_predicates(
        &self,
        last_job_run: Option<usize>,
        params: &mut ParamMap,
    ) -> Result<Vec<String>> {
        let Some(filter) = &self.filters.job_runs else {
            return Ok(Vec::new());
        };
        let translation = self
            .translator
            .job_runs(filter, JOB_RUN_ALIAS, &self.filters.org_unit)
            .map_err(LeadLensError::Translator)?;
        if translation.is_empty() {
            return Ok(Vec::new());
        }
        if last_job_run.is_none() {
            warn!(
                "Dropping {} job-run filter predicates: pipeline has no job-run stage",
                translation.predicates.len()
            );
            return Ok(Vec::new());
        }
        params.extend(translation.params);
        Ok(translation.predicates.into_values().collect())
    }

    /// Builds every outer WHERE term, ensuring the joins they read from.
    ///
    /// # Errors
    ///
    /// Fails when the anchor has no integration ids, a stack restriction has
    /// no issue system, or a translator fails.
    pub fn compose(
        &self,
        pipeline: &Pipeline,
        joins: &mut JoinRegistry,
        params: &mut ParamMap,
        last_job_run: Option<usize>,
    ) -> Result<Vec<String>> {
        let mut conditions = Vec::new();
        let anchor = pipeline.anchor;
        let issue_ids = self
            .filters
            .issues
            .as_ref()
            .map(|f| f.integration_ids.clone())
            .unwrap_or_default();
        let scm_ids = self
            .filters
            .pull_requests
            .as_ref()
            .map(|f| f.integration_ids.clone())
            .filter(|ids| !ids.is_empty())
            .or_else(|| self.filters.commits.as_ref().map(|f| f.integration_ids.clone()))
            .unwrap_or_default();

        if anchor.is_issue() {
            if issue_ids.is_empty() {
                return Err(LeadLensError::MissingIntegrationIds("issue"));
            }
            conditions.push(format!("im.integration_id IN (:{ISSUE_INTEGRATION_IDS})"));
            params.insert(ISSUE_INTEGRATION_IDS.to_string(), issue_ids.clone().into());
        } else {
            if scm_ids.is_empty() {
                return Err(LeadLensError::MissingIntegrationIds("pull request"));
            }
            conditions.push(format!("pr.integration_id IN (:{SCM_INTEGRATION_IDS})"));
            params.insert(SCM_INTEGRATION_IDS.to_string(), scm_ids.clone().into());
        }

        let org_unit = &self.filters.org_unit;
        if let Some(filter) = &self.filters.issues {
            if anchor.issue_system != IssueSystem::None {
                let translation = self
                    .translator
                    .issues(filter, "im", org_unit)
                    .map_err(LeadLensError::Translator)?;
                self.merge(JoinKind::Issue, translation, filter.apply_org_unit_scoping, joins, params, &mut conditions);
            }
        }
        if let Some(filter) = &self.filters.pull_requests {
            let translation = self
                .translator
                .pull_requests(filter, "pr", org_unit)
                .map_err(LeadLensError::Translator)?;
            self.merge(JoinKind::PullRequest, translation, filter.apply_org_unit_scoping, joins, params, &mut conditions);
        }
        if let Some(filter) = &self.filters.commits {
            let translation = self
                .translator
                .commits(filter, "c", org_unit)
                .map_err(LeadLensError::Translator)?;
            self.merge(JoinKind::Commit, translation, filter.apply_org_unit_scoping, joins, params, &mut conditions);
        }

        let issues = self
            .filters
            .issues
            .as_ref()
            .filter(|_| anchor.issue_system != IssueSystem::None);
        if let Some(issues) = issues {
            if let Some(is_active) = issues.is_active {
                let im = joins.ensure(JoinKind::Issue);
                conditions.push(format!(
                    "({im}.is_active = :{IS_ACTIVE} OR {im}.is_active IS NULL)"
                ));
                params.insert(IS_ACTIVE.to_string(), is_active.into());
            }
            if !issues.sprint_states.is_empty() {
                self.join_sprints(joins, anchor.issue_system, !issue_ids.is_empty());
                params.insert(SPRINT_STATES.to_string(), issues.sprint_states.clone().into());
            }
        }

        if let Some(stack) = self.query.stack {
            if !self.query.value_stacks.is_empty() {
                if anchor.issue_system == IssueSystem::None {
                    return Err(LeadLensError::UnsupportedCombination(
                        "stack values require an issue system".into(),
                    ));
                }
                joins.ensure(JoinKind::Issue);
                let column = stack.column(anchor.issue_system);
                if stack.is_array() {
                    conditions.push(format!("{column} && :{VALUE_STACKS}"));
                } else {
                    conditions.push(format!("{column} IN (:{VALUE_STACKS})"));
                }
                params.insert(VALUE_STACKS.to_string(), self.query.value_stacks.clone().into());
            }
        }

        if !self.query.value_trend_keys.is_empty() {
            conditions.push(format!("{} IN (:{VALUE_TREND_KEYS})", anchor.trend_expr()));
            params.insert(
                VALUE_TREND_KEYS.to_string(),
                self.query.value_trend_keys.clone().into(),
            );
        }

        if let (Some(last), Some(range)) = (
            last_job_run,
            self.filters.job_runs.as_ref().and_then(|f| f.end_time_range),
        ) {
            let names = StageParams::new(last);
            let run = JoinKind::JobRun(last).alias();
            if let Some(start) = range.start {
                conditions.push(format!(
                    "{run}.end_time > to_timestamp(:{})",
                    names.job_run_end_start()
                ));
                params.insert(names.job_run_end_start(), start.timestamp().into());
            }
            if let Some(end) = range.end {
                conditions.push(format!(
                    "{run}.end_time < to_timestamp(:{})",
                    names.job_run_end_end()
                ));
                params.insert(names.job_run_end_end(), end.timestamp().into());
            }
        }

        // Optional-pass scoping last, once every entity join is known.
        let optional_scoping = [
            (JoinKind::Issue, ISSUE_INTEGRATION_IDS, &issue_ids),
            (JoinKind::PullRequest, SCM_INTEGRATION_IDS, &scm_ids),
            (JoinKind::Commit, SCM_INTEGRATION_IDS, &scm_ids),
        ];
        for (kind, param, ids) in optional_scoping {
            if joins.is_anchor(kind) || !joins.is_joined(kind) || ids.is_empty() {
                continue;
            }
            let alias = kind.alias();
            conditions.push(format!(
                "(({alias}.integration_id IN (:{param})) OR ({alias}.integration_id IS NULL))"
            ));
            params
                .entry(param.to_string())
                .or_insert_with(|| ids.clone().into());
        }

        debug!("Composed {} where conditions", conditions.len());
        Ok(conditions)
    }

    /// Adds collaborator predicates for `kind`, wrapping them when the entity
    /// is optionally joined and org-unit scoping is requested.
    fn merge(
        &self,
        kind: JoinKind,
        translation: Translation,
        apply_org_unit_scoping: bool,
        joins: &mut JoinRegistry,
        params: &mut ParamMap,
        conditions: &mut Vec<String>,
    ) {
        if translation.is_empty() {
            return;
        }
        let alias = joins.ensure(kind);
        let wrap = apply_org_unit_scoping && !joins.is_anchor(kind);
        for predicate in translation.predicates.into_values() {
            if wrap {
                conditions.push(format!("({alias}.id IS NULL OR {predicate})"));
            } else {
                conditions.push(predicate);
            }
        }
        params.extend(translation.params);
    }

    fn join_sprints(&self, joins: &mut JoinRegistry, system: IssueSystem, scoped: bool) {
        let schema = joins.context().schema.clone();
        joins.ensure_with(JoinKind::Sprint, |alias| match system {
            IssueSystem::WorkItems => {
                let scope = if scoped {
                    format!(" AND wt.integration_id IN (:{ISSUE_INTEGRATION_IDS})")
                } else {
                    String::new()
                };
                format!(
                    "INNER JOIN (SELECT wt.workitem_id, wt.integration_id FROM {schema}.workitem_timeline AS wt INNER JOIN {schema}.workitem_milestones AS ms ON ms.id::text = wt.field_value AND wt.field_type = 'sprint' WHERE ms.state IN (:{SPRINT_STATES}){scope}) AS {alias} ON {alias}.workitem_id = im.workitem_id AND {alias}.integration_id = im.integration_id"
                )
            }
            _ => {
                let scope = if scoped {
                    format!(" AND integration_id IN (:{ISSUE_INTEGRATION_IDS})")
                } else {
                    String::new()
                };
                format!(
                    "INNER JOIN (SELECT sprint_id FROM {schema}.issue_sprints WHERE state IN (:{SPRINT_STATES}){scope}) AS {alias} ON {alias}.sprint_id = ANY(im.sprint_ids)"
                )
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::compiler::assembler::assemble;
    use crate::compiler::joins::JoinContext;
    use crate::filters::CriteriaTranslator;
    use crate::model::{
        Calculation, Event, EventKind, IssueFilter, JobRunFilter, PipelineConfig,
        PullRequestFilter, StackKind, StageDefinition, TimeRange,
    };

    struct Fixture {
        pipeline: Pipeline,
        joins: JoinRegistry,
        params: ParamMap,
    }

    fn fixture(calculation: Calculation, stages: Vec<StageDefinition>) -> Fixture {
        let config = PipelineConfig {
            name: "p".into(),
            fixed_stages: stages,
            ..PipelineConfig::default()
        };
        let query = VelocityQuery {
            calculation,
            ..VelocityQuery::default()
        };
        let pipeline = assemble(&config, &query).unwrap();
        let joins = JoinRegistry::new(JoinContext {
            schema: "acme".into(),
            anchor: pipeline.anchor,
            freshness: false,
            pr_issue_correlation: false,
        });
        Fixture {
            pipeline,
            joins,
            params: ParamMap::new(),
        }
    }

    fn merge_stage() -> StageDefinition {
        StageDefinition::new("Merge", 0, Event::new(EventKind::PrMerged))
    }

    fn issue_filters() -> EntityFilters {
        EntityFilters {
            issues: Some(IssueFilter {
                integration_ids: vec!["1".into()],
                ..IssueFilter::default()
            }),
            ..EntityFilters::default()
        }
    }

    fn compose(fx: &mut Fixture, filters: &EntityFilters, query: &VelocityQuery) -> Result<Vec<String>> {
        let translator = CriteriaTranslator::new();
        PredicateComposer::new(&translator, filters, query).compose(
            &fx.pipeline,
            &mut fx.joins,
            &mut fx.params,
            fx.pipeline.last_job_run_stage().unwrap(),
        )
    }

    mod compose {
        use super::*;

        #[test]
        fn anchor_scoping_is_mandatory() {
            let mut fx = fixture(Calculation::IssueVelocity, vec![merge_stage()]);
            let err = compose(&mut fx, &EntityFilters::default(), &VelocityQuery::default()).unwrap_err();
            assert!(matches!(err, LeadLensError::MissingIntegrationIds("issue")));
        }

        #[test]
        fn joined_entities_get_optional_pass_scoping() {
            let mut fx = fixture(Calculation::IssueVelocity, vec![merge_stage()]);
            fx.joins.ensure(JoinKind::PullRequest);
            let mut filters = issue_filters();
            filters.pull_requests = Some(PullRequestFilter {
                integration_ids: vec!["9".into()],
                ..PullRequestFilter::default()
            });
            let conditions = compose(&mut fx, &filters, &VelocityQuery::default()).unwrap();
            assert_eq!(conditions[0], "im.integration_id IN (:jira_integration_ids)");
            assert!(conditions.contains(
                &"((pr.integration_id IN (:integration_ids)) OR (pr.integration_id IS NULL))".to_string()
            ));
            assert!(conditions.contains(
                &"((c.integration_id IN (:integration_ids)) OR (c.integration_id IS NULL))".to_string()
            ));
        }

        #[test]
        fn unjoined_entities_are_not_scoped() {
            let mut fx = fixture(Calculation::PrVelocity, vec![merge_stage()]);
            let filters = EntityFilters {
                pull_requests: Some(PullRequestFilter {
                    integration_ids: vec!["9".into()],
                    ..PullRequestFilter::default()
                }),
                ..EntityFilters::default()
            };
            let conditions = compose(&mut fx, &filters, &VelocityQuery::default()).unwrap();
            assert_eq!(conditions, vec!["pr.integration_id IN (:integration_ids)"]);
        }

        #[test]
        fn org_unit_predicates_on_optional_entity_pass_unmatched_rows() {
            let mut fx = fixture(Calculation::IssueVelocity, vec![merge_stage()]);
            let mut filters = issue_filters();
            filters.pull_requests = Some(PullRequestFilter {
                apply_org_unit_scoping: true,
                criteria: [("state".to_string(), vec!["merged".to_string()])].into_iter().collect(),
                ..PullRequestFilter::default()
            });
            let conditions = compose(&mut fx, &filters, &VelocityQuery::default()).unwrap();
            assert!(conditions.contains(&"(pr.id IS NULL OR pr.state IN (:pr_state))".to_string()));
        }

        #[test]
        fn predicates_stay_bare_without_org_unit_flag() {
            let mut fx = fixture(Calculation::IssueVelocity, vec![merge_stage()]);
            let mut filters = issue_filters();
            filters.pull_requests = Some(PullRequestFilter {
                criteria: [("state".to_string(), vec!["merged".to_string()])].into_iter().collect(),
                ..PullRequestFilter::default()
            });
            let conditions = compose(&mut fx, &filters, &VelocityQuery::default()).unwrap();
            assert!(conditions.contains(&"pr.state IN (:pr_state)".to_string()));
        }

        #[test]
        fn anchor_predicates_are_never_wrapped() {
            let mut fx = fixture(Calculation::IssueVelocity, vec![merge_stage()]);
            let mut filters = issue_filters();
            if let Some(issues) = filters.issues.as_mut() {
                issues.apply_org_unit_scoping = true;
                issues.criteria.insert("priority".into(), vec!["HIGH".into()]);
            }
            let conditions = compose(&mut fx, &filters, &VelocityQuery::default()).unwrap();
            assert!(conditions.contains(&"im.priority IN (:im_priority)".to_string()));
        }

        #[test]
        fn array_stack_values_use_overlap() {
            let mut fx = fixture(Calculation::IssueVelocity, vec![merge_stage()]);
            let query = VelocityQuery {
                stack: Some(StackKind::IssueLabel),
                value_stacks: vec!["backend".into()],
                ..VelocityQuery::default()
            };
            let conditions = compose(&mut fx, &issue_filters(), &query).unwrap();
            assert!(conditions.contains(&"im.labels && :value_stacks".to_string()));
        }

        #[test]
        fn trend_keys_reuse_trend_expression() {
            let mut fx = fixture(Calculation::PrVelocity, vec![merge_stage()]);
            let filters = EntityFilters {
                commits: Some(crate::model::CommitFilter {
                    integration_ids: vec!["3".into()],
                    ..crate::model::CommitFilter::default()
                }),
                ..EntityFilters::default()
            };
            let query = VelocityQuery {
                calculation: Calculation::PrVelocity,
                value_trend_keys: vec![1_700_000_000],
                ..VelocityQuery::default()
            };
            let conditions = compose(&mut fx, &filters, &query).unwrap();
            assert!(conditions.contains(
                &"EXTRACT(EPOCH FROM (pr.pr_created_at::date)) IN (:value_trend_keys)".to_string()
            ));
        }

        #[test]
        fn active_sprint_adds_inner_join() {
            let mut fx = fixture(Calculation::IssueVelocity, vec![merge_stage()]);
            let mut filters = issue_filters();
            if let Some(issues) = filters.issues.as_mut() {
                issues.is_active = Some(true);
                issues.sprint_states = vec!["ACTIVE".into()];
            }
            let conditions = compose(&mut fx, &filters, &VelocityQuery::default()).unwrap();
            assert!(conditions.contains(&"(im.is_active = :is_active OR im.is_active IS NULL)".to_string()));
            let sql = fx.joins.render();
            assert!(sql.starts_with("INNER JOIN (SELECT sprint_id FROM acme.issue_sprints WHERE state IN (:sprint_states) AND integration_id IN (:jira_integration_ids))"));
            assert!(fx.params.contains_key("sprint_states"));
        }

        #[test]
        fn end_time_range_targets_last_job_run_stage() {
            let stages = vec![
                StageDefinition::new("Build", 0, Event::new(EventKind::JobRun)),
                StageDefinition::new("Deploy", 1, Event::new(EventKind::JobRun)),
            ];
            let mut fx = fixture(Calculation::IssueVelocity, stages);
            let mut filters = issue_filters();
            filters.job_runs = Some(JobRunFilter {
                end_time_range: Some(TimeRange {
                    start: Utc.timestamp_opt(1_700_000_000, 0).single(),
                    end: Utc.timestamp_opt(1_700_086_400, 0).single(),
                }),
                ..JobRunFilter::default()
            });
            let conditions = compose(&mut fx, &filters, &VelocityQuery::default()).unwrap();
            assert!(conditions.contains(&"run1.end_time > to_timestamp(:s1_job_run_end_start)".to_string()));
            assert!(conditions.contains(&"run1.end_time < to_timestamp(:s1_job_run_end_end)".to_string()));
            assert!(!conditions.iter().any(|c| c.contains("run0")));
            assert!(!fx.params.contains_key("s0_job_run_end_start"));
        }
    }

    mod job_run_predicates {
        use super::*;

        #[test]
        fn dropped_without_job_run_stage() {
            let filters = EntityFilters {
                job_runs: Some(JobRunFilter {
                    criteria: [("status".to_string(), vec!["SUCCESS".to_string()])].into_iter().collect(),
                    ..JobRunFilter::default()
                }),
                ..EntityFilters::default()
            };
            let translator = CriteriaTranslator::new();
            let query = VelocityQuery::default();
            let mut params = ParamMap::new();
            let predicates = PredicateComposer::new(&translator, &filters, &query)
                .job_run_predicates(None, &mut params)
                .unwrap();
            assert!(predicates.is_empty());
            assert!(params.is_empty());
        }
    }
}
