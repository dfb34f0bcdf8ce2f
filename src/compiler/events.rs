use std::fmt;

use log::debug;

use super::assembler::issue_key_column;
use super::job_runs::{DeploySelect, JobRunSelect, JobRunStageFilter, PlatformFlag, RunShape};
use super::joins::{generic_event_component, JoinKind, JoinRegistry};
use super::params::{ParamMap, ParamValue, StageParams};
use crate::error::{LeadLensError, Result};
use crate::model::{EventKind, IssueSystem, StageDefinition};

const REVIEW_STARTED_STATES: &str = "'COMMENTED', 'CHANGES_REQUESTED'";
const APPROVED_STATES: &str = "'APPROVED', 'merged', 'approved', 'approved with suggestions'";
const DEPLOY_MARKER_PARAM: &str = "deploy_job_marker";
const BUILD_JOB_IDS_PARAM: &str = "build_job_ids";
const APPROVAL_PARAM: &str = "approval";

/// How duplicate fan-out rows of one stage collapse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Aggregate {
    #[default]
    Min,
    Max,
}

impl fmt::Display for Aggregate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Min => f.write_str("MIN"),
            Self::Max => f.write_str("MAX"),
        }
    }
}

/// Branch restrictions on a PR event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BranchFilter {
    pub source: Vec<String>,
    pub target: Vec<String>,
    pub source_regex: Option<String>,
    pub target_regex: Option<String>,
}

impl BranchFilter {
    fn from_event(stage: &StageDefinition, with_regex: bool) -> Self {
        let list = |name: &str| stage.event.param(name).map(<[String]>::to_vec).unwrap_or_default();
        let first = |name: &str| {
            if with_regex {
                stage.event.param(name).and_then(|values| values.first().cloned())
            } else {
                None
            }
        };
        Self {
            source: list("source_branches"),
            target: list("target_branches"),
            source_regex: first("source_branches_regex"),
            target_regex: first("target_branches_regex"),
        }
    }

    fn conditions(&self, names: StageParams, params: &mut ParamMap) -> Vec<String> {
        let mut terms: Vec<(&str, ParamValue)> = Vec::new();
        if !self.source.is_empty() {
            terms.push(("pr.source_branch IN", self.source.clone().into()));
        }
        if !self.target.is_empty() {
            terms.push(("pr.target_branch IN", self.target.clone().into()));
        }
        if let Some(regex) = &self.source_regex {
            terms.push(("pr.source_branch ~", regex.as_str().into()));
        }
        if let Some(regex) = &self.target_regex {
            terms.push(("pr.target_branch ~", regex.as_str().into()));
        }
        terms
            .into_iter()
            .enumerate()
            .map(|(index, (lhs, value))| {
                let name = names.indexed_value(index);
                let placeholder = match value {
                    ParamValue::TextList(_) => format!("(:{name})"),
                    _ => format!(":{name}"),
                };
                params.insert(name, value);
                format!("{lhs} {placeholder}")
            })
            .collect()
    }
}

/// Job ids and `name = value` run-parameter pairs of a CI/CD event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunMatch {
    pub job_ids: Vec<String>,
    pub run_params: Vec<(String, Vec<String>)>,
}

impl RunMatch {
    fn from_event(stage: &StageDefinition, reserved: &[&str]) -> Self {
        Self {
            job_ids: stage.event.values.clone(),
            run_params: stage
                .event
                .params
                .iter()
                .filter(|(name, _)| !reserved.iter().any(|r| r.eq_ignore_ascii_case(name)))
                .map(|(name, values)| (name.clone(), values.clone()))
                .collect(),
        }
    }

    /// Job-id and run-parameter terms; pair placeholders start at `first_pair`.
    fn conditions(&self, names: StageParams, first_pair: usize, params: &mut ParamMap) -> Vec<String> {
        let mut conditions = Vec::new();
        if !self.job_ids.is_empty() {
            conditions.push(format!("jr.cicd_job_id IN (:{})", names.value()));
            params.insert(names.value(), self.job_ids.clone().into());
        }
        let pairs: Vec<String> = self
            .run_params
            .iter()
            .enumerate()
            .map(|(offset, (name, values))| {
                let index = first_pair + offset;
                params.insert(names.name(index), name.as_str().into());
                params.insert(names.indexed_value(index), values.clone().into());
                format!(
                    "(jrp.name = :{} AND jrp.value IN (:{}))",
                    names.name(index),
                    names.indexed_value(index)
                )
            })
            .collect();
        if !pairs.is_empty() {
            conditions.push(format!("({})", pairs.join(" OR ")));
        }
        conditions
    }
}

/// A stage's event with its parameters resolved, one variant per kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageEvent {
    StatusReached {
        statuses: Vec<String>,
    },
    CommitCreated,
    PrCreated {
        branches: BranchFilter,
    },
    PrLabelAdded {
        /// `None` matches any label.
        labels: Option<Vec<String>>,
    },
    PrReviewStarted,
    PrApproved {
        aggregate: Aggregate,
    },
    PrMerged {
        branches: BranchFilter,
    },
    JobRun {
        runs: RunMatch,
        filter: JobRunStageFilter,
    },
    DeployJobRun {
        runs: RunMatch,
        marker: String,
        build_job_ids: Vec<String>,
    },
    CiJobRun {
        runs: RunMatch,
        filter: JobRunStageFilter,
    },
    CdJobRun {
        runs: RunMatch,
        filter: JobRunStageFilter,
    },
    ThirdPartyCiJobRun {
        runs: RunMatch,
    },
    GenericEvent {
        event_types: Vec<String>,
    },
}

impl StageEvent {
    /// Resolves the configured event of `stage`.
    ///
    /// # Errors
    ///
    /// Fails on an unknown kind, a deploy event without its marker, or an
    /// unparseable CI/CD stage filter.
    pub fn resolve(stage: &StageDefinition) -> Result<Self> {
        let event = &stage.event;
        let filter = || JobRunStageFilter::parse(&stage.name, stage.filter.as_ref());
        Ok(match event.kind()? {
            EventKind::StatusReached => Self::StatusReached {
                statuses: event.values.clone(),
            },
            EventKind::CommitCreated => Self::CommitCreated,
            EventKind::PrCreated => Self::PrCreated {
                branches: BranchFilter::from_event(stage, false),
            },
            EventKind::PrLabelAdded => Self::PrLabelAdded {
                labels: (!event.any_label_added).then(|| event.values.clone()),
            },
            EventKind::PrReviewStarted => Self::PrReviewStarted,
            EventKind::PrApproved => {
                let latest = event
                    .param(APPROVAL_PARAM)
                    .and_then(|values| values.first())
                    .is_some_and(|value| value.eq_ignore_ascii_case("max"));
                Self::PrApproved {
                    aggregate: if latest { Aggregate::Max } else { Aggregate::Min },
                }
            }
            EventKind::PrMerged => Self::PrMerged {
                branches: BranchFilter::from_event(stage, true),
            },
            EventKind::JobRun => Self::JobRun {
                runs: RunMatch::from_event(stage, &[]),
                filter: filter()?,
            },
            EventKind::DeployJobRun => {
                let marker = event
                    .param(DEPLOY_MARKER_PARAM)
                    .and_then(|values| values.first())
                    .filter(|marker| !marker.is_empty())
                    .cloned()
                    .ok_or_else(|| LeadLensError::MissingEventParam {
                        stage: stage.name.clone(),
                        param: DEPLOY_MARKER_PARAM.to_string(),
                    })?;
                Self::DeployJobRun {
                    runs: RunMatch::from_event(stage, &[DEPLOY_MARKER_PARAM, BUILD_JOB_IDS_PARAM]),
                    marker,
                    build_job_ids: event
                        .param(BUILD_JOB_IDS_PARAM)
                        .map(<[String]>::to_vec)
                        .unwrap_or_default(),
                }
            }
            EventKind::CiJobRun => Self::CiJobRun {
                runs: RunMatch::from_event(stage, &[]),
                filter: filter()?,
            },
            EventKind::CdJobRun => Self::CdJobRun {
                runs: RunMatch::from_event(stage, &[]),
                filter: filter()?,
            },
            EventKind::ThirdPartyCiJobRun => Self::ThirdPartyCiJobRun {
                runs: RunMatch::from_event(stage, &[]),
            },
            EventKind::GenericEvent => Self::GenericEvent {
                event_types: event.values.clone(),
            },
        })
    }

    pub fn kind(&self) -> EventKind {
        match self {
            Self::StatusReached { .. } => EventKind::StatusReached,
            Self::CommitCreated => EventKind::CommitCreated,
            Self::PrCreated { .. } => EventKind::PrCreated,
            Self::PrLabelAdded { .. } => EventKind::PrLabelAdded,
            Self::PrReviewStarted => EventKind::PrReviewStarted,
            Self::PrApproved { .. } => EventKind::PrApproved,
            Self::PrMerged { .. } => EventKind::PrMerged,
            Self::JobRun { .. } => EventKind::JobRun,
            Self::DeployJobRun { .. } => EventKind::DeployJobRun,
            Self::CiJobRun { .. } => EventKind::CiJobRun,
            Self::CdJobRun { .. } => EventKind::CdJobRun,
            Self::ThirdPartyCiJobRun { .. } => EventKind::ThirdPartyCiJobRun,
            Self::GenericEvent { .. } => EventKind::GenericEvent,
        }
    }
}

/// What one stage contributes to the base select.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledEvent {
    pub timestamp: String,
    pub aggregate: Aggregate,
    /// Terms for the outer WHERE clause.
    pub predicates: Vec<String>,
}

impl CompiledEvent {
    fn min(timestamp: String) -> Self {
        Self {
            timestamp,
            aggregate: Aggregate::Min,
            predicates: Vec::new(),
        }
    }
}

/// Shared state threaded through the per-stage compilers.
pub struct EventContext<'a> {
    pub joins: &'a mut JoinRegistry,
    pub params: &'a mut ParamMap,
    /// Index of the last job-run stage, which alone receives `run_predicates`.
    pub last_job_run: Option<usize>,
    pub run_predicates: Vec<String>,
    /// Most recent CI-family stage compiled so far.
    pub previous_ci: Option<usize>,
}

impl EventContext<'_> {
    fn schema(&self) -> String {
        self.joins.context().schema.clone()
    }

    fn issue_system(&self) -> IssueSystem {
        self.joins.context().anchor.issue_system
    }

    fn run_predicates_for(&self, index: usize) -> Vec<String> {
        if self.last_job_run == Some(index) {
            self.run_predicates.clone()
        } else {
            Vec::new()
        }
    }

    /// Branch terms land on the PR join when PRs are joined, else in WHERE.
    fn place_branch_conditions(&mut self, conditions: Vec<String>) -> Vec<String> {
        if self.joins.is_anchor(JoinKind::PullRequest) {
            return conditions;
        }
        for condition in conditions {
            self.joins.add_condition(JoinKind::PullRequest, condition);
        }
        Vec::new()
    }

    fn join_run(&mut self, index: usize, select: String) -> String {
        self.joins.ensure(JoinKind::CicdMapping);
        let alias = self.joins.ensure_with(JoinKind::JobRun(index), |alias| {
            format!("LEFT JOIN ({select}) AS {alias} ON {alias}.id = csm.cicd_job_run_id")
        });
        format!("{alias}.end_time")
    }
}

/// Compiles the event of the stage at `index`.
///
/// # Errors
///
/// Returns `UnsupportedCombination` for a CD stage with no CI stage before it.
pub fn compile_event(
    event: &StageEvent,
    stage: &StageDefinition,
    index: usize,
    ctx: &mut EventContext<'_>,
) -> Result<CompiledEvent> {
    let names = StageParams::new(index);
    let schema = ctx.schema();
    debug!("Compiling stage {index} ({}) as {}", stage.name, event.kind());

    let compiled = match event {
        StageEvent::StatusReached { statuses } => {
            let ims = ctx.joins.ensure(JoinKind::StatusHistory);
            ctx.params.insert(names.value(), statuses.clone().into());
            let timestamp = match ctx.issue_system() {
                IssueSystem::WorkItems => format!(
                    "CASE WHEN ({ims}.field_type = 'status' AND {ims}.field_value IN (:{value})) THEN CASE WHEN {ims}.start_date IS NOT NULL THEN COALESCE({ims}.end_date, now()) ELSE {ims}.end_date END ELSE NULL END",
                    value = names.value()
                ),
                _ => format!(
                    "CASE WHEN ({ims}.status IN (:{})) THEN to_timestamp({ims}.end_time) ELSE NULL END",
                    names.value()
                ),
            };
            CompiledEvent::min(timestamp)
        }
        StageEvent::CommitCreated => {
            let c = ctx.joins.ensure(JoinKind::Commit);
            CompiledEvent::min(format!("{c}.committed_at"))
        }
        StageEvent::PrCreated { branches } => {
            let pr = ctx.joins.ensure(JoinKind::PullRequest);
            let conditions = branches.conditions(names, ctx.params);
            CompiledEvent {
                timestamp: format!("{pr}.pr_created_at"),
                aggregate: Aggregate::Min,
                predicates: ctx.place_branch_conditions(conditions),
            }
        }
        StageEvent::PrLabelAdded { labels } => {
            ctx.joins.ensure(JoinKind::PullRequest);
            if let Some(labels) = labels {
                ctx.params.insert(names.value(), labels.clone().into());
            }
            let value = names.value();
            let alias = ctx.joins.ensure_with(JoinKind::Label(index), |alias| {
                let mut join = format!(
                    "LEFT JOIN {schema}.scm_pullrequest_labels AS {alias} ON {alias}.scm_pullrequest_id = pr.id"
                );
                if labels.is_some() {
                    join.push_str(&format!(" AND {alias}.name IN (:{value})"));
                }
                join
            });
            CompiledEvent::min(format!("{alias}.label_added_at"))
        }
        StageEvent::PrReviewStarted => {
            let prr = ctx.joins.ensure(JoinKind::Review);
            CompiledEvent::min(format!(
                "CASE WHEN ({prr}.state IN ({REVIEW_STARTED_STATES})) THEN {prr}.reviewed_at ELSE NULL END"
            ))
        }
        StageEvent::PrApproved { aggregate } => {
            let prr = ctx.joins.ensure(JoinKind::Review);
            CompiledEvent {
                timestamp: format!(
                    "CASE WHEN ({prr}.state IN ({APPROVED_STATES})) THEN {prr}.reviewed_at ELSE NULL END"
                ),
                aggregate: *aggregate,
                predicates: Vec::new(),
            }
        }
        StageEvent::PrMerged { branches } => {
            let pr = ctx.joins.ensure(JoinKind::PullRequest);
            let conditions = branches.conditions(names, ctx.params);
            CompiledEvent {
                timestamp: format!("{pr}.pr_merged_at"),
                aggregate: Aggregate::Max,
                predicates: ctx.place_branch_conditions(conditions),
            }
        }
        StageEvent::JobRun { runs, filter } => {
            let mut conditions = runs.conditions(names, 0, ctx.params);
            conditions.extend(filter.conditions(names, None, ctx.params));
            conditions.extend(ctx.run_predicates_for(index));
            let select = JobRunSelect {
                shape: RunShape::Generic,
                with_params: !runs.run_params.is_empty(),
                conditions,
            };
            CompiledEvent::min(ctx.join_run(index, select.render(&schema)))
        }
        StageEvent::ThirdPartyCiJobRun { runs } => {
            let mut conditions = runs.conditions(names, 0, ctx.params);
            conditions.extend(ctx.run_predicates_for(index));
            let select = JobRunSelect {
                shape: RunShape::Generic,
                with_params: !runs.run_params.is_empty(),
                conditions,
            };
            CompiledEvent::min(ctx.join_run(index, select.render(&schema)))
        }
        StageEvent::CiJobRun { runs, filter } => {
            let mut conditions = runs.conditions(names, 0, ctx.params);
            conditions.extend(filter.conditions(names, Some(PlatformFlag::Ci), ctx.params));
            conditions.extend(ctx.run_predicates_for(index));
            let select = JobRunSelect {
                shape: RunShape::Platform,
                with_params: !runs.run_params.is_empty(),
                conditions,
            };
            CompiledEvent::min(ctx.join_run(index, select.render(&schema)))
        }
        StageEvent::CdJobRun { runs, filter } => {
            let ci = ctx.previous_ci.ok_or_else(|| {
                LeadLensError::UnsupportedCombination(format!(
                    "CD stage {} has no preceding CI stage",
                    stage.name
                ))
            })?;
            let mut conditions = runs.conditions(names, 0, ctx.params);
            conditions.extend(filter.conditions(names, Some(PlatformFlag::Cd), ctx.params));
            conditions.extend(ctx.run_predicates_for(index));
            let select = JobRunSelect {
                shape: RunShape::PlatformCd,
                with_params: !runs.run_params.is_empty(),
                conditions,
            }
            .render(&schema);
            let ci_alias = JoinKind::JobRun(ci).alias();
            let alias = ctx.joins.ensure_with(JoinKind::JobRun(index), |alias| {
                format!("LEFT JOIN ({select}) AS {alias} ON {alias}.ci_job_run_id = {ci_alias}.id")
            });
            CompiledEvent::min(format!("{alias}.end_time"))
        }
        StageEvent::DeployJobRun {
            runs,
            marker,
            build_job_ids,
        } => {
            let mut deploy_conditions = runs.conditions(names, 1, ctx.params);
            deploy_conditions.push(format!("jrp.name = :{}", names.name(0)));
            ctx.params.insert(names.name(0), marker.as_str().into());
            deploy_conditions.extend(ctx.run_predicates_for(index));

            let mut build_conditions = Vec::new();
            if !build_job_ids.is_empty() {
                build_conditions.push(format!("jr.cicd_job_id IN (:{})", names.indexed_value(0)));
                ctx.params
                    .insert(names.indexed_value(0), build_job_ids.clone().into());
            }
            let select = DeploySelect {
                deploy_conditions,
                build_conditions,
            };
            CompiledEvent::min(ctx.join_run(index, select.render(&schema)))
        }
        StageEvent::GenericEvent { event_types } => {
            ctx.joins.ensure(JoinKind::Issue);
            let component = generic_event_component(ctx.issue_system());
            let key = issue_key_column(ctx.issue_system());
            if !event_types.is_empty() {
                ctx.params.insert(names.value(), event_types.clone().into());
            }
            let value = names.value();
            let alias = ctx.joins.ensure_with(JoinKind::GenericEvent(index), |alias| {
                let mut join = format!(
                    "LEFT JOIN {schema}.generic_events AS {alias} ON {alias}.component = '{component}' AND {alias}.key = im.{key} AND {alias}.integration_id = im.integration_id"
                );
                if !event_types.is_empty() {
                    join.push_str(&format!(" AND {alias}.event_type IN (:{value})"));
                }
                join
            });
            CompiledEvent::min(format!("{alias}.event_time"))
        }
    };

    if event.kind().is_ci_family() {
        ctx.previous_ci = Some(index);
    }
    Ok(compiled)
}
