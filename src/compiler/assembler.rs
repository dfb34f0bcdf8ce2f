use log::{debug, info};

use super::joins::{JoinKind, JoinRegistry};
use super::params::{ParamMap, STARTING_GENERIC_EVENT_TYPES};
use crate::error::{LeadLensError, Result};
use crate::model::{
    Across, Calculation, EventKind, IssueSystem, OffsetStageMap, PipelineConfig, StageDefinition,
    VelocityQuery,
};

const IDENTITY_COLUMNS: [&str; 7] = [
    "u_id",
    "integration_id",
    "key",
    "title",
    "org",
    "project",
    "repo_id",
];

/// The row-level subject of the query and the issue system behind it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Anchor {
    pub calculation: Calculation,
    pub issue_system: IssueSystem,
}

impl Anchor {
    pub fn is_issue(&self) -> bool {
        self.calculation == Calculation::IssueVelocity
    }

    /// Alias of the anchor table in the FROM chain.
    pub fn alias(&self) -> &'static str {
        if self.is_issue() {
            "im"
        } else {
            "pr"
        }
    }

    pub fn from_clause(&self, schema: &str) -> String {
        if self.is_issue() {
            format!("{schema}.{} AS im", issue_table(self.issue_system))
        } else {
            format!("{schema}.scm_pullrequests AS pr")
        }
    }

    pub fn identity_selects(&self) -> Vec<&'static str> {
        match (self.calculation, self.issue_system) {
            (Calculation::IssueVelocity, IssueSystem::WorkItems) => vec![
                "im.id AS u_id",
                "im.integration_id AS integration_id",
                "im.workitem_id AS key",
                "im.summary AS title",
                "im.attributes ->> 'organization' AS org",
                "im.project AS project",
                "NULL AS repo_id",
            ],
            (Calculation::IssueVelocity, _) => vec![
                "im.id AS u_id",
                "im.integration_id AS integration_id",
                "im.key AS key",
                "im.summary AS title",
                "NULL AS org",
                "NULL AS project",
                "NULL AS repo_id",
            ],
            (Calculation::PrVelocity, _) => vec![
                "pr.id AS u_id",
                "pr.integration_id AS integration_id",
                "pr.number AS key",
                "pr.title AS title",
                "NULL AS org",
                "pr.project AS project",
                "pr.repo_id AS repo_id",
                "pr.metadata ->> 'pr_link' AS pr_link",
            ],
        }
    }

    /// Columns identifying one anchor entity after the base layer.
    pub fn identity_columns(&self) -> Vec<&'static str> {
        let mut columns = IDENTITY_COLUMNS.to_vec();
        if !self.is_issue() {
            columns.push("pr_link");
        }
        columns
    }

    pub fn created_at(&self) -> &'static str {
        match (self.calculation, self.issue_system) {
            (Calculation::PrVelocity, _) => "pr.pr_created_at",
            (Calculation::IssueVelocity, IssueSystem::WorkItems) => "im.workitem_created_at",
            (Calculation::IssueVelocity, _) => "to_timestamp(im.issue_created_at)",
        }
    }

    /// Expression feeding the `trend` projection and the trend-key restriction.
    pub fn trend_expr(&self) -> &'static str {
        if self.is_issue() {
            "im.ingested_at"
        } else {
            "EXTRACT(EPOCH FROM (pr.pr_created_at::date))"
        }
    }
}

pub fn issue_table(system: IssueSystem) -> &'static str {
    match system {
        IssueSystem::WorkItems => "workitems",
        _ => "issues",
    }
}

pub fn issue_key_column(system: IssueSystem) -> &'static str {
    match system {
        IssueSystem::WorkItems => "workitem_id",
        _ => "key",
    }
}

/// How the pipeline's start time is derived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartTime {
    AnchorCreated,
    CommitCreated,
    GenericEvent {
        event_types: Vec<String>,
        fallback: Box<StartTime>,
    },
}

impl StartTime {
    /// Renders the start expression, ensuring any join it reads from.
    pub fn expression(&self, anchor: &Anchor, joins: &mut JoinRegistry, params: &mut ParamMap) -> String {
        match self {
            Self::AnchorCreated => anchor.created_at().to_string(),
            Self::CommitCreated => {
                let commits = joins.ensure(JoinKind::Commit);
                format!("{commits}.committed_at")
            }
            Self::GenericEvent {
                event_types,
                fallback,
            } => {
                let fallback = fallback.expression(anchor, joins, params);
                let events = joins.ensure(JoinKind::StartEvent);
                if !event_types.is_empty() {
                    joins.add_condition(
                        JoinKind::StartEvent,
                        format!("{events}.event_type IN (:{STARTING_GENERIC_EVENT_TYPES})"),
                    );
                    params.insert(
                        STARTING_GENERIC_EVENT_TYPES.to_string(),
                        event_types.clone().into(),
                    );
                }
                format!("COALESCE({events}.event_time, {fallback})")
            }
        }
    }
}

/// The assembled, reindexed stage list and its anchor shape.
#[derive(Debug, Clone)]
pub struct Pipeline {
    pub name: String,
    pub stages: Vec<StageDefinition>,
    pub anchor: Anchor,
    pub start: StartTime,
}

impl Pipeline {
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn offset_stage_map(&self) -> OffsetStageMap {
        self.stages.iter().cloned().enumerate().collect()
    }

    pub fn stage_index(&self, name: &str) -> Option<usize> {
        self.stages.iter().position(|stage| stage.name == name)
    }

    /// Index of the stage named `name`, or `StageNotFound`.
    pub fn require_stage(&self, name: &str) -> Result<usize> {
        self.stage_index(name)
            .ok_or_else(|| LeadLensError::StageNotFound {
                stage: name.to_string(),
                pipeline: self.name.clone(),
            })
    }

    /// Index of the last stage whose event is a CI/CD job run.
    pub fn last_job_run_stage(&self) -> Result<Option<usize>> {
        let mut last = None;
        for (index, stage) in self.stages.iter().enumerate() {
            if stage.event.kind()?.is_job_run_family() {
                last = Some(index);
            }
        }
        Ok(last)
    }
}

fn sorted_group(stages: &[StageDefinition]) -> Vec<StageDefinition> {
    let mut group = stages.to_vec();
    group.sort_by_key(|stage| stage.order);
    group
}

/// Concatenates and reindexes the three stage groups into one pipeline.
///
/// # Errors
///
/// Returns an error for unknown event kinds, calculation and issue-system
/// pairings that cannot be compiled, and pipelines left without stages.
pub fn assemble(config: &PipelineConfig, query: &VelocityQuery) -> Result<Pipeline> {
    let anchor = Anchor {
        calculation: query.calculation,
        issue_system: query.issue_system,
    };
    if anchor.is_issue() && anchor.issue_system == IssueSystem::None {
        return Err(LeadLensError::UnsupportedCombination(
            "issue velocity requires an issue system".into(),
        ));
    }

    let mut fixed = sorted_group(&config.fixed_stages);
    if config.starting_event_is_commit_created && !fixed.is_empty() {
        let removed = fixed.remove(0);
        debug!(
            "Commit creation starts pipeline {}, dropping fixed stage {}",
            config.name, removed.name
        );
    }

    let stages: Vec<StageDefinition> = sorted_group(&config.pre_development_stages)
        .into_iter()
        .chain(fixed)
        .chain(sorted_group(&config.post_development_stages))
        .collect();

    if stages.is_empty() {
        return Err(LeadLensError::EmptyPipeline(config.name.clone()));
    }

    for stage in &stages {
        let kind = stage.event.kind()?;
        let needs_issue = matches!(kind, EventKind::StatusReached | EventKind::GenericEvent);
        if needs_issue && anchor.issue_system == IssueSystem::None {
            return Err(LeadLensError::UnsupportedCombination(format!(
                "stage {} uses {kind} without an issue system",
                stage.name
            )));
        }
    }

    let default_start = if config.starting_event_is_commit_created {
        StartTime::CommitCreated
    } else {
        StartTime::AnchorCreated
    };
    let start = if config.starting_event_is_generic_event {
        if !anchor.is_issue() {
            return Err(LeadLensError::UnsupportedCombination(
                "a generic start event requires issue velocity".into(),
            ));
        }
        StartTime::GenericEvent {
            event_types: config.starting_generic_event_types.clone(),
            fallback: Box::new(default_start),
        }
    } else {
        default_start
    };

    info!(
        "Assembled pipeline {} with {} stages ({:?}, start {:?})",
        config.name,
        stages.len(),
        anchor.calculation,
        start
    );

    Ok(Pipeline {
        name: config.name.clone(),
        stages,
        anchor,
        start,
    })
}

/// Whether the latest-ingestion restriction applies to the issue entity.
pub fn freshness_required(query: &VelocityQuery) -> bool {
    query.across != Across::Trend && query.value_trend_keys.is_empty()
}
