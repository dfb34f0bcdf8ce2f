use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::compiler::params::ParamMap;
use crate::error::LeadLensError;

/// Granularity of a stage duration limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TimeUnit {
    #[default]
    Seconds,
    Minutes,
    Hours,
    Days,
}

impl TimeUnit {
    /// `value` of this unit in seconds, `None` when it overflows `u64`.
    pub fn to_seconds(self, value: u64) -> Option<u64> {
        match self {
            Self::Seconds => Some(value),
            Self::Minutes => value.checked_mul(60),
            Self::Hours => value.checked_mul(3_600),
            Self::Days => value.checked_mul(86_400),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DurationLimit {
    pub value: u64,
    #[serde(default)]
    pub unit: TimeUnit,
}

impl DurationLimit {
    pub fn new(value: u64, unit: TimeUnit) -> Self {
        Self { value, unit }
    }

    pub fn seconds(&self) -> Option<u64> {
        self.unit.to_seconds(self.value)
    }
}

/// The closed set of events a stage can be anchored to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    StatusReached,
    CommitCreated,
    PrCreated,
    PrLabelAdded,
    PrReviewStarted,
    PrApproved,
    PrMerged,
    JobRun,
    DeployJobRun,
    CiJobRun,
    CdJobRun,
    ThirdPartyCiJobRun,
    GenericEvent,
}

impl EventKind {
    pub const ALL: [EventKind; 13] = [
        Self::StatusReached,
        Self::CommitCreated,
        Self::PrCreated,
        Self::PrLabelAdded,
        Self::PrReviewStarted,
        Self::PrApproved,
        Self::PrMerged,
        Self::JobRun,
        Self::DeployJobRun,
        Self::CiJobRun,
        Self::CdJobRun,
        Self::ThirdPartyCiJobRun,
        Self::GenericEvent,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::StatusReached => "status_reached",
            Self::CommitCreated => "commit_created",
            Self::PrCreated => "pr_created",
            Self::PrLabelAdded => "pr_label_added",
            Self::PrReviewStarted => "pr_review_started",
            Self::PrApproved => "pr_approved",
            Self::PrMerged => "pr_merged",
            Self::JobRun => "job_run",
            Self::DeployJobRun => "deploy_job_run",
            Self::CiJobRun => "ci_job_run",
            Self::CdJobRun => "cd_job_run",
            Self::ThirdPartyCiJobRun => "third_party_ci_job_run",
            Self::GenericEvent => "generic_event",
        }
    }

    /// Kinds whose timestamp comes from a CI/CD job run.
    pub fn is_job_run_family(self) -> bool {
        matches!(
            self,
            Self::JobRun
                | Self::DeployJobRun
                | Self::CiJobRun
                | Self::CdJobRun
                | Self::ThirdPartyCiJobRun
        )
    }

    /// Kinds a CD stage may be triggered by.
    pub fn is_ci_family(self) -> bool {
        matches!(self, Self::JobRun | Self::CiJobRun | Self::ThirdPartyCiJobRun)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = LeadLensError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| LeadLensError::UnknownEventKind(s.to_string()))
    }
}

/// The triggering event of a stage, as configured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub values: Vec<String>,
    #[serde(default)]
    pub params: IndexMap<String, Vec<String>>,
    #[serde(default)]
    pub any_label_added: bool,
}

impl Event {
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind: kind.as_str().to_string(),
            ..Self::default()
        }
    }

    pub fn with_values<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.values = values.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_param<I, S>(mut self, name: &str, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.params
            .insert(name.to_string(), values.into_iter().map(Into::into).collect());
        self
    }

    /// Parses the configured kind string.
    ///
    /// # Errors
    ///
    /// Returns `UnknownEventKind` when the kind is not one of [`EventKind::ALL`].
    pub fn kind(&self) -> Result<EventKind, LeadLensError> {
        self.kind.parse()
    }

    pub fn param(&self, name: &str) -> Option<&[String]> {
        self.params
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, values)| values.as_slice())
    }
}

/// One named phase of a pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub order: i32,
    #[serde(default)]
    pub lower_limit: DurationLimit,
    #[serde(default)]
    pub upper_limit: DurationLimit,
    pub event: Event,
    /// Raw job-run filter, only read by CI/CD event kinds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<serde_json::Map<String, serde_json::Value>>,
}

impl StageDefinition {
    pub fn new(name: &str, order: i32, event: Event) -> Self {
        Self {
            name: name.to_string(),
            description: String::new(),
            order,
            lower_limit: DurationLimit::new(1, TimeUnit::Days),
            upper_limit: DurationLimit::new(7, TimeUnit::Days),
            event,
            filter: None,
        }
    }

    pub fn with_limits(mut self, lower: DurationLimit, upper: DurationLimit) -> Self {
        self.lower_limit = lower;
        self.upper_limit = upper;
        self
    }
}

/// A pipeline definition: three stage groups plus start-time overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PipelineConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub pre_development_stages: Vec<StageDefinition>,
    #[serde(default)]
    pub fixed_stages: Vec<StageDefinition>,
    #[serde(default)]
    pub post_development_stages: Vec<StageDefinition>,
    #[serde(default)]
    pub starting_event_is_commit_created: bool,
    #[serde(default)]
    pub starting_event_is_generic_event: bool,
    #[serde(default)]
    pub starting_generic_event_types: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Across {
    #[default]
    Velocity,
    Trend,
    Stack,
    Values,
    Histogram,
    Rating,
}

impl Across {
    /// Modes reporting aggregate statistics per stage.
    pub fn is_aggregate(self) -> bool {
        matches!(self, Self::Velocity | Self::Trend | Self::Stack)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Calculation {
    #[default]
    IssueVelocity,
    PrVelocity,
}

/// Which issue system the issue entity lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum IssueSystem {
    #[default]
    IssueTracker,
    WorkItems,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StackKind {
    IssueType,
    IssuePriority,
    IssueComponent,
    IssueProject,
    IssueLabel,
    IssueEpic,
}

impl StackKind {
    /// Column of the issue entity holding this dimension.
    pub fn column(self, system: IssueSystem) -> &'static str {
        match self {
            Self::IssueType if system == IssueSystem::WorkItems => "im.workitem_type",
            Self::IssueType => "im.issue_type",
            Self::IssuePriority => "im.priority",
            Self::IssueComponent => "im.components",
            Self::IssueProject => "im.project",
            Self::IssueLabel => "im.labels",
            Self::IssueEpic => "im.epic",
        }
    }

    pub fn is_array(self) -> bool {
        matches!(self, Self::IssueComponent | Self::IssueLabel)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    Desc,
}

impl fmt::Display for SortOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Asc => f.write_str("ASC"),
            Self::Desc => f.write_str("DESC"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RatingBucket {
    Missing,
    Good,
    NeedsAttention,
    Slow,
}

/// Second-denominated boundaries of the `good` and `needs_attention` buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatingThresholds {
    pub good_seconds: i64,
    pub needs_attention_seconds: i64,
}

/// What to compute over the compiled pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VelocityQuery {
    #[serde(default)]
    pub across: Across,
    #[serde(default)]
    pub calculation: Calculation,
    #[serde(default)]
    pub issue_system: IssueSystem,
    #[serde(default)]
    pub stack: Option<StackKind>,
    #[serde(default)]
    pub value_stacks: Vec<String>,
    #[serde(default)]
    pub value_trend_keys: Vec<i64>,
    #[serde(default)]
    pub page: usize,
    #[serde(default)]
    pub page_size: Option<usize>,
    #[serde(default)]
    pub sort: IndexMap<String, SortOrder>,
    #[serde(default)]
    pub histogram_stage_name: Option<String>,
    #[serde(default = "default_histogram_buckets")]
    pub histogram_buckets: u32,
    #[serde(default)]
    pub limit_to_only_applicable_data: bool,
    #[serde(default)]
    pub ratings: Vec<RatingBucket>,
    #[serde(default)]
    pub rating_thresholds: Option<RatingThresholds>,
}

fn default_histogram_buckets() -> u32 {
    10
}

impl Default for VelocityQuery {
    fn default() -> Self {
        Self {
            across: Across::default(),
            calculation: Calculation::default(),
            issue_system: IssueSystem::default(),
            stack: None,
            value_stacks: Vec::new(),
            value_trend_keys: Vec::new(),
            page: 0,
            page_size: None,
            sort: IndexMap::new(),
            histogram_stage_name: None,
            histogram_buckets: default_histogram_buckets(),
            limit_to_only_applicable_data: false,
            ratings: Vec::new(),
            rating_thresholds: None,
        }
    }
}

/// Org-unit settings handed through to filter translators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct OrgUnitConfig {
    #[serde(default)]
    pub ou_ref_id: Option<i64>,
    #[serde(default)]
    pub user_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct IssueFilter {
    #[serde(default)]
    pub integration_ids: Vec<String>,
    #[serde(default)]
    pub sprint_states: Vec<String>,
    #[serde(default)]
    pub is_active: Option<bool>,
    #[serde(default)]
    pub apply_org_unit_scoping: bool,
    #[serde(default)]
    pub criteria: IndexMap<String, Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PullRequestFilter {
    #[serde(default)]
    pub integration_ids: Vec<String>,
    #[serde(default)]
    pub apply_org_unit_scoping: bool,
    #[serde(default)]
    pub criteria: IndexMap<String, Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CommitFilter {
    #[serde(default)]
    pub integration_ids: Vec<String>,
    #[serde(default)]
    pub apply_org_unit_scoping: bool,
    #[serde(default)]
    pub criteria: IndexMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TimeRange {
    #[serde(default)]
    pub start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct JobRunFilter {
    #[serde(default)]
    pub end_time_range: Option<TimeRange>,
    #[serde(default)]
    pub apply_org_unit_scoping: bool,
    #[serde(default)]
    pub criteria: IndexMap<String, Vec<String>>,
}

/// Per-system entity filters of one compile call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct EntityFilters {
    #[serde(default)]
    pub issues: Option<IssueFilter>,
    #[serde(default)]
    pub pull_requests: Option<PullRequestFilter>,
    #[serde(default)]
    pub commits: Option<CommitFilter>,
    #[serde(default)]
    pub job_runs: Option<JobRunFilter>,
    #[serde(default)]
    pub org_unit: OrgUnitConfig,
}

/// Everything one compile call consumes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CompileRequest {
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub query: VelocityQuery,
    #[serde(default)]
    pub filters: EntityFilters,
}

/// Stage index to definition, mirroring the assembled pipeline.
pub type OffsetStageMap = BTreeMap<usize, StageDefinition>;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompiledQuery {
    pub sql: String,
    pub count_sql: Option<String>,
    pub params: ParamMap,
    pub offset_stage_map: OffsetStageMap,
}
