use log::{debug, warn};

use super::assembler::{issue_key_column, issue_table, Anchor};
use crate::model::IssueSystem;

/// Every join the FROM chain can carry.
///
/// Structural kinds have one fixed alias and are rendered by the registry
/// itself. `Sprint` and the stage-indexed kinds get one alias each and are
/// rendered by the caller through [`JoinRegistry::ensure_with`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JoinKind {
    Commit,
    PullRequest,
    Issue,
    Review,
    CicdMapping,
    Freshness,
    StartEvent,
    Sprint,
    StatusHistory,
    Label(usize),
    JobRun(usize),
    GenericEvent(usize),
}

impl JoinKind {
    pub fn alias(self) -> String {
        match self {
            Self::Commit => "c".into(),
            Self::PullRequest => "pr".into(),
            Self::Issue => "im".into(),
            Self::Review => "prr".into(),
            Self::CicdMapping => "csm".into(),
            Self::Freshness => "it".into(),
            Self::StartEvent => "ge".into(),
            Self::Sprint => "sprints".into(),
            Self::StatusHistory => "ims".into(),
            Self::Label(stage) => format!("lbl{stage}"),
            Self::JobRun(stage) => format!("run{stage}"),
            Self::GenericEvent(stage) => format!("ge{stage}"),
        }
    }

    /// Kinds whose SQL comes from the caller through `ensure_with`.
    pub fn is_caller_rendered(self) -> bool {
        matches!(
            self,
            Self::Sprint | Self::Label(_) | Self::JobRun(_) | Self::GenericEvent(_)
        )
    }

    fn rank(self) -> (u8, usize) {
        match self {
            Self::Commit => (0, 0),
            Self::PullRequest | Self::Issue => (1, 0),
            Self::Review => (2, 0),
            Self::CicdMapping => (3, 0),
            Self::Freshness => (4, 0),
            Self::StartEvent => (5, 0),
            Self::Sprint => (6, 0),
            Self::StatusHistory => (7, 0),
            Self::Label(stage) | Self::JobRun(stage) | Self::GenericEvent(stage) => (8, stage),
        }
    }

    fn dependencies(self) -> &'static [JoinKind] {
        match self {
            Self::PullRequest | Self::Issue | Self::CicdMapping => &[Self::Commit],
            Self::Review | Self::Label(_) => &[Self::PullRequest],
            Self::Freshness
            | Self::StartEvent
            | Self::Sprint
            | Self::StatusHistory
            | Self::GenericEvent(_) => &[Self::Issue],
            Self::Commit | Self::JobRun(_) => &[],
        }
    }
}

/// Compile-wide inputs that decide how structural joins render.
#[derive(Debug, Clone)]
pub struct JoinContext {
    pub schema: String,
    pub anchor: Anchor,
    pub freshness: bool,
    pub pr_issue_correlation: bool,
}

#[derive(Debug, Clone)]
struct JoinEntry {
    kind: JoinKind,
    alias: String,
    lines: Vec<String>,
    conditions: Vec<String>,
}

impl JoinEntry {
    fn render(&self) -> String {
        let mut lines = self.lines.clone();
        if let Some(last) = lines.last_mut() {
            for condition in &self.conditions {
                last.push_str(" AND ");
                last.push_str(condition);
            }
        }
        lines.join("\n")
    }
}

/// Deduplicated join fragments of one compile call.
#[derive(Debug, Clone)]
pub struct JoinRegistry {
    context: JoinContext,
    entries: Vec<JoinEntry>,
}

impl JoinRegistry {
    pub fn new(context: JoinContext) -> Self {
        Self {
            context,
            entries: Vec::new(),
        }
    }

    pub fn context(&self) -> &JoinContext {
        &self.context
    }

    /// Whether `kind` is the table the FROM chain starts at.
    pub fn is_anchor(&self, kind: JoinKind) -> bool {
        match kind {
            JoinKind::Issue => self.context.anchor.is_issue(),
            JoinKind::PullRequest => !self.context.anchor.is_issue(),
            _ => false,
        }
    }

    /// Whether rows of `kind` are reachable, either as anchor or joined.
    pub fn is_joined(&self, kind: JoinKind) -> bool {
        self.is_anchor(kind) || self.entries.iter().any(|entry| entry.kind == kind)
    }

    pub fn alias(&self, kind: JoinKind) -> Option<&str> {
        if self.is_anchor(kind) {
            return Some(self.context.anchor.alias());
        }
        self.entries
            .iter()
            .find(|entry| entry.kind == kind)
            .map(|entry| entry.alias.as_str())
    }

    /// Materializes a structural join once and returns its alias.
    ///
    /// Caller-rendered kinds have no fragment here; use [`Self::ensure_with`].
    pub fn ensure(&mut self, kind: JoinKind) -> String {
        debug_assert!(
            !kind.is_caller_rendered(),
            "{kind:?} is rendered by the caller, use ensure_with"
        );
        if self.is_anchor(kind) {
            return self.context.anchor.alias().to_string();
        }
        if let Some(alias) = self.alias(kind) {
            return alias.to_string();
        }
        for dependency in kind.dependencies() {
            self.ensure(*dependency);
        }
        let alias = kind.alias();
        let lines = self.fragment(kind);
        debug!("Adding join {kind:?} as {alias}");
        self.entries.push(JoinEntry {
            kind,
            alias: alias.clone(),
            lines,
            conditions: Vec::new(),
        });
        alias
    }

    /// Materializes a caller-rendered join once and returns its alias.
    ///
    /// `render` receives the alias and is only invoked on first use.
    pub fn ensure_with<F>(&mut self, kind: JoinKind, render: F) -> String
    where
        F: FnOnce(&str) -> String,
    {
        debug_assert!(
            kind.is_caller_rendered(),
            "{kind:?} is a structural join, use ensure"
        );
        if let Some(alias) = self.alias(kind) {
            return alias.to_string();
        }
        for dependency in kind.dependencies() {
            self.ensure(*dependency);
        }
        let alias = kind.alias();
        let line = render(&alias);
        debug!("Adding join {kind:?} as {alias}");
        self.entries.push(JoinEntry {
            kind,
            alias: alias.clone(),
            lines: vec![line],
            conditions: Vec::new(),
        });
        alias
    }

    /// Extends the ON clause of an already present join.
    ///
    /// Returns false when `kind` is the anchor or not joined.
    pub fn add_condition(&mut self, kind: JoinKind, condition: String) -> bool {
        match self.entries.iter_mut().find(|entry| entry.kind == kind) {
            Some(entry) => {
                entry.conditions.push(condition);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The FROM chain after the anchor table, one join per line.
    pub fn render(&self) -> String {
        let mut entries: Vec<&JoinEntry> = self.entries.iter().collect();
        entries.sort_by_key(|entry| entry.kind.rank());
        entries
            .into_iter()
            .map(JoinEntry::render)
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn fragment(&self, kind: JoinKind) -> Vec<String> {
        let s = &self.context.schema;
        let system = self.context.anchor.issue_system;
        let key = issue_key_column(system);
        let (commit_map, pr_map, map_key) = mapping_tables(system);
        let issue_mode = self.context.anchor.is_issue();

        match kind {
            JoinKind::Commit if issue_mode => vec![
                format!("LEFT JOIN {s}.{commit_map} AS m ON m.{map_key} = im.{key} AND m.issue_integration_id = im.integration_id"),
                format!("LEFT JOIN {s}.scm_commits AS c ON c.commit_sha = m.commit_sha AND c.integration_id = m.scm_integration_id"),
            ],
            JoinKind::Commit => vec![
                format!("LEFT JOIN {s}.scm_commit_pullrequest_mappings AS cprm ON cprm.scm_pullrequest_id = pr.id"),
                format!("LEFT JOIN {s}.scm_commits AS c ON c.id = cprm.scm_commit_id"),
            ],
            JoinKind::PullRequest => {
                let mut lines = Vec::new();
                let mut link = String::from("pr.id = cprm.scm_pullrequest_id");
                if self.context.pr_issue_correlation {
                    lines.push(format!(
                        "LEFT JOIN {s}.{pr_map} AS prjm ON prjm.{map_key} = im.{key} AND prjm.issue_integration_id = im.integration_id"
                    ));
                    link = format!("({link} OR pr.id = prjm.pr_uuid)");
                }
                lines.push(format!(
                    "LEFT JOIN {s}.scm_commit_pullrequest_mappings AS cprm ON cprm.scm_commit_id = c.id"
                ));
                lines.push(format!("LEFT JOIN {s}.scm_pullrequests AS pr ON {link}"));
                lines
            }
            JoinKind::Issue => {
                let mut lines = Vec::new();
                let mut link = format!("im.{key} = m.{map_key}");
                if self.context.pr_issue_correlation {
                    lines.push(format!("LEFT JOIN {s}.{pr_map} AS prjm ON prjm.pr_uuid = pr.id"));
                    link = format!("({link} OR im.{key} = prjm.{map_key})");
                }
                lines.push(format!(
                    "LEFT JOIN {s}.{commit_map} AS m ON m.commit_sha = c.commit_sha AND m.scm_integration_id = c.integration_id"
                ));
                let freshness = if self.context.freshness {
                    format!(" {}", freshness_join(s))
                } else {
                    String::new()
                };
                lines.push(format!(
                    "LEFT JOIN (SELECT im.* FROM {s}.{} AS im{freshness}) AS im ON {link}",
                    issue_table(system)
                ));
                lines
            }
            JoinKind::Review => vec![format!(
                "LEFT JOIN {s}.scm_pullrequest_reviews AS prr ON prr.pr_id = pr.id"
            )],
            JoinKind::CicdMapping => vec![format!(
                "LEFT JOIN {s}.cicd_scm_mapping AS csm ON csm.commit_id = c.id"
            )],
            JoinKind::Freshness => vec![freshness_join(s)],
            JoinKind::StartEvent => vec![format!(
                "LEFT JOIN {s}.generic_events AS ge ON ge.component = '{}' AND ge.key = im.{key} AND ge.integration_id = im.integration_id",
                generic_event_component(system)
            )],
            JoinKind::StatusHistory if system == IssueSystem::WorkItems => vec![format!(
                "LEFT JOIN {s}.workitem_timeline AS ims ON ims.integration_id = im.integration_id AND ims.workitem_id = im.workitem_id"
            )],
            JoinKind::StatusHistory => vec![format!(
                "LEFT JOIN {s}.issue_statuses AS ims ON ims.integration_id = im.integration_id AND ims.issue_key = im.key"
            )],
            JoinKind::Sprint
            | JoinKind::Label(_)
            | JoinKind::JobRun(_)
            | JoinKind::GenericEvent(_) => {
                warn!("Join {kind:?} has no structural fragment");
                Vec::new()
            }
        }
    }
}

fn freshness_join(schema: &str) -> String {
    format!(
        "INNER JOIN {schema}.integration_tracker AS it ON it.integration_id = im.integration_id AND it.latest_ingested_at = im.ingested_at"
    )
}

/// Commit-mapping table, PR-mapping table and their issue column.
fn mapping_tables(system: IssueSystem) -> (&'static str, &'static str, &'static str) {
    match system {
        IssueSystem::WorkItems => (
            "scm_commit_workitem_mappings",
            "scm_pullrequest_workitem_mappings",
            "workitem_id",
        ),
        _ => (
            "scm_commit_issue_mappings",
            "scm_pullrequest_issue_mappings",
            "issue_key",
        ),
    }
}

pub fn generic_event_component(system: IssueSystem) -> &'static str {
    match system {
        IssueSystem::WorkItems => "work_item",
        _ => "jira",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Calculation;

    fn registry(calculation: Calculation, freshness: bool) -> JoinRegistry {
        JoinRegistry::new(JoinContext {
            schema: "acme".into(),
            anchor: Anchor {
                calculation,
                issue_system: IssueSystem::IssueTracker,
            },
            freshness,
            pr_issue_correlation: true,
        })
    }

    mod ensure {
        use super::*;

        #[test]
        fn is_idempotent() {
            let mut joins = registry(Calculation::IssueVelocity, false);
            assert_eq!(joins.ensure(JoinKind::StatusHistory), "ims");
            assert_eq!(joins.ensure(JoinKind::StatusHistory), "ims");
            assert_eq!(joins.len(), 1);
            assert_eq!(joins.render().matches("issue_statuses").count(), 1);
        }

        #[test]
        fn anchor_is_never_emitted() {
            let mut joins = registry(Calculation::IssueVelocity, false);
            assert_eq!(joins.ensure(JoinKind::Issue), "im");
            assert!(joins.is_empty());
            assert!(joins.is_joined(JoinKind::Issue));
            assert!(!joins.is_joined(JoinKind::PullRequest));
        }

        #[test]
        fn resolves_dependencies_in_rank_order() {
            let mut joins = registry(Calculation::IssueVelocity, false);
            joins.ensure(JoinKind::Review);
            let sql = joins.render();
            let commit = sql.find("AS c ON").unwrap();
            let pr = sql.find("AS pr ON").unwrap();
            let review = sql.find("AS prr ON").unwrap();
            assert!(commit < pr && pr < review, "{sql}");
        }

        #[test]
        #[cfg(debug_assertions)]
        #[should_panic(expected = "rendered by the caller, use ensure_with")]
        fn rejects_caller_rendered_kinds() {
            let mut joins = registry(Calculation::IssueVelocity, false);
            joins.ensure(JoinKind::GenericEvent(2));
        }

        #[test]
        fn only_stage_joins_and_sprints_are_caller_rendered() {
            let caller = [
                JoinKind::Sprint,
                JoinKind::Label(0),
                JoinKind::JobRun(1),
                JoinKind::GenericEvent(2),
            ];
            for kind in caller {
                assert!(kind.is_caller_rendered(), "{kind:?}");
            }
            let structural = [
                JoinKind::Commit,
                JoinKind::Review,
                JoinKind::StartEvent,
                JoinKind::StatusHistory,
            ];
            for kind in structural {
                assert!(!kind.is_caller_rendered(), "{kind:?}");
            }
        }

        #[test]
        fn pr_anchor_embeds_freshness_in_issue_subselect() {
            let mut joins = registry(Calculation::PrVelocity, true);
            assert_eq!(joins.ensure(JoinKind::StatusHistory), "ims");
            let sql = joins.render();
            assert!(sql.contains(
                "LEFT JOIN (SELECT im.* FROM acme.issues AS im INNER JOIN acme.integration_tracker AS it"
            ));
            assert!(sql.contains("(im.key = m.issue_key OR im.key = prjm.issue_key)"));
        }
    }

    mod ensure_with {
        use super::*;

        #[test]
        fn allocates_one_alias_per_stage() {
            let mut joins = registry(Calculation::PrVelocity, false);
            for stage in [3, 1] {
                joins.ensure_with(JoinKind::Label(stage), |alias| {
                    format!("LEFT JOIN acme.scm_pullrequest_labels AS {alias} ON {alias}.scm_pullrequest_id = pr.id")
                });
            }
            let again = joins.ensure_with(JoinKind::Label(1), |_| unreachable!());
            assert_eq!(again, "lbl1");
            let sql = joins.render();
            assert_eq!(sql.matches("scm_pullrequest_labels").count(), 2);
            assert!(sql.find("lbl1").unwrap() < sql.find("lbl3").unwrap());
        }

        #[test]
        #[cfg(debug_assertions)]
        #[should_panic(expected = "is a structural join, use ensure")]
        fn rejects_structural_kinds() {
            let mut joins = registry(Calculation::IssueVelocity, false);
            joins.ensure_with(JoinKind::Review, |alias| format!("LEFT JOIN x AS {alias}"));
        }
    }

    mod add_condition {
        use super::*;

        #[test]
        fn appends_to_last_line_of_join() {
            let mut joins = registry(Calculation::IssueVelocity, false);
            joins.ensure(JoinKind::PullRequest);
            assert!(joins.add_condition(JoinKind::PullRequest, "pr.source_branch IN (:s2_value_0)".into()));
            let sql = joins.render();
            let last = sql.lines().last().unwrap();
            assert!(last.ends_with("AND pr.source_branch IN (:s2_value_0)"), "{last}");
        }

        #[test]
        fn ignores_missing_join() {
            let mut joins = registry(Calculation::IssueVelocity, false);
            assert!(!joins.add_condition(JoinKind::Review, "prr.state = 'x'".into()));
            assert!(!joins.add_condition(JoinKind::Issue, "im.id = 1".into()));
        }
    }
}
