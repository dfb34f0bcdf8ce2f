//! Layering of the compiled query.
//!
//! Every query is built as `base -> reduce -> durations -> enrich`, and one
//! outer shape per across mode wraps the enrich layer:
//!
//! - `base`: one row per matched join row with an `eN` timestamp per stage
//!   and `estart`.
//! - `reduce`: fan-out rows collapsed per anchor entity with each stage's
//!   aggregate.
//! - `durations`: `sN` seconds between stage N and the latest earlier event.
//! - `enrich`: the per-stage formula column and the total `t`.

use log::{debug, warn};

use super::assembler::{Anchor, Pipeline};
use super::events::Aggregate;
use crate::error::{LeadLensError, Result};
use crate::model::{
    Across, DurationLimit, RatingBucket, RatingThresholds, StageDefinition, VelocityQuery,
};

/// How `enrich` turns a stage duration into the reported column.
///
/// `ZeroFloor` renders `GREATEST(sN, 0)`: a stage that never fired reports
/// `0` and counts in every statistic.
///
/// `NullPreserving` renders `GREATEST((sN + 0) - 0, (sN + 0) - sN)`. For a
/// non-null `sN` both operands reduce to `sN` and `0`, so the result equals
/// the zero floor. For a null `sN` both operands are null, and since
/// `GREATEST` only returns null when every argument is null the column stays
/// null, which keeps the entity out of percentiles, means, counts and buckets.
/// Dialects whose `GREATEST` propagates any null need
/// `CASE WHEN sN IS NULL THEN NULL ELSE GREATEST(sN, 0) END` instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormulaVariant {
    ZeroFloor,
    NullPreserving,
}

impl FormulaVariant {
    pub fn for_query(query: &VelocityQuery) -> Self {
        if query.across.is_aggregate() && !query.limit_to_only_applicable_data {
            Self::ZeroFloor
        } else {
            Self::NullPreserving
        }
    }

    pub fn render(self, stage: usize) -> String {
        match self {
            Self::ZeroFloor => format!("GREATEST(s{stage}, 0)"),
            Self::NullPreserving => {
                format!("GREATEST((s{stage} + 0) - 0, (s{stage} + 0) - s{stage})")
            }
        }
    }
}

/// The timestamp and aggregate one stage contributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageColumn {
    pub timestamp: String,
    pub aggregate: Aggregate,
}

/// Inputs of the four inner layers.
#[derive(Debug, Clone)]
pub struct QueryLayers {
    pub anchor: Anchor,
    pub from: String,
    pub joins: String,
    pub conditions: Vec<String>,
    pub start: String,
    pub stages: Vec<StageColumn>,
    pub trend: bool,
    /// Select expression of the stack dimension.
    pub stack: Option<String>,
    pub formula: FormulaVariant,
}

impl QueryLayers {
    fn group_columns(&self) -> Vec<&str> {
        let mut columns = self.anchor.identity_columns();
        if self.trend {
            columns.push("trend");
        }
        if self.stack.is_some() {
            columns.push("stack");
        }
        columns
    }

    fn base(&self) -> String {
        let mut selects: Vec<String> = self
            .anchor
            .identity_selects()
            .into_iter()
            .map(str::to_string)
            .collect();
        if self.trend {
            selects.push(format!("{} AS trend", self.anchor.trend_expr()));
        }
        if let Some(stack) = &self.stack {
            selects.push(format!("{stack} AS stack"));
        }
        selects.push(format!("{} AS estart", self.start));
        for (index, stage) in self.stages.iter().enumerate() {
            selects.push(format!("{} AS e{index}", stage.timestamp));
        }

        let mut sql = format!("SELECT {} FROM {}", selects.join(", "), self.from);
        if !self.joins.is_empty() {
            sql.push('\n');
            sql.push_str(&self.joins);
        }
        if !self.conditions.is_empty() {
            sql.push_str("\nWHERE ");
            sql.push_str(&self.conditions.join(" AND "));
        }
        sql
    }

    fn reduce(&self) -> String {
        let group = self.group_columns();
        let mut selects: Vec<String> = group.iter().map(|c| c.to_string()).collect();
        selects.push("MIN(estart) AS estart".into());
        for (index, stage) in self.stages.iter().enumerate() {
            selects.push(format!("{}(e{index}) AS e{index}", stage.aggregate));
        }
        format!(
            "SELECT {} FROM (\n{}\n) AS base GROUP BY {}",
            selects.join(", "),
            self.base(),
            group.join(", ")
        )
    }

    fn durations(&self) -> String {
        let mut selects: Vec<String> = self.group_columns().iter().map(|c| c.to_string()).collect();
        for index in 0..self.stages.len() {
            selects.push(duration(index));
        }
        format!("SELECT {} FROM (\n{}\n) AS reduce", selects.join(", "), self.reduce())
    }

    /// The full `enrich` select, before any outer shape.
    pub fn enrich(&self) -> String {
        let mut selects: Vec<String> = self.group_columns().iter().map(|c| c.to_string()).collect();
        for index in 0..self.stages.len() {
            selects.push(format!("{} AS s{index}", self.formula.render(index)));
        }
        let total: Vec<String> = (0..self.stages.len())
            .map(|index| format!("GREATEST(s{index}, 0)"))
            .collect();
        selects.push(format!("({}) AS t", total.join(" + ")));
        format!(
            "SELECT {} FROM (\n{}\n) AS durations",
            selects.join(", "),
            self.durations()
        )
    }
}

/// Seconds between stage `index` and the latest earlier event.
pub fn duration(index: usize) -> String {
    if index == 0 {
        return "ABS(EXTRACT(EPOCH FROM (e0 - estart))) AS s0".into();
    }
    let previous: Vec<String> = (0..index).rev().map(|i| format!("e{i}")).collect();
    format!(
        "EXTRACT(EPOCH FROM (e{index} - COALESCE({}, estart))) AS s{index}",
        previous.join(", ")
    )
}

/// Pagination of the values listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub limit: usize,
    pub offset: usize,
}

impl Page {
    /// Zero-based `page` of `size` rows.
    ///
    /// # Errors
    ///
    /// Returns `Config` for an empty page or an offset past `usize::MAX`.
    pub fn new(page: usize, size: usize) -> Result<Self> {
        if size == 0 {
            return Err(LeadLensError::Config("page size must be at least 1".into()));
        }
        let offset = page.checked_mul(size).ok_or_else(|| {
            LeadLensError::Config(format!("page {page} of size {size} is out of range"))
        })?;
        Ok(Self { limit: size, offset })
    }

    fn clause(&self) -> String {
        format!("LIMIT {} OFFSET {}", self.limit, self.offset)
    }
}

/// The outer shape wrapping `enrich`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputShape {
    Velocity,
    Trend,
    Stack,
    Values {
        order_by: Vec<String>,
        page: Page,
        /// OR'd rating predicates; moves pagination outside the filter.
        rating_filter: Option<Vec<String>>,
    },
    Histogram {
        stage: usize,
        /// Exclusive upper edge passed to `WIDTH_BUCKET`.
        upper_bound: u64,
        buckets: u32,
    },
    Rating {
        stage: usize,
        thresholds: RatingThresholds,
    },
}

/// The main query and, for listings, its paired count query.
pub fn shape(enrich: &str, stages: usize, output: &OutputShape) -> (String, Option<String>) {
    match output {
        OutputShape::Velocity => (
            format!("SELECT {} FROM (\n{enrich}\n) AS enrich", statistics(stages)),
            None,
        ),
        OutputShape::Trend => (
            format!(
                "SELECT trend, {} FROM (\n{enrich}\n) AS enrich GROUP BY trend ORDER BY trend",
                statistics(stages)
            ),
            None,
        ),
        OutputShape::Stack => (
            format!(
                "SELECT stack, {} FROM (\n{enrich}\n) AS enrich GROUP BY stack",
                statistics(stages)
            ),
            None,
        ),
        OutputShape::Values {
            order_by,
            page,
            rating_filter,
        } => {
            let ordered = format!(
                "SELECT * FROM (\n{enrich}\n) AS enrich ORDER BY {}",
                order_by.join(", ")
            );
            let body = match rating_filter {
                Some(conditions) => format!(
                    "SELECT * FROM (\n{ordered}\n) AS histo WHERE ({})",
                    conditions.join(" OR ")
                ),
                None => ordered,
            };
            let count = format!("SELECT COUNT(*) FROM (\n{body}\n) AS counted");
            (format!("{body}\n{}", page.clause()), Some(count))
        }
        OutputShape::Histogram {
            stage,
            upper_bound,
            buckets,
        } => (
            format!(
                "SELECT MIN(s{stage}) AS min, MAX(s{stage}) AS max, WIDTH_BUCKET(s{stage}, 0, {upper_bound}, {buckets}) AS bucket, COUNT(*) AS cnt FROM (\n{enrich}\n) AS histo GROUP BY bucket ORDER BY bucket"
            ),
            None,
        ),
        OutputShape::Rating { stage, thresholds } => {
            let s = format!("s{stage}");
            let good = thresholds.good_seconds;
            let slow = thresholds.needs_attention_seconds;
            (
                format!(
                    "SELECT CASE WHEN {s} IS NULL OR {s} = 0 THEN 'missing' WHEN {s} > 0 AND {s} <= {good} THEN 'good' WHEN {s} > {good} AND {s} <= {slow} THEN 'needs_attention' ELSE 'slow' END AS rating, COUNT(*) AS cnt FROM (\n{enrich}\n) AS histo GROUP BY rating"
                ),
                None,
            )
        }
    }
}

fn statistics(stages: usize) -> String {
    (0..stages)
        .flat_map(|i| {
            [
                format!("PERCENTILE_CONT(0.5) WITHIN GROUP (ORDER BY s{i}) AS s{i}_median"),
                format!("PERCENTILE_CONT(0.9) WITHIN GROUP (ORDER BY s{i}) AS s{i}_p90"),
                format!("PERCENTILE_CONT(0.95) WITHIN GROUP (ORDER BY s{i}) AS s{i}_p95"),
                format!("AVG(s{i}) AS s{i}_mean"),
                format!("COUNT(s{i}) AS s{i}_count"),
            ]
        })
        .collect::<Vec<_>>()
        .join(", ")
}

const TOTAL_SORT_KEYS: [&str; 2] = ["total", "data"];

/// ORDER BY terms of the values listing.
pub fn order_by(query: &VelocityQuery, pipeline: &Pipeline) -> Vec<String> {
    let mut terms = Vec::new();
    for (key, direction) in &query.sort {
        if let Some(index) = pipeline.stage_index(key) {
            terms.push(format!("s{index} {direction} NULLS LAST"));
        } else if TOTAL_SORT_KEYS.contains(&key.as_str()) {
            terms.push(format!("t {direction} NULLS LAST"));
            terms.push("u_id DESC".into());
        } else {
            warn!("Ignoring sort key {key}: no such stage in {}", pipeline.name);
        }
    }
    if terms.is_empty() {
        debug!("Using default ordering on total lead time");
        terms.push("t DESC NULLS LAST".into());
        terms.push("u_id DESC".into());
    }
    terms
}

/// Histogram upper edge for `stage`: one past its upper limit.
///
/// # Errors
///
/// Returns `Config` when the limit does not fit in seconds.
pub fn histogram_upper_bound(stage: &StageDefinition) -> Result<u64> {
    stage
        .upper_limit
        .seconds()
        .and_then(|seconds| seconds.checked_add(1))
        .ok_or_else(|| out_of_range(stage, "upper"))
}

/// Thresholds for `stage`: explicit ones, else derived from its limits.
///
/// # Errors
///
/// Returns `InvalidRatingThresholds` when `good` does not precede
/// `needs_attention`, and `Config` when a derived limit does not fit in
/// seconds.
pub fn thresholds(
    stage: &StageDefinition,
    explicit: Option<RatingThresholds>,
) -> Result<RatingThresholds> {
    let thresholds = match explicit {
        Some(explicit) => explicit,
        None => RatingThresholds {
            // Non-negative, so one below cannot wrap.
            good_seconds: limit_seconds(stage, stage.lower_limit, "lower")? - 1,
            needs_attention_seconds: limit_seconds(stage, stage.upper_limit, "upper")?
                .checked_add(1)
                .ok_or_else(|| out_of_range(stage, "upper"))?,
        },
    };
    if thresholds.good_seconds >= thresholds.needs_attention_seconds {
        return Err(LeadLensError::InvalidRatingThresholds(format!(
            "good ({}s) must be below needs_attention ({}s) for stage {}",
            thresholds.good_seconds, thresholds.needs_attention_seconds, stage.name
        )));
    }
    Ok(thresholds)
}

fn limit_seconds(stage: &StageDefinition, limit: DurationLimit, which: &str) -> Result<i64> {
    limit
        .seconds()
        .and_then(|seconds| i64::try_from(seconds).ok())
        .ok_or_else(|| out_of_range(stage, which))
}

fn out_of_range(stage: &StageDefinition, which: &str) -> LeadLensError {
    LeadLensError::Config(format!("{which} limit of stage {} is out of range", stage.name))
}

/// WHERE terms keeping rows whose `stage` falls in one of `buckets`.
pub fn rating_conditions(
    stage: usize,
    thresholds: RatingThresholds,
    buckets: &[RatingBucket],
) -> Vec<String> {
    let s = format!("s{stage}");
    let good = thresholds.good_seconds;
    let slow = thresholds.needs_attention_seconds;
    buckets
        .iter()
        .map(|bucket| match bucket {
            RatingBucket::Missing => format!("({s} IS NULL)"),
            RatingBucket::Good => format!("({s} <= {good})"),
            RatingBucket::NeedsAttention => format!("({s} > {good} AND {s} <= {slow})"),
            RatingBucket::Slow => format!("({s} > {slow})"),
        })
        .collect()
}

/// Whether `across` needs the trend column in every layer.
pub fn carries_trend(across: Across) -> bool {
    across == Across::Trend
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Calculation, Event, EventKind, IssueSystem, TimeUnit};

    fn layers(formula: FormulaVariant) -> QueryLayers {
        QueryLayers {
            anchor: Anchor {
                calculation: Calculation::IssueVelocity,
                issue_system: IssueSystem::IssueTracker,
            },
            from: "acme.issues AS im".into(),
            joins: String::new(),
            conditions: vec!["im.integration_id IN (:jira_integration_ids)".into()],
            start: "to_timestamp(im.issue_created_at)".into(),
            stages: vec![
                StageColumn {
                    timestamp: "c.committed_at".into(),
                    aggregate: Aggregate::Min,
                },
                StageColumn {
                    timestamp: "pr.pr_merged_at".into(),
                    aggregate: Aggregate::Max,
                },
            ],
            trend: false,
            stack: None,
            formula,
        }
    }

    mod formula_variant {
        use super::*;

        #[test]
        fn aggregate_modes_floor_at_zero() {
            for across in [Across::Velocity, Across::Trend, Across::Stack] {
                let query = VelocityQuery {
                    across,
                    ..VelocityQuery::default()
                };
                assert_eq!(FormulaVariant::for_query(&query), FormulaVariant::ZeroFloor);
            }
        }

        #[test]
        fn listing_modes_and_applicable_data_preserve_nulls() {
            for across in [Across::Values, Across::Histogram, Across::Rating] {
                let query = VelocityQuery {
                    across,
                    ..VelocityQuery::default()
                };
                assert_eq!(FormulaVariant::for_query(&query), FormulaVariant::NullPreserving);
            }
            let query = VelocityQuery {
                limit_to_only_applicable_data: true,
                ..VelocityQuery::default()
            };
            assert_eq!(FormulaVariant::for_query(&query), FormulaVariant::NullPreserving);
        }

        #[test]
        fn renders_both_operands_from_the_stage() {
            assert_eq!(FormulaVariant::ZeroFloor.render(1), "GREATEST(s1, 0)");
            assert_eq!(
                FormulaVariant::NullPreserving.render(1),
                "GREATEST((s1 + 0) - 0, (s1 + 0) - s1)"
            );
        }
    }

    mod duration {
        use super::*;

        #[test]
        fn first_stage_is_absolute_distance_to_start() {
            assert_eq!(duration(0), "ABS(EXTRACT(EPOCH FROM (e0 - estart))) AS s0");
        }

        #[test]
        fn later_stages_coalesce_earlier_events_descending() {
            assert_eq!(
                duration(3),
                "EXTRACT(EPOCH FROM (e3 - COALESCE(e2, e1, e0, estart))) AS s3"
            );
        }
    }

    mod query_layers {
        use super::*;

        #[test]
        fn reduce_applies_stage_aggregates() {
            let sql = layers(FormulaVariant::ZeroFloor).enrich();
            assert!(sql.contains("MIN(estart) AS estart, MIN(e0) AS e0, MAX(e1) AS e1"));
            assert!(sql.contains("GROUP BY u_id, integration_id, key, title, org, project, repo_id"));
        }

        #[test]
        fn total_floors_raw_durations() {
            let sql = layers(FormulaVariant::NullPreserving).enrich();
            assert!(sql.contains("(GREATEST(s0, 0) + GREATEST(s1, 0)) AS t"));
            assert!(sql.contains("GREATEST((s1 + 0) - 0, (s1 + 0) - s1) AS s1"));
        }

        #[test]
        fn stack_and_trend_join_group_columns() {
            let mut layers = layers(FormulaVariant::ZeroFloor);
            layers.trend = true;
            layers.stack = Some("UNNEST(im.labels)".into());
            let sql = layers.enrich();
            assert!(sql.contains("im.ingested_at AS trend, UNNEST(im.labels) AS stack"));
            assert!(sql.contains("repo_id, trend, stack"));
        }
    }

    mod shape {
        use super::*;

        #[test]
        fn values_count_wraps_unlimited_body() {
            let output = OutputShape::Values {
                order_by: vec!["t DESC NULLS LAST".into(), "u_id DESC".into()],
                page: Page::new(2, 25).unwrap(),
                rating_filter: None,
            };
            let (sql, count) = shape("ENRICH", 2, &output);
            let count = count.unwrap();
            assert!(sql.ends_with("LIMIT 25 OFFSET 50"));
            let body = sql.trim_end_matches("\nLIMIT 25 OFFSET 50");
            assert_eq!(count, format!("SELECT COUNT(*) FROM (\n{body}\n) AS counted"));
        }

        #[test]
        fn rating_filter_moves_pagination_outward() {
            let output = OutputShape::Values {
                order_by: vec!["s0 ASC NULLS LAST".into()],
                page: Page::new(0, 10).unwrap(),
                rating_filter: Some(vec!["(s0 IS NULL)".into(), "(s0 > 90)".into()]),
            };
            let (sql, _) = shape("ENRICH", 1, &output);
            assert!(sql.ends_with(") AS histo WHERE ((s0 IS NULL) OR (s0 > 90))\nLIMIT 10 OFFSET 0"));
        }

        #[test]
        fn histogram_renders_exclusive_upper_edge() {
            let output = OutputShape::Histogram {
                stage: 1,
                upper_bound: 604_801,
                buckets: 12,
            };
            let (sql, count) = shape("ENRICH", 2, &output);
            assert!(sql.contains("WIDTH_BUCKET(s1, 0, 604801, 12) AS bucket"));
            assert!(count.is_none());
        }

        #[test]
        fn page_offset_is_checked() {
            assert_eq!(Page::new(3, 20).unwrap(), Page { limit: 20, offset: 60 });
            assert!(matches!(Page::new(0, 0), Err(LeadLensError::Config(_))));
            assert!(matches!(Page::new(usize::MAX, 2), Err(LeadLensError::Config(_))));
        }

        #[test]
        fn velocity_reports_five_statistics_per_stage() {
            let (sql, _) = shape("ENRICH", 2, &OutputShape::Velocity);
            assert_eq!(sql.matches("PERCENTILE_CONT").count(), 6);
            assert!(sql.contains("COUNT(s1) AS s1_count"));
        }

        #[test]
        fn stack_groups_without_ordering() {
            let (sql, _) = shape("ENRICH", 1, &OutputShape::Stack);
            assert!(sql.ends_with("GROUP BY stack"));
        }
    }

    mod thresholds {
        use super::*;

        fn stage() -> StageDefinition {
            StageDefinition::new("Review", 0, Event::new(EventKind::PrReviewStarted)).with_limits(
                DurationLimit::new(1, TimeUnit::Hours),
                DurationLimit::new(1, TimeUnit::Days),
            )
        }

        #[test]
        fn derived_from_stage_limits() {
            let derived = thresholds(&stage(), None).unwrap();
            assert_eq!(derived.good_seconds, 3_599);
            assert_eq!(derived.needs_attention_seconds, 86_401);
        }

        #[test]
        fn histogram_upper_bound_is_limit_plus_one() {
            assert_eq!(histogram_upper_bound(&stage()).unwrap(), 86_401);
        }

        #[test]
        fn oversized_limits_are_rejected() {
            let stage = stage().with_limits(
                DurationLimit::new(1, TimeUnit::Hours),
                DurationLimit::new(u64::MAX, TimeUnit::Seconds),
            );
            assert!(matches!(histogram_upper_bound(&stage), Err(LeadLensError::Config(_))));
            assert!(matches!(thresholds(&stage, None), Err(LeadLensError::Config(_))));

            let stage = stage.with_limits(
                DurationLimit::new(1, TimeUnit::Hours),
                DurationLimit::new(u64::MAX / 1_000, TimeUnit::Days),
            );
            assert!(matches!(thresholds(&stage, None), Err(LeadLensError::Config(_))));
        }

        #[test]
        fn explicit_values_win() {
            let explicit = RatingThresholds {
                good_seconds: 10,
                needs_attention_seconds: 20,
            };
            assert_eq!(thresholds(&stage(), Some(explicit)).unwrap(), explicit);
        }

        #[test]
        fn contradictory_values_are_rejected() {
            let explicit = RatingThresholds {
                good_seconds: 20,
                needs_attention_seconds: 20,
            };
            let err = thresholds(&stage(), Some(explicit)).unwrap_err();
            assert!(matches!(err, LeadLensError::InvalidRatingThresholds(_)));
        }

        #[test]
        fn rating_conditions_per_bucket() {
            let t = RatingThresholds {
                good_seconds: 10,
                needs_attention_seconds: 20,
            };
            assert_eq!(
                rating_conditions(2, t, &[RatingBucket::Missing, RatingBucket::NeedsAttention]),
                vec!["(s2 IS NULL)", "(s2 > 10 AND s2 <= 20)"]
            );
        }
    }
}
