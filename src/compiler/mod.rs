//! Compilation of lead-time pipelines into parameterized SQL.

pub mod assembler;
pub mod events;
pub mod job_runs;
pub mod joins;
pub mod params;
pub mod predicates;
pub mod shaper;


use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::error::{LeadLensError, Result};
use crate::filters::FilterTranslator;
use crate::model::{Across, CompileRequest, CompiledQuery, IssueSystem, VelocityQuery};
use assembler::{assemble, freshness_required, Pipeline};
use events::{compile_event, EventContext, StageEvent};
use joins::{JoinContext, JoinKind, JoinRegistry};
use params::ParamMap;
use predicates::PredicateComposer;
use shaper::{FormulaVariant, OutputShape, Page, QueryLayers, StageColumn};

pub const DEFAULT_PAGE_SIZE: usize = 25;

/// Compile-wide settings that do not vary per request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CompilerSettings {
    /// Schema qualifying every table.
    pub schema: String,
    /// Also link PRs and issues through the PR mapping table.
    pub pr_issue_correlation: bool,
    pub default_page_size: usize,
}

impl Default for CompilerSettings {
    fn default() -> Self {
        Self {
            schema: "public".to_string(),
            pr_issue_correlation: true,
            default_page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

/// Stateless compiler; every call builds its own join registry and params.
pub struct VelocityCompiler<T: FilterTranslator> {
    settings: CompilerSettings,
    translator: T,
}

impl<T: FilterTranslator> VelocityCompiler<T> {
    pub fn new(settings: CompilerSettings, translator: T) -> Self {
        Self {
            settings,
            translator,
        }
    }

    pub fn settings(&self) -> &CompilerSettings {
        &self.settings
    }

    /// Assembles the pipeline of `request` without compiling it.
    ///
    /// # Errors
    ///
    /// Returns the assembly errors of [`assemble`].
    pub fn assemble(&self, request: &CompileRequest) -> Result<Pipeline> {
        assemble(&request.pipeline, &request.query)
    }

    /// Compiles `request` into SQL, an optional count query and bindings.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for invalid pipelines or queries, and
    /// propagates filter translator failures unchanged.
    pub fn compile(&self, request: &CompileRequest) -> Result<CompiledQuery> {
        let query = &request.query;
        info!(
            "Compiling pipeline {} across {:?} ({:?})",
            request.pipeline.name, query.across, query.calculation
        );

        let pipeline = assemble(&request.pipeline, query)?;
        let output = self.output_shape(&pipeline, query)?;
        let stack = self.stack_select(&pipeline, query)?;

        let mut params = ParamMap::new();
        let mut joins = JoinRegistry::new(JoinContext {
            schema: self.settings.schema.clone(),
            anchor: pipeline.anchor,
            freshness: freshness_required(query),
            pr_issue_correlation: self.settings.pr_issue_correlation,
        });
        if pipeline.anchor.is_issue() {
            if freshness_required(query) {
                joins.ensure(JoinKind::Freshness);
            }
        } else if pipeline.anchor.issue_system != IssueSystem::None {
            joins.ensure(JoinKind::Issue);
        }

        let start = pipeline
            .start
            .expression(&pipeline.anchor, &mut joins, &mut params);

        let composer = PredicateComposer::new(&self.translator, &request.filters, query);
        let last_job_run = pipeline.last_job_run_stage()?;
        let run_predicates = composer.job_run_predicates(last_job_run, &mut params)?;

        let mut stages = Vec::with_capacity(pipeline.len());
        let mut event_predicates = Vec::new();
        {
            let mut ctx = EventContext {
                joins: &mut joins,
                params: &mut params,
                last_job_run,
                run_predicates,
                previous_ci: None,
            };
            for (index, stage) in pipeline.stages.iter().enumerate() {
                let event = StageEvent::resolve(stage)?;
                let compiled = compile_event(&event, stage, index, &mut ctx)?;
                event_predicates.extend(compiled.predicates);
                stages.push(StageColumn {
                    timestamp: compiled.timestamp,
                    aggregate: compiled.aggregate,
                });
            }
        }

        let mut conditions = composer.compose(&pipeline, &mut joins, &mut params, last_job_run)?;
        conditions.extend(event_predicates);

        let layers = QueryLayers {
            anchor: pipeline.anchor,
            from: pipeline.anchor.from_clause(&self.settings.schema),
            joins: joins.render(),
            conditions,
            start,
            stages,
            trend: shaper::carries_trend(query.across),
            stack,
            formula: FormulaVariant::for_query(query),
        };
        debug!(
            "Rendering {} stages with {} joins using {:?}",
            pipeline.len(),
            joins.len(),
            layers.formula
        );
        let (sql, count_sql) = shaper::shape(&layers.enrich(), pipeline.len(), &output);

        Ok(CompiledQuery {
            sql,
            count_sql,
            params,
            offset_stage_map: pipeline.offset_stage_map(),
        })
    }

    fn output_shape(&self, pipeline: &Pipeline, query: &VelocityQuery) -> Result<OutputShape> {
        Ok(match query.across {
            Across::Velocity => OutputShape::Velocity,
            Across::Trend => OutputShape::Trend,
            Across::Stack => OutputShape::Stack,
            Across::Values => {
                let size = query.page_size.unwrap_or(self.settings.default_page_size);
                let page = Page::new(query.page, size)?;
                let rating_filter = if query.ratings.is_empty() {
                    None
                } else {
                    Some(self.rating_filter(pipeline, query)?)
                };
                OutputShape::Values {
                    order_by: shaper::order_by(query, pipeline),
                    page,
                    rating_filter,
                }
            }
            Across::Histogram => {
                if query.histogram_buckets == 0 {
                    return Err(LeadLensError::Config(
                        "histogram bucket count must be at least 1".into(),
                    ));
                }
                let stage = self.target_stage(pipeline, query)?;
                OutputShape::Histogram {
                    stage,
                    upper_bound: shaper::histogram_upper_bound(&pipeline.stages[stage])?,
                    buckets: query.histogram_buckets,
                }
            }
            Across::Rating => {
                let stage = self.target_stage(pipeline, query)?;
                OutputShape::Rating {
                    stage,
                    thresholds: shaper::thresholds(&pipeline.stages[stage], query.rating_thresholds)?,
                }
            }
        })
    }

    fn target_stage(&self, pipeline: &Pipeline, query: &VelocityQuery) -> Result<usize> {
        let name = query.histogram_stage_name.as_deref().ok_or_else(|| {
            LeadLensError::Config(format!("across {:?} requires a target stage name", query.across))
        })?;
        pipeline.require_stage(name)
    }

    fn rating_filter(&self, pipeline: &Pipeline, query: &VelocityQuery) -> Result<Vec<String>> {
        let targets: Vec<usize> = match query.histogram_stage_name.as_deref() {
            Some(name) => vec![pipeline.require_stage(name)?],
            None => (0..pipeline.len()).collect(),
        };
        let mut conditions = Vec::new();
        for index in targets {
            let thresholds = shaper::thresholds(&pipeline.stages[index], query.rating_thresholds)?;
            conditions.extend(shaper::rating_conditions(index, thresholds, &query.ratings));
        }
        Ok(conditions)
    }

    /// The `stack` select expression, ensuring the issue join it reads.
    fn stack_select(&self, pipeline: &Pipeline, query: &VelocityQuery) -> Result<Option<String>> {
        if query.across != Across::Stack {
            return Ok(None);
        }
        let stack = query.stack.ok_or_else(|| {
            LeadLensError::Config("across stack requires a stack dimension".into())
        })?;
        if pipeline.anchor.issue_system == IssueSystem::None {
            return Err(LeadLensError::UnsupportedCombination(
                "stacking requires an issue system".into(),
            ));
        }
        let column = stack.column(pipeline.anchor.issue_system);
        Ok(Some(if stack.is_array() {
            format!("UNNEST({column})")
        } else {
            column.to_string()
        }))
    }
}
