use serde::Deserialize;

use super::params::{ParamMap, StageParams};
use crate::error::{LeadLensError, Result};

/// Metadata fields matched by JSON containment, in placeholder order.
const CONTAINMENT_FIELDS: [&str; 3] = ["services", "environments", "deployment_types"];
const BRANCH_FIELD_INDEX: usize = CONTAINMENT_FIELDS.len();
const MAX_BRANCHES: usize = 2;

/// Prefix or substring match on a job-run metadata value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PartialMatch {
    #[serde(default)]
    pub begins: Option<String>,
    #[serde(default)]
    pub contains: Option<String>,
}

/// Per-stage CI/CD filter, parsed from the stage's raw filter map.
///
/// Unknown keys are ignored so stage definitions may carry fields meant for
/// other consumers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct JobRunStageFilter {
    #[serde(default)]
    pub cicd_user_ids: Vec<String>,
    #[serde(default)]
    pub exclude_cicd_user_ids: Vec<String>,
    #[serde(default)]
    pub job_statuses: Vec<String>,
    #[serde(default)]
    pub exclude_job_statuses: Vec<String>,
    #[serde(default)]
    pub services: Vec<String>,
    #[serde(default)]
    pub environments: Vec<String>,
    #[serde(default)]
    pub deployment_types: Vec<String>,
    #[serde(default)]
    pub branches: Vec<String>,
    #[serde(default)]
    pub repository: Option<PartialMatch>,
}

/// The fixed CI or CD flag a platform-native stage adds to its filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformFlag {
    Ci,
    Cd,
}

impl PlatformFlag {
    fn column(self) -> &'static str {
        match self {
            Self::Ci => "ci",
            Self::Cd => "cd",
        }
    }
}

impl JobRunStageFilter {
    /// # Errors
    ///
    /// Returns `InvalidStageFilter` when a known key has the wrong shape.
    pub fn parse(
        stage: &str,
        raw: Option<&serde_json::Map<String, serde_json::Value>>,
    ) -> Result<Self> {
        match raw {
            None => Ok(Self::default()),
            Some(map) => serde_json::from_value(serde_json::Value::Object(map.clone())).map_err(
                |source| LeadLensError::InvalidStageFilter {
                    stage: stage.to_string(),
                    source,
                },
            ),
        }
    }

    /// WHERE terms over the `jr` alias, binding their values into `params`.
    pub fn conditions(
        &self,
        names: StageParams,
        flag: Option<PlatformFlag>,
        params: &mut ParamMap,
    ) -> Vec<String> {
        let mut conditions = Vec::new();

        let mut list = |column: &str, field: &str, values: &[String], negate: bool| {
            if values.is_empty() {
                return;
            }
            let (name, op) = if negate {
                (names.excluded(field), "NOT IN")
            } else {
                (names.field(field), "IN")
            };
            conditions.push(format!("{column} {op} (:{name})"));
            params.insert(name, values.into());
        };
        list("jr.cicd_user_id", "cicd_user_ids", &self.cicd_user_ids, false);
        list("jr.cicd_user_id", "cicd_user_ids", &self.exclude_cicd_user_ids, true);
        list("jr.status", "job_statuses", &self.job_statuses, false);
        list("jr.status", "job_statuses", &self.exclude_job_statuses, true);

        let containment = [&self.services, &self.environments, &self.deployment_types];
        for (field_index, (field, values)) in CONTAINMENT_FIELDS.iter().zip(containment).enumerate() {
            let terms: Vec<String> = values
                .iter()
                .enumerate()
                .map(|(value_index, value)| {
                    let name = names.metadata_value(field_index, value_index);
                    params.insert(name.clone(), json_array(value).into());
                    format!("jr.metadata->'{field}' @> :{name}::jsonb")
                })
                .collect();
            if !terms.is_empty() {
                conditions.push(format!("({})", terms.join(" OR ")));
            }
        }

        let branch_terms: Vec<String> = self
            .branches
            .iter()
            .take(MAX_BRANCHES)
            .enumerate()
            .map(|(value_index, branch)| {
                let source = names.metadata_value(BRANCH_FIELD_INDEX, value_index);
                let target = names.metadata_alt_value(BRANCH_FIELD_INDEX, value_index);
                params.insert(source.clone(), branch.as_str().into());
                params.insert(target.clone(), branch.as_str().into());
                format!(
                    "(jr.metadata->>'branch' = :{source} OR jr.metadata->>'target_branch' = :{target})"
                )
            })
            .collect();
        if !branch_terms.is_empty() {
            conditions.push(format!("({})", branch_terms.join(" OR ")));
        }

        if let Some(repository) = &self.repository {
            if let Some(prefix) = &repository.begins {
                let name = names.metadata_partial("repo_url", "begins");
                conditions.push(format!("jr.metadata->>'repo_url' LIKE :{name}"));
                params.insert(name, format!("{prefix}%").into());
            }
            if let Some(part) = &repository.contains {
                let name = names.metadata_partial("repo_url", "contains");
                conditions.push(format!("jr.metadata->>'repo_url' LIKE :{name}"));
                params.insert(name, format!("%{part}%").into());
            }
        }

        if let Some(flag) = flag {
            let name = names.field(&format!("is_{}", flag.column()));
            conditions.push(format!("jr.{} = :{name}", flag.column()));
            params.insert(name, true.into());
        }

        conditions
    }
}

fn json_array(value: &str) -> String {
    serde_json::Value::Array(vec![serde_json::Value::String(value.to_string())]).to_string()
}

/// Row shape of a per-stage job-run sub-select.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunShape {
    /// Runs joined through their job and instance.
    Generic,
    /// Runs only, for platform-native CI.
    Platform,
    /// Runs with the CI run that produced their artifact.
    PlatformCd,
}

/// A single-level `(id, end_time)` sub-select over job runs.
#[derive(Debug, Clone)]
pub struct JobRunSelect {
    pub shape: RunShape,
    pub with_params: bool,
    pub conditions: Vec<String>,
}

impl JobRunSelect {
    pub fn render(&self, schema: &str) -> String {
        let mut sql = String::from("SELECT jr.id, jr.end_time");
        if self.shape == RunShape::PlatformCd {
            sql.push_str(", jram.cicd_job_run_id1 AS ci_job_run_id");
        }
        sql.push_str(&format!(" FROM {schema}.cicd_job_runs AS jr"));
        if self.shape == RunShape::Generic {
            sql.push_str(&format!(
                " JOIN {schema}.cicd_jobs AS j ON j.id = jr.cicd_job_id JOIN {schema}.cicd_instances AS i ON i.id = j.cicd_instance_id"
            ));
        }
        if self.with_params {
            sql.push_str(&format!(
                " JOIN {schema}.cicd_job_run_params AS jrp ON jrp.cicd_job_run_id = jr.id"
            ));
        }
        if self.shape == RunShape::PlatformCd {
            sql.push_str(&format!(
                " JOIN {schema}.cicd_job_run_artifact_mappings AS jram ON jram.cicd_job_run_id2 = jr.id"
            ));
        }
        push_where(&mut sql, &self.conditions);
        sql
    }
}

/// Deploy runs correlated to the build run named by their marker parameter.
#[derive(Debug, Clone)]
pub struct DeploySelect {
    pub deploy_conditions: Vec<String>,
    pub build_conditions: Vec<String>,
}

impl DeploySelect {
    pub fn render(&self, schema: &str) -> String {
        let run = |conditions: &[String], columns: &str| {
            let mut sql = format!(
                "SELECT jr.id, jr.end_time{columns} FROM {schema}.cicd_job_runs AS jr JOIN {schema}.cicd_job_run_params AS jrp ON jrp.cicd_job_run_id = jr.id"
            );
            push_where(&mut sql, conditions);
            sql
        };
        format!(
            "SELECT build_run.id, deploy_run.end_time FROM ({}) AS deploy_run INNER JOIN ({}) AS build_run ON deploy_run.value = build_run.id::text",
            run(&self.deploy_conditions, ", jrp.value"),
            run(&self.build_conditions, ""),
        )
    }
}

fn push_where(sql: &mut String, conditions: &[String]) {
    if !conditions.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&conditions.join(" AND "));
    }
}
