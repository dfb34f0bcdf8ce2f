use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// A value bound to a named placeholder of the compiled SQL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    IntList(Vec<i64>),
    Text(String),
    TextList(Vec<String>),
}

impl From<bool> for ParamValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for ParamValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<Vec<i64>> for ParamValue {
    fn from(value: Vec<i64>) -> Self {
        Self::IntList(value)
    }
}

impl From<String> for ParamValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<Vec<String>> for ParamValue {
    fn from(value: Vec<String>) -> Self {
        Self::TextList(value)
    }
}

impl From<&[String]> for ParamValue {
    fn from(value: &[String]) -> Self {
        Self::TextList(value.to_vec())
    }
}

/// Placeholder name to bound value, in insertion order.
pub type ParamMap = IndexMap<String, ParamValue>;

pub const SCM_INTEGRATION_IDS: &str = "integration_ids";
pub const ISSUE_INTEGRATION_IDS: &str = "jira_integration_ids";
pub const VALUE_TREND_KEYS: &str = "value_trend_keys";
pub const VALUE_STACKS: &str = "value_stacks";
pub const SPRINT_STATES: &str = "sprint_states";
pub const IS_ACTIVE: &str = "is_active";
pub const STARTING_GENERIC_EVENT_TYPES: &str = "starting_generic_event_types";

/// Allocates placeholder names for a single stage.
///
/// Every name embeds the stage index, so two stages can never collide even
/// when they share a join alias.
#[derive(Debug, Clone, Copy)]
pub struct StageParams {
    stage: usize,
}

impl StageParams {
    pub fn new(stage: usize) -> Self {
        Self { stage }
    }

    /// `s{N}_value`
    pub fn value(&self) -> String {
        format!("s{}_value", self.stage)
    }

    /// `s{N}_value_{i}`
    pub fn indexed_value(&self, index: usize) -> String {
        format!("s{}_value_{index}", self.stage)
    }

    /// `s{N}_name_{i}`
    pub fn name(&self, index: usize) -> String {
        format!("s{}_name_{index}", self.stage)
    }

    pub fn job_run_end_start(&self) -> String {
        format!("s{}_job_run_end_start", self.stage)
    }

    pub fn job_run_end_end(&self) -> String {
        format!("s{}_job_run_end_end", self.stage)
    }

    /// `{N}_metadatafield{K}_val{L}`
    pub fn metadata_value(&self, field: usize, value: usize) -> String {
        format!("{}_metadatafield{field}_val{value}", self.stage)
    }

    /// `{N}_metadatafield{K}_val{L}_val1`
    pub fn metadata_alt_value(&self, field: usize, value: usize) -> String {
        format!("{}_metadatafield{field}_val{value}_val1", self.stage)
    }

    /// `metadata{field}_{op}__{N}`
    pub fn metadata_partial(&self, field: &str, op: &str) -> String {
        format!("metadata{field}_{op}__{}", self.stage)
    }

    /// `{field}__{N}`
    pub fn field(&self, field: &str) -> String {
        format!("{field}__{}", self.stage)
    }

    /// `excl_{field}__{N}`
    pub fn excluded(&self, field: &str) -> String {
        format!("excl_{field}__{}", self.stage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_names_follow_the_placeholder_scheme() {
        let p = StageParams::new(3);
        assert_eq!(p.value(), "s3_value");
        assert_eq!(p.indexed_value(1), "s3_value_1");
        assert_eq!(p.name(0), "s3_name_0");
        assert_eq!(p.job_run_end_start(), "s3_job_run_end_start");
        assert_eq!(p.job_run_end_end(), "s3_job_run_end_end");
        assert_eq!(p.metadata_value(2, 0), "3_metadatafield2_val0");
        assert_eq!(p.metadata_alt_value(2, 1), "3_metadatafield2_val1_val1");
        assert_eq!(p.metadata_partial("repo_url", "begins"), "metadatarepo_url_begins__3");
        assert_eq!(p.field("is_ci"), "is_ci__3");
        assert_eq!(p.excluded("job_statuses"), "excl_job_statuses__3");
    }

    #[test]
    fn values_serialize_untagged() {
        let mut params = ParamMap::new();
        params.insert("a".into(), true.into());
        params.insert("b".into(), ParamValue::from(vec!["x".to_string()]));
        params.insert("c".into(), ParamValue::from(vec![1_i64, 2]));
        let json = serde_json::to_string(&params).unwrap();
        assert_eq!(json, r#"{"a":true,"b":["x"],"c":[1,2]}"#);
    }
}
