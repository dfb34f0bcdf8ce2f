use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::compiler::CompilerSettings;
use crate::model::CompileRequest;

/// Configuration file structure for LeadLens.
///
/// Configuration files are loaded from the current directory or a specified
/// path; every section falls back to its defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    /// Compiler settings shared by every request
    #[serde(default)]
    pub compiler: CompilerSettings,

    /// Output format preferences
    #[serde(default)]
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct OutputConfig {
    /// Default output format
    #[serde(default)]
    pub format: OutputFormat,

    /// Pretty-print JSON output
    #[serde(default)]
    pub pretty: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Summary,
    Json,
    Sql,
}

impl Config {
    /// Load configuration from a file.
    ///
    /// Searches for configuration files in this order:
    /// 1. Specified path
    /// 2. ./leadlens.toml
    /// 3. ./leadlens.json
    /// 4. ./leadlens.yaml
    /// 5. ./leadlens.yml
    ///
    /// Returns default configuration if no file is found.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return load_document(path);
        }

        let candidates = ["leadlens.toml", "leadlens.json", "leadlens.yaml", "leadlens.yml"];

        for candidate in &candidates {
            let path = Path::new(candidate);
            if path.exists() {
                return load_document(path);
            }
        }

        Ok(Self::default())
    }

    /// Save configuration to a file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let contents = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::to_string_pretty(self)?,
            Some("yaml") | Some("yml") => serde_yaml::to_string(self)?,
            _ => toml::to_string_pretty(self)?,
        };

        std::fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }
}

/// Load a compile request (pipeline, query and entity filters).
pub fn load_request(path: &Path) -> Result<CompileRequest> {
    load_document(path)
}

/// Parses `path` by extension; unknown extensions try TOML, JSON then YAML.
fn load_document<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read file: {}", path.display()))?;

    let extension = path.extension().and_then(|ext| ext.to_str()).unwrap_or("");

    match extension {
        "toml" => toml::from_str(&contents)
            .with_context(|| format!("Failed to parse TOML: {}", path.display())),
        "json" => serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse JSON: {}", path.display())),
        "yaml" | "yml" => serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse YAML: {}", path.display())),
        _ => toml::from_str(&contents)
            .ok()
            .or_else(|| serde_json::from_str(&contents).ok())
            .map_or_else(|| serde_yaml::from_str(&contents), Ok)
            .with_context(|| format!("Failed to parse file: {}", path.display())),
    }
}
