use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use log::info;
use std::io::Write;
use std::path::{Path, PathBuf};

use leadlens::config::{self, Config, OutputFormat};
use leadlens::output;
use leadlens::{CriteriaTranslator, VelocityCompiler};

#[derive(Parser)]
#[command(name = "leadlens")]
#[command(author, version, about = "Lead-time pipeline compiler", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (defaults to ./leadlens.{toml,json,yaml,yml})
    #[arg(short, long, global = true, env = "LEADLENS_CONFIG")]
    config: Option<PathBuf>,

    #[arg(short, long, global = true)]
    output: Option<PathBuf>,

    #[arg(short, long, global = true, default_value_t = false)]
    pretty: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a request into SQL, a count query and parameter bindings
    Compile {
        /// Request document: pipeline, query and entity filters
        request: PathBuf,

        #[arg(short, long, value_enum)]
        format: Option<Format>,

        /// Override the configured schema
        #[arg(short, long)]
        schema: Option<String>,
    },
    /// Print the assembled stage map of a request
    Stages {
        request: PathBuf,

        #[arg(short, long, value_enum)]
        format: Option<Format>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Format {
    Summary,
    Json,
    Sql,
}

impl From<Format> for OutputFormat {
    fn from(format: Format) -> Self {
        match format {
            Format::Summary => Self::Summary,
            Format::Json => Self::Json,
            Format::Sql => Self::Sql,
        }
    }
}

impl Cli {
    fn compiler(&self, config: &Config, schema: Option<&str>) -> VelocityCompiler<CriteriaTranslator> {
        let mut settings = config.compiler.clone();
        if let Some(schema) = schema {
            settings.schema = schema.to_string();
        }
        VelocityCompiler::new(settings, CriteriaTranslator::new())
    }

    fn write_output(&self, render: impl FnOnce(&mut dyn Write) -> Result<()>) -> Result<()> {
        if let Some(output_path) = &self.output {
            let mut buffer = Vec::new();
            let out: &mut dyn Write = &mut buffer;
            render(out)?;
            std::fs::write(output_path, buffer)
                .with_context(|| format!("Failed to write output: {}", output_path.display()))?;
            info!("Output written to: {}", output_path.display());
        } else {
            let stdout = std::io::stdout();
            let mut handle = stdout.lock();
            let out: &mut dyn Write = &mut handle;
            render(out)?;
        }
        Ok(())
    }

    fn execute_compile(
        &self,
        config: &Config,
        request: &Path,
        format: Option<Format>,
        schema: Option<&str>,
    ) -> Result<()> {
        info!("Compiling request: {}", request.display());

        let request = config::load_request(request)?;
        let compiled = self
            .compiler(config, schema)
            .compile(&request)
            .with_context(|| format!("Failed to compile pipeline {}", request.pipeline.name))?;

        let format = format.map_or(config.output.format, OutputFormat::from);
        let pretty = self.pretty || config.output.pretty;
        self.write_output(|out| output::export_compiled(&compiled, format, pretty, out))
    }

    fn execute_stages(&self, config: &Config, request: &Path, format: Option<Format>) -> Result<()> {
        info!("Assembling stages of request: {}", request.display());

        let request = config::load_request(request)?;
        let pipeline = self
            .compiler(config, None)
            .assemble(&request)
            .with_context(|| format!("Failed to assemble pipeline {}", request.pipeline.name))?;

        let format = format.map_or(config.output.format, OutputFormat::from);
        let pretty = self.pretty || config.output.pretty;
        let stages = pipeline.offset_stage_map();
        self.write_output(|out| output::export_stages(&stages, format, pretty, out))
    }

    pub fn execute(&self) -> Result<()> {
        let config = Config::load(self.config.as_deref())?;

        match &self.command {
            Commands::Compile {
                request,
                format,
                schema,
            } => self.execute_compile(&config, request, *format, schema.as_deref()),
            Commands::Stages { request, format } => self.execute_stages(&config, request, *format),
        }
    }
}
