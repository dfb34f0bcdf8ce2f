use anyhow::Result;
use std::io::Write;

use super::summary::{render_stages, render_summary};
use crate::config::OutputFormat;
use crate::model::{CompiledQuery, OffsetStageMap};

/// Exports a compiled query in the requested format.
///
/// - JSON: `{sql, count_sql, params, offset_stage_map}` for programmatic use
/// - SQL: the statement and its count query as `;`-terminated text
/// - Summary: human-readable terminal output
pub fn export_compiled(
    compiled: &CompiledQuery,
    format: OutputFormat,
    pretty: bool,
    output: &mut dyn Write,
) -> Result<()> {
    match format {
        OutputFormat::Summary => {
            writeln!(output, "{}", render_summary(compiled))?;
            Ok(())
        }
        OutputFormat::Json => export_json(compiled, pretty, output),
        OutputFormat::Sql => export_sql(compiled, output),
    }
}

/// Exports only the assembled stage map.
pub fn export_stages(
    stages: &OffsetStageMap,
    format: OutputFormat,
    pretty: bool,
    output: &mut dyn Write,
) -> Result<()> {
    match format {
        OutputFormat::Json | OutputFormat::Sql => {
            let json = if pretty {
                serde_json::to_string_pretty(stages)?
            } else {
                serde_json::to_string(stages)?
            };
            writeln!(output, "{}", json)?;
        }
        OutputFormat::Summary => writeln!(output, "{}", render_stages(stages))?,
    }
    Ok(())
}

fn export_json(compiled: &CompiledQuery, pretty: bool, output: &mut dyn Write) -> Result<()> {
    let json = if pretty {
        serde_json::to_string_pretty(compiled)?
    } else {
        serde_json::to_string(compiled)?
    };
    writeln!(output, "{}", json)?;
    Ok(())
}

fn export_sql(compiled: &CompiledQuery, output: &mut dyn Write) -> Result<()> {
    writeln!(output, "{};", compiled.sql)?;
    if let Some(count_sql) = &compiled.count_sql {
        writeln!(output)?;
        writeln!(output, "-- count")?;
        writeln!(output, "{};", count_sql)?;
    }
    Ok(())
}
