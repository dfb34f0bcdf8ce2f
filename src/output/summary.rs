use std::fmt::Write;

use comfy_table::{Cell, Color as TableColor};

use super::styling::{bright, bright_green, bright_yellow, cyan, dim};
use super::tables::{color_coded_limit_cell, create_cyan_header, create_table, param_value_cell};
use crate::model::{CompiledQuery, OffsetStageMap};

fn add_section_header(output: &mut String, emoji: &str, title: &str) {
    let _ = writeln!(output, "{} {}", bright(emoji), bright(title).underlined());
}

/// Renders the stage table of an offset stage map.
pub fn render_stages(stages: &OffsetStageMap) -> String {
    let mut table = create_table();
    table.set_header(create_cyan_header(&["#", "Stage", "Event", "Good Within", "Slow After"]));

    for (index, stage) in stages {
        table.add_row(vec![
            Cell::new(index),
            Cell::new(&stage.name),
            Cell::new(&stage.event.kind).fg(TableColor::DarkGrey),
            color_coded_limit_cell(stage.lower_limit),
            color_coded_limit_cell(stage.upper_limit),
        ]);
    }

    table.to_string()
}

/// Renders a human-readable summary of a compiled query.
///
/// Displays the stage map with each stage's budget, the bound parameters
/// and the SQL text, followed by the count query for listings.
pub fn render_summary(compiled: &CompiledQuery) -> String {
    let mut output = String::new();

    add_section_header(&mut output, "📊", "Overview");
    let _ = write!(
        output,
        "  {} {}\n  {} {}\n  {} {}\n\n",
        dim("Stages:"),
        bright_yellow(compiled.offset_stage_map.len()),
        dim("Parameters:"),
        bright_yellow(compiled.params.len()),
        dim("Count query:"),
        if compiled.count_sql.is_some() {
            bright_green("yes")
        } else {
            dim("no")
        }
    );

    add_section_header(&mut output, "🧭", "Stages");
    let _ = writeln!(output, "{}\n", render_stages(&compiled.offset_stage_map));

    if !compiled.params.is_empty() {
        add_section_header(&mut output, "🔗", "Parameters");
        let mut params_table = create_table();
        params_table.set_header(create_cyan_header(&["Name", "Value"]));
        for (name, value) in &compiled.params {
            params_table.add_row(vec![Cell::new(format!(":{name}")), param_value_cell(value)]);
        }
        let _ = writeln!(output, "{params_table}\n");
    }

    add_section_header(&mut output, "📝", "SQL");
    let _ = writeln!(output, "{}\n", cyan(&compiled.sql));

    if let Some(count_sql) = &compiled.count_sql {
        add_section_header(&mut output, "🔢", "Count SQL");
        let _ = writeln!(output, "{}", cyan(count_sql));
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::params::{ParamMap, ParamValue};
    use crate::model::{Event, EventKind, StageDefinition};

    fn create_test_query(count_sql: Option<&str>) -> CompiledQuery {
        let mut params = ParamMap::new();
        params.insert("jira_integration_ids".into(), ParamValue::TextList(vec!["1".into()]));
        params.insert("s0_value".into(), ParamValue::TextList(vec!["IN PROGRESS".into()]));

        let stages = [
            StageDefinition::new(
                "In Progress",
                0,
                Event::new(EventKind::StatusReached).with_values(["IN PROGRESS"]),
            ),
            StageDefinition::new("Merge", 0, Event::new(EventKind::PrMerged)),
        ];

        CompiledQuery {
            sql: "SELECT * FROM (\nSELECT 1\n) AS enrich".into(),
            count_sql: count_sql.map(str::to_string),
            params,
            offset_stage_map: stages.into_iter().enumerate().collect(),
        }
    }

    #[test]
    fn test_render_summary_lists_stages_and_params() {
        let output = render_summary(&create_test_query(None));

        assert!(output.contains("Overview"));
        assert!(output.contains("In Progress"));
        assert!(output.contains("pr_merged"));
        assert!(output.contains(":s0_value"));
        assert!(output.contains("'IN PROGRESS'"));
        assert!(output.contains("AS enrich"));
        assert!(!output.contains("Count SQL"));
    }

    #[test]
    fn test_render_summary_includes_count_query() {
        let output = render_summary(&create_test_query(Some("SELECT COUNT(*) FROM (x) AS counted")));

        assert!(output.contains("Count SQL"));
        assert!(output.contains("AS counted"));
    }

    #[test]
    fn test_render_stages_shows_budgets() {
        let output = render_stages(&create_test_query(None).offset_stage_map);

        assert!(output.contains("Good Within"));
        assert!(output.contains("1d"));
        assert!(output.contains("7d"));
    }
}
