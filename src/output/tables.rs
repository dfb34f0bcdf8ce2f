use comfy_table::modifiers::UTF8_ROUND_CORNERS;
use comfy_table::presets::UTF8_FULL;
use comfy_table::{Cell, Color as TableColor, ContentArrangement, Table};

use crate::compiler::params::ParamValue;
use crate::model::DurationLimit;

const DAY_SECONDS: u64 = 86_400;

/// Table and cell creation helpers
pub fn create_table() -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table
}

pub fn create_cyan_header(labels: &[&str]) -> Vec<Cell> {
    labels
        .iter()
        .map(|label| Cell::new(*label).fg(TableColor::Cyan))
        .collect()
}

/// Renders a stage budget, colored by how much lead time it allows.
pub fn color_coded_limit_cell(limit: DurationLimit) -> Cell {
    let Some(seconds) = limit.seconds() else {
        return Cell::new("out of range").fg(TableColor::Red);
    };
    let text = format_seconds(seconds);
    if seconds <= DAY_SECONDS {
        Cell::new(text).fg(TableColor::Green)
    } else if seconds <= 7 * DAY_SECONDS {
        Cell::new(text).fg(TableColor::Yellow)
    } else {
        Cell::new(text).fg(TableColor::Red)
    }
}

pub fn param_value_cell(value: &ParamValue) -> Cell {
    let text = match value {
        ParamValue::Bool(value) => value.to_string(),
        ParamValue::Int(value) => value.to_string(),
        ParamValue::Text(value) => format!("'{value}'"),
        ParamValue::IntList(values) => format!(
            "[{}]",
            values.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
        ),
        ParamValue::TextList(values) => format!(
            "[{}]",
            values
                .iter()
                .map(|value| format!("'{value}'"))
                .collect::<Vec<_>>()
                .join(", ")
        ),
    };
    Cell::new(text)
}

/// Largest whole unit: `3d`, `5h`, `90s`.
pub fn format_seconds(seconds: u64) -> String {
    match seconds {
        0 => "0s".to_string(),
        s if s % DAY_SECONDS == 0 => format!("{}d", s / DAY_SECONDS),
        s if s % 3_600 == 0 => format!("{}h", s / 3_600),
        s if s % 60 == 0 => format!("{}min", s / 60),
        s => format!("{s}s"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_seconds_picks_largest_whole_unit() {
        assert_eq!(format_seconds(0), "0s");
        assert_eq!(format_seconds(172_800), "2d");
        assert_eq!(format_seconds(7_200), "2h");
        assert_eq!(format_seconds(120), "2min");
        assert_eq!(format_seconds(90), "90s");
    }

    #[test]
    fn test_param_value_cell_quotes_text() {
        let cell = param_value_cell(&ParamValue::TextList(vec!["DONE".into(), "QA".into()]));
        assert_eq!(cell.content(), "['DONE', 'QA']");
        assert_eq!(param_value_cell(&ParamValue::Bool(true)).content(), "true");
    }

    #[test]
    fn test_color_coded_limit_cell_flags_overflowing_limits() {
        use crate::model::TimeUnit;

        let cell = color_coded_limit_cell(DurationLimit::new(u64::MAX, TimeUnit::Days));
        assert_eq!(cell.content(), "out of range");
        let cell = color_coded_limit_cell(DurationLimit::new(2, TimeUnit::Hours));
        assert_eq!(cell.content(), "2h");
    }
}
