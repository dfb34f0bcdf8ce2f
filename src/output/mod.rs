mod exports;
mod styling;
mod summary;
mod tables;

pub use exports::{export_compiled, export_stages};
pub use styling::{dim, magenta_bold};
pub use summary::{render_stages, render_summary};

/// Prints the `LeadLens` banner to stderr.
///
/// Displays the tool name, version, and description at the start of execution.
pub fn print_banner() {
    eprintln!(
        r"
{} {}
  {}
",
        magenta_bold("⏱ LeadLens"),
        dim(env!("CARGO_PKG_VERSION")),
        dim("Lead-time pipeline compiler")
    );
}
