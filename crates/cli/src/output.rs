//! Output formatting utilities

use std::path::Path;

use anyhow::{Context, Result};
use clap::ValueEnum;
use colored::Colorize;
use fleet_lib::Report;

/// Output format for reports
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// YAML format (default)
    #[default]
    Yaml,
    /// JSON format
    Json,
}

/// Serialize a report, `None` when it has no entries
pub fn render_report<R: Report>(report: &R, format: OutputFormat) -> Result<Option<String>> {
    match format {
        OutputFormat::Yaml => fleet_lib::render(report).context("Failed to render report"),
        OutputFormat::Json => {
            if report.is_empty() {
                return Ok(None);
            }
            let text = serde_json::to_string_pretty(report).context("Failed to render report")?;
            Ok(Some(text))
        }
    }
}

/// Write a report to `output_file`, or to stdout without one
pub fn write_report<R: Report>(
    report: &R,
    format: OutputFormat,
    output_file: Option<&Path>,
) -> Result<()> {
    let Some(mut text) = render_report(report, format)? else {
        print_warning("No results collected");
        return Ok(());
    };

    let Some(path) = output_file else {
        println!("{}", text.trim_end());
        return Ok(());
    };

    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {}", parent.display()))?;
    }
    if !text.ends_with('\n') {
        text.push('\n');
    }
    std::fs::write(path, text)
        .with_context(|| format!("Failed to write output file {}", path.display()))?;

    print_success(&format!("Report written to {}", path.display()));
    Ok(())
}

/// Print a success message
pub fn print_success(message: &str) {
    println!("{} {}", "✓".green().bold(), message);
}

/// Print an error message
pub fn print_error(message: &str) {
    eprintln!("{} {}", "✗".red().bold(), message);
}

/// Print a warning message
pub fn print_warning(message: &str) {
    println!("{} {}", "⚠".yellow().bold(), message);
}

/// Print an info message
pub fn print_info(message: &str) {
    println!("{} {}", "ℹ".blue().bold(), message);
}
