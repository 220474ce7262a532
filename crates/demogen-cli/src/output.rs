//! Human-readable terminal output.

use colored::Colorize;
use demogen_index::{Snippet, ViewResult};
use demogen_pipeline::{RunStatus, RunSummary, ValidationResult};
use serde_json::Value;

pub fn print_summary(summary: &RunSummary) {
    let status = match &summary.status {
        RunStatus::Ready => "READY".green().bold(),
        RunStatus::Failed { .. } => summary.status.to_string().red().bold(),
    };
    println!("{} {} ({})", "Run".bold(), summary.run_id, status);
    println!(
        "  seed {}  entities {}  financial rows {}",
        summary.seed, summary.entities, summary.financial_rows
    );

    if let RunStatus::Failed { kind, cause, .. } = &summary.status {
        println!("  {} {}: {}", "cause".red(), kind, cause);
    }

    if !summary.stages.is_empty() {
        println!();
        println!("{}", "Stages".bold());
        for record in &summary.stages {
            let mark = if record.succeeded {
                "ok".green()
            } else {
                "failed".red()
            };
            println!(
                "  {:<22} {:>8}ms  {}",
                record.stage.as_str(),
                record.elapsed_ms,
                mark
            );
        }
    }

    if !summary.sources.is_empty() {
        println!();
        println!(
            "{}  {:<20} {:<16} {:>7} {:>9} {:>6} {:>7}",
            "Sources".bold(),
            "",
            "model",
            "prompts",
            "generated",
            "failed",
            "indexed"
        );
        for (name, source) in &summary.sources {
            let failed = if source.failed > 0 {
                source.failed.to_string().yellow()
            } else {
                source.failed.to_string().normal()
            };
            println!(
                "  {:<27} {:<16} {:>7} {:>9} {:>6} {:>7}",
                name.cyan(),
                source.model,
                source.prompts,
                source.generated,
                failed,
                source.indexed
            );
        }
    }

    for group in &summary.completion_groups {
        if group.batch_exhausted {
            println!(
                "  {} {} exhausted {} bulk attempts; {} rows completed by fallback",
                "warning:".yellow().bold(),
                group.model,
                group.batch_attempts,
                group.completed_by_fallback
            );
        }
    }

    if !summary.views.is_empty() {
        println!();
        println!("{} {}", "Views".bold(), summary.views.join(", "));
    }

    if !summary.pruned.is_empty() {
        println!("{} {}", "Pruned".bold(), summary.pruned.join(", ").dimmed());
    }

    if !summary.validation.is_empty() {
        println!();
        print_validation(&summary.validation);
    }
}

pub fn print_validation(results: &[ValidationResult]) {
    let passed = results.iter().filter(|r| r.passed).count();
    let header = format!("{passed}/{} canaries passed", results.len());
    if passed == results.len() {
        println!("{} {}", "Validation".bold(), header.green());
    } else {
        println!("{} {}", "Validation".bold(), header.red());
    }

    for result in results {
        if result.passed {
            println!("  {} {}", "✓".green(), result);
        } else {
            match &result.detail {
                Some(detail) => println!("  {} {}: {}", "✗".red(), result, detail.dimmed()),
                None => println!("  {} {}", "✗".red(), result),
            }
        }
    }
}

pub fn print_hits(index: &str, query: &str, hits: &[Snippet]) {
    println!(
        "{} {} hits for \"{}\" in {}",
        "Search".bold(),
        hits.len(),
        query,
        index.cyan()
    );
    for (rank, hit) in hits.iter().enumerate() {
        println!();
        println!(
            "{:>2}. {} {} {}",
            rank + 1,
            hit.title.bold(),
            format!("[{}]", hit.id).dimmed(),
            format!("{:.3}", hit.score).yellow()
        );
        if !hit.attributes.is_empty() {
            let attrs: Vec<String> = hit
                .attributes
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect();
            println!("    {}", attrs.join("  ").dimmed());
        }
        println!("    {}", hit.snippet);
    }
}

pub fn print_view_result(result: &ViewResult) {
    let cells: Vec<Vec<String>> = result
        .rows
        .iter()
        .map(|row| row.iter().map(render_cell).collect())
        .collect();

    let widths: Vec<usize> = result
        .columns
        .iter()
        .enumerate()
        .map(|(i, name)| {
            cells
                .iter()
                .filter_map(|row| row.get(i))
                .map(|c| c.chars().count())
                .chain(std::iter::once(name.chars().count()))
                .max()
                .unwrap_or(0)
        })
        .collect();

    let header: Vec<String> = result
        .columns
        .iter()
        .zip(&widths)
        .map(|(name, w)| format!("{name:<w$}"))
        .collect();
    println!("{}", header.join("  ").bold());

    for row in &cells {
        let line: Vec<String> = row
            .iter()
            .zip(&widths)
            .map(|(cell, w)| format!("{cell:<w$}"))
            .collect();
        println!("{}", line.join("  "));
    }
    println!("{}", format!("({} rows)", result.len()).dimmed());
}

fn render_cell(value: &Value) -> String {
    match value {
        Value::Null => "-".to_string(),
        Value::String(s) => s.clone(),
        Value::Number(n) => match n.as_f64() {
            Some(f) if n.is_f64() => format!("{f:.2}"),
            _ => n.to_string(),
        },
        other => other.to_string(),
    }
}
