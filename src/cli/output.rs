//! Output formatting for CLI commands.
//!
//! Every formatter returns a string; the binary decides where it goes.

use colored::Colorize;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::billing::StackCost;
use crate::config::{ConfigHasher, ValidationResult};
use crate::document::Document;
use crate::orchestrator::RunReport;
use crate::stack::{Stack, StackStatus};
use crate::state::{LockInfo, WorkspaceBundle};

use super::commands::OutputFormat;

/// Output formatter for CLI.
#[derive(Debug)]
pub struct OutputFormatter {
    /// Output format.
    format: OutputFormat,
}

#[derive(Tabled)]
struct BuildRow {
    #[tabled(rename = "Placeholder")]
    path: String,
    #[tabled(rename = "Image")]
    image: String,
    #[tabled(rename = "Run")]
    run: String,
}

#[derive(Tabled)]
struct CostRow {
    #[tabled(rename = "Stack")]
    stack: String,
    #[tabled(rename = "Cost")]
    cost: String,
}

#[derive(Tabled)]
struct FileRow {
    #[tabled(rename = "File")]
    path: String,
    #[tabled(rename = "Bytes")]
    size: usize,
    #[tabled(rename = "SHA-256")]
    digest: String,
}

#[derive(Tabled)]
struct StackRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Updated")]
    updated: String,
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Formats the outcome of a deploy or destroy.
    #[must_use]
    pub fn format_report(&self, report: &RunReport) -> String {
        if self.format == OutputFormat::Json {
            return to_json(report);
        }

        let mut output = if report.succeeded() {
            format!("{} {report}\n", "✓".green())
        } else {
            format!("{} {report}\n", "✗".red())
        };

        let phases: Vec<String> = report.phases.iter().map(ToString::to_string).collect();
        let _ = writeln!(output, "   Phases: {}", phases.join(" → "));
        if report.first_run {
            let _ = writeln!(output, "   First run: no previous bundle");
        }
        let _ = writeln!(
            output,
            "   Persisted: {}",
            if report.persisted { "yes" } else { "no" }
        );

        let rows: Vec<BuildRow> = report
            .builds
            .built
            .iter()
            .chain(&report.builds.reused)
            .map(|image| BuildRow {
                path: Self::truncate(&image.path, 50),
                image: image.image.clone(),
                run: image
                    .run_id
                    .clone()
                    .unwrap_or_else(|| "reused".dimmed().to_string()),
            })
            .collect();
        if !rows.is_empty() {
            output.push('\n');
            output.push_str(&Table::new(rows).to_string());
            output.push('\n');
        }

        output
    }

    /// Formats a rendered document with credentials masked. Both formats
    /// print the JSON document.
    #[must_use]
    pub fn format_document(&self, document: &Document) -> String {
        document.redacted().to_json_pretty().unwrap_or_default()
    }

    /// Formats per-stack costs.
    #[must_use]
    pub fn format_costs(&self, costs: &BTreeMap<String, StackCost>) -> String {
        if self.format == OutputFormat::Json {
            return to_json(costs);
        }
        if costs.is_empty() {
            return String::from("No costs recorded this month.\n");
        }

        let total: f64 = costs.values().map(|c| c.cost).sum();
        let rows: Vec<CostRow> = costs
            .iter()
            .map(|(stack, cost)| CostRow {
                stack: stack.clone(),
                cost: format!("{:.2}", cost.cost),
            })
            .collect();

        let mut output = Table::new(rows).to_string();
        let _ = write!(output, "\n\nTotal: {}\n", format!("{total:.2}").bold());
        output
    }

    /// Formats a stored bundle and its lease.
    #[must_use]
    pub fn format_bundle(
        &self,
        key: &str,
        bundle: Option<&WorkspaceBundle>,
        lock: Option<&LockInfo>,
    ) -> String {
        if self.format == OutputFormat::Json {
            let files: BTreeMap<&str, BundleFileJson> = bundle
                .map(|b| {
                    b.files()
                        .map(|(path, contents)| {
                            (
                                path,
                                BundleFileJson {
                                    bytes: contents.len(),
                                    sha256: b.digest(path).unwrap_or_default(),
                                },
                            )
                        })
                        .collect()
                })
                .unwrap_or_default();
            return to_json(&BundleJson { key, files, lock });
        }

        let mut output = format!("\nBundle: {key}\n\n");
        match bundle {
            Some(bundle) => {
                let hasher = ConfigHasher::new();
                let rows: Vec<FileRow> = bundle
                    .files()
                    .map(|(path, contents)| FileRow {
                        path: path.to_string(),
                        size: contents.len(),
                        digest: bundle
                            .digest(path)
                            .map(|d| hasher.short_hash(&d))
                            .unwrap_or_default(),
                    })
                    .collect();
                output.push_str(&Table::new(rows).to_string());
                output.push('\n');
            }
            None => output.push_str("   No bundle stored.\n"),
        }

        match lock {
            Some(lock) if lock.is_expired() => {
                let _ = write!(
                    output,
                    "\n{} Expired lease held by {} since {}\n",
                    "⚠".yellow(),
                    lock.holder,
                    lock.acquired_at.format("%Y-%m-%d %H:%M")
                );
            }
            Some(lock) => {
                let _ = write!(
                    output,
                    "\n{} Locked by {} since {} ({}s remaining)\n",
                    "⚠".yellow(),
                    lock.holder,
                    lock.acquired_at.format("%Y-%m-%d %H:%M"),
                    lock.remaining_secs()
                );
            }
            None => output.push_str("\nNot locked.\n"),
        }

        output
    }

    /// Formats a list of stacks.
    #[must_use]
    pub fn format_stacks(&self, stacks: &[Stack]) -> String {
        if self.format == OutputFormat::Json {
            return to_json(&stacks);
        }
        if stacks.is_empty() {
            return String::from("No stacks found.\n");
        }

        let rows: Vec<StackRow> = stacks
            .iter()
            .map(|s| StackRow {
                id: s.id.clone(),
                name: Self::truncate(&s.name, 30),
                status: Self::format_status(s.status),
                updated: s.updated_at.format("%Y-%m-%d %H:%M").to_string(),
            })
            .collect();
        let mut output = Table::new(rows).to_string();
        output.push('\n');
        output
    }

    /// Formats a configuration validation result.
    #[must_use]
    pub fn format_validation(&self, result: &ValidationResult, show_warnings: bool) -> String {
        if self.format == OutputFormat::Json {
            let json = serde_json::json!({
                "valid": result.is_valid(),
                "errors": result.errors.iter().map(ToString::to_string).collect::<Vec<_>>(),
                "warnings": result.warnings,
            });
            return to_json(&json);
        }

        let mut output = if result.is_valid() {
            format!("{} Configuration is valid\n", "✓".green())
        } else {
            format!("{} Configuration is invalid\n", "✗".red())
        };
        for error in &result.errors {
            let _ = writeln!(output, "   - {error}");
        }
        if show_warnings && !result.warnings.is_empty() {
            let _ = write!(output, "\n{} Warnings:\n", "⚠".yellow());
            for warning in &result.warnings {
                let _ = writeln!(output, "   - {warning}");
            }
        }
        output
    }

    fn format_status(status: StackStatus) -> String {
        let label = status.to_string();
        match status {
            StackStatus::Running => label.green().to_string(),
            StackStatus::Starting | StackStatus::Deleting => label.yellow().to_string(),
            StackStatus::Error => label.red().to_string(),
            StackStatus::Stopped | StackStatus::Deleted => label.dimmed().to_string(),
        }
    }

    /// Truncates a string to a maximum number of characters.
    fn truncate(s: &str, max_len: usize) -> String {
        if s.chars().count() <= max_len {
            s.to_string()
        } else {
            let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
            format!("{kept}...")
        }
    }
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_default()
}

#[derive(Serialize)]
struct BundleJson<'a> {
    key: &'a str,
    files: BTreeMap<&'a str, BundleFileJson>,
    lock: Option<&'a LockInfo>,
}

#[derive(Serialize)]
struct BundleFileJson {
    bytes: usize,
    sha256: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_costs_json() {
        let costs = BTreeMap::from([(String::from("stack123"), StackCost { cost: 12.5 })]);
        let output = OutputFormatter::new(OutputFormat::Json).format_costs(&costs);
        let value: serde_json::Value = serde_json::from_str(&output).expect("json");
        assert_eq!(value, serde_json::json!({"stack123": {"cost": 12.5}}));
    }

    #[test]
    fn test_costs_text_has_total() {
        colored::control::set_override(false);
        let costs = BTreeMap::from([
            (String::from("a"), StackCost { cost: 1.25 }),
            (String::from("b"), StackCost { cost: 2.0 }),
        ]);
        let output = OutputFormatter::new(OutputFormat::Text).format_costs(&costs);
        assert!(output.contains("Total: 3.25"));
    }

    #[test]
    fn test_document_hides_credentials() {
        let document = Document::from_value(serde_json::json!({
            "provider": {"azurerm": {"client_secret": "arm-secret"}},
            "resource": {"azurerm_container_app": {"web": {
                "secret": [{"name": "acr-password", "value": "acr-pw"}]
            }}}
        }))
        .expect("document");

        let output = OutputFormatter::new(OutputFormat::Text).format_document(&document);
        assert!(!output.contains("arm-secret"));
        assert!(!output.contains("acr-pw"));
        assert!(output.contains("acr-password"));
    }

    #[test]
    fn test_bundle_json() {
        let mut bundle = WorkspaceBundle::new();
        bundle.insert("main.tf.json", b"{}".to_vec());

        let output = OutputFormatter::new(OutputFormat::Json)
            .format_bundle("s1-rg", Some(&bundle), None);
        let value: serde_json::Value = serde_json::from_str(&output).expect("json");
        assert_eq!(value["key"], "s1-rg");
        assert_eq!(value["files"]["main.tf.json"]["bytes"], 2);
        assert!(value["lock"].is_null());
    }

    #[test]
    fn test_truncate() {
        assert_eq!(OutputFormatter::truncate("short", 10), "short");
        assert_eq!(OutputFormatter::truncate("abcdefghijkl", 8), "abcde...");
    }
}
