//! Document Materializer
//!
//! Turns completion outcomes into [`GeneratedDocument`]s and writes one table
//! per source type. Every prompt yields exactly one row: a `GENERATED`
//! document or a `FAILED` placeholder, so
//! `prompts == generated + failed` holds for every source.

use demogen_core::{DocumentStatus, GeneratedDocument, PipelineConfig, PromptInstance};
use demogen_llm::{CompletionOutcome, CompletionReport};
use demogen_storage::{Table, Warehouse};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::summary::SourceSummary;
use crate::{MaterializationError, PipelineError};

/// Content of a placeholder row.
pub const FAILED_CONTENT: &str = "generation failed";

pub struct DocumentMaterializer<'a> {
    config: &'a PipelineConfig,
}

impl<'a> DocumentMaterializer<'a> {
    pub fn new(config: &'a PipelineConfig) -> Self {
        Self { config }
    }

    /// One document per prompt, joined by prompt id.
    pub fn materialize(
        &self,
        prompts: &[PromptInstance],
        report: &CompletionReport,
    ) -> Result<Vec<GeneratedDocument>, MaterializationError> {
        prompts
            .iter()
            .map(|prompt| {
                let outcome = report
                    .outcome(&prompt.id)
                    .ok_or_else(|| MaterializationError::MissingOutcome(prompt.id.clone()))?;
                self.document_for(prompt, outcome)
            })
            .collect()
    }

    pub fn document_for(
        &self,
        prompt: &PromptInstance,
        outcome: &CompletionOutcome,
    ) -> Result<GeneratedDocument, MaterializationError> {
        let id = GeneratedDocument::id_for(prompt);
        if prompt.id.trim().is_empty() || id.trim().is_empty() {
            return Err(MaterializationError::MissingId {
                prompt_instance_id: prompt.id.clone(),
            });
        }

        let (title, content, status, failure_reason) = match outcome {
            CompletionOutcome::Completed { text, .. } => {
                let (title, content) = normalize(text, &prompt.title);
                (title, content, DocumentStatus::Generated, None)
            }
            CompletionOutcome::Failed { reason, .. } => {
                let title = if prompt.title.trim().is_empty() {
                    format!("{} {}", prompt.source_type, id)
                } else {
                    prompt.title.trim().to_string()
                };
                (
                    title,
                    FAILED_CONTENT.to_string(),
                    DocumentStatus::Failed,
                    Some(reason.clone()),
                )
            }
        };
        if title.is_empty() {
            return Err(MaterializationError::MissingTitle { document_id: id });
        }

        Ok(GeneratedDocument {
            id,
            source_type: prompt.source_type.clone(),
            title,
            content,
            publication_date: prompt.publication_date,
            entity_id: prompt.linked_entity().map(str::to_string),
            prompt_instance_id: prompt.id.clone(),
            language: prompt.language.clone(),
            attributes: prompt.attributes.clone(),
            status,
            model: prompt.model.clone(),
            failure_reason,
        })
    }

    /// Replace `<source>_documents` for every configured source. Returns
    /// per-source accounting keyed by source name.
    pub fn write(
        &self,
        warehouse: &Warehouse,
        documents: &[GeneratedDocument],
    ) -> Result<BTreeMap<String, SourceSummary>, PipelineError> {
        let mut by_source: BTreeMap<&str, Vec<&GeneratedDocument>> = BTreeMap::new();
        for doc in documents {
            by_source.entry(doc.source_type.as_str()).or_default().push(doc);
        }

        let mut summaries = BTreeMap::new();
        for source in &self.config.sources {
            let docs = by_source.remove(source.name.as_str()).unwrap_or_default();
            let rows: Vec<Map<String, Value>> = docs.iter().map(|d| document_row(d)).collect();
            let table = Table::from_records(&source.table_name(), &rows)?;
            warehouse.create_or_replace_table(&table)?;

            let generated = docs.iter().filter(|d| d.is_generated()).count();
            let summary = SourceSummary {
                table: table.name.clone(),
                index: source.index_name(),
                model: source.model(&self.config.default_model).to_string(),
                prompts: docs.len(),
                generated,
                failed: docs.len() - generated,
                indexed: 0,
            };
            tracing::info!(
                source_type = %source.name,
                table = %summary.table,
                generated = summary.generated,
                failed = summary.failed,
                "documents materialized"
            );
            summaries.insert(source.name.clone(), summary);
        }

        if !by_source.is_empty() {
            let unknown: Vec<&str> = by_source.keys().copied().collect();
            tracing::warn!(sources = ?unknown, "documents for unconfigured sources were not written");
        }
        Ok(summaries)
    }
}

/// Flatten a document into a row; attributes become their own columns.
fn document_row(doc: &GeneratedDocument) -> Map<String, Value> {
    let mut row = Map::new();
    row.insert("id".into(), Value::from(doc.id.clone()));
    row.insert("source_type".into(), Value::from(doc.source_type.clone()));
    row.insert("title".into(), Value::from(doc.title.clone()));
    row.insert("content".into(), Value::from(doc.content.clone()));
    row.insert(
        "publication_date".into(),
        Value::from(doc.publication_date.to_string()),
    );
    row.insert(
        "entity_id".into(),
        doc.entity_id.clone().map(Value::from).unwrap_or(Value::Null),
    );
    row.insert(
        "prompt_instance_id".into(),
        Value::from(doc.prompt_instance_id.clone()),
    );
    row.insert("language".into(), Value::from(doc.language.clone()));
    row.insert("status".into(), Value::from(doc.status.as_str()));
    row.insert("model".into(), Value::from(doc.model.clone()));
    row.insert(
        "failure_reason".into(),
        doc.failure_reason.clone().map(Value::from).unwrap_or(Value::Null),
    );
    for (key, value) in &doc.attributes {
        row.entry(key.clone())
            .or_insert_with(|| Value::from(value.clone()));
    }
    row
}

/// Split raw completion text into (title, content).
///
/// Code fences around the whole answer are removed. A leading `# heading`
/// or `Title:` line becomes the title; otherwise `title_hint` is used and a
/// first line repeating it is dropped.
pub fn normalize(raw: &str, title_hint: &str) -> (String, String) {
    let text = strip_fences(raw.trim());
    let hint = title_hint.trim();

    let mut lines = text.lines();
    let first = lines.by_ref().find(|l| !l.trim().is_empty()).map(str::trim);
    let rest = || lines.clone().collect::<Vec<_>>().join("\n").trim().to_string();

    match first {
        Some(line) if line.starts_with("# ") => {
            let title = line.trim_start_matches('#').trim().trim_matches('*').trim();
            let title = if title.is_empty() { hint } else { title };
            (title.to_string(), rest())
        }
        Some(line) if line.get(..6).is_some_and(|p| p.eq_ignore_ascii_case("title:")) => {
            let title = line[6..].trim();
            let title = if title.is_empty() { hint } else { title };
            (title.to_string(), rest())
        }
        Some(line) if !hint.is_empty() && line == hint => (hint.to_string(), rest()),
        _ => (hint.to_string(), text.trim().to_string()),
    }
}

fn strip_fences(text: &str) -> &str {
    let Some(after_open) = text.strip_prefix("```") else {
        return text;
    };
    // Drop the info string (e.g. ```markdown).
    let body = after_open.split_once('\n').map(|(_, b)| b).unwrap_or("");
    body.trim_end()
        .strip_suffix("```")
        .unwrap_or(body)
        .trim()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use demogen_llm::CompletionPath;

    fn prompt(link_entity: bool) -> PromptInstance {
        PromptInstance {
            id: "pi_0123456789abcdef".to_string(),
            source_type: "broker_research".to_string(),
            template_id: "broker_research_update".to_string(),
            model: "llama3.1-70b".to_string(),
            entity_id: Some("ent_acme".to_string()),
            link_entity,
            sequence: 0,
            language: "en".to_string(),
            quarter: None,
            publication_date: NaiveDate::from_ymd_opt(2024, 5, 1).unwrap(),
            title: "Acme Freight: 2024Q1 earnings update".to_string(),
            attributes: BTreeMap::from([("ticker".to_string(), "ACME".to_string())]),
            text: "prompt".to_string(),
        }
    }

    fn completed(text: &str) -> CompletionOutcome {
        CompletionOutcome::Completed {
            text: text.to_string(),
            path: CompletionPath::Batch,
        }
    }

    #[test]
    fn heading_becomes_title() {
        let (title, content) = normalize("# Acme beats\n\n## Overview\n\nPricing held.", "hint");
        assert_eq!(title, "Acme beats");
        assert_eq!(content, "## Overview\n\nPricing held.");
    }

    #[test]
    fn fences_and_title_prefix_are_stripped() {
        let (title, content) = normalize("```markdown\nTitle: Weekly wrap\nBody text\n```", "hint");
        assert_eq!(title, "Weekly wrap");
        assert_eq!(content, "Body text");
    }

    #[test]
    fn hint_used_without_heading() {
        let (title, content) = normalize("Plain body only.", "Fallback title");
        assert_eq!(title, "Fallback title");
        assert_eq!(content, "Plain body only.");

        let (_, content) = normalize("Fallback title\n\nBody.", "Fallback title");
        assert_eq!(content, "Body.");
    }

    #[test]
    fn linkage_follows_source_policy() {
        let config = PipelineConfig::default();
        let m = DocumentMaterializer::new(&config);

        let doc = m.document_for(&prompt(true), &completed("# T\n\nbody")).unwrap();
        assert_eq!(doc.entity_id.as_deref(), Some("ent_acme"));
        assert_eq!(doc.id, "doc_0123456789abcdef");
        assert_eq!(doc.status, DocumentStatus::Generated);

        let doc = m.document_for(&prompt(false), &completed("# T\n\nbody")).unwrap();
        assert_eq!(doc.entity_id, None);
    }

    #[test]
    fn failure_yields_placeholder_not_content() {
        let config = PipelineConfig::default();
        let m = DocumentMaterializer::new(&config);
        let outcome = CompletionOutcome::Failed {
            reason: "service unavailable".to_string(),
            attempts: 2,
        };
        let doc = m.document_for(&prompt(true), &outcome).unwrap();
        assert_eq!(doc.status, DocumentStatus::Failed);
        assert_eq!(doc.content, FAILED_CONTENT);
        assert_eq!(doc.title, "Acme Freight: 2024Q1 earnings update");
        assert_eq!(doc.failure_reason.as_deref(), Some("service unavailable"));
    }

    #[test]
    fn missing_title_is_an_error() {
        let config = PipelineConfig::default();
        let m = DocumentMaterializer::new(&config);
        let mut p = prompt(true);
        p.title = String::new();
        let err = m.document_for(&p, &completed("no heading here")).unwrap_err();
        assert!(matches!(err, MaterializationError::MissingTitle { .. }));

        let mut p = prompt(true);
        p.id = String::new();
        let err = m.document_for(&p, &completed("# T\n\nbody")).unwrap_err();
        assert!(matches!(err, MaterializationError::MissingId { .. }));
    }

    #[test]
    fn missing_outcome_is_an_error() {
        let config = PipelineConfig::default();
        let m = DocumentMaterializer::new(&config);
        let err = m
            .materialize(&[prompt(true)], &CompletionReport::default())
            .unwrap_err();
        assert_eq!(
            err,
            MaterializationError::MissingOutcome("pi_0123456789abcdef".to_string())
        );
    }

    #[test]
    fn attributes_are_flattened() {
        let config = PipelineConfig::default();
        let m = DocumentMaterializer::new(&config);
        let doc = m.document_for(&prompt(true), &completed("# T\n\nbody")).unwrap();
        let row = document_row(&doc);
        assert_eq!(row["ticker"], Value::from("ACME"));
        assert_eq!(row["status"], Value::from("GENERATED"));
        assert_eq!(row["publication_date"], Value::from("2024-05-01"));
    }
}
