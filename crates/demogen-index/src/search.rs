//! Search index over one content column.
//!
//! Build: `token -> {doc ordinals}` as roaring bitmaps, plus the id, title and
//! attribute columns needed to cite a hit. Query: BM25 over the union of the
//! query tokens' postings, snippet centred on the first matching token.

use chrono::{DateTime, Utc};
use demogen_storage::Table;
use roaring::RoaringBitmap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use crate::text::{snippet, tokenize, tokenize_with_spans};
use crate::ProvisioningError;

const BM25_K1: f64 = 1.2;
const BM25_B: f64 = 0.75;
const SNIPPET_WIDTH: usize = 200;

/// Only rows whose `column` equals `equals` are indexed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowFilter {
    pub column: String,
    pub equals: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexSpec {
    pub name: String,
    pub source_table: String,
    pub id_column: String,
    pub title_column: String,
    pub content_column: String,
    pub attribute_columns: Vec<String>,
    #[serde(default)]
    pub filter: Option<RowFilter>,
    /// Maximum age before the index is due for a rebuild.
    pub target_lag_secs: u64,
}

impl IndexSpec {
    pub fn target_lag(&self) -> Duration {
        Duration::from_secs(self.target_lag_secs)
    }

    fn required_columns(&self) -> impl Iterator<Item = &str> {
        [
            self.id_column.as_str(),
            self.title_column.as_str(),
            self.content_column.as_str(),
        ]
        .into_iter()
        .chain(self.attribute_columns.iter().map(String::as_str))
        .chain(self.filter.iter().map(|f| f.column.as_str()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct IndexedDoc {
    id: String,
    title: String,
    content: String,
    attributes: BTreeMap<String, String>,
    token_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snippet {
    pub id: String,
    pub title: String,
    pub score: f64,
    pub snippet: String,
    pub attributes: BTreeMap<String, String>,
    /// Query tokens present in the document, in query order.
    pub matched_tokens: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchIndex {
    pub spec: IndexSpec,
    pub built_at: DateTime<Utc>,
    docs: Vec<IndexedDoc>,
    postings: BTreeMap<String, RoaringBitmap>,
    avg_doc_len: f64,
}

fn text_value(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

impl SearchIndex {
    /// Build from the rows of `table` that pass the index filter.
    pub fn build(spec: IndexSpec, table: &Table, now: DateTime<Utc>) -> Result<Self, ProvisioningError> {
        for column in spec.required_columns() {
            if !table.has_column(column) {
                return Err(ProvisioningError::MissingColumn {
                    object: spec.name.clone(),
                    table: table.name.clone(),
                    column: column.to_string(),
                });
            }
        }

        let mut docs = Vec::new();
        let mut postings: BTreeMap<String, RoaringBitmap> = BTreeMap::new();
        let mut total_tokens: u64 = 0;

        for (row_idx, row) in table.rows.iter().enumerate() {
            if let Some(filter) = &spec.filter {
                if text_value(row.get(&filter.column)).as_deref() != Some(filter.equals.as_str()) {
                    continue;
                }
            }

            let cite = |column: &str| -> Result<String, ProvisioningError> {
                text_value(row.get(column))
                    .filter(|v| !v.trim().is_empty())
                    .ok_or_else(|| ProvisioningError::MissingCitation {
                        index: spec.name.clone(),
                        row: row_idx,
                        column: column.to_string(),
                    })
            };
            let id = cite(&spec.id_column)?;
            let title = cite(&spec.title_column)?;
            let content = text_value(row.get(&spec.content_column)).unwrap_or_default();
            let attributes = spec
                .attribute_columns
                .iter()
                .map(|c| (c.clone(), text_value(row.get(c)).unwrap_or_default()))
                .collect();

            let ordinal = docs.len() as u32;
            let tokens = tokenize(&content);
            total_tokens += tokens.len() as u64;
            for token in &tokens {
                postings.entry(token.clone()).or_default().insert(ordinal);
            }
            docs.push(IndexedDoc {
                id,
                title,
                content,
                attributes,
                token_count: tokens.len() as u32,
            });
        }

        if docs.is_empty() {
            return Err(ProvisioningError::EmptyCollection {
                index: spec.name.clone(),
                table: table.name.clone(),
            });
        }

        let avg_doc_len = total_tokens as f64 / docs.len() as f64;
        Ok(Self {
            spec,
            built_at: now,
            docs,
            postings,
            avg_doc_len,
        })
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    /// Whether the index is older than its target lag at `now`.
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(self.built_at);
        age.num_seconds() >= self.spec.target_lag_secs as i64
    }

    /// Ranked preview: at most `limit` hits, best first (ties by id).
    pub fn query(&self, query: &str, limit: usize) -> Vec<Snippet> {
        let mut terms: Vec<String> = Vec::new();
        for t in tokenize(query) {
            if !terms.contains(&t) {
                terms.push(t);
            }
        }
        if terms.is_empty() || limit == 0 {
            return Vec::new();
        }

        let mut candidates = RoaringBitmap::new();
        for term in &terms {
            if let Some(bm) = self.postings.get(term) {
                candidates |= bm;
            }
        }

        let n = self.docs.len() as f64;
        let idf: HashMap<&str, f64> = terms
            .iter()
            .map(|t| {
                let df = self.postings.get(t).map(|b| b.len() as f64).unwrap_or(0.0);
                (t.as_str(), (1.0 + (n - df + 0.5) / (df + 0.5)).ln())
            })
            .collect();

        let mut hits: Vec<Snippet> = candidates
            .iter()
            .filter_map(|ordinal| self.docs.get(ordinal as usize))
            .map(|doc| self.score(doc, &terms, &idf))
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        hits.truncate(limit);
        hits
    }

    fn score(&self, doc: &IndexedDoc, terms: &[String], idf: &HashMap<&str, f64>) -> Snippet {
        let tokens = tokenize_with_spans(&doc.content);
        let mut tf: HashMap<&str, u32> = HashMap::new();
        for token in &tokens {
            if terms.contains(&token.text) {
                *tf.entry(token.text.as_str()).or_default() += 1;
            }
        }

        let len_norm = 1.0 - BM25_B + BM25_B * (doc.token_count as f64 / self.avg_doc_len.max(1.0));
        let score: f64 = tf
            .iter()
            .map(|(term, &count)| {
                let f = count as f64;
                idf.get(term).copied().unwrap_or(0.0) * (f * (BM25_K1 + 1.0)) / (f + BM25_K1 * len_norm)
            })
            .sum();

        let matched_tokens: Vec<String> = terms
            .iter()
            .filter(|t| tf.contains_key(t.as_str()))
            .cloned()
            .collect();
        let focus = tokens
            .iter()
            .find(|t| tf.contains_key(t.text.as_str()))
            .map(|t| t.span.clone())
            .unwrap_or(0..0);

        Snippet {
            id: doc.id.clone(),
            title: doc.title.clone(),
            score,
            snippet: snippet(&doc.content, focus, SNIPPET_WIDTH),
            attributes: doc.attributes.clone(),
            matched_tokens,
        }
    }
}
