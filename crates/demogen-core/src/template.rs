//! Prompt templates and placeholder rendering.
//!
//! Placeholders are `{name}` (matched case-insensitively against the binding
//! keys); `{{` and `}}` produce literal braces. Rendering never leaves a
//! literal placeholder behind: an unbound name is a [`GenerationError`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::GenerationError;

/// Every binding the prompt planner can supply.
pub const KNOWN_BINDINGS: &[&str] = &[
    "company_name",
    "ticker",
    "sector",
    "region",
    "category",
    "quarter",
    "fiscal_year",
    "revenue",
    "revenue_growth",
    "operating_margin",
    "net_income",
    "financial_table",
    "peer_names",
    "featured_companies",
    "language",
    "source_label",
    "publication_date",
    "max_words",
    "style",
];

/// A parameterized prompt for one source type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptTemplate {
    pub id: String,
    /// Prompt body with `{placeholders}`.
    pub text: String,
    /// Title pattern used when the completion carries no heading.
    pub title: String,
    #[serde(default = "default_max_words")]
    pub max_words: usize,
    #[serde(default = "default_style")]
    pub style: String,
    /// Ask for Markdown (headings, sections, tables).
    #[serde(default = "default_markup")]
    pub markup: bool,
}

fn default_max_words() -> usize {
    400
}

fn default_style() -> String {
    "professional".to_string()
}

fn default_markup() -> bool {
    true
}

/// Values available to a template, keyed by lowercase name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Bindings {
    values: BTreeMap<String, String>,
}

impl Bindings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: &str, value: impl Into<String>) -> &mut Self {
        self.values.insert(key.to_ascii_lowercase(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values
            .get(&key.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn extend(&mut self, other: &Bindings) {
        for (k, v) in &other.values {
            self.values.insert(k.clone(), v.clone());
        }
    }
}

enum Segment<'a> {
    Literal(&'a str),
    Placeholder { name: &'a str },
}

fn segments<'a>(template_id: &str, text: &'a str) -> Result<Vec<Segment<'a>>, GenerationError> {
    let malformed = |offset: usize, reason: &'static str| GenerationError::MalformedTemplate {
        template: template_id.to_string(),
        offset,
        reason,
    };

    let bytes = text.as_bytes();
    let mut out = Vec::new();
    let mut literal_start = 0;
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'{' if bytes.get(i + 1) == Some(&b'{') => {
                out.push(Segment::Literal(&text[literal_start..i + 1]));
                i += 2;
                literal_start = i;
            }
            b'}' if bytes.get(i + 1) == Some(&b'}') => {
                out.push(Segment::Literal(&text[literal_start..i + 1]));
                i += 2;
                literal_start = i;
            }
            b'{' => {
                let close = text[i + 1..]
                    .find('}')
                    .map(|rel| i + 1 + rel)
                    .ok_or_else(|| malformed(i, "unterminated placeholder"))?;
                let name = text[i + 1..close].trim();
                let valid = name
                    .chars()
                    .next()
                    .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
                    && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
                if !valid {
                    return Err(malformed(i, "invalid placeholder name"));
                }
                out.push(Segment::Literal(&text[literal_start..i]));
                out.push(Segment::Placeholder { name });
                i = close + 1;
                literal_start = i;
            }
            b'}' => return Err(malformed(i, "unmatched `}`")),
            _ => i += 1,
        }
    }
    out.push(Segment::Literal(&text[literal_start..]));
    Ok(out)
}

/// Placeholder names used by `text`, lowercased, in order of first use.
pub fn parse_placeholders(template_id: &str, text: &str) -> Result<Vec<String>, GenerationError> {
    let mut names: Vec<String> = Vec::new();
    for segment in segments(template_id, text)? {
        if let Segment::Placeholder { name } = segment {
            let name = name.to_ascii_lowercase();
            if !names.contains(&name) {
                names.push(name);
            }
        }
    }
    Ok(names)
}

/// Substitute every placeholder in `text`.
pub fn render(template_id: &str, text: &str, bindings: &Bindings) -> Result<String, GenerationError> {
    let mut out = String::with_capacity(text.len() + 64);
    for segment in segments(template_id, text)? {
        match segment {
            Segment::Literal(s) => out.push_str(s),
            Segment::Placeholder { name } => {
                let value =
                    bindings
                        .get(name)
                        .ok_or_else(|| GenerationError::UnresolvedPlaceholder {
                            template: template_id.to_string(),
                            placeholder: name.to_string(),
                        })?;
                out.push_str(value);
            }
        }
    }
    Ok(out)
}
