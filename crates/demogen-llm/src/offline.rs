use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::{CompletionError, CompletionService};

const DISCUSSION: &[&str] = &[
    "Management reiterated that disciplined pricing remains the main lever for protecting margins.",
    "Volume trends were mixed across regions, with the strongest demand coming from existing customers.",
    "Cost inflation eased during the period, although labour and logistics costs stayed elevated.",
    "Working capital improved as inventory levels normalized and collections accelerated.",
    "Competitive intensity increased as peers cut prices to defend share in core segments.",
    "Capital allocation stayed balanced between reinvestment, debt reduction and shareholder returns.",
    "Guidance assumes a stable macro backdrop and no material change in input costs.",
    "The outlook leaves room for upside if recent contract wins convert on schedule.",
    "Investors focused on the durability of recent margin gains and the pace of new orders.",
    "Analysts flagged currency movements and customer concentration as the main near-term risks.",
];

/// Deterministic offline stand-in: every prompt maps to one fixed document.
#[derive(Debug, Clone, Default)]
pub struct OfflineCompletionService;

impl OfflineCompletionService {
    pub fn new() -> Self {
        Self
    }

    /// Render the document for `prompt`. Pure function of the prompt text.
    pub fn render(prompt: &str) -> String {
        let (body, instructions) = match prompt.rfind("\n\nTitle: ") {
            Some(pos) => (&prompt[..pos], &prompt[pos + 2..]),
            None => (prompt, ""),
        };
        let title = instructions
            .lines()
            .find_map(|l| l.strip_prefix("Title: "))
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .unwrap_or("Untitled document");
        let markup = instructions.contains("Format: Markdown") || instructions.is_empty();

        let paragraphs: Vec<&str> = body
            .split("\n\n")
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .collect();

        let digest = Sha256::digest(prompt.as_bytes());
        let mut picked: Vec<&str> = Vec::with_capacity(4);
        for byte in digest.iter() {
            let sentence = DISCUSSION[*byte as usize % DISCUSSION.len()];
            if !picked.contains(&sentence) {
                picked.push(sentence);
            }
            if picked.len() == 4 {
                break;
            }
        }

        let overview = paragraphs.first().copied().unwrap_or("");
        let detail = paragraphs.get(1..).unwrap_or(&[]).join("\n\n");
        if markup {
            let mut doc = format!(
                "# {title}\n\n## Overview\n\n{overview}\n\n## Discussion\n\n{}",
                picked.join(" ")
            );
            if !detail.is_empty() {
                doc.push_str("\n\n## Supporting detail\n\n");
                doc.push_str(&detail);
            }
            doc
        } else {
            let detail = detail.replace('|', " ");
            format!("{title}\n\n{overview}\n\n{}\n\n{detail}", picked.join(" "))
                .trim_end()
                .to_string()
        }
    }
}

#[async_trait]
impl CompletionService for OfflineCompletionService {
    fn name(&self) -> &str {
        "offline"
    }

    fn max_concurrency(&self) -> usize {
        16
    }

    async fn complete(&self, _model: &str, prompt: &str) -> Result<String, CompletionError> {
        Ok(Self::render(prompt))
    }
}
