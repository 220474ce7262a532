//! Template Renderer: expands each source type's generation plan into
//! fully rendered, uniquely identified [`PromptInstance`]s.
//!
//! The complete prompt text is stored on the instance, so completion needs no
//! knowledge of templates or entities.

use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::config::{language_name, PipelineConfig, PlanScope, SourceConfig};
use crate::entity::{Entity, EntityUniverse};
use crate::template::{render, Bindings, PromptTemplate};
use crate::{DeterministicRng, GenerationError, Quarter};

const TABLE_QUARTERS: usize = 4;
const MAX_PEERS: usize = 3;
const MAX_FEATURED: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptInstance {
    pub id: String,
    pub source_type: String,
    pub template_id: String,
    pub model: String,
    /// Entity the prompt was rendered for, if any.
    pub entity_id: Option<String>,
    /// Whether the resulting document should carry `entity_id` as its linkage.
    pub link_entity: bool,
    pub sequence: u32,
    pub language: String,
    pub quarter: Option<Quarter>,
    pub publication_date: NaiveDate,
    /// Rendered title pattern, used when the completion has no heading.
    pub title: String,
    pub attributes: BTreeMap<String, String>,
    pub text: String,
}

impl PromptInstance {
    pub fn linked_entity(&self) -> Option<&str> {
        if self.link_entity {
            self.entity_id.as_deref()
        } else {
            None
        }
    }
}

/// `pi_` + 16 hex chars of SHA-256 over seed, template, entity and sequence.
pub fn prompt_instance_id(
    seed: u64,
    template_id: &str,
    entity_id: Option<&str>,
    sequence: u32,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(seed.to_le_bytes());
    hasher.update(template_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(entity_id.unwrap_or("-").as_bytes());
    hasher.update([0u8]);
    hasher.update(sequence.to_le_bytes());
    let digest = hasher.finalize();
    let hex: String = digest.iter().take(8).map(|b| format!("{b:02x}")).collect();
    format!("pi_{hex}")
}

struct Slot<'e> {
    entity: Option<&'e Entity>,
    quarter: Quarter,
}

pub struct TemplateRenderer<'a> {
    config: &'a PipelineConfig,
}

impl<'a> TemplateRenderer<'a> {
    pub fn new(config: &'a PipelineConfig) -> Self {
        Self { config }
    }

    /// Render every source's plan. Each source draws from its own fork of `rng`.
    pub fn render_all(
        &self,
        universe: &EntityUniverse,
        rng: &DeterministicRng,
    ) -> Result<Vec<PromptInstance>, GenerationError> {
        let mut out = Vec::new();
        for source in &self.config.sources {
            let mut source_rng = rng.fork(&format!("prompts/{}", source.name));
            let rendered = self.render_source(source, universe, &mut source_rng)?;
            tracing::debug!(
                source_type = %source.name,
                prompts = rendered.len(),
                "rendered prompts"
            );
            out.extend(rendered);
        }
        Ok(out)
    }

    pub fn render_source(
        &self,
        source: &SourceConfig,
        universe: &EntityUniverse,
        rng: &mut DeterministicRng,
    ) -> Result<Vec<PromptInstance>, GenerationError> {
        if source.templates.is_empty() {
            return Err(GenerationError::NoTemplates {
                source_type: source.name.clone(),
            });
        }

        let slots = self.slots(source, universe);
        let mut out = Vec::with_capacity(slots.len());
        for (sequence, slot) in slots.iter().enumerate() {
            let sequence = sequence as u32;
            let template = &source.templates[rng.gen_range(source.templates.len())];
            let language = self.pick_language(rng);
            let bindings = self.bindings(source, template, slot, universe, &language, rng);

            let body = render(&template.id, &template.text, &bindings)?;
            let title = render(&template.id, &template.title, &bindings)?;
            let text = compose_prompt(&body, &title, template, &bindings);

            let mut attributes = BTreeMap::new();
            for attr in &source.attributes {
                let value = bindings.get(attr).ok_or_else(|| {
                    GenerationError::UnresolvedPlaceholder {
                        template: template.id.clone(),
                        placeholder: attr.clone(),
                    }
                })?;
                attributes.insert(attr.clone(), value.to_string());
            }

            let entity_id = slot.entity.map(|e| e.id.clone());
            out.push(PromptInstance {
                id: prompt_instance_id(
                    self.config.seed,
                    &template.id,
                    entity_id.as_deref(),
                    sequence,
                ),
                source_type: source.name.clone(),
                template_id: template.id.clone(),
                model: source.model(&self.config.default_model).to_string(),
                entity_id,
                link_entity: source.link_entity,
                sequence,
                language,
                quarter: Some(slot.quarter),
                publication_date: publication_date(&bindings, slot.quarter),
                title,
                attributes,
                text,
            });
        }
        Ok(out)
    }

    fn slots<'e>(&self, source: &SourceConfig, universe: &'e EntityUniverse) -> Vec<Slot<'e>> {
        let mut slots = Vec::new();
        match &source.scope {
            PlanScope::PerEntity {
                documents_per_entity,
            } => {
                for entity in universe.entities() {
                    let Some(latest) = entity.latest() else {
                        continue;
                    };
                    for _ in 0..*documents_per_entity {
                        slots.push(Slot {
                            entity: Some(entity),
                            quarter: latest.quarter,
                        });
                    }
                }
            }
            PlanScope::PerEntityQuarter { recent_quarters } => {
                for entity in universe.entities() {
                    let skip = entity.series.len().saturating_sub(*recent_quarters);
                    for metrics in entity.series.iter().skip(skip) {
                        slots.push(Slot {
                            entity: Some(entity),
                            quarter: metrics.quarter,
                        });
                    }
                }
            }
            PlanScope::Global { count } => {
                let latest = universe
                    .entities()
                    .iter()
                    .filter_map(|e| e.latest().map(|m| m.quarter))
                    .max();
                if let Some(quarter) = latest {
                    for _ in 0..*count {
                        slots.push(Slot {
                            entity: None,
                            quarter,
                        });
                    }
                }
            }
        }
        slots
    }

    fn pick_language(&self, rng: &mut DeterministicRng) -> String {
        let codes: Vec<&String> = self.config.language_mix.keys().collect();
        let weights: Vec<f64> = self.config.language_mix.values().copied().collect();
        rng.weighted_index(&weights)
            .and_then(|idx| codes.get(idx))
            .map(|c| c.to_string())
            .unwrap_or_else(|| "en".to_string())
    }

    fn bindings(
        &self,
        source: &SourceConfig,
        template: &PromptTemplate,
        slot: &Slot<'_>,
        universe: &EntityUniverse,
        language: &str,
        rng: &mut DeterministicRng,
    ) -> Bindings {
        let mut b = Bindings::new();
        b.insert("source_label", source.label.as_str())
            .insert("language", language_name(language).unwrap_or("English"))
            .insert("max_words", template.max_words.to_string())
            .insert("style", template.style.as_str())
            .insert("quarter", slot.quarter.to_string())
            .insert("fiscal_year", slot.quarter.year().to_string());

        let offset_days = match slot.entity {
            Some(_) => rng.gen_between(14, 45),
            None => rng.gen_between(1, 60),
        };
        let published = slot.quarter.end_date() + Duration::days(offset_days);
        b.insert("publication_date", published.format("%Y-%m-%d").to_string());

        match slot.entity {
            Some(entity) => {
                b.extend(&entity_bindings(entity, slot.quarter));
                b.insert("peer_names", peer_names(entity, universe, rng));
            }
            None => {
                b.insert("featured_companies", featured_companies(universe, rng));
            }
        }
        b
    }
}

fn entity_bindings(entity: &Entity, quarter: Quarter) -> Bindings {
    let mut b = Bindings::new();
    b.insert("company_name", entity.name.as_str())
        .insert("ticker", entity.ticker.as_str())
        .insert("sector", entity.sector.as_str())
        .insert("region", entity.region.as_str())
        .insert("category", entity.category.replace('_', " "));

    if let Some(m) = entity.metrics_for(quarter) {
        b.insert("revenue", format!("{:.1}", m.revenue))
            .insert("operating_margin", format_pct(m.operating_margin))
            .insert("net_income", format!("{:.1}", m.net_income));
    }
    let growth = entity
        .revenue_growth(quarter)
        .map(format_signed_pct)
        .unwrap_or_else(|| "n/a".to_string());
    b.insert("revenue_growth", growth);
    b.insert("financial_table", financial_table(entity, quarter));
    b
}

/// Markdown table of up to four quarters ending at `quarter`.
fn financial_table(entity: &Entity, quarter: Quarter) -> String {
    let end = entity
        .series
        .iter()
        .position(|m| m.quarter == quarter)
        .map(|i| i + 1)
        .unwrap_or(entity.series.len());
    let start = end.saturating_sub(TABLE_QUARTERS);

    let mut table = String::from(
        "| Quarter | Revenue (m) | Operating margin | Net income (m) |\n|---|---:|---:|---:|",
    );
    for m in &entity.series[start..end] {
        table.push_str(&format!(
            "\n| {} | {:.1} | {} | {:.1} |",
            m.quarter,
            m.revenue,
            format_pct(m.operating_margin),
            m.net_income
        ));
    }
    table
}

fn peer_names(entity: &Entity, universe: &EntityUniverse, rng: &mut DeterministicRng) -> String {
    let mut same_sector: Vec<&Entity> = universe
        .entities()
        .iter()
        .filter(|e| e.id != entity.id && e.sector == entity.sector)
        .collect();
    if same_sector.is_empty() {
        same_sector = universe
            .entities()
            .iter()
            .filter(|e| e.id != entity.id)
            .collect();
    }
    rng.shuffle(&mut same_sector);
    let names: Vec<&str> = same_sector
        .iter()
        .take(MAX_PEERS)
        .map(|e| e.name.as_str())
        .collect();
    if names.is_empty() {
        "its main competitors".to_string()
    } else {
        names.join(", ")
    }
}

/// Pinned entities always appear; the rest of the list is a deterministic sample.
fn featured_companies(universe: &EntityUniverse, rng: &mut DeterministicRng) -> String {
    let mut featured: Vec<&Entity> = universe.pinned().collect();
    let mut others: Vec<&Entity> = universe.entities().iter().filter(|e| !e.pinned).collect();
    rng.shuffle(&mut others);
    let room = MAX_FEATURED.saturating_sub(featured.len());
    featured.extend(others.into_iter().take(room));
    featured
        .iter()
        .map(|e| format!("{} ({})", e.name, e.ticker))
        .collect::<Vec<_>>()
        .join(", ")
}

fn compose_prompt(body: &str, title: &str, template: &PromptTemplate, bindings: &Bindings) -> String {
    let language = bindings.get("language").unwrap_or("English");
    let format = if template.markup {
        "Format: Markdown. Start with a level-1 heading containing the title, use `##` section \
         headings, and render any tabular data as Markdown tables."
    } else {
        "Format: plain prose paragraphs without markup."
    };
    format!(
        "{body}\n\nTitle: {title}\nLanguage: write the document in {language}.\n\
         Length: about {} words, {} style.\n{format}",
        template.max_words, template.style
    )
}

fn publication_date(bindings: &Bindings, quarter: Quarter) -> NaiveDate {
    bindings
        .get("publication_date")
        .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok())
        .unwrap_or_else(|| quarter.end_date())
}

fn format_pct(v: f64) -> String {
    format!("{:.1}%", v * 100.0)
}

fn format_signed_pct(v: f64) -> String {
    format!("{:+.1}%", v * 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PinnedEntity;
    use crate::entity::EntityGenerator;
    use std::collections::BTreeSet;

    fn setup(seed: u64) -> (PipelineConfig, EntityUniverse) {
        let config = PipelineConfig {
            seed,
            entity_count: 6,
            must_exist: vec![PinnedEntity::named("Acme Freight")],
            ..Default::default()
        };
        let root = DeterministicRng::new(seed);
        let universe = EntityGenerator::new(&config)
            .unwrap()
            .generate(&mut root.fork("entities"));
        (config, universe)
    }

    #[test]
    fn plan_sizes_follow_scopes() {
        let (config, universe) = setup(42);
        let prompts = TemplateRenderer::new(&config)
            .render_all(&universe, &DeterministicRng::new(42))
            .unwrap();
        let count = |name: &str| prompts.iter().filter(|p| p.source_type == name).count();
        assert_eq!(count("broker_research"), 6);
        assert_eq!(count("earnings_call"), 12);
        assert_eq!(count("news_digest"), 3);
    }

    #[test]
    fn ids_are_unique_and_text_has_no_placeholders() {
        let (config, universe) = setup(42);
        let prompts = TemplateRenderer::new(&config)
            .render_all(&universe, &DeterministicRng::new(42))
            .unwrap();
        let ids: BTreeSet<&str> = prompts.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids.len(), prompts.len());
        for p in &prompts {
            assert!(!p.text.contains("{company_name}"), "{}", p.text);
            assert!(p.text.contains(&format!("Title: {}", p.title)));
            assert!(!p.title.is_empty());
        }
    }

    #[test]
    fn rendering_is_byte_identical_for_same_seed() {
        let (config, universe) = setup(42);
        let a = TemplateRenderer::new(&config)
            .render_all(&universe, &DeterministicRng::new(42))
            .unwrap();
        let b = TemplateRenderer::new(&config)
            .render_all(&universe, &DeterministicRng::new(42))
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn entity_prompts_carry_entity_facts() {
        let (config, universe) = setup(42);
        let prompts = TemplateRenderer::new(&config)
            .render_all(&universe, &DeterministicRng::new(42))
            .unwrap();
        let acme = universe.by_name("Acme Freight").unwrap();
        let broker: Vec<&PromptInstance> = prompts
            .iter()
            .filter(|p| p.source_type == "broker_research" && p.entity_id.as_deref() == Some(&acme.id))
            .collect();
        assert_eq!(broker.len(), 1);
        assert!(broker[0].text.contains("Acme Freight"));
        assert!(broker[0].text.contains("| Quarter | Revenue (m)"));
        assert_eq!(broker[0].linked_entity(), Some(acme.id.as_str()));
        assert_eq!(broker[0].attributes.get("ticker"), Some(&acme.ticker));
    }

    #[test]
    fn global_prompts_feature_pinned_entities_without_linkage() {
        let (config, universe) = setup(42);
        let prompts = TemplateRenderer::new(&config)
            .render_all(&universe, &DeterministicRng::new(42))
            .unwrap();
        for p in prompts.iter().filter(|p| p.source_type == "news_digest") {
            assert!(p.entity_id.is_none());
            assert!(p.linked_entity().is_none());
            assert!(p.text.contains("Acme Freight"));
        }
    }

    #[test]
    fn global_template_using_entity_binding_fails_loud() {
        let (mut config, universe) = setup(42);
        let digest = config
            .sources
            .iter_mut()
            .find(|s| s.name == "news_digest")
            .unwrap();
        digest.templates[0].text.push_str(" Focus on {company_name}.");
        let err = TemplateRenderer::new(&config)
            .render_all(&universe, &DeterministicRng::new(42))
            .unwrap_err();
        assert!(matches!(
            err,
            GenerationError::UnresolvedPlaceholder { ref placeholder, .. } if placeholder == "company_name"
        ));
    }

    #[test]
    fn language_mix_is_respected() {
        let (mut config, universe) = setup(42);
        config.language_mix = BTreeMap::from([("de".to_string(), 1.0), ("en".to_string(), 0.0)]);
        let prompts = TemplateRenderer::new(&config)
            .render_all(&universe, &DeterministicRng::new(42))
            .unwrap();
        assert!(prompts.iter().all(|p| p.language == "de"));
        assert!(prompts[0].text.contains("write the document in German"));
    }

    #[test]
    fn instance_id_depends_on_every_input() {
        let base = prompt_instance_id(42, "t", Some("ent_1"), 0);
        assert_eq!(base, prompt_instance_id(42, "t", Some("ent_1"), 0));
        assert_ne!(base, prompt_instance_id(43, "t", Some("ent_1"), 0));
        assert_ne!(base, prompt_instance_id(42, "u", Some("ent_1"), 0));
        assert_ne!(base, prompt_instance_id(42, "t", None, 0));
        assert_ne!(base, prompt_instance_id(42, "t", Some("ent_1"), 1));
        assert!(base.starts_with("pi_") && base.len() == 19);
    }
}
