//! Built-in categories and source types used when the config names none.

use crate::config::{CanarySpec, CategoryConfig, PlanScope, SourceConfig};
use crate::template::PromptTemplate;

pub fn default_categories() -> Vec<CategoryConfig> {
    vec![
        CategoryConfig {
            name: "large_cap".to_string(),
            weight: 0.3,
            base_revenue: 8_000.0,
            drift: 0.012,
            volatility: 0.025,
            margin: 0.18,
        },
        CategoryConfig {
            name: "mid_cap".to_string(),
            weight: 0.4,
            base_revenue: 1_500.0,
            drift: 0.02,
            volatility: 0.05,
            margin: 0.12,
        },
        CategoryConfig {
            name: "private".to_string(),
            weight: 0.3,
            base_revenue: 250.0,
            drift: 0.03,
            volatility: 0.09,
            margin: 0.08,
        },
    ]
}

pub fn default_sources() -> Vec<SourceConfig> {
    vec![broker_research(), earnings_call(), news_digest()]
}

fn broker_research() -> SourceConfig {
    SourceConfig {
        name: "broker_research".to_string(),
        label: "Granite Street Research".to_string(),
        model: Some("llama3.1-70b".to_string()),
        scope: PlanScope::PerEntity {
            documents_per_entity: 1,
        },
        link_entity: true,
        templates: vec![
            PromptTemplate {
                id: "broker_research_initiation".to_string(),
                text: "You are a sell-side equity analyst at {source_label}. Write an initiation \
                       note on {company_name} (ticker {ticker}), a {category} company in the \
                       {sector} sector operating mainly in {region}.\n\n\
                       Latest quarter {quarter}: revenue {revenue} million \
                       (quarter-on-quarter growth {revenue_growth}), operating margin \
                       {operating_margin}, net income {net_income} million.\n\n\
                       Recent history:\n{financial_table}\n\n\
                       Cover the investment thesis, pricing power and pricing strategy, \
                       competitive position against {peer_names}, key risks, and finish with a \
                       rating and a 12-month price target."
                    .to_string(),
                title: "{company_name}: initiation of coverage ({quarter})".to_string(),
                max_words: 600,
                style: "analytical".to_string(),
                markup: true,
            },
            PromptTemplate {
                id: "broker_research_update".to_string(),
                text: "You are a sell-side equity analyst at {source_label}. Write a short \
                       earnings update on {company_name} ({ticker}, {sector}) after its \
                       {quarter} results: revenue {revenue} million, growth {revenue_growth}, \
                       operating margin {operating_margin}.\n\n\
                       Recent history:\n{financial_table}\n\n\
                       Discuss what changed in the quarter, pricing and volume trends, how the \
                       company compares with {peer_names}, and whether the rating changes."
                    .to_string(),
                title: "{company_name}: {quarter} earnings update".to_string(),
                max_words: 400,
                style: "concise".to_string(),
                markup: true,
            },
        ],
        attributes: vec![
            "ticker".to_string(),
            "sector".to_string(),
            "quarter".to_string(),
            "language".to_string(),
        ],
        canary: CanarySpec::Entity,
        target_lag_secs: None,
    }
}

fn earnings_call() -> SourceConfig {
    SourceConfig {
        name: "earnings_call".to_string(),
        label: "Earnings Call Transcripts".to_string(),
        model: Some("llama3.1-8b".to_string()),
        scope: PlanScope::PerEntityQuarter { recent_quarters: 2 },
        link_entity: true,
        templates: vec![PromptTemplate {
            id: "earnings_call_transcript".to_string(),
            text: "Write an excerpt of the {quarter} earnings call transcript for \
                   {company_name} ({ticker}). Include prepared remarks from the CEO and CFO and \
                   three analyst questions with answers.\n\n\
                   Facts that must be consistent with the transcript: revenue {revenue} \
                   million, quarter-on-quarter growth {revenue_growth}, operating margin \
                   {operating_margin}, net income {net_income} million. Management should \
                   comment on pricing, demand in {region} and the outlook for fiscal year \
                   {fiscal_year}."
                .to_string(),
            title: "{company_name} {quarter} earnings call transcript".to_string(),
            max_words: 700,
            style: "conversational".to_string(),
            markup: true,
        }],
        attributes: vec![
            "ticker".to_string(),
            "quarter".to_string(),
            "fiscal_year".to_string(),
            "language".to_string(),
        ],
        canary: CanarySpec::Entity,
        target_lag_secs: None,
    }
}

fn news_digest() -> SourceConfig {
    SourceConfig {
        name: "news_digest".to_string(),
        label: "Market Wire".to_string(),
        model: None,
        scope: PlanScope::Global { count: 3 },
        // A digest spans many companies, so no single entity owns it.
        link_entity: false,
        templates: vec![PromptTemplate {
            id: "news_digest_daily".to_string(),
            text: "Write a market news digest for {source_label} published on \
                   {publication_date}. Cover recent developments at the following companies: \
                   {featured_companies}. Give each company a short section with a headline, \
                   and close with a table summarizing market sentiment per company."
                .to_string(),
            title: "{source_label} market digest, {publication_date}".to_string(),
            max_words: 500,
            style: "journalistic".to_string(),
            markup: true,
        }],
        attributes: vec!["publication_date".to_string(), "language".to_string()],
        canary: CanarySpec::Term {
            query: "market".to_string(),
        },
        target_lag_secs: Some(1_800),
    }
}
