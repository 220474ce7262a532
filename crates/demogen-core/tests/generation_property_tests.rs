//! Property-Based Tests for entity and prompt generation
//!
//! 1. Pinned entities always survive, in order, for any count that fits them
//! 2. Names, ids and tickers are unique
//! 3. Same config and seed give identical universes and prompts
//! 4. Rendered prompts never leak a placeholder
//! 5. Near name capacity, a config either validates and yields exactly
//!    `entity_count` entities or is rejected up front

use demogen_core::entity::{in_name_pool, name_capacity};
use demogen_core::template::KNOWN_BINDINGS;
use demogen_core::{
    ConfigError, DeterministicRng, EntityGenerator, PinnedEntity, PipelineConfig,
    TemplateRenderer, ENTITY_STREAM,
};
use proptest::prelude::*;
use std::collections::BTreeSet;

// ============================================================================
// Strategies
// ============================================================================

/// Pinned names that cannot collide with generated "<Prefix> <Suffix>" names.
fn pinned_strategy() -> impl Strategy<Value = Vec<String>> {
    proptest::collection::btree_set("Pin[a-z]{3,8} (Corp|Group|Labs)", 0..4)
        .prop_map(|set| set.into_iter().collect())
}

/// Pinned names drawn partly from the generator's own name pool.
fn colliding_pinned_strategy() -> impl Strategy<Value = Vec<String>> {
    let names = vec![
        "Granite Logistics",
        "Harbor Freight",
        "Summit Energy",
        "Zephyr Systems",
        "Acme Freight",
        "Borealis Grid",
    ];
    proptest::sample::subsequence(names, 0..=6)
        .prop_map(|names| names.into_iter().map(str::to_string).collect())
}

fn config_strategy() -> impl Strategy<Value = PipelineConfig> {
    (any::<u64>(), pinned_strategy(), 0usize..20, 2usize..10).prop_map(
        |(seed, pinned, extra, quarters)| PipelineConfig {
            seed,
            entity_count: pinned.len().max(1) + extra,
            history_quarters: quarters,
            must_exist: pinned.into_iter().map(PinnedEntity::named).collect(),
            ..Default::default()
        },
    )
}

fn generate(config: &PipelineConfig) -> demogen_core::EntityUniverse {
    let root = DeterministicRng::new(config.seed);
    EntityGenerator::new(config)
        .unwrap()
        .generate(&mut root.fork(ENTITY_STREAM))
}

// ============================================================================
// Entity Universe
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn pinned_entities_always_present_and_first(config in config_strategy()) {
        let universe = generate(&config);
        prop_assert_eq!(universe.len(), config.entity_count);
        for (i, pinned) in config.must_exist.iter().enumerate() {
            let entity = &universe.entities()[i];
            prop_assert_eq!(&entity.name, &pinned.name);
            prop_assert!(entity.pinned);
        }
    }

    #[test]
    fn identities_are_unique(config in config_strategy()) {
        let universe = generate(&config);
        let names: BTreeSet<String> =
            universe.entities().iter().map(|e| e.name.to_lowercase()).collect();
        let ids: BTreeSet<&str> = universe.entities().iter().map(|e| e.id.as_str()).collect();
        let tickers: BTreeSet<&str> =
            universe.entities().iter().map(|e| e.ticker.as_str()).collect();
        prop_assert_eq!(names.len(), universe.len());
        prop_assert_eq!(ids.len(), universe.len());
        prop_assert_eq!(tickers.len(), universe.len());
    }

    #[test]
    fn series_cover_every_quarter(config in config_strategy()) {
        let universe = generate(&config);
        let quarters = config.quarters().unwrap();
        for entity in universe.entities() {
            let got: Vec<_> = entity.series.iter().map(|m| m.quarter).collect();
            prop_assert_eq!(&got, &quarters);
            for m in &entity.series {
                prop_assert!(m.revenue > 0.0);
                prop_assert!(m.operating_margin.is_finite());
            }
        }
    }

    #[test]
    fn generation_is_deterministic(config in config_strategy()) {
        prop_assert_eq!(generate(&config), generate(&config));
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn capacity_accounts_for_pinned_pool_names(
        seed in any::<u64>(),
        pinned in colliding_pinned_strategy(),
        offset in 0usize..10,
    ) {
        let colliding = pinned.iter().filter(|p| in_name_pool(p)).count();
        let distinct = name_capacity() - colliding + pinned.len();
        let config = PipelineConfig {
            seed,
            entity_count: (name_capacity() + offset).saturating_sub(4).max(pinned.len().max(1)),
            history_quarters: 2,
            must_exist: pinned.into_iter().map(PinnedEntity::named).collect(),
            ..Default::default()
        };
        match EntityGenerator::new(&config) {
            Ok(_) => {
                prop_assert!(config.entity_count <= distinct);
                prop_assert_eq!(generate(&config).len(), config.entity_count);
            }
            Err(e) => {
                prop_assert!(config.entity_count > distinct);
                prop_assert_eq!(
                    e,
                    ConfigError::TooManyEntities {
                        requested: config.entity_count,
                        available: distinct,
                    }
                );
            }
        }
    }
}

// ============================================================================
// Prompt Rendering
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prompts_are_deterministic_and_fully_rendered(config in config_strategy()) {
        let universe = generate(&config);
        let rng = DeterministicRng::new(config.seed);
        let a = TemplateRenderer::new(&config).render_all(&universe, &rng).unwrap();
        let b = TemplateRenderer::new(&config).render_all(&universe, &rng).unwrap();
        prop_assert_eq!(&a, &b);

        let ids: BTreeSet<&str> = a.iter().map(|p| p.id.as_str()).collect();
        prop_assert_eq!(ids.len(), a.len());

        for prompt in &a {
            for name in KNOWN_BINDINGS {
                let placeholder = format!("{{{name}}}");
                prop_assert!(!prompt.text.contains(&placeholder), "leaked {} in {}", placeholder, prompt.id);
            }
        }
    }
}

#[test]
fn different_seeds_diverge() {
    let a = PipelineConfig {
        seed: 1,
        ..Default::default()
    };
    let b = PipelineConfig {
        seed: 2,
        ..Default::default()
    };
    let names = |c: &PipelineConfig| -> Vec<String> {
        generate(c).entities().iter().map(|e| e.name.clone()).collect()
    };
    assert_ne!(names(&a), names(&b));
}
