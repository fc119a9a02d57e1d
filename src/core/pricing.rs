// src/core/pricing.rs — Model catalog and per-message cost

use serde::Serialize;
use std::collections::BTreeMap;

use crate::provider::Provider;

/// One catalog entry. Prices are USD per million tokens.
#[derive(Debug, Clone, Copy)]
pub struct ModelPrice {
    pub provider: Provider,
    pub id: &'static str,
    pub display: &'static str,
    pub input: f64,
    pub output: f64,
}

const fn entry(
    provider: Provider,
    id: &'static str,
    display: &'static str,
    input: f64,
    output: f64,
) -> ModelPrice {
    ModelPrice {
        provider,
        id,
        display,
        input,
        output,
    }
}

pub const CATALOG: &[ModelPrice] = &[
    entry(Provider::OpenAI, "gpt-4o", "GPT-4o", 2.50, 10.00),
    entry(Provider::OpenAI, "gpt-4o-mini", "GPT-4o Mini", 0.15, 0.60),
    entry(Provider::OpenAI, "gpt-4-turbo", "GPT-4 Turbo", 10.00, 30.00),
    entry(Provider::OpenAI, "gpt-3.5-turbo", "GPT-3.5 Turbo", 0.50, 1.50),
    entry(Provider::Anthropic, "claude-sonnet-4-20250514", "Claude Sonnet 4", 3.00, 15.00),
    entry(Provider::Anthropic, "claude-3-5-sonnet-20241022", "Claude 3.5 Sonnet", 3.00, 15.00),
    entry(Provider::Anthropic, "claude-3-5-haiku-20241022", "Claude 3.5 Haiku", 0.80, 4.00),
    entry(Provider::Anthropic, "claude-3-opus-20240229", "Claude 3 Opus", 15.00, 75.00),
    entry(Provider::Google, "gemini-2.5-flash", "Gemini 2.5 Flash", 0.10, 0.40),
    entry(Provider::Google, "gemini-2.5-pro", "Gemini 2.5 Pro", 1.25, 5.00),
    entry(Provider::Google, "gemini-2.0-flash", "Gemini 2.0 Flash", 0.10, 0.40),
    entry(Provider::Google, "gemini-1.5-pro", "Gemini 1.5 Pro", 1.25, 5.00),
];

pub fn lookup(provider: Provider, model: &str) -> Option<&'static ModelPrice> {
    CATALOG
        .iter()
        .find(|m| m.provider == provider && m.id == model)
}

/// Cost in USD. Unknown (provider, model) pairs cost nothing. Not rounded.
pub fn cost(provider: Provider, model: &str, input_tokens: u32, output_tokens: u32) -> f64 {
    match lookup(provider, model) {
        Some(p) => {
            (input_tokens as f64 / 1_000_000.0) * p.input
                + (output_tokens as f64 / 1_000_000.0) * p.output
        }
        None => 0.0,
    }
}

/// Round to 6 decimal places for responses.
pub fn round_cost(cost: f64) -> f64 {
    (cost * 1_000_000.0).round() / 1_000_000.0
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PricePair {
    pub input: f64,
    pub output: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderCatalog {
    pub name: &'static str,
    pub models: BTreeMap<&'static str, &'static str>,
    pub pricing: BTreeMap<&'static str, PricePair>,
}

/// The catalog grouped by provider, as served by `GET /api/models`.
pub fn catalog() -> BTreeMap<&'static str, ProviderCatalog> {
    let mut out = BTreeMap::new();
    for provider in Provider::ALL {
        let mut group = ProviderCatalog {
            name: provider.display_name(),
            models: BTreeMap::new(),
            pricing: BTreeMap::new(),
        };
        for m in CATALOG.iter().filter(|m| m.provider == provider) {
            group.models.insert(m.id, m.display);
            group.pricing.insert(
                m.id,
                PricePair {
                    input: m.input,
                    output: m.output,
                },
            );
        }
        out.insert(provider.as_str(), group);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    // ─── lookup tests ───────────────────────────────────────────

    #[test]
    fn test_lookup_known() {
        let p = lookup(Provider::Anthropic, "claude-3-opus-20240229").unwrap();
        assert_eq!((p.input, p.output), (15.0, 75.0));
        assert_eq!(p.display, "Claude 3 Opus");
    }

    #[test]
    fn test_lookup_wrong_provider() {
        assert!(lookup(Provider::Google, "gpt-4o").is_none());
    }

    // ─── cost tests ─────────────────────────────────────────────

    #[test]
    fn test_cost_gpt4o_mini() {
        // 1000 in × $0.15/M + 500 out × $0.60/M
        let c = cost(Provider::OpenAI, "gpt-4o-mini", 1000, 500);
        assert!((c - 0.00045).abs() < 1e-12);
    }

    #[test]
    fn test_cost_one_million_each() {
        let c = cost(Provider::Anthropic, "claude-sonnet-4-20250514", 1_000_000, 1_000_000);
        assert!((c - 18.0).abs() < 1e-9);
    }

    #[test]
    fn test_cost_unknown_model_is_zero() {
        assert_eq!(cost(Provider::OpenAI, "gpt-99", 1_000_000, 1_000_000), 0.0);
    }

    #[test]
    fn test_cost_zero_usage() {
        assert_eq!(cost(Provider::Google, "gemini-2.5-pro", 0, 0), 0.0);
    }

    #[test]
    fn test_cost_linear_in_each_count() {
        let base = cost(Provider::Google, "gemini-2.5-pro", 100, 200);
        let double_in = cost(Provider::Google, "gemini-2.5-pro", 200, 200);
        let double_out = cost(Provider::Google, "gemini-2.5-pro", 100, 400);
        let in_part = cost(Provider::Google, "gemini-2.5-pro", 100, 0);
        let out_part = cost(Provider::Google, "gemini-2.5-pro", 0, 200);
        assert!((double_in - (base + in_part)).abs() < 1e-12);
        assert!((double_out - (base + out_part)).abs() < 1e-12);
    }

    #[test]
    fn test_cost_never_negative() {
        for m in CATALOG {
            assert!(cost(m.provider, m.id, 3, 7) >= 0.0);
        }
    }

    // ─── round_cost tests ───────────────────────────────────────

    #[test]
    fn test_round_cost_six_places() {
        assert_eq!(round_cost(0.000_123_456_7), 0.000_123);
        assert_eq!(round_cost(0.000_000_4), 0.0);
        assert_eq!(round_cost(1.5), 1.5);
    }

    // ─── catalog tests ──────────────────────────────────────────

    #[test]
    fn test_catalog_shape() {
        let c = catalog();
        assert_eq!(c.len(), 3);
        let openai = &c["openai"];
        assert_eq!(openai.name, "OpenAI");
        assert_eq!(openai.models.len(), 4);
        assert_eq!(openai.models["gpt-4o"], "GPT-4o");
        assert_eq!(
            openai.pricing["gpt-4o"],
            PricePair {
                input: 2.5,
                output: 10.0
            }
        );
        assert_eq!(c["google"].name, "Google");
        assert_eq!(c["anthropic"].models.len(), 4);
    }
}
