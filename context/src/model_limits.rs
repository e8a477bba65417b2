//! Model context limits and registry.
//!
//! This module provides [`ModelLimits`] for storing token constraints per model,
//! and [`ModelRegistry`] for looking them up by `(provider, model)` with prefix
//! matching. The classifier falls back to this table when a provider error does
//! not spell out the context size.

use std::collections::HashMap;

/// Each model has a maximum context window (input tokens) and maximum output tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelLimits {
    /// Maximum input context window in tokens.
    context_window: u32,
    /// Maximum output tokens the model can generate.
    max_output: u32,
}

impl ModelLimits {
    #[must_use]
    pub const fn new(context_window: u32, max_output: u32) -> Self {
        Self {
            context_window,
            max_output,
        }
    }

    #[must_use]
    pub const fn context_window(&self) -> u32 {
        self.context_window
    }

    #[must_use]
    pub const fn max_output(&self) -> u32 {
        self.max_output
    }
}

/// Provider families the static table knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderFamily {
    Anthropic,
    OpenAI,
    Google,
}

impl ProviderFamily {
    /// Normalise a host provider id. Aggregators (bedrock, openrouter, ...) return `None`.
    #[must_use]
    pub fn parse(provider_id: &str) -> Option<Self> {
        match provider_id.to_ascii_lowercase().as_str() {
            "anthropic" | "claude" => Some(Self::Anthropic),
            "openai" | "gpt" => Some(Self::OpenAI),
            "google" | "gemini" | "google-vertex" => Some(Self::Google),
            _ => None,
        }
    }
}

/// Where model limits came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelLimitsSource {
    /// Exact `(provider, model)` match from an override.
    Override,
    /// Matched a known prefix (the matched prefix).
    Prefix(&'static str),
}

/// Result of a successful lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedModelLimits {
    limits: ModelLimits,
    source: ModelLimitsSource,
}

impl ResolvedModelLimits {
    #[must_use]
    pub const fn new(limits: ModelLimits, source: ModelLimitsSource) -> Self {
        Self { limits, source }
    }

    #[must_use]
    pub const fn limits(self) -> ModelLimits {
        self.limits
    }

    #[must_use]
    pub const fn source(self) -> ModelLimitsSource {
        self.source
    }
}

/// Known model prefixes and their limits.
///
/// Ordered by specificity (more specific prefixes first) within each family.
const KNOWN_MODELS: &[(ProviderFamily, &str, ModelLimits)] = &[
    // Anthropic
    (ProviderFamily::Anthropic, "claude-opus-4-5", ModelLimits::new(200_000, 64_000)),
    (ProviderFamily::Anthropic, "claude-sonnet-4-5", ModelLimits::new(200_000, 64_000)),
    (ProviderFamily::Anthropic, "claude-haiku-4-5", ModelLimits::new(200_000, 64_000)),
    (ProviderFamily::Anthropic, "claude-opus-4", ModelLimits::new(200_000, 32_000)),
    (ProviderFamily::Anthropic, "claude-sonnet-4", ModelLimits::new(200_000, 64_000)),
    (ProviderFamily::Anthropic, "claude-3-7-sonnet", ModelLimits::new(200_000, 64_000)),
    (ProviderFamily::Anthropic, "claude-3-5", ModelLimits::new(200_000, 8_192)),
    (ProviderFamily::Anthropic, "claude", ModelLimits::new(200_000, 8_192)),
    // OpenAI
    (ProviderFamily::OpenAI, "gpt-5.2", ModelLimits::new(400_000, 128_000)),
    (ProviderFamily::OpenAI, "gpt-5", ModelLimits::new(400_000, 128_000)),
    (ProviderFamily::OpenAI, "gpt-4.1", ModelLimits::new(1_047_576, 32_768)),
    (ProviderFamily::OpenAI, "gpt-4o", ModelLimits::new(128_000, 16_384)),
    (ProviderFamily::OpenAI, "o4-mini", ModelLimits::new(200_000, 100_000)),
    (ProviderFamily::OpenAI, "o3", ModelLimits::new(200_000, 100_000)),
    // Google
    (ProviderFamily::Google, "gemini-3-pro", ModelLimits::new(1_048_576, 65_536)),
    (ProviderFamily::Google, "gemini-3-flash", ModelLimits::new(1_048_576, 65_536)),
    (ProviderFamily::Google, "gemini-2.5-pro", ModelLimits::new(1_048_576, 65_536)),
    (ProviderFamily::Google, "gemini-2.5-flash", ModelLimits::new(1_048_576, 65_536)),
];

/// Registry of known model context limits with support for custom overrides.
///
/// Lookup order:
/// 1. Exact `(provider, model)` match in overrides
/// 2. Prefix match within the provider's family
/// 3. For aggregator providers, prefix match across every family after
///    stripping a vendor prefix (`anthropic/`, `anthropic.`)
/// 4. `None`: the pair is unknown
#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    overrides: HashMap<(String, String), ModelLimits>,
}

impl ModelRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, provider_id: &str, model_id: &str) -> Option<ResolvedModelLimits> {
        if let Some(limits) = self
            .overrides
            .get(&(provider_id.to_string(), model_id.to_string()))
        {
            return Some(ResolvedModelLimits::new(*limits, ModelLimitsSource::Override));
        }

        let model = model_id.to_ascii_lowercase();
        match ProviderFamily::parse(provider_id) {
            Some(family) => lookup(Some(family), &model),
            None => lookup(None, strip_vendor_prefix(&model)),
        }
    }

    /// Context window for the pair, or `None` when unknown.
    #[must_use]
    pub fn context_limit(&self, provider_id: &str, model_id: &str) -> Option<u32> {
        self.get(provider_id, model_id)
            .map(|resolved| resolved.limits().context_window())
    }

    /// Sets a custom limit for an exact `(provider, model)` pair.
    pub fn set_override(&mut self, provider_id: &str, model_id: &str, limits: ModelLimits) {
        self.overrides
            .insert((provider_id.to_string(), model_id.to_string()), limits);
    }

    pub fn remove_override(&mut self, provider_id: &str, model_id: &str) -> Option<ModelLimits> {
        self.overrides
            .remove(&(provider_id.to_string(), model_id.to_string()))
    }
}

fn lookup(family: Option<ProviderFamily>, model: &str) -> Option<ResolvedModelLimits> {
    KNOWN_MODELS
        .iter()
        .filter(|(f, _, _)| family.is_none_or(|family| family == *f))
        .find(|(_, prefix, _)| model.starts_with(prefix))
        .map(|(_, prefix, limits)| {
            ResolvedModelLimits::new(*limits, ModelLimitsSource::Prefix(prefix))
        })
}

fn strip_vendor_prefix(model: &str) -> &str {
    let after_slash = model.rsplit('/').next().unwrap_or(model);
    for vendor in ["anthropic.", "openai.", "google."] {
        if let Some(rest) = after_slash.strip_prefix(vendor) {
            return rest;
        }
    }
    after_slash
}
