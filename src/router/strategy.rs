//! Model Routing
//!
//! Resolves a logical target (capability, alias or explicit model id) into the ordered list
//! of concrete models to try. Per-request overrides shadow the configured tables.

use crate::config::{RelayConfig, RequestOverrides};
use crate::error::{RelayError, Result};
use std::fmt;

/// A concrete model, optionally pinned to one provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelRoute {
    /// Provider pin from a `provider/model` id
    pub provider: Option<String>,

    pub model: String,
}

impl ModelRoute {
    /// Parse `model` or `provider/model`. The prefix only counts as a provider when
    /// `is_provider` recognizes it, so ids like `meta-llama/Llama-3-8b` pass through whole.
    pub fn parse(spec: &str, is_provider: impl Fn(&str) -> bool) -> Self {
        if let Some((prefix, rest)) = spec.split_once('/') {
            if !rest.is_empty() && is_provider(prefix) {
                return Self {
                    provider: Some(prefix.to_string()),
                    model: rest.to_string(),
                };
            }
        }

        Self {
            provider: None,
            model: spec.to_string(),
        }
    }

    pub fn accepts_provider(&self, provider_id: &str) -> bool {
        self.provider.as_deref().map_or(true, |p| p == provider_id)
    }
}

impl fmt::Display for ModelRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.provider {
            Some(provider) => write!(f, "{}/{}", provider, self.model),
            None => f.write_str(&self.model),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    Explicit,
    Alias,
    Capability,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTarget {
    /// The name the caller asked for
    pub target: String,
    pub kind: TargetKind,
    /// Models in preference order, deduplicated
    pub routes: Vec<ModelRoute>,
}

/// Resolve a target against config and per-request overrides
pub fn resolve(
    target: &str,
    config: &RelayConfig,
    overrides: &RequestOverrides,
    is_provider: impl Fn(&str) -> bool,
) -> Result<ResolvedTarget> {
    let target = target.trim();
    if target.is_empty() {
        return Err(RelayError::Config("Request target must not be empty".to_string()));
    }

    let alias = |name: &str| -> String {
        overrides
            .special_models
            .get(name)
            .or_else(|| config.special_models.get(name))
            .cloned()
            .unwrap_or_else(|| name.to_string())
    };

    let preferred = overrides
        .model_types
        .get(target)
        .or_else(|| config.model_types.get(target));
    let chain = overrides
        .fallback_chains
        .get(target)
        .or_else(|| config.fallback_chains.get(target));

    let (kind, specs) = if preferred.is_some() || chain.is_some() {
        let specs: Vec<String> = preferred
            .into_iter()
            .chain(chain.into_iter().flatten())
            .map(|name| alias(name.as_str()))
            .collect();
        (TargetKind::Capability, specs)
    } else if overrides.special_models.contains_key(target) || config.special_models.contains_key(target) {
        (TargetKind::Alias, vec![alias(target)])
    } else {
        (TargetKind::Explicit, vec![target.to_string()])
    };

    let mut routes: Vec<ModelRoute> = Vec::with_capacity(specs.len());
    for spec in specs {
        let route = ModelRoute::parse(&spec, &is_provider);
        if !routes.contains(&route) {
            routes.push(route);
        }
    }

    tracing::debug!(logical = target, ?kind, routes = routes.len(), "resolved target");
    Ok(ResolvedTarget {
        target: target.to_string(),
        kind,
        routes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn is_provider(p: &str) -> bool {
        matches!(p, "openai" | "anthropic")
    }

    fn config() -> RelayConfig {
        RelayConfig::default()
            .with_alias("fast", "gpt-4o-mini")
            .with_alias("smart", "anthropic/claude-sonnet")
            .with_chain("chat", ["smart", "gpt-4o", "gpt-4o-mini"])
    }

    #[test]
    fn test_parse_provider_pin() {
        let route = ModelRoute::parse("openai/gpt-4o", is_provider);
        assert_eq!(route.provider.as_deref(), Some("openai"));
        assert_eq!(route.model, "gpt-4o");
        assert_eq!(route.to_string(), "openai/gpt-4o");
        assert!(!route.accepts_provider("anthropic"));
    }

    #[test]
    fn test_parse_keeps_unknown_prefix() {
        let route = ModelRoute::parse("meta-llama/Llama-3-8b", is_provider);
        assert_eq!(route.provider, None);
        assert_eq!(route.model, "meta-llama/Llama-3-8b");
    }

    #[test]
    fn test_alias() {
        let resolved = resolve("fast", &config(), &RequestOverrides::default(), is_provider).unwrap();
        assert_eq!(resolved.kind, TargetKind::Alias);
        assert_eq!(resolved.routes, vec![ModelRoute::parse("gpt-4o-mini", is_provider)]);
    }

    #[test]
    fn test_capability_expands_chain_with_aliases() {
        let resolved = resolve("chat", &config(), &RequestOverrides::default(), is_provider).unwrap();
        assert_eq!(resolved.kind, TargetKind::Capability);
        let names: Vec<String> = resolved.routes.iter().map(|r| r.to_string()).collect();
        assert_eq!(names, vec!["anthropic/claude-sonnet", "gpt-4o", "gpt-4o-mini"]);
    }

    #[test]
    fn test_preferred_model_goes_first_without_duplicates() {
        let mut config = config();
        config.model_types.insert("chat".to_string(), "gpt-4o".to_string());

        let resolved = resolve("chat", &config, &RequestOverrides::default(), is_provider).unwrap();
        let names: Vec<String> = resolved.routes.iter().map(|r| r.to_string()).collect();
        assert_eq!(names, vec!["gpt-4o", "anthropic/claude-sonnet", "gpt-4o-mini"]);
    }

    #[test]
    fn test_overrides_take_precedence() {
        let mut overrides = RequestOverrides::default();
        overrides
            .fallback_chains
            .insert("chat".to_string(), vec!["o1".to_string()]);
        overrides
            .special_models
            .insert("fast".to_string(), "gpt-3.5-turbo".to_string());

        let chat = resolve("chat", &config(), &overrides, is_provider).unwrap();
        assert_eq!(chat.routes[0].model, "o1");
        assert_eq!(chat.routes.len(), 1);

        let fast = resolve("fast", &config(), &overrides, is_provider).unwrap();
        assert_eq!(fast.routes[0].model, "gpt-3.5-turbo");
    }

    #[test]
    fn test_explicit_and_empty() {
        let resolved = resolve("openai/o3", &config(), &RequestOverrides::default(), is_provider).unwrap();
        assert_eq!(resolved.kind, TargetKind::Explicit);
        assert_eq!(resolved.routes[0].provider.as_deref(), Some("openai"));

        assert!(resolve("  ", &config(), &RequestOverrides::default(), is_provider).is_err());
    }
}
