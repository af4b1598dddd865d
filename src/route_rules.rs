//! Model Route Rules
//!
//! Maps a bare, caller-supplied model string onto a fully-qualified
//! `provider,model` key using an ordered list of regex rules:
//! - Custom rules are evaluated before the built-in defaults
//! - Patterns are compiled once, case-insensitively, when the matcher is built
//! - Target templates may reference `$0` (whole match) and `$1..$N` (groups),
//!   always substituted with the caller's original casing
//!
//! The matcher is immutable after construction and can be shared freely.

use once_cell::sync::Lazy;
use regex::{Captures, Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

/// A single pattern rule.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RouteRule {
    /// Regex source, matched case-insensitively
    pub pattern: String,

    /// Target model name, optionally with `$0`/`$1..$N` placeholders
    #[serde(rename = "targetModel", alias = "target_model")]
    pub target_model: String,

    /// Provider to route to; falls back to the caller's default provider
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,

    /// Human-readable description, echoed back on a match
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl RouteRule {
    pub fn new(pattern: &str, target_model: &str, provider: Option<&str>) -> Self {
        Self {
            pattern: pattern.to_string(),
            target_model: target_model.to_string(),
            provider: provider.map(str::to_string),
            description: None,
        }
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }
}

/// Rules shipped with the binary, tried after any configured rules.
pub static DEFAULT_ROUTE_RULES: Lazy<Vec<RouteRule>> = Lazy::new(|| {
    vec![
        RouteRule::new(
            "claude-haiku|haiku",
            "anthropic/claude-haiku-4.5",
            Some("openrouter"),
        )
        .with_description("Claude Haiku family"),
        RouteRule::new(
            "claude-sonnet|sonnet",
            "anthropic/claude-sonnet-4.5",
            Some("openrouter"),
        )
        .with_description("Claude Sonnet family"),
        RouteRule::new(
            "claude-opus|opus",
            "anthropic/claude-opus-4.1",
            Some("openrouter"),
        )
        .with_description("Claude Opus family"),
    ]
});

/// Successful rule resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteMatch {
    /// Fully-qualified `provider,model` key
    pub model: String,
    pub description: Option<String>,
}

#[derive(Debug)]
struct CompiledRule {
    rule: RouteRule,
    regex: Regex,
    has_placeholders: bool,
}

/// Ordered, pre-compiled rule list.
#[derive(Debug)]
pub struct RouteRuleMatcher {
    rules: Vec<CompiledRule>,
}

impl RouteRuleMatcher {
    /// Custom rules first, then [`DEFAULT_ROUTE_RULES`].
    pub fn new(custom: Vec<RouteRule>) -> Self {
        let mut all = custom;
        all.extend(DEFAULT_ROUTE_RULES.iter().cloned());
        Self::with_rules(all)
    }

    /// Exactly the given rules, in order. Rules whose pattern fails to compile
    /// are dropped with a warning; the remaining rules keep their order.
    pub fn with_rules(rules: Vec<RouteRule>) -> Self {
        let mut compiled = Vec::with_capacity(rules.len());
        for rule in rules {
            match RegexBuilder::new(&rule.pattern)
                .case_insensitive(true)
                .build()
            {
                Ok(regex) => {
                    let has_placeholders = rule.target_model.contains('$');
                    compiled.push(CompiledRule {
                        rule,
                        regex,
                        has_placeholders,
                    });
                }
                Err(e) => {
                    tracing::warn!(
                        "Invalid regex pattern in route rule: {} - {}",
                        rule.pattern,
                        e
                    );
                }
            }
        }
        Self { rules: compiled }
    }

    pub fn rules(&self) -> impl Iterator<Item = &RouteRule> {
        self.rules.iter().map(|c| &c.rule)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Resolve a raw model name. Returns `None` when no rule matches or every
    /// matching rule lacks a provider.
    pub fn resolve(&self, raw_model: &str, default_provider: Option<&str>) -> Option<RouteMatch> {
        if raw_model.is_empty() {
            return None;
        }
        let lower = raw_model.to_lowercase();

        for compiled in &self.rules {
            let Some(lower_caps) = compiled.regex.captures(&lower) else {
                continue;
            };

            let Some(provider) = compiled
                .rule
                .provider
                .as_deref()
                .or(default_provider)
                .filter(|p| !p.is_empty())
            else {
                continue;
            };

            let target = if compiled.has_placeholders {
                match compiled.regex.captures(raw_model) {
                    Some(caps) => render_target(&compiled.rule.target_model, &caps, raw_model),
                    None => render_target(&compiled.rule.target_model, &lower_caps, &lower),
                }
            } else {
                compiled.rule.target_model.clone()
            };

            return Some(RouteMatch {
                model: format!("{},{}", provider, target),
                description: compiled.rule.description.clone(),
            });
        }

        None
    }
}

impl Default for RouteRuleMatcher {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

/// Substitute `$0` and `$N` in `template`. A lone `$0` whose match is shorter
/// than the input, wherever it sits, expands to the entire input.
fn render_target(template: &str, caps: &Captures<'_>, input: &str) -> String {
    let matched = caps.get(0).map_or(0, |m| m.len());
    if template.trim() == "$0" && matched < input.len() {
        return input.to_string();
    }

    let mut out = String::with_capacity(template.len() + input.len());
    let mut rest = template;
    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];
        let digits = after.bytes().take_while(|b| b.is_ascii_digit()).count();
        if digits == 0 {
            out.push('$');
            rest = after;
            continue;
        }
        let index: usize = after[..digits].parse().unwrap_or(usize::MAX);
        if index < caps.len() {
            out.push_str(caps.get(index).map(|m| m.as_str()).unwrap_or(""));
        } else {
            out.push('$');
            out.push_str(&after[..digits]);
        }
        rest = &after[digits..];
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_target_with_rule_provider() {
        let matcher = RouteRuleMatcher::with_rules(vec![RouteRule::new(
            "sonnet",
            "anthropic/claude-sonnet-4.5",
            Some("openrouter"),
        )]);
        let hit = matcher.resolve("claude-3-Sonnet-Special", None).unwrap();
        assert_eq!(hit.model, "openrouter,anthropic/claude-sonnet-4.5");
    }

    #[test]
    fn capture_groups_keep_original_case() {
        let matcher =
            RouteRuleMatcher::with_rules(vec![RouteRule::new("(foo)-(bar)", "$1/$2", Some("p"))]);
        let hit = matcher.resolve("FOO-BAR", None).unwrap();
        assert_eq!(hit.model, "p,FOO/BAR");
    }

    #[test]
    fn lone_whole_match_on_prefix_keeps_suffix() {
        let matcher = RouteRuleMatcher::with_rules(vec![RouteRule::new(
            "^gpt-4o",
            "$0",
            Some("openai"),
        )]);
        let hit = matcher.resolve("GPT-4o-2024-08-06", None).unwrap();
        assert_eq!(hit.model, "openai,GPT-4o-2024-08-06");
    }

    #[test]
    fn lone_whole_match_mid_input_keeps_full_name() {
        let matcher = RouteRuleMatcher::with_rules(vec![RouteRule::new(
            "sonnet",
            "$0",
            Some("openrouter"),
        )]);
        let hit = matcher.resolve("claude-Sonnet-4", None).unwrap();
        assert_eq!(hit.model, "openrouter,claude-Sonnet-4");
    }

    #[test]
    fn whole_match_inside_template_uses_span_only() {
        let matcher = RouteRuleMatcher::with_rules(vec![RouteRule::new(
            "^gpt-4o",
            "openai/$0",
            Some("openrouter"),
        )]);
        let hit = matcher.resolve("GPT-4o-mini", None).unwrap();
        assert_eq!(hit.model, "openrouter,openai/GPT-4o");
    }

    #[test]
    fn unmatched_optional_group_is_empty() {
        let matcher = RouteRuleMatcher::with_rules(vec![RouteRule::new(
            "^(qwen)(-max)?",
            "$1$2-latest",
            Some("dashscope"),
        )]);
        let hit = matcher.resolve("Qwen", None).unwrap();
        assert_eq!(hit.model, "dashscope,Qwen-latest");
    }

    #[test]
    fn invalid_pattern_is_skipped() {
        let matcher = RouteRuleMatcher::with_rules(vec![
            RouteRule::new("(unclosed", "broken", Some("p")),
            RouteRule::new("haiku", "anthropic/claude-haiku-4.5", Some("openrouter")),
        ]);
        assert_eq!(matcher.len(), 1);
        let hit = matcher.resolve("claude-haiku-3", None).unwrap();
        assert_eq!(hit.model, "openrouter,anthropic/claude-haiku-4.5");
    }

    #[test]
    fn default_provider_fills_in_and_missing_provider_falls_through() {
        let rules = vec![
            RouteRule::new("mistral", "mistral-large", None),
            RouteRule::new("mistral|small", "mistral-small", Some("mistral")),
        ];
        let matcher = RouteRuleMatcher::with_rules(rules);

        let with_default = matcher.resolve("mistral", Some("local")).unwrap();
        assert_eq!(with_default.model, "local,mistral-large");

        let without_default = matcher.resolve("mistral", None).unwrap();
        assert_eq!(without_default.model, "mistral,mistral-small");
    }

    #[test]
    fn no_match_returns_none() {
        let matcher = RouteRuleMatcher::default();
        assert!(matcher.resolve("gpt-4o", None).is_none());
        assert!(matcher.resolve("", Some("openai")).is_none());
    }

    #[test]
    fn custom_rules_take_precedence_over_defaults() {
        let matcher = RouteRuleMatcher::new(vec![RouteRule::new(
            "sonnet",
            "claude-sonnet-4-5",
            Some("anthropic"),
        )
        .with_description("direct anthropic")]);
        let hit = matcher.resolve("sonnet", None).unwrap();
        assert_eq!(hit.model, "anthropic,claude-sonnet-4-5");
        assert_eq!(hit.description.as_deref(), Some("direct anthropic"));
        assert_eq!(matcher.len(), 1 + DEFAULT_ROUTE_RULES.len());
    }

    #[test]
    fn out_of_range_placeholder_is_literal() {
        let matcher =
            RouteRuleMatcher::with_rules(vec![RouteRule::new("(a)", "$1-$5-$", Some("p"))]);
        let hit = matcher.resolve("A", None).unwrap();
        assert_eq!(hit.model, "p,A-$5-$");
    }

    #[test]
    fn rules_deserialize_from_config_shape() {
        let rule: RouteRule = serde_json::from_value(serde_json::json!({
            "pattern": "opus",
            "targetModel": "anthropic/claude-opus-4.1",
            "provider": "openrouter",
            "description": "opus"
        }))
        .unwrap();
        assert_eq!(rule.target_model, "anthropic/claude-opus-4.1");
        assert_eq!(rule.provider.as_deref(), Some("openrouter"));
    }
}
