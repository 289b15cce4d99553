//! Confirmation policy: which proposed tool calls need a human.
//!
//! The table is ordered and the first matching rule wins. A tool that the
//! target system itself flags with `requires_confirmation` always matches,
//! as `destructive` unless a rule names a more specific kind.

use globset::{GlobBuilder, GlobMatcher};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::error;

use crate::model::ConfirmationKind;
use crate::transport::ToolCapability;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyRule {
    /// Tool name glob, case-insensitive (`*`, `?` and `[...]` classes).
    pub tool: String,
    pub kind: ConfirmationKind,
    /// Only match when this argument has this exact value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub argument: Option<ArgumentMatch>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArgumentMatch {
    pub key: String,
    pub equals: Value,
}

impl PolicyRule {
    pub fn new(tool: impl Into<String>, kind: ConfirmationKind) -> Self {
        Self {
            tool: tool.into(),
            kind,
            argument: None,
        }
    }

    /// Compile the tool pattern.
    pub fn glob(&self) -> Result<GlobMatcher, globset::Error> {
        Ok(GlobBuilder::new(&self.tool)
            .case_insensitive(true)
            .build()?
            .compile_matcher())
    }
}

/// Rules shipped when the configuration does not provide its own table.
pub fn default_rules() -> Vec<PolicyRule> {
    let destructive = [
        "delete*", "drop*", "remove*", "destroy*", "purge*", "reset*", "format*", "wipe*",
    ];
    let disruptive = ["shutdown*", "reboot*", "restart*", "kill*"];

    destructive
        .into_iter()
        .map(|p| PolicyRule::new(p, ConfirmationKind::Destructive))
        .chain(
            disruptive
                .into_iter()
                .map(|p| PolicyRule::new(p, ConfirmationKind::Irreversible)),
        )
        .collect()
}

#[derive(Debug, Clone)]
struct CompiledRule {
    rule: PolicyRule,
    matcher: GlobMatcher,
}

impl CompiledRule {
    fn matches(&self, tool: &str, arguments: &Value) -> bool {
        if !self.matcher.is_match(tool) {
            return false;
        }
        match &self.rule.argument {
            Some(arg) => arguments.get(&arg.key) == Some(&arg.equals),
            None => true,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConfirmationPolicy {
    rules: Vec<CompiledRule>,
}

impl ConfirmationPolicy {
    /// Compile the table once. Rules whose pattern does not parse are
    /// dropped; `EngineConfig::validate` rejects them before this point.
    pub fn new(rules: Vec<PolicyRule>) -> Self {
        let rules = rules
            .into_iter()
            .filter_map(|rule| match rule.glob() {
                Ok(matcher) => Some(CompiledRule { rule, matcher }),
                Err(e) => {
                    error!(pattern = %rule.tool, error = %e, "dropping invalid policy pattern");
                    None
                }
            })
            .collect();
        Self { rules }
    }

    /// Return the confirmation kind required for this call, if any.
    pub fn evaluate(
        &self,
        tool: &str,
        arguments: &Value,
        capability: Option<&ToolCapability>,
    ) -> Option<ConfirmationKind> {
        if let Some(compiled) = self.rules.iter().find(|r| r.matches(tool, arguments)) {
            return Some(compiled.rule.kind);
        }
        match capability {
            Some(cap) if cap.requires_confirmation => Some(ConfirmationKind::Destructive),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cap(name: &str, requires_confirmation: bool) -> ToolCapability {
        ToolCapability {
            name: name.to_string(),
            description: String::new(),
            input_schema: json!({"type": "object"}),
            requires_confirmation,
        }
    }

    #[test]
    fn test_tool_patterns() {
        let gated = |pattern: &str, tool: &str| {
            ConfirmationPolicy::new(vec![PolicyRule::new(pattern, ConfirmationKind::Destructive)])
                .evaluate(tool, &json!({}), None)
                .is_some()
        };
        assert!(gated("delete*", "delete_user"));
        assert!(gated("DELETE*", "delete"));
        assert!(gated("*_user", "delete_user"));
        assert!(gated("a*b*c", "aXXbYYc"));
        assert!(gated("drop_?", "drop_x"));
        assert!(!gated("drop_?", "drop_xy"));
        assert!(gated("[rw]ipe*", "wipe_disk"));
        assert!(gated("exact", "exact"));
        assert!(!gated("exact", "exactly"));
        assert!(!gated("delete*", "undelete"));
        assert!(gated("*", ""));
    }

    #[test]
    fn test_invalid_pattern_is_dropped() {
        assert!(PolicyRule::new("delete[", ConfirmationKind::Destructive).glob().is_err());

        let policy = ConfirmationPolicy::new(vec![
            PolicyRule::new("delete[", ConfirmationKind::Destructive),
            PolicyRule::new("drop*", ConfirmationKind::Destructive),
        ]);
        assert_eq!(policy.evaluate("delete[", &json!({}), None), None);
        assert_eq!(
            policy.evaluate("drop_table", &json!({}), None),
            Some(ConfirmationKind::Destructive)
        );
    }

    #[test]
    fn test_default_rules_gate_destructive_verbs() {
        let policy = ConfirmationPolicy::new(default_rules());
        assert_eq!(
            policy.evaluate("delete_record", &json!({}), None),
            Some(ConfirmationKind::Destructive)
        );
        assert_eq!(
            policy.evaluate("reboot_device", &json!({}), None),
            Some(ConfirmationKind::Irreversible)
        );
        assert_eq!(policy.evaluate("read_status", &json!({}), None), None);
    }

    #[test]
    fn test_argument_condition() {
        let policy = ConfirmationPolicy::new(vec![PolicyRule {
            tool: "set_config".into(),
            kind: ConfirmationKind::Privileged,
            argument: Some(ArgumentMatch {
                key: "scope".into(),
                equals: json!("global"),
            }),
        }]);

        assert_eq!(
            policy.evaluate("set_config", &json!({"scope": "global"}), None),
            Some(ConfirmationKind::Privileged)
        );
        assert_eq!(policy.evaluate("set_config", &json!({"scope": "local"}), None), None);
        assert_eq!(policy.evaluate("set_config", &json!({}), None), None);
    }

    #[test]
    fn test_capability_flag_forces_confirmation() {
        let policy = ConfirmationPolicy::new(Vec::new());
        let flagged = cap("rotate_keys", true);
        let plain = cap("rotate_keys", false);

        assert_eq!(
            policy.evaluate("rotate_keys", &json!({}), Some(&flagged)),
            Some(ConfirmationKind::Destructive)
        );
        assert_eq!(policy.evaluate("rotate_keys", &json!({}), Some(&plain)), None);
    }

    #[test]
    fn test_first_matching_rule_wins() {
        let policy = ConfirmationPolicy::new(vec![
            PolicyRule::new("delete_cache", ConfirmationKind::ExternalEffect),
            PolicyRule::new("delete*", ConfirmationKind::Destructive),
        ]);
        assert_eq!(
            policy.evaluate("delete_cache", &json!({}), None),
            Some(ConfirmationKind::ExternalEffect)
        );
    }
}
