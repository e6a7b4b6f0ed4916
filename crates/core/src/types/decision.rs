use serde::{Deserialize, Serialize};

// =============================================================================
// Policy Types
// =============================================================================

/// Reporting code used by the built-in firewall rules.
pub const BLOCKED_BY_FIREWALL: &str = "BLOCKED_BY_FIREWALL";

/// Category of a policy rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    PiiEmail,
    PiiNationalId,
    PiiPhone,
    DestructivePattern,
    Custom,
}

impl RuleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PiiEmail => "pii_email",
            Self::PiiNationalId => "pii_national_id",
            Self::PiiPhone => "pii_phone",
            Self::DestructivePattern => "destructive_pattern",
            Self::Custom => "custom",
        }
    }
}

/// What a rule does when it matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    #[default]
    Block,
    ShadowLog,
}

/// Final verdict of the policy engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyOutcome {
    Allow,
    Block,
    ShadowAllow,
}

impl PolicyOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Block => "block",
            Self::ShadowAllow => "shadow_allow",
        }
    }
}

/// Identifies a rule inside a decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleRef {
    pub id: String,
    pub kind: RuleKind,
    pub code: String,
}

/// One rule that matched the payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleMatch {
    pub rule: RuleRef,
    pub action: RuleAction,
    /// Truncated matched text. Never returned to a blocked caller.
    pub evidence: String,
}

/// Result of evaluating every rule against a payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyDecision {
    pub outcome: PolicyOutcome,
    /// Rule that decided the outcome, if any rule matched.
    pub triggered: Option<RuleRef>,
    /// Every matching rule, in rule-set order.
    pub matches: Vec<RuleMatch>,
}

impl PolicyDecision {
    pub fn allow() -> Self {
        Self {
            outcome: PolicyOutcome::Allow,
            triggered: None,
            matches: Vec::new(),
        }
    }

    pub fn is_blocked(&self) -> bool {
        self.outcome == PolicyOutcome::Block
    }

    /// Evidence of the deciding rule, for shadow logging.
    pub fn evidence(&self) -> Option<&str> {
        let triggered = self.triggered.as_ref()?;
        self.matches
            .iter()
            .find(|m| &m.rule == triggered)
            .map(|m| m.evidence.as_str())
    }

    pub fn matched_rule_ids(&self) -> Vec<String> {
        self.matches.iter().map(|m| m.rule.id.clone()).collect()
    }
}
