use anyhow::Context;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;

use switchboard_core::{
    config::PolicyConfig,
    types::{
        ChatCompletionRequest, PolicyDecision, PolicyOutcome, RuleAction, RuleKind, RuleMatch,
        RuleRef, BLOCKED_BY_FIREWALL,
    },
    Error, Result,
};

use crate::detectors::{compile, snippet, DestructiveMatcher, PiiPattern};
use crate::metrics::track_policy_match;

/// How a rule recognizes offending text.
#[derive(Debug, Clone)]
pub enum Matcher {
    Regex(Regex),
    Destructive(DestructiveMatcher),
}

impl Matcher {
    /// Evidence for the first match in `text`.
    pub fn find(&self, text: &str) -> Option<String> {
        match self {
            Self::Regex(re) => re.find(text).map(|m| snippet(m.as_str())),
            Self::Destructive(m) => m.find(text),
        }
    }
}

/// A compiled, immutable policy rule.
#[derive(Debug, Clone)]
pub struct PolicyRule {
    pub id: String,
    pub kind: RuleKind,
    pub matcher: Matcher,
    pub action: RuleAction,
    pub code: String,
    pub description: Option<String>,
}

impl PolicyRule {
    fn pii(id: &str, kind: RuleKind, pattern: PiiPattern, description: &str) -> Result<Self> {
        Ok(Self {
            id: id.to_string(),
            kind,
            matcher: Matcher::Regex(pattern.regex()?),
            action: RuleAction::Block,
            code: BLOCKED_BY_FIREWALL.to_string(),
            description: Some(description.to_string()),
        })
    }

    /// The built-in firewall: email, national ID, phone, destructive statements.
    pub fn builtin_set() -> Result<Vec<Self>> {
        Ok(vec![
            Self::pii("pii_email", RuleKind::PiiEmail, PiiPattern::Email, "Email address")?,
            Self::pii(
                "pii_national_id",
                RuleKind::PiiNationalId,
                PiiPattern::NationalId,
                "National ID number",
            )?,
            Self::pii("pii_phone", RuleKind::PiiPhone, PiiPattern::Phone, "Phone number")?,
            Self {
                id: "destructive_sql".to_string(),
                kind: RuleKind::DestructivePattern,
                matcher: Matcher::Destructive(DestructiveMatcher::new()?),
                action: RuleAction::Block,
                code: BLOCKED_BY_FIREWALL.to_string(),
                description: Some("Mutating statement without a narrowing clause".to_string()),
            },
        ])
    }

    pub fn rule_ref(&self) -> RuleRef {
        RuleRef {
            id: self.id.clone(),
            kind: self.kind,
            code: self.code.clone(),
        }
    }
}

/// A versioned rule document loaded from YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyFile {
    pub version: String,
    pub name: String,
    pub rules: Vec<RuleSpec>,
}

/// Uncompiled rule as written in a policy file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleSpec {
    pub id: String,
    #[serde(default = "default_kind")]
    pub kind: RuleKind,
    /// Regex; required for `custom`, optional override for the built-in kinds.
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default)]
    pub action: RuleAction,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

fn default_kind() -> RuleKind {
    RuleKind::Custom
}

impl RuleSpec {
    /// Compile into a [`PolicyRule`].
    pub fn compile(&self) -> Result<PolicyRule> {
        let matcher = match (&self.pattern, self.kind) {
            (Some(pattern), _) => Matcher::Regex(compile(pattern)?),
            (None, RuleKind::PiiEmail) => Matcher::Regex(PiiPattern::Email.regex()?),
            (None, RuleKind::PiiNationalId) => Matcher::Regex(PiiPattern::NationalId.regex()?),
            (None, RuleKind::PiiPhone) => Matcher::Regex(PiiPattern::Phone.regex()?),
            (None, RuleKind::DestructivePattern) => Matcher::Destructive(DestructiveMatcher::new()?),
            (None, RuleKind::Custom) => {
                return Err(Error::config(format!("custom rule '{}' has no pattern", self.id)));
            }
        };
        Ok(PolicyRule {
            id: self.id.clone(),
            kind: self.kind,
            matcher,
            action: self.action,
            code: self.code.clone().unwrap_or_else(|| BLOCKED_BY_FIREWALL.to_string()),
            description: self.description.clone(),
        })
    }
}

/// Evaluates message content against an immutable rule set.
pub struct PolicyEngine {
    rules: Vec<PolicyRule>,
    version: String,
}

impl PolicyEngine {
    /// Engine over an explicit rule list.
    pub fn new(rules: Vec<PolicyRule>) -> Self {
        Self {
            rules,
            version: "builtin".to_string(),
        }
    }

    /// Engine with only the built-in firewall rules.
    pub fn with_defaults() -> Result<Self> {
        Ok(Self::new(PolicyRule::builtin_set()?))
    }

    /// Load a policy file from YAML.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<PolicyFile> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read policy file: {:?}", path.as_ref()))?;
        let policy: PolicyFile =
            serde_yaml::from_str(&content).with_context(|| "Failed to parse policy YAML")?;
        Ok(policy)
    }

    /// Build the boot-time rule set: built-ins, merged file rules, then overrides.
    pub fn from_config(config: &PolicyConfig) -> Result<Self> {
        let mut engine = Self::with_defaults()?;

        if let Some(path) = &config.rules_path {
            let file = Self::load(path)?;
            tracing::info!(path = %path, version = %file.version, rules = file.rules.len(), "Loaded policy file");
            engine.merge(file)?;
        }

        for id in &config.disabled_rules {
            let before = engine.rules.len();
            engine.rules.retain(|r| &r.id != id);
            if engine.rules.len() == before {
                return Err(Error::config(format!("policy.disabled_rules: unknown rule '{}'", id)));
            }
        }

        for id in &config.shadow_rules {
            let rule = engine
                .rules
                .iter_mut()
                .find(|r| &r.id == id)
                .ok_or_else(|| Error::config(format!("policy.shadow_rules: unknown rule '{}'", id)))?;
            rule.action = RuleAction::ShadowLog;
        }

        if config.shadow_mode {
            tracing::warn!("Policy engine in shadow mode: no request will be blocked");
            for rule in &mut engine.rules {
                rule.action = RuleAction::ShadowLog;
            }
        }

        Ok(engine)
    }

    /// Merge a policy file into this engine (file wins on ID conflict).
    pub fn merge(&mut self, other: PolicyFile) -> Result<()> {
        for spec in other.rules {
            let rule = spec.compile()?;
            if let Some(existing) = self.rules.iter_mut().find(|r| r.id == rule.id) {
                *existing = rule;
            } else {
                self.rules.push(rule);
            }
        }
        self.version = other.version;
        Ok(())
    }

    pub fn rules(&self) -> &[PolicyRule] {
        &self.rules
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Evaluate a chat completion payload, message by message.
    pub fn evaluate_request(&self, request: &ChatCompletionRequest) -> PolicyDecision {
        self.evaluate(&request.message_texts())
    }

    /// Evaluate every rule against every text.
    ///
    /// A matching `Block` rule always wins; otherwise any match yields
    /// `ShadowAllow`. The outcome does not depend on rule order; the reported
    /// rule is the first deciding rule in declaration order.
    pub fn evaluate(&self, texts: &[String]) -> PolicyDecision {
        let matches: Vec<RuleMatch> = self
            .rules
            .iter()
            .filter_map(|rule| {
                texts
                    .iter()
                    .find_map(|text| rule.matcher.find(text))
                    .map(|evidence| RuleMatch {
                        rule: rule.rule_ref(),
                        action: rule.action,
                        evidence,
                    })
            })
            .collect();

        for m in &matches {
            track_policy_match(&m.rule.id, m.action);
        }

        let blocking = matches.iter().find(|m| m.action == RuleAction::Block);
        let (outcome, triggered) = match (blocking, matches.first()) {
            (Some(block), _) => (PolicyOutcome::Block, Some(block.rule.clone())),
            (None, Some(shadow)) => (PolicyOutcome::ShadowAllow, Some(shadow.rule.clone())),
            (None, None) => (PolicyOutcome::Allow, None),
        };

        tracing::debug!(
            outcome = outcome.as_str(),
            matched = matches.len(),
            policy_version = %self.version,
            "Policy evaluated"
        );

        PolicyDecision {
            outcome,
            triggered,
            matches,
        }
    }
}
