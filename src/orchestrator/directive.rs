//! Routing directives returned by the decision capability.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::config::RoleConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DirectiveAction {
    #[serde(rename = "CONTINUE", alias = "continue")]
    Continue,
    #[serde(rename = "RESPOND", alias = "respond")]
    Respond,
    #[serde(rename = "ESCALATE", alias = "escalate")]
    Escalate,
}

impl fmt::Display for DirectiveAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DirectiveAction::Continue => "CONTINUE",
            DirectiveAction::Respond => "RESPOND",
            DirectiveAction::Escalate => "ESCALATE",
        };
        f.write_str(name)
    }
}

/// Wire shape before validation.
#[derive(Debug, Deserialize)]
struct RawDirective {
    action: DirectiveAction,
    #[serde(default)]
    target: Option<String>,
    #[serde(default)]
    instructions: String,
    confidence: f64,
    #[serde(default)]
    reasoning: String,
}

/// A validated directive. `target` is always a concrete capability name.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoutingDirective {
    pub action: DirectiveAction,
    pub target: String,
    pub instructions: String,
    pub confidence: f64,
    pub reasoning: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DirectiveError {
    Malformed(String),
    UnknownTarget(String),
    RoleMismatch {
        action: DirectiveAction,
        expected: String,
        got: String,
    },
}

impl fmt::Display for DirectiveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DirectiveError::Malformed(reason) => write!(f, "malformed directive: {}", reason),
            DirectiveError::UnknownTarget(target) => {
                write!(f, "directive targets unknown agent '{}'", target)
            }
            DirectiveError::RoleMismatch {
                action,
                expected,
                got,
            } => write!(f, "{} must target '{}', got '{}'", action, expected, got),
        }
    }
}

impl std::error::Error for DirectiveError {}

impl RoutingDirective {
    /// Validates a decision result. `is_agent` says whether a name is a
    /// registered agent that `CONTINUE` may target.
    pub fn parse(
        value: &Value,
        roles: &RoleConfig,
        is_agent: impl Fn(&str) -> bool,
    ) -> Result<Self, DirectiveError> {
        let raw: RawDirective = serde_json::from_value(value.clone())
            .map_err(|e| DirectiveError::Malformed(e.to_string()))?;

        if !raw.confidence.is_finite() || !(0.0..=1.0).contains(&raw.confidence) {
            return Err(DirectiveError::Malformed(format!(
                "confidence {} is outside [0, 1]",
                raw.confidence
            )));
        }

        let target = match raw.action {
            DirectiveAction::Continue => {
                let target = raw
                    .target
                    .filter(|t| !t.trim().is_empty())
                    .ok_or_else(|| DirectiveError::Malformed("CONTINUE without a target".to_string()))?;
                if !is_agent(&target) {
                    return Err(DirectiveError::UnknownTarget(target));
                }
                target
            }
            DirectiveAction::Respond => fixed_role(raw.action, raw.target, &roles.responder)?,
            DirectiveAction::Escalate => fixed_role(raw.action, raw.target, &roles.human)?,
        };

        Ok(Self {
            action: raw.action,
            target,
            instructions: raw.instructions,
            confidence: raw.confidence,
            reasoning: raw.reasoning,
        })
    }

    /// Forces a low-confidence directive to escalate, whatever it asked for.
    /// Returns whether the directive was overridden.
    pub fn gate(&mut self, threshold: f64, human: &str) -> bool {
        if self.action == DirectiveAction::Escalate || self.confidence >= threshold {
            return false;
        }
        self.reasoning = format!(
            "confidence {:.2} below threshold {:.2}; requested {} {}: {}",
            self.confidence, threshold, self.action, self.target, self.reasoning
        );
        self.action = DirectiveAction::Escalate;
        self.target = human.to_string();
        true
    }
}

fn fixed_role(
    action: DirectiveAction,
    target: Option<String>,
    role: &str,
) -> Result<String, DirectiveError> {
    match target {
        None => Ok(role.to_string()),
        Some(t) if t.trim().is_empty() || t == role => Ok(role.to_string()),
        Some(t) => Err(DirectiveError::RoleMismatch {
            action,
            expected: role.to_string(),
            got: t,
        }),
    }
}
