//! Policy statements and the evaluation engine.
//!
//! A policy is an ordered list of statements; the order is kept for
//! operators reading it back but carries no meaning during evaluation.
//! Evaluation is pure: given the effective statements (the union over all
//! policies of all groups a user belongs to), a module name, and a command
//! path, it returns Allow or Deny with the statement that decided it.
//!
//! Deny always wins, and the absence of any matching statement is a Deny.

use serde::{Deserialize, Serialize};

use crate::pattern::{CommandPath, ResourcePattern};

pub const MODULE_WILDCARD: &str = "*";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Effect {
    Allow,
    Deny,
}

/// One Allow/Deny statement over (Module, Resources).
///
/// Field names are part of the persisted document contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statement {
    #[serde(rename = "Effect")]
    pub effect: Effect,
    /// Module name, or `*` for every module.
    #[serde(rename = "Module")]
    pub module: String,
    #[serde(rename = "Resources")]
    pub resources: Vec<ResourcePattern>,
    #[serde(rename = "Description", skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Statement {
    fn covers_module(&self, module: &str) -> bool {
        self.module == MODULE_WILDCARD || self.module == module
    }

    fn covers(&self, module: &str, path: &CommandPath) -> bool {
        self.covers_module(module) && self.resources.iter().any(|p| p.matches(path))
    }
}

/// Outcome of evaluating the effective statements for one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision<'a> {
    Allow { matched: &'a Statement },
    /// `matched` is `None` for the default-deny case.
    Deny { matched: Option<&'a Statement> },
}

impl Decision<'_> {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow { .. })
    }

    pub fn matched(&self) -> Option<&Statement> {
        match self {
            Decision::Allow { matched } => Some(matched),
            Decision::Deny { matched } => *matched,
        }
    }
}

/// Evaluate `statements` against one requested command.
///
/// 1. keep statements whose Module is the requested module or `*`,
/// 2. of those, keep statements with at least one matching resource pattern,
/// 3. any Deny among them wins, then any Allow, otherwise default Deny.
pub fn evaluate<'a>(
    statements: impl IntoIterator<Item = &'a Statement>,
    module: &str,
    path: &CommandPath,
) -> Decision<'a> {
    let mut allowed: Option<&Statement> = None;
    for statement in statements {
        if !statement.covers(module, path) {
            continue;
        }
        match statement.effect {
            Effect::Deny => return Decision::Deny { matched: Some(statement) },
            Effect::Allow => allowed = allowed.or(Some(statement)),
        }
    }
    match allowed {
        Some(matched) => Decision::Allow { matched },
        None => Decision::Deny { matched: None },
    }
}

/// Owned evaluation result for the offline simulator and API responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationOutcome {
    pub effect: Effect,
    pub matched_statement: Option<Statement>,
    pub reason: String,
}

/// Run the evaluation and package the outcome for display, so operators can
/// verify a policy change before rolling it out.
pub fn simulate(statements: &[Statement], module: &str, path: &CommandPath) -> SimulationOutcome {
    match evaluate(statements, module, path) {
        Decision::Allow { matched } => SimulationOutcome {
            effect: Effect::Allow,
            matched_statement: Some(matched.clone()),
            reason: format!("allowed for {module}:{path} by a matching Allow statement"),
        },
        Decision::Deny { matched: Some(matched) } => SimulationOutcome {
            effect: Effect::Deny,
            matched_statement: Some(matched.clone()),
            reason: format!("denied for {module}:{path} by a matching Deny statement"),
        },
        Decision::Deny { matched: None } => SimulationOutcome {
            effect: Effect::Deny,
            matched_statement: None,
            reason: format!("no statement matches {module}:{path}, default deny"),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn statement(effect: Effect, module: &str, resources: &[&str]) -> Statement {
        Statement {
            effect,
            module: module.to_string(),
            resources: resources.iter().map(|r| r.parse().unwrap()).collect(),
            description: None,
        }
    }

    fn path(s: &str) -> CommandPath {
        CommandPath::parse(s).unwrap()
    }

    #[test]
    fn allow_statement_allows() {
        let statements = [statement(Effect::Allow, "m3admin", &["aws"])];
        assert!(evaluate(&statements, "m3admin", &path("aws")).is_allowed());
    }

    #[test]
    fn unmatched_command_is_default_deny() {
        let statements = [statement(Effect::Allow, "m3admin", &["aws"])];
        let decision = evaluate(&statements, "m3admin", &path("azure"));
        assert!(!decision.is_allowed());
        assert!(decision.matched().is_none());
    }

    #[test]
    fn other_module_is_default_deny() {
        let statements = [statement(Effect::Allow, "m3admin", &["*"])];
        assert!(!evaluate(&statements, "billing", &path("aws")).is_allowed());
    }

    #[test]
    fn module_wildcard_spans_modules() {
        let statements = [statement(Effect::Allow, "*", &["*"])];
        assert!(evaluate(&statements, "m3admin", &path("aws")).is_allowed());
        assert!(evaluate(&statements, "billing", &path("tenant/describe")).is_allowed());
    }

    #[test]
    fn deny_wins_over_allow() {
        let statements = [
            statement(Effect::Allow, "m3admin", &["aws"]),
            statement(Effect::Deny, "m3admin", &["aws"]),
        ];
        let decision = evaluate(&statements, "m3admin", &path("aws"));
        assert!(!decision.is_allowed());
        assert_eq!(decision.matched().unwrap().effect, Effect::Deny);
    }

    #[test]
    fn deny_wins_regardless_of_order() {
        let statements = [
            statement(Effect::Deny, "m3admin", &["aws"]),
            statement(Effect::Allow, "m3admin", &["aws"]),
        ];
        assert!(!evaluate(&statements, "m3admin", &path("aws")).is_allowed());
    }

    #[test]
    fn adding_allow_never_flips_an_existing_deny() {
        let mut statements = vec![statement(Effect::Deny, "m3admin", &["tenant:*"])];
        assert!(!evaluate(&statements, "m3admin", &path("tenant/describe")).is_allowed());
        statements.push(statement(Effect::Allow, "m3admin", &["tenant:describe"]));
        assert!(!evaluate(&statements, "m3admin", &path("tenant/describe")).is_allowed());
    }

    #[test]
    fn narrow_deny_leaves_siblings_allowed() {
        let statements = [
            statement(Effect::Allow, "m3admin", &["tenant:*"]),
            statement(Effect::Deny, "m3admin", &["tenant:delete"]),
        ];
        assert!(evaluate(&statements, "m3admin", &path("tenant/describe")).is_allowed());
        assert!(!evaluate(&statements, "m3admin", &path("tenant/delete")).is_allowed());
    }

    #[test]
    fn simulate_reports_matched_statement() {
        let statements = [statement(Effect::Deny, "m3admin", &["aws"])];
        let outcome = simulate(&statements, "m3admin", &path("aws"));
        assert_eq!(outcome.effect, Effect::Deny);
        assert!(outcome.matched_statement.is_some());

        let outcome = simulate(&statements, "m3admin", &path("azure"));
        assert_eq!(outcome.effect, Effect::Deny);
        assert!(outcome.matched_statement.is_none());
        assert!(outcome.reason.contains("default deny"));
    }

    #[test]
    fn statement_json_shape_is_stable() {
        let parsed: Statement = serde_json::from_value(serde_json::json!({
            "Description": "Admin policy",
            "Module": "*",
            "Effect": "Allow",
            "Resources": ["*"]
        }))
        .unwrap();
        assert_eq!(parsed.effect, Effect::Allow);
        assert_eq!(parsed.module, "*");
        let round_tripped = serde_json::to_value(&parsed).unwrap();
        assert_eq!(round_tripped["Effect"], "Allow");
        assert_eq!(round_tripped["Resources"][0], "*");
    }
}
