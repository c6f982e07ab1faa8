//! Built-in merge policies and the name registry.

use std::collections::BTreeMap;

use maestro_state::MergePolicyDefinition;

use super::version::AssetVersion;
use super::{
    MergePolicy, MergePolicyContext, MergePolicyEvaluationResult, MergePolicyEvaluationResults,
    MergePolicyEvaluationStatus as Status, PolicyConfigError,
};
use crate::remote::{CheckState, ReviewState, MERGE_POLICY_CHECK_PREFIX};

pub const ALL_CHECKS_SUCCESSFUL: &str = "AllChecksSuccessful";
pub const STANDARD: &str = "Standard";
pub const NO_EXTRA_COMMITS: &str = "NoExtraCommits";
pub const NO_REQUESTED_CHANGES: &str = "NoRequestedChanges";
pub const DONT_AUTOMERGE_DOWNGRADES: &str = "DontAutomergeDowngrades";
pub const VALIDATE_COHERENCY: &str = "ValidateCoherency";

pub const IGNORE_CHECKS_PROPERTY: &str = "ignoreChecks";

// ---------------------------------------------------------------------------
// AllChecksSuccessful
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllChecksSuccessfulPolicy {
    pub ignore_checks: Vec<String>,
}

impl AllChecksSuccessfulPolicy {
    fn is_ignored(&self, name: &str) -> bool {
        name.starts_with(MERGE_POLICY_CHECK_PREFIX)
            || self.ignore_checks.iter().any(|i| i.eq_ignore_ascii_case(name))
    }
}

impl MergePolicy for AllChecksSuccessfulPolicy {
    fn name(&self) -> &'static str {
        ALL_CHECKS_SUCCESSFUL
    }

    fn display_name(&self) -> &'static str {
        "All Checks Successful"
    }

    fn evaluate(&self, context: &MergePolicyContext) -> MergePolicyEvaluationResult {
        let relevant: Vec<_> = context
            .checks
            .iter()
            .filter(|c| !c.is_maestro_merge_policy && !self.is_ignored(&c.name))
            .collect();

        if relevant.is_empty() {
            return self.result(Status::TransientFailure, "No checks", "No un-ignored checks.");
        }

        let failed: Vec<&str> = relevant
            .iter()
            .filter(|c| matches!(c.status, CheckState::Failure | CheckState::Error))
            .map(|c| c.name.as_str())
            .collect();
        if !failed.is_empty() {
            return self.result(
                Status::DecisiveFailure,
                "Unsuccessful checks",
                format!("Unsuccessful checks: {}", failed.join(", ")),
            );
        }

        let pending: Vec<&str> = relevant
            .iter()
            .filter(|c| c.status == CheckState::Pending)
            .map(|c| c.name.as_str())
            .collect();
        if !pending.is_empty() {
            return self.result(
                Status::Pending,
                "Waiting for checks",
                format!("Waiting on checks: {}", pending.join(", ")),
            );
        }

        self.result(Status::Success, "All checks successful", "All checks successful.")
    }
}

// ---------------------------------------------------------------------------
// NoRequestedChanges
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NoRequestedChangesPolicy;

impl MergePolicy for NoRequestedChangesPolicy {
    fn name(&self) -> &'static str {
        NO_REQUESTED_CHANGES
    }

    fn display_name(&self) -> &'static str {
        "No Requested Changes"
    }

    fn evaluate(&self, context: &MergePolicyContext) -> MergePolicyEvaluationResult {
        let blocking: Vec<&str> = context
            .reviews
            .iter()
            .filter(|r| matches!(r.state, ReviewState::ChangesRequested | ReviewState::Rejected))
            .map(|r| r.reviewer.as_str())
            .collect();
        if blocking.is_empty() {
            self.result(Status::Success, "No requested changes", "No changes requested.")
        } else {
            self.result(
                Status::DecisiveFailure,
                "Changes requested",
                format!("Changes requested by: {}", blocking.join(", ")),
            )
        }
    }
}

// ---------------------------------------------------------------------------
// NoExtraCommits
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NoExtraCommitsPolicy;

impl MergePolicy for NoExtraCommitsPolicy {
    fn name(&self) -> &'static str {
        NO_EXTRA_COMMITS
    }

    fn display_name(&self) -> &'static str {
        "No Extra Commits"
    }

    fn evaluate(&self, context: &MergePolicyContext) -> MergePolicyEvaluationResult {
        let extra: Vec<&str> = context
            .commits
            .iter()
            .filter(|c| !c.author.eq_ignore_ascii_case(&context.bot_author))
            .map(|c| c.sha.as_str())
            .collect();
        if extra.is_empty() {
            self.result(Status::Success, "No extra commits", "No extra commits.")
        } else {
            self.result(
                Status::DecisiveFailure,
                "Extra commits",
                format!("Commits not authored by {}: {}", context.bot_author, extra.join(", ")),
            )
        }
    }
}

// ---------------------------------------------------------------------------
// DontAutomergeDowngrades
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DontAutomergeDowngradesPolicy;

impl MergePolicy for DontAutomergeDowngradesPolicy {
    fn name(&self) -> &'static str {
        DONT_AUTOMERGE_DOWNGRADES
    }

    fn display_name(&self) -> &'static str {
        "Do not automerge downgrades"
    }

    fn evaluate(&self, context: &MergePolicyContext) -> MergePolicyEvaluationResult {
        let mut problems = Vec::new();
        for u in &context.updates {
            match (
                AssetVersion::parse(&u.from_version),
                AssetVersion::parse(&u.to_version),
            ) {
                (Some(from), Some(to)) if to < from => problems.push(format!(
                    "{} is downgraded from {} to {}",
                    u.dependency_name, u.from_version, u.to_version
                )),
                (Some(_), Some(_)) => {}
                _ => problems.push(format!(
                    "{} cannot be compared ({} -> {})",
                    u.dependency_name, u.from_version, u.to_version
                )),
            }
        }
        if problems.is_empty() {
            self.result(Status::Success, "No version downgrade detected", "No downgrades.")
        } else {
            self.result(Status::DecisiveFailure, "Version downgrade detected", problems.join("\n"))
        }
    }
}

// ---------------------------------------------------------------------------
// ValidateCoherency
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ValidateCoherencyPolicy;

impl MergePolicy for ValidateCoherencyPolicy {
    fn name(&self) -> &'static str {
        VALIDATE_COHERENCY
    }

    fn display_name(&self) -> &'static str {
        "Validate Coherency"
    }

    fn evaluate(&self, context: &MergePolicyContext) -> MergePolicyEvaluationResult {
        if context.coherency_check_successful != Some(false) && context.coherency_errors.is_empty() {
            return self.result(Status::Success, "Coherency check OK", "No coherency conflicts.");
        }
        let mut message = String::from("Coherency update failed for the following dependencies:\n");
        for e in &context.coherency_errors {
            message.push_str(&format!("- {}: {}\n", e.dependency, e.error));
            for s in &e.potential_solutions {
                message.push_str(&format!("  - {s}\n"));
            }
        }
        self.result(Status::DecisiveFailure, "Coherency check failed", message)
    }
}

// ---------------------------------------------------------------------------
// Standard
// ---------------------------------------------------------------------------

/// `AllChecksSuccessful` + `NoRequestedChanges` + `DontAutomergeDowngrades`,
/// reported as one result carrying the worst status.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StandardPolicy {
    pub checks: AllChecksSuccessfulPolicy,
}

fn severity(status: Status) -> u8 {
    match status {
        Status::Success => 0,
        Status::Pending => 1,
        Status::TransientFailure => 2,
        Status::DecisiveFailure => 3,
    }
}

impl MergePolicy for StandardPolicy {
    fn name(&self) -> &'static str {
        STANDARD
    }

    fn display_name(&self) -> &'static str {
        "Standard"
    }

    fn evaluate(&self, context: &MergePolicyContext) -> MergePolicyEvaluationResult {
        let parts = [
            self.checks.evaluate(context),
            NoRequestedChangesPolicy.evaluate(context),
            DontAutomergeDowngradesPolicy.evaluate(context),
        ];
        let worst = parts.iter().map(|p| p.status).max_by_key(|s| severity(*s));
        let status = worst.unwrap_or(Status::Success);
        if status == Status::Success {
            return self.result(status, "Standard policies passed", "All standard policies passed.");
        }
        let message = parts
            .iter()
            .filter(|p| p.status != Status::Success)
            .map(|p| format!("{}: {}", p.policy_display_name, p.message))
            .collect::<Vec<_>>()
            .join("\n");
        let title = parts
            .iter()
            .find(|p| p.status == status)
            .map(|p| p.title.clone())
            .unwrap_or_default();
        self.result(status, title, message)
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

type PolicyBuilder =
    fn(usize, &MergePolicyDefinition) -> Result<Box<dyn MergePolicy>, PolicyConfigError>;

fn ignore_checks(index: usize, def: &MergePolicyDefinition) -> Result<Vec<String>, PolicyConfigError> {
    let Some(value) = def.properties.get(IGNORE_CHECKS_PROPERTY) else {
        return Ok(Vec::new());
    };
    let invalid = || PolicyConfigError::InvalidProperty {
        index,
        property: IGNORE_CHECKS_PROPERTY.to_string(),
        reason: "expected an array of check names".to_string(),
    };
    value
        .as_array()
        .ok_or_else(invalid)?
        .iter()
        .map(|v| v.as_str().map(str::to_string).ok_or_else(invalid))
        .collect()
}

/// Maps policy names (case-insensitive) to strategy builders.
pub struct MergePolicyRegistry {
    builders: BTreeMap<String, PolicyBuilder>,
}

impl Default for MergePolicyRegistry {
    fn default() -> Self {
        let mut registry = Self {
            builders: BTreeMap::new(),
        };
        registry.register(ALL_CHECKS_SUCCESSFUL, |i, d| {
            Ok(Box::new(AllChecksSuccessfulPolicy {
                ignore_checks: ignore_checks(i, d)?,
            }))
        });
        registry.register(STANDARD, |i, d| {
            Ok(Box::new(StandardPolicy {
                checks: AllChecksSuccessfulPolicy {
                    ignore_checks: ignore_checks(i, d)?,
                },
            }))
        });
        registry.register(NO_EXTRA_COMMITS, |_, _| Ok(Box::new(NoExtraCommitsPolicy)));
        registry.register(NO_REQUESTED_CHANGES, |_, _| Ok(Box::new(NoRequestedChangesPolicy)));
        registry.register(DONT_AUTOMERGE_DOWNGRADES, |_, _| {
            Ok(Box::new(DontAutomergeDowngradesPolicy))
        });
        registry.register(VALIDATE_COHERENCY, |_, _| Ok(Box::new(ValidateCoherencyPolicy)));
        registry
    }
}

impl MergePolicyRegistry {
    pub fn register(&mut self, name: &str, builder: PolicyBuilder) {
        self.builders.insert(name.to_lowercase(), builder);
    }

    pub fn is_known(&self, name: &str) -> bool {
        self.builders.contains_key(&name.to_lowercase())
    }

    /// Instantiate `definitions` in order, failing on the first unknown name
    /// or invalid property.
    pub fn build(
        &self,
        definitions: &[MergePolicyDefinition],
    ) -> Result<Vec<Box<dyn MergePolicy>>, PolicyConfigError> {
        definitions
            .iter()
            .enumerate()
            .map(|(index, def)| {
                let builder = self.builders.get(&def.name.to_lowercase()).ok_or_else(|| {
                    PolicyConfigError::UnknownPolicy {
                        index,
                        name: def.name.clone(),
                    }
                })?;
                builder(index, def)
            })
            .collect()
    }

    pub fn validate(&self, definitions: &[MergePolicyDefinition]) -> Result<(), PolicyConfigError> {
        self.build(definitions).map(|_| ())
    }

    pub fn evaluate(
        &self,
        definitions: &[MergePolicyDefinition],
        context: &MergePolicyContext,
    ) -> Result<MergePolicyEvaluationResults, PolicyConfigError> {
        let policies = self.build(definitions)?;
        Ok(super::evaluate_policies(&policies, context))
    }
}
