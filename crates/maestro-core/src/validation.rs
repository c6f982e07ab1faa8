//! Subscription validation, run before a subscription is stored or acted on.

use maestro_state::Subscription;

use crate::error::{FlowError, FlowResult};
use crate::merge_policy::{MergePolicyRegistry, ALL_CHECKS_SUCCESSFUL, IGNORE_CHECKS_PROPERTY, STANDARD};

/// Reject malformed subscriptions with an error naming the offending field.
pub fn validate_subscription(subscription: &Subscription, registry: &MergePolicyRegistry) -> FlowResult<()> {
    let policies = &subscription.policy.merge_policies;

    if subscription.policy.batchable && !policies.is_empty() {
        return Err(FlowError::configuration(
            "policy.merge_policies",
            "batchable subscriptions take merge policies from their repository branch",
        ));
    }

    if subscription.source_directory.is_some() && subscription.target_directory.is_some() {
        return Err(FlowError::configuration(
            "source_directory",
            "source and target directory cannot both be set",
        ));
    }

    for (index, definition) in policies.iter().enumerate() {
        let takes_ignore_checks = definition.name.eq_ignore_ascii_case(ALL_CHECKS_SUCCESSFUL)
            || definition.name.eq_ignore_ascii_case(STANDARD);
        if definition.properties.contains_key(IGNORE_CHECKS_PROPERTY) && !takes_ignore_checks {
            return Err(FlowError::configuration(
                format!("merge_policies[{index}].{IGNORE_CHECKS_PROPERTY}"),
                format!("only valid on {ALL_CHECKS_SUCCESSFUL}"),
            ));
        }
    }

    registry.validate(policies)?;
    Ok(())
}
