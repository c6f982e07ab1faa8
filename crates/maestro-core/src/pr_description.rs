//! Pull request titles and descriptions.
//!
//! Descriptions are markdown with one delimited section per subscription and
//! an optional coherency section at the end. Each section carries a
//! `[DependencyUpdate]: <> (Begin)` ... `(End)` block of
//! `- **Name**: from X to Y` lines which [`parse_dependency_updates`] reads
//! back, so later passes can see what an open PR already contains.

use std::sync::OnceLock;

use maestro_state::{BuildId, SubscriptionId};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::coherency::CoherencyErrorDetails;

pub const MAX_TITLE_LENGTH: usize = 150;

const DESCRIPTION_HEADER: &str = "This pull request updates the following dependencies";
const DEPENDENCY_BLOCK_BEGIN: &str = "[DependencyUpdate]: <> (Begin)";
const DEPENDENCY_BLOCK_END: &str = "[DependencyUpdate]: <> (End)";
const COHERENCY_BEGIN: &str = "[marker]: <> (Begin:Coherency Updates)";
const COHERENCY_END: &str = "[marker]: <> (End:Coherency Updates)";

/// One dependency moving between versions, as shown in a PR description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyUpdateSummary {
    pub dependency_name: String,
    pub from_version: String,
    pub to_version: String,
}

impl DependencyUpdateSummary {
    pub fn new(name: &str, from: &str, to: &str) -> Self {
        Self {
            dependency_name: name.to_string(),
            from_version: from.to_string(),
            to_version: to.to_string(),
        }
    }
}

/// Incoming updates replace the target version of existing entries with the
/// same name and keep the original `from`; new names are appended.
pub fn merge_existing_with_incoming(
    existing: &[DependencyUpdateSummary],
    incoming: &[DependencyUpdateSummary],
) -> Vec<DependencyUpdateSummary> {
    let mut merged = existing.to_vec();
    for update in incoming {
        match merged
            .iter_mut()
            .find(|e| e.dependency_name.eq_ignore_ascii_case(&update.dependency_name))
        {
            Some(entry) => entry.to_version = update.to_version.clone(),
            None => merged.push(update.clone()),
        }
    }
    merged
}

/// Metadata and updates contributed by one subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionUpdateDescription {
    pub subscription_id: SubscriptionId,
    pub source_repository: String,
    pub build_id: BuildId,
    pub commit: String,
    pub branch: String,
    pub updates: Vec<DependencyUpdateSummary>,
}

/// A coherency update line: `- **Name**: from X to Y (parent: P)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoherencyUpdateSummary {
    pub update: DependencyUpdateSummary,
    pub parent: String,
}

fn section_begin(id: &SubscriptionId) -> String {
    format!("[marker]: <> (Begin:{id})")
}

fn section_end(id: &SubscriptionId) -> String {
    format!("[marker]: <> (End:{id})")
}

/// Short display name of a repository URL (`owner/repo`).
pub fn repository_display_name(repository: &str) -> String {
    let trimmed = repository.trim_end_matches('/');
    if let Some(rest) = trimmed.strip_prefix("https://github.com/") {
        return rest.to_string();
    }
    // https://dev.azure.com/{org}/{project}/_git/{repo}
    if let Some((_, repo)) = trimmed.rsplit_once("/_git/") {
        return repo.to_string();
    }
    trimmed.rsplit('/').next().unwrap_or(trimmed).to_string()
}

/// `[target] Update dependencies from a, b`, falling back to a count of
/// repositories when the list would exceed [`MAX_TITLE_LENGTH`].
pub fn generate_title(target_branch: &str, source_repositories: &[String]) -> String {
    let mut names: Vec<String> = Vec::new();
    for repo in source_repositories {
        let name = repository_display_name(repo);
        if !names.contains(&name) {
            names.push(name);
        }
    }
    let prefix = format!("[{target_branch}] Update dependencies from ");
    let title = format!("{prefix}{}", names.join(", "));
    if title.chars().count() <= MAX_TITLE_LENGTH {
        return title;
    }
    let counted = format!("{prefix}{} repositories", names.len());
    if counted.chars().count() <= MAX_TITLE_LENGTH {
        counted
    } else {
        counted.chars().take(MAX_TITLE_LENGTH).collect()
    }
}

pub fn coherency_title(target_branch: &str) -> String {
    format!("[{target_branch}] Update dependencies to ensure coherency")
}

fn render_update_lines(out: &mut String, updates: &[DependencyUpdateSummary]) {
    for u in updates {
        out.push_str(&format!(
            "  - **{}**: from {} to {}\n",
            u.dependency_name, u.from_version, u.to_version
        ));
    }
}

pub fn render_subscription_section(section: &SubscriptionUpdateDescription) -> String {
    let mut out = String::new();
    out.push_str(&section_begin(&section.subscription_id));
    out.push('\n');
    out.push_str(&format!("## From {}\n", section.source_repository));
    out.push_str(&format!("- **Subscription**: {}\n", section.subscription_id));
    out.push_str(&format!("- **Build**: {}\n", section.build_id));
    out.push_str(&format!("- **Commit**: {}\n", section.commit));
    out.push_str(&format!("- **Branch**: {}\n\n", section.branch));
    out.push_str(DEPENDENCY_BLOCK_BEGIN);
    out.push_str("\n\n- **Updates**:\n");
    render_update_lines(&mut out, &section.updates);
    out.push('\n');
    out.push_str(DEPENDENCY_BLOCK_END);
    out.push_str("\n\n");
    out.push_str(&section_end(&section.subscription_id));
    out.push('\n');
    out
}

fn render_coherency_section(
    updates: &[CoherencyUpdateSummary],
    errors: &[CoherencyErrorDetails],
) -> String {
    let mut out = String::new();
    out.push_str(COHERENCY_BEGIN);
    out.push_str("\n## Coherency Updates\n\n");
    out.push_str("The following updates ensure that dependencies with a *CoherentParentDependency* attribute were produced in a build used as input to the parent dependency's build.\n\n");
    for c in updates {
        out.push_str(&format!(
            "  - **{}**: from {} to {} (parent: {})\n",
            c.update.dependency_name, c.update.from_version, c.update.to_version, c.parent
        ));
    }
    for e in errors {
        out.push_str(&format!("  - **{}**: {}\n", e.dependency, e.error));
        for s in &e.potential_solutions {
            out.push_str(&format!("    - {s}\n"));
        }
    }
    out.push('\n');
    out.push_str(COHERENCY_END);
    out.push('\n');
    out
}

/// Insert or replace the section for `section.subscription_id`.
///
/// An existing section is replaced in place; a new one is appended before the
/// coherency section.
pub fn update_description(existing: Option<&str>, section: &SubscriptionUpdateDescription) -> String {
    let rendered = render_subscription_section(section);
    let body = match existing {
        Some(b) if !b.trim().is_empty() => b.to_string(),
        _ => format!("{DESCRIPTION_HEADER}\n\n"),
    };

    let begin = section_begin(&section.subscription_id);
    let end = section_end(&section.subscription_id);
    if let (Some(start), Some(stop)) = (body.find(&begin), body.find(&end)) {
        if stop > start {
            let mut stop = stop + end.len();
            if body[stop..].starts_with('\n') {
                stop += 1;
            }
            return format!("{}{}{}", &body[..start], rendered, &body[stop..]);
        }
    }

    match body.find(COHERENCY_BEGIN) {
        Some(at) => format!("{}{}\n{}", &body[..at], rendered, &body[at..]),
        None => {
            let mut body = body;
            if !body.ends_with("\n\n") {
                body.push('\n');
            }
            body.push_str(&rendered);
            body
        }
    }
}

/// Replace the coherency section, removing it when there is nothing to show.
pub fn set_coherency_section(
    description: &str,
    updates: &[CoherencyUpdateSummary],
    errors: &[CoherencyErrorDetails],
) -> String {
    let mut body = description.to_string();
    if let (Some(start), Some(stop)) = (body.find(COHERENCY_BEGIN), body.find(COHERENCY_END)) {
        if stop > start {
            let mut stop = stop + COHERENCY_END.len();
            if body[stop..].starts_with('\n') {
                stop += 1;
            }
            body.replace_range(start..stop, "");
        }
    }
    if updates.is_empty() && errors.is_empty() {
        return body;
    }
    if !body.ends_with("\n\n") {
        body.push('\n');
    }
    body.push_str(&render_coherency_section(updates, errors));
    body
}

const UPDATE_LINE_PATTERN: &str =
    r"^\s*- \*\*(?P<name>[^*]+)\*\*: from (?P<from>\S+) to (?P<to>\S+)\s*$";

fn update_line() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| match Regex::new(UPDATE_LINE_PATTERN) {
        Ok(re) => Some(re),
        Err(err) => {
            error!(error = %err, "invalid dependency update line pattern");
            None
        }
    })
    .as_ref()
}

/// Every `- **Name**: from X to Y` line inside dependency-update blocks, in
/// document order.
pub fn parse_dependency_updates(description: &str) -> Vec<DependencyUpdateSummary> {
    let Some(re) = update_line() else {
        return Vec::new();
    };
    let mut in_block = false;
    let mut updates = Vec::new();
    for line in description.lines() {
        let trimmed = line.trim();
        if trimmed == DEPENDENCY_BLOCK_BEGIN {
            in_block = true;
            continue;
        }
        if trimmed == DEPENDENCY_BLOCK_END {
            in_block = false;
            continue;
        }
        if !in_block {
            continue;
        }
        if let Some(caps) = re.captures(line) {
            updates.push(DependencyUpdateSummary::new(&caps["name"], &caps["from"], &caps["to"]));
        }
    }
    updates
}

/// Updates listed in the section of one subscription.
pub fn parse_subscription_updates(
    description: &str,
    subscription_id: &SubscriptionId,
) -> Vec<DependencyUpdateSummary> {
    let begin = section_begin(subscription_id);
    let end = section_end(subscription_id);
    match (description.find(&begin), description.find(&end)) {
        (Some(start), Some(stop)) if stop > start => {
            parse_dependency_updates(&description[start..stop])
        }
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn section(id: Uuid, updates: Vec<DependencyUpdateSummary>) -> SubscriptionUpdateDescription {
        SubscriptionUpdateDescription {
            subscription_id: id,
            source_repository: "https://github.com/dotnet/runtime".into(),
            build_id: 42,
            commit: "abc123".into(),
            branch: "main".into(),
            updates,
        }
    }

    #[test]
    fn test_round_trip_preserves_order() {
        let updates = vec![
            DependencyUpdateSummary::new("Foo", "0.9.0", "1.0.0"),
            DependencyUpdateSummary::new("Microsoft.NET.Sdk", "9.0.100-preview.1", "9.0.100-preview.2"),
            DependencyUpdateSummary::new("Bar", "2.0.0", "1.5.0"),
        ];
        let body = update_description(None, &section(Uuid::new_v4(), updates.clone()));
        assert!(body.starts_with(DESCRIPTION_HEADER));
        assert!(body.contains("- **Foo**: from 0.9.0 to 1.0.0"));
        assert_eq!(parse_dependency_updates(&body), updates);
    }

    #[test]
    fn test_update_line_pattern_compiles() {
        assert!(update_line().is_some());
    }

    mod proptests {
        use proptest::prelude::*;

        use super::*;

        fn arb_update() -> impl Strategy<Value = DependencyUpdateSummary> {
            (
                "[A-Za-z][A-Za-z0-9._-]{0,30}",
                "[0-9][0-9A-Za-z.+-]{0,20}",
                "[0-9][0-9A-Za-z.+-]{0,20}",
            )
                .prop_map(|(name, from, to)| DependencyUpdateSummary::new(&name, &from, &to))
        }

        proptest! {
            #[test]
            fn description_round_trip_preserves_updates(
                updates in prop::collection::vec(arb_update(), 0..8),
            ) {
                let body = update_description(None, &section(Uuid::new_v4(), updates.clone()));
                prop_assert_eq!(parse_dependency_updates(&body), updates);
            }

            #[test]
            fn replacing_a_section_keeps_the_other(
                first in prop::collection::vec(arb_update(), 1..5),
                second in prop::collection::vec(arb_update(), 1..5),
                replacement in prop::collection::vec(arb_update(), 1..5),
            ) {
                let a = Uuid::new_v4();
                let b = Uuid::new_v4();
                let body = update_description(None, &section(a, first));
                let body = update_description(Some(&body), &section(b, second.clone()));
                let body = update_description(Some(&body), &section(a, replacement.clone()));
                prop_assert_eq!(parse_subscription_updates(&body, &a), replacement);
                prop_assert_eq!(parse_subscription_updates(&body, &b), second);
            }
        }
    }

    #[test]
    fn test_section_is_replaced_in_place() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let body = update_description(None, &section(a, vec![DependencyUpdateSummary::new("Foo", "1", "2")]));
        let body = update_description(Some(&body), &section(b, vec![DependencyUpdateSummary::new("Bar", "1", "2")]));
        let body = update_description(Some(&body), &section(a, vec![DependencyUpdateSummary::new("Foo", "1", "3")]));

        assert_eq!(body.matches(&section_begin(&a)).count(), 1);
        let names: Vec<String> = parse_dependency_updates(&body)
            .into_iter()
            .map(|u| format!("{}:{}", u.dependency_name, u.to_version))
            .collect();
        assert_eq!(names, vec!["Foo:3", "Bar:2"]);
        assert_eq!(parse_subscription_updates(&body, &b)[0].dependency_name, "Bar");
    }

    #[test]
    fn test_coherency_section_stays_last_and_is_not_parsed_as_update() {
        let a = Uuid::new_v4();
        let body = update_description(None, &section(a, vec![DependencyUpdateSummary::new("Foo", "1", "2")]));
        let coherency = vec![CoherencyUpdateSummary {
            update: DependencyUpdateSummary::new("Child", "5.0.0", "5.0.1"),
            parent: "Parent".into(),
        }];
        let body = set_coherency_section(&body, &coherency, &[]);
        let body = update_description(Some(&body), &section(Uuid::new_v4(), vec![DependencyUpdateSummary::new("Bar", "1", "2")]));

        assert!(body.contains("(parent: Parent)"));
        assert!(body.rfind(COHERENCY_BEGIN) > body.rfind("Bar"));
        assert_eq!(parse_dependency_updates(&body).len(), 2);

        let cleared = set_coherency_section(&body, &[], &[]);
        assert!(!cleared.contains(COHERENCY_BEGIN));
    }

    #[test]
    fn test_coherency_errors_list_solutions() {
        let errors = vec![CoherencyErrorDetails {
            dependency: "Child".into(),
            error: "missing".into(),
            potential_solutions: vec!["Pin the dependency.".into()],
        }];
        let body = set_coherency_section("x\n", &[], &errors);
        assert!(body.contains("**Child**: missing"));
        assert!(body.contains("    - Pin the dependency."));
    }

    #[test]
    fn test_title_lists_repositories_until_too_long() {
        let title = generate_title(
            "main",
            &["https://github.com/dotnet/runtime".into(), "https://github.com/dotnet/runtime".into()],
        );
        assert_eq!(title, "[main] Update dependencies from dotnet/runtime");

        let many: Vec<String> = (0..20)
            .map(|i| format!("https://github.com/dotnet/repository-number-{i}"))
            .collect();
        let title = generate_title("release/9.0", &many);
        assert!(title.len() <= MAX_TITLE_LENGTH);
        assert_eq!(title, "[release/9.0] Update dependencies from 20 repositories");
    }

    #[test]
    fn test_display_name_for_azure_devops() {
        assert_eq!(
            repository_display_name("https://dev.azure.com/dnceng/internal/_git/dotnet-runtime"),
            "dotnet-runtime"
        );
    }

    #[test]
    fn test_merge_existing_keeps_original_from() {
        let existing = vec![DependencyUpdateSummary::new("Foo", "1.0.0", "1.1.0")];
        let incoming = vec![
            DependencyUpdateSummary::new("foo", "1.1.0", "1.2.0"),
            DependencyUpdateSummary::new("Bar", "2.0.0", "2.1.0"),
        ];
        let merged = merge_existing_with_incoming(&existing, &incoming);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0], DependencyUpdateSummary::new("Foo", "1.0.0", "1.2.0"));
        assert_eq!(merged[1].dependency_name, "Bar");
    }
}
