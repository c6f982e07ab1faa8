//! Work items: the messages carried by the durable queue.
//!
//! Every item serializes as a flat JSON object with a `type` discriminator;
//! dispatch routes on that tag only.

use chrono::{DateTime, Utc};
use maestro_state::{BuildId, SubscriptionId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::updater::ActorId;

/// Operations of the pull request updater that can be retried by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorMethod {
    UpdateAssets,
    ProcessPendingUpdates,
    CheckPullRequest,
}

impl ActorMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActorMethod::UpdateAssets => "update_assets",
            ActorMethod::ProcessPendingUpdates => "process_pending_updates",
            ActorMethod::CheckPullRequest => "check_pull_request",
        }
    }
}

/// Which periodic check a reminder stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReminderKind {
    /// Re-check the in-progress pull request.
    PullRequestCheck,
    /// Flush batched updates.
    PullRequestUpdate,
}

impl ReminderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReminderKind::PullRequestCheck => "pull_request_check",
            ReminderKind::PullRequestUpdate => "pull_request_update",
        }
    }

    /// Queue key of this reminder for `actor`; one pending message per key.
    pub fn key(&self, actor: &ActorId) -> String {
        format!("{}/{}", actor.key(), self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateSubscriptionWorkItem {
    pub subscription_id: SubscriptionId,
    pub build_id: BuildId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeFlowWorkItem {
    pub subscription_id: SubscriptionId,
    pub build_id: BuildId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequestReminderWorkItem {
    pub actor_id: ActorId,
    pub reminder: ReminderKind,
    /// Pull request a check reminder was armed for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullRequestRetryWorkItem {
    pub actor_id: ActorId,
    pub method: ActorMethod,
    #[serde(default)]
    pub arguments: serde_json::Value,
    pub attempt: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionRetryWorkItem {
    pub subscription_id: SubscriptionId,
    pub method: ActorMethod,
    #[serde(default)]
    pub arguments: serde_json::Value,
    pub attempt: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildCoherencyInfoWorkItem {
    pub build_id: BuildId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WorkItemKind {
    UpdateSubscription(UpdateSubscriptionWorkItem),
    CodeFlow(CodeFlowWorkItem),
    PullRequestReminder(PullRequestReminderWorkItem),
    PullRequestRetry(PullRequestRetryWorkItem),
    SubscriptionRetry(SubscriptionRetryWorkItem),
    BuildCoherencyInfo(BuildCoherencyInfoWorkItem),
}

impl WorkItemKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            WorkItemKind::UpdateSubscription(_) => "UpdateSubscription",
            WorkItemKind::CodeFlow(_) => "CodeFlow",
            WorkItemKind::PullRequestReminder(_) => "PullRequestReminder",
            WorkItemKind::PullRequestRetry(_) => "PullRequestRetry",
            WorkItemKind::SubscriptionRetry(_) => "SubscriptionRetry",
            WorkItemKind::BuildCoherencyInfo(_) => "BuildCoherencyInfo",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: WorkItemKind,
}

impl WorkItem {
    pub fn new(kind: WorkItemKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            kind,
        }
    }

    pub fn update_subscription(subscription_id: SubscriptionId, build_id: BuildId) -> Self {
        Self::new(WorkItemKind::UpdateSubscription(UpdateSubscriptionWorkItem {
            subscription_id,
            build_id,
        }))
    }

    pub fn code_flow(subscription_id: SubscriptionId, build_id: BuildId) -> Self {
        Self::new(WorkItemKind::CodeFlow(CodeFlowWorkItem {
            subscription_id,
            build_id,
        }))
    }

    pub fn reminder(actor_id: ActorId, reminder: ReminderKind) -> Self {
        Self::new(WorkItemKind::PullRequestReminder(PullRequestReminderWorkItem {
            actor_id,
            reminder,
            pr_url: None,
        }))
    }

    pub fn check_reminder(actor_id: ActorId, pr_url: impl Into<String>) -> Self {
        Self::new(WorkItemKind::PullRequestReminder(PullRequestReminderWorkItem {
            actor_id,
            reminder: ReminderKind::PullRequestCheck,
            pr_url: Some(pr_url.into()),
        }))
    }

    pub fn build_coherency_info(build_id: BuildId) -> Self {
        Self::new(WorkItemKind::BuildCoherencyInfo(BuildCoherencyInfoWorkItem { build_id }))
    }

    pub fn type_name(&self) -> &'static str {
        self.kind.type_name()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(body: &str) -> serde_json::Result<Self> {
        serde_json::from_str(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_serialized_shape_is_flat_with_type_tag() {
        let sub = Uuid::new_v4();
        let item = WorkItem::update_subscription(sub, 7);
        let value: serde_json::Value = serde_json::from_str(&item.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "UpdateSubscription");
        assert_eq!(value["build_id"], 7);
        assert_eq!(value["subscription_id"], sub.to_string());
        assert_eq!(value["id"], item.id.to_string());
    }

    #[test]
    fn test_retry_item_survives_transport() {
        let item = WorkItem::new(WorkItemKind::PullRequestRetry(PullRequestRetryWorkItem {
            actor_id: ActorId::Batch {
                repository: "https://github.com/dotnet/sdk".into(),
                branch: "main".into(),
            },
            method: ActorMethod::ProcessPendingUpdates,
            arguments: json!(null),
            attempt: 2,
        }));
        let back = WorkItem::from_json(&item.to_json().unwrap()).unwrap();
        assert_eq!(back, item);
        assert_eq!(back.type_name(), "PullRequestRetry");
    }

    #[test]
    fn test_reminder_keys_are_per_actor_and_kind() {
        let a = ActorId::Subscription {
            subscription_id: Uuid::nil(),
        };
        let b = ActorId::Batch {
            repository: "https://github.com/dotnet/sdk".into(),
            branch: "main".into(),
        };
        let check = ReminderKind::PullRequestCheck;
        assert_eq!(check.key(&a), check.key(&a));
        assert_ne!(check.key(&a), check.key(&b));
        assert_ne!(check.key(&a), ReminderKind::PullRequestUpdate.key(&a));
    }

    #[test]
    fn test_check_reminder_carries_pull_request() {
        let item = WorkItem::check_reminder(
            ActorId::Subscription {
                subscription_id: Uuid::nil(),
            },
            "https://github.com/dotnet/sdk/pull/1",
        );
        let value: serde_json::Value = serde_json::from_str(&item.to_json().unwrap()).unwrap();
        assert_eq!(value["reminder"], "pull_request_check");
        assert_eq!(value["pr_url"], "https://github.com/dotnet/sdk/pull/1");

        // Reminders written without a pull request still parse.
        let mut legacy = value.clone();
        legacy.as_object_mut().unwrap().remove("pr_url");
        let back = WorkItem::from_json(&legacy.to_string()).unwrap();
        match back.kind {
            WorkItemKind::PullRequestReminder(r) => assert_eq!(r.pr_url, None),
            other => panic!("unexpected work item: {other:?}"),
        }
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let body = json!({
            "id": Uuid::new_v4(),
            "created_at": "2024-01-01T00:00:00Z",
            "type": "Bogus",
        })
        .to_string();
        assert!(WorkItem::from_json(&body).is_err());
    }
}
