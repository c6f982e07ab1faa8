//! Subscription triggers: new builds on a channel and the scheduled
//! (daily, twice daily, weekly) subscription sweeps.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike, Duration as ChronoDuration, NaiveTime, TimeZone, Utc, Weekday};
use maestro_state::{
    Build, BuildId, BuildStore, ChannelId, Subscription, SubscriptionStore, UpdateFrequency,
};
use tracing::{debug, info, warn};

use crate::error::FlowResult;
use crate::queue::WorkItemQueue;
use crate::work_item::WorkItem;

/// Frequencies swept on a schedule rather than per build.
pub const SCHEDULED_FREQUENCIES: [UpdateFrequency; 3] = [
    UpdateFrequency::EveryDay,
    UpdateFrequency::TwiceDaily,
    UpdateFrequency::EveryWeek,
];

fn same_repository(a: &str, b: &str) -> bool {
    a.trim_end_matches('/').eq_ignore_ascii_case(b.trim_end_matches('/'))
}

/// The work item applying `build_id` to `subscription`.
fn update_item(subscription: &Subscription, build_id: BuildId) -> WorkItem {
    if subscription.is_code_flow() {
        WorkItem::code_flow(subscription.id, build_id)
    } else {
        WorkItem::update_subscription(subscription.id, build_id)
    }
}

/// Turns new builds and schedule ticks into subscription update work items.
pub struct SubscriptionTriggerer {
    builds: Arc<dyn BuildStore>,
    subscriptions: Arc<dyn SubscriptionStore>,
    queue: Arc<dyn WorkItemQueue>,
    repositories_without_asset_locations: HashSet<String>,
}

impl SubscriptionTriggerer {
    pub fn new(
        builds: Arc<dyn BuildStore>,
        subscriptions: Arc<dyn SubscriptionStore>,
        queue: Arc<dyn WorkItemQueue>,
    ) -> Self {
        Self {
            builds,
            subscriptions,
            queue,
            repositories_without_asset_locations: HashSet::new(),
        }
    }

    /// Repositories whose builds flow even though none of their assets
    /// were published.
    pub fn with_repositories_without_asset_locations<I, S>(mut self, repositories: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.repositories_without_asset_locations = repositories
            .into_iter()
            .map(|r| r.into().trim_end_matches('/').to_ascii_lowercase())
            .collect();
        self
    }

    fn allowed_without_asset_locations(&self, build: &Build) -> bool {
        let repository = build.repository().trim_end_matches('/').to_ascii_lowercase();
        self.repositories_without_asset_locations.contains(&repository)
    }

    /// Assign `build_id` to `channel_id` and fire the builds' subscribers.
    pub async fn add_build_to_channel(
        &self,
        build_id: BuildId,
        channel_id: ChannelId,
    ) -> FlowResult<Vec<WorkItem>> {
        self.builds.add_build_to_channel(build_id, channel_id).await?;
        self.on_build_added_to_channel(build_id, channel_id).await
    }

    /// Enqueue an update for every enabled `EveryBuild` subscription on
    /// `channel_id` whose source repository produced the build.
    ///
    /// Builds without any published asset are skipped unless their
    /// repository is allowed to flow without asset locations.
    pub async fn on_build_added_to_channel(
        &self,
        build_id: BuildId,
        channel_id: ChannelId,
    ) -> FlowResult<Vec<WorkItem>> {
        let build = self.builds.get_build(build_id).await?;
        if !build.has_published_assets() && !self.allowed_without_asset_locations(&build) {
            info!(
                build_id,
                channel_id, "skipping dependency update, build has no assets in valid locations"
            );
            return Ok(Vec::new());
        }

        let items: Vec<WorkItem> = self
            .subscriptions
            .list_subscriptions()
            .await?
            .iter()
            .filter(|s| s.enabled)
            .filter(|s| s.channel_id == channel_id)
            .filter(|s| s.policy.update_frequency == UpdateFrequency::EveryBuild)
            .filter(|s| same_repository(&s.source_repository, build.repository()))
            .map(|s| update_item(s, build_id))
            .collect();

        for item in &items {
            self.queue.produce(item, Duration::ZERO).await?;
        }
        debug!(build_id, channel_id, triggered = items.len(), "build added to channel");
        Ok(items)
    }

    /// Work items for enabled `frequency` subscriptions that have not
    /// applied the latest build of their source repository on their channel.
    pub async fn subscriptions_to_trigger(
        &self,
        frequency: UpdateFrequency,
    ) -> FlowResult<Vec<WorkItem>> {
        let candidates: Vec<Subscription> = self
            .subscriptions
            .list_subscriptions()
            .await?
            .into_iter()
            .filter(|s| s.enabled && s.policy.update_frequency == frequency)
            .collect();

        let mut channel_builds: BTreeMap<ChannelId, Vec<Build>> = BTreeMap::new();
        let mut items = Vec::new();
        for subscription in &candidates {
            if !channel_builds.contains_key(&subscription.channel_id) {
                let builds = self
                    .builds
                    .get_builds_in_channel(subscription.channel_id, DateTime::<Utc>::UNIX_EPOCH)
                    .await?;
                channel_builds.insert(subscription.channel_id, builds);
            }
            // Newest first.
            let latest = channel_builds
                .get(&subscription.channel_id)
                .and_then(|builds| {
                    builds
                        .iter()
                        .find(|b| same_repository(&subscription.source_repository, b.repository()))
                });
            let Some(latest) = latest else {
                continue;
            };
            if subscription.last_applied_build == Some(latest.id) {
                continue;
            }
            info!(
                subscription_id = %subscription.id,
                build_id = latest.id,
                "will update subscription to latest build"
            );
            items.push(update_item(subscription, latest.id));
        }
        Ok(items)
    }

    /// Enqueue [`Self::subscriptions_to_trigger`] for `frequency`.
    pub async fn trigger(&self, frequency: UpdateFrequency) -> FlowResult<usize> {
        let items = self.subscriptions_to_trigger(frequency).await?;
        for item in &items {
            self.queue.produce(item, Duration::ZERO).await?;
        }
        info!(frequency = %frequency, updated = items.len(), "scheduled subscriptions triggered");
        Ok(items.len())
    }
}

// ---------------------------------------------------------------------------
// Schedule
// ---------------------------------------------------------------------------

const MORNING_HOUR: u32 = 5;
const EVENING_HOUR: u32 = 19;

fn at_hour(day: DateTime<Utc>, hour: u32) -> Option<DateTime<Utc>> {
    let time = NaiveTime::from_hms_opt(hour, 0, 0)?;
    Utc.from_local_datetime(&day.date_naive().and_time(time)).single()
}

/// First firing of `frequency` strictly after `after`, in UTC.
///
/// `EveryDay` fires at 05:00, `TwiceDaily` at 05:00 and 19:00, and
/// `EveryWeek` on Mondays at 05:00. Other frequencies never fire.
pub fn next_fire(frequency: UpdateFrequency, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let hours: &[u32] = match frequency {
        UpdateFrequency::EveryDay | UpdateFrequency::EveryWeek => &[MORNING_HOUR],
        UpdateFrequency::TwiceDaily => &[MORNING_HOUR, EVENING_HOUR],
        UpdateFrequency::None | UpdateFrequency::EveryBuild => return None,
    };
    (0..=7)
        .map(|offset| after + ChronoDuration::days(offset))
        .filter(|day| frequency != UpdateFrequency::EveryWeek || day.weekday() == Weekday::Mon)
        .flat_map(|day| hours.iter().filter_map(move |&h| at_hour(day, h)))
        .find(|fire| *fire > after)
}

/// Tracks when each scheduled frequency is next due.
#[derive(Debug, Clone)]
pub struct TriggerSchedule {
    next: BTreeMap<&'static str, (UpdateFrequency, DateTime<Utc>)>,
}

impl TriggerSchedule {
    /// A schedule whose first firings come after `now`.
    pub fn starting_at(now: DateTime<Utc>) -> Self {
        let next = SCHEDULED_FREQUENCIES
            .iter()
            .filter_map(|&f| next_fire(f, now).map(|at| (f.as_str(), (f, at))))
            .collect();
        Self { next }
    }

    /// Frequencies due at `now`. Each is rescheduled past `now`, so a
    /// long pause fires a frequency once rather than once per missed slot.
    pub fn due(&mut self, now: DateTime<Utc>) -> Vec<UpdateFrequency> {
        let mut due = Vec::new();
        for (frequency, at) in self.next.values_mut() {
            if *at > now {
                continue;
            }
            due.push(*frequency);
            match next_fire(*frequency, now) {
                Some(next) => *at = next,
                None => warn!(frequency = %frequency, "no next firing time"),
            }
        }
        due
    }

    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        self.next.values().map(|(_, at)| *at).min()
    }
}
