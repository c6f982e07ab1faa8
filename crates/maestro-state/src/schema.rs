//! SurrealDB row types.
//!
//! Each row carries its lookup columns as plain fields (indexed by
//! [`crate::migrations`]) plus the full record as a JSON `document`.
//! Conversion to and from [`crate::model`] types happens at the boundary in
//! [`crate::surreal_store`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::storage_traits::StorageResult;

/// Module for serializing chrono DateTime to SurrealDB datetime format
mod surreal_datetime {
    use chrono::{DateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};
    use surrealdb::sql::Datetime as SurrealDatetime;

    pub fn serialize<S>(date: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serde::Serialize::serialize(&SurrealDatetime::from(*date), serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let sd = SurrealDatetime::deserialize(deserializer)?;
        Ok(DateTime::from(sd))
    }
}

pub(crate) fn to_document<T: Serialize>(value: &T) -> StorageResult<serde_json::Value> {
    serde_json::to_value(value).map_err(StorageError::from)
}

pub(crate) fn from_document<T: serde::de::DeserializeOwned>(
    document: serde_json::Value,
) -> StorageResult<T> {
    serde_json::from_value(document).map_err(StorageError::from)
}

/// `builds` row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRow {
    pub id: Option<surrealdb::sql::Thing>,
    pub build_id: i64,
    pub repository: String,
    #[serde(with = "surreal_datetime")]
    pub date_produced: DateTime<Utc>,
    pub document: serde_json::Value,
}

/// `build_channels` join row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildChannelRow {
    pub id: Option<surrealdb::sql::Thing>,
    pub build_id: i64,
    pub channel_id: i64,
}

/// `build_times` row, keyed by `repository@branch`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildTimeRow {
    pub id: Option<surrealdb::sql::Thing>,
    pub key: String,
    pub document: serde_json::Value,
}

/// `build_incoherencies` row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildIncoherenceRow {
    pub id: Option<surrealdb::sql::Thing>,
    pub build_id: i64,
    pub document: serde_json::Value,
}

/// `channels` row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelRow {
    pub id: Option<surrealdb::sql::Thing>,
    pub channel_id: i64,
    pub document: serde_json::Value,
}

/// `default_channels` row, keyed by `repository@branch#channel`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultChannelRow {
    pub id: Option<surrealdb::sql::Thing>,
    pub key: String,
    pub document: serde_json::Value,
}

/// `subscriptions` row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionRow {
    pub id: Option<surrealdb::sql::Thing>,
    pub subscription_id: String,
    pub document: serde_json::Value,
}

/// `repository_merge_policies` row, keyed by `repository@branch`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryPolicyRow {
    pub id: Option<surrealdb::sql::Thing>,
    pub key: String,
    pub document: serde_json::Value,
}

/// `longest_build_paths` row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LongestBuildPathRow {
    pub id: Option<surrealdb::sql::Thing>,
    pub channel_id: i64,
    pub best_case_minutes: f64,
    pub worst_case_minutes: f64,
    pub contributing_repositories: String,
    #[serde(with = "surreal_datetime")]
    pub report_date: DateTime<Utc>,
}

/// `actor_states` row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActorStateRow {
    pub id: Option<surrealdb::sql::Thing>,
    pub key: String,
    pub document: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Asset, Build, BuildSource};

    #[test]
    fn test_document_round_trip_keeps_nested_assets() {
        let build = Build {
            id: 7,
            commit: "abc123".into(),
            source: BuildSource::GitHub {
                repository: "https://github.com/dotnet/runtime".into(),
                branch: "main".into(),
            },
            assets: vec![Asset::new("Foo", "1.0.0")],
            dependencies: vec![],
            released: false,
            date_produced: Utc::now(),
        };
        let doc = to_document(&build).unwrap();
        let back: Build = from_document(doc).unwrap();
        assert_eq!(back, build);
    }

    #[test]
    fn test_from_document_rejects_wrong_shape() {
        let res: StorageResult<Build> = from_document(serde_json::json!({"id": "x"}));
        assert!(matches!(res, Err(StorageError::Serialization(_))));
    }
}
