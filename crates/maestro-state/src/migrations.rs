//! SurrealDB schema migrations and initialization
//!
//! Defines every Build Asset Registry table with its lookup indexes.
//! Safe to run on each connection (idempotent `DEFINE ... IF NOT EXISTS`).

use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

use crate::storage_traits::StorageResult;

/// Initialize all Maestro tables.
pub async fn init_schema(db: &Surreal<Any>) -> StorageResult<()> {
    info!("Initializing Maestro SurrealDB schema");

    init_builds_tables(db).await?;
    init_channels_table(db).await?;
    init_subscriptions_tables(db).await?;
    init_longest_build_paths_table(db).await?;
    init_actor_states_table(db).await?;

    info!("Maestro schema initialization complete");
    Ok(())
}

/// `builds`, `build_channels`, `build_times`, `build_incoherencies`
///
/// ```text
/// TABLE builds { build_id: INT UNIQUE, repository: STRING, date_produced: DATETIME, document: OBJECT }
/// TABLE build_channels { build_id: INT, channel_id: INT }   UNIQUE (build_id, channel_id)
/// TABLE build_times { key: STRING UNIQUE, document: OBJECT }
/// TABLE build_incoherencies { build_id: INT UNIQUE, document: ARRAY }
/// ```
///
/// Builds are immutable apart from the released flag; deletes are denied.
async fn init_builds_tables(db: &Surreal<Any>) -> StorageResult<()> {
    debug!("Initializing builds tables");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS builds SCHEMALESS
            PERMISSIONS FOR create FULL FOR read FULL FOR update FULL FOR delete NONE;
        DEFINE INDEX IF NOT EXISTS idx_build_id ON TABLE builds COLUMNS build_id UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_build_repository ON TABLE builds COLUMNS repository;
        DEFINE INDEX IF NOT EXISTS idx_build_date ON TABLE builds COLUMNS date_produced;

        DEFINE TABLE IF NOT EXISTS build_channels SCHEMALESS;
        DEFINE INDEX IF NOT EXISTS idx_build_channel ON TABLE build_channels
            COLUMNS build_id, channel_id UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_build_channel_channel ON TABLE build_channels
            COLUMNS channel_id;

        DEFINE TABLE IF NOT EXISTS build_times SCHEMALESS;
        DEFINE INDEX IF NOT EXISTS idx_build_time_key ON TABLE build_times COLUMNS key UNIQUE;

        DEFINE TABLE IF NOT EXISTS build_incoherencies SCHEMALESS;
        DEFINE INDEX IF NOT EXISTS idx_incoherency_build ON TABLE build_incoherencies
            COLUMNS build_id UNIQUE;
    "#;

    db.query(sql).await?;
    debug!("builds tables initialized");
    Ok(())
}

async fn init_channels_table(db: &Surreal<Any>) -> StorageResult<()> {
    let sql = r#"
        DEFINE TABLE IF NOT EXISTS channels SCHEMALESS;
        DEFINE INDEX IF NOT EXISTS idx_channel_id ON TABLE channels COLUMNS channel_id UNIQUE;

        DEFINE TABLE IF NOT EXISTS default_channels SCHEMALESS;
        DEFINE INDEX IF NOT EXISTS idx_default_channel_key ON TABLE default_channels
            COLUMNS key UNIQUE;
    "#;

    db.query(sql).await?;
    debug!("channels table initialized");
    Ok(())
}

/// `subscriptions` and `repository_merge_policies`
///
/// `subscription_id` is the subscription GUID as a hyphenated string.
/// Policy rows are keyed by lower-cased `repository@branch`.
async fn init_subscriptions_tables(db: &Surreal<Any>) -> StorageResult<()> {
    let sql = r#"
        DEFINE TABLE IF NOT EXISTS subscriptions SCHEMALESS;
        DEFINE INDEX IF NOT EXISTS idx_subscription_id ON TABLE subscriptions
            COLUMNS subscription_id UNIQUE;

        DEFINE TABLE IF NOT EXISTS repository_merge_policies SCHEMALESS;
        DEFINE INDEX IF NOT EXISTS idx_repository_policy_key ON TABLE repository_merge_policies
            COLUMNS key UNIQUE;
    "#;

    db.query(sql).await?;
    debug!("subscriptions tables initialized");
    Ok(())
}

/// `longest_build_paths`: append-only snapshots, one per channel per run.
async fn init_longest_build_paths_table(db: &Surreal<Any>) -> StorageResult<()> {
    let sql = r#"
        DEFINE TABLE IF NOT EXISTS longest_build_paths SCHEMALESS
            PERMISSIONS FOR create FULL FOR read FULL FOR update NONE FOR delete NONE;
        DEFINE INDEX IF NOT EXISTS idx_lbp_channel_date ON TABLE longest_build_paths
            COLUMNS channel_id, report_date;
    "#;

    db.query(sql).await?;
    debug!("longest_build_paths table initialized");
    Ok(())
}

async fn init_actor_states_table(db: &Surreal<Any>) -> StorageResult<()> {
    let sql = r#"
        DEFINE TABLE IF NOT EXISTS actor_states SCHEMALESS;
        DEFINE INDEX IF NOT EXISTS idx_actor_state_key ON TABLE actor_states COLUMNS key UNIQUE;
    "#;

    db.query(sql).await?;
    debug!("actor_states table initialized");
    Ok(())
}
