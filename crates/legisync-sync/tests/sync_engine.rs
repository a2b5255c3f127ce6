use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use legisync_core::{Action, ActionKind, Amendment, Cosponsor, Level, Vote};
use legisync_storage::{LoadedSnapshot, SnapshotEntry, SnapshotError};
use legisync_sync::memory::{MemoryStore, StoreOp, Tables};
use legisync_sync::{
    LevelPolicy, RunStatus, SyncEngine, SyncError, SyncOptions, SyncStatusRow,
};
use serde_json::json;

fn day(d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, d, 15, 0, 0).unwrap()
}

fn vote(action_id: &str, d: u32) -> Vote {
    Vote {
        alternate_id: format!("{action_id}-rc{d}"),
        source_url: "https://clerk.house.gov/evs/2024/roll001.xml".into(),
        chamber: "h".into(),
        congress: Some(118),
        session: Some("2024".into()),
        requires: Some("1/2".into()),
        number: Some(d),
        question: "On Passage".into(),
        result: "Passed".into(),
        result_text: None,
        date: day(d),
        cache_updated_at: day(d),
        vote_type: None,
        member_votes: BTreeMap::from([
            ("A000055".to_string(), "Yea".to_string()),
            ("C001091".to_string(), "Nay".to_string()),
        ]),
    }
}

fn action(id: &str, updated: DateTime<Utc>, vote_days: &[u32]) -> Action {
    Action {
        id: id.into(),
        kind: ActionKind::Bill,
        level: Level::National,
        state: None,
        chamber: "h".into(),
        bill_type: Some("hr".into()),
        congress: Some(118),
        number: Some(1),
        introduced_at: Some(day(1)),
        official_title: Some("An act".into()),
        popular_title: None,
        short_title: None,
        sponsor_id: Some("A000055".into()),
        sponsor_type: Some("person".into()),
        status: "REFERRED".into(),
        status_at: Some(updated),
        tags: vec![],
        top_tag: None,
        summary: BTreeMap::new(),
        cache_updated_at: updated,
        source_url: String::new(),
        cosponsors: vec![Cosponsor {
            id: "B001295".into(),
            original_cosponsor: Some(true),
            sponsored_at: Some(day(1)),
            withdrawn_at: None,
        }],
        amendments: vec![Amendment {
            id: format!("hamdt-{id}"),
            amendment_type: "hamdt".into(),
            chamber: "h".into(),
            congress: 118,
            number: 1,
            description: None,
            introduced_at: None,
            sponsor: None,
            status: "offered".into(),
            status_at: None,
            cache_updated_at: updated,
        }],
        votes: vote_days.iter().map(|d| vote(id, *d)).collect(),
    }
}

fn snapshot(generated_at: DateTime<Utc>, actions: Vec<Action>) -> LoadedSnapshot {
    LoadedSnapshot {
        generated_at,
        members: BTreeMap::new(),
        entries: actions
            .into_iter()
            .map(|a| SnapshotEntry {
                file_name: format!("{}.json", a.id),
                action: Ok(a),
            })
            .collect(),
    }
}

fn previous_success(job_id: &str, at: DateTime<Utc>) -> Tables {
    Tables {
        sync_status: BTreeMap::from([(
            job_id.to_string(),
            SyncStatusRow {
                job_id: job_id.to_string(),
                last_run: Some(at),
                last_success: Some(at),
                status: RunStatus::Success,
                result_data: json!({}),
                error_data: json!({ "errors": [] }),
            },
        )]),
        ..Tables::default()
    }
}

fn engine(store: &Arc<MemoryStore>, policy: LevelPolicy) -> SyncEngine {
    SyncEngine::new(store.clone(), SyncOptions::new("national-votes", policy))
}

#[tokio::test]
async fn empty_snapshot_advances_last_success() {
    let store = Arc::new(MemoryStore::new());
    let result = engine(&store, LevelPolicy::National)
        .synchronize(snapshot(day(20), vec![]))
        .await
        .unwrap();

    assert_eq!((result.updated, result.unchanged, result.failed, result.votes_recorded), (0, 0, 0, 0));
    assert_eq!(result.last_success, Some(day(20)));
    assert_eq!(result.exit_code(), 0);

    let tables = store.tables().await;
    let row = &tables.sync_status["national-votes"];
    assert_eq!(row.status, RunStatus::Success);
    assert_eq!(row.last_success, Some(day(20)));
    assert_eq!(row.result_data["updated"], 0);
}

#[tokio::test]
async fn only_votes_after_the_watermark_are_written() {
    let store = Arc::new(MemoryStore::with_tables(previous_success("national-votes", day(10))));
    let result = engine(&store, LevelPolicy::National)
        .synchronize(snapshot(day(20), vec![action("hr1-118", day(2), &[5, 12])]))
        .await
        .unwrap();

    assert_eq!(result.watermark, day(10));
    assert_eq!(result.updated, 1);
    assert_eq!(result.votes_recorded, 1);

    let tables = store.tables().await;
    assert!(tables.actions.contains_key("hr1-118"), "new vote forces metadata on national jobs");
    assert_eq!(tables.votes.len(), 1);
    let stored = &tables.votes["hr1-118-rc12"];
    assert_eq!(stored.action_id, "hr1-118");
    assert_eq!(tables.member_votes[&("A000055".to_string(), stored.row_id)], "Yea");
    // the amendment predates the watermark
    assert!(tables.amendments.is_empty());
}

#[tokio::test]
async fn state_jobs_write_votes_without_stale_metadata() {
    let store = Arc::new(MemoryStore::with_tables(previous_success("national-votes", day(10))));
    let result = engine(&store, LevelPolicy::state_default())
        .synchronize(snapshot(day(20), vec![action("ca-20232024-ab1", day(2), &[12])]))
        .await
        .unwrap();

    // a vote-only write leaves the action counted as unchanged
    assert_eq!(result.updated, 0);
    assert_eq!(result.unchanged, 1);
    assert_eq!(result.votes_recorded, 1);
    let tables = store.tables().await;
    assert!(tables.actions.is_empty());
    assert_eq!(tables.votes.len(), 1);
}

#[tokio::test]
async fn failed_action_does_not_block_the_others() {
    let store = Arc::new(MemoryStore::new());
    store.fail_on(StoreOp::UpsertAmendment, Some("hr2-118")).await;

    let actions = vec![
        action("hr1-118", day(3), &[4]),
        action("hr2-118", day(3), &[4]),
        action("hr3-118", day(3), &[4]),
    ];
    let result = engine(&store, LevelPolicy::National)
        .synchronize(snapshot(day(20), actions.clone()))
        .await
        .unwrap();

    assert_eq!(result.updated, 2);
    assert_eq!(result.failed, 1);
    assert_eq!(result.votes_recorded, 2);
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].action_id.as_deref(), Some("hr2-118"));
    assert_eq!(result.last_success, None);
    assert_eq!(result.exit_code(), 1);

    let tables = store.tables().await;
    // rows written before the failure stay
    assert!(tables.actions.contains_key("hr2-118"));
    assert!(tables.amendments.contains_key("hamdt-hr1-118"));
    assert!(!tables.amendments.contains_key("hamdt-hr2-118"));
    assert!(tables.amendments.contains_key("hamdt-hr3-118"));
    assert!(!tables.votes.contains_key("hr2-118-rc4"));
    let row = &tables.sync_status["national-votes"];
    assert_eq!(row.status, RunStatus::Error);
    assert_eq!(row.last_success, None);
    assert_eq!(row.error_data["errors"][0]["action_id"], "hr2-118");

    // next run starts from the same watermark and picks the action up again
    store.clear_failures().await;
    let retry = engine(&store, LevelPolicy::National)
        .synchronize(snapshot(day(21), actions))
        .await
        .unwrap();
    assert_eq!(retry.watermark, legisync_core::epoch_watermark());
    assert_eq!(retry.failed, 0);
    assert_eq!(retry.updated, 3);
    assert_eq!(retry.last_success, Some(day(21)));
    assert!(store.tables().await.votes.contains_key("hr2-118-rc4"));
}

#[tokio::test]
async fn vote_failure_keeps_votes_already_recorded() {
    let store = Arc::new(MemoryStore::new());
    store.fail_on(StoreOp::UpsertMemberVotes, Some("hr1-118")).await;

    let result = engine(&store, LevelPolicy::National)
        .synchronize(snapshot(day(20), vec![action("hr1-118", day(3), &[4, 5])]))
        .await
        .unwrap();

    assert_eq!(result.failed, 1);
    assert_eq!(result.votes_recorded, 0);
    let tables = store.tables().await;
    // the vote row itself was upserted before member votes failed
    assert!(tables.votes.contains_key("hr1-118-rc4"));
    assert!(!tables.votes.contains_key("hr1-118-rc5"));
    assert!(tables.member_votes.is_empty());
}

#[tokio::test]
async fn watermark_read_failure_aborts_before_any_write() {
    let store = Arc::new(MemoryStore::new());
    store.fail_on(StoreOp::ReadSyncStatus, None).await;

    let err = engine(&store, LevelPolicy::National)
        .synchronize(snapshot(day(20), vec![action("hr1-118", day(3), &[4])]))
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Watermark { ref job_id, .. } if job_id == "national-votes"));

    let tables = store.tables().await;
    assert!(tables.actions.is_empty());
    assert!(tables.votes.is_empty());
    assert_eq!(tables.writes, 1, "only the aborted status row is written");
    let row = &tables.sync_status["national-votes"];
    assert_eq!(row.status, RunStatus::Error);
    assert_eq!(row.last_success, None);
    assert!(row.error_data["error"].as_str().unwrap().contains("injected"));
}

#[tokio::test]
async fn unreadable_action_files_count_as_failures() {
    let store = Arc::new(MemoryStore::new());
    let mut loaded = snapshot(day(20), vec![action("hr1-118", day(3), &[4])]);
    loaded.entries.push(SnapshotEntry {
        file_name: "broken.json".into(),
        action: Err(SnapshotError::UnsafeId("../broken".into())),
    });

    let result = engine(&store, LevelPolicy::National)
        .synchronize(loaded)
        .await
        .unwrap();

    assert_eq!(result.updated, 1);
    assert_eq!(result.failed, 1);
    assert_eq!(result.errors[0].action_id, None);
    assert!(result.errors[0].message.starts_with("broken.json"));
    assert_eq!(result.last_success, None);
}

#[tokio::test]
async fn repeated_run_of_same_snapshot_is_unchanged() {
    let store = Arc::new(MemoryStore::new());
    let actions = vec![action("hr1-118", day(3), &[4]), action("hr2-118", day(5), &[6, 7])];

    let first = engine(&store, LevelPolicy::National)
        .synchronize(snapshot(day(20), actions.clone()))
        .await
        .unwrap();
    assert_eq!(first.updated, 2);
    assert_eq!(first.votes_recorded, 3);
    let writes_after_first = store.tables().await.writes;

    let second = engine(&store, LevelPolicy::National)
        .synchronize(snapshot(day(20), actions))
        .await
        .unwrap();
    assert_eq!(second.watermark, day(20));
    assert_eq!(second.updated, 0);
    assert_eq!(second.unchanged, 2);
    assert_eq!(second.votes_recorded, 0);
    // ledger row only
    assert_eq!(store.tables().await.writes, writes_after_first + 1);
}

#[tokio::test]
async fn state_tolerance_skips_restamps_within_a_day_of_the_watermark() {
    let skewed = action("tx-89r-hb1", day(10) + Duration::hours(6), &[]);
    let restamped = action("tx-89r-hb2", day(11) + Duration::hours(1), &[]);

    let store = Arc::new(MemoryStore::with_tables(previous_success("national-votes", day(10))));
    let national = engine(&store, LevelPolicy::National)
        .synchronize(snapshot(day(20), vec![skewed.clone(), restamped.clone()]))
        .await
        .unwrap();
    assert_eq!(national.updated, 2);

    let store = Arc::new(MemoryStore::with_tables(previous_success("national-votes", day(10))));
    let state = engine(&store, LevelPolicy::state_default())
        .synchronize(snapshot(day(20), vec![skewed, restamped]))
        .await
        .unwrap();
    assert_eq!((state.updated, state.unchanged), (1, 1));
    let tables = store.tables().await;
    assert!(!tables.actions.contains_key("tx-89r-hb1"));
    assert!(tables.actions.contains_key("tx-89r-hb2"));
}

#[tokio::test]
async fn failed_run_reports_the_previous_success() {
    let store = Arc::new(MemoryStore::with_tables(previous_success("national-votes", day(10))));
    store.fail_on(StoreOp::UpsertAction, Some("hr1-118")).await;

    let result = engine(&store, LevelPolicy::National)
        .synchronize(snapshot(day(20), vec![action("hr1-118", day(12), &[])]))
        .await
        .unwrap();

    assert_eq!(result.watermark, day(10));
    assert_eq!(result.failed, 1);
    assert_eq!(result.last_success, Some(day(10)));
    assert_eq!(store.tables().await.sync_status["national-votes"].last_success, Some(day(10)));
}
