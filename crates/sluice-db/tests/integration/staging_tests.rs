use chrono::{Duration, TimeZone, Utc};
use sluice_core::client::{AsyncClient, ClientConfig};
use sluice_core::collector::{ApiCollector, CollectorConfig, Pagination, Resource};
use sluice_core::error::AppError;
use sluice_core::models::{NewStagingRow, Partition, RunCommit, compute_hash};
use sluice_core::request::ApiResponse;
use sluice_core::testutil::{MockReporter, MockTransport};
use sluice_core::traits::StagingStore;
use sluice_db::{Database, StagingRepository};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::integration::common::setup_test_db;

fn partition_key() -> String {
    Partition::new(1, serde_json::json!({"projectId": 37}), "gitlab_api_issues").key()
}

fn page(run_id: Uuid, page: u64, items: serde_json::Value) -> NewStagingRow {
    let input = serde_json::json!({"url": "projects/37/issues", "page": page});
    NewStagingRow {
        partition_key: partition_key(),
        run_id,
        request_key: compute_hash(&input.to_string()),
        params: serde_json::json!({"projectId": 37}),
        input,
        data: serde_json::to_vec(&items).unwrap(),
    }
}

fn commit(run_id: Uuid, replace: bool) -> RunCommit {
    RunCommit {
        partition_key: partition_key(),
        run_id,
        replace,
        cursor: None,
        time_after: None,
    }
}

#[tokio::test]
async fn pages_are_invisible_until_commit() {
    let (pool, _container) = setup_test_db().await;
    let repo = StagingRepository::new(pool);
    let run = Uuid::new_v4();

    repo.upsert_page(&page(run, 1, serde_json::json!([{"id": 1}])))
        .await
        .unwrap();
    assert!(repo.load_partition(&partition_key()).await.unwrap().is_empty());
    assert_eq!(repo.count_uncommitted(&partition_key()).await.unwrap(), 1);

    repo.commit_run(&commit(run, true)).await.unwrap();
    let rows = repo.load_partition(&partition_key()).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].run_id, run);
    assert_eq!(rows[0].params, serde_json::json!({"projectId": 37}));
    assert_eq!(rows[0].payload().unwrap(), serde_json::json!([{"id": 1}]));
    assert_eq!(repo.count_uncommitted(&partition_key()).await.unwrap(), 0);
}

#[tokio::test]
async fn repeated_request_overwrites_within_a_run() {
    let (pool, _container) = setup_test_db().await;
    let repo = StagingRepository::new(pool);
    let run = Uuid::new_v4();

    repo.upsert_page(&page(run, 1, serde_json::json!([{"id": 1}])))
        .await
        .unwrap();
    repo.upsert_page(&page(run, 1, serde_json::json!([{"id": 1, "title": "edited"}])))
        .await
        .unwrap();
    repo.commit_run(&commit(run, true)).await.unwrap();

    let rows = repo.load_partition(&partition_key()).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].payload().unwrap()[0]["title"], "edited");
}

#[tokio::test]
async fn full_commit_replaces_previous_run() {
    let (pool, _container) = setup_test_db().await;
    let repo = StagingRepository::new(pool);

    let first = Uuid::new_v4();
    for n in 1..=3 {
        repo.upsert_page(&page(first, n, serde_json::json!([{"id": n}])))
            .await
            .unwrap();
    }
    assert_eq!(repo.commit_run(&commit(first, true)).await.unwrap(), 0);

    let second = Uuid::new_v4();
    repo.upsert_page(&page(second, 1, serde_json::json!([{"id": 9}])))
        .await
        .unwrap();
    assert_eq!(repo.commit_run(&commit(second, true)).await.unwrap(), 3);

    let rows = repo.load_partition(&partition_key()).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].run_id, second);
}

#[tokio::test]
async fn incremental_commit_keeps_previous_rows_and_stores_cursor() {
    let (pool, _container) = setup_test_db().await;
    let repo = StagingRepository::new(pool);
    let cursor = Utc.with_ymd_and_hms(2024, 5, 4, 12, 0, 0).unwrap();

    let first = Uuid::new_v4();
    repo.upsert_page(&page(first, 1, serde_json::json!([{"id": 1}])))
        .await
        .unwrap();
    repo.commit_run(&commit(first, true)).await.unwrap();

    let second = Uuid::new_v4();
    repo.upsert_page(&page(second, 1, serde_json::json!([{"id": 2}])))
        .await
        .unwrap();
    let mut incremental = commit(second, false);
    incremental.cursor = Some(cursor);
    assert_eq!(repo.commit_run(&incremental).await.unwrap(), 0);

    assert_eq!(repo.load_partition(&partition_key()).await.unwrap().len(), 2);
    let state = repo.collector_state(&partition_key()).await.unwrap().unwrap();
    assert_eq!(state.cursor, Some(cursor));
    assert_eq!(state.latest_run_id, Some(second));
}

#[tokio::test]
async fn full_commit_keeps_pages_of_a_run_still_staging() {
    let (pool, _container) = setup_test_db().await;
    let repo = StagingRepository::new(pool);
    let fast = Uuid::new_v4();
    let slow = Uuid::new_v4();

    for n in 1..=3 {
        repo.upsert_page(&page(slow, n, serde_json::json!([{"id": 200 + n}])))
            .await
            .unwrap();
    }
    for n in 1..=2 {
        repo.upsert_page(&page(fast, n, serde_json::json!([{"id": 100 + n}])))
            .await
            .unwrap();
    }
    assert_eq!(repo.commit_run(&commit(fast, true)).await.unwrap(), 0);
    assert_eq!(repo.count_uncommitted(&partition_key()).await.unwrap(), 3);

    for n in 4..=5 {
        repo.upsert_page(&page(slow, n, serde_json::json!([{"id": 200 + n}])))
            .await
            .unwrap();
    }
    assert_eq!(repo.commit_run(&commit(slow, true)).await.unwrap(), 2);

    let rows = repo.load_partition(&partition_key()).await.unwrap();
    assert_eq!(rows.len(), 5);
    assert!(rows.iter().all(|r| r.run_id == slow));
}

#[tokio::test]
async fn abort_discards_only_the_failed_run() {
    let (pool, _container) = setup_test_db().await;
    let repo = StagingRepository::new(pool);

    let committed = Uuid::new_v4();
    repo.upsert_page(&page(committed, 1, serde_json::json!([{"id": 1}])))
        .await
        .unwrap();
    repo.commit_run(&commit(committed, true)).await.unwrap();

    let failed = Uuid::new_v4();
    repo.upsert_page(&page(failed, 1, serde_json::json!([{"id": 2}])))
        .await
        .unwrap();
    repo.upsert_page(&page(failed, 2, serde_json::json!([{"id": 3}])))
        .await
        .unwrap();

    assert_eq!(repo.abort_run(&partition_key(), failed).await.unwrap(), 2);
    assert_eq!(repo.abort_run(&partition_key(), committed).await.unwrap(), 0);

    let rows = repo.load_partition(&partition_key()).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].run_id, committed);
    assert!(repo.collector_state("unknown").await.unwrap().is_none());
}

#[tokio::test]
async fn abandoned_rows_are_discarded_by_age() {
    let (pool, _container) = setup_test_db().await;
    let repo = StagingRepository::new(pool);

    repo.upsert_page(&page(Uuid::new_v4(), 1, serde_json::json!([{"id": 1}])))
        .await
        .unwrap();

    let past = Utc::now() - Duration::hours(1);
    assert_eq!(repo.discard_abandoned(past).await.unwrap(), 0);

    let future = Utc::now() + Duration::hours(1);
    assert_eq!(repo.discard_abandoned(future).await.unwrap(), 1);
    assert_eq!(repo.count_uncommitted(&partition_key()).await.unwrap(), 0);
}

fn paged_fixture(pages: u64) -> MockTransport {
    MockTransport::new(move |req| {
        let page: u64 = req
            .query_param("page")
            .and_then(|p| p.parse().ok())
            .unwrap_or(1);
        let body = if page <= pages {
            serde_json::json!([{"id": page}])
        } else {
            serde_json::json!([])
        };
        Ok(ApiResponse::json(200, req.url.clone(), &body))
    })
}

fn collector(
    transport: MockTransport,
    repo: StagingRepository,
) -> ApiCollector<MockTransport, StagingRepository> {
    let client = AsyncClient::builder(transport, ClientConfig::new("https://gitlab.example.com/api/v4"))
        .build()
        .unwrap();
    ApiCollector::new(client, repo, CollectorConfig::default().with_page_size(1))
}

fn resource() -> Resource {
    Resource::get("issues", "projects/{params.projectId}/issues")
        .unwrap()
        .with_query("page", "{page}")
        .unwrap()
        .with_query("per_page", "{size}")
        .unwrap()
        .with_pagination(Pagination::UntilEmpty)
}

#[tokio::test]
async fn cancelled_collection_keeps_the_committed_run() {
    let (pool, _container) = setup_test_db().await;
    let db = Database::from_pool(pool);
    let repo = db.staging_repo();
    let partition = Partition::new(1, serde_json::json!({"projectId": 37}), "gitlab_api_issues");
    let reporter = MockReporter::new();

    let first = collector(paged_fixture(2), repo.clone())
        .collect(&partition, &resource(), None, &CancellationToken::new(), &reporter)
        .await
        .unwrap();
    assert_eq!(first.pages, 2);

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let endless = MockTransport::new(move |req| {
        if req.query_param("page") == Some("3") {
            trigger.cancel();
        }
        Ok(ApiResponse::json(200, req.url.clone(), &serde_json::json!([{"id": 99}])))
    });
    let err = collector(endless, repo.clone())
        .collect(&partition, &resource(), None, &cancel, &reporter)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Cancelled));

    let rows = repo.load_partition(&partition.key()).await.unwrap();
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|r| r.run_id == first.run_id));
    assert_eq!(repo.count_uncommitted(&partition.key()).await.unwrap(), 0);

    let second = collector(paged_fixture(1), repo.clone())
        .collect(&partition, &resource(), None, &CancellationToken::new(), &reporter)
        .await
        .unwrap();
    assert_eq!(second.superseded, 2);
    let rows = repo.load_partition(&partition.key()).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].run_id, second.run_id);
}
