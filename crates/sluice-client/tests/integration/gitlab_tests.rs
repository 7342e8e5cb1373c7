use sluice_client::gitlab::{
    GitlabPlugin, GitlabProjectLookup, ISSUES_TABLE, MR_NOTES_TABLE, PIPELINES_TABLE, PLUGIN_NAME,
    client_config, descriptor, subtasks,
};
use sluice_client::{HeaderToken, ReqwestTransport};
use sluice_core::client::{AsyncClient, ClientConfig};
use sluice_core::collector::CollectorConfig;
use sluice_core::compiler::{ConnectionInfo, PlanCompiler};
use sluice_core::models::Partition;
use sluice_core::plan::{Options, PipelineTask, ScopeConfig};
use sluice_core::registry::PluginRegistry;
use sluice_core::runner::run_task;
use sluice_core::testutil::{MemoryStagingStore, MockReporter};
use tokio_util::sync::CancellationToken;

use crate::integration::fixture::{self, PROJECT_ID, TOKEN};

fn client(config: ClientConfig, token: &str) -> AsyncClient<ReqwestTransport> {
    AsyncClient::builder(ReqwestTransport::new().unwrap(), config)
        .with_request_hook(HeaderToken::gitlab(token))
        .build()
        .unwrap()
}

fn task(subtasks: &[&str]) -> PipelineTask {
    let mut options = Options::new();
    options.insert("connectionId".into(), 1.into());
    options.insert("projectId".into(), PROJECT_ID.into());
    PipelineTask::new(PLUGIN_NAME, subtasks.iter().map(|s| s.to_string()).collect(), options)
}

fn partition_key(table: &str) -> String {
    Partition::new(1, serde_json::json!({ "projectId": PROJECT_ID }), table).key()
}

fn item_ids(store: &MemoryStagingStore, table: &str) -> Vec<u64> {
    let mut ids: Vec<u64> = store
        .load(&partition_key(table))
        .iter()
        .flat_map(|row| {
            row.payload()
                .unwrap()
                .as_array()
                .unwrap()
                .iter()
                .map(|item| item["id"].as_u64().unwrap())
                .collect::<Vec<_>>()
        })
        .collect();
    ids.sort_unstable();
    ids
}

#[tokio::test]
async fn issues_are_collected_fully_then_incrementally() {
    let server = fixture::start().await;
    let store = MemoryStagingStore::new();
    let plugin = GitlabPlugin::new(
        client(client_config(server.endpoint()), TOKEN),
        store.clone(),
        CollectorConfig::default().with_page_size(2).with_incremental(true),
    );
    let cancel = CancellationToken::new();
    let reporter = MockReporter::new();

    run_task(&plugin, &task(&["collectIssues"]), &cancel, &reporter)
        .await
        .unwrap();
    assert_eq!(store.load(&partition_key(ISSUES_TABLE)).len(), 2);
    assert_eq!(item_ids(&store, ISSUES_TABLE), vec![101, 102, 103, 104]);

    let state = store.state(&partition_key(ISSUES_TABLE)).unwrap();
    assert_eq!(
        state.cursor.map(|c| c.to_rfc3339()),
        Some("2024-05-04T12:00:00+00:00".to_string())
    );

    run_task(&plugin, &task(&["collectIssues"]), &cancel, &reporter)
        .await
        .unwrap();
    let rows = store.load(&partition_key(ISSUES_TABLE));
    assert_eq!(rows.len(), 3);
    assert_eq!(item_ids(&store, ISSUES_TABLE), vec![101, 102, 103, 104, 104]);
    assert!(reporter.events().iter().filter(|e| e.starts_with("task_finished")).count() == 2);
}

#[tokio::test]
async fn notes_follow_staged_merge_requests() {
    let server = fixture::start().await;
    let store = MemoryStagingStore::new();
    let plugin = GitlabPlugin::new(
        client(client_config(server.endpoint()), TOKEN),
        store.clone(),
        CollectorConfig::default(),
    );

    run_task(
        &plugin,
        &task(&["collectMergeRequests", "collectMrNotes"]),
        &CancellationToken::new(),
        &MockReporter::new(),
    )
    .await
    .unwrap();

    assert_eq!(item_ids(&store, MR_NOTES_TABLE), vec![50, 51, 60, 61]);
}

#[tokio::test]
async fn forbidden_pipelines_are_skipped_when_ignored() {
    let server = fixture::start().await;
    let store = MemoryStagingStore::new();
    let config = client_config(server.endpoint()).with_ignore_status(403);
    let plugin = GitlabPlugin::new(client(config, TOKEN), store.clone(), CollectorConfig::default());

    run_task(&plugin, &task(&["collectPipelines"]), &CancellationToken::new(), &MockReporter::new())
        .await
        .unwrap();

    assert!(store.load(&partition_key(PIPELINES_TABLE)).is_empty());
    assert!(store.state(&partition_key(PIPELINES_TABLE)).is_some());
}

#[tokio::test]
async fn forbidden_pipelines_fail_by_default() {
    let server = fixture::start().await;
    let plugin = GitlabPlugin::new(
        client(client_config(server.endpoint()), TOKEN),
        MemoryStagingStore::new(),
        CollectorConfig::default(),
    );

    let err = run_task(&plugin, &task(&["collectPipelines"]), &CancellationToken::new(), &MockReporter::new())
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), Some(403));
}

#[tokio::test]
async fn bad_token_fails_the_subtask_without_staging() {
    let server = fixture::start().await;
    let store = MemoryStagingStore::new();
    let plugin = GitlabPlugin::new(
        client(client_config(server.endpoint()), "glpat-wrong"),
        store.clone(),
        CollectorConfig::default(),
    );

    let err = run_task(&plugin, &task(&["collectIssues"]), &CancellationToken::new(), &MockReporter::new())
        .await
        .unwrap_err();

    assert_eq!(err.status_code(), Some(401));
    assert!(store.state(&partition_key(ISSUES_TABLE)).is_none());
    assert_eq!(store.uncommitted_count(), 0);
}

#[tokio::test]
async fn compiled_plan_clones_through_looked_up_url() {
    let server = fixture::start().await;
    let registry = PluginRegistry::new().with(descriptor()).unwrap();
    let lookup = GitlabProjectLookup::new(client(client_config(server.endpoint()), TOKEN));
    let scopes = [ScopeConfig::new(
        &["CODE", "TICKET"],
        serde_json::json!({ "projectId": PROJECT_ID }),
    )];

    let plan = PlanCompiler::new(&registry, lookup)
        .compile(
            PLUGIN_NAME,
            &subtasks::<ReqwestTransport, MemoryStagingStore>(),
            &ConnectionInfo::new(1, TOKEN),
            &scopes,
        )
        .await
        .unwrap()
        .into_result()
        .unwrap();

    assert_eq!(plan.len(), 1);
    let tasks = plan.stages()[0].tasks();
    assert_eq!(tasks.len(), 2);
    assert_eq!(
        tasks[0].subtasks,
        vec!["collectMilestones", "collectIssues", "collectMergeRequests"]
    );
    assert_eq!(tasks[1].plugin, "gitextractor");
    assert_eq!(
        tasks[1].options["url"],
        format!("http://git:{TOKEN}@{}/infra/sluice.git", server.host())
    );
    assert_eq!(tasks[1].options["repoId"], "gitlab:GitlabProject:1:37");
}
