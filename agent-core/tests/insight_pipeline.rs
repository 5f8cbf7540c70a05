//! The full cluster pipeline against an in-memory cluster and mocked
//! upstream: sweep, incremental sync, bounded auto-remediation, reporting.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

use agent_core::cluster::fake::FakeCluster;
use agent_core::cluster::{ObjectMeta, Pod, PodStatus};
use agent_core::insights::{default_excluded_namespaces, InsightEngine, InsightReporter, Severity};
use agent_core::remediation::{
    CircuitBreaker, RemediationReporter, Remediator, DEFAULT_COOLDOWN,
};

fn stale_pod(namespace: &str, name: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: name.into(),
            namespace: namespace.into(),
            ..Default::default()
        },
        status: PodStatus {
            phase: "Failed".into(),
            start_time: Some(Utc::now() - chrono::Duration::hours(3)),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn seeded_cluster() -> FakeCluster {
    let cluster = FakeCluster::new();
    cluster.add_namespace("default");
    cluster.add_pod(stale_pod("default", "job-a"));
    cluster.add_pod(stale_pod("default", "job-b"));
    cluster.add_pod(stale_pod("default", "job-c"));
    cluster
}

#[tokio::test]
async fn sweep_finds_sorted_deduplicated_insights() {
    let cluster = seeded_cluster();
    let mut stuck = stale_pod("default", "stuck-pod");
    stuck.status.phase = "Running".into();
    stuck.metadata.deletion_timestamp = Some(Utc::now() - chrono::Duration::minutes(30));
    cluster.add_pod(stuck);

    let engine = InsightEngine::new(default_excluded_namespaces());
    let insights = engine.analyze(&cluster).await;

    assert_eq!(insights.len(), 4);
    // action-severity (stuck_terminating) sorts before the suggestions.
    assert_eq!(insights[0].severity, Severity::Action);
    assert_eq!(insights[0].analyzer, "stuck_terminating");
    assert!(insights[1..].iter().all(|i| i.severity == Severity::Suggestion));

    let mut fingerprints: Vec<&str> = insights.iter().map(|i| i.fingerprint.as_str()).collect();
    fingerprints.sort();
    fingerprints.dedup();
    assert_eq!(fingerprints.len(), 4, "fingerprints must be unique");
}

#[tokio::test]
async fn unchanged_sweeps_produce_exactly_one_sync() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/functions/v1/cluster-insights/sync"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"upserted": 3, "auto_resolved": 0})),
        )
        .expect(2)
        .mount(&server)
        .await;

    let cluster = seeded_cluster();
    let engine = InsightEngine::new(default_excluded_namespaces());
    let reporter = InsightReporter::new(&server.uri(), "tok", "anon");

    // Two identical sweeps: one HTTP call.
    let sweep = engine.analyze(&cluster).await;
    assert!(reporter.report(&sweep).await.unwrap());
    let sweep = engine.analyze(&cluster).await;
    assert!(!reporter.report(&sweep).await.unwrap());

    // A new finding changes the fingerprint set and triggers the second.
    cluster.add_pod(stale_pod("default", "job-d"));
    let sweep = engine.analyze(&cluster).await;
    assert!(reporter.report(&sweep).await.unwrap());
}

#[tokio::test]
async fn remediation_is_bounded_and_reported() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/functions/v1/cluster-remediations/report"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(1)
        .mount(&server)
        .await;

    let cluster = Arc::new(seeded_cluster());
    let engine = InsightEngine::new(default_excluded_namespaces());
    let breaker = Arc::new(CircuitBreaker::new(2, DEFAULT_COOLDOWN));
    let remediator = Remediator::new(cluster.clone(), breaker, false);
    let reporter = RemediationReporter::new(&server.uri(), "tok", "anon");

    let insights = engine.analyze(cluster.as_ref()).await;
    assert_eq!(insights.len(), 3);

    let results = remediator.remediate(&insights).await;
    assert_eq!(results.len(), 2, "breaker must open after two remediations");
    assert!(results.iter().all(|r| r.success));
    assert_eq!(cluster.deleted_pods().len(), 2);

    reporter.report(&results).await.unwrap();

    // Verify the report body carried both remediations.
    let requests = server.received_requests().await.unwrap();
    let report: &Request = requests
        .iter()
        .find(|r| r.url.path().ends_with("/cluster-remediations/report"))
        .unwrap();
    let body: serde_json::Value = serde_json::from_slice(&report.body).unwrap();
    assert_eq!(body["agent_token"], "tok");
    assert_eq!(body["remediations"].as_array().unwrap().len(), 2);
    assert_eq!(body["remediations"][0]["action"], "delete_pod");
}

#[tokio::test]
async fn dry_run_pipeline_touches_nothing() {
    let cluster = Arc::new(seeded_cluster());
    let engine = InsightEngine::new(default_excluded_namespaces());
    let breaker = Arc::new(CircuitBreaker::new(10, Duration::from_secs(1)));
    let remediator = Remediator::new(cluster.clone(), breaker, true);

    let insights = engine.analyze(cluster.as_ref()).await;
    let results = remediator.remediate(&insights).await;

    assert_eq!(results.len(), 3);
    assert!(results.iter().all(|r| r.dry_run && r.success));
    assert!(results
        .iter()
        .all(|r| r.message == "[DRY RUN] delete_pod skipped"));
    assert!(cluster.deleted_pods().is_empty());
}
