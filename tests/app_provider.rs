mod common;

use std::sync::Arc;
use std::time::Duration;

use camelback::deploy::ContextFactory;
use camelback::fabric::{FabricConfig, Grid};
use camelback::{AppError, CamelbackConfig, Node};
use common::{client, eventually, Cluster, FlakyFactory, MockCouch};
use reqwest::StatusCode;
use serde_json::{json, Value};

/// A node that is never started: the test drives `poll_once` itself.
fn idle_node(couch: &MockCouch, tweak: impl Fn(&mut CamelbackConfig), factory: Option<Arc<dyn ContextFactory>>) -> (Node, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let mut config = couch.config(dir.path());
    tweak(&mut config);
    let grid = Grid::start(FabricConfig::default());
    let store = camelback::identity::CouchDbAuthenticator::new(config.couchdb_settings().unwrap()).unwrap();
    let factory = factory.unwrap_or_else(|| Arc::new(camelback::deploy::ArchiveContextFactory));
    (Node::build_with(config, grid.join(None).unwrap(), Arc::new(store), factory).unwrap(), dir)
}

fn wiki(rev_note: &str) -> Value {
    json!({"appId": "wiki", "contextPath": "/wiki", "options": {"auth": "optional", "note": rev_note}})
}

fn live_revision(node: &Node, app: &str) -> Option<String> {
    node.deployments().get(app).map(|c| c.app.revision.to_string())
}

#[tokio::test]
async fn added_apps_are_installed_once() {
    let couch = MockCouch::start().await;
    couch.publish("wiki-doc", wiki("one"), "1-a", b"wiki one");
    let (node, dir) = idle_node(&couch, |_| {}, None);

    let r = node.provider().poll_once().await.unwrap();
    assert!(r.changed);
    assert_eq!(r.added, vec!["wiki".to_string()]);
    assert!(r.failed.is_empty());
    assert_eq!(live_revision(&node, "wiki").as_deref(), Some("1-a"));
    assert!(dir.path().join("wiki").join("1-a.war").exists());
    assert_eq!(node.sessions().managers().len(), 1);

    // Same sequence: the view answers 304 and nothing is fetched again.
    let fetched = couch.attachment_hits();
    let r = node.provider().poll_once().await.unwrap();
    assert!(!r.changed);
    assert_eq!(couch.attachment_hits(), fetched);
    node.shutdown().await;
}

#[tokio::test]
async fn new_revision_swaps_in_and_old_artifact_is_deleted() {
    let couch = MockCouch::start().await;
    couch.publish("wiki-doc", wiki("one"), "1-a", b"wiki one");
    let (node, dir) = idle_node(&couch, |_| {}, None);
    node.provider().poll_once().await.unwrap();
    let old = dir.path().join("wiki").join("1-a.war");

    couch.publish("wiki-doc", wiki("two"), "2-b", b"wiki two");
    let r = node.provider().poll_once().await.unwrap();
    assert_eq!(r.updated, vec!["wiki".to_string()]);
    assert!(r.added.is_empty());
    assert_eq!(live_revision(&node, "wiki").as_deref(), Some("2-b"));
    assert_eq!(node.deployments().contexts().len(), 1);
    assert!(eventually(Duration::from_secs(3), || async { !old.exists() }).await);
    assert!(dir.path().join("wiki").join("2-b.war").exists());
    node.shutdown().await;
}

#[tokio::test]
async fn removed_rows_uninstall_their_context() {
    let couch = MockCouch::start().await;
    couch.publish("wiki-doc", wiki("one"), "1-a", b"wiki one");
    couch.publish("blog-doc", json!({"appId": "blog", "contextPath": "/blog"}), "1-c", b"blog");
    let (node, dir) = idle_node(&couch, |_| {}, None);
    let r = node.provider().poll_once().await.unwrap();
    assert_eq!(r.added, vec!["blog".to_string(), "wiki".to_string()]);

    couch.unpublish("blog-doc");
    let r = node.provider().poll_once().await.unwrap();
    assert_eq!(r.removed, vec!["blog".to_string()]);
    assert!(node.deployments().get("blog").is_none());
    assert!(node.deployments().get("wiki").is_some());
    let blog_dir = dir.path().join("blog");
    assert!(eventually(Duration::from_secs(3), || async { !blog_dir.exists() }).await);
    assert!(eventually(Duration::from_secs(3), || async { node.sessions().managers().len() == 1 }).await);
    assert_eq!(node.sessions().managers()[0].context_path(), "/wiki");
    node.shutdown().await;
}

#[tokio::test]
async fn finished_retirements_are_collected_by_the_next_poll() {
    let couch = MockCouch::start().await;
    couch.publish("wiki-doc", wiki("one"), "1-a", b"wiki one");
    let (node, dir) = idle_node(&couch, |_| {}, None);
    node.provider().poll_once().await.unwrap();

    couch.publish("wiki-doc", wiki("two"), "2-b", b"wiki two");
    let r = node.provider().poll_once().await.unwrap();
    assert_eq!(r.updated, vec!["wiki".to_string()]);
    assert_eq!(node.provider().retiring().await, 1);
    let old = dir.path().join("wiki").join("1-a.war");
    assert!(eventually(Duration::from_secs(3), || async { !old.exists() }).await);

    let provider = node.provider();
    assert!(eventually(Duration::from_secs(3), || async {
        provider.poll_once().await.is_ok() && provider.retiring().await == 0
    })
    .await);
    // The context path is still served, so its manager survives the swap.
    assert_eq!(node.sessions().managers().len(), 1);
    node.shutdown().await;
}

#[tokio::test]
async fn stale_rows_do_not_downgrade() {
    let couch = MockCouch::start().await;
    couch.publish("wiki-doc", wiki("two"), "2-b", b"wiki two");
    let (node, _dir) = idle_node(&couch, |_| {}, None);
    node.provider().poll_once().await.unwrap();

    couch.publish("wiki-doc", wiki("one"), "1-a", b"wiki one");
    let r = node.provider().poll_once().await.unwrap();
    assert_eq!(r.stale, vec!["wiki".to_string()]);
    assert!(r.updated.is_empty());
    assert_eq!(live_revision(&node, "wiki").as_deref(), Some("2-b"));
    node.shutdown().await;
}

#[tokio::test]
async fn fetch_failure_keeps_the_previous_revision_and_retries() {
    let couch = MockCouch::start().await;
    couch.publish("wiki-doc", wiki("one"), "1-a", b"wiki one");
    let (node, _dir) = idle_node(&couch, |_| {}, None);
    node.provider().poll_once().await.unwrap();
    let seq = node.provider().last_seq().await;

    // Row points at a revision whose attachment does not exist.
    couch.publish_raw("wiki-doc", json!({"appId": "wiki", "contextPath": "/wiki", "rev": "2-b", "attachment": "app.war"}));
    for _ in 0..2 {
        let r = node.provider().poll_once().await.unwrap();
        assert!(r.changed, "a retryable failure keeps the sequence from advancing");
        assert_eq!(r.failed.len(), 1);
        assert!(r.failed[0].1.contains("artifact fetch failed"));
        assert!(r.suppressed.is_empty());
        assert_eq!(live_revision(&node, "wiki").as_deref(), Some("1-a"));
        assert_eq!(node.provider().last_seq().await, seq);
    }

    couch.publish("wiki-doc", wiki("two"), "2-b", b"wiki two");
    let r = node.provider().poll_once().await.unwrap();
    assert_eq!(r.updated, vec!["wiki".to_string()]);
    assert_eq!(live_revision(&node, "wiki").as_deref(), Some("2-b"));
    node.shutdown().await;
}

#[tokio::test]
async fn artifact_size_limit_is_inclusive() {
    let couch = MockCouch::start().await;
    couch.publish("exact-doc", json!({"appId": "exact", "contextPath": "/exact"}), "1-a", &[7u8; 64]);
    couch.publish("big-doc", json!({"appId": "big", "contextPath": "/big"}), "1-a", &[7u8; 65]);
    let (node, dir) = idle_node(&couch, |c| c.deployer_config.max_artifact_bytes = 64, None);

    let r = node.provider().poll_once().await.unwrap();
    assert_eq!(r.added, vec!["exact".to_string()]);
    assert_eq!(r.failed.len(), 1);
    assert_eq!(r.failed[0].0, "big");
    assert!(node.deployments().get("big").is_none());
    assert!(!dir.path().join("big").join("1-a.war").exists());
    assert!(!dir.path().join("big").join("1-a.war.part").exists());
    node.shutdown().await;
}

#[tokio::test]
async fn repeated_start_failures_are_suppressed_until_the_revision_changes() {
    let couch = MockCouch::start().await;
    couch.publish("wiki-doc", json!({"appId": "wiki", "contextPath": "/wiki", "options": {"broken": "yes"}}), "1-a", b"wiki one");
    let factory: Arc<dyn ContextFactory> = Arc::new(FlakyFactory);
    let (node, _dir) = idle_node(&couch, |c| c.deployer_config.max_start_failures = 3, Some(factory));

    for attempt in 1..=3 {
        let r = node.provider().poll_once().await.unwrap();
        assert!(r.changed);
        assert_eq!(r.failed.len(), 1);
        assert!(r.failed[0].1.contains("context start failed"));
        assert_eq!(r.suppressed.len(), if attempt == 3 { 1 } else { 0 }, "attempt {}", attempt);
        assert!(node.deployments().get("wiki").is_none());
    }
    // Suppressed: the sequence advanced, so nothing more happens until the row changes.
    let r = node.provider().poll_once().await.unwrap();
    assert!(!r.changed);

    couch.publish("wiki-doc", json!({"appId": "wiki", "contextPath": "/wiki"}), "2-b", b"wiki two");
    let r = node.provider().poll_once().await.unwrap();
    assert_eq!(r.added, vec!["wiki".to_string()]);
    node.shutdown().await;
}

#[tokio::test]
async fn view_outage_preserves_deployed_state() {
    let couch = MockCouch::start().await;
    couch.publish("wiki-doc", wiki("one"), "1-a", b"wiki one");
    let (node, _dir) = idle_node(&couch, |_| {}, None);
    node.provider().poll_once().await.unwrap();

    couch.set_view_down(true);
    couch.unpublish("wiki-doc");
    let err = node.provider().poll_once().await.unwrap_err();
    assert!(matches!(err, AppError::DatabaseUnavailable(_)));
    assert!(node.deployments().get("wiki").is_some());

    couch.set_view_down(false);
    let r = node.provider().poll_once().await.unwrap();
    assert_eq!(r.removed, vec!["wiki".to_string()]);
    node.shutdown().await;
}

#[tokio::test]
async fn unreadable_rows_are_not_removals() {
    let couch = MockCouch::start().await;
    couch.publish("wiki-doc", wiki("one"), "1-a", b"wiki one");
    let (node, _dir) = idle_node(&couch, |_| {}, None);
    node.provider().poll_once().await.unwrap();

    couch.publish_raw("wiki-doc", json!({"appId": "wiki", "contextPath": "/wiki"}));
    let r = node.provider().poll_once().await.unwrap();
    assert!(r.changed);
    assert!(r.removed.is_empty());
    assert_eq!(live_revision(&node, "wiki").as_deref(), Some("1-a"));
    node.shutdown().await;
}

#[tokio::test]
async fn only_one_app_may_claim_a_path() {
    let couch = MockCouch::start().await;
    couch.publish("a-doc", json!({"appId": "a", "contextPath": "/shared"}), "1-a", b"a");
    couch.publish("b-doc", json!({"appId": "b", "contextPath": "/shared"}), "1-a", b"b");
    couch.publish("c-doc", json!({"appId": "c", "contextPath": "/shared", "hosts": ["c.example.com"]}), "1-a", b"c");
    let (node, _dir) = idle_node(&couch, |_| {}, None);

    let r = node.provider().poll_once().await.unwrap();
    assert_eq!(r.added.len(), 2, "{:?}", r);
    assert!(r.added.contains(&"c".to_string()));
    assert_eq!(r.failed.len(), 1);
    assert!(r.failed[0].1.contains("already served"));
    assert_eq!(node.deployments().contexts().len(), 2);
    node.shutdown().await;
}

#[tokio::test]
async fn hot_redeploy_under_traffic_never_fails_a_request() {
    let couch = MockCouch::start().await;
    couch.publish("wiki-doc", wiki("one"), "1-a", b"wiki one");
    let cluster = Cluster::start(&couch, 1, Duration::from_millis(500)).await;
    let c = client();
    let url = format!("{}/wiki/", cluster.urls[0]);
    let revision = |c: &reqwest::Client, url: &str| {
        let req = c.get(url);
        async move {
            match req.send().await {
                Ok(r) if r.status() == StatusCode::OK => r.json::<Value>().await.ok().and_then(|b| b["revision"].as_str().map(|s| s.to_string())),
                _ => None,
            }
        }
    };
    {
        let (c, url) = (&c, url.as_str());
        assert!(eventually(Duration::from_secs(5), || async move { revision(c, url).await.as_deref() == Some("1-a") }).await);
    }

    couch.publish("wiki-doc", wiki("two"), "2-b", b"wiki two");
    let mut seen_new = false;
    for _ in 0..100 {
        let batch = futures_util::future::join_all((0..8).map(|_| c.get(url.as_str()).send())).await;
        for resp in batch {
            let resp = resp.unwrap();
            assert!(!resp.status().is_server_error(), "request failed during swap: {}", resp.status());
            assert_eq!(resp.status(), StatusCode::OK);
            let body: Value = resp.json().await.unwrap();
            let rev = body["revision"].as_str().unwrap().to_string();
            assert!(rev == "1-a" || rev == "2-b");
            if rev == "2-b" { seen_new = true; }
        }
        if seen_new { break; }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(seen_new, "new revision was not served within the convergence window");
    cluster.shutdown().await;
}
