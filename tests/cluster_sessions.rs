mod common;

use std::time::Duration;

use common::{client, eventually, set_cookie, Cluster, MockCouch};
use reqwest::StatusCode;
use serde_json::{json, Value};

async fn routed(c: &reqwest::Client, url: &str, expect: StatusCode) -> bool {
    eventually(Duration::from_secs(5), || async move {
        matches!(c.get(url).header("accept", "application/json").send().await, Ok(r) if r.status() == expect)
    })
    .await
}

#[tokio::test]
async fn login_on_one_node_is_honored_on_the_other() {
    let couch = MockCouch::start().await;
    couch.add_user("jane", "secret", &["editor"]);
    couch.publish("app-doc", json!({"appId": "app", "contextPath": "/app"}), "1-a", b"archive v1");
    let cluster = Cluster::start(&couch, 2, Duration::from_millis(500)).await;
    let c = client();
    let (n1, n2) = (&cluster.urls[0], &cluster.urls[1]);
    assert!(routed(&c, &format!("{}/app/profile", n1), StatusCode::UNAUTHORIZED).await);
    assert!(routed(&c, &format!("{}/app/profile", n2), StatusCode::UNAUTHORIZED).await);

    let resp = c.post(format!("{}/app/login", n1)).form(&[("name", "jane"), ("password", "secret"), ("next", "/app/profile")]).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::SEE_OTHER);
    assert_eq!(resp.headers().get("location").unwrap(), "/app/profile");
    let auth = set_cookie(&resp, "AuthSession").expect("auth cookie");
    let token = auth.split_once('=').unwrap().1.to_string();

    let resp = c.get(format!("{}/app/profile", n2)).header("cookie", &auth).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["user"], "jane");
    assert_eq!(body["roles"], json!(["editor"]));

    for node in &cluster.nodes {
        let p = node.login_service().active_users().get(&token).await.unwrap().expect("active user");
        assert_eq!(p.user_id, "jane");
    }

    let resp = c.post(format!("{}/app/login", n1)).form(&[("name", "jane"), ("password", "wrong")]).header("accept", "application/json").send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    assert!(resp.headers().get("www-authenticate").unwrap().to_str().unwrap().starts_with("Cookie realm="));
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "auth_denied");
    cluster.shutdown().await;
}

#[tokio::test]
async fn browsers_are_sent_to_the_login_page() {
    let couch = MockCouch::start().await;
    couch.publish("app-doc", json!({"appId": "app", "contextPath": "/app"}), "1-a", b"archive v1");
    let cluster = Cluster::start(&couch, 1, Duration::from_millis(500)).await;
    let c = client();
    let url = &cluster.urls[0];
    assert!(routed(&c, &format!("{}/app/", url), StatusCode::UNAUTHORIZED).await);

    let resp = c.get(format!("{}/app/profile?tab=1", url)).header("accept", "text/html").send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::FOUND);
    assert_eq!(resp.headers().get("location").unwrap(), "/app/login?next=%2Fapp%2Fprofile%3Ftab%3D1");
    assert!(resp.headers().get("x-request-id").is_some());

    // The login page itself is served anonymously.
    let resp = c.get(format!("{}/app/login", url)).header("accept", "text/html").send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let resp = c.get(format!("{}/nowhere", url)).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    cluster.shutdown().await;
}

#[tokio::test]
async fn session_attributes_follow_the_client_across_nodes() {
    let couch = MockCouch::start().await;
    couch.publish("app-doc", json!({"appId": "app", "contextPath": "/app", "options": {"auth": "optional"}}), "1-a", b"archive v1");
    let cluster = Cluster::start(&couch, 2, Duration::from_millis(500)).await;
    let c = client();
    let (n1, n2) = (&cluster.urls[0], &cluster.urls[1]);
    assert!(routed(&c, &format!("{}/app/session", n1), StatusCode::OK).await);
    assert!(routed(&c, &format!("{}/app/session", n2), StatusCode::OK).await);

    // Reading without writing creates nothing.
    let resp = c.get(format!("{}/app/session", n1)).send().await.unwrap();
    assert!(set_cookie(&resp, "camelback_session").is_none());

    let resp = c.post(format!("{}/app/session", n1)).form(&[("color", "blue")]).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let sid = set_cookie(&resp, "camelback_session").expect("session cookie");
    let id = sid.split_once('=').unwrap().1.to_string();
    assert!(id.ends_with(&format!(".{}", cluster.nodes[0].fabric().worker_suffix())));

    let body: Value = c.get(format!("{}/app/session", n2)).header("cookie", &sid).send().await.unwrap().json().await.unwrap();
    assert_eq!(body["id"], id.as_str());
    assert_eq!(body["attributes"]["color"], "blue");

    // Write on n2, read on n1.
    c.post(format!("{}/app/session", n2)).header("cookie", &sid).form(&[("size", "xl")]).send().await.unwrap();
    let body: Value = c.get(format!("{}/app/session", n1)).header("cookie", &sid).send().await.unwrap().json().await.unwrap();
    assert_eq!(body["attributes"]["size"], "xl");
    assert_eq!(body["attributes"]["color"], "blue");

    // URL parameter works as well as the cookie.
    let body: Value = c.get(format!("{}/app/session?sessionid={}", n2, id)).send().await.unwrap().json().await.unwrap();
    assert_eq!(body["id"], id.as_str());

    let resp = c.post(format!("{}/app/session/invalidate", n2)).header("cookie", &sid).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    assert!(resp.headers().get_all("set-cookie").iter().any(|v| v.to_str().unwrap().contains("Max-Age=0")));

    let body: Value = c.get(format!("{}/app/session", n1)).header("cookie", &sid).send().await.unwrap().json().await.unwrap();
    assert_eq!(body["id"], Value::Null);
    cluster.shutdown().await;
}

#[tokio::test]
async fn invalidation_during_a_partition_is_seen_after_healing() {
    let couch = MockCouch::start().await;
    couch.publish("app-doc", json!({"appId": "app", "contextPath": "/app", "options": {"auth": "none"}}), "1-a", b"archive v1");
    let cluster = Cluster::start(&couch, 2, Duration::from_millis(300)).await;
    let c = client();
    let (n1, n2) = (&cluster.urls[0], &cluster.urls[1]);
    assert!(routed(&c, &format!("{}/app/session", n1), StatusCode::OK).await);
    assert!(routed(&c, &format!("{}/app/session", n2), StatusCode::OK).await);

    let resp = c.post(format!("{}/app/session", n1)).form(&[("cart", "3")]).send().await.unwrap();
    let sid = set_cookie(&resp, "camelback_session").unwrap();
    let body: Value = c.get(format!("{}/app/session", n2)).header("cookie", &sid).send().await.unwrap().json().await.unwrap();
    assert_eq!(body["attributes"]["cart"], "3");

    let n2_member = cluster.nodes[1].fabric().member().uuid;
    cluster.grid.partition(&n2_member);
    let resp = c.post(format!("{}/app/session/invalidate", n1)).header("cookie", &sid).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);

    // Cut off from the grid, n2 cannot answer for the session.
    let resp = c.get(format!("{}/app/session", n2)).header("cookie", &sid).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "fabric_unavailable");

    cluster.grid.heal(&n2_member);
    let body: Value = c.get(format!("{}/app/session", n2)).header("cookie", &sid).send().await.unwrap().json().await.unwrap();
    assert_eq!(body["id"], Value::Null);
    cluster.shutdown().await;
}

#[tokio::test]
async fn logging_out_ends_the_session_and_the_sign_on() {
    let couch = MockCouch::start().await;
    couch.add_user("sam", "pw", &[]);
    couch.publish("app-doc", json!({"appId": "app", "contextPath": "/app"}), "1-a", b"archive v1");
    let cluster = Cluster::start(&couch, 2, Duration::from_millis(500)).await;
    let c = client();
    let (n1, n2) = (&cluster.urls[0], &cluster.urls[1]);
    assert!(routed(&c, &format!("{}/app/", n1), StatusCode::UNAUTHORIZED).await);
    assert!(routed(&c, &format!("{}/app/", n2), StatusCode::UNAUTHORIZED).await);

    let resp = c.post(format!("{}/app/login", n1)).form(&[("name", "sam"), ("password", "pw")]).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::SEE_OTHER);
    let auth = set_cookie(&resp, "AuthSession").unwrap();
    let sid = set_cookie(&resp, "camelback_session").expect("login binds a session");
    let token = auth.split_once('=').unwrap().1.to_string();
    let cookies = format!("{}; {}", auth, sid);

    let body: Value = c.get(format!("{}/app/session", n2)).header("cookie", &cookies).send().await.unwrap().json().await.unwrap();
    assert_eq!(body["attributes"]["camelback.auth_token"], token.as_str());

    let resp = c.post(format!("{}/app/login/logout", n2)).header("cookie", &cookies).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::SEE_OTHER);
    assert_eq!(resp.headers().get("location").unwrap(), "/app/login");
    assert!(cluster.nodes[0].login_service().active_users().get(&token).await.unwrap().is_none());
    let body: Value = c.get(format!("{}/app/session", n1)).header("cookie", &sid).header("x-auth-token", &token).send().await.unwrap().json().await.unwrap();
    assert_eq!(body["id"], Value::Null);
    cluster.shutdown().await;
}

#[tokio::test]
async fn invalidating_a_session_signs_its_user_out() {
    let couch = MockCouch::start().await;
    couch.add_user("kim", "pw", &[]);
    couch.publish("app-doc", json!({"appId": "app", "contextPath": "/app"}), "1-a", b"archive v1");
    let cluster = Cluster::start(&couch, 1, Duration::from_millis(500)).await;
    let c = client();
    let url = &cluster.urls[0];
    assert!(routed(&c, &format!("{}/app/", url), StatusCode::UNAUTHORIZED).await);

    let resp = c.post(format!("{}/app/login", url)).form(&[("name", "kim"), ("password", "pw")]).send().await.unwrap();
    let auth = set_cookie(&resp, "AuthSession").unwrap();
    let sid = set_cookie(&resp, "camelback_session").unwrap();
    let token = auth.split_once('=').unwrap().1.to_string();
    let login = cluster.nodes[0].login_service();
    assert!(login.active_users().get(&token).await.unwrap().is_some());

    let resp = c.post(format!("{}/app/session/invalidate", url)).header("cookie", format!("{}; {}", auth, sid)).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    assert!(login.active_users().get(&token).await.unwrap().is_none());
    cluster.shutdown().await;
}
