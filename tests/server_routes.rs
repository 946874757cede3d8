mod support;

use std::sync::Arc;
use std::time::Duration;

use certpilot::acme::types::ChallengeStatus;
use certpilot::operation::CreateOperation;
use certpilot::policy::{Always, CleanupTrigger, ExpiryPolicy, Never};
use certpilot::server::{AppState, OperatorAuth, routes};
use certpilot::store::{JsonStore, OperationStore};
use certpilot::task::Task;
use certpilot::workflow::Workflow;
use poem::http::StatusCode;
use poem::test::TestClient;
use serde_json::json;
use time::OffsetDateTime;

use support::{FakeAuthority, FakeHost, RESPONSE, RecordingQueue, TOKEN, options};

const BEARER: &str = "Bearer operator-secret";

struct Fixture {
    store: Arc<JsonStore>,
    host: Arc<FakeHost>,
    queue: Arc<RecordingQueue>,
    state: Arc<AppState>,
}

fn fixture() -> Fixture {
    fixture_with_cleanup(Arc::new(Never))
}

fn fixture_with_cleanup(cleanup: Arc<dyn CleanupTrigger>) -> Fixture {
    let store = Arc::new(JsonStore::in_memory());
    let host = Arc::new(FakeHost::with_domains(&["example.com"]));
    let queue = Arc::new(RecordingQueue::default());
    let workflow = Arc::new(Workflow::new(
        store.clone(),
        Arc::new(FakeAuthority::new(ChallengeStatus::Pending, &[])),
        host.clone(),
        options(3),
    ));
    let state = Arc::new(AppState {
        workflow,
        queue: queue.clone(),
        host: host.clone(),
        operations: store.clone(),
        cleanup,
        oauth: None,
        auth: OperatorAuth::new("operator-secret"),
        expiry: ExpiryPolicy {
            soft: Duration::from_secs(3600),
            hard: Duration::from_secs(7 * 24 * 3600),
        },
        renew_before: Duration::from_secs(30 * 24 * 3600),
        self_test: None,
        http: reqwest::Client::new(),
    });
    Fixture {
        store,
        host,
        queue,
        state,
    }
}

#[tokio::test]
async fn test_operator_routes_require_token() {
    let f = fixture();
    let cli = TestClient::new(routes(f.state));

    cli.post("/ssl-certificates/create")
        .query("hostname", &"example.com")
        .send()
        .await
        .assert_status(StatusCode::UNAUTHORIZED);
    cli.get("/ssl-certificates/status")
        .header("Authorization", "Bearer wrong")
        .send()
        .await
        .assert_status(StatusCode::UNAUTHORIZED);
    cli.post("/ssl-certificates/auto-renew")
        .send()
        .await
        .assert_status(StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_create_requires_hostname() {
    let f = fixture();
    let cli = TestClient::new(routes(f.state));

    let resp = cli
        .post("/ssl-certificates/create")
        .header("Authorization", BEARER)
        .send()
        .await;
    resp.assert_status(StatusCode::BAD_REQUEST);
    resp.assert_text("Missing hostname").await;
}

#[tokio::test]
async fn test_create_then_serve_challenge() {
    let f = fixture();
    let cli = TestClient::new(routes(f.state));

    let resp = cli
        .post("/ssl-certificates/create")
        .query("hostname", &"example.com")
        .header("Authorization", BEARER)
        .send()
        .await;
    resp.assert_status_is_ok();
    resp.assert_json(json!({
        "hostname": "example.com",
        "token": TOKEN,
        "stage": "authorized",
        "issue_queued": false,
    }))
    .await;
    assert!(f.queue.taken().is_empty());

    let resp = cli
        .get(format!("/.well-known/acme-challenge/{TOKEN}"))
        .send()
        .await;
    resp.assert_status_is_ok();
    resp.assert_text(RESPONSE).await;

    let queued = f.queue.taken();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].delay, Duration::from_secs(2));
    assert_eq!(
        queued[0].task,
        Task::Issue {
            token: TOKEN.to_string()
        }
    );
}

#[tokio::test]
async fn test_challenge_route_special_cases() {
    let f = fixture();
    let cli = TestClient::new(routes(f.state));

    let resp = cli.get("/.well-known/acme-challenge/self-test").send().await;
    resp.assert_status(StatusCode::IM_A_TEAPOT);
    resp.assert_text("I'm a teapot!").await;

    let resp = cli.get("/.well-known/acme-challenge/unknown").send().await;
    resp.assert_status(StatusCode::NOT_FOUND);
    assert!(f.queue.taken().is_empty());
}

#[tokio::test]
async fn test_delete_redirects_to_status() {
    let f = fixture();
    let cli = TestClient::new(routes(f.state));

    let resp = cli
        .post("/ssl-certificates/delete")
        .query("id", &"1234")
        .header("Authorization", BEARER)
        .send()
        .await;
    resp.assert_status(StatusCode::FOUND);
    resp.assert_header("location", "/ssl-certificates/status");
    assert_eq!(*f.host.deleted.lock().unwrap(), ["1234"]);
}

#[tokio::test]
async fn test_status_lists_mapped_domains() {
    let f = fixture();
    let cli = TestClient::new(routes(f.state));

    let resp = cli
        .get("/ssl-certificates/status")
        .header("Authorization", BEARER)
        .send()
        .await;
    resp.assert_status_is_ok();
    let json = resp.json().await;
    let report = json.value().object();
    report.get("any_ongoing").assert_bool(false);
    report.get("any_not_authorized").assert_bool(false);
    let domains = report.get("domains").array();
    domains.assert_len(1);
    domains.get(0).object().get("name").assert_string("example.com");
}

#[tokio::test]
async fn test_status_sweeps_hard_expired_operations() {
    let f = fixture_with_cleanup(Arc::new(Always));
    let now = OffsetDateTime::now_utc();
    for (token, accepted) in [
        ("stale", now - time::Duration::days(8)),
        ("fresh", now - time::Duration::minutes(5)),
    ] {
        f.store
            .create(&CreateOperation::new(
                "example.com",
                token,
                "https://ca.test/authz/1",
                "https://ca.test/chall/1",
                format!("{token}.thumb"),
                accepted,
            ))
            .await
            .unwrap();
    }
    let cli = TestClient::new(routes(f.state));

    cli.get("/ssl-certificates/status")
        .header("Authorization", BEARER)
        .send()
        .await
        .assert_status_is_ok();

    let remaining: Vec<String> = f
        .store
        .list_all()
        .await
        .unwrap()
        .into_iter()
        .map(|op| op.token)
        .collect();
    assert_eq!(remaining, ["fresh"]);
}

#[tokio::test]
async fn test_login_without_oauth_is_not_found() {
    let f = fixture();
    let cli = TestClient::new(routes(f.state));

    cli.get("/ssl-certificates/login")
        .send()
        .await
        .assert_status(StatusCode::NOT_FOUND);
}
