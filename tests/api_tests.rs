//! Router-level integration tests driving the HTTP surface against a mock
//! executor.

mod common;

use axum::body::Body;
use axum::http::{header::AUTHORIZATION, Request, StatusCode};
use base64::Engine;
use tower::ServiceExt;

use calls_offloader::auth::MIN_KEY_LEN;
use calls_offloader::random;

use common::{setup, TestHarness, ADMIN_SECRET, VALID_RUNNER};

enum Auth {
    None,
    Bearer(String),
    AdminBasic,
}

fn request(
    method: &str,
    uri: &str,
    auth: &Auth,
    body: Option<serde_json::Value>,
) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);

    builder = match auth {
        Auth::None => builder,
        Auth::Bearer(token) => builder.header(AUTHORIZATION, format!("Bearer {token}")),
        Auth::AdminBasic => {
            let encoded =
                base64::engine::general_purpose::STANDARD.encode(format!("admin:{ADMIN_SECRET}"));
            builder.header(AUTHORIZATION, format!("Basic {encoded}"))
        }
    };

    match body {
        Some(body) => builder
            .header("Content-Type", "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

async fn send(harness: &TestHarness, req: Request<Body>) -> (StatusCode, serde_json::Value) {
    let resp = harness.router.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), 1024 * 1024)
        .await
        .unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
    (status, body)
}

async fn register_and_login(harness: &TestHarness, client_id: &str) -> String {
    let key = random::new_secure_string(MIN_KEY_LEN);
    harness.auth.register(client_id, &key).unwrap();

    let (status, body) = send(
        harness,
        request(
            "POST",
            "/login",
            &Auth::None,
            Some(serde_json::json!({ "clientID": client_id, "authKey": key })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    body["bearerToken"].as_str().unwrap().to_string()
}

fn recording_job_body() -> serde_json::Value {
    serde_json::json!({
        "type": "recording",
        "runner": VALID_RUNNER,
        "max_duration_sec": 60,
        "input_data": {
            "site_url": "http://localhost:8065",
            "call_id": "abc",
            "post_id": "def",
            "auth_token": "xyz",
            "recording_id": "rec",
        },
    })
}

// -- Auth routes --

#[tokio::test]
async fn register_requires_admin_or_self_registration() {
    let harness = setup(2, false);
    let body = serde_json::json!({
        "clientID": "clientA",
        "authKey": random::new_secure_string(MIN_KEY_LEN),
    });

    let (status, _) = send(
        &harness,
        request("POST", "/register", &Auth::None, Some(body.clone())),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = send(
        &harness,
        request("POST", "/register", &Auth::AdminBasic, Some(body)),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
}

#[tokio::test]
async fn register_allows_self_registration_when_enabled() {
    let harness = setup(2, true);
    let (status, _) = send(
        &harness,
        request(
            "POST",
            "/register",
            &Auth::None,
            Some(serde_json::json!({
                "clientID": "clientA",
                "authKey": random::new_secure_string(MIN_KEY_LEN),
            })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
}

#[tokio::test]
async fn register_rejects_short_key() {
    let harness = setup(2, false);
    let (status, body) = send(
        &harness,
        request(
            "POST",
            "/register",
            &Auth::AdminBasic,
            Some(serde_json::json!({ "clientID": "clientA", "authKey": "short" })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"]
        .as_str()
        .unwrap()
        .contains("key not long enough"));
}

#[tokio::test]
async fn register_rejects_duplicate_client() {
    let harness = setup(2, false);
    let body = serde_json::json!({
        "clientID": "clientA",
        "authKey": random::new_secure_string(MIN_KEY_LEN),
    });

    let (status, _) = send(
        &harness,
        request("POST", "/register", &Auth::AdminBasic, Some(body.clone())),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, resp) = send(
        &harness,
        request("POST", "/register", &Auth::AdminBasic, Some(body)),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(resp["error"].as_str().unwrap().contains("already registered"));
}

#[tokio::test]
async fn login_rejects_bad_credentials() {
    let harness = setup(2, false);
    let key = random::new_secure_string(MIN_KEY_LEN);
    harness.auth.register("clientA", &key).unwrap();

    let (status, body) = send(
        &harness,
        request(
            "POST",
            "/login",
            &Auth::None,
            Some(serde_json::json!({ "clientID": "clientA", "authKey": format!("{key}bad") })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(body["error"]
        .as_str()
        .unwrap()
        .contains("authentication failed"));
}

#[tokio::test]
async fn unregister_twice_reports_not_found() {
    let harness = setup(2, false);
    harness
        .auth
        .register("clientA", &random::new_secure_string(MIN_KEY_LEN))
        .unwrap();

    let body = serde_json::json!({ "clientID": "clientA" });

    let (status, _) = send(
        &harness,
        request("POST", "/unregister", &Auth::AdminBasic, Some(body.clone())),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, resp) = send(
        &harness,
        request("POST", "/unregister", &Auth::AdminBasic, Some(body)),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(resp["error"].as_str().unwrap().contains("not found"));
}

#[tokio::test]
async fn unregister_requires_admin() {
    let harness = setup(2, false);
    let (status, _) = send(
        &harness,
        request(
            "POST",
            "/unregister",
            &Auth::None,
            Some(serde_json::json!({ "clientID": "clientA" })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

// -- Job routes --

#[tokio::test]
async fn job_routes_reject_missing_token() {
    let harness = setup(2, false);

    let (status, _) = send(
        &harness,
        request("POST", "/jobs", &Auth::None, Some(recording_job_body())),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = send(
        &harness,
        request(
            "GET",
            "/jobs/abcdef123456",
            &Auth::Bearer("bogus".to_string()),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn happy_recording_job() {
    let harness = setup(2, false);
    let token = register_and_login(&harness, "clientA").await;

    let (status, body) = send(
        &harness,
        request(
            "POST",
            "/jobs",
            &Auth::Bearer(token.clone()),
            Some(recording_job_body()),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let job_id = body["id"].as_str().unwrap().to_string();
    assert_eq!(job_id.len(), 12);
    assert!(body["start_at"].as_i64().unwrap() > 0);
    assert!(body.get("stop_at").is_none());

    // The record is visible right after creation.
    let (status, _) = send(
        &harness,
        request(
            "GET",
            &format!("/jobs/{job_id}"),
            &Auth::Bearer(token.clone()),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // The workload succeeds: callback fires, workload and record are gone.
    harness.mock.finish(&job_id, true).await;
    assert!(!harness.mock.contains(&job_id));

    let (status, _) = send(
        &harness,
        request(
            "GET",
            &format!("/jobs/{job_id}"),
            &Auth::Bearer(token),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn failed_job_record_is_kept_with_stop_at_set() {
    let harness = setup(2, false);
    let token = register_and_login(&harness, "clientA").await;

    let (_, body) = send(
        &harness,
        request(
            "POST",
            "/jobs",
            &Auth::Bearer(token.clone()),
            Some(recording_job_body()),
        ),
    )
    .await;
    let job_id = body["id"].as_str().unwrap().to_string();

    harness.mock.finish(&job_id, false).await;

    // Failed jobs stay around for inspection, with stop_at finalized.
    let job = harness.job_store.get(&job_id).unwrap();
    assert!(job.stop_at >= job.start_at);
    assert!(harness.mock.contains(&job_id));
}

#[tokio::test]
async fn capacity_rejection() {
    let harness = setup(1, false);
    let token = register_and_login(&harness, "clientA").await;

    let (status, _) = send(
        &harness,
        request(
            "POST",
            "/jobs",
            &Auth::Bearer(token.clone()),
            Some(recording_job_body()),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(
        &harness,
        request(
            "POST",
            "/jobs",
            &Auth::Bearer(token),
            Some(recording_job_body()),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body["error"]
        .as_str()
        .unwrap()
        .contains("max concurrent jobs reached"));
}

#[tokio::test]
async fn version_gate() {
    let harness = setup(2, false);
    let token = register_and_login(&harness, "clientA").await;

    let mut body = recording_job_body();
    body["runner"] = "mattermost/calls-recorder:v0.1.0".into();

    let (status, resp) = send(
        &harness,
        request("POST", "/jobs", &Auth::Bearer(token), Some(body)),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(resp["error"].as_str().unwrap().contains(
        "actual version (0.1.0) is lower than minimum supported version (0.6.0)"
    ));
}

#[tokio::test]
async fn registry_mismatch() {
    let harness = setup(2, false);
    let token = register_and_login(&harness, "clientA").await;

    let mut body = recording_job_body();
    body["runner"] = "custom/calls-recorder:v0.6.0".into();

    let (status, resp) = send(
        &harness,
        request("POST", "/jobs", &Auth::Bearer(token), Some(body)),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(resp["error"]
        .as_str()
        .unwrap()
        .contains("failed to validate runner"));
}

#[tokio::test]
async fn non_positive_durations_are_rejected() {
    let harness = setup(2, false);
    let token = register_and_login(&harness, "clientA").await;

    for duration in [0, -1] {
        let mut body = recording_job_body();
        body["max_duration_sec"] = duration.into();

        let (status, _) = send(
            &harness,
            request("POST", "/jobs", &Auth::Bearer(token.clone()), Some(body)),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "duration {duration}");
    }
}

#[tokio::test]
async fn malformed_job_ids_get_404() {
    let harness = setup(2, false);
    let token = register_and_login(&harness, "clientA").await;

    for id in ["abcdef1234567", "short", "ABCDEF123456", "abcdef12345-"] {
        let (status, _) = send(
            &harness,
            request(
                "GET",
                &format!("/jobs/{id}"),
                &Auth::Bearer(token.clone()),
                None,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND, "id {id:?}");
    }
}

#[tokio::test]
async fn delete_running_job_is_rejected() {
    let harness = setup(2, false);
    let token = register_and_login(&harness, "clientA").await;

    let (_, body) = send(
        &harness,
        request(
            "POST",
            "/jobs",
            &Auth::Bearer(token.clone()),
            Some(recording_job_body()),
        ),
    )
    .await;
    let job_id = body["id"].as_str().unwrap().to_string();

    let (status, resp) = send(
        &harness,
        request(
            "DELETE",
            &format!("/jobs/{job_id}"),
            &Auth::Bearer(token.clone()),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(resp["error"].as_str().unwrap().contains("job is running"));

    // Stop the job, then deletion goes through.
    let (status, _) = send(
        &harness,
        request(
            "POST",
            &format!("/jobs/{job_id}/stop"),
            &Auth::Bearer(token.clone()),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = send(
        &harness,
        request(
            "DELETE",
            &format!("/jobs/{job_id}"),
            &Auth::Bearer(token),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(!harness.mock.contains(&job_id));
}

#[tokio::test]
async fn stop_sets_stop_at() {
    let harness = setup(2, false);
    let token = register_and_login(&harness, "clientA").await;

    let (_, body) = send(
        &harness,
        request(
            "POST",
            "/jobs",
            &Auth::Bearer(token.clone()),
            Some(recording_job_body()),
        ),
    )
    .await;
    let job_id = body["id"].as_str().unwrap().to_string();

    let (status, _) = send(
        &harness,
        request(
            "POST",
            &format!("/jobs/{job_id}/stop"),
            &Auth::Bearer(token),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let job = harness.job_store.get(&job_id).unwrap();
    assert!(job.stop_at >= job.start_at);
}

#[tokio::test]
async fn job_logs_round_trip() {
    let harness = setup(2, false);
    let token = register_and_login(&harness, "clientA").await;

    let (_, body) = send(
        &harness,
        request(
            "POST",
            "/jobs",
            &Auth::Bearer(token.clone()),
            Some(recording_job_body()),
        ),
    )
    .await;
    let job_id = body["id"].as_str().unwrap().to_string();

    let resp = harness
        .router
        .clone()
        .oneshot(request(
            "GET",
            &format!("/jobs/{job_id}/logs"),
            &Auth::Bearer(token.clone()),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(resp.into_body(), 1024).await.unwrap();
    assert_eq!(&bytes[..], b"log line\n");

    // Logs errors surface as 403.
    let (status, _) = send(
        &harness,
        request(
            "GET",
            "/jobs/000000000000/logs",
            &Auth::Bearer(token),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn init_jobs_validates_runners() {
    let harness = setup(2, false);
    let token = register_and_login(&harness, "clientA").await;

    let (status, _) = send(
        &harness,
        request(
            "POST",
            "/jobs/init",
            &Auth::Bearer(token.clone()),
            Some(serde_json::json!({ "runners": [VALID_RUNNER] })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = send(
        &harness,
        request(
            "POST",
            "/jobs/init",
            &Auth::Bearer(token),
            Some(serde_json::json!({ "runners": ["custom/calls-recorder:v0.6.0"] })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn malformed_body_is_a_bad_request() {
    let harness = setup(2, false);
    let token = register_and_login(&harness, "clientA").await;

    let req = Request::builder()
        .method("POST")
        .uri("/jobs")
        .header(AUTHORIZATION, format!("Bearer {token}"))
        .header("Content-Type", "application/json")
        .body(Body::from("{not json"))
        .unwrap();

    let resp = harness.router.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

// -- Public routes --

#[tokio::test]
async fn version_route_is_public() {
    let harness = setup(2, false);
    let (status, body) = send(&harness, request("GET", "/version", &Auth::None, None)).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.get("buildVersion").is_some());
    assert!(body.get("runtimeVersion").is_some());
}
