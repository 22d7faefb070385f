//! End-to-end tests driving the typed client against a live listener.

mod common;

use calls_offloader::auth::MIN_KEY_LEN;
use calls_offloader::client::{Client, ClientConfig};
use calls_offloader::jobs::{InputData, JobConfig, JobType, ServiceConfig};
use calls_offloader::random;

use common::{setup, TestHarness, ADMIN_SECRET, VALID_RUNNER};

/// Bind the harness router on an ephemeral port and serve it for the test's
/// lifetime.
async fn spawn_server(harness: &TestHarness) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = harness.router.clone();

    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    format!("http://{addr}")
}

fn admin_client(url: &str) -> Client {
    Client::new(ClientConfig {
        url: url.to_string(),
        client_id: "admin".to_string(),
        auth_key: ADMIN_SECRET.to_string(),
    })
    .unwrap()
}

fn recording_config() -> JobConfig {
    let mut input_data = InputData::default();
    input_data
        .0
        .insert("site_url".to_string(), "http://localhost:8065".into());
    input_data.0.insert("call_id".to_string(), "abc".into());

    JobConfig {
        job_type: JobType::Recording,
        max_duration_sec: 60,
        runner: VALID_RUNNER.to_string(),
        input_data,
    }
}

#[tokio::test]
async fn register_login_and_job_lifecycle() {
    let harness = setup(2, false);
    let url = spawn_server(&harness).await;

    let mut client = admin_client(&url);
    let auth_key = random::new_secure_string(MIN_KEY_LEN);

    client.register("clientA", &auth_key).await.unwrap();
    client.login("clientA", &auth_key).await.unwrap();

    client
        .init(&ServiceConfig {
            runners: vec![VALID_RUNNER.to_string()],
        })
        .await
        .unwrap();

    let job = client.create_job(&recording_config()).await.unwrap();
    assert_eq!(job.id.len(), 12);
    assert!(job.start_at > 0);
    assert_eq!(job.stop_at, 0);

    let fetched = client.get_job(&job.id).await.unwrap();
    assert_eq!(fetched.id, job.id);
    assert_eq!(fetched.config.runner, VALID_RUNNER);

    let logs = client.get_job_logs(&job.id).await.unwrap();
    assert_eq!(logs, b"log line\n");

    client.stop_job(&job.id).await.unwrap();
    let stopped = client.get_job(&job.id).await.unwrap();
    assert!(stopped.stop_at >= stopped.start_at);

    client.delete_job(&job.id).await.unwrap();
    assert!(!harness.mock.contains(&job.id));
}

#[tokio::test]
async fn register_existing_client_fails() {
    let harness = setup(2, false);
    let url = spawn_server(&harness).await;
    let client = admin_client(&url);

    let auth_key = random::new_secure_string(MIN_KEY_LEN);
    client.register("clientA", &auth_key).await.unwrap();

    let err = client.register("clientA", &auth_key).await.unwrap_err();
    assert_eq!(
        err.to_string(),
        "request failed: registration failed: already registered"
    );
}

#[tokio::test]
async fn register_short_key_fails() {
    let harness = setup(2, false);
    let url = spawn_server(&harness).await;
    let client = admin_client(&url);

    let err = client.register("clientA", "").await.unwrap_err();
    assert_eq!(
        err.to_string(),
        "request failed: registration failed: key not long enough"
    );
}

#[tokio::test]
async fn unregister_unknown_client_fails() {
    let harness = setup(2, false);
    let url = spawn_server(&harness).await;
    let client = admin_client(&url);

    let err = client.unregister("ghost").await.unwrap_err();
    assert_eq!(
        err.to_string(),
        "request failed: unregister failed: not found"
    );
}

#[tokio::test]
async fn login_with_bad_key_fails() {
    let harness = setup(2, false);
    let url = spawn_server(&harness).await;
    let mut client = admin_client(&url);

    let auth_key = random::new_secure_string(MIN_KEY_LEN);
    client.register("clientA", &auth_key).await.unwrap();

    let err = client
        .login("clientA", &format!("{auth_key}bad"))
        .await
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "request failed: login failed: authentication failed"
    );
}

#[tokio::test]
async fn register_without_admin_credentials_fails() {
    let harness = setup(2, false);
    let url = spawn_server(&harness).await;

    let client = Client::new(ClientConfig {
        url,
        client_id: "nobody".to_string(),
        auth_key: "wrong".to_string(),
    })
    .unwrap();

    let err = client
        .register("clientA", &random::new_secure_string(MIN_KEY_LEN))
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "request failed: unauthorized");
}

#[tokio::test]
async fn get_unknown_job_fails() {
    let harness = setup(2, false);
    let url = spawn_server(&harness).await;
    let mut client = admin_client(&url);

    let auth_key = random::new_secure_string(MIN_KEY_LEN);
    client.register("clientA", &auth_key).await.unwrap();
    client.login("clientA", &auth_key).await.unwrap();

    let err = client.get_job("000000000000").await.unwrap_err();
    assert_eq!(err.to_string(), "request failed: not found");
}
