//! Broker behavior against a mock Warpgate gateway.

use anyhow::{anyhow, Result};
use secrecy::SecretString;
use std::net::TcpListener;
use std::sync::{Arc, Mutex};
use wgbroker::broker::config::{ConfigStore, MemoryConfigStore, NewServer};
use wgbroker::broker::{Broker, NotificationSink, OtpPrompter};
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn can_bind_localhost() -> bool {
    TcpListener::bind("127.0.0.1:0").is_ok()
}

#[derive(Default)]
struct RecordingNotifier {
    messages: Mutex<Vec<String>>,
}

impl RecordingNotifier {
    fn contains(&self, needle: &str) -> bool {
        self.messages
            .lock()
            .expect("notifier lock")
            .iter()
            .any(|message| message.contains(needle))
    }
}

impl NotificationSink for RecordingNotifier {
    fn info(&self, message: &str) {
        self.messages
            .lock()
            .expect("notifier lock")
            .push(format!("info: {message}"));
    }

    fn error(&self, message: &str) {
        self.messages
            .lock()
            .expect("notifier lock")
            .push(format!("error: {message}"));
    }

    fn notice(&self, message: &str) {
        self.messages
            .lock()
            .expect("notifier lock")
            .push(format!("notice: {message}"));
    }
}

struct ScriptedPrompter {
    code: Option<String>,
}

impl OtpPrompter for ScriptedPrompter {
    fn prompt(&self, _server_name: &str) -> Option<String> {
        self.code.clone()
    }
}

fn broker_with(
    prompter_code: Option<&str>,
) -> (Broker, Arc<MemoryConfigStore>, Arc<RecordingNotifier>) {
    let store = Arc::new(MemoryConfigStore::new());
    let notifier = Arc::new(RecordingNotifier::default());
    let broker = Broker::new(
        Arc::clone(&store) as Arc<dyn ConfigStore>,
        Arc::clone(&notifier) as Arc<dyn NotificationSink>,
        Arc::new(ScriptedPrompter {
            code: prompter_code.map(str::to_string),
        }),
    );

    (broker, store, notifier)
}

fn new_server(url: &str) -> NewServer {
    NewServer {
        name: "gateway".to_string(),
        url: url.to_string(),
        username: "admin".to_string(),
        password: Some(SecretString::from("hunter2".to_string())),
        trust_self_signed: None,
        otp_secret: None,
    }
}

fn accepted_body() -> serde_json::Value {
    serde_json::json!({"started": true, "auth": {"state": "Accepted", "methods_remaining": []}})
}

fn otp_needed_body() -> serde_json::Value {
    serde_json::json!({"started": true, "auth": {"state": "Need", "methods_remaining": ["Otp"]}})
}

fn targets_body() -> serde_json::Value {
    serde_json::json!([
        {"name": "web", "kind": "Ssh"},
        {"name": "panel", "kind": "WebAdmin"}
    ])
}

#[tokio::test]
async fn connect_logs_in_and_reuses_the_session() -> Result<()> {
    if !can_bind_localhost() {
        eprintln!("Skipping test: cannot bind localhost");
        return Ok(());
    }
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/@warpgate/api/auth/login"))
        .and(body_json(
            serde_json::json!({"username": "admin", "password": "hunter2"}),
        ))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Set-Cookie", "warpgate-http-session=cookie-1; Path=/")
                .set_body_json(accepted_body()),
        )
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/@warpgate/api/auth/state"))
        .and(header("Cookie", "warpgate-http-session=cookie-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(accepted_body()))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/@warpgate/api/targets"))
        .respond_with(ResponseTemplate::new(200).set_body_json(targets_body()))
        .expect(2)
        .mount(&server)
        .await;

    let (broker, _, notifier) = broker_with(None);
    let config = broker.add_server(new_server(&server.uri()))?;

    let outcome = broker.connect(&config.id).await?;
    assert!(outcome.success, "first connect: {:?}", outcome.error);
    assert!(broker.is_connected(&config.id));
    assert!(notifier.contains("Connected to gateway"));

    let targets = broker
        .status(&config.id)
        .ok_or_else(|| anyhow!("missing status"))?
        .targets;
    assert_eq!(targets.len(), 2);

    // second connect revalidates the cached cookie instead of logging in again
    let outcome = broker.connect(&config.id).await?;
    assert!(outcome.success);
    Ok(())
}

#[tokio::test]
async fn connect_without_password_is_a_fatal_failure() -> Result<()> {
    if !can_bind_localhost() {
        eprintln!("Skipping test: cannot bind localhost");
        return Ok(());
    }
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/@warpgate/api/auth/login"))
        .respond_with(ResponseTemplate::new(200).set_body_json(accepted_body()))
        .expect(0)
        .mount(&server)
        .await;

    let (broker, _, notifier) = broker_with(None);
    let mut entry = new_server(&server.uri());
    entry.password = None;
    let config = broker.add_server(entry)?;

    let outcome = broker.connect(&config.id).await?;
    assert!(!outcome.success);
    assert!(!outcome.needs_otp);
    assert_eq!(outcome.error.as_deref(), Some("No password configured"));
    assert!(notifier.contains("No password configured"));
    Ok(())
}

#[tokio::test]
async fn otp_need_without_secret_defers_then_completes() -> Result<()> {
    if !can_bind_localhost() {
        eprintln!("Skipping test: cannot bind localhost");
        return Ok(());
    }
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/@warpgate/api/auth/login"))
        .respond_with(ResponseTemplate::new(401).set_body_json(otp_needed_body()))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/@warpgate/api/auth/otp"))
        .and(body_json(serde_json::json!({"otp": "123456"})))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Set-Cookie", "warpgate-http-session=cookie-2; Path=/")
                .set_body_json(accepted_body()),
        )
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/@warpgate/api/targets"))
        .respond_with(ResponseTemplate::new(200).set_body_json(targets_body()))
        .mount(&server)
        .await;

    let (broker, _, _) = broker_with(None);
    let config = broker.add_server(new_server(&server.uri()))?;

    let outcome = broker.connect(&config.id).await?;
    assert!(!outcome.success);
    assert!(outcome.needs_otp);

    // completing on the same pending client succeeds and stores the session
    let outcome = broker.submit_otp(&config.id, "123456").await?;
    assert!(outcome.success, "otp submit: {:?}", outcome.error);
    assert!(broker.is_connected(&config.id));

    // unrelated follow-up calls never resubmit the code (otp mock expects 1)
    broker.refresh_targets(&config.id).await?;
    Ok(())
}

#[tokio::test]
async fn stored_secret_submits_otp_automatically() -> Result<()> {
    if !can_bind_localhost() {
        eprintln!("Skipping test: cannot bind localhost");
        return Ok(());
    }
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/@warpgate/api/auth/login"))
        .respond_with(ResponseTemplate::new(401).set_body_json(otp_needed_body()))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/@warpgate/api/auth/otp"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Set-Cookie", "warpgate-http-session=cookie-3; Path=/")
                .set_body_json(accepted_body()),
        )
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/@warpgate/api/targets"))
        .respond_with(ResponseTemplate::new(200).set_body_json(targets_body()))
        .mount(&server)
        .await;

    let (broker, _, _) = broker_with(None);
    let mut entry = new_server(&server.uri());
    entry.otp_secret = Some(SecretString::from(
        "GEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQ".to_string(),
    ));
    let config = broker.add_server(entry)?;

    let outcome = broker.connect(&config.id).await?;
    assert!(outcome.success, "connect: {:?}", outcome.error);
    Ok(())
}

#[tokio::test]
async fn prompted_otp_is_submitted() -> Result<()> {
    if !can_bind_localhost() {
        eprintln!("Skipping test: cannot bind localhost");
        return Ok(());
    }
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/@warpgate/api/auth/login"))
        .respond_with(ResponseTemplate::new(401).set_body_json(otp_needed_body()))
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/@warpgate/api/auth/otp"))
        .and(body_json(serde_json::json!({"otp": "654321"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(accepted_body()))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/@warpgate/api/targets"))
        .respond_with(ResponseTemplate::new(200).set_body_json(targets_body()))
        .mount(&server)
        .await;

    let (broker, _, _) = broker_with(Some("654321"));
    let config = broker.add_server(new_server(&server.uri()))?;

    let outcome = broker.connect(&config.id).await?;
    assert!(outcome.success, "connect: {:?}", outcome.error);
    Ok(())
}

#[tokio::test]
async fn rejected_login_surfaces_a_failure() -> Result<()> {
    if !can_bind_localhost() {
        eprintln!("Skipping test: cannot bind localhost");
        return Ok(());
    }
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/@warpgate/api/auth/login"))
        .respond_with(ResponseTemplate::new(401).set_body_json(serde_json::json!({"state": "Failed"})))
        .mount(&server)
        .await;

    let (broker, _, notifier) = broker_with(None);
    let config = broker.add_server(new_server(&server.uri()))?;

    let outcome = broker.connect(&config.id).await?;
    assert!(!outcome.success);
    assert_eq!(
        outcome.error.as_deref(),
        Some("Authentication rejected by gateway")
    );
    assert!(!broker.is_connected(&config.id));
    assert!(notifier.contains("Authentication failed for gateway"));
    Ok(())
}

#[tokio::test]
async fn adding_a_tested_server_issues_zero_additional_logins() -> Result<()> {
    if !can_bind_localhost() {
        eprintln!("Skipping test: cannot bind localhost");
        return Ok(());
    }
    let server = MockServer::start().await;

    // exactly one login, from the test connection; verified on drop
    Mock::given(method("POST"))
        .and(path("/@warpgate/api/auth/login"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Set-Cookie", "warpgate-http-session=test-cookie; Path=/")
                .set_body_json(accepted_body()),
        )
        .expect(1)
        .mount(&server)
        .await;

    // the transplanted cookie shows up on the persistent client's revalidation
    Mock::given(method("GET"))
        .and(path("/@warpgate/api/auth/state"))
        .and(header("Cookie", "warpgate-http-session=test-cookie"))
        .respond_with(ResponseTemplate::new(200).set_body_json(accepted_body()))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/@warpgate/api/targets"))
        .respond_with(ResponseTemplate::new(200).set_body_json(targets_body()))
        .mount(&server)
        .await;

    let (broker, _, _) = broker_with(None);
    let password = SecretString::from("hunter2".to_string());

    let outcome = broker
        .test_connection(&server.uri(), "admin", &password, false, None)
        .await?;
    assert!(outcome.success, "test connection: {:?}", outcome.error);

    let config = broker.add_server(new_server(&server.uri()))?;
    let outcome = broker.connect(&config.id).await?;

    assert!(outcome.success, "connect after test: {:?}", outcome.error);
    assert!(broker.is_connected(&config.id));
    Ok(())
}

#[tokio::test]
async fn failed_test_connection_reports_the_gateway_error() -> Result<()> {
    if !can_bind_localhost() {
        eprintln!("Skipping test: cannot bind localhost");
        return Ok(());
    }
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/@warpgate/api/auth/login"))
        .respond_with(
            ResponseTemplate::new(401).set_body_json(serde_json::json!({"state": "Rejected"})),
        )
        .mount(&server)
        .await;

    let (broker, _, _) = broker_with(None);
    let password = SecretString::from("wrong".to_string());

    let outcome = broker
        .test_connection(&server.uri(), "admin", &password, false, None)
        .await?;

    assert!(!outcome.success);
    assert_eq!(
        outcome.error.as_deref(),
        Some("Authentication rejected by gateway")
    );
    Ok(())
}

#[tokio::test]
async fn one_time_tickets_are_cached_until_invalidated() -> Result<()> {
    if !can_bind_localhost() {
        eprintln!("Skipping test: cannot bind localhost");
        return Ok(());
    }
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/@warpgate/admin/api/tickets"))
        .and(body_json(serde_json::json!({
            "username": "admin",
            "target_name": "web",
            "number_of_uses": 1,
            "description": "One-time ticket for web"
        })))
        .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
            "ticket": {"id": "t1", "username": "admin", "target": "web", "uses_left": 1},
            "secret": "tick3t"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let (broker, _, _) = broker_with(None);
    let config = broker.add_server(new_server(&server.uri()))?;

    let details = broker.get_or_create_ticket(&config.id, "web").await?;
    assert_eq!(details.username, "ticket-tick3t");
    assert_eq!(details.host, "127.0.0.1");
    assert_eq!(details.port, 2222);
    assert!(details.password.is_none());

    // second resolution is served from the cache (create mock expects 1)
    let details = broker.get_or_create_ticket(&config.id, "web").await?;
    assert_eq!(details.username, "ticket-tick3t");

    // consuming the single use evicts the ticket
    broker.invalidate_ticket(&config.id, "web");
    let details = broker.get_ssh_connection_details(&config.id, "web")?;
    assert_eq!(details.username, "admin:web");
    Ok(())
}

#[tokio::test]
async fn ticket_issuance_failure_falls_back_to_password_credentials() -> Result<()> {
    if !can_bind_localhost() {
        eprintln!("Skipping test: cannot bind localhost");
        return Ok(());
    }
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/@warpgate/admin/api/tickets"))
        .respond_with(ResponseTemplate::new(403).set_body_string("access denied"))
        .mount(&server)
        .await;

    let (broker, _, notifier) = broker_with(None);
    let mut entry = new_server(&server.uri());
    entry.otp_secret = Some(SecretString::from(
        "GEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQ".to_string(),
    ));
    let config = broker.add_server(entry)?;

    let details = broker.get_or_create_ticket(&config.id, "web").await?;

    assert_eq!(details.username, "admin:web");
    assert!(details.password.is_some());
    assert!(details.otp.is_some());
    assert!(notifier.contains("Ticket issuance unavailable"));
    Ok(())
}

#[tokio::test]
async fn connect_all_isolates_per_server_failures() -> Result<()> {
    if !can_bind_localhost() {
        eprintln!("Skipping test: cannot bind localhost");
        return Ok(());
    }
    let healthy = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/@warpgate/api/auth/login"))
        .respond_with(ResponseTemplate::new(200).set_body_json(accepted_body()))
        .mount(&healthy)
        .await;

    Mock::given(method("GET"))
        .and(path("/@warpgate/api/targets"))
        .respond_with(ResponseTemplate::new(200).set_body_json(targets_body()))
        .mount(&healthy)
        .await;

    let (broker, _, _) = broker_with(None);
    let good = broker.add_server(new_server(&healthy.uri()))?;
    // nothing listens on port 1; this server fails without aborting its sibling
    let bad = broker.add_server(new_server("http://127.0.0.1:1"))?;

    broker.connect_all().await;

    assert!(broker.is_connected(&good.id));
    assert!(!broker.is_connected(&bad.id));
    let bad_status = broker
        .status(&bad.id)
        .ok_or_else(|| anyhow!("missing status"))?;
    assert!(bad_status.last_error.is_some());
    Ok(())
}

#[tokio::test]
async fn destroy_logs_out_connected_sessions() -> Result<()> {
    if !can_bind_localhost() {
        eprintln!("Skipping test: cannot bind localhost");
        return Ok(());
    }
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/@warpgate/api/auth/login"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Set-Cookie", "warpgate-http-session=cookie-9; Path=/")
                .set_body_json(accepted_body()),
        )
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/@warpgate/api/targets"))
        .respond_with(ResponseTemplate::new(200).set_body_json(targets_body()))
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/@warpgate/api/auth/logout"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let (broker, _, _) = broker_with(None);
    let config = broker.add_server(new_server(&server.uri()))?;
    broker.connect(&config.id).await?;

    broker.destroy().await;

    assert!(!broker.is_connected(&config.id));
    Ok(())
}
