//! Session and ticket broker for configured Warpgate gateways.
//!
//! Owns one [`ApiClient`] per server, the in-memory session and ticket
//! registries, and the login/OTP state machine that ties them together.
//! Registries live behind a single mutex that is never held across an await;
//! concurrent updates to the same server id resolve last-writer-wins.

pub mod config;
pub mod events;
pub mod tickets;

use crate::gateway::client::{
    normalize_base_url, ticket_username, ApiClient, TICKET_SSH_PORT,
};
use crate::gateway::error::ApiResult;
use crate::gateway::types::{AuthStateKind, Target, TicketRequest};
use crate::otp::{self, now_millis, TotpOptions};
use self::config::{ConfigStore, NewServer, ServerConfig};
use self::events::{BrokerEvent, ConnectionStatus};
use self::tickets::CachedTicket;
use anyhow::{anyhow, Result};
use futures::future::join_all;
use secrecy::{ExposeSecret, SecretString};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep};
use tracing::{debug, warn};
use url::Url;

const SESSION_TTL_MILLIS: u64 = 24 * 60 * 60 * 1000;
/// How long an unclaimed test session is kept before it is reaped.
const TEST_CLIENT_TTL: Duration = Duration::from_secs(5 * 60);
const EVENT_CAPACITY: usize = 64;

const OTP_NOT_PROVIDED: &str = "OTP required but not provided";

/// An authenticated gateway session. In-memory only, never persisted.
#[derive(Debug, Clone)]
pub struct Session {
    pub server_id: String,
    pub cookie: String,
    /// Unix timestamp in milliseconds.
    pub expires_at: u64,
    pub username: String,
}

/// User-facing notification sink.
pub trait NotificationSink: Send + Sync {
    fn info(&self, message: &str);
    fn error(&self, message: &str);
    fn notice(&self, message: &str);
}

/// External OTP prompt; `None` means the user cancelled.
pub trait OtpPrompter: Send + Sync {
    fn prompt(&self, server_name: &str) -> Option<String>;
}

/// Notification sink backed by the tracing subscriber.
pub struct TracingNotifier;

impl NotificationSink for TracingNotifier {
    fn info(&self, message: &str) {
        tracing::info!("{message}");
    }

    fn error(&self, message: &str) {
        tracing::error!("{message}");
    }

    fn notice(&self, message: &str) {
        tracing::warn!("{message}");
    }
}

/// Prompter for contexts with nobody to ask.
pub struct NoOtpPrompter;

impl OtpPrompter for NoOtpPrompter {
    fn prompt(&self, _server_name: &str) -> Option<String> {
        None
    }
}

/// Result of a connect, test-connection, or OTP submission.
#[derive(Debug, Clone, Default)]
pub struct ConnectOutcome {
    pub success: bool,
    pub needs_otp: bool,
    pub error: Option<String>,
}

impl ConnectOutcome {
    fn ok() -> Self {
        Self {
            success: true,
            ..Self::default()
        }
    }

    fn otp_required() -> Self {
        Self {
            success: false,
            needs_otp: true,
            error: Some(OTP_NOT_PROVIDED.to_string()),
        }
    }
}

/// Credentials resolved for one outbound SSH connection attempt.
///
/// Recomputed per attempt: TOTP codes are single-use and time-bound, and a
/// cached ticket can be exhausted at any point.
#[derive(Debug, Clone)]
pub struct SshConnectionDetails {
    /// Gateway-side username (`ticket-{secret}` or `{user}:{target}`).
    pub username: String,
    pub password: Option<SecretString>,
    /// Fresh one-time code for keyboard-interactive continuation.
    pub otp: Option<String>,
    pub host: String,
    pub port: u16,
}

enum AuthFlow {
    Accepted,
    OtpPending,
    Failed { message: String, otp: bool },
}

#[derive(Default)]
struct Registries {
    clients: HashMap<String, Arc<ApiClient>>,
    sessions: HashMap<String, Session>,
    test_clients: HashMap<String, Arc<ApiClient>>,
    test_cleanups: HashMap<String, JoinHandle<()>>,
    tickets: HashMap<String, CachedTicket>,
    status: HashMap<String, ConnectionStatus>,
    refresh_task: Option<JoinHandle<()>>,
}

struct Inner {
    config: Arc<dyn ConfigStore>,
    notifier: Arc<dyn NotificationSink>,
    prompter: Arc<dyn OtpPrompter>,
    registries: Mutex<Registries>,
    events: broadcast::Sender<BrokerEvent>,
    in_flight: AtomicUsize,
}

#[derive(Clone)]
pub struct Broker {
    inner: Arc<Inner>,
}

struct LoadingGuard {
    inner: Arc<Inner>,
}

impl Drop for LoadingGuard {
    fn drop(&mut self) {
        self.inner.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

fn test_client_key(url: &str, username: &str) -> String {
    format!("test:{}:{username}", normalize_base_url(url))
}

fn gateway_host(url: &str) -> Result<String> {
    let parsed = Url::parse(&normalize_base_url(url))?;

    parsed
        .host_str()
        .map(str::to_string)
        .ok_or_else(|| anyhow!("No host in gateway URL: {url}"))
}

fn ticket_details(secret: &SecretString, host: &str) -> SshConnectionDetails {
    SshConnectionDetails {
        username: ticket_username(secret.expose_secret()),
        password: None,
        otp: None,
        host: host.to_string(),
        port: TICKET_SSH_PORT,
    }
}

impl Broker {
    #[must_use]
    pub fn new(
        config: Arc<dyn ConfigStore>,
        notifier: Arc<dyn NotificationSink>,
        prompter: Arc<dyn OtpPrompter>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            inner: Arc::new(Inner {
                config,
                notifier,
                prompter,
                registries: Mutex::new(Registries::default()),
                events,
                in_flight: AtomicUsize::new(0),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Registries> {
        self.inner
            .registries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: BrokerEvent) {
        let _ = self.inner.events.send(event);
    }

    fn loading(&self) -> LoadingGuard {
        self.inner.in_flight.fetch_add(1, Ordering::SeqCst);
        LoadingGuard {
            inner: Arc::clone(&self.inner),
        }
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<BrokerEvent> {
        self.inner.events.subscribe()
    }

    #[must_use]
    pub fn is_loading(&self) -> bool {
        self.inner.in_flight.load(Ordering::SeqCst) > 0
    }

    #[must_use]
    pub fn servers(&self) -> Vec<ServerConfig> {
        let mut servers = Vec::new();
        self.inner
            .config
            .with_servers(&mut |all| servers = all.clone());
        servers
    }

    #[must_use]
    pub fn server(&self, id: &str) -> Option<ServerConfig> {
        let mut found = None;
        self.inner.config.with_servers(&mut |all| {
            found = all.iter().find(|server| server.id == id).cloned();
        });
        found
    }

    #[must_use]
    pub fn is_connected(&self, id: &str) -> bool {
        self.lock().status.get(id).is_some_and(|status| status.connected)
    }

    #[must_use]
    pub fn has_otp_secret(&self, id: &str) -> bool {
        self.server(id)
            .and_then(|server| server.otp_secret)
            .is_some_and(|secret| otp::is_valid_secret(secret.expose_secret()))
    }

    #[must_use]
    pub fn all_targets(&self) -> HashMap<String, Vec<Target>> {
        self.lock()
            .status
            .iter()
            .map(|(id, status)| (id.clone(), status.targets.clone()))
            .collect()
    }

    #[must_use]
    pub fn status(&self, id: &str) -> Option<ConnectionStatus> {
        self.lock().status.get(id).cloned()
    }

    fn client_for(&self, server: &ServerConfig) -> ApiResult<Arc<ApiClient>> {
        let mut regs = self.lock();

        if let Some(client) = regs.clients.get(&server.id) {
            return Ok(Arc::clone(client));
        }

        let client = Arc::new(ApiClient::new(
            &server.url,
            server.trust_self_signed.unwrap_or(false),
        )?);
        regs.clients.insert(server.id.clone(), Arc::clone(&client));

        Ok(client)
    }

    fn update_status(&self, id: &str, connected: bool, last_error: Option<String>) {
        let mut regs = self.lock();
        let status = regs.status.entry(id.to_string()).or_default();
        status.connected = connected;
        status.last_error = last_error;
        status.last_checked = Some(now_millis());
    }

    /// Append a server to the live collection and persist it.
    ///
    /// When a test connection for the same `(url, username)` succeeded within
    /// the cleanup window, its session cookie is transplanted onto the new
    /// persistent client and no re-authentication happens.
    ///
    /// # Errors
    /// Returns an error when the persistent client cannot be built or the
    /// store fails to save.
    pub fn add_server(&self, new: NewServer) -> Result<ServerConfig> {
        let server = new.into_config();

        self.adopt_test_session(&server)?;

        self.inner
            .config
            .with_servers(&mut |servers| servers.push(server.clone()));
        self.inner.config.save()?;

        self.emit(BrokerEvent::ServersMutated);
        Ok(server)
    }

    fn adopt_test_session(&self, server: &ServerConfig) -> Result<()> {
        let key = test_client_key(&server.url, &server.username);
        let mut regs = self.lock();

        let Some(test_client) = regs.test_clients.remove(&key) else {
            return Ok(());
        };
        if let Some(timer) = regs.test_cleanups.remove(&key) {
            timer.abort();
        }

        let Some(cookie) = test_client.session_cookie() else {
            return Ok(());
        };

        // The cookie is transplanted, never aliased: the ephemeral client is
        // dropped at the end of this scope.
        let client = ApiClient::new(&server.url, server.trust_self_signed.unwrap_or(false))?;
        client.set_session_cookie(Some(cookie.clone()));
        regs.clients.insert(server.id.clone(), Arc::new(client));
        regs.sessions.insert(
            server.id.clone(),
            Session {
                server_id: server.id.clone(),
                cookie,
                expires_at: now_millis() + SESSION_TTL_MILLIS,
                username: server.username.clone(),
            },
        );

        debug!("adopted test session for {}", server.name);
        Ok(())
    }

    /// Apply an in-place update to one server and persist it.
    ///
    /// Concurrent updates to the same id resolve last-writer-wins.
    ///
    /// # Errors
    /// Returns `Server {id} not found` for an unknown id, or the store's save
    /// error.
    pub fn update_server<F>(&self, id: &str, apply: F) -> Result<ServerConfig>
    where
        F: FnOnce(&mut ServerConfig),
    {
        let mut apply = Some(apply);
        let mut endpoint_before = None;
        let mut updated = None;

        self.inner.config.with_servers(&mut |servers| {
            if let Some(index) = servers.iter().position(|server| server.id == id) {
                let server = &mut servers[index];
                endpoint_before = Some((
                    server.url.clone(),
                    server.username.clone(),
                    server.trust_self_signed,
                ));
                if let Some(apply) = apply.take() {
                    apply(server);
                }
                updated = Some(server.clone());
            }
        });

        let updated = updated.ok_or_else(|| anyhow!("Server {id} not found"))?;
        self.inner.config.save()?;

        // An endpoint-identity change makes the cached client and session stale.
        if let Some((url, username, trust)) = endpoint_before {
            if url != updated.url
                || username != updated.username
                || trust != updated.trust_self_signed
            {
                let mut regs = self.lock();
                regs.clients.remove(id);
                regs.sessions.remove(id);
            }
        }

        self.emit(BrokerEvent::ServersMutated);
        Ok(updated)
    }

    /// Remove a server; unknown ids are a no-op. Splices the entry out of the
    /// live collection, persists, and tears down its session best-effort.
    ///
    /// # Errors
    /// Returns the store's save error.
    pub async fn remove_server(&self, id: &str) -> Result<()> {
        let mut removed = None;
        self.inner.config.with_servers(&mut |servers| {
            if let Some(index) = servers.iter().position(|server| server.id == id) {
                removed = Some(servers.remove(index));
            }
        });

        let Some(removed) = removed else {
            return Ok(());
        };
        self.inner.config.save()?;

        let client = {
            let mut regs = self.lock();
            let client = regs.clients.remove(id);
            let had_session = regs.sessions.remove(id).is_some();
            regs.status.remove(id);
            let ticket_prefix = format!("{id}:");
            regs.tickets.retain(|key, _| !key.starts_with(&ticket_prefix));
            had_session.then_some(client).flatten()
        };

        if let Some(client) = client {
            if let Err(err) = client.logout().await {
                debug!("Logout for removed server {} failed: {err}", removed.name);
            }
        }

        self.emit(BrokerEvent::ServersMutated);
        self.emit(BrokerEvent::ConnectionChanged {
            server_id: id.to_string(),
            connected: false,
        });
        Ok(())
    }

    fn resolve_otp(&self, server: &ServerConfig) -> Option<String> {
        if let Some(secret) = &server.otp_secret {
            if otp::is_valid_secret(secret.expose_secret()) {
                match otp::generate(secret.expose_secret(), &TotpOptions::default()) {
                    Ok(code) => return Some(code),
                    Err(err) => {
                        warn!("Stored OTP secret for {} unusable: {err}", server.name);
                    }
                }
            }
        }

        self.inner.prompter.prompt(&server.name)
    }

    async fn finish_otp(&self, client: &ApiClient, code: &str) -> AuthFlow {
        match client.submit_otp(code).await {
            Ok(state) if state.is_accepted() => AuthFlow::Accepted,
            Ok(_) => AuthFlow::Failed {
                message: "OTP authentication failed".to_string(),
                otp: true,
            },
            Err(err) => AuthFlow::Failed {
                message: err.to_string(),
                otp: true,
            },
        }
    }

    async fn authenticate(&self, server: &ServerConfig, client: &ApiClient) -> AuthFlow {
        let Some(password) = server.password.clone() else {
            return AuthFlow::Failed {
                message: "No password configured".to_string(),
                otp: false,
            };
        };

        let state = match client.login(&server.username, &password).await {
            Ok(state) => state,
            Err(err) => {
                return AuthFlow::Failed {
                    message: err.to_string(),
                    otp: false,
                }
            }
        };

        if state.is_accepted() {
            return AuthFlow::Accepted;
        }

        if state.needs_otp() {
            let Some(code) = self.resolve_otp(server) else {
                return AuthFlow::OtpPending;
            };
            return self.finish_otp(client, &code).await;
        }

        match state.auth.state {
            AuthStateKind::Rejected => AuthFlow::Failed {
                message: "Authentication rejected by gateway".to_string(),
                otp: false,
            },
            other => AuthFlow::Failed {
                message: format!("Authentication stalled in state {other:?}"),
                otp: false,
            },
        }
    }

    async fn finish_connect(
        &self,
        server: &ServerConfig,
        client: &ApiClient,
        fresh_login: bool,
    ) -> ConnectOutcome {
        if fresh_login {
            if let Some(cookie) = client.session_cookie() {
                self.lock().sessions.insert(
                    server.id.clone(),
                    Session {
                        server_id: server.id.clone(),
                        cookie,
                        expires_at: now_millis() + SESSION_TTL_MILLIS,
                        username: server.username.clone(),
                    },
                );
            }

            if let Err(err) = self.touch_last_connected(&server.id) {
                warn!(
                    "Failed to record last-connected time for {}: {err}",
                    server.name
                );
            }
        }

        let targets = match client.get_targets(None).await {
            Ok(targets) => targets,
            Err(err) => {
                warn!("Target fetch for {} failed: {err}", server.name);
                Vec::new()
            }
        };

        {
            let mut regs = self.lock();
            let status = regs.status.entry(server.id.clone()).or_default();
            status.connected = true;
            status.last_error = None;
            status.last_checked = Some(now_millis());
            status.targets = targets;
        }

        self.emit(BrokerEvent::ConnectionChanged {
            server_id: server.id.clone(),
            connected: true,
        });
        self.inner
            .notifier
            .info(&format!("Connected to {}", server.name));

        ConnectOutcome::ok()
    }

    fn fail_connect(&self, server: &ServerConfig, message: String, otp: bool) -> ConnectOutcome {
        self.update_status(&server.id, false, Some(message.clone()));
        self.emit(BrokerEvent::ConnectionChanged {
            server_id: server.id.clone(),
            connected: false,
        });

        let notification = if otp {
            format!("OTP authentication failed for {}: {message}", server.name)
        } else {
            format!("Authentication failed for {}: {message}", server.name)
        };
        self.inner.notifier.error(&notification);

        ConnectOutcome {
            success: false,
            needs_otp: otp,
            error: Some(message),
        }
    }

    fn touch_last_connected(&self, id: &str) -> Result<()> {
        self.update_server(id, |server| server.last_connected = Some(now_millis()))
            .map(|_| ())
    }

    /// Drive the connect state machine for one server.
    ///
    /// A cached unexpired session is revalidated and reused before any
    /// credentials are re-submitted. A `needs_otp` outcome leaves the client
    /// pending; complete it with [`Broker::submit_otp`].
    ///
    /// # Errors
    /// Returns `Server {id} not found` for an unknown id; authentication
    /// failures land in the outcome, not in `Err`.
    pub async fn connect(&self, id: &str) -> Result<ConnectOutcome> {
        let _guard = self.loading();
        let server = self
            .server(id)
            .ok_or_else(|| anyhow!("Server {id} not found"))?;
        let client = self.client_for(&server)?;

        let cached = {
            let regs = self.lock();
            regs.sessions
                .get(id)
                .filter(|session| session.expires_at > now_millis())
                .cloned()
        };

        if let Some(session) = cached {
            client.set_session_cookie(Some(session.cookie));

            match client.get_auth_state().await {
                Ok(state) if state.is_accepted() => {
                    return Ok(self.finish_connect(&server, &client, false).await);
                }
                _ => {
                    debug!("cached session for {} is stale", server.name);
                    client.set_session_cookie(None);
                    self.lock().sessions.remove(id);
                }
            }
        }

        match self.authenticate(&server, &client).await {
            AuthFlow::Accepted => Ok(self.finish_connect(&server, &client, true).await),
            AuthFlow::OtpPending => {
                self.update_status(id, false, Some(OTP_NOT_PROVIDED.to_string()));
                self.emit(BrokerEvent::ConnectionChanged {
                    server_id: id.to_string(),
                    connected: false,
                });
                Ok(ConnectOutcome::otp_required())
            }
            AuthFlow::Failed { message, otp } => Ok(self.fail_connect(&server, message, otp)),
        }
    }

    /// Submit an externally-collected OTP on the pending client for `id`.
    ///
    /// # Errors
    /// Returns `Server {id} not found` for an unknown id.
    pub async fn submit_otp(&self, id: &str, code: &str) -> Result<ConnectOutcome> {
        let _guard = self.loading();
        let server = self
            .server(id)
            .ok_or_else(|| anyhow!("Server {id} not found"))?;
        let client = self.client_for(&server)?;

        match self.finish_otp(&client, code).await {
            AuthFlow::Accepted => Ok(self.finish_connect(&server, &client, true).await),
            AuthFlow::Failed { message, otp } => Ok(self.fail_connect(&server, message, otp)),
            AuthFlow::OtpPending => Ok(ConnectOutcome::otp_required()),
        }
    }

    /// Validate gateway credentials before a server entry exists.
    ///
    /// Runs the same state machine as [`Broker::connect`], keyed by
    /// `(url, username)` on an ephemeral client. A successful session is
    /// retained for hand-off to [`Broker::add_server`] and reaped after five
    /// minutes if never claimed.
    ///
    /// # Errors
    /// Returns an error when the ephemeral client cannot be built.
    pub async fn test_connection(
        &self,
        url: &str,
        username: &str,
        password: &SecretString,
        trust_self_signed: bool,
        otp_secret: Option<&SecretString>,
    ) -> Result<ConnectOutcome> {
        let _guard = self.loading();
        let key = test_client_key(url, username);

        let client = {
            let mut regs = self.lock();
            if let Some(client) = regs.test_clients.get(&key) {
                Arc::clone(client)
            } else {
                let client = Arc::new(ApiClient::new(url, trust_self_signed)?);
                regs.test_clients.insert(key.clone(), Arc::clone(&client));
                client
            }
        };

        let scratch = ServerConfig {
            id: key.clone(),
            name: format!("{username}@{url}"),
            url: url.to_string(),
            username: username.to_string(),
            password: Some(password.clone()),
            enabled: true,
            trust_self_signed: Some(trust_self_signed),
            otp_secret: otp_secret.cloned(),
            last_connected: None,
        };

        match self.authenticate(&scratch, &client).await {
            AuthFlow::Accepted => {
                // Session retained, not logged out: add_server may claim it.
                self.arm_test_cleanup(&key);
                Ok(ConnectOutcome::ok())
            }
            AuthFlow::OtpPending => {
                self.lock().test_clients.remove(&key);
                Ok(ConnectOutcome::otp_required())
            }
            AuthFlow::Failed { message, otp } => {
                self.lock().test_clients.remove(&key);
                Ok(ConnectOutcome {
                    success: false,
                    needs_otp: otp,
                    error: Some(message),
                })
            }
        }
    }

    fn arm_test_cleanup(&self, key: &str) {
        let broker = self.clone();
        let owned = key.to_string();

        let timer = tokio::spawn(async move {
            sleep(TEST_CLIENT_TTL).await;

            let mut regs = broker.lock();
            regs.test_clients.remove(&owned);
            regs.test_cleanups.remove(&owned);
            debug!("reaped unclaimed test session {owned}");
        });

        let mut regs = self.lock();
        if let Some(previous) = regs.test_cleanups.insert(key.to_string(), timer) {
            previous.abort();
        }
    }

    fn valid_cached_ticket(&self, server_id: &str, target_name: &str) -> Option<SecretString> {
        let key = CachedTicket::cache_key(server_id, target_name);
        let mut regs = self.lock();

        match regs.tickets.get(&key) {
            Some(ticket) if ticket.is_valid(now_millis()) => Some(ticket.secret.clone()),
            Some(_) => {
                regs.tickets.remove(&key);
                None
            }
            None => None,
        }
    }

    fn traditional_details(
        &self,
        server: &ServerConfig,
        target_name: &str,
        host: &str,
    ) -> SshConnectionDetails {
        let otp = server
            .otp_secret
            .as_ref()
            .filter(|secret| otp::is_valid_secret(secret.expose_secret()))
            .and_then(|secret| otp::generate(secret.expose_secret(), &TotpOptions::default()).ok());

        SshConnectionDetails {
            username: format!("{}:{target_name}", server.username),
            password: server.password.clone(),
            otp,
            host: host.to_string(),
            port: TICKET_SSH_PORT,
        }
    }

    /// Resolve connection details for a target, issuing a one-time ticket
    /// when possible.
    ///
    /// Ticket issuance is a best-effort upgrade: when the gateway refuses
    /// (for example, the account lacks admin scope) this falls back to
    /// traditional `{user}:{target}` credentials with only a notice.
    ///
    /// # Errors
    /// Returns `Server {id} not found` for an unknown id or an unparseable
    /// gateway URL.
    pub async fn get_or_create_ticket(
        &self,
        server_id: &str,
        target_name: &str,
    ) -> Result<SshConnectionDetails> {
        let server = self
            .server(server_id)
            .ok_or_else(|| anyhow!("Server {server_id} not found"))?;
        let host = gateway_host(&server.url)?;

        if let Some(secret) = self.valid_cached_ticket(server_id, target_name) {
            return Ok(ticket_details(&secret, &host));
        }

        let client = self.client_for(&server)?;
        let request = TicketRequest {
            username: server.username.clone(),
            target_name: target_name.to_string(),
            expiry: None,
            number_of_uses: Some(1),
            description: Some(format!("One-time ticket for {target_name}")),
        };

        let created = match client.create_ticket(&request).await {
            Ok(Some(created)) => Some(created),
            Ok(None) => None,
            Err(err) => {
                debug!("Ticket issuance for {target_name} failed: {err}");
                None
            }
        };

        let Some(created) = created else {
            self.inner.notifier.notice(&format!(
                "Ticket issuance unavailable for {}; using password credentials",
                server.name
            ));
            return Ok(self.traditional_details(&server, target_name, &host));
        };

        let secret = SecretString::from(created.secret);
        self.lock().tickets.insert(
            CachedTicket::cache_key(server_id, target_name),
            CachedTicket {
                server_id: server_id.to_string(),
                target_name: target_name.to_string(),
                secret: secret.clone(),
                expires_at: None,
                uses_left: created.ticket.uses_left.unwrap_or(1),
            },
        );

        Ok(ticket_details(&secret, &host))
    }

    /// Record one consumption of a ticket; exhausted tickets are evicted.
    pub fn invalidate_ticket(&self, server_id: &str, target_name: &str) {
        let key = CachedTicket::cache_key(server_id, target_name);
        let mut regs = self.lock();

        if let Some(ticket) = regs.tickets.get_mut(&key) {
            if ticket.consume() {
                regs.tickets.remove(&key);
            }
        }
    }

    /// Resolve minimal connection details without contacting the gateway:
    /// a valid cached ticket when present, traditional username otherwise.
    ///
    /// # Errors
    /// Returns `Server {id} not found` for an unknown id or an unparseable
    /// gateway URL.
    pub fn get_ssh_connection_details(
        &self,
        server_id: &str,
        target_name: &str,
    ) -> Result<SshConnectionDetails> {
        let server = self
            .server(server_id)
            .ok_or_else(|| anyhow!("Server {server_id} not found"))?;
        let host = gateway_host(&server.url)?;

        if let Some(secret) = self.valid_cached_ticket(server_id, target_name) {
            return Ok(ticket_details(&secret, &host));
        }

        Ok(SshConnectionDetails {
            username: format!("{}:{target_name}", server.username),
            password: None,
            otp: None,
            host,
            port: TICKET_SSH_PORT,
        })
    }

    /// Resolve full credentials for one connection attempt: a valid cached
    /// ticket, or password plus a freshly generated TOTP code.
    ///
    /// # Errors
    /// Returns `Server {id} not found` for an unknown id or an unparseable
    /// gateway URL.
    pub fn get_full_auth_credentials(
        &self,
        server_id: &str,
        target_name: &str,
    ) -> Result<SshConnectionDetails> {
        let server = self
            .server(server_id)
            .ok_or_else(|| anyhow!("Server {server_id} not found"))?;
        let host = gateway_host(&server.url)?;

        if let Some(secret) = self.valid_cached_ticket(server_id, target_name) {
            return Ok(ticket_details(&secret, &host));
        }

        Ok(self.traditional_details(&server, target_name, &host))
    }

    /// # Errors
    /// Returns `Server {id} not found` for an unknown id.
    pub async fn refresh_targets(&self, id: &str) -> Result<()> {
        let server = self
            .server(id)
            .ok_or_else(|| anyhow!("Server {id} not found"))?;
        let client = self.client_for(&server)?;

        match client.get_targets(None).await {
            Ok(targets) => {
                {
                    let mut regs = self.lock();
                    let status = regs.status.entry(id.to_string()).or_default();
                    status.targets = targets;
                    status.last_error = None;
                    status.last_checked = Some(now_millis());
                }
                self.emit(BrokerEvent::TargetsRefreshed {
                    server_id: id.to_string(),
                });
            }
            Err(err) => {
                self.lock()
                    .status
                    .entry(id.to_string())
                    .or_default()
                    .last_error = Some(err.to_string());
            }
        }

        Ok(())
    }

    /// Connect every enabled server concurrently; one server's failure never
    /// aborts its siblings, it lands in that server's status entry.
    pub async fn connect_all(&self) {
        let ids: Vec<String> = self
            .servers()
            .into_iter()
            .filter(|server| server.enabled)
            .map(|server| server.id)
            .collect();

        join_all(ids.iter().map(|id| self.connect_captured(id))).await;
    }

    async fn connect_captured(&self, id: &str) {
        if let Err(err) = self.connect(id).await {
            self.update_status(id, false, Some(err.to_string()));
        }
    }

    /// Refresh targets for every currently-connected server concurrently.
    pub async fn refresh_all_targets(&self) {
        let ids: Vec<String> = {
            let regs = self.lock();
            regs.status
                .iter()
                .filter(|(_, status)| status.connected)
                .map(|(id, _)| id.clone())
                .collect()
        };

        join_all(ids.iter().map(|id| async move {
            if let Err(err) = self.refresh_targets(id).await {
                debug!("Target refresh for {id} failed: {err}");
            }
        }))
        .await;
    }

    /// Re-arm (or disable, with `0`) the periodic target refresh.
    pub fn set_refresh_interval(&self, seconds: u64) {
        let mut regs = self.lock();

        if let Some(task) = regs.refresh_task.take() {
            task.abort();
        }
        if seconds == 0 {
            return;
        }

        let broker = self.clone();
        regs.refresh_task = Some(tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(seconds));
            ticker.tick().await;

            loop {
                ticker.tick().await;
                broker.refresh_all_targets().await;
            }
        }));
    }

    /// Tear down: cancel all timers, log out everywhere best-effort, clear
    /// every registry.
    pub async fn destroy(&self) {
        let (timers, clients) = {
            let mut regs = self.lock();

            let mut timers: Vec<JoinHandle<()>> =
                regs.test_cleanups.drain().map(|(_, timer)| timer).collect();
            if let Some(task) = regs.refresh_task.take() {
                timers.push(task);
            }

            let clients: Vec<Arc<ApiClient>> = regs
                .sessions
                .keys()
                .filter_map(|id| regs.clients.get(id).cloned())
                .collect();

            regs.sessions.clear();
            regs.tickets.clear();
            regs.status.clear();
            regs.test_clients.clear();
            regs.clients.clear();

            (timers, clients)
        };

        for timer in timers {
            timer.abort();
        }

        for client in clients {
            if let Err(err) = client.logout().await {
                debug!("Logout during teardown failed: {err}");
            }
        }
    }
}
