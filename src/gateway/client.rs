//! HTTP client for a single Warpgate gateway endpoint.

use crate::gateway::error::{normalize_request_error, truncate_body, ApiError, ApiResult};
use crate::gateway::types::{
    AuthState, CredentialKind, OtpCredential, Target, TargetKind, TicketCreated, TicketInfo,
    TicketRequest, UserInfo,
};
use reqwest::header::{HeaderMap, COOKIE, SET_COOKIE};
use reqwest::{Client, Method, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info_span, Instrument};
use url::form_urlencoded;

/// Name of the session cookie issued by the gateway.
pub const SESSION_COOKIE_NAME: &str = "warpgate-http-session";

const API_BASE: &str = "/@warpgate/api";
const ADMIN_API_BASE: &str = "/@warpgate/admin/api";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub const DEFAULT_SSH_PORT: u16 = 22;
pub const TICKET_SSH_PORT: u16 = 2222;

/// Client for one gateway endpoint.
///
/// Owns the base URL, the TLS-trust choice, and the single mutable session
/// cookie. The cookie is only ever written by this instance; hand-off to
/// another instance goes through [`ApiClient::set_session_cookie`].
pub struct ApiClient {
    base_url: String,
    http: Client,
    session_cookie: Mutex<Option<String>>,
}

/// Default the scheme to `https://` and strip trailing slashes.
#[must_use]
pub fn normalize_base_url(url: &str) -> String {
    let trimmed = url.trim();
    let with_scheme = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    };

    with_scheme.trim_end_matches('/').to_string()
}

/// Gateway-side username that consumes a ticket.
#[must_use]
pub fn ticket_username(secret: &str) -> String {
    format!("ticket-{secret}")
}

#[must_use]
pub fn ssh_connection_string(target_name: &str, user: &str, host: &str, port: u16) -> String {
    format!("{user}:{target_name}@{host}:{port}")
}

#[must_use]
pub fn ticket_connection_string(secret: &str, host: &str, port: u16) -> String {
    format!("ticket-{secret}@{host}:{port}")
}

impl ApiClient {
    /// # Errors
    /// Fails when the underlying HTTP client cannot be constructed.
    pub fn new(base_url: &str, trust_self_signed: bool) -> ApiResult<Self> {
        let http = Client::builder()
            .user_agent(crate::APP_USER_AGENT)
            .timeout(REQUEST_TIMEOUT)
            .danger_accept_invalid_certs(trust_self_signed)
            .build()
            .map_err(|err| {
                ApiError::network(format!("Failed to build HTTP client: {err}"), None)
            })?;

        Ok(Self {
            base_url: normalize_base_url(base_url),
            http,
            session_cookie: Mutex::new(None),
        })
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    #[must_use]
    pub fn session_cookie(&self) -> Option<String> {
        self.session_cookie
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Transplant or clear the session cookie.
    pub fn set_session_cookie(&self, cookie: Option<String>) {
        *self
            .session_cookie
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = cookie;
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}{API_BASE}{path}", self.base_url)
    }

    fn admin_url(&self, path: &str) -> String {
        format!("{}{ADMIN_API_BASE}{path}", self.base_url)
    }

    /// Pull the gateway session cookie out of any response carrying one. The
    /// gateway may rotate the cookie mid-flow, so this runs on every response.
    fn capture_session_cookie(&self, headers: &HeaderMap) {
        for value in headers.get_all(SET_COOKIE) {
            let Ok(raw) = value.to_str() else { continue };
            let Some(pair) = raw.split(';').next() else { continue };
            let Some((name, cookie)) = pair.split_once('=') else {
                continue;
            };

            if name.trim() == SESSION_COOKIE_NAME {
                debug!("captured session cookie");
                self.set_session_cookie(Some(cookie.trim().to_string()));
            }
        }
    }

    async fn send(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
    ) -> ApiResult<(StatusCode, String)> {
        let mut request = self.http.request(method.clone(), url);

        if let Some(cookie) = self.session_cookie() {
            request = request.header(COOKIE, format!("{SESSION_COOKIE_NAME}={cookie}"));
        }

        if let Some(body) = body {
            request = request.json(body);
        }

        let span = info_span!(
            "gateway.request",
            http.method = %method,
            url = %url
        );
        let response = request
            .send()
            .instrument(span)
            .await
            .map_err(|err| normalize_request_error(&err, url))?;

        self.capture_session_cookie(response.headers());

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| normalize_request_error(&err, url))?;

        Ok((status, body))
    }

    /// # Errors
    /// Network failures and non-2xx responses surface as [`ApiError`]; a `401`
    /// carrying an auth state folds into `Ok` instead, so callers always see
    /// one state representation.
    pub async fn login(&self, username: &str, password: &SecretString) -> ApiResult<AuthState> {
        let payload = json!({
            "username": username,
            "password": password.expose_secret(),
        });

        let (status, body) = self
            .send(Method::POST, &self.api_url("/auth/login"), Some(&payload))
            .await?;

        fold_auth_state(status, &body)
    }

    /// # Errors
    /// Returns an [`ApiError`] on network failure or non-2xx status.
    pub async fn logout(&self) -> ApiResult<()> {
        let (status, body) = self
            .send(Method::POST, &self.api_url("/auth/logout"), None)
            .await?;

        if status.is_success() {
            self.set_session_cookie(None);
            Ok(())
        } else {
            Err(ApiError::http(status, &body))
        }
    }

    /// # Errors
    /// Returns an [`ApiError`] on network failure or an unusable response.
    pub async fn get_auth_state(&self) -> ApiResult<AuthState> {
        let (status, body) = self
            .send(Method::GET, &self.api_url("/auth/state"), None)
            .await?;

        fold_auth_state(status, &body)
    }

    /// # Errors
    /// Returns an [`ApiError`] on network failure or an unusable response.
    pub async fn submit_otp(&self, code: &str) -> ApiResult<AuthState> {
        let payload = json!({ "otp": code });

        let (status, body) = self
            .send(Method::POST, &self.api_url("/auth/otp"), Some(&payload))
            .await?;

        fold_auth_state(status, &body)
    }

    /// # Errors
    /// Returns an [`ApiError`] on network failure or non-2xx status.
    pub async fn get_targets(&self, search: Option<&str>) -> ApiResult<Vec<Target>> {
        let mut url = self.api_url("/targets");

        if let Some(search) = search {
            let escaped: String = form_urlencoded::byte_serialize(search.as_bytes()).collect();
            url.push_str(&format!("?search={escaped}"));
        }

        let (status, body) = self.send(Method::GET, &url, None).await?;

        Ok(parse_success::<Vec<Target>>(status, &body)?.unwrap_or_default())
    }

    /// # Errors
    /// Propagates [`get_targets`](Self::get_targets) errors unchanged.
    pub async fn get_ssh_targets(&self) -> ApiResult<Vec<Target>> {
        Ok(self
            .get_targets(None)
            .await?
            .into_iter()
            .filter(|target| target.kind == TargetKind::Ssh)
            .collect())
    }

    /// Probe the gateway without surfacing error detail.
    pub async fn test_connection(&self) -> bool {
        self.get_auth_state().await.is_ok()
    }

    /// # Errors
    /// Returns an [`ApiError`] on network failure or non-2xx status; callers
    /// lacking admin scope see the gateway's `403`.
    pub async fn create_ticket(&self, request: &TicketRequest) -> ApiResult<Option<TicketCreated>> {
        let payload = serde_json::to_value(request)
            .map_err(|err| ApiError::network(format!("Failed to encode request: {err}"), None))?;

        let (status, body) = self
            .send(Method::POST, &self.admin_url("/tickets"), Some(&payload))
            .await?;

        parse_success(status, &body)
    }

    /// # Errors
    /// Returns an [`ApiError`] on network failure or non-2xx status.
    pub async fn list_tickets(&self) -> ApiResult<Vec<TicketInfo>> {
        let (status, body) = self
            .send(Method::GET, &self.admin_url("/tickets"), None)
            .await?;

        Ok(parse_success::<Vec<TicketInfo>>(status, &body)?.unwrap_or_default())
    }

    /// # Errors
    /// Returns an [`ApiError`] on network failure or non-2xx status.
    pub async fn delete_ticket(&self, id: &str) -> ApiResult<()> {
        let (status, body) = self
            .send(Method::DELETE, &self.admin_url(&format!("/tickets/{id}")), None)
            .await?;

        if status.is_success() {
            Ok(())
        } else {
            Err(ApiError::http(status, &body))
        }
    }

    /// # Errors
    /// Returns an [`ApiError`] on network failure or non-2xx status.
    pub async fn get_user_info(&self) -> ApiResult<Option<UserInfo>> {
        let (status, body) = self.send(Method::GET, &self.api_url("/info"), None).await?;

        parse_success(status, &body)
    }

    /// # Errors
    /// Returns an [`ApiError`] on network failure or non-2xx status.
    pub async fn list_otp_credentials(&self) -> ApiResult<Vec<OtpCredential>> {
        let (status, body) = self
            .send(Method::GET, &self.api_url("/profile/credentials/otp"), None)
            .await?;

        Ok(parse_success::<Vec<OtpCredential>>(status, &body)?.unwrap_or_default())
    }

    /// Enroll a new self-service OTP credential.
    ///
    /// # Errors
    /// Returns an [`ApiError`] on network failure or non-2xx status.
    pub async fn create_otp_credential(
        &self,
        secret_key: &[u8],
    ) -> ApiResult<Option<OtpCredential>> {
        let payload = json!({ "secret_key": secret_key });

        let (status, body) = self
            .send(
                Method::POST,
                &self.api_url("/profile/credentials/otp"),
                Some(&payload),
            )
            .await?;

        parse_success(status, &body)
    }

    /// # Errors
    /// Returns an [`ApiError`] on network failure or non-2xx status.
    pub async fn delete_otp_credential(&self, id: &str) -> ApiResult<()> {
        let (status, body) = self
            .send(
                Method::DELETE,
                &self.api_url(&format!("/profile/credentials/otp/{id}")),
                None,
            )
            .await?;

        if status.is_success() {
            Ok(())
        } else {
            Err(ApiError::http(status, &body))
        }
    }

    /// # Errors
    /// Returns an [`ApiError`] on network failure or non-2xx status.
    pub async fn list_user_otp_credentials(&self, user_id: &str) -> ApiResult<Vec<OtpCredential>> {
        let (status, body) = self
            .send(
                Method::GET,
                &self.admin_url(&format!("/users/{user_id}/credentials/otp")),
                None,
            )
            .await?;

        Ok(parse_success::<Vec<OtpCredential>>(status, &body)?.unwrap_or_default())
    }

    /// # Errors
    /// Returns an [`ApiError`] on network failure or non-2xx status.
    pub async fn create_user_otp_credential(
        &self,
        user_id: &str,
        secret_key: &[u8],
    ) -> ApiResult<Option<OtpCredential>> {
        let payload = json!({ "secret_key": secret_key });

        let (status, body) = self
            .send(
                Method::POST,
                &self.admin_url(&format!("/users/{user_id}/credentials/otp")),
                Some(&payload),
            )
            .await?;

        parse_success(status, &body)
    }

    /// # Errors
    /// Returns an [`ApiError`] on network failure or non-2xx status.
    pub async fn delete_user_otp_credential(&self, user_id: &str, id: &str) -> ApiResult<()> {
        let (status, body) = self
            .send(
                Method::DELETE,
                &self.admin_url(&format!("/users/{user_id}/credentials/otp/{id}")),
                None,
            )
            .await?;

        if status.is_success() {
            Ok(())
        } else {
            Err(ApiError::http(status, &body))
        }
    }
}

/// Parse a 2xx body; an empty or non-JSON body is a success with no data.
fn parse_success<T: DeserializeOwned>(status: StatusCode, body: &str) -> ApiResult<Option<T>> {
    if !status.is_success() {
        return Err(ApiError::http(status, body));
    }

    Ok(serde_json::from_str(body).ok())
}

/// Fold any auth-endpoint response into the structured [`AuthState`] shape.
///
/// The gateway answers `401` with either a structured state or a bare
/// `{"state": "..."}` marker; both normalize here so callers see exactly one
/// representation. A bare `NotStarted` on `401` means the session is gone, a
/// hard error rather than a retryable auth-need.
fn fold_auth_state(status: StatusCode, body: &str) -> ApiResult<AuthState> {
    if status.is_success() {
        return serde_json::from_str(body).map_err(|_| ApiError {
            status: status.as_u16(),
            message: "Unexpected auth response from gateway".to_string(),
            details: Some(truncate_body(body)),
        });
    }

    if status == StatusCode::UNAUTHORIZED {
        if let Ok(state) = serde_json::from_str::<AuthState>(body) {
            return Ok(state);
        }

        let bare = serde_json::from_str::<Value>(body).ok().and_then(|value| {
            value
                .get("state")
                .and_then(Value::as_str)
                .or_else(|| value.as_str())
                .map(str::to_string)
        });

        match bare.as_deref() {
            Some("PasswordNeeded") => {
                return Ok(AuthState::need(vec![CredentialKind::Password]));
            }
            Some("Failed" | "Rejected") => return Ok(AuthState::rejected()),
            Some("NotStarted") => {
                return Err(ApiError::with_status(status.as_u16(), "Session expired"));
            }
            _ => {}
        }
    }

    Err(ApiError::http(status, body))
}
