//! Wire types for the Warpgate HTTP API.

use serde::{Deserialize, Serialize};

/// Authentication progress as reported by the gateway.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthState {
    #[serde(default)]
    pub started: bool,
    pub auth: AuthInfo,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthInfo {
    pub state: AuthStateKind,
    #[serde(default)]
    pub methods_remaining: Vec<CredentialKind>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum AuthStateKind {
    NotStarted,
    Progress,
    Need,
    Accepted,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum CredentialKind {
    Password,
    Otp,
    PublicKey,
    WebAuthn,
    #[serde(other)]
    Other,
}

impl AuthState {
    #[must_use]
    pub fn need(methods: Vec<CredentialKind>) -> Self {
        Self {
            started: true,
            auth: AuthInfo {
                state: AuthStateKind::Need,
                methods_remaining: methods,
            },
        }
    }

    #[must_use]
    pub fn rejected() -> Self {
        Self {
            started: true,
            auth: AuthInfo {
                state: AuthStateKind::Rejected,
                methods_remaining: Vec::new(),
            },
        }
    }

    #[must_use]
    pub fn is_accepted(&self) -> bool {
        self.auth.state == AuthStateKind::Accepted
    }

    #[must_use]
    pub fn needs_otp(&self) -> bool {
        self.auth.state == AuthStateKind::Need
            && self.auth.methods_remaining.contains(&CredentialKind::Otp)
    }
}

/// A host or service reachable through the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Target {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub kind: TargetKind,
    #[serde(default)]
    pub group: Option<TargetGroup>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum TargetKind {
    Ssh,
    Http,
    MySql,
    WebAdmin,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TargetGroup {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub color: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TicketRequest {
    pub username: String,
    pub target_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiry: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub number_of_uses: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Response to ticket creation; `secret` is the one-time credential material.
#[derive(Debug, Clone, Deserialize)]
pub struct TicketCreated {
    pub ticket: TicketInfo,
    pub secret: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TicketInfo {
    pub id: String,
    pub username: String,
    pub target: String,
    #[serde(default)]
    pub uses_left: Option<i64>,
    #[serde(default)]
    pub expiry: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserInfo {
    pub username: String,
    #[serde(default)]
    pub roles: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OtpCredential {
    pub id: String,
}
