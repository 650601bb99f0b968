//! Server configuration and the persistence seam.

use anyhow::Result;
use secrecy::SecretString;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use uuid::Uuid;

/// A configured gateway server. Credentials live only in memory for the
/// lifetime of the entry.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub id: String,
    pub name: String,
    pub url: String,
    pub username: String,
    pub password: Option<SecretString>,
    pub enabled: bool,
    pub trust_self_signed: Option<bool>,
    pub otp_secret: Option<SecretString>,
    /// Unix timestamp in milliseconds.
    pub last_connected: Option<u64>,
}

/// Input for creating a server entry; the id is generated by the broker.
#[derive(Debug, Clone)]
pub struct NewServer {
    pub name: String,
    pub url: String,
    pub username: String,
    pub password: Option<SecretString>,
    pub trust_self_signed: Option<bool>,
    pub otp_secret: Option<SecretString>,
}

impl NewServer {
    pub(crate) fn into_config(self) -> ServerConfig {
        ServerConfig {
            id: Uuid::new_v4().to_string(),
            name: self.name,
            url: self.url,
            username: self.username,
            password: self.password,
            enabled: true,
            trust_self_signed: self.trust_self_signed,
            otp_secret: self.otp_secret,
            last_connected: None,
        }
    }
}

/// Persistence seam for the server collection.
///
/// Implementations may track changes per element, so mutations MUST happen in
/// place on the `Vec` handed to `with_servers` (push, `Vec::remove`, indexed
/// field writes); the collection itself is never rebuilt or replaced. Every
/// completed mutation is followed by one `save` call.
pub trait ConfigStore: Send + Sync {
    fn with_servers(&self, f: &mut dyn FnMut(&mut Vec<ServerConfig>));

    /// # Errors
    /// Returns an error when the backing store cannot persist the collection.
    fn save(&self) -> Result<()>;
}

/// In-memory store used by the CLI and tests.
#[derive(Default)]
pub struct MemoryConfigStore {
    servers: Mutex<Vec<ServerConfig>>,
    saves: AtomicUsize,
}

impl MemoryConfigStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_entries(servers: Vec<ServerConfig>) -> Self {
        Self {
            servers: Mutex::new(servers),
            saves: AtomicUsize::new(0),
        }
    }

    /// Number of completed `save` calls.
    #[must_use]
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

impl ConfigStore for MemoryConfigStore {
    fn with_servers(&self, f: &mut dyn FnMut(&mut Vec<ServerConfig>)) {
        let mut servers = self
            .servers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        f(&mut servers);
    }

    fn save(&self) -> Result<()> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
