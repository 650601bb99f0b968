//! In-memory cache of gateway-issued tickets.

use secrecy::SecretString;

/// Uses-left sentinel for unlimited tickets.
pub const UNLIMITED_USES: i64 = -1;

/// A ticket held for reuse until exhausted or expired.
#[derive(Debug, Clone)]
pub struct CachedTicket {
    pub server_id: String,
    pub target_name: String,
    pub secret: SecretString,
    /// Unix timestamp in milliseconds; `None` = non-expiring.
    pub expires_at: Option<u64>,
    /// `-1` = unlimited, `0` = exhausted.
    pub uses_left: i64,
}

impl CachedTicket {
    #[must_use]
    pub fn cache_key(server_id: &str, target_name: &str) -> String {
        format!("{server_id}:{target_name}")
    }

    /// An exhausted or expired ticket must never reach a caller.
    #[must_use]
    pub fn is_valid(&self, now_millis: u64) -> bool {
        self.uses_left != 0 && self.expires_at.map_or(true, |expiry| expiry > now_millis)
    }

    /// Consume one use; returns whether the ticket is now exhausted.
    pub fn consume(&mut self) -> bool {
        if self.uses_left > 0 {
            self.uses_left -= 1;
        }

        self.uses_left == 0
    }
}
