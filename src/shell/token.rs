use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::Rng;
use subtle::ConstantTimeEq;

/// Time-to-live for a pending shell token.
pub const TOKEN_TTL: Duration = Duration::from_secs(60);

/// Maximum number of pending (unconsumed) tokens.
pub const MAX_PENDING_TOKENS: usize = 1024;

const TOKEN_LEN: usize = 32;

/// Short-lived, single-use tokens that authorize opening a shell socket.
///
/// Browser WebSocket connections cannot set custom headers, so the client
/// first mints a token over authenticated HTTP (`POST /api/shell-token`) and
/// then presents it as `?shellToken=` on the upgrade. A token is bound to one
/// `(cluster, terminal)` pair and is consumed by the first validation attempt,
/// successful or not.
pub struct ShellTokenStore {
    inner: Mutex<HashMap<(String, String), (String, Instant)>>,
}

#[derive(Debug, PartialEq, Eq)]
pub struct TooManyPending;

impl Default for ShellTokenStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ShellTokenStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Mint a token for `(cluster_id, terminal_id)`, replacing any earlier one.
    pub fn create(&self, cluster_id: &str, terminal_id: &str) -> Result<String, TooManyPending> {
        let mut map = self.inner.lock();

        let now = Instant::now();
        map.retain(|_, (_, created)| now.duration_since(*created) < TOKEN_TTL);

        let key = (cluster_id.to_string(), terminal_id.to_string());
        if !map.contains_key(&key) && map.len() >= MAX_PENDING_TOKENS {
            return Err(TooManyPending);
        }

        let token: String = rand::thread_rng()
            .sample_iter(&rand::distributions::Alphanumeric)
            .take(TOKEN_LEN)
            .map(char::from)
            .collect();

        map.insert(key, (token.clone(), now));
        Ok(token)
    }

    /// Validate and consume the token for `(cluster_id, terminal_id)`.
    pub fn validate(&self, cluster_id: &str, terminal_id: &str, token: &str) -> bool {
        let key = (cluster_id.to_string(), terminal_id.to_string());
        let Some((expected, created)) = self.inner.lock().remove(&key) else {
            return false;
        };
        let fresh = Instant::now().duration_since(created) < TOKEN_TTL;
        let matches: bool = expected.as_bytes().ct_eq(token.as_bytes()).into();
        fresh && matches
    }

    pub fn pending(&self) -> usize {
        self.inner.lock().len()
    }
}
