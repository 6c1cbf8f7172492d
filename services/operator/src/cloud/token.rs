//! Single-flight auth token cache.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{AuthToken, CloudClient, CloudError};

/// Tokens are refreshed this long before their stated expiry.
const EXPIRY_SKEW: Duration = Duration::from_secs(60);

/// Caches the provider token and refreshes it lazily.
///
/// The lock is held across the refresh call, so concurrent callers that find
/// the token stale wait for the one refresh in flight instead of issuing
/// their own.
pub struct TokenCache {
    client: Arc<dyn CloudClient>,
    current: Mutex<Option<AuthToken>>,
    timeout: Duration,
}

impl TokenCache {
    pub fn new(client: Arc<dyn CloudClient>, timeout: Duration) -> Self {
        Self {
            client,
            current: Mutex::new(None),
            timeout,
        }
    }

    /// Returns a valid token, authenticating if none is cached or it expired.
    pub async fn token(&self) -> Result<String, CloudError> {
        let mut current = self.current.lock().await;

        if let Some(token) = current.as_ref() {
            if !token.is_expired(Utc::now(), EXPIRY_SKEW) {
                return Ok(token.token.clone());
            }
            debug!(expires_at = %token.expires_at, "Cloud token expired, refreshing");
        }

        let fresh = match tokio::time::timeout(self.timeout, self.client.authenticate()).await {
            Ok(result) => result?,
            Err(_) => return Err(CloudError::Timeout(self.timeout)),
        };
        info!(expires_at = %fresh.expires_at, "Authenticated with cloud provider");

        let value = fresh.token.clone();
        *current = Some(fresh);
        Ok(value)
    }

    /// Drops the cached token if it is still `rejected`.
    ///
    /// A token refreshed by another caller since `rejected` was handed out
    /// is kept.
    pub async fn invalidate(&self, rejected: &str) {
        let mut current = self.current.lock().await;
        if current.as_ref().is_some_and(|token| token.token == rejected) {
            *current = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::MockCloud;

    #[tokio::test]
    async fn test_token_is_cached() {
        let cloud = Arc::new(MockCloud::new());
        let cache = TokenCache::new(cloud.clone(), Duration::from_secs(5));

        let a = cache.token().await.unwrap();
        let b = cache.token().await.unwrap();
        assert_eq!(a, b);
        assert_eq!(cloud.auth_calls(), 1);
    }

    #[tokio::test]
    async fn test_invalidate_forces_refresh() {
        let cloud = Arc::new(MockCloud::new());
        let cache = TokenCache::new(cloud.clone(), Duration::from_secs(5));

        let first = cache.token().await.unwrap();
        cache.invalidate(&first).await;
        cache.token().await.unwrap();
        assert_eq!(cloud.auth_calls(), 2);
    }

    #[tokio::test]
    async fn test_stale_rejection_keeps_fresh_token() {
        let cloud = Arc::new(MockCloud::new());
        let cache = TokenCache::new(cloud.clone(), Duration::from_secs(5));

        let stale = cache.token().await.unwrap();
        cache.invalidate(&stale).await;
        let fresh = cache.token().await.unwrap();
        assert_ne!(stale, fresh);

        // A late rejection of the old token must not evict the new one.
        cache.invalidate(&stale).await;
        assert_eq!(cache.token().await.unwrap(), fresh);
        assert_eq!(cloud.auth_calls(), 2);
    }

    #[tokio::test]
    async fn test_expired_token_refreshed_once_for_concurrent_callers() {
        let cloud = Arc::new(MockCloud::new().with_auth_delay(Duration::from_millis(50)));
        // First token is already inside the expiry skew.
        cloud.set_token_ttl(Duration::from_secs(1));
        let cache = Arc::new(TokenCache::new(cloud.clone(), Duration::from_secs(5)));
        cache.token().await.unwrap();
        assert_eq!(cloud.auth_calls(), 1);

        cloud.set_token_ttl(Duration::from_secs(3600));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            handles.push(tokio::spawn(async move { cache.token().await }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(cloud.auth_calls(), 2);
    }

    #[tokio::test]
    async fn test_auth_rejection_is_not_cached() {
        let cloud = Arc::new(MockCloud::new());
        cloud.reject_auth(true);
        let cache = TokenCache::new(cloud.clone(), Duration::from_secs(5));

        assert!(cache.token().await.unwrap_err().is_auth());
        cloud.reject_auth(false);
        assert!(cache.token().await.is_ok());
        assert_eq!(cloud.auth_calls(), 2);
    }
}
