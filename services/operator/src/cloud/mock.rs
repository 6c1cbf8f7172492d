//! In-memory cloud client for testing and development.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info};

use super::{AuthToken, CloudClient, CloudError, CloudServer, InstanceSpec};

/// Mock cloud that keeps servers in memory and counts calls.
pub struct MockCloud {
    servers: Mutex<Vec<CloudServer>>,
    id_counter: AtomicU64,
    auth_calls: AtomicU64,
    create_calls: AtomicU64,
    find_calls: AtomicU64,
    delete_calls: AtomicU64,
    reject_auth: AtomicBool,
    token_ttl: Mutex<Duration>,
    auth_delay: Duration,
    create_failure: Mutex<Option<String>>,
    create_delays: Mutex<HashMap<String, Duration>>,
}

impl MockCloud {
    pub fn new() -> Self {
        Self {
            servers: Mutex::new(Vec::new()),
            id_counter: AtomicU64::new(0),
            auth_calls: AtomicU64::new(0),
            create_calls: AtomicU64::new(0),
            find_calls: AtomicU64::new(0),
            delete_calls: AtomicU64::new(0),
            reject_auth: AtomicBool::new(false),
            token_ttl: Mutex::new(Duration::from_secs(3600)),
            auth_delay: Duration::ZERO,
            create_failure: Mutex::new(None),
            create_delays: Mutex::new(HashMap::new()),
        }
    }

    /// Simulate slow authentication.
    pub fn with_auth_delay(mut self, delay: Duration) -> Self {
        self.auth_delay = delay;
        self
    }

    /// Lifetime of tokens issued from now on.
    pub fn set_token_ttl(&self, ttl: Duration) {
        if let Ok(mut current) = self.token_ttl.lock() {
            *current = ttl;
        }
    }

    pub fn reject_auth(&self, reject: bool) {
        self.reject_auth.store(reject, Ordering::SeqCst);
    }

    /// Make every create fail with `message` (or succeed again with `None`).
    pub fn fail_creates_with(&self, message: Option<&str>) {
        if let Ok(mut failure) = self.create_failure.lock() {
            *failure = message.map(str::to_string);
        }
    }

    /// Delay creates of the server named `name`.
    pub fn delay_create(&self, name: &str, delay: Duration) {
        if let Ok(mut delays) = self.create_delays.lock() {
            delays.insert(name.to_string(), delay);
        }
    }

    /// Seed a server as if it had been created earlier.
    pub fn insert_server(&self, id: &str, name: &str) {
        if let Ok(mut servers) = self.servers.lock() {
            servers.push(CloudServer {
                id: id.to_string(),
                name: name.to_string(),
            });
        }
    }

    pub fn servers(&self) -> Vec<CloudServer> {
        self.servers.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn auth_calls(&self) -> u64 {
        self.auth_calls.load(Ordering::SeqCst)
    }

    pub fn create_calls(&self) -> u64 {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn find_calls(&self) -> u64 {
        self.find_calls.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> u64 {
        self.delete_calls.load(Ordering::SeqCst)
    }

    fn next_server_id(&self) -> String {
        let counter = self.id_counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("i-{counter:03}")
    }
}

impl Default for MockCloud {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CloudClient for MockCloud {
    async fn authenticate(&self) -> Result<AuthToken, CloudError> {
        let call = self.auth_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.auth_delay.is_zero() {
            tokio::time::sleep(self.auth_delay).await;
        }
        if self.reject_auth.load(Ordering::SeqCst) {
            return Err(CloudError::Auth("The request you have made requires authentication.".into()));
        }

        let ttl = self
            .token_ttl
            .lock()
            .map(|ttl| *ttl)
            .unwrap_or(Duration::from_secs(3600));
        let expires_at = Utc::now()
            + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::hours(1));
        debug!(call, "[MOCK] Issued cloud token");
        Ok(AuthToken {
            token: format!("mock-token-{call}"),
            expires_at,
        })
    }

    async fn create_server(
        &self,
        _token: &str,
        spec: &InstanceSpec,
    ) -> Result<CloudServer, CloudError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);

        let delay = self
            .create_delays
            .lock()
            .ok()
            .and_then(|delays| delays.get(&spec.name).copied());
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let failure = self.create_failure.lock().ok().and_then(|f| f.clone());
        if let Some(message) = failure {
            return Err(CloudError::Provision(message));
        }

        let server = CloudServer {
            id: self.next_server_id(),
            name: spec.name.clone(),
        };
        info!(name = %server.name, id = %server.id, "[MOCK] Created server");
        if let Ok(mut servers) = self.servers.lock() {
            servers.push(server.clone());
        }
        Ok(server)
    }

    async fn find_server(&self, _token: &str, name: &str) -> Result<Option<CloudServer>, CloudError> {
        self.find_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .servers
            .lock()
            .ok()
            .and_then(|servers| servers.iter().find(|s| s.name == name).cloned()))
    }

    async fn list_servers(&self, _token: &str, prefix: &str) -> Result<Vec<CloudServer>, CloudError> {
        Ok(self
            .servers
            .lock()
            .map(|servers| {
                servers
                    .iter()
                    .filter(|s| s.name.starts_with(prefix))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn delete_server(&self, _token: &str, id: &str) -> Result<(), CloudError> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut servers) = self.servers.lock() {
            servers.retain(|s| s.id != id);
        }
        info!(id = %id, "[MOCK] Deleted server");
        Ok(())
    }
}
