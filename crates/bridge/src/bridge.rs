//! Capability queries with a per-call timeout, a last-known-good cache and
//! backoff for services that did not answer in time.

use std::{collections::HashMap, sync::Arc, time::Duration};

use {
    futures::future::join_all,
    mcpdock_common::{CapabilitySnapshot, ConnectionType, PluginId, PluginTarget},
    mcpdock_config::BridgeSettings,
    secrecy::Secret,
    tokio::{
        sync::{RwLock, watch},
        time::Instant,
    },
    tracing::{debug, info, warn},
};

use crate::{
    client::McpClient,
    error::{BridgeError, Result},
    http::StreamableHttpTransport,
    local::LocalServices,
    sse::SseTransport,
    traits::McpTransport,
};

pub struct BridgeClient {
    local: Arc<LocalServices>,
    timeout: Duration,
    backoff: Duration,
    cache: RwLock<HashMap<PluginId, Vec<String>>>,
    /// Plugins skipped by non-forced refreshes until the given instant.
    postponed: RwLock<HashMap<PluginId, Instant>>,
    snapshot: watch::Sender<CapabilitySnapshot>,
}

impl BridgeClient {
    pub fn new(local: Arc<LocalServices>, settings: &BridgeSettings) -> Self {
        Self::with_timeouts(
            local,
            Duration::from_secs(settings.timeout_secs),
            Duration::from_secs(settings.refresh_backoff_secs),
        )
    }

    pub fn with_timeouts(local: Arc<LocalServices>, timeout: Duration, backoff: Duration) -> Self {
        let (snapshot, _) = watch::channel(CapabilitySnapshot::new());
        Self {
            local,
            timeout,
            backoff,
            cache: RwLock::new(HashMap::new()),
            postponed: RwLock::new(HashMap::new()),
            snapshot,
        }
    }

    pub fn local(&self) -> &Arc<LocalServices> {
        &self.local
    }

    /// Ask the service behind `target` for its tool names.
    ///
    /// Returns `None` when the service did not answer within the timeout or
    /// failed. A timeout postpones the plugin's next background refresh. The
    /// cached result of an earlier success is kept in every case.
    pub async fn get_service_info(&self, id: &PluginId, target: &PluginTarget) -> Option<Vec<String>> {
        let outcome = match tokio::time::timeout(self.timeout, self.query(id, target)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(BridgeError::Timeout {
                method: "tools/list".into(),
                after: self.timeout,
            }),
        };

        match outcome {
            Ok(tools) => {
                debug!(plugin = %id, count = tools.len(), "capabilities refreshed");
                self.postponed.write().await.remove(id);
                self.cache.write().await.insert(id.clone(), tools.clone());
                self.publish().await;
                Some(tools)
            },
            Err(e) if e.is_timeout() => {
                info!(plugin = %id, timeout = ?self.timeout, "capability query timed out, postponing");
                self.postponed
                    .write()
                    .await
                    .insert(id.clone(), Instant::now() + self.backoff);
                None
            },
            Err(BridgeError::NotRunning { .. }) => {
                debug!(plugin = %id, "local service not running");
                None
            },
            Err(e) => {
                warn!(plugin = %id, error = %e, "capability query failed");
                None
            },
        }
    }

    async fn query(&self, id: &PluginId, target: &PluginTarget) -> Result<Vec<String>> {
        match target {
            PluginTarget::Local { .. } => {
                let client = self
                    .local
                    .client(id)
                    .await
                    .ok_or_else(|| BridgeError::NotRunning { id: id.clone() })?;
                client.tool_names().await
            },
            PluginTarget::Remote {
                endpoint,
                connection_type,
                token,
            } => {
                let token = token.clone().map(Secret::new);
                let transport: Arc<dyn McpTransport> = match connection_type {
                    ConnectionType::HttpStream => {
                        StreamableHttpTransport::new(endpoint, token, self.timeout)?
                    },
                    ConnectionType::Sse => SseTransport::connect(endpoint, token, self.timeout).await?,
                };
                let client = McpClient::initialize(id.as_str(), transport).await?;
                let names = client.tool_names().await;
                client.shutdown().await;
                names
            },
        }
    }

    /// Query every target concurrently and publish the merged snapshot.
    ///
    /// Postponed plugins are skipped unless `force` is set. Cached entries for
    /// ids absent from `targets` are dropped.
    pub async fn refresh_all(
        &self,
        targets: &[(PluginId, PluginTarget)],
        force: bool,
    ) -> CapabilitySnapshot {
        let now = Instant::now();
        let due: Vec<_> = {
            let postponed = self.postponed.read().await;
            targets
                .iter()
                .filter(|(id, _)| force || postponed.get(id).is_none_or(|until| *until <= now))
                .collect()
        };
        debug!(total = targets.len(), due = due.len(), force, "refreshing capabilities");

        join_all(
            due.into_iter()
                .map(|(id, target)| self.get_service_info(id, target)),
        )
        .await;

        {
            let mut cache = self.cache.write().await;
            cache.retain(|id, _| targets.iter().any(|(t, _)| t == id));
        }
        self.postponed
            .write()
            .await
            .retain(|id, _| targets.iter().any(|(t, _)| t == id));
        self.publish().await;
        self.snapshot()
    }

    /// Last successful tool list for `id`.
    pub async fn cached(&self, id: &PluginId) -> Option<Vec<String>> {
        self.cache.read().await.get(id).cloned()
    }

    pub async fn is_postponed(&self, id: &PluginId) -> bool {
        self.postponed
            .read()
            .await
            .get(id)
            .is_some_and(|until| *until > Instant::now())
    }

    /// Drop everything known about `id`, e.g. after uninstall.
    pub async fn forget(&self, id: &PluginId) {
        self.cache.write().await.remove(id);
        self.postponed.write().await.remove(id);
        self.publish().await;
    }

    pub fn snapshot(&self) -> CapabilitySnapshot {
        self.snapshot.borrow().clone()
    }

    /// Snapshot updates. Delivery is latest-wins.
    pub fn subscribe(&self) -> watch::Receiver<CapabilitySnapshot> {
        self.snapshot.subscribe()
    }

    async fn publish(&self) {
        let next: CapabilitySnapshot = self
            .cache
            .read()
            .await
            .iter()
            .map(|(id, tools)| (id.clone(), tools.clone()))
            .collect();
        self.snapshot.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
    }
}
