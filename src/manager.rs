//! # Instance Manager
//!
//! Registry of forwarding instances keyed by [`InstanceId`].
//!
//! Registry lookups, inserts and removals are serialized by a short-lived
//! lock that is never held across an await. Lifecycle calls on one instance
//! are serialized by that instance's own lock, so different instances start
//! and stop concurrently.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, info, warn};

use crate::forward::{
    ForwardError, ForwardResult, ForwardSettings, ForwardingConfig, ForwardingInstance,
    InstanceId, InstanceStatus, LastError,
};

/// Owns every forwarding instance of the process (or of one embedding).
#[derive(Debug)]
pub struct InstanceManager {
    instances: RwLock<HashMap<InstanceId, Arc<ForwardingInstance>>>,
    next_id: AtomicU64,
    settings: ForwardSettings,
    error_sink: Option<Arc<LastError>>,
}

impl Default for InstanceManager {
    fn default() -> Self {
        Self::new()
    }
}

impl InstanceManager {
    /// Create an empty manager with default settings.
    pub fn new() -> Self {
        Self::with_settings(ForwardSettings::default())
    }

    /// Create an empty manager whose instances use `settings` unless given their own.
    pub fn with_settings(settings: ForwardSettings) -> Self {
        Self {
            instances: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            settings,
            error_sink: None,
        }
    }

    /// Also record listener failures of every instance created from now on
    /// into `sink`.
    #[must_use]
    pub fn with_error_sink(mut self, sink: Arc<LastError>) -> Self {
        self.error_sink = Some(sink);
        self
    }

    /// Default settings for new instances.
    pub fn settings(&self) -> &ForwardSettings {
        &self.settings
    }

    /// Register a new stopped instance.
    ///
    /// # Errors
    ///
    /// Returns `ForwardError::InvalidConfig` if the rule is malformed; nothing
    /// is registered in that case.
    pub fn create(&self, config: ForwardingConfig) -> ForwardResult<InstanceId> {
        self.create_with_settings(config, self.settings.clone())
    }

    /// Register a new stopped instance with its own settings.
    ///
    /// # Errors
    ///
    /// Returns `ForwardError::InvalidConfig` if the rule or settings are invalid.
    pub fn create_with_settings(
        &self,
        config: ForwardingConfig,
        settings: ForwardSettings,
    ) -> ForwardResult<InstanceId> {
        config.validate()?;
        settings.validate()?;

        let id = InstanceId::from_raw(self.next_id.fetch_add(1, Ordering::Relaxed));
        debug!(
            instance = %id,
            name = %config.display_name(),
            protocol = %config.protocol,
            listen = %config.listen,
            target = %config.target,
            "Forwarding instance created"
        );

        let mut instance = ForwardingInstance::new(id, config, settings);
        if let Some(sink) = &self.error_sink {
            instance = instance.with_error_sink(Arc::clone(sink));
        }
        let instance = Arc::new(instance);
        self.write().insert(id, instance);
        Ok(id)
    }

    /// Look up an instance.
    ///
    /// # Errors
    ///
    /// Returns `ForwardError::NotFound` for unknown or destroyed ids.
    pub fn get(&self, id: InstanceId) -> ForwardResult<Arc<ForwardingInstance>> {
        self.read()
            .get(&id)
            .cloned()
            .ok_or(ForwardError::NotFound(id))
    }

    /// Start an instance; returns its bound listen address.
    ///
    /// # Errors
    ///
    /// `NotFound`, `AlreadyRunning` or `BindFailed`.
    pub async fn start(&self, id: InstanceId) -> ForwardResult<SocketAddr> {
        self.get(id)?.start().await
    }

    /// Stop an instance.
    ///
    /// # Errors
    ///
    /// `NotFound` or `NotRunning`.
    pub async fn stop(&self, id: InstanceId) -> ForwardResult<()> {
        self.get(id)?.stop().await
    }

    /// Destroy a stopped instance and invalidate its id.
    ///
    /// # Errors
    ///
    /// `NotFound` or `StillRunning`.
    pub async fn destroy(&self, id: InstanceId) -> ForwardResult<()> {
        let instance = self.get(id)?;
        instance.retire().await?;

        let mut instances = self.write();
        if instances
            .get(&id)
            .is_some_and(|current| Arc::ptr_eq(current, &instance))
        {
            instances.remove(&id);
        }
        Ok(())
    }

    /// Whether the instance has an active listener.
    ///
    /// # Errors
    ///
    /// Returns `ForwardError::NotFound` for unknown ids.
    pub fn is_running(&self, id: InstanceId) -> ForwardResult<bool> {
        Ok(self.get(id)?.is_running())
    }

    /// Status snapshot of one instance.
    ///
    /// # Errors
    ///
    /// Returns `ForwardError::NotFound` for unknown ids.
    pub fn status(&self, id: InstanceId) -> ForwardResult<InstanceStatus> {
        Ok(self.get(id)?.status())
    }

    /// Bound listen address of a running instance.
    ///
    /// # Errors
    ///
    /// Returns `ForwardError::NotFound` for unknown ids.
    pub fn local_addr(&self, id: InstanceId) -> ForwardResult<Option<SocketAddr>> {
        Ok(self.get(id)?.local_addr())
    }

    /// Registered ids in ascending order.
    pub fn ids(&self) -> Vec<InstanceId> {
        let mut ids: Vec<_> = self.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Status of every registered instance, ordered by id.
    pub fn statuses(&self) -> Vec<InstanceStatus> {
        let mut statuses: Vec<_> = self.read().values().map(|i| i.status()).collect();
        statuses.sort_unstable_by_key(|s| s.id);
        statuses
    }

    /// Number of registered instances.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Stop and destroy every instance.
    pub async fn shutdown(&self) {
        let ids = self.ids();
        info!(instances = ids.len(), "Shutting down forwarding instances");

        for id in ids {
            match self.stop(id).await {
                Ok(()) | Err(ForwardError::NotRunning(_)) => {},
                Err(e) => warn!(instance = %id, error = %e, "Failed to stop instance"),
            }
            if let Err(e) = self.destroy(id).await {
                warn!(instance = %id, error = %e, "Failed to destroy instance");
            }
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<InstanceId, Arc<ForwardingInstance>>> {
        self.instances.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, HashMap<InstanceId, Arc<ForwardingInstance>>> {
        self.instances.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forward::Protocol;

    #[test]
    fn test_create_assigns_unique_ids() {
        let manager = InstanceManager::new();
        let a = manager
            .create(ForwardingConfig::tcp("127.0.0.1:0", "127.0.0.1:9"))
            .unwrap();
        let b = manager
            .create(ForwardingConfig::udp("127.0.0.1:0", "127.0.0.1:9"))
            .unwrap();

        assert_eq!(a.get(), 1);
        assert_eq!(b.get(), 2);
        assert_eq!(manager.ids(), vec![a, b]);
        assert!(!manager.is_running(a).unwrap());
    }

    #[test]
    fn test_create_rejects_invalid_config() {
        let manager = InstanceManager::new();
        let err = manager
            .create(ForwardingConfig::new("nonsense", "127.0.0.1:9", Protocol::Tcp))
            .unwrap_err();
        assert!(matches!(err, ForwardError::InvalidConfig(_)));
        assert!(manager.is_empty());
    }

    #[test]
    fn test_unknown_id() {
        let manager = InstanceManager::new();
        let id = InstanceId::from_raw(99);
        assert!(matches!(manager.is_running(id), Err(ForwardError::NotFound(_))));
        assert!(matches!(manager.status(id), Err(ForwardError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_destroy_never_reuses_id() {
        let manager = InstanceManager::new();
        let first = manager
            .create(ForwardingConfig::tcp("127.0.0.1:0", "127.0.0.1:9"))
            .unwrap();
        manager.destroy(first).await.unwrap();

        let second = manager
            .create(ForwardingConfig::tcp("127.0.0.1:0", "127.0.0.1:9"))
            .unwrap();
        assert_ne!(first, second);
        assert!(matches!(
            manager.start(first).await,
            Err(ForwardError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_shutdown_clears_registry() {
        let manager = InstanceManager::new();
        for _ in 0..3 {
            let id = manager
                .create(ForwardingConfig::tcp("127.0.0.1:0", "127.0.0.1:9"))
                .unwrap();
            manager.start(id).await.unwrap();
        }
        manager
            .create(ForwardingConfig::udp("127.0.0.1:0", "127.0.0.1:9"))
            .unwrap();

        manager.shutdown().await;
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn test_listener_failure_reaches_error_sink() {
        let sink = Arc::new(LastError::new());
        let manager = InstanceManager::new().with_error_sink(Arc::clone(&sink));
        let id = manager
            .create(ForwardingConfig::udp("127.0.0.1:0", "127.0.0.1:9").with_name("dns"))
            .unwrap();
        manager.start(id).await.unwrap();
        assert!(sink.get().is_none());

        manager
            .get(id)
            .unwrap()
            .loop_context()
            .listener_failed(&std::io::Error::from(std::io::ErrorKind::NotFound));

        assert!(!manager.is_running(id).unwrap());
        assert!(sink.get().unwrap().contains("listener for 'dns' failed"));

        manager.shutdown().await;
    }
}
