//! Boundary operations exposed to an embedding environment.
//!
//! [`Broker`] owns the named instances and the default registry that
//! module-level queries route through. Construction and start/close failures
//! are returned as errors; query outcomes always come back as a [`Reply`].

use crate::client::{Connector, SocketConnector};
use crate::config::RawInstanceConfig;
use crate::error::{BrokerError, Result};
use crate::reply::Reply;
use crate::supervisor::{lock, DefaultRegistry, Instance};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

pub struct Broker {
    registry: Arc<DefaultRegistry>,
    instances: Mutex<HashMap<String, Arc<Instance>>>,
    connector: Arc<dyn Connector>,
}

impl Broker {
    pub fn new() -> Self {
        Self::with_connector(Arc::new(SocketConnector))
    }

    pub fn with_connector(connector: Arc<dyn Connector>) -> Self {
        Self {
            registry: Arc::new(DefaultRegistry::new()),
            instances: Mutex::new(HashMap::new()),
            connector,
        }
    }

    pub fn registry(&self) -> &Arc<DefaultRegistry> {
        &self.registry
    }

    /// Validates `raw` and returns the instance for its name.
    ///
    /// An open instance with the same name gets the new configuration in
    /// place; no second process is created.
    pub fn construct(&self, raw: RawInstanceConfig) -> Result<Arc<Instance>> {
        let config = raw.validate()?;
        let mut instances = lock(&self.instances);

        if let Some(existing) = instances.get(&config.name) {
            if !existing.is_closed() {
                info!(instance = %config.name, "Replacing instance configuration");
                existing.replace_config(config);
                return Ok(Arc::clone(existing));
            }
        }

        let name = config.name.clone();
        let instance = Arc::new(
            Instance::new(config, Arc::clone(&self.registry))
                .with_connector(Arc::clone(&self.connector)),
        );
        instances.insert(name.clone(), Arc::clone(&instance));
        info!(instance = %name, "Instance constructed");
        Ok(instance)
    }

    pub fn instance(&self, name: &str) -> Option<Arc<Instance>> {
        lock(&self.instances).get(name).cloned()
    }

    /// Like [`Broker::instance`], failing with `UnknownInstance`.
    pub fn require(&self, name: &str) -> Result<Arc<Instance>> {
        self.instance(name)
            .ok_or_else(|| BrokerError::UnknownInstance(name.to_string()))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = lock(&self.instances).keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn start(&self, instance: &Instance) -> Result<()> {
        instance.start().await
    }

    pub async fn query(&self, instance: &Instance, sql: &str) -> Reply {
        instance.query(sql).await
    }

    /// Module-level query against the default instance.
    pub async fn query_default(&self, sql: &str) -> Reply {
        self.registry.query_default(sql).await
    }

    pub fn mark_default(&self, instance: &Arc<Instance>) -> bool {
        instance.mark_default()
    }

    pub async fn close(&self, instance: &Arc<Instance>) -> Result<()> {
        instance.close().await?;

        let mut instances = lock(&self.instances);
        let name = instance.name();
        if instances
            .get(&name)
            .is_some_and(|current| Arc::ptr_eq(current, instance))
        {
            instances.remove(&name);
        }
        Ok(())
    }

    pub async fn close_all(&self) {
        let instances: Vec<Arc<Instance>> = lock(&self.instances).drain().map(|(_, i)| i).collect();
        for instance in instances {
            if let Err(e) = instance.close().await {
                warn!(instance = %instance.name(), "Failed to close instance: {}", e);
            }
        }
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}
