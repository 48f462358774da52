//! Name-keyed registries
//!
//! Call sites that use the same resource name share one instance. A
//! [`ResilienceRegistry`] builds its managers from the shared breaker and
//! failover registries, so a name always maps to the same breaker whether
//! it is reached directly or through a manager.

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::{debug, info};

use crate::Result;
use crate::config::{CircuitBreakerConfig, Config, FailoverConfig, ResilienceConfig};
use crate::failsafe::{
    CircuitBreaker, CircuitBreakerMetrics, FailoverManager, FailoverMetrics, HealthProbe,
    HealthReport, NoopProbe, ResilienceManager, ResilienceMetrics,
};

fn sorted_names<V>(map: &DashMap<String, V>) -> Vec<String> {
    let mut names: Vec<String> = map.iter().map(|e| e.key().clone()).collect();
    names.sort();
    names
}

/// Circuit breakers by dependency name
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the breaker for `name`, creating it with `config` on first use.
    /// An existing breaker keeps its original configuration.
    pub fn get_or_create(
        &self,
        name: &str,
        config: CircuitBreakerConfig,
    ) -> Result<Arc<CircuitBreaker>> {
        config.validate()?;
        match self.breakers.entry(name.to_string()) {
            Entry::Occupied(entry) => {
                debug!(breaker = name, "Reusing registered circuit breaker");
                Ok(Arc::clone(entry.get()))
            }
            Entry::Vacant(entry) => {
                let breaker = Arc::new(CircuitBreaker::new(name, config));
                entry.insert(Arc::clone(&breaker));
                info!(breaker = name, "Registered circuit breaker");
                Ok(breaker)
            }
        }
    }

    /// Get a breaker by name
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(name).map(|b| Arc::clone(&*b))
    }

    /// Unregister a breaker. Holders of the `Arc` keep a working instance.
    pub fn remove(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.remove(name).map(|(_, breaker)| breaker)
    }

    /// Registered names, sorted
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        sorted_names(&self.breakers)
    }

    /// Metrics for every breaker
    #[must_use]
    pub fn all_metrics(&self) -> BTreeMap<String, CircuitBreakerMetrics> {
        self.breakers
            .iter()
            .map(|b| (b.key().clone(), b.metrics()))
            .collect()
    }

    /// Reset every breaker
    pub fn reset_all(&self) {
        for breaker in &self.breakers {
            breaker.reset();
        }
    }
}

/// Failover managers by dependency name
pub struct FailoverRegistry {
    managers: DashMap<String, Arc<FailoverManager>>,
    probes: DashMap<String, Arc<dyn HealthProbe>>,
    default_probe: Arc<dyn HealthProbe>,
}

impl FailoverRegistry {
    /// Create an empty registry whose managers are probed with [`NoopProbe`]
    /// unless a probe is registered for their name
    #[must_use]
    pub fn new() -> Self {
        Self::with_default_probe(Arc::new(NoopProbe))
    }

    /// Create an empty registry with a registry-wide default probe
    #[must_use]
    pub fn with_default_probe(probe: Arc<dyn HealthProbe>) -> Self {
        Self {
            managers: DashMap::new(),
            probes: DashMap::new(),
            default_probe: probe,
        }
    }

    /// Probe used for managers created under `name` from now on
    pub fn register_probe(&self, name: &str, probe: Arc<dyn HealthProbe>) {
        self.probes.insert(name.to_string(), probe);
    }

    /// Get the manager for `name`, creating it with `config` on first use.
    ///
    /// A newly created manager starts its health-check task when called
    /// inside a tokio runtime.
    pub fn get_or_create(&self, name: &str, config: FailoverConfig) -> Result<Arc<FailoverManager>> {
        config.validate()?;
        match self.managers.entry(name.to_string()) {
            Entry::Occupied(entry) => {
                debug!(failover = name, "Reusing registered failover manager");
                Ok(Arc::clone(entry.get()))
            }
            Entry::Vacant(entry) => {
                let probe = self
                    .probes
                    .get(name)
                    .map_or_else(|| Arc::clone(&self.default_probe), |p| Arc::clone(&*p));
                let manager = Arc::new(FailoverManager::new(name, config, probe));
                if tokio::runtime::Handle::try_current().is_ok() {
                    manager.start_health_checks();
                } else {
                    debug!(failover = name, "No runtime, health checks not started");
                }
                entry.insert(Arc::clone(&manager));
                info!(failover = name, "Registered failover manager");
                Ok(manager)
            }
        }
    }

    /// Get a manager by name
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<FailoverManager>> {
        self.managers.get(name).map(|m| Arc::clone(&*m))
    }

    /// Unregister and destroy a manager
    pub fn remove(&self, name: &str) -> Option<Arc<FailoverManager>> {
        let (_, manager) = self.managers.remove(name)?;
        manager.destroy();
        Some(manager)
    }

    /// Registered names, sorted
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        sorted_names(&self.managers)
    }

    /// Metrics for every manager
    #[must_use]
    pub fn all_metrics(&self) -> BTreeMap<String, FailoverMetrics> {
        self.managers
            .iter()
            .map(|m| (m.key().clone(), m.metrics()))
            .collect()
    }

    /// Whether each manager has an available provider
    #[must_use]
    pub fn all_health(&self) -> BTreeMap<String, bool> {
        self.managers
            .iter()
            .map(|m| (m.key().clone(), m.is_healthy()))
            .collect()
    }

    /// Reset every manager
    pub fn reset_all(&self) {
        for manager in &self.managers {
            manager.reset();
        }
    }
}

impl Default for FailoverRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for FailoverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FailoverRegistry")
            .field("managers", &self.names())
            .finish_non_exhaustive()
    }
}

/// Resilience managers by resource name
#[derive(Debug)]
pub struct ResilienceRegistry {
    breakers: Arc<CircuitBreakerRegistry>,
    failovers: Arc<FailoverRegistry>,
    managers: DashMap<String, Arc<ResilienceManager>>,
}

impl ResilienceRegistry {
    /// Create a registry with its own breaker and failover registries
    #[must_use]
    pub fn new() -> Self {
        Self::with_registries(
            Arc::new(CircuitBreakerRegistry::new()),
            Arc::new(FailoverRegistry::new()),
        )
    }

    /// Create a registry that builds on shared sub-registries
    #[must_use]
    pub fn with_registries(
        breakers: Arc<CircuitBreakerRegistry>,
        failovers: Arc<FailoverRegistry>,
    ) -> Self {
        Self {
            breakers,
            failovers,
            managers: DashMap::new(),
        }
    }

    /// Shared breaker registry
    #[must_use]
    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    /// Shared failover registry
    #[must_use]
    pub fn failovers(&self) -> &Arc<FailoverRegistry> {
        &self.failovers
    }

    /// Get the manager for `name`, creating it with `config` on first use
    pub fn get_or_create(&self, name: &str, config: ResilienceConfig) -> Result<Arc<ResilienceManager>> {
        config.validate()?;
        match self.managers.entry(name.to_string()) {
            Entry::Occupied(entry) => {
                debug!(resource = name, "Reusing registered resilience manager");
                Ok(Arc::clone(entry.get()))
            }
            Entry::Vacant(entry) => {
                let breaker = self
                    .breakers
                    .get_or_create(name, config.circuit_breaker.clone().unwrap_or_default())?;
                let failover = config
                    .failover
                    .clone()
                    .map(|failover| self.failovers.get_or_create(name, failover))
                    .transpose()?;
                let manager = Arc::new(ResilienceManager::with_components(
                    name, config, breaker, failover,
                ));
                entry.insert(Arc::clone(&manager));
                info!(resource = name, "Registered resilience manager");
                Ok(manager)
            }
        }
    }

    /// Create a manager for every resource in `config`
    pub fn register_all(&self, config: &Config) -> Result<()> {
        let mut names: Vec<&String> = config.resources.keys().collect();
        names.sort();
        for name in names {
            self.get_or_create(name, config.resources[name].clone())?;
        }
        Ok(())
    }

    /// Get a manager by name
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<ResilienceManager>> {
        self.managers.get(name).map(|m| Arc::clone(&*m))
    }

    /// Unregister a manager. Its breaker and failover manager stay in the
    /// shared registries.
    pub fn remove(&self, name: &str) -> Option<Arc<ResilienceManager>> {
        self.managers.remove(name).map(|(_, manager)| manager)
    }

    /// Registered names, sorted
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        sorted_names(&self.managers)
    }

    /// Metrics for every manager
    #[must_use]
    pub fn all_metrics(&self) -> BTreeMap<String, ResilienceMetrics> {
        self.managers
            .iter()
            .map(|m| (m.key().clone(), m.metrics()))
            .collect()
    }

    /// Health report for every manager
    #[must_use]
    pub fn all_health(&self) -> BTreeMap<String, HealthReport> {
        self.managers
            .iter()
            .map(|m| (m.key().clone(), m.health()))
            .collect()
    }

    /// Reset every manager
    pub fn reset_all(&self) {
        for manager in &self.managers {
            manager.reset();
        }
    }
}

impl Default for ResilienceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use crate::config::presets;
    use crate::failsafe::CircuitState;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_breaker_shared_by_name() {
        let registry = CircuitBreakerRegistry::new();
        let a = registry
            .get_or_create("db", CircuitBreakerConfig::default())
            .unwrap();
        let b = registry
            .get_or_create(
                "db",
                CircuitBreakerConfig {
                    failure_threshold: 1,
                    ..CircuitBreakerConfig::default()
                },
            )
            .unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(b.config().failure_threshold, 5);
        assert_eq!(registry.names(), vec!["db".to_string()]);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let registry = CircuitBreakerRegistry::new();
        let err = registry
            .get_or_create(
                "db",
                CircuitBreakerConfig {
                    failure_threshold: 0,
                    ..CircuitBreakerConfig::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(registry.get("db").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_destroys_failover() {
        let registry = FailoverRegistry::new();
        let manager = registry
            .get_or_create("payments", FailoverConfig::default())
            .unwrap();

        let removed = registry.remove("payments").unwrap();
        assert!(Arc::ptr_eq(&manager, &removed));
        assert!(manager.is_destroyed());
        assert!(registry.get("payments").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_manager_uses_shared_breaker() {
        let registry = ResilienceRegistry::new();
        let manager = registry.get_or_create("db", presets::database()).unwrap();
        let breaker = registry.breakers().get("db").unwrap();

        breaker.force_open();
        assert_eq!(manager.circuit_breaker().state(), CircuitState::Open);
        assert!(!registry.all_health()["db"].healthy);

        registry.reset_all();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }
}
