//! Named construction of policies, executors and artifact stores.
//!
//! A [`RegistryBuilder`] collects constructors by name. [`RegistryBuilder::build`]
//! creates the shared context (store, secrets, settings, tracing span) once,
//! and every policy or executor resolved from the resulting [`Registry`]
//! receives that same context. Nothing here is process-global; each caller
//! owns its registry instance.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info_span, instrument};

use crate::core::types::ErrorKind;
use crate::executor::WorkExecutor;
use crate::io::config::{EngineConfig, StoreConfig};
use crate::io::secrets::SecretSource;
use crate::io::store::{ArtifactStore, LocalArtifactStore};
use crate::policy::DecisionPolicy;

pub const LOCAL_STORE_BACKEND: &str = "local";

pub type PolicyConstructor =
    Box<dyn Fn(&Arc<SharedContext>) -> anyhow::Result<Box<dyn DecisionPolicy>> + Send + Sync>;
pub type ExecutorConstructor =
    Box<dyn Fn(&Arc<SharedContext>) -> anyhow::Result<Box<dyn WorkExecutor>> + Send + Sync>;
pub type StoreConstructor =
    Box<dyn Fn(&StoreConfig) -> anyhow::Result<Arc<dyn ArtifactStore>> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Policy,
    Executor,
    Store,
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Category::Policy => f.write_str("policy"),
            Category::Executor => f.write_str("executor"),
            Category::Store => f.write_str("store"),
        }
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("{category} '{name}' is already registered")]
    Duplicate { category: Category, name: String },
    #[error("unknown {category} '{name}' (registered: {})", .known.join(", "))]
    Unknown {
        category: Category,
        name: String,
        known: Vec<String>,
    },
    #[error("failed to construct {category} '{name}'")]
    Construct {
        category: Category,
        name: String,
        #[source]
        source: anyhow::Error,
    },
}

impl RegistryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RegistryError::Duplicate { .. } | RegistryError::Unknown { .. } => {
                ErrorKind::InvalidRequest
            }
            RegistryError::Construct { .. } => ErrorKind::ProviderError,
        }
    }
}

/// Collaborators injected into every constructed policy and executor.
pub struct SharedContext {
    store: Arc<dyn ArtifactStore>,
    secrets: Arc<dyn SecretSource>,
    settings: toml::Table,
    span: tracing::Span,
}

impl SharedContext {
    pub fn store(&self) -> &Arc<dyn ArtifactStore> {
        &self.store
    }

    pub fn secret(&self, name: &str) -> Option<String> {
        self.secrets.secret(name)
    }

    /// Free-form `[settings]` from the engine config.
    pub fn settings(&self) -> &toml::Table {
        &self.settings
    }

    pub fn setting(&self, key: &str) -> Option<&toml::Value> {
        self.settings.get(key)
    }

    /// Parent span for collaborator diagnostics.
    pub fn span(&self) -> &tracing::Span {
        &self.span
    }
}

impl fmt::Debug for SharedContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedContext")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

pub struct RegistryBuilder {
    policies: BTreeMap<String, PolicyConstructor>,
    executors: BTreeMap<String, ExecutorConstructor>,
    stores: BTreeMap<String, StoreConstructor>,
}

impl Default for RegistryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistryBuilder {
    /// Builder with the `"local"` store backend pre-registered.
    pub fn new() -> Self {
        let mut stores: BTreeMap<String, StoreConstructor> = BTreeMap::new();
        stores.insert(
            LOCAL_STORE_BACKEND.to_string(),
            Box::new(|cfg: &StoreConfig| -> anyhow::Result<Arc<dyn ArtifactStore>> {
                let store = LocalArtifactStore::open(&cfg.base_dir)?;
                Ok(Arc::new(store) as Arc<dyn ArtifactStore>)
            }),
        );
        Self {
            policies: BTreeMap::new(),
            executors: BTreeMap::new(),
            stores,
        }
    }

    pub fn register_policy<F>(&mut self, name: &str, constructor: F) -> Result<(), RegistryError>
    where
        F: Fn(&Arc<SharedContext>) -> anyhow::Result<Box<dyn DecisionPolicy>>
            + Send
            + Sync
            + 'static,
    {
        let constructor: PolicyConstructor = Box::new(constructor);
        insert_unique(&mut self.policies, Category::Policy, name, constructor)
    }

    pub fn register_executor<F>(&mut self, name: &str, constructor: F) -> Result<(), RegistryError>
    where
        F: Fn(&Arc<SharedContext>) -> anyhow::Result<Box<dyn WorkExecutor>>
            + Send
            + Sync
            + 'static,
    {
        let constructor: ExecutorConstructor = Box::new(constructor);
        insert_unique(&mut self.executors, Category::Executor, name, constructor)
    }

    pub fn register_store<F>(&mut self, name: &str, constructor: F) -> Result<(), RegistryError>
    where
        F: Fn(&StoreConfig) -> anyhow::Result<Arc<dyn ArtifactStore>> + Send + Sync + 'static,
    {
        let constructor: StoreConstructor = Box::new(constructor);
        insert_unique(&mut self.stores, Category::Store, name, constructor)
    }

    /// Construct the configured store backend and freeze the registrations.
    #[instrument(skip_all, fields(backend = %config.store.backend))]
    pub fn build(
        self,
        config: &EngineConfig,
        secrets: Arc<dyn SecretSource>,
    ) -> Result<Registry, RegistryError> {
        let backend = config.store.backend.as_str();
        let constructor = self
            .stores
            .get(backend)
            .ok_or_else(|| unknown(Category::Store, backend, &self.stores))?;
        let store = constructor(&config.store).map_err(|source| RegistryError::Construct {
            category: Category::Store,
            name: backend.to_string(),
            source,
        })?;
        debug!(base_dir = %config.store.base_dir, "store constructed");
        Ok(self.build_with_store(store, secrets, config.settings.clone()))
    }

    /// Freeze the registrations around an already constructed store.
    pub fn build_with_store(
        self,
        store: Arc<dyn ArtifactStore>,
        secrets: Arc<dyn SecretSource>,
        settings: toml::Table,
    ) -> Registry {
        let context = Arc::new(SharedContext {
            store,
            secrets,
            settings,
            span: info_span!("flowcore"),
        });
        Registry {
            policies: self.policies,
            executors: self.executors,
            context,
        }
    }
}

/// Frozen registrations plus the shared context they are built with.
pub struct Registry {
    policies: BTreeMap<String, PolicyConstructor>,
    executors: BTreeMap<String, ExecutorConstructor>,
    context: Arc<SharedContext>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("policies", &self.policy_names())
            .field("executors", &self.executor_names())
            .finish_non_exhaustive()
    }
}

impl Registry {
    pub fn context(&self) -> &Arc<SharedContext> {
        &self.context
    }

    /// Construct a fresh policy instance registered as `name`.
    #[instrument(skip(self))]
    pub fn policy(&self, name: &str) -> Result<Box<dyn DecisionPolicy>, RegistryError> {
        let constructor = self
            .policies
            .get(name)
            .ok_or_else(|| unknown(Category::Policy, name, &self.policies))?;
        constructor(&self.context).map_err(|source| RegistryError::Construct {
            category: Category::Policy,
            name: name.to_string(),
            source,
        })
    }

    /// Construct a fresh executor instance registered as `name`.
    #[instrument(skip(self))]
    pub fn executor(&self, name: &str) -> Result<Box<dyn WorkExecutor>, RegistryError> {
        let constructor = self
            .executors
            .get(name)
            .ok_or_else(|| unknown(Category::Executor, name, &self.executors))?;
        constructor(&self.context).map_err(|source| RegistryError::Construct {
            category: Category::Executor,
            name: name.to_string(),
            source,
        })
    }

    pub fn policy_names(&self) -> Vec<&str> {
        self.policies.keys().map(String::as_str).collect()
    }

    pub fn executor_names(&self) -> Vec<&str> {
        self.executors.keys().map(String::as_str).collect()
    }
}

fn insert_unique<T>(
    map: &mut BTreeMap<String, T>,
    category: Category,
    name: &str,
    value: T,
) -> Result<(), RegistryError> {
    if map.contains_key(name) {
        return Err(RegistryError::Duplicate {
            category,
            name: name.to_string(),
        });
    }
    map.insert(name.to_string(), value);
    Ok(())
}

fn unknown<T>(category: Category, name: &str, map: &BTreeMap<String, T>) -> RegistryError {
    RegistryError::Unknown {
        category,
        name: name.to_string(),
        known: map.keys().cloned().collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Decision;
    use crate::io::secrets::StaticSecrets;
    use crate::test_support::{MemoryArtifactStore, ScriptedExecutor, ScriptedPolicy};

    fn registry_with(builder: RegistryBuilder) -> Registry {
        builder.build_with_store(
            Arc::new(MemoryArtifactStore::default()),
            Arc::new(StaticSecrets::new().with("token", "abc")),
            toml::Table::new(),
        )
    }

    #[test]
    fn duplicate_names_fail_loudly() {
        let mut builder = RegistryBuilder::new();
        builder
            .register_policy("linear", |_| Ok(Box::new(ScriptedPolicy::new(Vec::new()))))
            .expect("first");

        let err = builder
            .register_policy("linear", |_| Ok(Box::new(ScriptedPolicy::new(Vec::new()))))
            .unwrap_err();
        assert!(matches!(err, RegistryError::Duplicate { category: Category::Policy, .. }));

        let err = builder
            .register_store(LOCAL_STORE_BACKEND, |_| {
                Ok(Arc::new(MemoryArtifactStore::default()) as Arc<dyn ArtifactStore>)
            })
            .unwrap_err();
        assert_eq!(err.to_string(), "store 'local' is already registered");
    }

    #[test]
    fn unknown_name_lists_registered_names() {
        let mut builder = RegistryBuilder::new();
        builder
            .register_executor("echo", |_| Ok(Box::new(ScriptedExecutor::always_ok())))
            .expect("register");
        let registry = registry_with(builder);

        let err = registry.executor("llm").err().expect("unknown executor");
        assert_eq!(
            err.to_string(),
            "unknown executor 'llm' (registered: echo)"
        );
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);
    }

    #[test]
    fn constructors_receive_the_shared_context() {
        let mut builder = RegistryBuilder::new();
        builder
            .register_policy("needs-token", |ctx| {
                let token = ctx
                    .secret("token")
                    .ok_or_else(|| anyhow::anyhow!("token missing"))?;
                assert_eq!(token, "abc");
                Ok(Box::new(ScriptedPolicy::new(vec![Decision::finalize_with(
                    Vec::new(),
                )])))
            })
            .expect("register");
        builder
            .register_policy("broken", |_| Err(anyhow::anyhow!("bad settings")))
            .expect("register");
        let registry = registry_with(builder);

        assert!(registry.policy("needs-token").is_ok());
        let err = registry.policy("broken").err().expect("construct error");
        assert!(matches!(err, RegistryError::Construct { .. }));
        assert_eq!(registry.policy_names(), vec!["broken", "needs-token"]);
    }

    #[test]
    fn unknown_store_backend_fails_build() {
        let config = EngineConfig {
            store: StoreConfig {
                backend: "s3".to_string(),
                ..StoreConfig::default()
            },
            ..EngineConfig::default()
        };
        let err = RegistryBuilder::new()
            .build(&config, Arc::new(StaticSecrets::new()))
            .unwrap_err();
        assert!(matches!(err, RegistryError::Unknown { category: Category::Store, .. }));
    }
}
