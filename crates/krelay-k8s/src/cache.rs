//! `ClientCache` / `ClientHandle` (spec §4.8): one authenticated `kube`
//! client per cluster context, built once and reused by every tunnel that
//! targets that context. Concurrent first callers for the same context
//! collapse into a single client build via `tokio::sync::OnceCell`.

use std::sync::Arc;

use dashmap::DashMap;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::Client;
use thiserror::Error;
use tokio::sync::OnceCell;

#[derive(Debug, Error)]
pub enum ClientInitError {
    #[error("failed to load kubeconfig: {0}")]
    KubeconfigLoad(String),

    #[error("failed to build client for context {context:?}: {source}")]
    ClientBuild {
        context: String,
        source: kube::Error,
    },
}

/// An opaque, reference-counted handle to the `kube::Client` for one
/// context. Cheap to clone; lives as long as the cache or any tunnel that
/// still holds a clone, whichever is longer.
#[derive(Clone)]
pub struct ClientHandle {
    context: Arc<str>,
    client: Client,
}

impl ClientHandle {
    pub fn context(&self) -> &str {
        &self.context
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Builds a handle around an offline client, for tests that need to
    /// seed a `ClientCache` via `inject` without a reachable cluster.
    #[cfg(any(test, feature = "test-util"))]
    pub fn for_test(context: &str) -> Self {
        let uri = "https://127.0.0.1:6443".parse().unwrap();
        let config = kube::Config::new(uri);
        let client = Client::try_from(config).expect("client construction is offline");
        ClientHandle {
            context: Arc::from(context),
            client,
        }
    }
}

struct Slot {
    cell: OnceCell<Result<ClientHandle, Arc<ClientInitError>>>,
}

/// Kubeconfig source shared by every context this cache builds a client
/// for; resolved once at `KubeClusterApi` construction from
/// `http.k8s.kubeconfig`.
#[derive(Clone)]
pub struct KubeconfigSource {
    pub kubeconfig: Option<Kubeconfig>,
}

pub struct ClientCache {
    kubeconfig: KubeconfigSource,
    slots: DashMap<String, Arc<Slot>>,
}

impl ClientCache {
    pub fn new(kubeconfig: KubeconfigSource) -> Self {
        Self {
            kubeconfig,
            slots: DashMap::new(),
        }
    }

    /// Returns the cached client for `context`, building it on first use.
    /// Concurrent callers for the same not-yet-cached context share one
    /// in-flight build.
    pub async fn client_for(&self, context: &str) -> Result<ClientHandle, Arc<ClientInitError>> {
        let slot = self
            .slots
            .entry(context.to_string())
            .or_insert_with(|| {
                Arc::new(Slot {
                    cell: OnceCell::new(),
                })
            })
            .clone();

        slot.cell
            .get_or_init(|| async { self.build(context).await.map_err(Arc::new) })
            .await
            .clone()
    }

    /// For testing only: seeds the cache with an already-built handle so
    /// tests don't need a reachable cluster.
    pub fn inject(&self, context: &str, handle: ClientHandle) {
        let cell = OnceCell::new();
        // `set` only fails if already initialized; a fresh cell never is.
        let _ = cell.set(Ok(handle));
        self.slots
            .insert(context.to_string(), Arc::new(Slot { cell }));
    }

    /// Releases all cached handles (spec §4.5 `shutdown`).
    pub fn clear(&self) {
        self.slots.clear();
    }

    async fn build(&self, context: &str) -> Result<ClientHandle, ClientInitError> {
        let client = match &self.kubeconfig.kubeconfig {
            Some(kubeconfig) => {
                let options = KubeConfigOptions {
                    context: Some(context.to_string()),
                    ..Default::default()
                };
                let config = kube::Config::from_custom_kubeconfig(kubeconfig.clone(), &options)
                    .await
                    .map_err(|e| ClientInitError::KubeconfigLoad(e.to_string()))?;
                Client::try_from(config).map_err(|source| ClientInitError::ClientBuild {
                    context: context.to_string(),
                    source,
                })?
            }
            None => {
                let options = KubeConfigOptions {
                    context: Some(context.to_string()),
                    ..Default::default()
                };
                let config = kube::Config::from_kubeconfig(&options)
                    .await
                    .map_err(|e| ClientInitError::KubeconfigLoad(e.to_string()))?;
                Client::try_from(config).map_err(|source| ClientInitError::ClientBuild {
                    context: context.to_string(),
                    source,
                })?
            }
        };

        Ok(ClientHandle {
            context: Arc::from(context),
            client,
        })
    }
}
