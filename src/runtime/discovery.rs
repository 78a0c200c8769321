//! Topology resolution: shared-instance discovery and network inference.
//!
//! Discovery is a heuristic, not a protocol. The order is:
//!
//! 1. An explicit override (`--fresh` / `--shared`) wins.
//! 2. With reuse enabled, a running instance whose name equals
//!    `instance_name` is selected, else one carrying the `label` selector.
//! 3. Otherwise a fresh instance is created. Its network is the explicit
//!    `network` setting when present; else, with `infer_network` on, the
//!    first non-default network of a sibling instance (found by
//!    `sibling_name`, `sibling_label`, then the shared-instance criteria).
//!
//! The inferred network is memoised on the [`DiscoveryContext`] so repeated
//! sessions do not re-inspect the sibling; [`DiscoveryContext::reset`] clears it.

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::ReuseConfig;
use crate::runtime::{parse_label, InstanceDescriptor, InstanceHandle, InstanceMetadata, RuntimeClient};
use crate::{AppError, Result};

/// Networks every runtime provides; never selected by inference.
const DEFAULT_NETWORKS: &[&str] = &["bridge", "host", "none", "default", "podman"];

/// Caller-requested topology, bypassing discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopologyOverride {
    /// Always create a fresh instance.
    Fresh,
    /// Always exec into the shared instance; fail when none is running.
    Shared,
}

/// Outcome of topology resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedTopology {
    /// Create a fresh instance, optionally joining `network`.
    Fresh {
        /// Network for the new instance.
        network: Option<String>,
    },
    /// Exec into a running shared instance.
    Shared {
        /// The discovered instance.
        instance: InstanceHandle,
    },
}

/// Discovery state owned by one session manager.
#[derive(Debug)]
pub struct DiscoveryContext {
    policy: ReuseConfig,
    network_cache: Mutex<Option<Option<String>>>,
}

impl DiscoveryContext {
    /// Context applying `policy`.
    #[must_use]
    pub fn new(policy: ReuseConfig) -> Self {
        Self {
            policy,
            network_cache: Mutex::new(None),
        }
    }

    /// The policy in effect.
    #[must_use]
    pub fn policy(&self) -> &ReuseConfig {
        &self.policy
    }

    /// Resolve the topology for a new session.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::RuntimeUnavailable`] when the runtime cannot list
    /// instances while discovery needs them, or when `Shared` is forced and no
    /// shared instance is running.
    pub async fn resolve(
        &self,
        runtime: &dyn RuntimeClient,
        forced: Option<TopologyOverride>,
    ) -> Result<ResolvedTopology> {
        match forced {
            Some(TopologyOverride::Shared) => {
                let instances = runtime.list().await?;
                let found = select_shared(&instances, &self.policy).ok_or_else(|| {
                    AppError::RuntimeUnavailable("no running shared instance found".into())
                })?;
                info!(instance = %found.name, "shared topology forced");
                Ok(ResolvedTopology::Shared {
                    instance: found.handle(),
                })
            }
            Some(TopologyOverride::Fresh) => Ok(ResolvedTopology::Fresh {
                network: self.fresh_network(runtime, None).await,
            }),
            None if self.policy.enabled => {
                let instances = runtime.list().await?;
                if let Some(found) = select_shared(&instances, &self.policy) {
                    info!(instance = %found.name, "reusing running shared instance");
                    return Ok(ResolvedTopology::Shared {
                        instance: found.handle(),
                    });
                }
                debug!("no shared instance running, falling back to a fresh instance");
                Ok(ResolvedTopology::Fresh {
                    network: self.fresh_network(runtime, Some(&instances)).await,
                })
            }
            None => Ok(ResolvedTopology::Fresh {
                network: self.fresh_network(runtime, None).await,
            }),
        }
    }

    /// Forget the memoised network so the next resolution re-infers it.
    pub async fn reset(&self) {
        *self.network_cache.lock().await = None;
    }

    /// Network for a fresh instance: explicit override, else memoised or
    /// freshly inferred. Inference failures are logged and yield `None`.
    async fn fresh_network(
        &self,
        runtime: &dyn RuntimeClient,
        listed: Option<&[InstanceDescriptor]>,
    ) -> Option<String> {
        if let Some(network) = &self.policy.network {
            return Some(network.clone());
        }
        if !self.policy.infer_network {
            return None;
        }

        let mut cache = self.network_cache.lock().await;
        if let Some(cached) = cache.as_ref() {
            return cached.clone();
        }

        let owned;
        let instances = if let Some(listed) = listed {
            listed
        } else {
            match runtime.list().await {
                Ok(list) => {
                    owned = list;
                    &owned
                }
                Err(err) => {
                    warn!(%err, "network inference skipped: cannot list instances");
                    return None;
                }
            }
        };

        let inferred = match select_sibling(instances, &self.policy) {
            Some(sibling) => match runtime.inspect(&sibling.handle()).await {
                Ok(meta) => {
                    let network = pick_network(&meta);
                    info!(sibling = %sibling.name, network = ?network, "inferred network from sibling");
                    network
                }
                Err(err) => {
                    warn!(%err, sibling = %sibling.name, "network inference failed");
                    return None;
                }
            },
            None => None,
        };
        *cache = Some(inferred.clone());
        inferred
    }
}

/// Pick the shared instance: exact name match first, then label match.
#[must_use]
pub fn select_shared<'a>(
    instances: &'a [InstanceDescriptor],
    policy: &ReuseConfig,
) -> Option<&'a InstanceDescriptor> {
    find_instance(instances, policy.instance_name.as_deref(), policy.label.as_deref())
}

/// Pick the sibling used for network inference.
#[must_use]
pub fn select_sibling<'a>(
    instances: &'a [InstanceDescriptor],
    policy: &ReuseConfig,
) -> Option<&'a InstanceDescriptor> {
    find_instance(
        instances,
        policy.sibling_name.as_deref(),
        policy.sibling_label.as_deref(),
    )
    .or_else(|| select_shared(instances, policy))
}

/// First non-default network of an instance.
#[must_use]
pub fn pick_network(meta: &InstanceMetadata) -> Option<String> {
    meta.networks
        .iter()
        .find(|net| !DEFAULT_NETWORKS.contains(&net.as_str()))
        .cloned()
}

fn find_instance<'a>(
    instances: &'a [InstanceDescriptor],
    name: Option<&str>,
    label: Option<&str>,
) -> Option<&'a InstanceDescriptor> {
    let running = || instances.iter().filter(|i| i.running);
    if let Some(name) = name {
        if let Some(found) = running().find(|i| i.name == name) {
            return Some(found);
        }
    }
    let (key, value) = label.and_then(parse_label)?;
    running().find(|i| i.has_label(key, value))
}
