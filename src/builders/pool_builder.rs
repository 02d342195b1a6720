//! Builders to construct process pools from configuration.

use std::collections::HashMap;

use tracing::warn;

use crate::config::{PoolsConfig, ProcessConfig};
use crate::core::{Pool, PoolError};

/// Start every pool named in `cfg`.
///
/// Pools whose `process.name_prefix` is left at the default are prefixed with
/// their own name so their workers can be told apart in logs. Pools start in
/// name order; if one fails, the ones already started are terminated.
///
/// # Errors
///
/// `InvalidConfig` if `cfg` does not validate, otherwise the first pool's
/// start error.
pub async fn build_pools(cfg: &PoolsConfig) -> Result<HashMap<String, Pool>, PoolError> {
    cfg.validate()
        .map_err(|e| PoolError::InvalidConfig(format!("config invalid: {e}")))?;

    let default_prefix = ProcessConfig::default().name_prefix;
    let mut names: Vec<&String> = cfg.pools.keys().collect();
    names.sort();

    let mut pools = HashMap::new();
    for name in names {
        let mut pool_cfg = cfg.pools[name].clone();
        if pool_cfg.process.name_prefix == default_prefix {
            pool_cfg.process.name_prefix.clone_from(name);
        }
        match Pool::start(pool_cfg).await {
            Ok(pool) => {
                pools.insert(name.clone(), pool);
            }
            Err(e) => {
                warn!(pool = %name, error = %e, "Pool failed to start, tearing down the others");
                for pool in pools.values() {
                    pool.terminate().await;
                }
                return Err(e);
            }
        }
    }

    Ok(pools)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;

    #[tokio::test]
    async fn test_build_pools_rejects_invalid_config() {
        let mut cfg = PoolsConfig::default();
        cfg.pools
            .insert("cpu".into(), PoolConfig::new().with_processes(0));
        let err = build_pools(&cfg).await.unwrap_err();
        assert!(matches!(err, PoolError::InvalidConfig(msg) if msg.contains("cpu")));
    }

    #[tokio::test]
    async fn test_build_pools_reports_spawn_failure() {
        let mut cfg = PoolsConfig::default();
        cfg.pools.insert(
            "cpu".into(),
            PoolConfig::new()
                .with_processes(1)
                .with_program("/nonexistent/worker-binary"),
        );
        let err = build_pools(&cfg).await.unwrap_err();
        assert!(matches!(err, PoolError::ProcessStart(_)));
    }

    #[tokio::test]
    async fn test_build_pools_requires_a_pool() {
        let err = build_pools(&PoolsConfig::default()).await.unwrap_err();
        assert!(matches!(err, PoolError::InvalidConfig(_)));
    }
}
