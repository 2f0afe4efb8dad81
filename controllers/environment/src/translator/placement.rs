//! Node pool placement

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Toleration;

use super::SpecInvalid;
use super::quantity::parse_quantity;
use crate::config::PlacementConfig;

const ARCH_LABEL: &str = "kubernetes.io/arch";

/// Node selector and toleration for one workload
#[derive(Debug, Clone, PartialEq)]
pub struct Placement {
    pub pool: String,
    pub node_selector: BTreeMap<String, String>,
    pub tolerations: Vec<Toleration>,
}

/// Pick a node pool from the memory limit and the GPU request
///
/// The highest memory tier whose threshold is at or below `memory_limit`
/// wins; below every tier GPU requests go to the GPU pool; anything else
/// lands in the default pool.
pub fn place(config: &PlacementConfig, wants_gpu: bool, memory_limit: u128) -> Result<Placement, SpecInvalid> {
    let mut tier: Option<(u128, &str)> = None;
    for candidate in &config.memory_tiers {
        let threshold = parse_quantity(&candidate.min_memory)
            .map_err(|e| SpecInvalid(format!("memory tier {}: {}", candidate.pool, e)))?;
        if threshold <= memory_limit && tier.is_none_or(|(best, _)| threshold > best) {
            tier = Some((threshold, candidate.pool.as_str()));
        }
    }

    let pool = match tier {
        Some((_, pool)) => pool.to_string(),
        None if wants_gpu => config
            .gpu_pool
            .clone()
            .ok_or_else(|| SpecInvalid("GPU requested but no GPU node pool is configured".to_string()))?,
        None => config.default_pool.clone(),
    };

    let node_selector = BTreeMap::from([
        (ARCH_LABEL.to_string(), "amd64".to_string()),
        (config.selector_key.clone(), pool.clone()),
    ]);
    let tolerations = vec![Toleration {
        key: Some(config.selector_key.clone()),
        operator: Some("Equal".to_string()),
        value: Some(pool.clone()),
        effect: Some("NoSchedule".to_string()),
        ..Default::default()
    }];

    Ok(Placement {
        pool,
        node_selector,
        tolerations,
    })
}
