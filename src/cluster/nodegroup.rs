/// Managed worker pool sizing
use anyhow::Result;
use std::collections::BTreeMap;

use crate::config::NodeGroupConfig;

/// Exactly the policies a worker node role carries
pub const WORKER_NODE_POLICIES: [&str; 3] = [
    "AmazonEKSWorkerNodePolicy",
    "AmazonEKS_CNI_Policy",
    "AmazonEC2ContainerRegistryReadOnly",
];

/// A scalable set of worker machines
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerPoolSpec {
    pub name: String,
    pub instance_types: Vec<String>,
    min_size: u32,
    max_size: u32,
    desired_size: u32,
    pub disk_size: u32,
    pub ami_type: String,
    pub capacity_type: String,
    pub labels: BTreeMap<String, String>,
}

/// Environment-dependent defaults
struct PoolDefaults {
    instance_type: &'static str,
    min_size: u32,
    desired_size: u32,
    max_size: u32,
}

const DEV_DEFAULTS: PoolDefaults = PoolDefaults {
    instance_type: "t3.large",
    min_size: 2,
    desired_size: 2,
    max_size: 5,
};

const PROD_DEFAULTS: PoolDefaults = PoolDefaults {
    instance_type: "m5.xlarge",
    min_size: 4,
    desired_size: 4,
    max_size: 10,
};

impl WorkerPoolSpec {
    /// Create a pool; rejects sizes outside `min <= desired <= max`
    pub fn new(
        name: impl Into<String>,
        instance_types: Vec<String>,
        min_size: u32,
        desired_size: u32,
        max_size: u32,
    ) -> Result<Self> {
        let name = name.into();
        if instance_types.is_empty() {
            anyhow::bail!("Worker pool {} needs at least one instance type", name);
        }
        if max_size == 0 {
            anyhow::bail!("Worker pool {} needs max_size >= 1", name);
        }
        if !(min_size <= desired_size && desired_size <= max_size) {
            anyhow::bail!(
                "Worker pool {} has invalid sizing: min {} / desired {} / max {} (need min <= desired <= max)",
                name,
                min_size,
                desired_size,
                max_size
            );
        }

        Ok(Self {
            name,
            instance_types,
            min_size,
            max_size,
            desired_size,
            disk_size: 20,
            ami_type: "AL2023_x86_64_STANDARD".to_string(),
            capacity_type: "ON_DEMAND".to_string(),
            labels: [("node-type".to_string(), "managed".to_string())]
                .into_iter()
                .collect(),
        })
    }

    /// Build the pool for an environment; prod doubles the bounds and uses larger machines
    pub fn for_environment(
        name: impl Into<String>,
        is_prod: bool,
        overrides: &NodeGroupConfig,
    ) -> Result<Self> {
        let defaults = if is_prod { &PROD_DEFAULTS } else { &DEV_DEFAULTS };

        let instance_types = if overrides.instance_types.is_empty() {
            vec![defaults.instance_type.to_string()]
        } else {
            overrides.instance_types.clone()
        };

        let mut pool = Self::new(
            name,
            instance_types,
            overrides.min_size.unwrap_or(defaults.min_size),
            overrides.desired_size.unwrap_or(defaults.desired_size),
            overrides.max_size.unwrap_or(defaults.max_size),
        )?;

        if overrides.disk_size < 20 {
            anyhow::bail!("Worker disk size must be at least 20 GiB, got {}", overrides.disk_size);
        }
        pool.disk_size = overrides.disk_size;
        pool.labels.extend(overrides.labels.clone());
        Ok(pool)
    }

    pub fn min_size(&self) -> u32 {
        self.min_size
    }

    pub fn desired_size(&self) -> u32 {
        self.desired_size
    }

    pub fn max_size(&self) -> u32 {
        self.max_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sizing_invariant() {
        assert!(WorkerPoolSpec::new("p", vec!["t3.large".into()], 1, 2, 3).is_ok());
        assert!(WorkerPoolSpec::new("p", vec!["t3.large".into()], 2, 2, 2).is_ok());
        assert!(WorkerPoolSpec::new("p", vec!["t3.large".into()], 3, 2, 5).is_err());
        assert!(WorkerPoolSpec::new("p", vec!["t3.large".into()], 1, 6, 5).is_err());
        assert!(WorkerPoolSpec::new("p", vec!["t3.large".into()], 0, 0, 0).is_err());
        assert!(WorkerPoolSpec::new("p", vec![], 1, 1, 1).is_err());
    }

    #[test]
    fn test_environment_defaults() {
        let dev = WorkerPoolSpec::for_environment("p", false, &NodeGroupConfig::default()).unwrap();
        let prod = WorkerPoolSpec::for_environment("p", true, &NodeGroupConfig::default()).unwrap();

        assert_eq!(prod.min_size(), dev.min_size() * 2);
        assert_eq!(prod.max_size(), dev.max_size() * 2);
        assert_eq!(dev.instance_types, vec!["t3.large"]);
        assert_eq!(prod.instance_types, vec!["m5.xlarge"]);
        for pool in [&dev, &prod] {
            assert!(pool.min_size() <= pool.desired_size() && pool.desired_size() <= pool.max_size());
        }
    }

    #[test]
    fn test_overrides_are_validated() {
        let overrides = NodeGroupConfig {
            desired_size: Some(12),
            ..NodeGroupConfig::default()
        };
        assert!(WorkerPoolSpec::for_environment("p", true, &overrides).is_err());

        let overrides = NodeGroupConfig {
            desired_size: Some(8),
            labels: [("team".to_string(), "platform".to_string())].into_iter().collect(),
            ..NodeGroupConfig::default()
        };
        let pool = WorkerPoolSpec::for_environment("p", true, &overrides).unwrap();
        assert_eq!(pool.desired_size(), 8);
        assert_eq!(pool.labels.get("team").map(String::as_str), Some("platform"));
        assert_eq!(pool.labels.get("node-type").map(String::as_str), Some("managed"));
    }
}
