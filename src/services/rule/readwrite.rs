use std::collections::HashMap;
use std::sync::Arc;

use crate::api::middleware::AppError;
use crate::services::algorithm::LoadBalanceAlgorithm;

/// A logical data source backed by one primary and its replicas
#[derive(Debug, Clone)]
pub struct ReadwriteGroup {
    pub name: String,
    pub primary: String,
    pub replicas: Vec<String>,
    pub load_balancer: Arc<dyn LoadBalanceAlgorithm>,
}

impl ReadwriteGroup {
    /// Member for one statement: replicas for reads, primary otherwise
    pub fn route(&self, is_read: bool) -> Result<String, AppError> {
        if !is_read || self.replicas.is_empty() {
            return Ok(self.primary.clone());
        }
        self.load_balancer.select(&self.name, &self.replicas)
    }

    pub fn members(&self) -> impl Iterator<Item = &String> {
        std::iter::once(&self.primary).chain(self.replicas.iter())
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReadwriteSplittingRule {
    groups: HashMap<String, ReadwriteGroup>,
}

impl ReadwriteSplittingRule {
    pub fn new(groups: Vec<ReadwriteGroup>) -> Self {
        Self {
            groups: groups
                .into_iter()
                .map(|group| (group.name.clone(), group))
                .collect(),
        }
    }

    pub fn find_group(&self, name: &str) -> Option<&ReadwriteGroup> {
        self.groups.get(name)
    }

    /// Whether `data_source` is the primary or a replica of some group
    pub fn is_member(&self, data_source: &str) -> bool {
        self.groups
            .values()
            .any(|group| group.members().any(|member| member == data_source))
    }

    /// Group names, sorted
    pub fn group_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.groups.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::algorithm::{Properties, RoundRobinLoadBalanceAlgorithm};

    fn group(replicas: &[&str]) -> ReadwriteGroup {
        ReadwriteGroup {
            name: "ds_rw".to_string(),
            primary: "ds_primary".to_string(),
            replicas: replicas.iter().map(|r| r.to_string()).collect(),
            load_balancer: RoundRobinLoadBalanceAlgorithm::create(&Properties::new()).unwrap(),
        }
    }

    #[test]
    fn test_reads_go_to_replicas() {
        let group = group(&["ds_r0", "ds_r1"]);
        assert_eq!(group.route(true).unwrap(), "ds_r0");
        assert_eq!(group.route(true).unwrap(), "ds_r1");
        assert_eq!(group.route(false).unwrap(), "ds_primary");
    }

    #[test]
    fn test_reads_without_replicas_use_primary() {
        let rule = ReadwriteSplittingRule::new(vec![group(&[])]);
        assert_eq!(rule.find_group("ds_rw").unwrap().route(true).unwrap(), "ds_primary");
        assert!(rule.is_member("ds_primary"));
        assert!(!rule.is_member("ds_rw"));
        assert_eq!(rule.group_names(), vec!["ds_rw"]);
    }
}
