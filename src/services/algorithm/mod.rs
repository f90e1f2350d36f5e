// Algorithm Registry
//
// Maps algorithm type names (`MOD`, `SNOWFLAKE`, `WEIGHT`, ...) to constructors.
// The rule model builder owns one registry per algorithm family and passes it
// down explicitly; new algorithms are added with `register` without touching the
// routing engine.

pub mod encryptor;
pub mod keygen;
pub mod load_balance;
pub mod sharding;

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use crate::api::middleware::AppError;
pub use crate::models::rule_config::Properties;

pub use encryptor::{Encryptor, Sha256Encryptor};
pub use keygen::{KeyGenerateAlgorithm, SnowflakeKeyGenerator, UuidKeyGenerator};
pub use load_balance::{
    LoadBalanceAlgorithm, RandomLoadBalanceAlgorithm, RoundRobinLoadBalanceAlgorithm,
    WeightLoadBalanceAlgorithm,
};
pub use sharding::ShardingAlgorithm;

/// Builds an algorithm instance from its configured properties
pub type AlgorithmConstructor<T> = fn(&Properties) -> Result<Arc<T>, AppError>;

/// Registry of algorithm constructors keyed by upper-cased type name
pub struct AlgorithmRegistry<T: ?Sized> {
    kind: &'static str,
    constructors: HashMap<String, AlgorithmConstructor<T>>,
}

impl<T: ?Sized> AlgorithmRegistry<T> {
    /// Create an empty registry; `kind` names the family in error messages
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            constructors: HashMap::new(),
        }
    }

    /// Register or replace a constructor
    pub fn register(&mut self, type_name: &str, constructor: AlgorithmConstructor<T>) {
        self.constructors
            .insert(type_name.to_ascii_uppercase(), constructor);
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.constructors
            .contains_key(&type_name.to_ascii_uppercase())
    }

    /// Instantiate an algorithm, failing for unregistered type names
    pub fn create(&self, type_name: &str, props: &Properties) -> Result<Arc<T>, AppError> {
        let constructor = self
            .constructors
            .get(&type_name.to_ascii_uppercase())
            .ok_or_else(|| {
                AppError::Configuration(format!(
                    "Unregistered {} algorithm type `{}`",
                    self.kind, type_name
                ))
            })?;
        constructor(props)
    }

    /// Registered type names, sorted
    pub fn type_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.constructors.keys().cloned().collect();
        names.sort();
        names
    }
}

impl AlgorithmRegistry<dyn ShardingAlgorithm> {
    pub fn sharding_builtins() -> Self {
        let mut registry = Self::new("sharding");
        registry.register("MOD", sharding::ModShardingAlgorithm::create);
        registry.register("HASH_MOD", sharding::HashModShardingAlgorithm::create);
        registry.register("INLINE", sharding::InlineShardingAlgorithm::create);
        registry.register("BOUNDARY_RANGE", sharding::BoundaryRangeShardingAlgorithm::create);
        registry
    }
}

impl AlgorithmRegistry<dyn KeyGenerateAlgorithm> {
    pub fn key_generate_builtins() -> Self {
        let mut registry = Self::new("key generate");
        registry.register("SNOWFLAKE", SnowflakeKeyGenerator::create);
        registry.register("UUID", UuidKeyGenerator::create);
        registry
    }
}

impl AlgorithmRegistry<dyn Encryptor> {
    pub fn encrypt_builtins() -> Self {
        let mut registry = Self::new("encrypt");
        registry.register("SHA256", Sha256Encryptor::create);
        registry
    }
}

impl AlgorithmRegistry<dyn LoadBalanceAlgorithm> {
    pub fn load_balance_builtins() -> Self {
        let mut registry = Self::new("load balance");
        registry.register("WEIGHT", WeightLoadBalanceAlgorithm::create);
        registry.register("ROUND_ROBIN", RoundRobinLoadBalanceAlgorithm::create);
        registry.register("RANDOM", RandomLoadBalanceAlgorithm::create);
        registry
    }
}

/// Required property, trimmed
pub fn required_prop<'a>(
    props: &'a Properties,
    key: &str,
    algorithm: &str,
) -> Result<&'a str, AppError> {
    props
        .get(key)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| {
            AppError::Configuration(format!(
                "{} algorithm requires property `{}`",
                algorithm, key
            ))
        })
}

/// Required property parsed into `T`
pub fn parse_prop<T: FromStr>(props: &Properties, key: &str, algorithm: &str) -> Result<T, AppError> {
    let raw = required_prop(props, key, algorithm)?;
    raw.parse::<T>().map_err(|_| {
        AppError::Configuration(format!(
            "{} algorithm property `{}` has malformed value `{}`",
            algorithm, key, raw
        ))
    })
}

/// Optional boolean property, `false` when absent
pub fn bool_prop(props: &Properties, key: &str, algorithm: &str) -> Result<bool, AppError> {
    match props.get(key) {
        None => Ok(false),
        Some(_) => parse_prop(props, key, algorithm),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(pairs: &[(&str, &str)]) -> Properties {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_registry_is_case_insensitive() {
        let registry = AlgorithmRegistry::<dyn ShardingAlgorithm>::sharding_builtins();
        assert!(registry.contains("mod"));
        let algorithm = registry
            .create("Mod", &props(&[("sharding-count", "4")]))
            .unwrap();
        assert_eq!(algorithm.type_name(), "MOD");
    }

    #[test]
    fn test_unregistered_type() {
        let registry = AlgorithmRegistry::<dyn Encryptor>::encrypt_builtins();
        let result = registry.create("AES", &Properties::new());
        match result {
            Err(AppError::Configuration(message)) => assert!(message.contains("AES")),
            other => panic!("expected configuration error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_custom_registration() {
        let mut registry = AlgorithmRegistry::<dyn KeyGenerateAlgorithm>::new("key generate");
        assert!(registry.type_names().is_empty());
        registry.register("uuid", UuidKeyGenerator::create);
        assert_eq!(registry.type_names(), vec!["UUID".to_string()]);
    }

    #[test]
    fn test_prop_helpers() {
        let props = props(&[("sharding-count", " 4 "), ("flag", "yes")]);
        assert_eq!(parse_prop::<u32>(&props, "sharding-count", "MOD").unwrap(), 4);
        assert!(required_prop(&props, "missing", "MOD").is_err());
        assert!(bool_prop(&props, "flag", "INLINE").is_err());
        assert!(!bool_prop(&props, "absent", "INLINE").unwrap());
    }
}
