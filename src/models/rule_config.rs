// Rule configuration
//
// Serde shape of the rule file. It is compiled into the immutable rule model by
// `RuleModelBuilder`; nothing here is consulted while routing.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::api::middleware::AppError;

pub type Properties = BTreeMap<String, String>;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleConfiguration {
    #[serde(default)]
    pub data_sources: BTreeMap<String, DataSourceConfig>,
    #[serde(default)]
    pub sharding: ShardingRuleConfig,
    #[serde(default)]
    pub encrypt: EncryptRuleConfig,
    #[serde(default)]
    pub readwrite_splitting: ReadwriteSplittingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSourceConfig {
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlgorithmConfig {
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default)]
    pub props: Properties,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardingStrategyConfig {
    pub sharding_columns: Vec<String>,
    pub algorithm: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyGenerateStrategyConfig {
    pub column: String,
    pub key_generator: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TableRuleConfig {
    /// Inline expression such as `ds_${0..1}.t_order_${0..1}`; defaults to one node per data source
    #[serde(default)]
    pub actual_data_nodes: Option<String>,
    #[serde(default)]
    pub database_strategy: Option<ShardingStrategyConfig>,
    #[serde(default)]
    pub table_strategy: Option<ShardingStrategyConfig>,
    #[serde(default)]
    pub key_generate_strategy: Option<KeyGenerateStrategyConfig>,
    #[serde(default)]
    pub indexes: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShardingRuleConfig {
    #[serde(default)]
    pub tables: BTreeMap<String, TableRuleConfig>,
    /// Each entry is a comma separated group, e.g. `"t_order, t_order_item"`
    #[serde(default)]
    pub binding_tables: Vec<String>,
    #[serde(default)]
    pub broadcast_tables: Vec<String>,
    #[serde(default)]
    pub default_data_source: Option<String>,
    #[serde(default)]
    pub default_database_strategy: Option<ShardingStrategyConfig>,
    #[serde(default)]
    pub default_table_strategy: Option<ShardingStrategyConfig>,
    #[serde(default)]
    pub sharding_algorithms: BTreeMap<String, AlgorithmConfig>,
    #[serde(default)]
    pub key_generators: BTreeMap<String, AlgorithmConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptColumnConfig {
    pub cipher_column: String,
    #[serde(default)]
    pub assisted_query_column: Option<String>,
    #[serde(default)]
    pub plain_column: Option<String>,
    pub encryptor: String,
    #[serde(default)]
    pub assisted_query_encryptor: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EncryptTableConfig {
    #[serde(default)]
    pub columns: BTreeMap<String, EncryptColumnConfig>,
    /// Overrides the rule-wide flag for this table
    #[serde(default)]
    pub query_with_cipher_column: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptRuleConfig {
    #[serde(default = "default_true")]
    pub query_with_cipher_column: bool,
    #[serde(default)]
    pub encryptors: BTreeMap<String, AlgorithmConfig>,
    #[serde(default)]
    pub tables: BTreeMap<String, EncryptTableConfig>,
}

impl Default for EncryptRuleConfig {
    fn default() -> Self {
        Self {
            query_with_cipher_column: true,
            encryptors: BTreeMap::new(),
            tables: BTreeMap::new(),
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadwriteGroupConfig {
    pub primary: String,
    #[serde(default)]
    pub replicas: Vec<String>,
    #[serde(default)]
    pub load_balancer: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReadwriteSplittingConfig {
    #[serde(default)]
    pub load_balancers: BTreeMap<String, AlgorithmConfig>,
    #[serde(default)]
    pub groups: BTreeMap<String, ReadwriteGroupConfig>,
}

impl RuleConfiguration {
    /// Load a rule file; the format follows the extension (yaml, toml or json)
    pub fn load(path: impl AsRef<Path>) -> Result<Self, AppError> {
        let path = path.as_ref();
        tracing::info!("Loading rule configuration from {}", path.display());
        let settings = config::Config::builder()
            .add_source(config::File::from(path))
            .build()?;
        Ok(settings.try_deserialize()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const RULES: &str = r#"
data_sources:
  ds_0:
    url: "mysql://127.0.0.1:3306/demo_ds_0"
  ds_1:
    url: "mysql://127.0.0.1:3306/demo_ds_1"
sharding:
  tables:
    t_order:
      actual_data_nodes: "ds_${0..1}.t_order_${0..1}"
      database_strategy:
        sharding_columns: [user_id]
        algorithm: db_mod
      key_generate_strategy:
        column: order_id
        key_generator: snowflake
  binding_tables:
    - "t_order, t_order_item"
  broadcast_tables: [t_config]
  sharding_algorithms:
    db_mod:
      type: MOD
      props:
        sharding-count: "2"
  key_generators:
    snowflake:
      type: SNOWFLAKE
"#;

    #[test]
    fn test_load_yaml_rules() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        file.write_all(RULES.as_bytes()).unwrap();

        let config = RuleConfiguration::load(file.path()).unwrap();
        assert_eq!(config.data_sources.len(), 2);
        let order = &config.sharding.tables["t_order"];
        assert_eq!(
            order.actual_data_nodes.as_deref(),
            Some("ds_${0..1}.t_order_${0..1}")
        );
        assert_eq!(
            order.database_strategy.as_ref().unwrap().sharding_columns,
            vec!["user_id".to_string()]
        );
        assert_eq!(config.sharding.sharding_algorithms["db_mod"].type_name, "MOD");
        assert_eq!(
            config.sharding.sharding_algorithms["db_mod"].props["sharding-count"],
            "2"
        );
        assert!(config.encrypt.query_with_cipher_column);
        assert!(config.readwrite_splitting.groups.is_empty());
    }

    #[test]
    fn test_load_missing_file() {
        let result = RuleConfiguration::load("/nonexistent/rules.yaml");
        assert!(matches!(result, Err(AppError::Configuration(_))));
    }
}
