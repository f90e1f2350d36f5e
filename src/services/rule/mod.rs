// Rule Model
//
// Immutable description of data sources, sharded tables, encrypted columns and
// readwrite-splitting groups. Built once per configuration generation by
// `RuleModelBuilder`; reloads swap a fresh `Arc<RuleModel>` into `RuleModelHolder`.

pub mod encrypt_rule;
pub mod readwrite;
pub mod sharding_rule;
pub mod table_rule;

use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::api::middleware::AppError;
use crate::models::route::DataNode;
use crate::models::rule_config::{
    AlgorithmConfig, RuleConfiguration, ShardingStrategyConfig, TableRuleConfig,
};
use crate::services::algorithm::{
    AlgorithmRegistry, Encryptor, KeyGenerateAlgorithm, LoadBalanceAlgorithm, Properties,
    ShardingAlgorithm,
};
use crate::services::inline_expr::InlineExpressionParser;

pub use encrypt_rule::{EncryptColumnRule, EncryptRule, EncryptTableRule};
pub use readwrite::{ReadwriteGroup, ReadwriteSplittingRule};
pub use sharding_rule::ShardingRule;
pub use table_rule::{KeyGenerateStrategy, ShardingStrategy, TableRule};

/// A configured physical data source
#[derive(Debug, Clone)]
pub struct DataSourceRule {
    pub name: String,
    pub url: String,
    /// `host:port` of the database instance
    pub instance: String,
}

impl DataSourceRule {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Result<Self, AppError> {
        let name = name.into();
        let url = url.into();
        let parsed = url::Url::parse(&url).map_err(|e| {
            AppError::Configuration(format!("Invalid url for data source `{}`: {}", name, e))
        })?;
        let host = parsed.host_str().unwrap_or("localhost").to_ascii_lowercase();
        let instance = match parsed.port_or_known_default() {
            Some(port) => format!("{}:{}", host, port),
            None => host,
        };
        Ok(Self {
            name,
            url,
            instance,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct RuleModel {
    data_sources: BTreeMap<String, DataSourceRule>,
    pub sharding: ShardingRule,
    pub encrypt: EncryptRule,
    pub readwrite: ReadwriteSplittingRule,
}

impl RuleModel {
    pub fn new(
        data_sources: Vec<DataSourceRule>,
        sharding: ShardingRule,
        encrypt: EncryptRule,
        readwrite: ReadwriteSplittingRule,
    ) -> Self {
        Self {
            data_sources: data_sources
                .into_iter()
                .map(|data_source| (data_source.name.clone(), data_source))
                .collect(),
            sharding,
            encrypt,
            readwrite,
        }
    }

    pub fn data_source(&self, name: &str) -> Option<&DataSourceRule> {
        self.data_sources.get(name)
    }

    /// Names statements are routed to: readwrite groups plus data sources outside any group, sorted
    pub fn logic_data_source_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .readwrite
            .group_names()
            .into_iter()
            .map(str::to_string)
            .collect();
        names.extend(
            self.data_sources
                .keys()
                .filter(|name| !self.readwrite.is_member(name))
                .cloned(),
        );
        names.sort();
        names
    }

    /// Configured data source or readwrite group
    pub fn contains_data_source(&self, name: &str) -> bool {
        self.data_sources.contains_key(name) || self.readwrite.find_group(name).is_some()
    }

    /// Instance of a logical data source; groups resolve through their primary
    pub fn instance_of(&self, logic_data_source: &str) -> Option<&str> {
        let physical = self
            .readwrite
            .find_group(logic_data_source)
            .map(|group| group.primary.as_str())
            .unwrap_or(logic_data_source);
        self.data_sources
            .get(physical)
            .map(|data_source| data_source.instance.as_str())
    }
}

/// Compiles a `RuleConfiguration` into a `RuleModel` using injected algorithm registries
pub struct RuleModelBuilder {
    sharding_algorithms: AlgorithmRegistry<dyn ShardingAlgorithm>,
    key_generators: AlgorithmRegistry<dyn KeyGenerateAlgorithm>,
    encryptors: AlgorithmRegistry<dyn Encryptor>,
    load_balancers: AlgorithmRegistry<dyn LoadBalanceAlgorithm>,
    worker_id: i64,
}

impl RuleModelBuilder {
    /// Builder with every built-in algorithm registered
    pub fn new(worker_id: i64) -> Self {
        Self {
            sharding_algorithms: AlgorithmRegistry::sharding_builtins(),
            key_generators: AlgorithmRegistry::key_generate_builtins(),
            encryptors: AlgorithmRegistry::encrypt_builtins(),
            load_balancers: AlgorithmRegistry::load_balance_builtins(),
            worker_id,
        }
    }

    pub fn sharding_algorithms_mut(&mut self) -> &mut AlgorithmRegistry<dyn ShardingAlgorithm> {
        &mut self.sharding_algorithms
    }

    pub fn encryptors_mut(&mut self) -> &mut AlgorithmRegistry<dyn Encryptor> {
        &mut self.encryptors
    }

    pub fn build(&self, config: &RuleConfiguration) -> Result<RuleModel, AppError> {
        let mut data_sources = Vec::with_capacity(config.data_sources.len());
        for (name, data_source) in &config.data_sources {
            data_sources.push(DataSourceRule::new(name.clone(), data_source.url.clone())?);
        }

        let readwrite = self.build_readwrite(config)?;
        let mut logic_data_sources: Vec<String> = readwrite
            .group_names()
            .into_iter()
            .map(str::to_string)
            .collect();
        logic_data_sources.extend(
            config
                .data_sources
                .keys()
                .filter(|name| !readwrite.is_member(name))
                .cloned(),
        );
        logic_data_sources.sort();

        let sharding = self.build_sharding(config, &logic_data_sources)?;
        let encrypt = self.build_encrypt(config)?;

        tracing::info!(
            "Built rule model: {} data sources, {} sharding tables, {} encrypt tables, {} readwrite groups",
            data_sources.len(),
            sharding.table_rules().count(),
            encrypt.tables().count(),
            readwrite.group_names().len()
        );
        Ok(RuleModel::new(data_sources, sharding, encrypt, readwrite))
    }

    fn build_readwrite(&self, config: &RuleConfiguration) -> Result<ReadwriteSplittingRule, AppError> {
        let mut balancers: HashMap<&str, Arc<dyn LoadBalanceAlgorithm>> = HashMap::new();
        let mut groups = Vec::new();
        for (name, group) in &config.readwrite_splitting.groups {
            for member in std::iter::once(&group.primary).chain(group.replicas.iter()) {
                if !config.data_sources.contains_key(member) {
                    return Err(AppError::Configuration(format!(
                        "Readwrite group `{}` references unknown data source `{}`",
                        name, member
                    )));
                }
            }
            if config.data_sources.contains_key(name) {
                return Err(AppError::Configuration(format!(
                    "Readwrite group `{}` collides with a data source name",
                    name
                )));
            }
            let load_balancer = match &group.load_balancer {
                Some(balancer_name) => match balancers.get(balancer_name.as_str()) {
                    Some(existing) => existing.clone(),
                    None => {
                        let algorithm_config = lookup_algorithm(
                            &config.readwrite_splitting.load_balancers,
                            balancer_name,
                            "load balancer",
                        )?;
                        let created = self
                            .load_balancers
                            .create(&algorithm_config.type_name, &algorithm_config.props)?;
                        balancers.insert(balancer_name.as_str(), created.clone());
                        created
                    }
                },
                None => self.load_balancers.create("ROUND_ROBIN", &Properties::new())?,
            };
            groups.push(ReadwriteGroup {
                name: name.clone(),
                primary: group.primary.clone(),
                replicas: group.replicas.clone(),
                load_balancer,
            });
        }
        Ok(ReadwriteSplittingRule::new(groups))
    }

    fn build_sharding(
        &self,
        config: &RuleConfiguration,
        logic_data_sources: &[String],
    ) -> Result<ShardingRule, AppError> {
        let sharding = &config.sharding;
        let mut algorithms: HashMap<String, Arc<dyn ShardingAlgorithm>> = HashMap::new();
        for (name, algorithm) in &sharding.sharding_algorithms {
            algorithms.insert(
                name.clone(),
                self.sharding_algorithms
                    .create(&algorithm.type_name, &algorithm.props)?,
            );
        }
        let mut key_generators: HashMap<String, Arc<dyn KeyGenerateAlgorithm>> = HashMap::new();
        for (name, generator) in &sharding.key_generators {
            let mut props = generator.props.clone();
            if generator.type_name.eq_ignore_ascii_case("SNOWFLAKE") {
                props
                    .entry("worker-id".to_string())
                    .or_insert_with(|| self.worker_id.to_string());
            }
            key_generators.insert(
                name.clone(),
                self.key_generators.create(&generator.type_name, &props)?,
            );
        }

        let mut table_rules = Vec::with_capacity(sharding.tables.len());
        for (logic_table, table_config) in &sharding.tables {
            table_rules.push(self.build_table_rule(
                logic_table,
                table_config,
                config,
                logic_data_sources,
                &algorithms,
                &key_generators,
            )?);
        }

        let binding_groups = sharding
            .binding_tables
            .iter()
            .map(|group| {
                group
                    .split(',')
                    .map(|name| name.trim().to_string())
                    .filter(|name| !name.is_empty())
                    .collect()
            })
            .collect();

        if let Some(default) = &sharding.default_data_source {
            if !logic_data_sources.contains(default) {
                return Err(AppError::Configuration(format!(
                    "Default data source `{}` is not configured",
                    default
                )));
            }
        }

        ShardingRule::new(
            table_rules,
            binding_groups,
            sharding.broadcast_tables.clone(),
            sharding.default_data_source.clone(),
        )
    }

    fn build_table_rule(
        &self,
        logic_table: &str,
        table_config: &TableRuleConfig,
        config: &RuleConfiguration,
        logic_data_sources: &[String],
        algorithms: &HashMap<String, Arc<dyn ShardingAlgorithm>>,
        key_generators: &HashMap<String, Arc<dyn KeyGenerateAlgorithm>>,
    ) -> Result<TableRule, AppError> {
        let data_nodes = match &table_config.actual_data_nodes {
            Some(expression) => {
                let mut nodes = Vec::new();
                for text in InlineExpressionParser::shared().split_and_expand(expression)? {
                    let node = DataNode::parse(&text)?;
                    if !logic_data_sources.contains(&node.data_source) {
                        return Err(AppError::Configuration(format!(
                            "Data node `{}` of table `{}` references unknown data source",
                            node, logic_table
                        )));
                    }
                    nodes.push(node);
                }
                nodes
            }
            None => logic_data_sources
                .iter()
                .map(|data_source| DataNode::new(data_source.clone(), logic_table))
                .collect(),
        };

        let mut rule = TableRule::new(logic_table, data_nodes)?;
        let sharding = &config.sharding;
        rule.database_strategy = table_config
            .database_strategy
            .as_ref()
            .or(sharding.default_database_strategy.as_ref())
            .map(|strategy| build_strategy(strategy, algorithms))
            .transpose()?;
        rule.table_strategy = table_config
            .table_strategy
            .as_ref()
            .or(sharding.default_table_strategy.as_ref())
            .map(|strategy| build_strategy(strategy, algorithms))
            .transpose()?;
        if let Some(key_config) = &table_config.key_generate_strategy {
            let algorithm = key_generators.get(&key_config.key_generator).ok_or_else(|| {
                AppError::Configuration(format!(
                    "Table `{}` references unknown key generator `{}`",
                    logic_table, key_config.key_generator
                ))
            })?;
            rule.key_generate = Some(KeyGenerateStrategy {
                column: key_config.column.clone(),
                algorithm: algorithm.clone(),
            });
        }
        rule.indexes = table_config.indexes.clone();
        Ok(rule)
    }

    fn build_encrypt(&self, config: &RuleConfiguration) -> Result<EncryptRule, AppError> {
        let encrypt = &config.encrypt;
        let mut encryptors: HashMap<&str, Arc<dyn Encryptor>> = HashMap::new();
        for (name, encryptor) in &encrypt.encryptors {
            encryptors.insert(
                name.as_str(),
                self.encryptors.create(&encryptor.type_name, &encryptor.props)?,
            );
        }
        let find = |name: &str, table: &str| -> Result<Arc<dyn Encryptor>, AppError> {
            encryptors.get(name).cloned().ok_or_else(|| {
                AppError::Configuration(format!(
                    "Table `{}` references unregistered encryptor `{}`",
                    table, name
                ))
            })
        };

        let mut tables = Vec::with_capacity(encrypt.tables.len());
        for (table, table_config) in &encrypt.tables {
            let mut columns = Vec::with_capacity(table_config.columns.len());
            for (logic_column, column) in &table_config.columns {
                columns.push(EncryptColumnRule {
                    logic_column: logic_column.clone(),
                    cipher_column: column.cipher_column.clone(),
                    assisted_query_column: column.assisted_query_column.clone(),
                    plain_column: column.plain_column.clone(),
                    encryptor: find(&column.encryptor, table)?,
                    assisted_query_encryptor: column
                        .assisted_query_encryptor
                        .as_deref()
                        .map(|name| find(name, table))
                        .transpose()?,
                });
            }
            tables.push(EncryptTableRule::new(
                table.clone(),
                columns,
                table_config
                    .query_with_cipher_column
                    .unwrap_or(encrypt.query_with_cipher_column),
            ));
        }
        Ok(EncryptRule::new(tables))
    }
}

fn lookup_algorithm<'a>(
    configured: &'a BTreeMap<String, AlgorithmConfig>,
    name: &str,
    kind: &str,
) -> Result<&'a AlgorithmConfig, AppError> {
    configured.get(name).ok_or_else(|| {
        AppError::Configuration(format!("Unknown {} `{}`", kind, name))
    })
}

fn build_strategy(
    config: &ShardingStrategyConfig,
    algorithms: &HashMap<String, Arc<dyn ShardingAlgorithm>>,
) -> Result<ShardingStrategy, AppError> {
    if config.sharding_columns.is_empty() {
        return Err(AppError::Configuration(format!(
            "Strategy using `{}` declares no sharding columns",
            config.algorithm
        )));
    }
    let algorithm = algorithms.get(&config.algorithm).ok_or_else(|| {
        AppError::Configuration(format!("Unknown sharding algorithm `{}`", config.algorithm))
    })?;
    Ok(ShardingStrategy {
        columns: config.sharding_columns.clone(),
        algorithm_name: config.algorithm.clone(),
        algorithm: algorithm.clone(),
    })
}

/// Current rule model generation; readers keep the snapshot they took
#[derive(Debug)]
pub struct RuleModelHolder {
    current: RwLock<Arc<RuleModel>>,
}

impl RuleModelHolder {
    pub fn new(model: RuleModel) -> Self {
        Self {
            current: RwLock::new(Arc::new(model)),
        }
    }

    pub fn snapshot(&self) -> Arc<RuleModel> {
        self.current.read().clone()
    }

    /// Install a new generation, returning the previous one
    pub fn replace(&self, model: RuleModel) -> Arc<RuleModel> {
        std::mem::replace(&mut *self.current.write(), Arc::new(model))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::rule_config::{
        DataSourceConfig, EncryptColumnConfig, EncryptTableConfig, KeyGenerateStrategyConfig,
        ReadwriteGroupConfig,
    };

    fn algorithm(type_name: &str, props: &[(&str, &str)]) -> AlgorithmConfig {
        AlgorithmConfig {
            type_name: type_name.to_string(),
            props: props
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    fn strategy(column: &str, algorithm: &str) -> Option<ShardingStrategyConfig> {
        Some(ShardingStrategyConfig {
            sharding_columns: vec![column.to_string()],
            algorithm: algorithm.to_string(),
        })
    }

    /// Logical data sources `ds_0` and `ds_1` (a readwrite group), `t_order`/`t_order_item`
    /// bound and sharded 2x2, `t_user` sharded by database and encrypted, `t_config` broadcast
    pub(crate) fn sample_configuration() -> RuleConfiguration {
        let mut config = RuleConfiguration::default();
        for (name, url) in [
            ("ds_0", "mysql://10.0.0.1:3306/demo_ds_0"),
            ("ds_1_primary", "mysql://10.0.0.2:3306/demo_ds_1"),
            ("ds_1_replica", "mysql://10.0.0.3:3306/demo_ds_1"),
        ] {
            config.data_sources.insert(
                name.to_string(),
                DataSourceConfig {
                    url: url.to_string(),
                },
            );
        }
        config.readwrite_splitting.groups.insert(
            "ds_1".to_string(),
            ReadwriteGroupConfig {
                primary: "ds_1_primary".to_string(),
                replicas: vec!["ds_1_replica".to_string()],
                load_balancer: None,
            },
        );

        let sharding = &mut config.sharding;
        sharding.sharding_algorithms.insert(
            "db_inline".to_string(),
            algorithm("INLINE", &[("algorithm-expression", "ds_${user_id % 2}")]),
        );
        sharding
            .sharding_algorithms
            .insert("db_mod".to_string(), algorithm("MOD", &[("sharding-count", "2")]));
        sharding
            .sharding_algorithms
            .insert("table_mod".to_string(), algorithm("MOD", &[("sharding-count", "2")]));
        sharding
            .key_generators
            .insert("snowflake".to_string(), algorithm("SNOWFLAKE", &[]));

        for (table, key_column) in [("t_order", Some("order_id")), ("t_order_item", None)] {
            sharding.tables.insert(
                table.to_string(),
                TableRuleConfig {
                    actual_data_nodes: Some(format!("ds_${{0..1}}.{}_${{0..1}}", table)),
                    database_strategy: strategy("user_id", "db_mod"),
                    table_strategy: strategy("order_id", "table_mod"),
                    key_generate_strategy: key_column.map(|column| KeyGenerateStrategyConfig {
                        column: column.to_string(),
                        key_generator: "snowflake".to_string(),
                    }),
                    indexes: if table == "t_order" {
                        vec!["idx_order_user".to_string()]
                    } else {
                        Vec::new()
                    },
                },
            );
        }
        sharding.tables.insert(
            "t_user".to_string(),
            TableRuleConfig {
                actual_data_nodes: Some("ds_${0..1}.t_user".to_string()),
                database_strategy: strategy("user_id", "db_inline"),
                ..TableRuleConfig::default()
            },
        );
        sharding.binding_tables = vec!["t_order, t_order_item".to_string()];
        sharding.broadcast_tables = vec!["t_config".to_string()];
        sharding.default_data_source = Some("ds_0".to_string());

        config
            .encrypt
            .encryptors
            .insert("sha".to_string(), algorithm("SHA256", &[("salt", "s")]));
        let mut columns = BTreeMap::new();
        columns.insert(
            "phone".to_string(),
            EncryptColumnConfig {
                cipher_column: "phone_cipher".to_string(),
                assisted_query_column: Some("phone_assisted".to_string()),
                plain_column: Some("phone_plain".to_string()),
                encryptor: "sha".to_string(),
                assisted_query_encryptor: Some("sha".to_string()),
            },
        );
        config.encrypt.tables.insert(
            "t_user".to_string(),
            EncryptTableConfig {
                columns,
                query_with_cipher_column: None,
            },
        );
        config
    }

    pub(crate) fn sample_model() -> RuleModel {
        RuleModelBuilder::new(1).build(&sample_configuration()).unwrap()
    }

    #[test]
    fn test_build_sample_model() {
        let model = sample_model();
        assert_eq!(model.logic_data_source_names(), vec!["ds_0", "ds_1"]);
        assert!(model.contains_data_source("ds_1"));
        assert!(model.contains_data_source("ds_1_replica"));
        assert!(!model.contains_data_source("ds_9"));
        assert_eq!(model.instance_of("ds_1"), Some("10.0.0.2:3306"));

        let order = model.sharding.find_table_rule("t_order").unwrap();
        assert_eq!(order.data_nodes().len(), 4);
        assert_eq!(order.generate_key_column(), Some("order_id"));
        assert_eq!(order.actual_data_source_names(), ["ds_0", "ds_1"]);
        assert!(model.encrypt.find_column("t_user", "phone").is_some());
    }

    #[test]
    fn test_unknown_algorithm_reference() {
        let mut config = sample_configuration();
        config
            .sharding
            .tables
            .get_mut("t_user")
            .unwrap()
            .database_strategy = strategy("user_id", "missing");
        let result = RuleModelBuilder::new(0).build(&config);
        assert!(matches!(result, Err(AppError::Configuration(_))));
    }

    #[test]
    fn test_unregistered_encryptor_type() {
        let mut config = sample_configuration();
        config
            .encrypt
            .encryptors
            .insert("aes".to_string(), algorithm("AES", &[]));
        let result = RuleModelBuilder::new(0).build(&config);
        match result {
            Err(AppError::Configuration(message)) => assert!(message.contains("AES")),
            other => panic!("unexpected result {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_data_node_with_unknown_data_source() {
        let mut config = sample_configuration();
        config.sharding.tables.get_mut("t_user").unwrap().actual_data_nodes =
            Some("ds_7.t_user".to_string());
        assert!(RuleModelBuilder::new(0).build(&config).is_err());
    }

    #[test]
    fn test_default_data_nodes() {
        let mut config = sample_configuration();
        config.sharding.tables.insert("t_log".to_string(), TableRuleConfig::default());
        let model = RuleModelBuilder::new(0).build(&config).unwrap();
        let log = model.sharding.find_table_rule("t_log").unwrap();
        assert_eq!(
            log.data_nodes(),
            [DataNode::new("ds_0", "t_log"), DataNode::new("ds_1", "t_log")]
        );
    }

    #[test]
    fn test_holder_swaps_snapshot() {
        let holder = RuleModelHolder::new(RuleModel::default());
        let before = holder.snapshot();
        holder.replace(sample_model());
        assert!(before.sharding.is_empty());
        assert!(!holder.snapshot().sharding.is_empty());
    }

    #[test]
    fn test_data_source_instance() {
        let data_source = DataSourceRule::new("ds", "mysql://Db.Example.com/app").unwrap();
        assert_eq!(data_source.instance, "db.example.com");
        assert!(DataSourceRule::new("ds", "not a url").is_err());
    }
}
