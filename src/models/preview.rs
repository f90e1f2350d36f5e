use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::route::RouteContext;
use crate::models::statement::HintContext;
use crate::services::kernel::ExecutionContext;
use crate::services::rewrite::ExecutionUnit;
use crate::services::rule::RuleModel;

/// Preview request: logical SQL, its parameters and an optional session hint
#[derive(Debug, Clone, Deserialize)]
pub struct PreviewRequest {
    pub sql: String,
    #[serde(default)]
    pub parameters: Vec<Value>,
    #[serde(default)]
    pub hint: HintContext,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TableMappingView {
    pub logic: String,
    pub actual: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RouteUnitView {
    pub data_source: String,
    pub actual_data_source: String,
    pub tables: Vec<TableMappingView>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PreviewResponse {
    pub route_units: Vec<RouteUnitView>,
    pub execution_units: Vec<ExecutionUnit>,
}

impl PreviewResponse {
    fn route_units(context: &RouteContext) -> Vec<RouteUnitView> {
        context
            .route_units()
            .iter()
            .map(|unit| RouteUnitView {
                data_source: unit.logic_data_source().to_string(),
                actual_data_source: unit.actual_data_source().to_string(),
                tables: unit
                    .table_mappers()
                    .into_iter()
                    .map(|mapper| TableMappingView {
                        logic: mapper.logic_name.clone(),
                        actual: mapper.actual_name.clone(),
                    })
                    .collect(),
            })
            .collect()
    }
}

impl From<ExecutionContext> for PreviewResponse {
    fn from(context: ExecutionContext) -> Self {
        Self {
            route_units: Self::route_units(&context.route_context),
            execution_units: context.execution_units,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LogicTableView {
    pub name: String,
    pub data_nodes: Vec<String>,
    pub sharding_columns: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_column: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EncryptTableView {
    pub name: String,
    pub columns: Vec<String>,
    pub query_with_cipher_column: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReadwriteGroupView {
    pub name: String,
    pub primary: String,
    pub replicas: Vec<String>,
}

/// Read-only summary of the active rule model
#[derive(Debug, Clone, Serialize)]
pub struct RulesView {
    pub data_sources: Vec<String>,
    pub logic_tables: Vec<LogicTableView>,
    pub binding_groups: Vec<Vec<String>>,
    pub broadcast_tables: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_data_source: Option<String>,
    pub encrypt_tables: Vec<EncryptTableView>,
    pub readwrite_groups: Vec<ReadwriteGroupView>,
}

impl From<&RuleModel> for RulesView {
    fn from(model: &RuleModel) -> Self {
        let logic_tables: Vec<LogicTableView> = model
            .sharding
            .table_rules()
            .map(|table| LogicTableView {
                name: table.logic_table.clone(),
                data_nodes: table.data_nodes().iter().map(ToString::to_string).collect(),
                sharding_columns: table.sharding_columns().into_iter().map(str::to_string).collect(),
                key_column: table.generate_key_column().map(str::to_string),
            })
            .collect();

        let mut encrypt_tables: Vec<EncryptTableView> = model
            .encrypt
            .tables()
            .map(|table| EncryptTableView {
                name: table.table.clone(),
                columns: table.logic_columns().into_iter().map(str::to_string).collect(),
                query_with_cipher_column: table.query_with_cipher_column,
            })
            .collect();
        encrypt_tables.sort_by(|left, right| left.name.cmp(&right.name));

        let readwrite_groups = model
            .readwrite
            .group_names()
            .into_iter()
            .filter_map(|name| model.readwrite.find_group(name))
            .map(|group| ReadwriteGroupView {
                name: group.name.clone(),
                primary: group.primary.clone(),
                replicas: group.replicas.clone(),
            })
            .collect();

        Self {
            data_sources: model.logic_data_source_names(),
            logic_tables,
            binding_groups: model.sharding.binding_groups().to_vec(),
            broadcast_tables: model.sharding.broadcast_tables().to_vec(),
            default_data_source: model.sharding.default_data_source().map(str::to_string),
            encrypt_tables,
            readwrite_groups,
        }
    }
}
