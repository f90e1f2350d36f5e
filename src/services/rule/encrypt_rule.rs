use std::collections::HashMap;
use std::sync::Arc;

use crate::services::algorithm::Encryptor;

/// Logical column backed by a cipher column and optional assisted/plain columns
#[derive(Debug, Clone)]
pub struct EncryptColumnRule {
    pub logic_column: String,
    pub cipher_column: String,
    pub assisted_query_column: Option<String>,
    pub plain_column: Option<String>,
    pub encryptor: Arc<dyn Encryptor>,
    pub assisted_query_encryptor: Option<Arc<dyn Encryptor>>,
}

impl EncryptColumnRule {
    /// Column and encryptor used for equality predicates
    pub fn query_column(&self) -> (&str, &Arc<dyn Encryptor>) {
        match (&self.assisted_query_column, &self.assisted_query_encryptor) {
            (Some(column), Some(encryptor)) => (column.as_str(), encryptor),
            (Some(column), None) => (column.as_str(), &self.encryptor),
            _ => (self.cipher_column.as_str(), &self.encryptor),
        }
    }

    /// Physical columns written for this logical column, in write order
    pub fn write_columns(&self) -> Vec<&str> {
        let mut result = vec![self.cipher_column.as_str()];
        if let Some(assisted) = &self.assisted_query_column {
            result.push(assisted);
        }
        if let Some(plain) = &self.plain_column {
            result.push(plain);
        }
        result
    }
}

#[derive(Debug, Clone)]
pub struct EncryptTableRule {
    pub table: String,
    columns: HashMap<String, EncryptColumnRule>,
    pub query_with_cipher_column: bool,
}

impl EncryptTableRule {
    pub fn new(
        table: impl Into<String>,
        columns: Vec<EncryptColumnRule>,
        query_with_cipher_column: bool,
    ) -> Self {
        Self {
            table: table.into(),
            columns: columns
                .into_iter()
                .map(|column| (column.logic_column.to_ascii_lowercase(), column))
                .collect(),
            query_with_cipher_column,
        }
    }

    pub fn find_column(&self, logic_column: &str) -> Option<&EncryptColumnRule> {
        self.columns.get(&logic_column.to_ascii_lowercase())
    }

    /// Reads use the plain column only when configured so and one exists
    pub fn uses_plain_column(&self, column: &EncryptColumnRule) -> bool {
        !self.query_with_cipher_column && column.plain_column.is_some()
    }

    pub fn logic_columns(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .columns
            .values()
            .map(|column| column.logic_column.as_str())
            .collect();
        names.sort_unstable();
        names
    }
}

#[derive(Debug, Clone, Default)]
pub struct EncryptRule {
    tables: HashMap<String, EncryptTableRule>,
}

impl EncryptRule {
    pub fn new(tables: Vec<EncryptTableRule>) -> Self {
        Self {
            tables: tables
                .into_iter()
                .map(|table| (table.table.to_ascii_lowercase(), table))
                .collect(),
        }
    }

    pub fn find_table(&self, logic_table: &str) -> Option<&EncryptTableRule> {
        self.tables.get(&logic_table.to_ascii_lowercase())
    }

    pub fn find_column(&self, logic_table: &str, logic_column: &str) -> Option<&EncryptColumnRule> {
        self.find_table(logic_table)?.find_column(logic_column)
    }

    /// Whether any of the tables carries an encrypt rule
    pub fn contains_any(&self, logic_tables: &[String]) -> bool {
        logic_tables.iter().any(|name| self.find_table(name).is_some())
    }

    pub fn tables(&self) -> impl Iterator<Item = &EncryptTableRule> {
        self.tables.values()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::algorithm::{Properties, Sha256Encryptor};

    fn phone(assisted: bool, plain: bool) -> EncryptColumnRule {
        let encryptor = Sha256Encryptor::create(&Properties::new()).unwrap();
        EncryptColumnRule {
            logic_column: "phone".to_string(),
            cipher_column: "phone_cipher".to_string(),
            assisted_query_column: assisted.then(|| "phone_assisted".to_string()),
            plain_column: plain.then(|| "phone_plain".to_string()),
            encryptor,
            assisted_query_encryptor: None,
        }
    }

    #[test]
    fn test_query_and_write_columns() {
        let full = phone(true, true);
        assert_eq!(full.query_column().0, "phone_assisted");
        assert_eq!(full.write_columns(), vec!["phone_cipher", "phone_assisted", "phone_plain"]);

        let cipher_only = phone(false, false);
        assert_eq!(cipher_only.query_column().0, "phone_cipher");
        assert_eq!(cipher_only.write_columns(), vec!["phone_cipher"]);
    }

    #[test]
    fn test_lookup_is_case_insensitive() {
        let rule = EncryptRule::new(vec![EncryptTableRule::new("t_user", vec![phone(true, true)], false)]);
        assert!(rule.find_column("T_USER", "PHONE").is_some());
        assert!(rule.contains_any(&["t_order".to_string(), "t_user".to_string()]));
        let table = rule.find_table("t_user").unwrap();
        assert!(table.uses_plain_column(table.find_column("phone").unwrap()));
    }
}
