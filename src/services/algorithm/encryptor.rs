use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;

use super::Properties;
use crate::api::middleware::AppError;

/// Column value codec. Invoked at token render time, once per rendered statement.
pub trait Encryptor: Send + Sync + fmt::Debug {
    fn type_name(&self) -> &'static str;

    fn encrypt(&self, plain: &Value) -> Result<Value, AppError>;
}

/// Salted SHA-256 digest, hex encoded. Deterministic, so usable for assisted queries.
#[derive(Debug)]
pub struct Sha256Encryptor {
    salt: String,
}

impl Sha256Encryptor {
    pub fn create(props: &Properties) -> Result<Arc<dyn Encryptor>, AppError> {
        Ok(Arc::new(Self {
            salt: props.get("salt").cloned().unwrap_or_default(),
        }))
    }
}

impl Encryptor for Sha256Encryptor {
    fn type_name(&self) -> &'static str {
        "SHA256"
    }

    fn encrypt(&self, plain: &Value) -> Result<Value, AppError> {
        let text = match plain {
            Value::Null => return Ok(Value::Null),
            Value::String(text) => text.clone(),
            Value::Number(number) => number.to_string(),
            Value::Bool(flag) => flag.to_string(),
            other => {
                return Err(AppError::UnsupportedConstruct(format!(
                    "Cannot encrypt value `{}`",
                    other
                )))
            }
        };

        let mut hasher = Sha256::new();
        hasher.update(self.salt.as_bytes());
        hasher.update(text.as_bytes());
        let digest = hasher.finalize();
        let hex: String = digest.iter().map(|byte| format!("{:02x}", byte)).collect();
        Ok(Value::String(hex))
    }
}
