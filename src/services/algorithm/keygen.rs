// Key Generators
//
// Generate values for a table's key column when an INSERT omits it. Keys are drawn
// before routing so they take part in sharding.

use parking_lot::Mutex;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

use super::{parse_prop, Properties};
use crate::api::middleware::AppError;

pub trait KeyGenerateAlgorithm: Send + Sync + fmt::Debug {
    fn type_name(&self) -> &'static str;

    fn generate_key(&self) -> Value;
}

/// 2016-11-01T00:00:00Z in milliseconds
pub const SNOWFLAKE_EPOCH_MILLIS: i64 = 1_477_958_400_000;

const SEQUENCE_BITS: u32 = 12;
const WORKER_ID_BITS: u32 = 10;
const SEQUENCE_MASK: i64 = (1 << SEQUENCE_BITS) - 1;
const MAX_WORKER_ID: i64 = (1 << WORKER_ID_BITS) - 1;

#[derive(Debug, Default)]
struct SnowflakeState {
    last_millis: i64,
    sequence: i64,
}

/// 41-bit timestamp | 10-bit worker id | 12-bit sequence
#[derive(Debug)]
pub struct SnowflakeKeyGenerator {
    worker_id: i64,
    state: Mutex<SnowflakeState>,
}

impl SnowflakeKeyGenerator {
    pub fn create(props: &Properties) -> Result<Arc<dyn KeyGenerateAlgorithm>, AppError> {
        let worker_id = match props.get("worker-id") {
            Some(_) => parse_prop::<i64>(props, "worker-id", "SNOWFLAKE")?,
            None => 0,
        };
        Ok(Arc::new(Self::new(worker_id)?))
    }

    pub fn new(worker_id: i64) -> Result<Self, AppError> {
        if !(0..=MAX_WORKER_ID).contains(&worker_id) {
            return Err(AppError::Configuration(format!(
                "SNOWFLAKE worker-id {} outside [0, {}]",
                worker_id, MAX_WORKER_ID
            )));
        }
        Ok(Self {
            worker_id,
            state: Mutex::new(SnowflakeState::default()),
        })
    }

    fn next_id(&self) -> i64 {
        let mut state = self.state.lock();
        // Clock moving backwards reuses the last timestamp
        let mut now = chrono::Utc::now().timestamp_millis().max(state.last_millis);
        if now == state.last_millis {
            state.sequence = (state.sequence + 1) & SEQUENCE_MASK;
            if state.sequence == 0 {
                while now <= state.last_millis {
                    std::hint::spin_loop();
                    now = chrono::Utc::now().timestamp_millis();
                }
            }
        } else {
            state.sequence = 0;
        }
        state.last_millis = now;

        ((now - SNOWFLAKE_EPOCH_MILLIS) << (WORKER_ID_BITS + SEQUENCE_BITS))
            | (self.worker_id << SEQUENCE_BITS)
            | state.sequence
    }
}

impl KeyGenerateAlgorithm for SnowflakeKeyGenerator {
    fn type_name(&self) -> &'static str {
        "SNOWFLAKE"
    }

    fn generate_key(&self) -> Value {
        Value::from(self.next_id())
    }
}

/// Random v4 UUID without hyphens
#[derive(Debug, Default)]
pub struct UuidKeyGenerator;

impl UuidKeyGenerator {
    pub fn create(_props: &Properties) -> Result<Arc<dyn KeyGenerateAlgorithm>, AppError> {
        Ok(Arc::new(Self))
    }
}

impl KeyGenerateAlgorithm for UuidKeyGenerator {
    fn type_name(&self) -> &'static str {
        "UUID"
    }

    fn generate_key(&self) -> Value {
        Value::String(uuid::Uuid::new_v4().simple().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snowflake_layout() {
        let generator = SnowflakeKeyGenerator::new(5).unwrap();
        let key = generator.next_id();
        assert_eq!((key >> SEQUENCE_BITS) & MAX_WORKER_ID, 5);

        let timestamp = (key >> (WORKER_ID_BITS + SEQUENCE_BITS)) + SNOWFLAKE_EPOCH_MILLIS;
        let now = chrono::Utc::now().timestamp_millis();
        assert!(now - timestamp < 5_000);
    }

    #[test]
    fn test_snowflake_keys_increase() {
        let generator = SnowflakeKeyGenerator::new(0).unwrap();
        let mut previous = generator.next_id();
        for _ in 0..10_000 {
            let next = generator.next_id();
            assert!(next > previous);
            previous = next;
        }
    }

    #[test]
    fn test_snowflake_worker_id_bounds() {
        assert!(SnowflakeKeyGenerator::new(1024).is_err());
        let mut props = Properties::new();
        props.insert("worker-id".to_string(), "abc".to_string());
        assert!(SnowflakeKeyGenerator::create(&props).is_err());
    }

    #[test]
    fn test_uuid_key() {
        let key = UuidKeyGenerator.generate_key();
        let text = key.as_str().unwrap();
        assert_eq!(text.len(), 32);
        assert!(!text.contains('-'));
    }
}
