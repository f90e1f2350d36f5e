// Load Balance Algorithms
//
// Pick one replica of a readwrite-splitting group per routed statement. The weighted
// algorithm caches its cumulative weight table per group name.

use parking_lot::RwLock;
use rand::Rng;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::Properties;
use crate::api::middleware::AppError;

pub trait LoadBalanceAlgorithm: Send + Sync + fmt::Debug {
    fn type_name(&self) -> &'static str;

    /// Choose one of `candidates` (non-empty) for the group `group_name`
    fn select(&self, group_name: &str, candidates: &[String]) -> Result<String, AppError>;
}

const INFINITE_WEIGHT: f64 = 10_000.0;
const NAN_WEIGHT: f64 = 1.0;
const ACCURACY_THRESHOLD: f64 = 0.0001;

/// Weighted random selection; props map each replica name to its weight
#[derive(Debug)]
pub struct WeightLoadBalanceAlgorithm {
    weights: HashMap<String, f64>,
    weight_cache: RwLock<HashMap<String, Arc<Vec<f64>>>>,
}

impl WeightLoadBalanceAlgorithm {
    pub fn create(props: &Properties) -> Result<Arc<dyn LoadBalanceAlgorithm>, AppError> {
        if props.is_empty() {
            return Err(AppError::Configuration(
                "WEIGHT load balancer requires at least one weight property".to_string(),
            ));
        }
        let mut weights = HashMap::with_capacity(props.len());
        for (name, raw) in props {
            let weight = raw.trim().parse::<f64>().map_err(|_| {
                AppError::Configuration(format!(
                    "Malformed weight `{}` for data source `{}`",
                    raw, name
                ))
            })?;
            weights.insert(name.clone(), clamp_weight(weight));
        }
        Ok(Arc::new(Self {
            weights,
            weight_cache: RwLock::new(HashMap::new()),
        }))
    }

    fn cumulative_weights_for(
        &self,
        group_name: &str,
        candidates: &[String],
    ) -> Result<Arc<Vec<f64>>, AppError> {
        if let Some(cached) = self.weight_cache.read().get(group_name) {
            if cached.len() == candidates.len() {
                return Ok(cached.clone());
            }
        }

        let mut raw = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let weight = self.weights.get(candidate).copied().ok_or_else(|| {
                AppError::Configuration(format!(
                    "No weight configured for data source `{}` in group `{}`",
                    candidate, group_name
                ))
            })?;
            raw.push(weight);
        }
        let total: f64 = raw.iter().sum();
        if total <= 0.0 {
            return Err(AppError::Configuration(format!(
                "Weights of group `{}` must sum to a positive value",
                group_name
            )));
        }
        let exact: Vec<f64> = raw.iter().map(|weight| weight / total).collect();
        let cumulative = Arc::new(cumulative_weights(&exact)?);

        // Concurrent first calls may both compute; both tables are identical
        self.weight_cache
            .write()
            .insert(group_name.to_string(), cumulative.clone());
        Ok(cumulative)
    }
}

fn clamp_weight(weight: f64) -> f64 {
    if weight.is_infinite() {
        INFINITE_WEIGHT
    } else if weight.is_nan() {
        NAN_WEIGHT
    } else {
        weight
    }
}

/// Running sums of normalized weights; the last must be 1 within the tolerance
pub fn cumulative_weights(exact: &[f64]) -> Result<Vec<f64>, AppError> {
    let mut sum = 0.0;
    let cumulative: Vec<f64> = exact
        .iter()
        .map(|weight| {
            sum += weight;
            sum
        })
        .collect();
    match cumulative.last() {
        Some(last) if (last - 1.0).abs() < ACCURACY_THRESHOLD => Ok(cumulative),
        _ => Err(AppError::Configuration(format!(
            "Miscalculated cumulative weight, expected 1 but got {}",
            sum
        ))),
    }
}

/// Index of the sub-interval containing `draw`, or the last index on a rounding miss
fn pick_index(cumulative: &[f64], draw: f64) -> usize {
    let index = cumulative.partition_point(|weight| *weight <= draw);
    index.min(cumulative.len().saturating_sub(1))
}

impl LoadBalanceAlgorithm for WeightLoadBalanceAlgorithm {
    fn type_name(&self) -> &'static str {
        "WEIGHT"
    }

    fn select(&self, group_name: &str, candidates: &[String]) -> Result<String, AppError> {
        if candidates.len() == 1 {
            return Ok(candidates[0].clone());
        }
        let cumulative = self.cumulative_weights_for(group_name, candidates)?;
        let draw: f64 = rand::thread_rng().gen();
        let index = pick_index(&cumulative, draw);
        Ok(candidates[index].clone())
    }
}

#[derive(Debug, Default)]
pub struct RoundRobinLoadBalanceAlgorithm {
    counter: AtomicUsize,
}

impl RoundRobinLoadBalanceAlgorithm {
    pub fn create(_props: &Properties) -> Result<Arc<dyn LoadBalanceAlgorithm>, AppError> {
        Ok(Arc::new(Self::default()))
    }
}

impl LoadBalanceAlgorithm for RoundRobinLoadBalanceAlgorithm {
    fn type_name(&self) -> &'static str {
        "ROUND_ROBIN"
    }

    fn select(&self, _group_name: &str, candidates: &[String]) -> Result<String, AppError> {
        let next = self.counter.fetch_add(1, Ordering::Relaxed);
        Ok(candidates[next % candidates.len()].clone())
    }
}

#[derive(Debug, Default)]
pub struct RandomLoadBalanceAlgorithm;

impl RandomLoadBalanceAlgorithm {
    pub fn create(_props: &Properties) -> Result<Arc<dyn LoadBalanceAlgorithm>, AppError> {
        Ok(Arc::new(Self))
    }
}

impl LoadBalanceAlgorithm for RandomLoadBalanceAlgorithm {
    fn type_name(&self) -> &'static str {
        "RANDOM"
    }

    fn select(&self, _group_name: &str, candidates: &[String]) -> Result<String, AppError> {
        let index = rand::thread_rng().gen_range(0..candidates.len());
        Ok(candidates[index].clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn weighted(pairs: &[(&str, &str)]) -> Arc<dyn LoadBalanceAlgorithm> {
        let props: Properties = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        WeightLoadBalanceAlgorithm::create(&props).unwrap()
    }

    fn names(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[test]
    fn test_weight_distribution() {
        let algorithm = weighted(&[("a", "0.2"), ("b", "0.3"), ("c", "0.5")]);
        let candidates = names(&["a", "b", "c"]);
        let draws = 100_000;
        let mut counts: HashMap<String, usize> = HashMap::new();
        for _ in 0..draws {
            let chosen = algorithm.select("group", &candidates).unwrap();
            *counts.entry(chosen).or_default() += 1;
        }

        for (name, expected) in [("a", 0.2), ("b", 0.3), ("c", 0.5)] {
            let frequency = counts.get(name).copied().unwrap_or_default() as f64 / draws as f64;
            assert!(
                (frequency - expected).abs() < 0.02,
                "{} selected with frequency {}",
                name,
                frequency
            );
        }
    }

    #[test]
    fn test_cumulative_weight_tolerance() {
        assert!(cumulative_weights(&[0.2, 0.3, 0.5]).is_ok());
        assert!(cumulative_weights(&[0.2, 0.3, 0.50005]).is_ok());
        let error = cumulative_weights(&[0.2, 0.3, 0.6]).unwrap_err();
        assert!(error.to_string().contains("Miscalculated cumulative weight"));
    }

    #[test]
    fn test_clamped_weights() {
        assert_eq!(clamp_weight(f64::INFINITY), 10_000.0);
        assert_eq!(clamp_weight(f64::NAN), 1.0);

        let algorithm = weighted(&[("a", "Infinity"), ("b", "NaN")]);
        let candidates = names(&["a", "b"]);
        let picks_a = (0..1_000)
            .filter(|_| algorithm.select("g", &candidates).unwrap() == "a")
            .count();
        assert!(picks_a > 990);
    }

    #[test]
    fn test_pick_index_boundaries() {
        let cumulative = [0.2, 0.5, 1.0];
        assert_eq!(pick_index(&cumulative, 0.0), 0);
        assert_eq!(pick_index(&cumulative, 0.2), 1);
        assert_eq!(pick_index(&cumulative, 0.99), 2);
        // Rounding miss beyond the last boundary
        assert_eq!(pick_index(&[0.2, 0.5, 0.99995], 0.99999), 2);
    }

    #[test]
    fn test_missing_and_malformed_weights() {
        let algorithm = weighted(&[("a", "1")]);
        let result = algorithm.select("g", &names(&["a", "b"]));
        assert!(matches!(result, Err(AppError::Configuration(_))));

        let mut props = Properties::new();
        props.insert("a".to_string(), "heavy".to_string());
        assert!(WeightLoadBalanceAlgorithm::create(&props).is_err());
    }

    #[test]
    fn test_round_robin_cycles() {
        let algorithm = RoundRobinLoadBalanceAlgorithm::create(&Properties::new()).unwrap();
        let candidates = names(&["r0", "r1"]);
        let picks: Vec<String> = (0..4)
            .map(|_| algorithm.select("g", &candidates).unwrap())
            .collect();
        assert_eq!(picks, names(&["r0", "r1", "r0", "r1"]));
    }
}
