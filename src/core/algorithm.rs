/// Pure backend-selection algorithms.
///
/// `select` is total and side-effect-free: all per-algorithm memory
/// lives in the `AlgorithmState` it returns. The pool actor owns the
/// state and applies counter updates to the chosen backend.
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::core::Backend;
use crate::error::{EdgeError, EdgeResult};

/// Load-balancing policy for a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    #[default]
    RoundRobin,
    LeastConnections,
    WeightedRoundRobin,
    Random,
}

impl Algorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::RoundRobin => "round_robin",
            Algorithm::LeastConnections => "least_connections",
            Algorithm::WeightedRoundRobin => "weighted_round_robin",
            Algorithm::Random => "random",
        }
    }
}

impl std::str::FromStr for Algorithm {
    type Err = EdgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "round_robin" => Ok(Algorithm::RoundRobin),
            "least_connections" => Ok(Algorithm::LeastConnections),
            "weighted_round_robin" => Ok(Algorithm::WeightedRoundRobin),
            "random" => Ok(Algorithm::Random),
            other => Err(EdgeError::validation(format!("unknown algorithm: {other}"))),
        }
    }
}

/// Opaque per-pool cursor for the stateful algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct AlgorithmState {
    pub cursor: u64,
}

/// Select a backend index from `backends` under `algorithm`.
///
/// Only healthy backends are candidates; an empty healthy set yields
/// `NoBackends`. The returned index points into the original slice.
pub fn select(
    backends: &[Backend],
    algorithm: Algorithm,
    state: &AlgorithmState,
) -> (EdgeResult<usize>, AlgorithmState) {
    let healthy: Vec<usize> = backends
        .iter()
        .enumerate()
        .filter(|(_, b)| b.healthy)
        .map(|(i, _)| i)
        .collect();

    if healthy.is_empty() {
        return (Err(EdgeError::NoBackends), *state);
    }

    match algorithm {
        Algorithm::RoundRobin => {
            let chosen = healthy[(state.cursor as usize) % healthy.len()];
            (
                Ok(chosen),
                AlgorithmState {
                    cursor: state.cursor.wrapping_add(1),
                },
            )
        }
        Algorithm::LeastConnections => {
            // Argmin over live connections, ties broken by lowest id for
            // stable ordering
            let chosen = healthy
                .into_iter()
                .min_by(|&a, &b| {
                    backends[a]
                        .current_connections
                        .cmp(&backends[b].current_connections)
                        .then_with(|| backends[a].id().cmp(&backends[b].id()))
                })
                .expect("non-empty healthy set");
            (Ok(chosen), *state)
        }
        Algorithm::WeightedRoundRobin => {
            let total_weight: usize = healthy.iter().map(|&i| backends[i].weight).sum();
            if total_weight == 0 {
                // Weight 0 is rejected at pool mutation; an all-zero set
                // can only come from a stale snapshot
                return (Err(EdgeError::NoBackends), *state);
            }
            let mut position = (state.cursor as usize) % total_weight;
            let mut chosen = healthy[0];
            for &i in &healthy {
                if position < backends[i].weight {
                    chosen = i;
                    break;
                }
                position -= backends[i].weight;
            }
            (
                Ok(chosen),
                AlgorithmState {
                    cursor: state.cursor.wrapping_add(1),
                },
            )
        }
        Algorithm::Random => {
            let pick = rand::thread_rng().gen_range(0..healthy.len());
            (Ok(healthy[pick]), *state)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(url: &str, weight: usize) -> Backend {
        let mut b = Backend::new(url).unwrap();
        b.weight = weight;
        b
    }

    fn select_ids(backends: &[Backend], algorithm: Algorithm, n: usize) -> Vec<String> {
        let mut state = AlgorithmState::default();
        let mut ids = Vec::new();
        for _ in 0..n {
            let (result, next) = select(backends, algorithm, &state);
            ids.push(backends[result.unwrap()].id());
            state = next;
        }
        ids
    }

    #[test]
    fn test_empty_pool_returns_no_backends() {
        let (result, _) = select(&[], Algorithm::LeastConnections, &AlgorithmState::default());
        assert!(matches!(result, Err(EdgeError::NoBackends)));
    }

    #[test]
    fn test_all_unhealthy_returns_no_backends() {
        let mut b = backend("http://a:1", 1);
        b.set_health(false);
        let (result, _) = select(&[b], Algorithm::RoundRobin, &AlgorithmState::default());
        assert!(matches!(result, Err(EdgeError::NoBackends)));
    }

    #[test]
    fn test_round_robin_cycles() {
        let backends = vec![
            backend("http://a:1", 1),
            backend("http://a:2", 1),
            backend("http://a:3", 1),
        ];

        let ids = select_ids(&backends, Algorithm::RoundRobin, 10);
        let expected: Vec<String> = [
            "http://a:1",
            "http://a:2",
            "http://a:3",
            "http://a:1",
            "http://a:2",
            "http://a:3",
            "http://a:1",
            "http://a:2",
            "http://a:3",
            "http://a:1",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        assert_eq!(ids, expected);
    }

    #[test]
    fn test_round_robin_skips_unhealthy() {
        let mut backends = vec![
            backend("http://a:1", 1),
            backend("http://a:2", 1),
            backend("http://a:3", 1),
        ];

        // Ten selections over the full healthy set
        let mut state = AlgorithmState::default();
        for _ in 0..10 {
            let (result, next) = select(&backends, Algorithm::RoundRobin, &state);
            result.unwrap();
            state = next;
        }

        // b2 drops out; the rotation continues over {b1, b3}
        backends[1].set_health(false);
        let mut ids = Vec::new();
        for _ in 0..3 {
            let (result, next) = select(&backends, Algorithm::RoundRobin, &state);
            ids.push(backends[result.unwrap()].id());
            state = next;
        }
        assert_eq!(ids, vec!["http://a:1", "http://a:3", "http://a:1"]);
    }

    #[test]
    fn test_least_connections_argmin() {
        let mut backends = vec![
            backend("http://a:1", 1),
            backend("http://a:2", 1),
            backend("http://a:3", 1),
        ];
        backends[0].inc_connections();
        backends[0].inc_connections();
        backends[2].inc_connections();

        let (result, _) = select(
            &backends,
            Algorithm::LeastConnections,
            &AlgorithmState::default(),
        );
        assert_eq!(backends[result.unwrap()].id(), "http://a:2");
    }

    #[test]
    fn test_least_connections_tie_breaks_by_id() {
        let backends = vec![
            backend("http://b:2", 1),
            backend("http://a:9", 1),
            backend("http://b:1", 1),
        ];

        let (result, _) = select(
            &backends,
            Algorithm::LeastConnections,
            &AlgorithmState::default(),
        );
        assert_eq!(backends[result.unwrap()].id(), "http://a:9");
    }

    #[test]
    fn test_least_connections_leaves_state_unchanged() {
        let backends = vec![backend("http://a:1", 1)];
        let state = AlgorithmState { cursor: 7 };
        let (_, next) = select(&backends, Algorithm::LeastConnections, &state);
        assert_eq!(next, state);
    }

    #[test]
    fn test_weighted_round_robin_distribution() {
        let backends = vec![backend("http://a:1", 1), backend("http://a:2", 3)];

        let ids = select_ids(&backends, Algorithm::WeightedRoundRobin, 8);
        let b1 = ids.iter().filter(|id| *id == "http://a:1").count();
        let b2 = ids.iter().filter(|id| *id == "http://a:2").count();
        assert_eq!(b1, 2);
        assert_eq!(b2, 6);
    }

    #[test]
    fn test_weighted_round_robin_skips_unhealthy() {
        let mut backends = vec![backend("http://a:1", 5), backend("http://a:2", 1)];
        backends[0].set_health(false);

        let ids = select_ids(&backends, Algorithm::WeightedRoundRobin, 4);
        assert!(ids.iter().all(|id| id == "http://a:2"));
    }

    #[test]
    fn test_random_stays_in_healthy_set() {
        let mut backends = vec![
            backend("http://a:1", 1),
            backend("http://a:2", 1),
            backend("http://a:3", 1),
        ];
        backends[1].set_health(false);

        let state = AlgorithmState::default();
        for _ in 0..50 {
            let (result, next) = select(&backends, Algorithm::Random, &state);
            let id = backends[result.unwrap()].id();
            assert_ne!(id, "http://a:2");
            // Random keeps the cursor untouched
            assert_eq!(next, state);
        }
    }

    #[test]
    fn test_algorithm_parsing() {
        use std::str::FromStr;
        assert_eq!(
            Algorithm::from_str("round_robin").unwrap(),
            Algorithm::RoundRobin
        );
        assert_eq!(
            Algorithm::from_str("weighted_round_robin").unwrap(),
            Algorithm::WeightedRoundRobin
        );
        assert!(Algorithm::from_str("ip_hash").is_err());
    }
}
