//! City model: block occupancy, densities, utility deltas and agent moves.

use contracts::{agent_target, CitySnapshot, ConfigError, SessionConfig};
use rand::distributions::{Distribution, WeightedIndex};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use thiserror::Error;
use tracing::debug;

use crate::utility::UtilityCurve;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// A move the model refuses to apply. Occupancy is untouched when returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum InvalidMoveError {
    #[error("block {index} is outside the city (total_blocks={total_blocks})")]
    IndexOutOfRange { index: usize, total_blocks: usize },
    #[error("origin block {from_idx} has no agents to move")]
    OriginEmpty { from_idx: usize },
    #[error("destination block {to_idx} is already at capacity {capacity}")]
    DestinationFull { to_idx: usize, capacity: u32 },
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CityError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("occupancy has {actual} blocks, grid needs {expected}")]
    OccupancyLength { expected: usize, actual: usize },
    #[error("block {index} holds {count} agents, capacity is {capacity}")]
    OverCapacity {
        index: usize,
        count: u32,
        capacity: u32,
    },
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

/// Derived view of the city, optionally relative to an origin block.
#[derive(Debug, Clone, PartialEq)]
pub struct CityMetrics {
    pub densities: Vec<f64>,
    /// Personal utility gain of moving from the origin block into each block.
    pub delta_us: Vec<f64>,
    /// Change in social utility if one agent moved from the origin into each block.
    pub delta_social_us: Vec<f64>,
    pub social_utility: f64,
}

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct CityModel {
    rows: usize,
    cols: usize,
    capacity: u32,
    target_agents: u64,
    curve: UtilityCurve,
    occupied: Vec<u32>,
    moves_applied: u64,
    rng: ChaCha8Rng,
}

impl CityModel {
    /// Builds a city and populates it randomly towards `config.rho0`.
    pub fn new(config: &SessionConfig) -> Result<Self, CityError> {
        config.validate()?;
        let mut city = Self {
            rows: config.rows,
            cols: config.cols,
            capacity: config.capacity,
            target_agents: config.target_agents(),
            curve: UtilityCurve::new(config.m),
            occupied: vec![0; config.total_blocks()],
            moves_applied: 0,
            rng: rng_for(config.seed),
        };
        city.initialize(config.rho0);
        Ok(city)
    }

    /// Builds a city with a known occupancy, e.g. for replays and tests.
    pub fn from_occupancy(config: &SessionConfig, occupied: Vec<u32>) -> Result<Self, CityError> {
        config.validate()?;
        let expected = config.total_blocks();
        if occupied.len() != expected {
            return Err(CityError::OccupancyLength {
                expected,
                actual: occupied.len(),
            });
        }
        if let Some((index, &count)) = occupied
            .iter()
            .enumerate()
            .find(|(_, &count)| count > config.capacity)
        {
            return Err(CityError::OverCapacity {
                index,
                count,
                capacity: config.capacity,
            });
        }

        Ok(Self {
            rows: config.rows,
            cols: config.cols,
            capacity: config.capacity,
            target_agents: config.target_agents(),
            curve: UtilityCurve::new(config.m),
            occupied,
            moves_applied: 0,
            rng: rng_for(config.seed),
        })
    }

    /// Draws `floor(total_blocks * H * rho0)` block indices uniformly with
    /// replacement and adds one agent per draw. Draws landing on a full block
    /// are dropped, so the result only approximates `rho0`.
    pub fn initialize(&mut self, rho0: f64) {
        let total_blocks = self.total_blocks();
        let samples = agent_target(total_blocks, self.capacity, rho0.clamp(0.0, 1.0));
        self.target_agents = samples;

        self.occupied = vec![0; total_blocks];
        self.moves_applied = 0;
        for _ in 0..samples {
            let idx = self.rng.gen_range(0..total_blocks);
            if self.occupied[idx] < self.capacity {
                self.occupied[idx] += 1;
            }
        }

        debug!(
            samples,
            placed = self.total_agents(),
            total_blocks,
            "city initialized"
        );
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn total_blocks(&self) -> usize {
        self.occupied.len()
    }

    pub fn occupied(&self) -> &[u32] {
        &self.occupied
    }

    pub fn utility_curve(&self) -> UtilityCurve {
        self.curve
    }

    pub fn moves_applied(&self) -> u64 {
        self.moves_applied
    }

    /// Agents currently placed in the city.
    pub fn total_agents(&self) -> u64 {
        self.occupied.iter().map(|&count| u64::from(count)).sum()
    }

    /// Agent count the initializer aimed for, `floor(N*M*H*rho0)`.
    pub fn target_agents(&self) -> u64 {
        self.target_agents
    }

    pub fn utility(&self, density: f64) -> f64 {
        self.curve.value(density)
    }

    pub fn densities(&self) -> Vec<f64> {
        let capacity = f64::from(self.capacity);
        self.occupied
            .iter()
            .map(|&count| f64::from(count) / capacity)
            .collect()
    }

    /// `H * sum(rho_i * u(rho_i))` over the given densities.
    pub fn social_utility_of(&self, densities: &[f64]) -> f64 {
        f64::from(self.capacity)
            * densities
                .iter()
                .map(|&rho| rho * self.curve.value(rho))
                .sum::<f64>()
    }

    /// Densities and social utility, plus per-block deltas when `from_idx`
    /// names a block of this city. Full blocks and the origin itself keep a
    /// zero delta. The personal delta compares against the origin's current
    /// utility, not its post-move value.
    pub fn compute_metrics(&self, from_idx: Option<usize>) -> CityMetrics {
        let densities = self.densities();
        let social_utility = self.social_utility_of(&densities);
        let mut delta_us = vec![0.0; densities.len()];
        let mut delta_social_us = vec![0.0; densities.len()];

        if let Some(from) = from_idx.filter(|&idx| idx < densities.len()) {
            let step = 1.0 / f64::from(self.capacity);
            let u_from = self.curve.value(densities[from]);
            let mut scratch = densities.clone();

            for (i, &count) in self.occupied.iter().enumerate() {
                if i == from || count >= self.capacity {
                    continue;
                }

                let rho_new = f64::from(count + 1) / f64::from(self.capacity);
                delta_us[i] = self.curve.value(rho_new) - u_from;

                scratch[i] += step;
                scratch[from] -= step;
                delta_social_us[i] = self.social_utility_of(&scratch) - social_utility;
                scratch[i] = densities[i];
                scratch[from] = densities[from];
            }
        }

        CityMetrics {
            densities,
            delta_us,
            delta_social_us,
            social_utility,
        }
    }

    /// Moves one agent between blocks. Fails without touching occupancy when
    /// the origin is empty or the destination is full.
    pub fn apply_move(&mut self, from_idx: usize, to_idx: usize) -> Result<(), InvalidMoveError> {
        let total_blocks = self.total_blocks();
        for index in [from_idx, to_idx] {
            if index >= total_blocks {
                return Err(InvalidMoveError::IndexOutOfRange {
                    index,
                    total_blocks,
                });
            }
        }
        if self.occupied[from_idx] == 0 {
            return Err(InvalidMoveError::OriginEmpty { from_idx });
        }
        if self.occupied[to_idx] >= self.capacity {
            return Err(InvalidMoveError::DestinationFull {
                to_idx,
                capacity: self.capacity,
            });
        }

        self.occupied[from_idx] -= 1;
        self.occupied[to_idx] += 1;
        self.moves_applied += 1;
        Ok(())
    }

    pub fn snapshot(&self, from_idx: Option<usize>) -> CitySnapshot {
        let metrics = self.compute_metrics(from_idx);
        CitySnapshot {
            rows: self.rows,
            cols: self.cols,
            occupied: self.occupied.clone(),
            densities: metrics.densities,
            delta_us: metrics.delta_us,
            delta_social_us: metrics.delta_social_us,
            social_utility: metrics.social_utility,
            turn: self.moves_applied,
        }
    }

    /// Picks a block with probability proportional to its occupancy, or
    /// `None` when the city is empty.
    pub fn sample_weighted_block(&mut self) -> Option<usize> {
        let weights =
            WeightedIndex::<u64>::new(self.occupied.iter().map(|&count| u64::from(count))).ok()?;
        Some(weights.sample(&mut self.rng))
    }
}

fn rng_for(seed: Option<u64>) -> ChaCha8Rng {
    match seed {
        Some(seed) => ChaCha8Rng::seed_from_u64(seed),
        None => ChaCha8Rng::from_entropy(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(rows: usize, cols: usize, capacity: u32) -> SessionConfig {
        SessionConfig {
            rows,
            cols,
            capacity,
            seed: Some(7),
            ..SessionConfig::default()
        }
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn initialization_respects_capacity_and_target() {
        let city = CityModel::new(&config(3, 4, 10)).expect("valid config");
        assert_eq!(city.total_blocks(), 12);
        assert!(city.occupied().iter().all(|&count| count <= 10));
        assert!(city.total_agents() <= city.target_agents());
        assert_eq!(city.target_agents(), 60);
        assert_eq!(city.moves_applied(), 0);
    }

    #[test]
    fn seeded_initialization_is_reproducible() {
        let a = CityModel::new(&config(2, 5, 20)).expect("valid config");
        let b = CityModel::new(&config(2, 5, 20)).expect("valid config");
        assert_eq!(a.occupied(), b.occupied());
    }

    #[test]
    fn saturated_initialization_drops_overflow_draws() {
        let mut cfg = config(1, 3, 4);
        cfg.rho0 = 1.0;
        let city = CityModel::new(&cfg).expect("valid config");
        assert!(city.total_agents() <= 12);
        assert!(city.occupied().iter().all(|&count| count <= 4));
    }

    #[test]
    fn from_occupancy_rejects_bad_shapes() {
        let cfg = config(1, 2, 10);
        assert_eq!(
            CityModel::from_occupancy(&cfg, vec![1, 2, 3]).unwrap_err(),
            CityError::OccupancyLength {
                expected: 2,
                actual: 3
            }
        );
        assert!(matches!(
            CityModel::from_occupancy(&cfg, vec![1, 11]),
            Err(CityError::OverCapacity { index: 1, .. })
        ));
    }

    #[test]
    fn metrics_without_origin_have_zero_deltas() {
        let city = CityModel::from_occupancy(&config(1, 2, 100), vec![50, 50]).expect("city");
        let metrics = city.compute_metrics(None);
        assert_eq!(metrics.densities, vec![0.5, 0.5]);
        assert!(metrics.delta_us.iter().all(|&d| d == 0.0));
        assert!(metrics.delta_social_us.iter().all(|&d| d == 0.0));
        assert!(close(metrics.social_utility, 100.0));
    }

    #[test]
    fn metrics_with_origin_match_hand_computed_values() {
        let city = CityModel::from_occupancy(&config(1, 2, 100), vec![50, 50]).expect("city");
        let metrics = city.compute_metrics(Some(0));

        assert_eq!(metrics.delta_us[0], 0.0);
        assert_eq!(metrics.delta_social_us[0], 0.0);
        // u(0.51) - u(0.5) = 0.7 + 0.6 * 0.49 - 1
        assert!(close(metrics.delta_us[1], -0.006));
        // 100 * (0.49 * 0.98 + 0.51 * 0.994) - 100
        assert!(close(metrics.delta_social_us[1], -1.286));
    }

    #[test]
    fn full_blocks_and_origin_get_zero_deltas() {
        let city =
            CityModel::from_occupancy(&config(1, 3, 100), vec![10, 100, 30]).expect("city");
        let metrics = city.compute_metrics(Some(0));
        assert_eq!(metrics.delta_us[0], 0.0);
        assert_eq!(metrics.delta_us[1], 0.0);
        assert_eq!(metrics.delta_social_us[1], 0.0);
        assert!(metrics.delta_us[2] != 0.0);
        assert!(metrics.delta_social_us[2] != 0.0);
    }

    #[test]
    fn out_of_range_origin_is_treated_as_absent() {
        let city = CityModel::from_occupancy(&config(1, 2, 10), vec![3, 4]).expect("city");
        let metrics = city.compute_metrics(Some(9));
        assert!(metrics.delta_us.iter().all(|&d| d == 0.0));
    }

    #[test]
    fn move_shifts_one_agent_and_counts_the_turn() {
        let mut city = CityModel::from_occupancy(&config(1, 2, 10), vec![3, 4]).expect("city");
        city.apply_move(0, 1).expect("feasible move");
        assert_eq!(city.occupied(), &[2, 5]);
        assert_eq!(city.moves_applied(), 1);
        assert_eq!(city.snapshot(None).turn, 1);
    }

    #[test]
    fn infeasible_moves_leave_occupancy_untouched() {
        let mut city = CityModel::from_occupancy(&config(1, 3, 5), vec![0, 5, 2]).expect("city");

        assert_eq!(
            city.apply_move(0, 2),
            Err(InvalidMoveError::OriginEmpty { from_idx: 0 })
        );
        assert_eq!(
            city.apply_move(2, 1),
            Err(InvalidMoveError::DestinationFull {
                to_idx: 1,
                capacity: 5
            })
        );
        assert_eq!(
            city.apply_move(2, 3),
            Err(InvalidMoveError::IndexOutOfRange {
                index: 3,
                total_blocks: 3
            })
        );
        assert_eq!(city.occupied(), &[0, 5, 2]);
        assert_eq!(city.moves_applied(), 0);
    }

    #[test]
    fn same_block_move_is_accepted_without_changing_occupancy() {
        let mut city = CityModel::from_occupancy(&config(1, 2, 10), vec![3, 4]).expect("city");
        city.apply_move(1, 1).expect("same-block move");
        assert_eq!(city.occupied(), &[3, 4]);
        assert_eq!(city.moves_applied(), 1);
    }

    #[test]
    fn weighted_sampling_only_returns_occupied_blocks() {
        let mut city =
            CityModel::from_occupancy(&config(1, 4, 10), vec![0, 6, 0, 2]).expect("city");
        for _ in 0..200 {
            let idx = city.sample_weighted_block().expect("city has agents");
            assert!(idx == 1 || idx == 3);
        }
    }

    #[test]
    fn weighted_sampling_signals_an_empty_city() {
        let mut city = CityModel::from_occupancy(&config(1, 3, 10), vec![0, 0, 0]).expect("city");
        assert_eq!(city.sample_weighted_block(), None);
    }

    #[test]
    fn weighted_sampling_handles_occupancy_past_u32_total() {
        let mut city = CityModel::from_occupancy(&config(1, 2, 10), vec![1, 1]).expect("city");
        city.capacity = u32::MAX;
        city.occupied = vec![u32::MAX, 1];
        let idx = city.sample_weighted_block().expect("city has agents");
        assert!(idx < 2);
    }

    #[test]
    fn oversized_grid_is_a_config_error() {
        let mut cfg = config(usize::MAX / 2, 4, 10);
        cfg.rho0 = 0.5;
        assert!(matches!(
            CityModel::new(&cfg),
            Err(CityError::Config(ConfigError::GridTooLarge { .. }))
        ));
        assert!(matches!(
            CityModel::from_occupancy(&cfg, Vec::new()),
            Err(CityError::Config(ConfigError::GridTooLarge { .. }))
        ));
    }

    #[test]
    fn target_agents_follow_the_last_initialization() {
        let mut city = CityModel::new(&config(1, 4, 10)).expect("valid config");
        assert_eq!(city.target_agents(), 20);
        city.initialize(0.25);
        assert_eq!(city.target_agents(), 10);
        assert_eq!(city.total_agents(), 10);
        city.initialize(7.0);
        assert_eq!(city.target_agents(), 40);
    }

    #[test]
    fn snapshot_is_recomputed_after_each_move() {
        let mut city = CityModel::from_occupancy(&config(1, 2, 100), vec![50, 50]).expect("city");
        let before = city.snapshot(None);
        city.apply_move(0, 1).expect("move");
        let after = city.snapshot(None);
        assert_eq!(after.occupied, vec![49, 51]);
        assert!(before.social_utility != after.social_utility);
        assert_eq!((after.rows, after.cols), (1, 2));
    }
}
