//! Simulated-annealing search
//!
//! The alternative outer loop: start from a uniformly random state, then
//! walk a temperature ladder. Each step perturbs one random variable with a
//! Gaussian jump whose reach shrinks with the temperature, accepts strict
//! improvements always and regressions with probability exp(delta / T), and
//! tracks the best state ever seen. An optional elitist restart snaps the
//! walk back to the best state after a dry spell.

use super::{Evaluator, HistoryEntry, State};
use crate::config::{Config, Variable};
use crate::engine::{Engine, RunResult};
use crate::Result;
use anyhow::bail;
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;
use std::f64::consts::PI;

/// Below this exponent exp() underflows to zero anyway; skip the call.
const EXP_UNDERFLOW: f64 = -700.0;

pub struct AnnealingOptimizer {
    eval: Evaluator,
    search: Vec<Variable>,
    rng: Xoshiro256PlusPlus,
    /// Cached second output of the Box-Muller transform
    spare_normal: Option<f64>,
}

impl AnnealingOptimizer {
    pub fn new(engine: Box<dyn Engine>, cfg: Config) -> Self {
        let seed = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        Self::with_seed(engine, cfg, seed)
    }

    pub fn with_seed(engine: Box<dyn Engine>, cfg: Config, seed: u64) -> Self {
        let search = cfg.search.clone();
        Self {
            eval: Evaluator::new(engine, cfg),
            search,
            rng: Xoshiro256PlusPlus::seed_from_u64(seed),
            spare_normal: None,
        }
    }

    pub fn optimize(&mut self) -> Result<(State, RunResult)> {
        if self.search.is_empty() {
            bail!("no search variables configured");
        }

        let settings = self.eval.config().settings.clone();
        let initial_temp = settings.initial_temp;
        let cooling_rate = settings.cooling_rate;
        let min_temp = settings.min_temp;
        let steps_per_temp = settings.steps_per_temp;
        let restart_interval = settings.restart_interval;

        let mut current = self.random_state();
        let (current_result, mut current_score, reason) = self.eval.evaluate(&current)?;

        let mut best = current.clone();
        let mut best_score = current_score;
        let mut best_result = current_result.clone();

        println!(
            "Initial state: {:?}, score: {:.2} ({}), temp: {:.1}{}",
            current,
            current_score,
            self.eval.format_metrics(&current_result),
            initial_temp,
            reason.map(|r| format!(" [{}]", r)).unwrap_or_default()
        );

        let mut temp = initial_temp;
        let mut step = 0u64;
        let mut steps_since_improvement = 0u32;

        while temp > min_temp {
            for _ in 0..steps_per_temp {
                step += 1;
                steps_since_improvement += 1;

                let neighbor = self.neighbor(&current, temp / initial_temp);
                let (result, score, reason) = self.eval.evaluate(&neighbor)?;

                let delta = score - current_score;
                let acceptance = if delta > 0.0 {
                    1.0
                } else {
                    let exponent = delta / temp;
                    if exponent < EXP_UNDERFLOW {
                        0.0
                    } else {
                        exponent.exp()
                    }
                };

                let mut status = "rejected";
                if acceptance > self.rng.gen::<f64>() {
                    current = neighbor.clone();
                    current_score = score;
                    status = "accepted";

                    if score > best_score {
                        best = neighbor.clone();
                        best_score = score;
                        best_result = result.clone();
                        status = "new best";
                        steps_since_improvement = 0;
                    }
                }

                println!(
                    "[step {:3}] T={:7.2} {:?} => score: {:8.2} ({}) [{}]",
                    step,
                    temp,
                    neighbor,
                    score,
                    self.eval.format_metrics(&result),
                    reason.as_deref().unwrap_or(status)
                );

                if restart_interval > 0 && steps_since_improvement >= restart_interval {
                    current = best.clone();
                    current_score = best_score;
                    steps_since_improvement = 0;
                    println!("--- restarting from best state: {:?} ---", best);
                }
            }

            temp *= cooling_rate;
        }

        Ok((best, best_result))
    }

    /// Uniformly random state over every variable's domain
    fn random_state(&mut self) -> State {
        let mut state = State::new();
        for v in &self.search {
            let value = if !v.values.is_empty() {
                v.values[self.rng.gen_range(0..v.values.len())]
            } else {
                match v.range {
                    Some([lo, hi]) => self.rng.gen_range(lo..=hi),
                    None => 0,
                }
            };
            state.insert(v.name.clone(), value);
        }
        state
    }

    /// Perturb one random variable
    ///
    /// Ranged variables take a Gaussian jump scaled by the temperature
    /// ratio (full span at T0, down to a minimum magnitude of one step),
    /// clamped into the range. Enumerated variables re-roll uniformly.
    fn neighbor(&mut self, state: &State, temp_ratio: f64) -> State {
        let mut next = state.clone();
        let index = self.rng.gen_range(0..self.search.len());
        let v = self.search[index].clone();

        if !v.values.is_empty() {
            next.insert(v.name.clone(), v.values[self.rng.gen_range(0..v.values.len())]);
            return next;
        }

        let [lo, hi] = match v.range {
            Some(range) => range,
            None => return next,
        };
        let span = (hi - lo) as f64;
        let max_jump = (span * temp_ratio).max(1.0);

        let mut jump = (self.standard_normal() * max_jump) as i64;
        if jump == 0 {
            jump = if self.rng.gen_bool(0.5) { 1 } else { -1 };
        }

        let value = (state[&v.name] + jump).clamp(lo, hi);
        next.insert(v.name.clone(), value);
        next
    }

    /// Standard normal via the Box-Muller transform, caching the spare
    fn standard_normal(&mut self) -> f64 {
        if let Some(spare) = self.spare_normal.take() {
            return spare;
        }
        let u1: f64 = self.rng.gen();
        let u2: f64 = self.rng.gen();
        let r = (-2.0 * u1.max(f64::MIN_POSITIVE).ln()).sqrt();
        let theta = 2.0 * PI * u2;
        self.spare_normal = Some(r * theta.sin());
        r * theta.cos()
    }

    pub fn history(&self) -> &[HistoryEntry] {
        self.eval.history()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Metric, Objective, ObjectiveType, OptimizerKind, Settings};
    use crate::engine::mock::MockEngine;

    fn config(search: Vec<Variable>, settings: Settings) -> Config {
        Config {
            target: "/tmp/jolt-test.dat".into(),
            optimizer: OptimizerKind::SimulatedAnnealing,
            settings,
            search,
            objectives: vec![Objective {
                kind: ObjectiveType::Maximize,
                metric: Metric::Iops,
                limit: None,
            }],
        }
    }

    fn quick_settings() -> Settings {
        Settings {
            initial_temp: 100.0,
            cooling_rate: 0.9,
            min_temp: 0.1,
            steps_per_temp: 2,
            restart_interval: 10,
            ..Settings::default()
        }
    }

    fn workers_range() -> Variable {
        Variable {
            name: "workers".into(),
            values: vec![],
            range: Some([1, 8]),
            step: 0,
        }
    }

    #[test]
    fn test_reaches_saturation_plateau() {
        let engine = MockEngine::saturating(1000.0, 4000.0);
        let mut optimizer = AnnealingOptimizer::with_seed(
            Box::new(engine),
            config(vec![workers_range()], quick_settings()),
            42,
        );

        let (best_state, best_result) = optimizer.optimize().unwrap();
        assert!((4..=8).contains(&best_state["workers"]));
        assert_eq!(best_result.iops, 4000.0);
        assert!(!optimizer.history().is_empty());
    }

    #[test]
    fn test_random_state_within_domains() {
        let engine = MockEngine::saturating(1000.0, 4000.0);
        let search = vec![workers_range(), Variable {
            name: "block_size".into(),
            values: vec![4096, 8192],
            range: None,
            step: 0,
        }];
        let mut optimizer = AnnealingOptimizer::with_seed(
            Box::new(engine),
            config(search, quick_settings()),
            7,
        );

        for _ in 0..100 {
            let state = optimizer.random_state();
            assert!((1..=8).contains(&state["workers"]));
            assert!([4096, 8192].contains(&state["block_size"]));
        }
    }

    #[test]
    fn test_neighbor_stays_clamped_and_always_moves() {
        let engine = MockEngine::saturating(1000.0, 4000.0);
        let mut optimizer = AnnealingOptimizer::with_seed(
            Box::new(engine),
            config(vec![workers_range()], quick_settings()),
            11,
        );

        let mut state = State::new();
        state.insert("workers".into(), 8);
        for ratio in [1.0, 0.5, 0.01] {
            for _ in 0..50 {
                let next = optimizer.neighbor(&state, ratio);
                let value = next["workers"];
                assert!((1..=8).contains(&value));
            }
        }
    }

    #[test]
    fn test_standard_normal_is_roughly_centered() {
        let engine = MockEngine::saturating(1000.0, 4000.0);
        let mut optimizer = AnnealingOptimizer::with_seed(
            Box::new(engine),
            config(vec![workers_range()], quick_settings()),
            13,
        );

        let n = 10_000;
        let sum: f64 = (0..n).map(|_| optimizer.standard_normal()).sum();
        let mean = sum / n as f64;
        assert!(mean.abs() < 0.05, "mean = {}", mean);
    }
}
