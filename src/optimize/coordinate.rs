//! Coordinate-descent search
//!
//! Starts every variable at the middle of its domain, then repeatedly
//! improves one variable at a time while holding the rest fixed: enumerated
//! variables get a full scan, ranged variables a step-halving local search.
//! The outer loop ends after a full pass with no improvement. Ties keep the
//! incumbent value; only a strictly greater score moves the state.

use super::{Evaluator, HistoryEntry, State};
use crate::config::{Config, Variable};
use crate::engine::{Engine, RunResult};
use crate::Result;
use anyhow::bail;

pub struct CoordinateOptimizer {
    eval: Evaluator,
    search: Vec<Variable>,
}

impl CoordinateOptimizer {
    pub fn new(engine: Box<dyn Engine>, cfg: Config) -> Self {
        let search = cfg.search.clone();
        Self {
            eval: Evaluator::new(engine, cfg),
            search,
        }
    }

    pub fn optimize(&mut self) -> Result<(State, RunResult)> {
        if self.search.is_empty() {
            bail!("no search variables configured");
        }

        let mut current: State = self
            .search
            .iter()
            .map(|v| (v.name.clone(), v.midpoint()))
            .collect();

        let (mut best_result, mut best_score, reason) = self.eval.evaluate(&current)?;
        println!(
            "Initial state: {:?}, score: {:.2} ({}){}",
            current,
            best_score,
            self.eval.format_metrics(&best_result),
            reason.map(|r| format!(" [{}]", r)).unwrap_or_default()
        );

        loop {
            let mut improved = false;

            for variable in self.search.clone() {
                println!("Optimizing variable: {}", variable.name);

                let moved = if !variable.values.is_empty() {
                    self.scan_values(&variable, &mut current, &mut best_score, &mut best_result)?
                } else {
                    self.descend_range(&variable, &mut current, &mut best_score, &mut best_result)?
                };

                if moved {
                    println!(
                        "  -> Improved {}: now {} (score: {:.2})",
                        variable.name, current[&variable.name], best_score
                    );
                    improved = true;
                } else {
                    println!(
                        "  -> No improvement for {} (kept {})",
                        variable.name, current[&variable.name]
                    );
                }
            }

            if !improved {
                break;
            }
        }

        Ok((current, best_result))
    }

    /// Evaluate every listed value; adopt any strict improvement
    fn scan_values(
        &mut self,
        variable: &Variable,
        current: &mut State,
        best_score: &mut f64,
        best_result: &mut RunResult,
    ) -> Result<bool> {
        let mut moved = false;
        for &value in &variable.values {
            let mut candidate = current.clone();
            candidate.insert(variable.name.clone(), value);

            let (result, score, reason) = self.eval.evaluate(&candidate)?;
            println!(
                "  Testing {}={}... score: {:.2} ({}){}",
                variable.name,
                value,
                score,
                self.eval.format_metrics(&result),
                reason.map(|r| format!(" [{}]", r)).unwrap_or_default()
            );

            if score > *best_score {
                *best_score = score;
                *best_result = result;
                current.insert(variable.name.clone(), value);
                moved = true;
            }
        }
        Ok(moved)
    }

    /// Step-halving local search over an inclusive range
    ///
    /// An improving move restarts probing at the same step size from the
    /// new position; otherwise the step halves until it reaches zero.
    fn descend_range(
        &mut self,
        variable: &Variable,
        current: &mut State,
        best_score: &mut f64,
        best_result: &mut RunResult,
    ) -> Result<bool> {
        let [lo, hi] = match variable.range {
            Some(range) => range,
            None => return Ok(false),
        };

        let mut step = if variable.step > 0 {
            variable.step
        } else {
            (hi - lo) / 10
        };
        if step <= 0 {
            step = 1;
        }

        let mut moved = false;
        while step >= 1 {
            let position = current[&variable.name];
            let mut stepped = false;

            for candidate_value in [position + step, position - step] {
                if candidate_value < lo || candidate_value > hi {
                    continue;
                }
                let mut candidate = current.clone();
                candidate.insert(variable.name.clone(), candidate_value);

                let (result, score, reason) = self.eval.evaluate(&candidate)?;
                println!(
                    "  Testing {}={}... score: {:.2} ({}){}",
                    variable.name,
                    candidate_value,
                    score,
                    self.eval.format_metrics(&result),
                    reason.map(|r| format!(" [{}]", r)).unwrap_or_default()
                );

                if score > *best_score {
                    *best_score = score;
                    *best_result = result;
                    current.insert(variable.name.clone(), candidate_value);
                    stepped = true;
                    moved = true;
                    break;
                }
            }

            if !stepped {
                step /= 2;
            }
        }

        Ok(moved)
    }

    pub fn history(&self) -> &[HistoryEntry] {
        self.eval.history()
    }
}
