//! Sweep: evaluate every point of one variable and find the knee
//!
//! Exactly one search variable may span multiple values (a range or a
//! multi-element list); the rest are pinned to their first value. Every
//! step flows through the evaluator so the history and report come for
//! free, and the collected (value, IOPS) points feed Kneedle.

use crate::analyze::{find_knee, Point};
use crate::config::{Config, Variable};
use crate::engine::Engine;
use crate::optimize::{Evaluator, HistoryEntry, State};
use crate::util::time::format_duration;
use crate::Result;
use anyhow::bail;

pub struct Sweeper {
    eval: Evaluator,
    search: Vec<Variable>,
}

impl Sweeper {
    pub fn new(engine: Box<dyn Engine>, cfg: Config) -> Self {
        let search = cfg.search.clone();
        Self {
            eval: Evaluator::new(engine, cfg),
            search,
        }
    }

    pub fn run(&mut self) -> Result<(Vec<HistoryEntry>, Option<Point>)> {
        let mut state = State::new();
        let mut sweep_var: Option<Variable> = None;

        for v in &self.search {
            state.insert(v.name.clone(), v.first_value());
            if v.is_sweepable() {
                match &sweep_var {
                    None => sweep_var = Some(v.clone()),
                    Some(first) => {
                        println!(
                            "Warning: multiple sweep variables; sweeping '{}', pinning '{}' to {}",
                            first.name,
                            v.name,
                            v.first_value()
                        );
                    }
                }
            }
        }

        let sweep_var = match sweep_var {
            Some(v) => v,
            None => bail!("no variable defined with a range or multiple values to sweep"),
        };

        println!("Sweeping variable '{}' to find the knee...", sweep_var.name);

        let steps = sweep_steps(&sweep_var);
        let mut points = Vec::with_capacity(steps.len());

        for (i, value) in steps.iter().enumerate() {
            state.insert(sweep_var.name.clone(), *value);

            let (result, _score, _reason) = self.eval.evaluate(&state)?;
            println!(
                "[{}/{}] {}={} -> IOPS: {:.0}, P99: {}",
                i + 1,
                steps.len(),
                sweep_var.name,
                value,
                result.iops,
                format_duration(result.p99_latency)
            );

            points.push(Point {
                x: *value as f64,
                y: result.iops,
            });
        }

        Ok((self.eval.history().to_vec(), find_knee(&points)))
    }
}

/// Candidate values of the sweep variable, in order
fn sweep_steps(v: &Variable) -> Vec<i64> {
    if !v.values.is_empty() {
        return v.values.clone();
    }
    let [lo, hi] = v.range.unwrap_or([0, 0]);
    let step = if v.step > 0 { v.step } else { 1 };
    let mut steps = Vec::new();
    let mut value = lo;
    while value <= hi {
        steps.push(value);
        value += step;
    }
    steps
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Metric, Objective, ObjectiveType, OptimizerKind, Settings};
    use crate::engine::mock::MockEngine;

    fn config(search: Vec<Variable>) -> Config {
        Config {
            target: "/tmp/jolt-test.dat".into(),
            optimizer: OptimizerKind::Coordinate,
            settings: Settings::default(),
            search,
            objectives: vec![Objective {
                kind: ObjectiveType::Maximize,
                metric: Metric::Iops,
                limit: None,
            }],
        }
    }

    #[test]
    fn test_sweep_finds_knee_of_saturating_curve() {
        let engine = MockEngine::saturating(1000.0, 4000.0);
        let search = vec![Variable {
            name: "workers".into(),
            values: vec![],
            range: Some([1, 8]),
            step: 1,
        }];
        let mut sweeper = Sweeper::new(Box::new(engine), config(search));

        let (history, knee) = sweeper.run().unwrap();
        assert_eq!(history.len(), 8);
        assert_eq!(knee.unwrap().x, 4.0);
    }

    #[test]
    fn test_sweep_pins_secondary_variables() {
        let engine = MockEngine::new(|params| {
            assert_eq!(params.queue_depth, 8);
            MockEngine::result_with_iops(1000.0 * params.workers as f64, params)
        });
        let search = vec![
            Variable {
                name: "workers".into(),
                values: vec![1, 2, 4],
                range: None,
                step: 0,
            },
            Variable {
                name: "queue_depth".into(),
                values: vec![8],
                range: None,
                step: 0,
            },
        ];
        let mut sweeper = Sweeper::new(Box::new(engine), config(search));

        let (history, _knee) = sweeper.run().unwrap();
        assert_eq!(history.len(), 3);
    }

    #[test]
    fn test_sweep_without_sweepable_variable_fails() {
        let engine = MockEngine::saturating(1000.0, 4000.0);
        let search = vec![Variable {
            name: "workers".into(),
            values: vec![4],
            range: None,
            step: 0,
        }];
        let mut sweeper = Sweeper::new(Box::new(engine), config(search));
        assert!(sweeper.run().is_err());
    }

    #[test]
    fn test_sweep_steps_respect_step_size() {
        let v = Variable {
            name: "queue_depth".into(),
            values: vec![],
            range: Some([2, 10]),
            step: 4,
        };
        assert_eq!(sweep_steps(&v), vec![2, 6, 10]);
    }
}
