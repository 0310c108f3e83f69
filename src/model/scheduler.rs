use std::path::Path;

use crate::config::SchedulerKind;
use crate::error::ModelError;

/// Per-network learning-rate schedule, advanced once per training iteration.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct LrScheduler {
    pub kind: SchedulerKind,
    pub base_lr: f64,
    pub power: f64,
    pub max_iters: usize,
    pub step: usize,
}

impl LrScheduler {
    pub fn new(kind: SchedulerKind, base_lr: f64, power: f64, max_iters: usize) -> Self {
        LrScheduler {
            kind,
            base_lr,
            power,
            max_iters,
            step: 0,
        }
    }

    /// Learning rate for the current step.
    ///
    /// `Poly` decays as `base_lr * (1 - step / max_iters)^power` and stays at
    /// zero once `step` reaches `max_iters`.
    pub fn lr(&self) -> f64 {
        match self.kind {
            SchedulerKind::Constant => self.base_lr,
            SchedulerKind::Poly => {
                if self.max_iters == 0 {
                    return self.base_lr;
                }
                let t = (self.step as f64 / self.max_iters as f64).min(1.0);
                self.base_lr * (1.0 - t).powf(self.power)
            }
        }
    }

    pub fn step(&mut self) {
        self.step += 1;
    }

    pub fn save(&self, path: &Path) -> Result<(), ModelError> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, ModelError> {
        let json = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_constant_ignores_step() {
        let mut s = LrScheduler::new(SchedulerKind::Constant, 0.01, 0.9, 10);
        for _ in 0..20 {
            s.step();
        }
        assert_eq!(s.lr(), 0.01);
    }

    #[test]
    fn test_poly_decay() {
        let mut s = LrScheduler::new(SchedulerKind::Poly, 1.0, 1.0, 4);
        assert_eq!(s.lr(), 1.0);
        s.step();
        assert!((s.lr() - 0.75).abs() < 1e-12);
        for _ in 0..10 {
            s.step();
        }
        assert_eq!(s.lr(), 0.0);
    }

    #[test]
    fn test_save_load() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("sched.json");
        let mut s = LrScheduler::new(SchedulerKind::Poly, 2.5e-4, 0.9, 1000);
        s.step();
        s.step();
        s.save(&path).unwrap();
        assert_eq!(LrScheduler::load(&path).unwrap(), s);
    }
}
