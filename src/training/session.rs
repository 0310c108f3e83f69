/// Counters that outlive a single iteration: the epoch being run, the number
/// of completed iterations and the best validation score so far.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrainingSession {
    pub epoch: usize,
    pub iter: usize,
    pub best_iou: Option<f64>,
}

impl TrainingSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark one more iteration complete and return the new count.
    pub fn advance(&mut self) -> usize {
        self.iter += 1;
        self.iter
    }

    /// Whether the completed-iteration count lands on `interval`.
    pub fn at_interval(&self, interval: usize) -> bool {
        interval > 0 && self.iter > 0 && self.iter % interval == 0
    }

    /// A score ties or beats the best so far. The first finite score always
    /// qualifies; NaN never does.
    pub fn is_new_best(&self, score: f64) -> bool {
        if score.is_nan() {
            return false;
        }
        match self.best_iou {
            None => true,
            Some(best) => score >= best,
        }
    }

    /// Record `score` if it qualifies as best. Returns whether it did.
    pub fn offer_best(&mut self, score: f64) -> bool {
        if self.is_new_best(score) {
            self.best_iou = Some(score);
            true
        } else {
            false
        }
    }
}
