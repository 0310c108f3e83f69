use std::collections::BTreeMap;

/// Aggregate segmentation scores derived from a confusion matrix.
#[derive(Debug, Clone, Copy)]
pub struct Scores {
    pub overall_acc: f64,
    pub mean_acc: f64,
    pub freq_weighted_acc: f64,
    pub mean_iou: f64,
}

impl Scores {
    /// Named entries in logging order.
    pub fn entries(&self) -> [(&'static str, f64); 4] {
        [
            ("Overall Acc", self.overall_acc),
            ("Mean Acc", self.mean_acc),
            ("FreqW Acc", self.freq_weighted_acc),
            ("Mean IoU", self.mean_iou),
        ]
    }
}

/// Running confusion matrix over `n_class` classes.
///
/// Rows are ground truth, columns are predictions. Ground-truth values outside
/// `[0, n_class)` (e.g. the ignore index) are skipped.
#[derive(Debug, Clone)]
pub struct RunningScore {
    n_class: usize,
    confusion: Vec<u64>,
}

impl RunningScore {
    pub fn new(n_class: usize) -> Self {
        RunningScore {
            n_class,
            confusion: vec![0; n_class * n_class],
        }
    }

    pub fn n_class(&self) -> usize {
        self.n_class
    }

    /// Accumulate `(ground truth, prediction)` pairs.
    pub fn update(&mut self, gt: &[i64], pred: &[i64]) {
        let n = self.n_class as i64;
        for (&t, &p) in gt.iter().zip(pred) {
            if t < 0 || t >= n || p < 0 || p >= n {
                continue;
            }
            self.confusion[(t * n + p) as usize] += 1;
        }
    }

    pub fn count(&self, gt: usize, pred: usize) -> u64 {
        self.confusion[gt * self.n_class + pred]
    }

    /// Compute aggregate scores and per-class IoU.
    ///
    /// Classes that never appear in either ground truth or predictions have
    /// an undefined (NaN) IoU and are excluded from the means.
    pub fn get_scores(&self) -> (Scores, BTreeMap<usize, f64>) {
        let n = self.n_class;
        let mut row_sum = vec![0u64; n];
        let mut col_sum = vec![0u64; n];
        let mut diag = vec![0u64; n];
        for t in 0..n {
            for p in 0..n {
                let c = self.confusion[t * n + p];
                row_sum[t] += c;
                col_sum[p] += c;
                if t == p {
                    diag[t] = c;
                }
            }
        }
        let total: u64 = row_sum.iter().sum();

        let overall_acc = ratio(diag.iter().sum(), total);
        let class_acc: Vec<f64> = (0..n).map(|i| ratio(diag[i], row_sum[i])).collect();
        let iou: Vec<f64> = (0..n)
            .map(|i| ratio(diag[i], row_sum[i] + col_sum[i] - diag[i]))
            .collect();

        let freq_weighted_acc = (0..n)
            .filter(|&i| row_sum[i] > 0)
            .map(|i| row_sum[i] as f64 / total as f64 * iou[i])
            .sum();

        let scores = Scores {
            overall_acc,
            mean_acc: nan_mean(&class_acc),
            freq_weighted_acc,
            mean_iou: nan_mean(&iou),
        };
        let class_iou = iou.into_iter().enumerate().collect();
        (scores, class_iou)
    }

    pub fn reset(&mut self) {
        self.confusion.iter_mut().for_each(|c| *c = 0);
    }
}

fn ratio(num: u64, den: u64) -> f64 {
    if den == 0 {
        f64::NAN
    } else {
        num as f64 / den as f64
    }
}

fn nan_mean(values: &[f64]) -> f64 {
    let valid: Vec<f64> = values.iter().copied().filter(|v| !v.is_nan()).collect();
    if valid.is_empty() {
        return f64::NAN;
    }
    valid.iter().sum::<f64>() / valid.len() as f64
}

/// Running average of a scalar (timings, losses).
#[derive(Debug, Clone, Default)]
pub struct AverageMeter {
    pub val: f64,
    pub sum: f64,
    pub count: usize,
    pub avg: f64,
}

impl AverageMeter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `val` observed `n` times.
    pub fn update(&mut self, val: f64, n: usize) {
        self.val = val;
        self.sum += val * n as f64;
        self.count += n;
        if self.count > 0 {
            self.avg = self.sum / self.count as f64;
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_perfect_prediction() {
        let mut s = RunningScore::new(3);
        let gt = [0, 1, 2, 2];
        s.update(&gt, &gt);
        let (scores, class_iou) = s.get_scores();
        assert!((scores.overall_acc - 1.0).abs() < 1e-12);
        assert!((scores.mean_iou - 1.0).abs() < 1e-12);
        assert_eq!(class_iou.len(), 3);
    }

    #[test]
    fn test_mean_iou_is_mean_of_class_iou() {
        let mut s = RunningScore::new(2);
        // class 0: tp=2 fp=1 fn=1 -> 2/4 ; class 1: tp=1 fp=1 fn=1 -> 1/3
        s.update(&[0, 0, 0, 1, 1], &[0, 0, 1, 0, 1]);
        let (scores, class_iou) = s.get_scores();
        assert!((class_iou[&0] - 0.5).abs() < 1e-12);
        assert!((class_iou[&1] - 1.0 / 3.0).abs() < 1e-12);
        let expected = (0.5 + 1.0 / 3.0) / 2.0;
        assert!((scores.mean_iou - expected).abs() < 1e-12);
        assert!((scores.overall_acc - 3.0 / 5.0).abs() < 1e-12);
    }

    #[test]
    fn test_ignored_labels_are_skipped() {
        let mut s = RunningScore::new(2);
        s.update(&[0, 250, -1, 1], &[0, 1, 1, 1]);
        assert_eq!(s.count(0, 0), 1);
        assert_eq!(s.count(1, 1), 1);
        assert_eq!(s.count(0, 1) + s.count(1, 0), 0);
    }

    #[test]
    fn test_absent_class_excluded_from_mean() {
        let mut s = RunningScore::new(3);
        s.update(&[0, 1], &[0, 1]);
        let (scores, class_iou) = s.get_scores();
        assert!(class_iou[&2].is_nan());
        assert!((scores.mean_iou - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_empty_matrix_is_nan() {
        let s = RunningScore::new(4);
        let (scores, _) = s.get_scores();
        assert!(scores.mean_iou.is_nan());
    }

    #[test]
    fn test_reset_clears_counts() {
        let mut s = RunningScore::new(2);
        s.update(&[0, 1], &[1, 0]);
        s.reset();
        assert_eq!(s.count(0, 1), 0);
        assert_eq!(s.count(1, 0), 0);
    }

    #[test]
    fn test_average_meter() {
        let mut m = AverageMeter::new();
        m.update(2.0, 1);
        m.update(4.0, 3);
        assert_eq!(m.count, 4);
        assert!((m.avg - 3.5).abs() < 1e-12);
        assert!((m.val - 4.0).abs() < 1e-12);
    }

    #[test]
    fn test_average_meter_reset() {
        let mut m = AverageMeter::new();
        m.update(0.3, 1);
        m.reset();
        assert_eq!(m.count, 0);
        assert_eq!(m.avg, 0.0);
        assert_eq!(m.sum, 0.0);
    }
}
