use burn::prelude::*;
use burn::tensor::activation::log_softmax;

use super::networks::upsample_bilinear;

/// Pixel-wise cross-entropy, averaged over labelled pixels.
///
/// `logits` is `[batch, n_class, h, w]` and is resized to the label
/// resolution first. Labels outside `0..n_class` (including the ignore
/// value) contribute nothing; a batch with no labelled pixel yields zero.
pub fn cross_entropy_2d<B: Backend>(logits: Tensor<B, 4>, labels: Tensor<B, 3, Int>) -> Tensor<B, 1> {
    let [_, n_class, _, _] = logits.dims();
    let [_, h, w] = labels.dims();
    let logits = upsample_bilinear(logits, [h, w]);

    let valid = labels
        .clone()
        .lower_elem(n_class as i64)
        .bool_and(labels.clone().greater_equal_elem(0));
    let safe = labels.mask_fill(valid.clone().bool_not(), 0);

    let log_probs = log_softmax(logits, 1);
    let picked: Tensor<B, 3> = log_probs.gather(1, safe.unsqueeze_dim(1)).squeeze(1);
    let weight = valid.float();

    let denom = weight.clone().sum().clamp_min(1.0);
    (picked * weight).sum().neg() / denom
}

/// Binary cross-entropy on logits against a constant target, averaged.
pub fn bce_with_logits<B: Backend, const D: usize>(x: Tensor<B, D>, target: f32) -> Tensor<B, 1> {
    let softplus_neg_abs = x.clone().abs().neg().exp().log1p();
    (x.clone().clamp_min(0.0) - x.mul_scalar(target) + softplus_neg_abs).mean()
}

/// Cross-entropy between `student` logits and a target distribution over
/// the class axis, averaged over pixels.
pub fn soft_cross_entropy<B: Backend>(student: Tensor<B, 4>, target: Tensor<B, 4>) -> Tensor<B, 1> {
    let [_, _, h, w] = target.dims();
    let student = upsample_bilinear(student, [h, w]);
    (target * log_softmax(student, 1)).sum_dim(1).mean().neg()
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::TensorData;

    type TestBackend = NdArray<f32>;

    fn scalar(t: Tensor<TestBackend, 1>) -> f32 {
        t.into_scalar()
    }

    #[test]
    fn test_uniform_logits_give_log_n_class() {
        let device = Default::default();
        let logits = Tensor::<TestBackend, 4>::zeros([1, 4, 2, 2], &device);
        let labels = Tensor::<TestBackend, 3, Int>::from_data(
            TensorData::new(vec![0i64, 1, 2, 3], [1, 2, 2]).convert::<i64>(),
            &device,
        );
        let loss = scalar(cross_entropy_2d(logits, labels));
        assert!((loss - 4f32.ln()).abs() < 1e-5, "loss = {loss}");
    }

    #[test]
    fn test_ignored_pixels_do_not_count() {
        let device = Default::default();
        // Class 0 strongly predicted everywhere.
        let logits = Tensor::<TestBackend, 4>::from_data(
            TensorData::new(vec![10.0f32, 10.0, -10.0, -10.0], [1, 2, 1, 2]),
            &device,
        );
        let labels = Tensor::<TestBackend, 3, Int>::from_data(
            TensorData::new(vec![0i64, 250], [1, 1, 2]).convert::<i64>(),
            &device,
        );
        let loss = scalar(cross_entropy_2d(logits, labels));
        assert!(loss < 1e-3, "loss = {loss}");
    }

    #[test]
    fn test_all_ignored_is_zero() {
        let device = Default::default();
        let logits = Tensor::<TestBackend, 4>::ones([1, 3, 2, 2], &device);
        let labels = Tensor::<TestBackend, 3, Int>::full([1, 2, 2], 250, &device);
        assert_eq!(scalar(cross_entropy_2d(logits, labels)), 0.0);
    }

    #[test]
    fn test_bce_at_zero_is_ln2() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 4>::zeros([1, 1, 2, 2], &device);
        let real = scalar(bce_with_logits(x.clone(), 1.0));
        let fake = scalar(bce_with_logits(x, 0.0));
        assert!((real - 2f32.ln()).abs() < 1e-5);
        assert!((fake - 2f32.ln()).abs() < 1e-5);
    }

    #[test]
    fn test_soft_cross_entropy_uniform() {
        let device = Default::default();
        let student = Tensor::<TestBackend, 4>::zeros([2, 5, 3, 3], &device);
        let target = Tensor::<TestBackend, 4>::full([2, 5, 3, 3], 0.2, &device);
        let loss = scalar(soft_cross_entropy(student, target));
        assert!((loss - 5f32.ln()).abs() < 1e-5);
    }
}
