//! Confusion-matrix scores of binary segmentation.

use crate::{common::*, Error};

/// The small constant that guards every ratio against a zero denominator.
pub const EPSILON: f64 = 1e-6;

/// Probabilities above this value count as positive predictions.
pub const THRESHOLD: f64 = 0.5;

/// Pixel counts of one sample.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ConfusionCounts {
    pub tp: f64,
    pub fp: f64,
    pub tn: f64,
    pub fn_: f64,
}

impl ConfusionCounts {
    /// The scores of this sample, as a batch of one.
    pub fn to_metrics(&self) -> BatchMetrics {
        let Self { tp, fp, tn, fn_ } = *self;

        let total = tp + fp + tn + fn_;
        let accuracy = if total > 0.0 { (tp + tn) / total } else { 0.0 };
        let sensitivity = tp / (tp + fn_ + EPSILON);
        let specificity = tn / (tn + fp + EPSILON);
        let precision = tp / (tp + fp + EPSILON);
        let f1 = 2.0 * sensitivity * precision / (sensitivity + precision + EPSILON);
        let jaccard = tp / (tp + fp + fn_ + EPSILON);
        let dice = 2.0 * tp / ((tp + fp) + (tp + fn_) + EPSILON);

        BatchMetrics {
            accuracy,
            sensitivity,
            specificity,
            precision,
            f1,
            jaccard,
            dice,
            num_samples: 1,
        }
    }
}

/// Per-sample scores summed over a batch.
///
/// The default value is the empty sum, so batches and epochs accumulate by
/// plain addition.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BatchMetrics {
    pub accuracy: f64,
    pub sensitivity: f64,
    pub specificity: f64,
    pub precision: f64,
    pub f1: f64,
    pub jaccard: f64,
    pub dice: f64,
    pub num_samples: usize,
}

impl BatchMetrics {
    /// Score a batch of predicted probabilities against the ground truth.
    ///
    /// Both tensors have the batch in the first dimension and equal shapes.
    /// The ground truth is binary; values above 0.5 are foreground.
    pub fn score(probability: &Tensor, ground_truth: &Tensor) -> Result<Self> {
        let counts = confusion_counts(probability, ground_truth)?;
        Ok(counts.iter().map(ConfusionCounts::to_metrics).sum())
    }

    pub fn combine(self, other: Self) -> Self {
        Self {
            accuracy: self.accuracy + other.accuracy,
            sensitivity: self.sensitivity + other.sensitivity,
            specificity: self.specificity + other.specificity,
            precision: self.precision + other.precision,
            f1: self.f1 + other.f1,
            jaccard: self.jaccard + other.jaccard,
            dice: self.dice + other.dice,
            num_samples: self.num_samples + other.num_samples,
        }
    }
}

impl Add for BatchMetrics {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        self.combine(rhs)
    }
}

impl AddAssign for BatchMetrics {
    fn add_assign(&mut self, rhs: Self) {
        *self = self.combine(rhs);
    }
}

impl Sum for BatchMetrics {
    fn sum<I>(iter: I) -> Self
    where
        I: Iterator<Item = Self>,
    {
        iter.fold(Self::default(), Self::combine)
    }
}

/// Compute the confusion counts of each sample in the batch.
pub fn confusion_counts(
    probability: &Tensor,
    ground_truth: &Tensor,
) -> Result<Vec<ConfusionCounts>> {
    let prob_shape = probability.size();
    let gt_shape = ground_truth.size();
    ensure!(
        prob_shape == gt_shape,
        "prediction shape {:?} does not match ground truth shape {:?}",
        prob_shape,
        gt_shape
    );
    ensure!(
        !prob_shape.is_empty(),
        "expect a batch dimension, but get a scalar"
    );
    let batch_size = prob_shape[0];
    if batch_size == 0 {
        return Ok(vec![]);
    }
    ensure!(
        probability.numel() > 0,
        "every sample must have at least one pixel"
    );

    let counts = tch::no_grad(|| {
        let pred = probability
            .to_kind(Kind::Float)
            .gt(THRESHOLD)
            .reshape(&[batch_size, -1]);
        let gt = ground_truth
            .to_kind(Kind::Float)
            .gt(THRESHOLD)
            .reshape(&[batch_size, -1]);
        let not_pred = pred.logical_not();
        let not_gt = gt.logical_not();

        let count = |lhs: &Tensor, rhs: &Tensor| -> Vec<f64> {
            lhs.logical_and(rhs)
                .sum_dim_intlist(&[1], false, Kind::Double)
                .to_device(Device::Cpu)
                .into()
        };

        let tp = count(&pred, &gt);
        let fp = count(&pred, &not_gt);
        let tn = count(&not_pred, &not_gt);
        let fn_ = count(&not_pred, &gt);

        izip!(tp, fp, tn, fn_)
            .map(|(tp, fp, tn, fn_)| ConfusionCounts { tp, fp, tn, fn_ })
            .collect()
    });

    Ok(counts)
}

/// The averaged scores of one epoch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EpochReport {
    pub accuracy: f64,
    pub sensitivity: f64,
    pub specificity: f64,
    pub precision: f64,
    pub f1: f64,
    pub jaccard: f64,
    pub dice: f64,
    /// The loss averaged over batches.
    pub loss: f64,
    pub num_samples: usize,
    pub num_batches: usize,
}

impl EpochReport {
    /// Divide the metric sums by the number of samples and the loss sum by
    /// the number of batches.
    pub fn from_sums(sums: &BatchMetrics, loss_sum: f64, num_batches: usize) -> Result<Self> {
        let BatchMetrics {
            accuracy,
            sensitivity,
            specificity,
            precision,
            f1,
            jaccard,
            dice,
            num_samples,
        } = *sums;
        if num_samples == 0 || num_batches == 0 {
            return Err(Error::configuration("the epoch processed no samples").into());
        }
        let n = num_samples as f64;

        Ok(Self {
            accuracy: accuracy / n,
            sensitivity: sensitivity / n,
            specificity: specificity / n,
            precision: precision / n,
            f1: f1 / n,
            jaccard: jaccard / n,
            dice: dice / n,
            loss: loss_sum / num_batches as f64,
            num_samples,
            num_batches,
        })
    }

    /// Jaccard similarity plus Dice coefficient.
    pub fn combined_score(&self) -> f64 {
        self.jaccard + self.dice
    }
}

/// Streaming accumulator of one epoch.
#[derive(Debug, Clone, Default)]
pub struct EpochAccumulator {
    sums: BatchMetrics,
    loss_sum: f64,
    num_batches: usize,
}

impl EpochAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_batch(&mut self, metrics: BatchMetrics, loss: f64) {
        self.sums += metrics;
        self.loss_sum += loss;
        self.num_batches += 1;
    }

    pub fn num_samples(&self) -> usize {
        self.sums.num_samples
    }

    pub fn num_batches(&self) -> usize {
        self.num_batches
    }

    pub fn finish(self) -> Result<EpochReport> {
        EpochReport::from_sums(&self.sums, self.loss_sum, self.num_batches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tensor(values: &[f32], shape: &[i64]) -> Tensor {
        Tensor::of_slice(values).view(shape)
    }

    #[test]
    fn all_ones_scores() -> Result<()> {
        let ones = Tensor::ones(&[2, 1, 4, 4], (Kind::Float, Device::Cpu));
        let metrics = BatchMetrics::score(&ones, &ones)?;

        assert_eq!(metrics.num_samples, 2);
        assert_abs_diff_eq!(metrics.accuracy, 2.0);
        assert_abs_diff_eq!(metrics.sensitivity, 2.0, epsilon = 1e-6);
        assert_abs_diff_eq!(metrics.specificity, 0.0);
        assert_abs_diff_eq!(metrics.precision, 2.0, epsilon = 1e-6);
        assert_abs_diff_eq!(metrics.f1, 2.0, epsilon = 1e-5);
        assert_abs_diff_eq!(metrics.jaccard, 2.0, epsilon = 1e-6);
        assert_abs_diff_eq!(metrics.dice, 2.0, epsilon = 1e-6);
        Ok(())
    }

    #[test]
    fn all_zeros_scores_are_defined() -> Result<()> {
        let zeros = Tensor::zeros(&[3, 1, 4, 4], (Kind::Float, Device::Cpu));
        let metrics = BatchMetrics::score(&zeros, &zeros)?;
        let values = [
            metrics.accuracy,
            metrics.sensitivity,
            metrics.specificity,
            metrics.precision,
            metrics.f1,
            metrics.jaccard,
            metrics.dice,
        ];

        assert!(values.iter().all(|value| value.is_finite()));
        assert_abs_diff_eq!(metrics.accuracy, 3.0);
        assert_abs_diff_eq!(metrics.specificity, 3.0, epsilon = 1e-6);
        assert_abs_diff_eq!(metrics.jaccard, 0.0);
        assert_abs_diff_eq!(metrics.dice, 0.0);
        Ok(())
    }

    #[test]
    fn scores_of_partial_overlap() -> Result<()> {
        // tp = 1, fp = 1, fn = 1, tn = 1
        let prob = tensor(&[0.9, 0.7, 0.2, 0.5], &[1, 1, 2, 2]);
        let gt = tensor(&[1.0, 0.0, 1.0, 0.0], &[1, 1, 2, 2]);

        let counts = confusion_counts(&prob, &gt)?;
        assert_eq!(
            counts,
            vec![ConfusionCounts {
                tp: 1.0,
                fp: 1.0,
                tn: 1.0,
                fn_: 1.0
            }]
        );

        let metrics = BatchMetrics::score(&prob, &gt)?;
        assert_abs_diff_eq!(metrics.accuracy, 0.5);
        assert_abs_diff_eq!(metrics.sensitivity, 0.5, epsilon = 1e-5);
        assert_abs_diff_eq!(metrics.specificity, 0.5, epsilon = 1e-5);
        assert_abs_diff_eq!(metrics.precision, 0.5, epsilon = 1e-5);
        assert_abs_diff_eq!(metrics.f1, 0.5, epsilon = 1e-5);
        assert_abs_diff_eq!(metrics.jaccard, 1.0 / 3.0, epsilon = 1e-5);
        assert_abs_diff_eq!(metrics.dice, 0.5, epsilon = 1e-5);
        Ok(())
    }

    #[test]
    fn samples_are_weighted_equally() -> Result<()> {
        // a perfect small-foreground sample and a missed large-foreground sample
        let prob = tensor(&[1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0], &[2, 1, 2, 2]);
        let gt = tensor(&[1.0, 0.0, 0.0, 0.0, 1.0, 1.0, 1.0, 0.0], &[2, 1, 2, 2]);

        let metrics = BatchMetrics::score(&prob, &gt)?;
        let report = EpochReport::from_sums(&metrics, 0.0, 1)?;
        assert_abs_diff_eq!(report.dice, 0.5, epsilon = 1e-5);
        assert_abs_diff_eq!(report.accuracy, (1.0 + 0.25) / 2.0);
        Ok(())
    }

    #[test]
    fn epoch_average_is_independent_of_batch_partition() -> Result<()> {
        let prob = Tensor::rand(&[10, 1, 8, 8], (Kind::Float, Device::Cpu));
        let gt = Tensor::rand(&[10, 1, 8, 8], (Kind::Float, Device::Cpu)).gt(0.7);

        let mut whole = EpochAccumulator::new();
        whole.add_batch(BatchMetrics::score(&prob, &gt)?, 1.0);
        let whole = whole.finish()?;

        let mut halves = EpochAccumulator::new();
        halves.add_batch(BatchMetrics::score(&prob.i(0..5), &gt.i(0..5))?, 1.0);
        halves.add_batch(BatchMetrics::score(&prob.i(5..10), &gt.i(5..10))?, 1.0);
        let halves = halves.finish()?;

        assert_eq!(whole.num_samples, halves.num_samples);
        assert_abs_diff_eq!(whole.accuracy, halves.accuracy, epsilon = 1e-12);
        assert_abs_diff_eq!(whole.jaccard, halves.jaccard, epsilon = 1e-12);
        assert_abs_diff_eq!(whole.dice, halves.dice, epsilon = 1e-12);
        assert_abs_diff_eq!(whole.loss, halves.loss);
        Ok(())
    }

    #[test]
    fn empty_epoch_is_rejected() {
        let err = EpochAccumulator::new().finish().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::Configuration(_))
        ));
    }

    #[test]
    fn mismatched_shapes_are_rejected() {
        let prob = Tensor::zeros(&[1, 1, 4, 4], (Kind::Float, Device::Cpu));
        let gt = Tensor::zeros(&[1, 1, 4, 5], (Kind::Float, Device::Cpu));
        assert!(BatchMetrics::score(&prob, &gt).is_err());
    }
}
