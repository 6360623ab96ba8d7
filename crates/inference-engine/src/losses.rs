//! Training-time loss and metric functions
//!
//! The segmentation models are trained with a composite "shape aware" loss
//! and scored with IoU. The same functions are registered by name in
//! [`CustomObjects`] so loaders that rebuild training graphs can resolve them,
//! and so predictions can be scored against ground-truth masks.

use std::collections::BTreeMap;
use std::fmt;

use ndarray::{s, ArrayView2, Zip};

/// Loss or metric over (ground truth, prediction)
pub type ObjectiveFn = fn(ArrayView2<'_, f32>, ArrayView2<'_, f32>) -> f32;

const SMOOTH: f32 = 1e-6;
const FOCAL_GAMMA: f32 = 2.0;
const FOCAL_ALPHA: f32 = 0.25;
const SHAPE_WEIGHT: f32 = 0.9;
const BCE_EPSILON: f32 = 1e-7;

/// Soft Dice loss
pub fn dice_loss(truth: ArrayView2<'_, f32>, pred: ArrayView2<'_, f32>) -> f32 {
    let intersection: f32 = Zip::from(&truth).and(&pred).fold(0.0, |acc, &t, &p| acc + t * p);
    1.0 - (2.0 * intersection + SMOOTH) / (truth.sum() + pred.sum() + SMOOTH)
}

/// Focal loss on binary cross-entropy
pub fn focal_loss(truth: ArrayView2<'_, f32>, pred: ArrayView2<'_, f32>) -> f32 {
    let n = truth.len().max(1) as f32;
    let total: f32 = Zip::from(&truth).and(&pred).fold(0.0, |acc, &t, &p| {
        let p = p.clamp(BCE_EPSILON, 1.0 - BCE_EPSILON);
        let bce = -(t * p.ln() + (1.0 - t) * (1.0 - p).ln());
        acc + FOCAL_ALPHA * (1.0 - (-bce).exp()).powf(FOCAL_GAMMA) * bce
    });
    total / n
}

/// Intersection over union with the prediction thresholded at 0.5
pub fn iou_metric(truth: ArrayView2<'_, f32>, pred: ArrayView2<'_, f32>) -> f32 {
    let (intersection, pred_sum) = Zip::from(&truth)
        .and(&pred)
        .fold((0.0f32, 0.0f32), |(inter, psum), &t, &p| {
            let p = if p > 0.5 { 1.0 } else { 0.0 };
            (inter + t * p, psum + p)
        });
    let union = truth.sum() + pred_sum - intersection;
    (intersection + SMOOTH) / (union + SMOOTH)
}

/// Mean absolute difference of forward image gradients
///
/// The last row of the vertical gradient and the last column of the
/// horizontal gradient are zero, so they are included as zeros in the mean.
pub fn gradient_loss(truth: ArrayView2<'_, f32>, pred: ArrayView2<'_, f32>) -> f32 {
    let (h, w) = truth.dim();
    if h == 0 || w == 0 {
        return 0.0;
    }

    let mut total = 0.0f32;
    if h > 1 {
        let dy_truth = &truth.slice(s![1.., ..]) - &truth.slice(s![..-1, ..]);
        let dy_pred = &pred.slice(s![1.., ..]) - &pred.slice(s![..-1, ..]);
        total += Zip::from(&dy_truth).and(&dy_pred).fold(0.0, |acc, &a, &b| acc + (a - b).abs());
    }
    if w > 1 {
        let dx_truth = &truth.slice(s![.., 1..]) - &truth.slice(s![.., ..-1]);
        let dx_pred = &pred.slice(s![.., 1..]) - &pred.slice(s![.., ..-1]);
        total += Zip::from(&dx_truth).and(&dx_pred).fold(0.0, |acc, &a, &b| acc + (a - b).abs());
    }
    total / (h * w) as f32
}

/// Dice + focal + weighted gradient term
pub fn shape_aware_loss(truth: ArrayView2<'_, f32>, pred: ArrayView2<'_, f32>) -> f32 {
    dice_loss(truth, pred) + focal_loss(truth, pred) + SHAPE_WEIGHT * gradient_loss(truth, pred)
}

/// Name to function registry of custom training symbols
#[derive(Clone, Default)]
pub struct CustomObjects {
    objects: BTreeMap<String, ObjectiveFn>,
}

impl fmt::Debug for CustomObjects {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.objects.keys()).finish()
    }
}

impl CustomObjects {
    /// Registry with the symbols the segmentation models are trained with
    pub fn with_defaults() -> Self {
        let mut objects = Self::default();
        objects.register("shape_aware_loss", shape_aware_loss);
        objects.register("iou_metric", iou_metric);
        objects.register("dice_loss", dice_loss);
        objects.register("focal_loss", focal_loss);
        objects.register("gradient_loss", gradient_loss);
        objects
    }

    pub fn register(&mut self, name: &str, function: ObjectiveFn) {
        self.objects.insert(name.to_string(), function);
    }

    pub fn get(&self, name: &str) -> Option<ObjectiveFn> {
        self.objects.get(name).copied()
    }

    pub fn names(&self) -> Vec<&str> {
        self.objects.keys().map(String::as_str).collect()
    }

    /// Evaluate a registered symbol, `None` if it is unknown
    pub fn evaluate(
        &self,
        name: &str,
        truth: ArrayView2<'_, f32>,
        pred: ArrayView2<'_, f32>,
    ) -> Option<f32> {
        self.get(name).map(|f| f(truth, pred))
    }
}
