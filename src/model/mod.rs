//! Detector abstraction and the bundled Mask R-CNN implementation
//!
//! The training loop only sees the [`Detector`] trait: a model that returns one
//! [`LossDict`] per batch when given targets, and [`Detections`] when run for
//! inference. [`build_detector`] is the model factory; it owns the background
//! class offset, so callers always pass the number of *foreground* classes.

pub mod backbone;
pub mod box_ops;
pub mod mask_rcnn;
pub mod pretrained;
pub mod roi_heads;
pub mod rpn;
pub mod state;

pub use mask_rcnn::MaskRcnn;
pub use state::{StateDict, TensorRecord};

use std::fmt;

use candle_core::{Device, Tensor, Var};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::training::data::Target;

/// One scalar component of the multi-task detection objective
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LossTerm {
    /// Box head classification
    Classifier,
    /// Box head regression
    BoxReg,
    /// Mask head per-pixel loss
    Mask,
    /// RPN objectness
    Objectness,
    /// RPN box regression
    RpnBoxReg,
}

impl LossTerm {
    /// All terms in reporting order
    pub const ALL: [LossTerm; 5] = [
        LossTerm::Classifier,
        LossTerm::BoxReg,
        LossTerm::Mask,
        LossTerm::Objectness,
        LossTerm::RpnBoxReg,
    ];

    /// Canonical loss name
    pub fn name(self) -> &'static str {
        match self {
            LossTerm::Classifier => "loss_classifier",
            LossTerm::BoxReg => "loss_box_reg",
            LossTerm::Mask => "loss_mask",
            LossTerm::Objectness => "loss_objectness",
            LossTerm::RpnBoxReg => "loss_rpn_box_reg",
        }
    }

    /// Position in [`LossTerm::ALL`]
    pub fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for LossTerm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The five scalar losses produced by one forward pass over one batch
#[derive(Debug, Clone)]
pub struct LossDict {
    terms: [Tensor; 5],
}

impl LossDict {
    /// Assemble from per-term scalars in [`LossTerm::ALL`] order
    pub fn new(
        classifier: Tensor,
        box_reg: Tensor,
        mask: Tensor,
        objectness: Tensor,
        rpn_box_reg: Tensor,
    ) -> Self {
        Self {
            terms: [classifier, box_reg, mask, objectness, rpn_box_reg],
        }
    }

    /// Loss tensor for a term
    pub fn get(&self, term: LossTerm) -> &Tensor {
        &self.terms[term.index()]
    }

    /// Terms with their tensors in reporting order
    pub fn iter(&self) -> impl Iterator<Item = (LossTerm, &Tensor)> {
        LossTerm::ALL.into_iter().zip(self.terms.iter())
    }

    /// Sum of all terms, kept on the autodiff graph
    pub fn total(&self) -> Result<Tensor> {
        let mut sum = self.terms[0].clone();
        for term in &self.terms[1..] {
            sum = (sum + term)?;
        }
        Ok(sum)
    }

    /// Host-side scalar value of every term
    pub fn values(&self) -> Result<[f64; 5]> {
        let mut out = [0.0; 5];
        for (slot, t) in out.iter_mut().zip(self.terms.iter()) {
            *slot = scalar_value(t)?;
        }
        Ok(out)
    }

    /// Drop autodiff history from every term
    pub fn detach(self) -> Self {
        Self {
            terms: self.terms.map(|t| t.detach()),
        }
    }
}

impl fmt::Display for LossDict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (term, tensor)) in self.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            match scalar_value(tensor) {
                Ok(v) => write!(f, "'{}': {}", term, v)?,
                Err(_) => write!(f, "'{}': <unreadable>", term)?,
            }
        }
        f.write_str("}")
    }
}

/// Read a single-element tensor as f64
pub fn scalar_value(t: &Tensor) -> Result<f64> {
    let v = t
        .flatten_all()?
        .to_dtype(candle_core::DType::F64)?
        .to_vec1::<f64>()?;
    match v.as_slice() {
        [x] => Ok(*x),
        _ => Err(Error::model(format!("expected a scalar loss, got shape {:?}", t.dims()))),
    }
}

/// Detections for one image
#[derive(Debug, Clone)]
pub struct Detections {
    /// `[D, 4]` boxes in image coordinates
    pub boxes: Tensor,
    /// `[D]` confidence scores
    pub scores: Tensor,
    /// `[D]` class labels, 1-based (0 is background)
    pub labels: Tensor,
    /// `[D, 1, H, W]` mask probabilities
    pub masks: Tensor,
}

impl Detections {
    /// Number of detections
    pub fn len(&self) -> usize {
        self.scores.dims().first().copied().unwrap_or(0)
    }

    /// Whether nothing was detected
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A two-stage instance segmentation model.
///
/// `losses` is the training/validation mode of the forward pass and always
/// returns exactly one [`LossDict`] for the whole batch; `detect` is the
/// inference mode.
pub trait Detector: Send {
    /// Configuration the detector was built with
    fn config(&self) -> &DetectorConfig;

    /// Device holding the parameters
    fn device(&self) -> &Device;

    /// Switch between training and evaluation behaviour
    fn set_training(&mut self, training: bool);

    /// Whether the detector is in training mode
    fn is_training(&self) -> bool;

    /// Enable or disable autodiff history on forward outputs
    fn set_grad_enabled(&mut self, enabled: bool);

    /// Whether forward outputs keep autodiff history
    fn grad_enabled(&self) -> bool;

    /// Forward pass with targets, producing the loss terms
    fn losses(&self, images: &[Tensor], targets: &[Target]) -> Result<LossDict>;

    /// Forward pass without targets, producing detections
    fn detect(&self, images: &[Tensor]) -> Result<Vec<Detections>>;

    /// Parameters the optimizer should update, by name
    fn trainable_parameters(&self) -> Result<Vec<(String, Var)>>;

    /// Snapshot of every parameter
    fn state_dict(&self) -> Result<StateDict>;

    /// Restore every parameter from a snapshot
    fn load_state_dict(&mut self, state: &StateDict) -> Result<()>;
}

/// Disables gradients on a detector for the lifetime of the guard
pub struct NoGradGuard<'a> {
    model: &'a mut dyn Detector,
    previous: bool,
}

impl<'a> NoGradGuard<'a> {
    /// Disable gradients until the guard drops
    pub fn new(model: &'a mut dyn Detector) -> Self {
        let previous = model.grad_enabled();
        model.set_grad_enabled(false);
        Self { model, previous }
    }

    /// The guarded detector
    pub fn model(&mut self) -> &mut dyn Detector {
        &mut *self.model
    }
}

impl Drop for NoGradGuard<'_> {
    fn drop(&mut self) {
        self.model.set_grad_enabled(self.previous);
    }
}

/// Detector architecture and head configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DetectorConfig {
    /// Number of foreground classes; the background class is added internally
    pub num_classes: usize,
    /// Pretrained backbone weights (safetensors path or URL)
    pub pretrained_weights: Option<String>,
    /// Parameter name prefixes excluded from optimization
    pub frozen_prefixes: Vec<String>,
    /// Channels of the backbone feature map
    pub backbone_channels: usize,
    /// Width of the box head representation
    pub representation_size: usize,
    /// Channels of the mask head feature convolution
    pub mask_head_channels: usize,
    /// Hidden width of the mask predictor
    pub hidden_layer: usize,
    /// Side of the square anchor at each feature location, in pixels
    pub anchor_size: f32,
    /// Proposals kept per image before NMS at inference
    pub rpn_pre_nms_top_n: usize,
    /// Proposals kept per image after NMS at inference
    pub rpn_post_nms_top_n: usize,
    /// IoU threshold of the proposal NMS
    pub rpn_nms_thresh: f32,
    /// Minimum detection score
    pub box_score_thresh: f32,
    /// IoU threshold of the per-class detection NMS
    pub box_nms_thresh: f32,
    /// Maximum detections per image
    pub detections_per_img: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            num_classes: 1,
            pretrained_weights: None,
            frozen_prefixes: Vec::new(),
            backbone_channels: 64,
            representation_size: 256,
            mask_head_channels: 64,
            hidden_layer: 256,
            anchor_size: 32.0,
            rpn_pre_nms_top_n: 200,
            rpn_post_nms_top_n: 50,
            rpn_nms_thresh: 0.7,
            box_score_thresh: 0.05,
            box_nms_thresh: 0.5,
            detections_per_img: 100,
        }
    }
}

impl DetectorConfig {
    /// Classes seen by the predictor heads, background included
    pub fn num_classes_with_background(&self) -> usize {
        self.num_classes + 1
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.num_classes == 0 {
            return Err(Error::config("model.num_classes must count at least one foreground class"));
        }
        if self.backbone_channels == 0
            || self.representation_size == 0
            || self.mask_head_channels == 0
            || self.hidden_layer == 0
        {
            return Err(Error::config("model layer widths must be > 0"));
        }
        if !(self.anchor_size > 0.0) {
            return Err(Error::config("model.anchor_size must be > 0"));
        }
        Ok(())
    }
}

/// Build a Mask R-CNN detector for `config.num_classes` foreground classes.
///
/// The predictor heads are sized `num_classes + 1`; pretrained backbone
/// weights, when configured, are loaded once here and never touch the heads.
pub fn build_detector(config: &DetectorConfig, device: &Device) -> Result<MaskRcnn> {
    config.validate()?;
    let model = MaskRcnn::new(config.clone(), device)?;
    if let Some(source) = &config.pretrained_weights {
        pretrained::load_backbone_weights(model.var_map(), source, device)?;
    }
    Ok(model)
}

/// Smooth L1 loss summed over all elements
pub(crate) fn smooth_l1_sum(input: &Tensor, target: &Tensor, beta: f64) -> Result<Tensor> {
    let diff = (input - target)?.abs()?;
    let quadratic = diff.minimum(beta)?;
    let linear = (&diff - &quadratic)?;
    let loss = ((quadratic.sqr()? * (0.5 / beta))? + linear)?;
    Ok(loss.sum_all()?)
}

/// Numerically stable binary cross-entropy on logits, averaged
pub(crate) fn bce_with_logits_mean(logits: &Tensor, target: &Tensor) -> Result<Tensor> {
    // max(x, 0) - x * t + ln(1 + e^{-|x|})
    let softplus = (logits.abs()?.neg()?.exp()? + 1.0)?.log()?;
    let loss = ((logits.relu()? - (logits * target)?)? + softplus)?;
    Ok(loss.mean_all()?)
}

/// A zero scalar that stays connected to `anchor`'s autodiff graph
pub(crate) fn zero_loss(anchor: &Tensor) -> Result<Tensor> {
    Ok(anchor.sum_all()?.affine(0.0, 0.0)?)
}
