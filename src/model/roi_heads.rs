//! RoI heads: box head, box predictor, mask head and mask predictor
//!
//! [`FastRcnnPredictor`] and [`MaskRcnnPredictor`] are the class-specific heads
//! that get rebuilt for a new class count; everything else is shared with the
//! pretrained backbone weights.

use candle_core::{DType, Module, Tensor, D};
use candle_nn::{
    conv2d, conv_transpose2d, linear, Conv2d, Conv2dConfig, ConvTranspose2d,
    ConvTranspose2dConfig, Linear, VarBuilder,
};

use super::backbone::ConvBackbone;
use super::box_ops::{self, BBox, BoxCoder};
use super::{bce_with_logits_mean, smooth_l1_sum, zero_loss, Detections, DetectorConfig};
use crate::error::Result;

/// Side of the pooled box-head features
const BOX_POOL_SIZE: usize = 7;
/// Side of the pooled mask-head features
const MASK_POOL_SIZE: usize = 14;
/// Proposals matched to ground truth are grown by this factor
const POSITIVE_JITTER: f32 = 1.1;
/// Background candidates overlapping ground truth above this IoU are dropped
const BACKGROUND_IOU: f32 = 0.5;

/// Box classification and class-specific regression head
pub struct FastRcnnPredictor {
    cls_score: Linear,
    bbox_pred: Linear,
    num_classes: usize,
}

impl FastRcnnPredictor {
    /// Create a predictor for `num_classes` classes, background included
    pub fn new(in_features: usize, num_classes: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            cls_score: linear(in_features, num_classes, vb.pp("cls_score"))?,
            bbox_pred: linear(in_features, num_classes * 4, vb.pp("bbox_pred"))?,
            num_classes,
        })
    }

    /// `[R, in]` features to `([R, K] logits, [R, 4K] deltas)`
    pub fn forward(&self, x: &Tensor) -> Result<(Tensor, Tensor)> {
        Ok((self.cls_score.forward(x)?, self.bbox_pred.forward(x)?))
    }

    /// Classes predicted, background included
    pub fn num_classes(&self) -> usize {
        self.num_classes
    }
}

/// Per-class mask logits head
pub struct MaskRcnnPredictor {
    conv5_mask: ConvTranspose2d,
    mask_fcn_logits: Conv2d,
}

impl MaskRcnnPredictor {
    /// Create a predictor with `dim_reduced` hidden channels
    pub fn new(
        in_channels: usize,
        dim_reduced: usize,
        num_classes: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let conv5_mask = conv_transpose2d(
            in_channels,
            dim_reduced,
            2,
            ConvTranspose2dConfig {
                stride: 2,
                ..Default::default()
            },
            vb.pp("conv5_mask"),
        )?;
        let mask_fcn_logits = conv2d(
            dim_reduced,
            num_classes,
            1,
            Default::default(),
            vb.pp("mask_fcn_logits"),
        )?;
        Ok(Self {
            conv5_mask,
            mask_fcn_logits,
        })
    }

    /// `[P, C, 14, 14]` features to `[P, K, 28, 28]` logits
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = self.conv5_mask.forward(x)?.relu()?;
        Ok(self.mask_fcn_logits.forward(&x)?)
    }
}

/// Training proposals for one image
#[derive(Debug, Clone, PartialEq)]
pub struct SampledProposals {
    /// Proposal boxes
    pub boxes: Vec<BBox>,
    /// Class label per proposal, 0 for background
    pub labels: Vec<u32>,
    /// Ground-truth index matched by each foreground proposal
    pub matched_gt: Vec<Option<usize>>,
}

impl SampledProposals {
    /// Indices of foreground proposals
    pub fn positives(&self) -> Vec<usize> {
        self.labels
            .iter()
            .enumerate()
            .filter(|(_, &l)| l > 0)
            .map(|(i, _)| i)
            .collect()
    }
}

/// Build training proposals: jittered ground truth plus grid background cells
pub fn sample_proposals(
    gt_boxes: &[BBox],
    gt_labels: &[u32],
    image_size: (usize, usize),
) -> SampledProposals {
    let (height, width) = image_size;
    let mut sampled = SampledProposals {
        boxes: Vec::new(),
        labels: Vec::new(),
        matched_gt: Vec::new(),
    };

    for (k, (gt, &label)) in gt_boxes.iter().zip(gt_labels).enumerate() {
        sampled
            .boxes
            .push(box_ops::clip(&box_ops::expand(gt, POSITIVE_JITTER), height, width));
        sampled.labels.push(label);
        sampled.matched_gt.push(Some(k));
    }

    let (w, h) = (width as f32, height as f32);
    for cells in 1..=3usize {
        let cw = w / cells as f32;
        let ch = h / cells as f32;
        for i in 0..cells {
            for j in 0..cells {
                let cell = [j as f32 * cw, i as f32 * ch, (j + 1) as f32 * cw, (i + 1) as f32 * ch];
                let overlaps = gt_boxes
                    .iter()
                    .any(|gt| box_ops::iou(gt, &cell) >= BACKGROUND_IOU);
                if !overlaps {
                    sampled.boxes.push(cell);
                    sampled.labels.push(0);
                    sampled.matched_gt.push(None);
                }
            }
        }
    }

    sampled
}

/// Crop each box from a `[1, C, h, w]` feature map and resize to `size x size`
pub fn roi_pool(features: &Tensor, boxes: &[BBox], size: usize) -> Result<Tensor> {
    let (_, _, height, width) = features.dims4()?;
    let mut crops = Vec::with_capacity(boxes.len());
    for b in boxes {
        let (y0, hh) = box_ops::feature_window(b[1], b[3], ConvBackbone::STRIDE, height);
        let (x0, ww) = box_ops::feature_window(b[0], b[2], ConvBackbone::STRIDE, width);
        let crop = features
            .narrow(2, y0, hh)?
            .narrow(3, x0, ww)?
            .upsample_nearest2d(size, size)?;
        crops.push(crop);
    }
    Ok(Tensor::cat(&crops, 0)?)
}

/// Box head, mask head and their class-specific predictors
pub struct RoiHeads {
    fc6: Linear,
    fc7: Linear,
    box_predictor: FastRcnnPredictor,
    mask_fcn1: Conv2d,
    mask_predictor: MaskRcnnPredictor,
    coder: BoxCoder,
    score_thresh: f32,
    nms_thresh: f32,
    detections_per_img: usize,
}

impl RoiHeads {
    /// Smooth L1 transition point of the box loss
    const BOX_LOSS_BETA: f64 = 1.0 / 9.0;
    /// Side of the predicted mask logits
    pub const MASK_SIZE: usize = 28;

    /// Create the heads under `vb` (conventionally the `roi_heads` prefix)
    pub fn new(config: &DetectorConfig, in_channels: usize, vb: VarBuilder) -> Result<Self> {
        let num_classes = config.num_classes_with_background();
        let pooled = in_channels * BOX_POOL_SIZE * BOX_POOL_SIZE;
        let box_head = vb.pp("box_head");
        let fc6 = linear(pooled, config.representation_size, box_head.pp("fc6"))?;
        let fc7 = linear(
            config.representation_size,
            config.representation_size,
            box_head.pp("fc7"),
        )?;
        let box_predictor = FastRcnnPredictor::new(
            config.representation_size,
            num_classes,
            vb.pp("box_predictor"),
        )?;
        let mask_fcn1 = conv2d(
            in_channels,
            config.mask_head_channels,
            3,
            Conv2dConfig {
                padding: 1,
                ..Default::default()
            },
            vb.pp("mask_head").pp("mask_fcn1"),
        )?;
        let mask_predictor = MaskRcnnPredictor::new(
            config.mask_head_channels,
            config.hidden_layer,
            num_classes,
            vb.pp("mask_predictor"),
        )?;
        Ok(Self {
            fc6,
            fc7,
            box_predictor,
            mask_fcn1,
            mask_predictor,
            coder: BoxCoder::new([10.0, 10.0, 5.0, 5.0]),
            score_thresh: config.box_score_thresh,
            nms_thresh: config.box_nms_thresh,
            detections_per_img: config.detections_per_img,
        })
    }

    fn box_features(&self, features: &Tensor, boxes: &[BBox]) -> Result<Tensor> {
        let pooled = roi_pool(features, boxes, BOX_POOL_SIZE)?.flatten_from(1)?;
        let x = self.fc6.forward(&pooled)?.relu()?;
        Ok(self.fc7.forward(&x)?.relu()?)
    }

    fn mask_logits(&self, features: &Tensor, boxes: &[BBox]) -> Result<Tensor> {
        let pooled = roi_pool(features, boxes, MASK_POOL_SIZE)?;
        let x = self.mask_fcn1.forward(&pooled)?.relu()?;
        self.mask_predictor.forward(&x)
    }

    /// Select `[P, 28, 28]` logits of each row's class from `[P, K, 28, 28]`
    fn select_class_masks(&self, logits: &Tensor, labels: &[u32]) -> Result<Tensor> {
        let k = self.box_predictor.num_classes();
        let p = labels.len();
        let flat = logits.reshape((p * k, Self::MASK_SIZE, Self::MASK_SIZE))?;
        let idx: Vec<u32> = labels
            .iter()
            .enumerate()
            .map(|(row, &label)| (row * k) as u32 + label)
            .collect();
        let idx = Tensor::from_vec(idx, p, logits.device())?;
        Ok(flat.index_select(&idx, 0)?)
    }

    /// Classifier, box regression and mask losses for one image
    pub fn losses(
        &self,
        features: &Tensor,
        image_size: (usize, usize),
        gt_boxes: &[BBox],
        gt_labels: &[u32],
        gt_masks: &Tensor,
    ) -> Result<(Tensor, Tensor, Tensor)> {
        let device = features.device();
        let sampled = sample_proposals(gt_boxes, gt_labels, image_size);
        let num_rois = sampled.boxes.len();
        let k = self.box_predictor.num_classes();

        let x = self.box_features(features, &sampled.boxes)?;
        let (class_logits, box_regression) = self.box_predictor.forward(&x)?;

        let labels = Tensor::from_vec(sampled.labels.clone(), num_rois, device)?;
        let loss_classifier = candle_nn::loss::cross_entropy(&class_logits, &labels)?;

        let positives = sampled.positives();
        if positives.is_empty() {
            return Ok((
                loss_classifier,
                zero_loss(&box_regression)?,
                zero_loss(&x)?,
            ));
        }

        let mut delta_idx = Vec::with_capacity(positives.len());
        let mut delta_targets = Vec::with_capacity(positives.len() * 4);
        let mut pos_boxes = Vec::with_capacity(positives.len());
        let mut pos_labels = Vec::with_capacity(positives.len());
        let mut mask_targets = Vec::with_capacity(positives.len());
        let (height, width) = image_size;

        for &r in &positives {
            let label = sampled.labels[r];
            let proposal = sampled.boxes[r];
            let gt_index = sampled.matched_gt[r].unwrap_or_default();
            let gt = gt_boxes[gt_index];

            delta_idx.push((r * k) as u32 + label);
            delta_targets.extend_from_slice(&self.coder.encode(&gt, &proposal));
            pos_boxes.push(proposal);
            pos_labels.push(label);

            let (y0, hh) = box_ops::feature_window(proposal[1], proposal[3], 1.0, height);
            let (x0, ww) = box_ops::feature_window(proposal[0], proposal[2], 1.0, width);
            let target = gt_masks
                .get(gt_index)?
                .narrow(0, y0, hh)?
                .narrow(1, x0, ww)?
                .to_dtype(DType::F32)?
                .reshape((1, 1, hh, ww))?
                .upsample_nearest2d(Self::MASK_SIZE, Self::MASK_SIZE)?
                .reshape((Self::MASK_SIZE, Self::MASK_SIZE))?;
            mask_targets.push(target);
        }

        let num_pos = positives.len();
        let idx = Tensor::from_vec(delta_idx, num_pos, device)?;
        let predicted = box_regression
            .reshape((num_rois * k, 4))?
            .index_select(&idx, 0)?;
        let targets = Tensor::from_vec(delta_targets, (num_pos, 4), device)?;
        let loss_box_reg =
            (smooth_l1_sum(&predicted, &targets, Self::BOX_LOSS_BETA)? / num_rois as f64)?;

        let mask_logits = self.mask_logits(features, &pos_boxes)?;
        let selected = self.select_class_masks(&mask_logits, &pos_labels)?;
        let mask_targets = Tensor::stack(&mask_targets, 0)?;
        let loss_mask = bce_with_logits_mean(&selected, &mask_targets)?;

        Ok((loss_classifier, loss_box_reg, loss_mask))
    }

    /// Score, decode, suppress and segment proposals for one image
    pub fn detect(
        &self,
        features: &Tensor,
        proposals: &[BBox],
        image_size: (usize, usize),
    ) -> Result<Detections> {
        let device = features.device();
        let (height, width) = image_size;
        let k = self.box_predictor.num_classes();

        let x = self.box_features(features, proposals)?;
        let (class_logits, box_regression) = self.box_predictor.forward(&x)?;
        let probs = candle_nn::ops::softmax(&class_logits, D::Minus1)?.to_vec2::<f32>()?;
        let deltas = box_regression.to_vec2::<f32>()?;

        let mut per_class: Vec<(Vec<BBox>, Vec<f32>)> = vec![(Vec::new(), Vec::new()); k];
        for (r, proposal) in proposals.iter().enumerate() {
            for (c, bucket) in per_class.iter_mut().enumerate().skip(1) {
                let score = probs[r][c];
                if score <= self.score_thresh {
                    continue;
                }
                let d = [
                    deltas[r][4 * c],
                    deltas[r][4 * c + 1],
                    deltas[r][4 * c + 2],
                    deltas[r][4 * c + 3],
                ];
                let decoded = box_ops::clip(&self.coder.decode(&d, proposal), height, width);
                if decoded[2] - decoded[0] >= 1.0 && decoded[3] - decoded[1] >= 1.0 {
                    bucket.0.push(decoded);
                    bucket.1.push(score);
                }
            }
        }

        let mut kept: Vec<(BBox, f32, u32)> = Vec::new();
        for (c, (boxes, scores)) in per_class.iter().enumerate().skip(1) {
            for i in box_ops::nms(boxes, scores, self.nms_thresh) {
                kept.push((boxes[i], scores[i], c as u32));
            }
        }
        kept.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        kept.truncate(self.detections_per_img);

        let n = kept.len();
        let boxes: Vec<BBox> = kept.iter().map(|d| d.0).collect();
        let scores: Vec<f32> = kept.iter().map(|d| d.1).collect();
        let labels: Vec<u32> = kept.iter().map(|d| d.2).collect();

        let masks = if n == 0 {
            Tensor::zeros((0, 1, height, width), DType::F32, device)?
        } else {
            let logits = self.mask_logits(features, &boxes)?;
            let probs = candle_nn::ops::sigmoid(&self.select_class_masks(&logits, &labels)?)?;
            let mut pasted = Vec::with_capacity(n);
            for (i, b) in boxes.iter().enumerate() {
                let (y0, hh) = box_ops::feature_window(b[1], b[3], 1.0, height);
                let (x0, ww) = box_ops::feature_window(b[0], b[2], 1.0, width);
                let m = probs
                    .get(i)?
                    .reshape((1, 1, Self::MASK_SIZE, Self::MASK_SIZE))?
                    .upsample_nearest2d(hh, ww)?
                    .pad_with_zeros(2, y0, height - y0 - hh)?
                    .pad_with_zeros(3, x0, width - x0 - ww)?
                    .reshape((1, height, width))?;
                pasted.push(m);
            }
            Tensor::stack(&pasted, 0)?
        };

        let flat_boxes: Vec<f32> = boxes.iter().flat_map(|b| b.iter().copied()).collect();
        Ok(Detections {
            boxes: Tensor::from_vec(flat_boxes, (n, 4), device)?,
            scores: Tensor::from_vec(scores, n, device)?,
            labels: Tensor::from_vec(labels, n, device)?,
            masks,
        })
    }
}
