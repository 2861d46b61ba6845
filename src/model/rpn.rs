//! Region proposal network over the single-level feature map
//!
//! One square anchor sits at every feature location. During training a
//! location is positive when its center falls inside a ground-truth box; it
//! then regresses towards the smallest such box.

use candle_core::{Module, Tensor};
use candle_nn::{conv2d, Conv2d, Conv2dConfig, VarBuilder};

use super::backbone::ConvBackbone;
use super::box_ops::{self, BBox, BoxCoder};
use super::{bce_with_logits_mean, smooth_l1_sum, zero_loss};
use crate::error::Result;

/// Raw RPN predictions for one image
#[derive(Debug, Clone)]
pub struct RpnOutput {
    /// `[L]` objectness logits, one per feature location
    pub objectness: Tensor,
    /// `[L, 4]` anchor deltas
    pub deltas: Tensor,
    /// Feature map height
    pub height: usize,
    /// Feature map width
    pub width: usize,
}

/// RPN head: shared 3x3 convolution, then objectness and delta 1x1 convolutions
pub struct RegionProposalNetwork {
    conv: Conv2d,
    cls_logits: Conv2d,
    bbox_pred: Conv2d,
    anchor_size: f32,
    coder: BoxCoder,
}

impl RegionProposalNetwork {
    /// Smooth L1 transition point of the RPN box loss
    const BOX_LOSS_BETA: f64 = 1.0 / 9.0;

    /// Create the head under `vb` (conventionally the `rpn` prefix)
    pub fn new(channels: usize, anchor_size: f32, vb: VarBuilder) -> Result<Self> {
        let conv = conv2d(
            channels,
            channels,
            3,
            Conv2dConfig {
                padding: 1,
                ..Default::default()
            },
            vb.pp("conv"),
        )?;
        let cls_logits = conv2d(channels, 1, 1, Default::default(), vb.pp("cls_logits"))?;
        let bbox_pred = conv2d(channels, 4, 1, Default::default(), vb.pp("bbox_pred"))?;
        Ok(Self {
            conv,
            cls_logits,
            bbox_pred,
            anchor_size,
            coder: BoxCoder::new([1.0, 1.0, 1.0, 1.0]),
        })
    }

    /// Run the head on a `[1, C, h, w]` feature map
    pub fn forward(&self, features: &Tensor) -> Result<RpnOutput> {
        let (_, _, height, width) = features.dims4()?;
        let t = self.conv.forward(features)?.relu()?;
        let objectness = self.cls_logits.forward(&t)?.reshape(height * width)?;
        let deltas = self
            .bbox_pred
            .forward(&t)?
            .reshape((4, height * width))?
            .t()?
            .contiguous()?;
        Ok(RpnOutput {
            objectness,
            deltas,
            height,
            width,
        })
    }

    /// Anchors in row-major feature-location order
    pub fn anchors(&self, height: usize, width: usize) -> Vec<BBox> {
        let half = self.anchor_size * 0.5;
        let mut anchors = Vec::with_capacity(height * width);
        for i in 0..height {
            for j in 0..width {
                let cx = (j as f32 + 0.5) * ConvBackbone::STRIDE;
                let cy = (i as f32 + 0.5) * ConvBackbone::STRIDE;
                anchors.push([cx - half, cy - half, cx + half, cy + half]);
            }
        }
        anchors
    }

    /// Objectness and box regression losses against ground-truth boxes
    pub fn losses(&self, output: &RpnOutput, gt_boxes: &[BBox]) -> Result<(Tensor, Tensor)> {
        let device = output.objectness.device();
        let anchors = self.anchors(output.height, output.width);
        let num_locations = anchors.len();

        let mut labels = vec![0f32; num_locations];
        let mut positive_idx = Vec::new();
        let mut regression_targets = Vec::new();

        for (l, anchor) in anchors.iter().enumerate() {
            let cx = (anchor[0] + anchor[2]) * 0.5;
            let cy = (anchor[1] + anchor[3]) * 0.5;
            let matched = gt_boxes
                .iter()
                .filter(|gt| box_ops::contains(gt, cx, cy))
                .min_by(|a, b| {
                    box_ops::area(a)
                        .partial_cmp(&box_ops::area(b))
                        .unwrap_or(std::cmp::Ordering::Equal)
                });
            if let Some(gt) = matched {
                labels[l] = 1.0;
                positive_idx.push(l as u32);
                regression_targets.extend_from_slice(&self.coder.encode(gt, anchor));
            }
        }

        let target = Tensor::from_vec(labels, num_locations, device)?;
        let loss_objectness = bce_with_logits_mean(&output.objectness, &target)?;

        let loss_rpn_box_reg = if positive_idx.is_empty() {
            zero_loss(&output.deltas)?
        } else {
            let num_pos = positive_idx.len();
            let idx = Tensor::from_vec(positive_idx, num_pos, device)?;
            let predicted = output.deltas.index_select(&idx, 0)?;
            let targets = Tensor::from_vec(regression_targets, (num_pos, 4), device)?;
            (smooth_l1_sum(&predicted, &targets, Self::BOX_LOSS_BETA)? / num_locations as f64)?
        };

        Ok((loss_objectness, loss_rpn_box_reg))
    }

    /// Decode the highest scoring anchors into proposals for an image of `(height, width)`
    pub fn proposals(
        &self,
        output: &RpnOutput,
        image_size: (usize, usize),
        pre_nms_top_n: usize,
        post_nms_top_n: usize,
        nms_thresh: f32,
    ) -> Result<Vec<BBox>> {
        let (img_h, img_w) = image_size;
        let scores = candle_nn::ops::sigmoid(&output.objectness)?.to_vec1::<f32>()?;
        let deltas = output.deltas.to_vec2::<f32>()?;
        let anchors = self.anchors(output.height, output.width);

        let mut order: Vec<usize> = (0..scores.len()).collect();
        order.sort_by(|&a, &b| {
            scores[b]
                .partial_cmp(&scores[a])
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        order.truncate(pre_nms_top_n);

        let mut boxes = Vec::with_capacity(order.len());
        let mut kept_scores = Vec::with_capacity(order.len());
        for l in order {
            let d = [deltas[l][0], deltas[l][1], deltas[l][2], deltas[l][3]];
            let decoded = box_ops::clip(&self.coder.decode(&d, &anchors[l]), img_h, img_w);
            if decoded[2] - decoded[0] >= 1.0 && decoded[3] - decoded[1] >= 1.0 {
                boxes.push(decoded);
                kept_scores.push(scores[l]);
            }
        }

        let mut proposals: Vec<BBox> = box_ops::nms(&boxes, &kept_scores, nms_thresh)
            .into_iter()
            .take(post_nms_top_n)
            .map(|i| boxes[i])
            .collect();

        if proposals.is_empty() {
            proposals.push([0.0, 0.0, img_w as f32, img_h as f32]);
        }
        Ok(proposals)
    }
}
