//! Mask R-CNN: backbone, region proposal network and RoI heads

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{VarBuilder, VarMap};
use tracing::debug;

use super::backbone::ConvBackbone;
use super::roi_heads::RoiHeads;
use super::rpn::RegionProposalNetwork;
use super::state::{self, StateDict};
use super::{Detections, Detector, DetectorConfig, LossDict, LossTerm};
use crate::error::{Error, Result};
use crate::training::data::Target;

/// Two-stage instance segmentation model with parameters held in a [`VarMap`]
pub struct MaskRcnn {
    config: DetectorConfig,
    var_map: VarMap,
    backbone: ConvBackbone,
    rpn: RegionProposalNetwork,
    roi_heads: RoiHeads,
    device: Device,
    training: bool,
    grad_enabled: bool,
}

impl MaskRcnn {
    /// Build a freshly initialized model; `config.num_classes` excludes background
    pub fn new(config: DetectorConfig, device: &Device) -> Result<Self> {
        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, device);
        let channels = config.backbone_channels;

        let backbone = ConvBackbone::new(channels, vb.pp("backbone"), device)?;
        let rpn = RegionProposalNetwork::new(channels, config.anchor_size, vb.pp("rpn"))?;
        let roi_heads = RoiHeads::new(&config, channels, vb.pp("roi_heads"))?;

        debug!(
            "built detector with {} classes (background included)",
            config.num_classes_with_background()
        );

        Ok(Self {
            config,
            var_map,
            backbone,
            rpn,
            roi_heads,
            device: device.clone(),
            training: true,
            grad_enabled: true,
        })
    }

    /// Rebuild a model from its configuration and a parameter snapshot
    pub fn from_state(config: DetectorConfig, state: &StateDict, device: &Device) -> Result<Self> {
        let mut model = Self::new(config, device)?;
        model.load_state_dict(state)?;
        Ok(model)
    }

    /// Underlying parameter store
    pub fn var_map(&self) -> &VarMap {
        &self.var_map
    }

    fn is_frozen(&self, name: &str) -> bool {
        self.config
            .frozen_prefixes
            .iter()
            .any(|prefix| name.starts_with(prefix.as_str()))
    }

    fn image_size(image: &Tensor) -> Result<(usize, usize)> {
        let (_, h, w) = image.dims3()?;
        Ok((h, w))
    }
}

impl Detector for MaskRcnn {
    fn config(&self) -> &DetectorConfig {
        &self.config
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    fn is_training(&self) -> bool {
        self.training
    }

    fn set_grad_enabled(&mut self, enabled: bool) {
        self.grad_enabled = enabled;
    }

    fn grad_enabled(&self) -> bool {
        self.grad_enabled
    }

    fn losses(&self, images: &[Tensor], targets: &[Target]) -> Result<LossDict> {
        if !self.training {
            return Err(Error::model("losses are only produced in training mode"));
        }
        if images.is_empty() || images.len() != targets.len() {
            return Err(Error::invalid_input(format!(
                "expected one target per image, got {} images and {} targets",
                images.len(),
                targets.len()
            )));
        }

        let mut sums: Vec<Option<Tensor>> = vec![None; LossTerm::ALL.len()];
        for (image, target) in images.iter().zip(targets) {
            let image_size = Self::image_size(image)?;
            let gt_boxes = target.boxes_vec()?;
            let gt_labels = target.labels_vec()?;

            let features = self.backbone.forward(image)?;
            let rpn_out = self.rpn.forward(&features)?;
            let (objectness, rpn_box_reg) = self.rpn.losses(&rpn_out, &gt_boxes)?;
            let (classifier, box_reg, mask) = self.roi_heads.losses(
                &features,
                image_size,
                &gt_boxes,
                &gt_labels,
                &target.masks,
            )?;

            let per_image = [classifier, box_reg, mask, objectness, rpn_box_reg];
            for (slot, loss) in sums.iter_mut().zip(per_image) {
                *slot = Some(match slot.take() {
                    Some(acc) => (acc + loss)?,
                    None => loss,
                });
            }
        }

        let batch = images.len() as f64;
        let mut terms = Vec::with_capacity(sums.len());
        for sum in sums {
            let sum = sum.ok_or_else(|| Error::internal("missing loss term"))?;
            terms.push((sum / batch)?);
        }
        let [classifier, box_reg, mask, objectness, rpn_box_reg]: [Tensor; 5] = terms
            .try_into()
            .map_err(|_| Error::internal("loss term count mismatch"))?;

        let losses = LossDict::new(classifier, box_reg, mask, objectness, rpn_box_reg);
        Ok(if self.grad_enabled {
            losses
        } else {
            losses.detach()
        })
    }

    fn detect(&self, images: &[Tensor]) -> Result<Vec<Detections>> {
        let mut out = Vec::with_capacity(images.len());
        for image in images {
            let image_size = Self::image_size(image)?;
            let features = self.backbone.forward(image)?;
            let rpn_out = self.rpn.forward(&features)?;
            let proposals = self.rpn.proposals(
                &rpn_out,
                image_size,
                self.config.rpn_pre_nms_top_n,
                self.config.rpn_post_nms_top_n,
                self.config.rpn_nms_thresh,
            )?;
            let d = self.roi_heads.detect(&features.detach(), &proposals, image_size)?;
            out.push(Detections {
                boxes: d.boxes.detach(),
                scores: d.scores.detach(),
                labels: d.labels,
                masks: d.masks.detach(),
            });
        }
        Ok(out)
    }

    fn trainable_parameters(&self) -> Result<Vec<(String, Var)>> {
        Ok(state::named_vars(&self.var_map)?
            .into_iter()
            .filter(|(name, _)| !self.is_frozen(name))
            .collect())
    }

    fn state_dict(&self) -> Result<StateDict> {
        state::state_dict_of(&self.var_map)
    }

    fn load_state_dict(&mut self, state: &StateDict) -> Result<()> {
        state::load_state_dict_into(&self.var_map, state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{build_detector, scalar_value, NoGradGuard};

    fn tiny_config() -> DetectorConfig {
        DetectorConfig {
            num_classes: 2,
            backbone_channels: 8,
            representation_size: 16,
            mask_head_channels: 8,
            hidden_layer: 8,
            anchor_size: 16.0,
            ..Default::default()
        }
    }

    fn square_target(size: usize) -> Target {
        let device = Device::Cpu;
        let mut mask = vec![0u8; size * size];
        for y in 4..20 {
            for x in 4..20 {
                mask[y * size + x] = 1;
            }
        }
        Target {
            image_id: 7,
            boxes: Tensor::new(&[[4.0f32, 4.0, 20.0, 20.0]], &device).unwrap(),
            labels: Tensor::new(&[1u32], &device).unwrap(),
            masks: Tensor::from_vec(mask, (1, size, size), &device).unwrap(),
            area: Tensor::new(&[256.0f32], &device).unwrap(),
            iscrowd: Tensor::new(&[0u8], &device).unwrap(),
        }
    }

    #[test]
    fn test_heads_sized_with_background() {
        let model = build_detector(&tiny_config(), &Device::Cpu).unwrap();
        let state = model.state_dict().unwrap();
        assert_eq!(state["roi_heads.box_predictor.cls_score.weight"].shape, vec![3, 16]);
        assert_eq!(state["roi_heads.box_predictor.bbox_pred.weight"].shape, vec![12, 16]);
        assert_eq!(state["roi_heads.mask_predictor.mask_fcn_logits.weight"].shape[0], 3);
    }

    #[test]
    fn test_losses_produce_five_finite_terms() {
        let model = MaskRcnn::new(tiny_config(), &Device::Cpu).unwrap();
        let images = vec![Tensor::rand(0f32, 1f32, (3, 32, 32), &Device::Cpu).unwrap(); 2];
        let targets = vec![square_target(32), square_target(32)];
        let losses = model.losses(&images, &targets).unwrap();
        for v in losses.values().unwrap() {
            assert!(v.is_finite());
        }
        assert!(scalar_value(&losses.total().unwrap()).unwrap().is_finite());
    }

    #[test]
    fn test_losses_require_matching_targets() {
        let model = MaskRcnn::new(tiny_config(), &Device::Cpu).unwrap();
        let images = vec![Tensor::rand(0f32, 1f32, (3, 32, 32), &Device::Cpu).unwrap()];
        assert!(model.losses(&images, &[]).is_err());
    }

    #[test]
    fn test_no_grad_guard_restores_flag() {
        let mut model = MaskRcnn::new(tiny_config(), &Device::Cpu).unwrap();
        {
            let mut guard = NoGradGuard::new(&mut model);
            assert!(!guard.model().grad_enabled());
        }
        assert!(model.grad_enabled());
    }

    #[test]
    fn test_frozen_prefixes_are_not_trainable() {
        let config = DetectorConfig {
            frozen_prefixes: vec!["backbone.".to_string()],
            ..tiny_config()
        };
        let model = MaskRcnn::new(config, &Device::Cpu).unwrap();
        let params = model.trainable_parameters().unwrap();
        assert!(!params.is_empty());
        assert!(params.iter().all(|(name, _)| !name.starts_with("backbone.")));
    }

    #[test]
    fn test_detect_in_eval_mode() {
        let mut model = MaskRcnn::new(tiny_config(), &Device::Cpu).unwrap();
        model.set_training(false);
        let image = Tensor::rand(0f32, 1f32, (3, 32, 48), &Device::Cpu).unwrap();
        let detections = model.detect(&[image]).unwrap();
        assert_eq!(detections.len(), 1);
        let n = detections[0].len();
        assert_eq!(detections[0].masks.dims(), &[n, 1, 32, 48]);
    }

    #[test]
    fn test_state_round_trip_into_new_model() {
        let model = MaskRcnn::new(tiny_config(), &Device::Cpu).unwrap();
        let state = model.state_dict().unwrap();
        let restored = MaskRcnn::from_state(tiny_config(), &state, &Device::Cpu).unwrap();
        assert_eq!(restored.state_dict().unwrap(), state);
    }
}
