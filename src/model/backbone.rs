//! Convolutional feature extractor shared by the RPN and the RoI heads

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{conv2d, Conv2d, Conv2dConfig, VarBuilder};

use crate::error::{Error, Result};

/// ImageNet channel statistics used to normalize inputs
const IMAGE_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGE_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Three stride-2 convolutions, so the feature map has stride 8
pub struct ConvBackbone {
    conv1: Conv2d,
    conv2: Conv2d,
    conv3: Conv2d,
    mean: Tensor,
    std: Tensor,
    out_channels: usize,
}

impl ConvBackbone {
    /// Total downsampling factor of the feature map
    pub const STRIDE: f32 = 8.0;

    /// Create the backbone under `vb` (conventionally the `backbone` prefix)
    pub fn new(out_channels: usize, vb: VarBuilder, device: &Device) -> Result<Self> {
        let cfg = Conv2dConfig {
            padding: 1,
            stride: 2,
            ..Default::default()
        };
        let mid = (out_channels / 2).max(8);
        let conv1 = conv2d(3, mid / 2, 3, cfg, vb.pp("conv1"))?;
        let conv2 = conv2d(mid / 2, mid, 3, cfg, vb.pp("conv2"))?;
        let conv3 = conv2d(mid, out_channels, 3, cfg, vb.pp("conv3"))?;

        let mean = Tensor::from_vec(IMAGE_MEAN.to_vec(), (3, 1, 1), device)?;
        let std = Tensor::from_vec(IMAGE_STD.to_vec(), (3, 1, 1), device)?;

        Ok(Self {
            conv1,
            conv2,
            conv3,
            mean,
            std,
            out_channels,
        })
    }

    /// Channels of the produced feature map
    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    /// Normalize a `[3, H, W]` image and return its `[1, C, h, w]` feature map
    pub fn forward(&self, image: &Tensor) -> Result<Tensor> {
        let dims = image.dims();
        if dims.len() != 3 || dims[0] != 3 {
            return Err(Error::model(format!(
                "expected a [3, H, W] image tensor, got {:?}",
                dims
            )));
        }
        let x = image
            .to_dtype(DType::F32)?
            .broadcast_sub(&self.mean)?
            .broadcast_div(&self.std)?
            .unsqueeze(0)?;
        let x = self.conv1.forward(&x)?.relu()?;
        let x = self.conv2.forward(&x)?.relu()?;
        let x = self.conv3.forward(&x)?.relu()?;
        Ok(x)
    }
}
