use candle_core::{Module, ModuleT, Tensor};
use candle_nn::{BatchNorm, BatchNormConfig, Conv2d, Conv2dConfig, VarBuilder};

use crate::config::EncoderConfig;

/// Spatial pooling applied after a conv stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Pool {
    /// 2x2 max pool: halves height and width.
    Both,
    /// (2, 1) max pool: halves height only.
    Height,
    None,
}

impl Pool {
    /// Pooling schedule: width shrinks 4x, height shrinks 16x.
    pub(crate) const SCHEDULE: [Pool; 5] = [Pool::Both, Pool::Both, Pool::Height, Pool::Height, Pool::None];

    fn apply(self, xs: &Tensor) -> candle_core::Result<Tensor> {
        match self {
            Pool::Both => xs.max_pool2d(2),
            Pool::Height => xs.max_pool2d_with_stride((2, 1), (2, 1)),
            Pool::None => Ok(xs.clone()),
        }
    }
}

/// conv3x3 -> batch norm -> relu -> pool
struct ConvStage {
    conv: Conv2d,
    norm: BatchNorm,
    pool: Pool,
}

impl ConvStage {
    fn load(in_c: usize, out_c: usize, pool: Pool, vb: VarBuilder) -> candle_core::Result<Self> {
        let cfg = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        Ok(Self {
            conv: candle_nn::conv2d(in_c, out_c, 3, cfg, vb.pp("conv"))?,
            norm: candle_nn::batch_norm(out_c, BatchNormConfig::default(), vb.pp("bn"))?,
            pool,
        })
    }
}

impl ModuleT for ConvStage {
    fn forward_t(&self, xs: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        let xs = self.conv.forward(xs)?;
        // Eval mode reads the running statistics and never updates them.
        let xs = self.norm.forward_t(&xs, train)?.relu()?;
        self.pool.apply(&xs)
    }
}

/// Convolutional feature extractor: `(B, 1, H, W)` to `(B, C, H/16, W/4)`.
pub(crate) struct FeatureExtractor {
    stages: Vec<ConvStage>,
}

impl FeatureExtractor {
    pub(crate) fn load(cfg: &EncoderConfig, vb: VarBuilder) -> candle_core::Result<Self> {
        let mut stages = Vec::with_capacity(cfg.conv_channels.len());
        let mut in_c = 1;
        for (i, (&out_c, &pool)) in cfg.conv_channels.iter().zip(Pool::SCHEDULE.iter()).enumerate() {
            stages.push(ConvStage::load(in_c, out_c, pool, vb.pp(format!("conv_stages.{i}")))?);
            in_c = out_c;
        }
        Ok(Self { stages })
    }
}

impl ModuleT for FeatureExtractor {
    fn forward_t(&self, xs: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        let mut h = xs.clone();
        for stage in &self.stages {
            h = stage.forward_t(&h, train)?;
        }
        Ok(h)
    }
}
