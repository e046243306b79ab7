//! Segmentation model interface and a small convolutional implementation

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{Conv2d, Conv2dConfig, Dropout, Module, VarBuilder, VarMap};
use tracing::debug;

use crate::error::{Error, Result};
use crate::training::config::ModelConfig;
use crate::training::optimizers::ParamGroup;

/// A model mapping `[N, C, H, W]` images to `[N, K, H, W]` logits
pub trait SegmentationModel: Send {
    /// Forward pass
    fn forward(&self, images: &Tensor) -> Result<Tensor>;

    /// Switch between training and evaluation behaviour
    fn set_training(&mut self, _training: bool) {}

    /// Number of output classes
    fn num_classes(&self) -> usize;
}

/// Two 3x3 convolutions followed by a 1x1 classification head
///
/// Parameters live under the `encoder.` and `head.` prefixes of the owned
/// [`VarMap`], which is how [`ConvSegmenter::param_groups`] splits them.
pub struct ConvSegmenter {
    var_map: VarMap,
    conv1: Conv2d,
    conv2: Conv2d,
    head: Conv2d,
    dropout: Dropout,
    training: bool,
    num_classes: usize,
}

impl ConvSegmenter {
    /// Build a freshly initialised model on `device`
    pub fn new(config: &ModelConfig, device: &Device) -> Result<Self> {
        config.validate()?;
        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, device);

        let same = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let conv1 = candle_nn::conv2d(
            config.in_channels,
            config.hidden_channels,
            3,
            same,
            vb.pp("encoder.conv1"),
        )?;
        let conv2 = candle_nn::conv2d(
            config.hidden_channels,
            config.hidden_channels,
            3,
            same,
            vb.pp("encoder.conv2"),
        )?;
        let head = candle_nn::conv2d(
            config.hidden_channels,
            config.num_classes,
            1,
            Conv2dConfig::default(),
            vb.pp("head.conv"),
        )?;

        debug!(
            "Built ConvSegmenter with {} parameter tensors",
            var_map.all_vars().len()
        );

        Ok(Self {
            var_map,
            conv1,
            conv2,
            head,
            dropout: Dropout::new(config.dropout as f32),
            training: true,
            num_classes: config.num_classes,
        })
    }

    /// Underlying parameter store
    pub fn var_map(&self) -> &VarMap {
        &self.var_map
    }

    /// All trainable variables, ordered by name
    pub fn vars(&self) -> Result<Vec<Var>> {
        Ok(self.named_vars("")?.into_iter().map(|(_, v)| v).collect())
    }

    /// Encoder and head parameter groups with their learning-rate scales
    pub fn param_groups(&self, lr: f64, encoder_lr_scale: f64, head_lr_scale: f64) -> Result<Vec<ParamGroup>> {
        let encoder = self.named_vars("encoder.")?.into_iter().map(|(_, v)| v).collect();
        let head = self.named_vars("head.")?.into_iter().map(|(_, v)| v).collect();
        Ok(vec![
            ParamGroup::new("encoder", encoder, lr, encoder_lr_scale),
            ParamGroup::new("head", head, lr, head_lr_scale),
        ])
    }

    fn named_vars(&self, prefix: &str) -> Result<Vec<(String, Var)>> {
        let data = self
            .var_map
            .data()
            .lock()
            .map_err(|_| Error::training("parameter store lock poisoned"))?;
        let mut vars: Vec<(String, Var)> = data
            .iter()
            .filter(|(name, _)| name.starts_with(prefix))
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect();
        vars.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(vars)
    }
}

impl SegmentationModel for ConvSegmenter {
    fn forward(&self, images: &Tensor) -> Result<Tensor> {
        let hidden = self.conv1.forward(images)?.relu()?;
        let hidden = self.conv2.forward(&hidden)?.relu()?;
        let hidden = self.dropout.forward(&hidden, self.training)?;
        Ok(self.head.forward(&hidden)?)
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    fn num_classes(&self) -> usize {
        self.num_classes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_shape() {
        let config = ModelConfig {
            num_classes: 3,
            ..Default::default()
        };
        let model = ConvSegmenter::new(&config, &Device::Cpu).unwrap();
        let images = Tensor::zeros((2, 1, 8, 6), DType::F32, &Device::Cpu).unwrap();
        let logits = model.forward(&images).unwrap();
        assert_eq!(logits.dims(), &[2, 3, 8, 6]);
        assert_eq!(model.num_classes(), 3);
    }

    #[test]
    fn test_param_groups_split_by_prefix() {
        let model = ConvSegmenter::new(&ModelConfig::default(), &Device::Cpu).unwrap();
        let groups = model.param_groups(1e-3, 0.1, 1.0).unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].name, "encoder");
        assert_eq!(groups[0].vars.len(), 4);
        assert_eq!(groups[1].vars.len(), 2);
        assert_eq!(groups[0].lr_scale, 0.1);
        assert_eq!(model.vars().unwrap().len(), 6);
    }
}
