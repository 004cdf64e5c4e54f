use candle_core::{D, ModuleT, Tensor};
use candle_nn::{Dropout, LSTM, LSTMConfig, RNN, VarBuilder};

/// Reverse a `(B, T, F)` tensor along the time axis.
fn reverse_time(xs: &Tensor) -> candle_core::Result<Tensor> {
    let steps = xs.dim(1)?;
    let order: Vec<u32> = (0..steps as u32).rev().collect();
    let order = Tensor::new(order.as_slice(), xs.device())?;
    xs.index_select(&order, 1)?.contiguous()
}

/// One bidirectional LSTM layer; output is `[forward ; backward]` per step.
struct BiLstmLayer {
    forward: LSTM,
    backward: LSTM,
}

impl BiLstmLayer {
    fn load(in_dim: usize, hidden: usize, vb: VarBuilder) -> candle_core::Result<Self> {
        Ok(Self {
            forward: candle_nn::lstm(in_dim, hidden, LSTMConfig::default(), vb.pp("forward"))?,
            backward: candle_nn::lstm(in_dim, hidden, LSTMConfig::default(), vb.pp("backward"))?,
        })
    }

    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let fwd = self.forward.states_to_tensor(&self.forward.seq(xs)?)?;

        let reversed = reverse_time(xs)?;
        let bwd = self.backward.states_to_tensor(&self.backward.seq(&reversed)?)?;
        let bwd = reverse_time(&bwd)?;

        Tensor::cat(&[&fwd, &bwd], D::Minus1)
    }
}

/// Stacked bidirectional LSTM with dropout between layers.
pub(crate) struct BiLstm {
    layers: Vec<BiLstmLayer>,
    dropout: Dropout,
}

impl BiLstm {
    pub(crate) fn load(
        in_dim: usize,
        hidden: usize,
        num_layers: usize,
        dropout: f32,
        vb: VarBuilder,
    ) -> candle_core::Result<Self> {
        let mut layers = Vec::with_capacity(num_layers);
        for i in 0..num_layers {
            let layer_in = if i == 0 { in_dim } else { hidden * 2 };
            layers.push(BiLstmLayer::load(layer_in, hidden, vb.pp(format!("layers.{i}")))?);
        }
        Ok(Self {
            layers,
            dropout: Dropout::new(dropout),
        })
    }
}

impl ModuleT for BiLstm {
    fn forward_t(&self, xs: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        let mut h = xs.contiguous()?;
        for (i, layer) in self.layers.iter().enumerate() {
            if i > 0 {
                h = self.dropout.forward_t(&h, train)?;
            }
            h = layer.forward(&h)?;
        }
        Ok(h)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn reverse_time_flips_steps() {
        let xs = Tensor::arange(0f32, 6., &Device::Cpu).unwrap().reshape((1, 3, 2)).unwrap();
        let rev = reverse_time(&xs).unwrap();
        assert_eq!(
            rev.to_vec3::<f32>().unwrap(),
            vec![vec![vec![4., 5.], vec![2., 3.], vec![0., 1.]]]
        );
    }

    #[test]
    fn bilstm_concatenates_directions() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let rnn = BiLstm::load(6, 4, 2, 0.2, vb).unwrap();

        let xs = Tensor::randn(0f32, 1., (3, 5, 6), &Device::Cpu).unwrap();
        let out = rnn.forward_t(&xs, false).unwrap();
        assert_eq!(out.dims(), &[3, 5, 8]);
    }

    #[test]
    fn backward_direction_sees_future_context() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let layer = BiLstmLayer::load(2, 3, vb).unwrap();

        let a = Tensor::zeros((1, 4, 2), DType::F32, &Device::Cpu).unwrap();
        let mut b_data = vec![0f32; 8];
        b_data[6] = 5.0; // only the last step differs
        let b = Tensor::from_vec(b_data, (1, 4, 2), &Device::Cpu).unwrap();

        let out_a = layer.forward(&a).unwrap().to_vec3::<f32>().unwrap();
        let out_b = layer.forward(&b).unwrap().to_vec3::<f32>().unwrap();

        // Forward half at step 0 cannot see step 3; backward half can.
        assert_eq!(out_a[0][0][..3], out_b[0][0][..3]);
        assert_ne!(out_a[0][0][3..], out_b[0][0][3..]);
    }
}
