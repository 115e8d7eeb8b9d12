use burn::module::Module;
use burn::nn::{Linear, LinearConfig};
use burn::tensor::activation::{relu, softmax};
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

/// Two-layer categorical policy: observations in, action probabilities out.
#[derive(Module, Debug)]
pub struct PolicyNet<B: Backend> {
    fc1: Linear<B>,
    fc2: Linear<B>,
}

impl<B: Backend> PolicyNet<B> {
    pub fn new(state_dim: usize, hidden: usize, action_dim: usize, device: &B::Device) -> Self {
        let fc1 = LinearConfig::new(state_dim, hidden).init(device);
        let fc2 = LinearConfig::new(hidden, action_dim).init(device);
        Self { fc1, fc2 }
    }

    fn logits(&self, obs: Tensor<B, 2>) -> Tensor<B, 2> {
        let h = relu(self.fc1.forward(obs));
        self.fc2.forward(h)
    }

    /// `[batch, state_dim]` -> `[batch, action_dim]`, each row summing to 1.
    pub fn forward(&self, obs: Tensor<B, 2>) -> Tensor<B, 2> {
        softmax(self.logits(obs), 1)
    }

    /// Policy whose output head is all zeros, i.e. uniform over actions.
    #[cfg(test)]
    pub(crate) fn uniform(
        state_dim: usize,
        hidden: usize,
        action_dim: usize,
        device: &B::Device,
    ) -> Self {
        use burn::nn::Initializer;

        let fc1 = LinearConfig::new(state_dim, hidden).init(device);
        let fc2 = LinearConfig::new(hidden, action_dim)
            .with_initializer(Initializer::Zeros)
            .init(device);
        Self { fc1, fc2 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::autodiff::Autodiff;
    use burn::tensor::{Distribution, TensorData};
    use burn_ndarray::{NdArray, NdArrayDevice};

    type TestBackend = Autodiff<NdArray<f32>>;

    #[test]
    fn rows_are_probability_distributions() {
        let device = NdArrayDevice::Cpu;
        let policy = PolicyNet::<TestBackend>::new(4, 128, 2, &device);
        let obs = Tensor::<TestBackend, 2>::random([32, 4], Distribution::Normal(0.0, 3.0), &device);

        let probs = policy.forward(obs);
        assert_eq!(probs.dims(), [32, 2]);

        let values: Vec<f32> = probs.to_data().to_vec().unwrap();
        assert!(values.iter().all(|p| *p >= 0.0));
        for row in values.chunks_exact(2) {
            assert!((row[0] + row[1] - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn uniform_policy_is_even() {
        let device = NdArrayDevice::Cpu;
        let policy = PolicyNet::<TestBackend>::uniform(4, 8, 2, &device);
        let obs = Tensor::<TestBackend, 2>::from_data(
            TensorData::new(vec![0.3f32, -1.0, 2.0, 0.5], [1, 4]),
            &device,
        );

        let values: Vec<f32> = policy.forward(obs).to_data().to_vec().unwrap();
        assert!((values[0] - 0.5).abs() < 1e-6);
        assert!((values[1] - 0.5).abs() < 1e-6);
    }
}
