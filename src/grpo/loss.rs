use anyhow::Result;
use burn::tensor::backend::Backend;
use burn::tensor::{Distribution, Int, Tensor};

pub const ADVANTAGE_EPS: f32 = 1.0e-8;

/// Inverse-CDF sampling of one action per row of `probs`.
pub fn sample_actions_categorical<B: Backend>(
    probs: Tensor<B, 2>,
    device: &B::Device,
) -> Tensor<B, 1, Int> {
    let [batch_size, action_dim] = probs.dims();

    let u = Tensor::<B, 2>::random(
        [batch_size, 1],
        Distribution::Uniform(1.0e-6, 1.0 - 1.0e-6),
        device,
    );
    let cdf = probs.cumsum(1);

    // Rounding can leave the last cdf entry below u; keep the index in range.
    cdf.lower(u)
        .int()
        .sum_dim(1)
        .reshape([batch_size])
        .clamp_max((action_dim - 1) as i32)
}

/// `log(probs[i, actions[i]])`, unguarded: a zero probability yields -inf.
pub fn chosen_log_probs<B: Backend>(
    probs: Tensor<B, 2>,
    actions: Tensor<B, 1, Int>,
) -> Tensor<B, 1> {
    let bsz = actions.dims()[0];
    probs
        .gather(1, actions.reshape([bsz, 1]))
        .reshape([bsz])
        .log()
}

/// Reads an action tensor back to host indices.
pub fn actions_to_vec<B: Backend>(actions: Tensor<B, 1, Int>) -> Result<Vec<usize>> {
    let data = actions.to_data();
    let values: Vec<i64> = match data.clone().to_vec::<i32>() {
        Ok(v) => v.into_iter().map(i64::from).collect(),
        Err(_) => data
            .to_vec::<i64>()
            .map_err(|e| anyhow::anyhow!("failed to convert sampled actions: {e:?}"))?,
    };
    Ok(values.into_iter().map(|v| v.max(0) as usize).collect())
}

fn mean(values: &[f32]) -> f32 {
    values.iter().sum::<f32>() / values.len() as f32
}

/// Sample (N-1) standard deviation; zero for fewer than two values.
pub fn sample_std(values: &[f32]) -> f32 {
    let n = values.len();
    if n < 2 {
        return 0.0;
    }
    let mean = mean(values);
    let var = values
        .iter()
        .map(|v| {
            let d = v - mean;
            d * d
        })
        .sum::<f32>()
        / (n - 1) as f32;
    var.sqrt()
}

/// Group-relative baseline: z-score of each episode's reward within the batch.
///
/// A batch with fewer than two episodes has no spread, so every advantage is
/// exactly zero.
pub fn group_advantages(rewards: &[f32]) -> Vec<f32> {
    if rewards.is_empty() {
        return Vec::new();
    }
    let mean = mean(rewards);
    let denom = sample_std(rewards) + ADVANTAGE_EPS;
    rewards.iter().map(|r| (r - mean) / denom).collect()
}

/// PPO-clip surrogate with one advantage per episode.
///
/// `new_lp` and `old_lp` are `[episodes, steps]`, `advantages` is
/// `[episodes, 1]`. Each episode contributes `-mean_t(min(r*A, clip(r)*A))`;
/// the result is the sum over episodes divided by their count.
pub fn clipped_surrogate_loss<B: Backend>(
    new_lp: Tensor<B, 2>,
    old_lp: Tensor<B, 2>,
    advantages: Tensor<B, 2>,
    clip_eps: f32,
) -> Tensor<B, 1> {
    let [episodes, steps] = new_lp.dims();
    let adv = advantages.repeat_dim(1, steps);

    let ratio = (new_lp - old_lp).exp();
    let clipped = ratio.clone().clamp(1.0 - clip_eps, 1.0 + clip_eps);

    let surr1 = ratio * adv.clone();
    let surr2 = clipped * adv;

    let min_surr = (surr1.clone() + surr2.clone() - (surr1 - surr2).abs()) * 0.5;
    let episode_losses = min_surr.mean_dim(1).neg();

    episode_losses.sum().div_scalar(episodes as f32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::autodiff::Autodiff;
    use burn::tensor::TensorData;
    use burn_ndarray::{NdArray, NdArrayDevice};

    type TestBackend = Autodiff<NdArray<f32>>;

    fn tensor2(values: Vec<f32>, shape: [usize; 2]) -> Tensor<TestBackend, 2> {
        Tensor::from_data(TensorData::new(values, shape), &NdArrayDevice::Cpu)
    }

    fn scalar(t: Tensor<TestBackend, 1>) -> f32 {
        t.to_data().to_vec::<f32>().unwrap()[0]
    }

    #[test]
    fn sample_std_uses_bessel_correction() {
        assert!((sample_std(&[1.0, 3.0]) - 2.0f32.sqrt()).abs() < 1e-6);
        assert_eq!(sample_std(&[7.0]), 0.0);
    }

    #[test]
    fn advantages_are_standardized() {
        let rewards = [0.1, 0.5, 0.2, 0.9, 0.35, 0.6];
        let adv = group_advantages(&rewards);

        assert!(mean(&adv).abs() < 1e-5);
        assert!((sample_std(&adv) - 1.0).abs() < 1e-4);
        assert!(adv[3] > adv[1] && adv[1] > adv[0]);
    }

    #[test]
    fn identical_rewards_give_zero_advantage() {
        let adv = group_advantages(&[0.42; 5]);
        assert!(adv.iter().all(|a| *a == 0.0));
    }

    #[test]
    fn single_episode_advantage_is_zero() {
        assert_eq!(group_advantages(&[3.0]), vec![0.0]);
        assert!(group_advantages(&[]).is_empty());
    }

    #[test]
    fn unclipped_ratio_scales_advantage() {
        // ratio = 1 everywhere: loss = -mean(A).
        let lp = tensor2(vec![-0.7, -0.7, -0.2, -0.2], [2, 2]);
        let adv = tensor2(vec![1.0, -3.0], [2, 1]);

        let loss = clipped_surrogate_loss(lp.clone(), lp, adv, 0.2);
        assert!((scalar(loss) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn clipping_saturates_beyond_upper_bound() {
        let old = tensor2(vec![0.0], [1, 1]);
        let adv = tensor2(vec![2.0], [1, 1]);

        let at_double = clipped_surrogate_loss(
            tensor2(vec![2.0f32.ln()], [1, 1]),
            old.clone(),
            adv.clone(),
            0.2,
        );
        let at_triple =
            clipped_surrogate_loss(tensor2(vec![3.0f32.ln()], [1, 1]), old, adv, 0.2);

        assert!((scalar(at_double.clone()) + 2.4).abs() < 1e-5);
        assert!((scalar(at_double) - scalar(at_triple)).abs() < 1e-6);
    }

    #[test]
    fn clipping_saturates_below_lower_bound_for_negative_advantage() {
        let old = tensor2(vec![0.0], [1, 1]);
        let adv = tensor2(vec![-1.0], [1, 1]);

        let half = clipped_surrogate_loss(tensor2(vec![0.5f32.ln()], [1, 1]), old.clone(), adv.clone(), 0.2);
        let tenth = clipped_surrogate_loss(tensor2(vec![0.1f32.ln()], [1, 1]), old, adv, 0.2);

        assert!((scalar(half.clone()) - 0.8).abs() < 1e-5);
        assert!((scalar(half) - scalar(tenth)).abs() < 1e-6);
    }

    #[test]
    fn sampling_respects_degenerate_distributions() {
        let device = NdArrayDevice::Cpu;
        let probs = tensor2(vec![1.0, 0.0, 0.0, 1.0, 1.0, 0.0], [3, 2]);

        let actions = actions_to_vec(sample_actions_categorical(probs, &device)).unwrap();
        assert_eq!(actions, vec![0, 1, 0]);
    }

    #[test]
    fn chosen_log_probs_gather_taken_actions() {
        let device = NdArrayDevice::Cpu;
        let probs = tensor2(vec![0.25, 0.75, 0.5, 0.5], [2, 2]);
        let actions = Tensor::<TestBackend, 1, Int>::from_data(
            TensorData::new(vec![1i64, 0], [2]),
            &device,
        );

        let lp: Vec<f32> = chosen_log_probs(probs, actions).to_data().to_vec().unwrap();
        assert!((lp[0] - 0.75f32.ln()).abs() < 1e-6);
        assert!((lp[1] - 0.5f32.ln()).abs() < 1e-6);
    }

    #[test]
    fn zero_probability_action_gives_non_finite_loss() {
        let device = NdArrayDevice::Cpu;
        let probs = tensor2(vec![1.0, 0.0], [1, 2]);
        let actions =
            Tensor::<TestBackend, 1, Int>::from_data(TensorData::new(vec![1i64], [1]), &device);

        let lp = chosen_log_probs(probs, actions);
        let value = scalar(lp.clone());
        assert!(value.is_infinite() && value < 0.0);

        let lp = lp.reshape([1, 1]);
        let loss = clipped_surrogate_loss(lp.clone(), lp, tensor2(vec![1.0], [1, 1]), 0.2);
        assert!(!scalar(loss).is_finite());
    }
}
