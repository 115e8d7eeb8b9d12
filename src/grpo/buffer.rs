use anyhow::{bail, Result};
use burn::tensor::backend::Backend;
use burn::tensor::{Int, Tensor, TensorData};

/// Step-major recording of one collection pass, `[max_steps, num_envs]`.
///
/// Storage is preallocated for the full horizon; `steps` counts how many
/// timesteps were actually written before the collector stopped.
pub struct Rollout {
    max_steps: usize,
    num_envs: usize,
    obs_dim: usize,
    steps: usize,
    obs: Vec<f32>,
    actions: Vec<i64>,
    log_probs: Vec<f32>,
}

impl Rollout {
    pub fn new(max_steps: usize, num_envs: usize, obs_dim: usize) -> Self {
        Self {
            max_steps,
            num_envs,
            obs_dim,
            steps: 0,
            obs: vec![0.0; max_steps * num_envs * obs_dim],
            actions: vec![0; max_steps * num_envs],
            log_probs: vec![0.0; max_steps * num_envs],
        }
    }

    /// Appends timestep `self.steps` for every environment at once.
    pub fn push_step(&mut self, obs: &[f32], actions: &[usize], log_probs: &[f32]) -> Result<()> {
        if self.steps >= self.max_steps {
            bail!("rollout already holds {} steps", self.max_steps);
        }
        if obs.len() != self.num_envs * self.obs_dim
            || actions.len() != self.num_envs
            || log_probs.len() != self.num_envs
        {
            bail!(
                "step shape mismatch: obs={} actions={} log_probs={} for {} envs of dim {}",
                obs.len(),
                actions.len(),
                log_probs.len(),
                self.num_envs,
                self.obs_dim
            );
        }

        let t = self.steps;
        let row = t * self.num_envs;
        let obs_base = row * self.obs_dim;
        self.obs[obs_base..obs_base + obs.len()].copy_from_slice(obs);
        for e in 0..self.num_envs {
            self.actions[row + e] = actions[e] as i64;
            self.log_probs[row + e] = log_probs[e];
        }
        self.steps += 1;
        Ok(())
    }

    /// Transposes the written steps into episode-major records.
    pub fn into_trajectories(self, totals: &[f32]) -> Result<Trajectories> {
        if totals.len() != self.num_envs {
            bail!(
                "expected {} reward totals, got {}",
                self.num_envs,
                totals.len()
            );
        }
        if self.steps == 0 {
            bail!("cannot build trajectories from an empty rollout");
        }

        let (n, len, d) = (self.num_envs, self.steps, self.obs_dim);
        let mut states = vec![0.0f32; n * len * d];
        let mut actions = vec![0i64; n * len];
        let mut log_probs = vec![0.0f32; n * len];

        for e in 0..n {
            for t in 0..len {
                let src = t * n + e;
                let dst = e * len + t;
                actions[dst] = self.actions[src];
                log_probs[dst] = self.log_probs[src];
                states[dst * d..(dst + 1) * d]
                    .copy_from_slice(&self.obs[src * d..(src + 1) * d]);
            }
        }

        // Divided by the configured horizon even when collection stopped early.
        let horizon = self.max_steps as f32;
        let normalized_rewards = totals.iter().map(|r| r / horizon).collect::<Vec<_>>();
        let episode_rewards = normalized_rewards.iter().map(|r| r * horizon).collect();

        Ok(Trajectories {
            num_episodes: n,
            steps: len,
            obs_dim: d,
            states,
            actions,
            log_probs,
            normalized_rewards,
            episode_rewards,
        })
    }
}

/// One GRPO group: `num_episodes` equal-length records, episode dimension first.
#[derive(Clone, Debug)]
pub struct Trajectories {
    pub num_episodes: usize,
    pub steps: usize,
    pub obs_dim: usize,
    /// `[num_episodes, steps, obs_dim]`
    pub states: Vec<f32>,
    /// `[num_episodes, steps]`
    pub actions: Vec<i64>,
    /// `[num_episodes, steps]`, log-probabilities at collection time.
    pub log_probs: Vec<f32>,
    /// Per-episode shaped return divided by the collection horizon.
    pub normalized_rewards: Vec<f32>,
    /// `normalized_rewards` scaled back by the horizon; used for logging and early stop.
    pub episode_rewards: Vec<f32>,
}

impl Trajectories {
    pub fn mean_episode_reward(&self) -> f32 {
        if self.episode_rewards.is_empty() {
            return 0.0;
        }
        self.episode_rewards.iter().sum::<f32>() / self.episode_rewards.len() as f32
    }

    pub fn max_episode_reward(&self) -> f32 {
        self.episode_rewards
            .iter()
            .copied()
            .fold(f32::NEG_INFINITY, f32::max)
    }

    pub fn min_episode_reward(&self) -> f32 {
        self.episode_rewards
            .iter()
            .copied()
            .fold(f32::INFINITY, f32::min)
    }

    /// States flattened to `[num_episodes * steps, obs_dim]` for one forward pass.
    pub fn states_tensor<B: Backend>(&self, device: &B::Device) -> Tensor<B, 2> {
        Tensor::<B, 2>::from_data(
            TensorData::new(
                self.states.clone(),
                [self.num_episodes * self.steps, self.obs_dim],
            ),
            device,
        )
    }

    pub fn actions_tensor<B: Backend>(&self, device: &B::Device) -> Tensor<B, 1, Int> {
        Tensor::<B, 1, Int>::from_data(
            TensorData::new(self.actions.clone(), [self.num_episodes * self.steps]),
            device,
        )
    }

    pub fn log_probs_tensor<B: Backend>(&self, device: &B::Device) -> Tensor<B, 2> {
        Tensor::<B, 2>::from_data(
            TensorData::new(self.log_probs.clone(), [self.num_episodes, self.steps]),
            device,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transposes_to_episode_major() {
        let mut roll = Rollout::new(4, 2, 1);
        roll.push_step(&[10.0, 20.0], &[0, 1], &[-0.1, -0.2]).unwrap();
        roll.push_step(&[11.0, 21.0], &[1, 1], &[-0.3, -0.4]).unwrap();
        roll.push_step(&[12.0, 22.0], &[0, 0], &[-0.5, -0.6]).unwrap();

        let traj = roll.into_trajectories(&[2.0, 4.0]).unwrap();

        assert_eq!(traj.steps, 3);
        assert_eq!(traj.states, vec![10.0, 11.0, 12.0, 20.0, 21.0, 22.0]);
        assert_eq!(traj.actions, vec![0, 1, 0, 1, 1, 0]);
        assert_eq!(traj.log_probs, vec![-0.1, -0.3, -0.5, -0.2, -0.4, -0.6]);
    }

    #[test]
    fn normalizes_by_horizon_not_steps_taken() {
        let mut roll = Rollout::new(10, 2, 1);
        roll.push_step(&[0.0, 0.0], &[0, 0], &[0.0, 0.0]).unwrap();
        roll.push_step(&[0.0, 0.0], &[0, 0], &[0.0, 0.0]).unwrap();

        let traj = roll.into_trajectories(&[2.0, 1.0]).unwrap();

        assert_eq!(traj.steps, 2);
        assert!((traj.normalized_rewards[0] - 0.2).abs() < 1e-6);
        assert!((traj.normalized_rewards[1] - 0.1).abs() < 1e-6);
        assert!((traj.episode_rewards[0] - 2.0).abs() < 1e-5);
        assert!((traj.mean_episode_reward() - 1.5).abs() < 1e-5);
    }

    #[test]
    fn rejects_overflow_and_bad_shapes() {
        let mut roll = Rollout::new(1, 2, 2);
        assert!(roll.push_step(&[0.0; 3], &[0, 0], &[0.0, 0.0]).is_err());
        roll.push_step(&[0.0; 4], &[0, 0], &[0.0, 0.0]).unwrap();
        assert!(roll.push_step(&[0.0; 4], &[0, 0], &[0.0, 0.0]).is_err());
    }

    #[test]
    fn empty_rollout_is_an_error() {
        let roll = Rollout::new(3, 1, 4);
        assert!(roll.into_trajectories(&[0.0]).is_err());
    }
}
