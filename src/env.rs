use anyhow::{bail, Result};
use rand::{rngs::StdRng, Rng, SeedableRng};

const GRAVITY: f32 = 9.8;
const CART_MASS: f32 = 1.0;
const POLE_MASS: f32 = 0.1;
const POLE_HALF_LENGTH: f32 = 0.5;
const FORCE_MAG: f32 = 10.0;
const TAU: f32 = 0.02;
const X_THRESHOLD: f32 = 2.4;
const THETA_THRESHOLD: f32 = 12.0 * 2.0 * std::f32::consts::PI / 360.0;
const INIT_RANGE: f32 = 0.05;

pub const CARTPOLE_TASK_ID: &str = "CartPole-v1";
pub const CARTPOLE_MAX_EPISODE_STEPS: usize = 500;

/// Result of stepping every environment once.
///
/// `obs` is flat, `num_envs * observation_dim`. Environments that finished on
/// this step have already been reset, so their row holds the first
/// observation of the next episode.
#[derive(Clone, Debug)]
pub struct VecStep {
    pub obs: Vec<f32>,
    pub rewards: Vec<f32>,
    pub dones: Vec<bool>,
}

/// N copies of a discrete-action task advanced in lock-step.
pub trait VectorEnv {
    fn num_envs(&self) -> usize;

    fn observation_dim(&self) -> usize;

    fn action_count(&self) -> usize;

    /// Resets every copy and returns the flat batch of initial observations.
    fn reset(&mut self) -> Vec<f32>;

    fn step(&mut self, actions: &[usize]) -> Result<VecStep>;
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
struct CartPoleState {
    x: f32,
    x_dot: f32,
    theta: f32,
    theta_dot: f32,
}

impl CartPoleState {
    fn sample(rng: &mut StdRng) -> Self {
        Self {
            x: rng.random_range(-INIT_RANGE..INIT_RANGE),
            x_dot: rng.random_range(-INIT_RANGE..INIT_RANGE),
            theta: rng.random_range(-INIT_RANGE..INIT_RANGE),
            theta_dot: rng.random_range(-INIT_RANGE..INIT_RANGE),
        }
    }

    fn write_obs(&self, out: &mut [f32]) {
        out[0] = self.x;
        out[1] = self.x_dot;
        out[2] = self.theta;
        out[3] = self.theta_dot;
    }

    /// One explicit-Euler step of the classic cart-pole dynamics.
    fn advance(&mut self, push_right: bool) {
        let force = if push_right { FORCE_MAG } else { -FORCE_MAG };
        let cos_theta = self.theta.cos();
        let sin_theta = self.theta.sin();

        let total_mass = CART_MASS + POLE_MASS;
        let pole_mass_length = POLE_MASS * POLE_HALF_LENGTH;

        let temp = (force + pole_mass_length * self.theta_dot * self.theta_dot * sin_theta)
            / total_mass;
        let theta_acc = (GRAVITY * sin_theta - cos_theta * temp)
            / (POLE_HALF_LENGTH * (4.0 / 3.0 - POLE_MASS * cos_theta * cos_theta / total_mass));
        let x_acc = temp - pole_mass_length * theta_acc * cos_theta / total_mass;

        self.x += TAU * self.x_dot;
        self.x_dot += TAU * x_acc;
        self.theta += TAU * self.theta_dot;
        self.theta_dot += TAU * theta_acc;
    }

    fn is_terminal(&self) -> bool {
        self.x.abs() > X_THRESHOLD || self.theta.abs() > THETA_THRESHOLD
    }
}

/// Vectorized CartPole-v1 with gym vector-env semantics: reward 1.0 per step,
/// termination on cart/pole limits, truncation at `max_episode_steps`, and
/// automatic reset of finished copies.
pub struct CartPoleVecEnv {
    states: Vec<CartPoleState>,
    ticks: Vec<usize>,
    max_episode_steps: usize,
    rng: StdRng,
}

impl CartPoleVecEnv {
    pub const OBS_DIM: usize = 4;
    pub const ACTIONS: usize = 2;

    pub fn new(num_envs: usize, max_episode_steps: usize, seed: u64) -> Result<Self> {
        if num_envs == 0 {
            bail!("num_envs must be > 0");
        }
        if max_episode_steps == 0 {
            bail!("max_episode_steps must be > 0");
        }

        let mut rng = StdRng::seed_from_u64(seed);
        let states = (0..num_envs)
            .map(|_| CartPoleState::sample(&mut rng))
            .collect();

        Ok(Self {
            states,
            ticks: vec![0; num_envs],
            max_episode_steps,
            rng,
        })
    }

    fn observations(&self) -> Vec<f32> {
        let mut obs = vec![0.0f32; self.states.len() * Self::OBS_DIM];
        for (state, row) in self.states.iter().zip(obs.chunks_exact_mut(Self::OBS_DIM)) {
            state.write_obs(row);
        }
        obs
    }
}

impl VectorEnv for CartPoleVecEnv {
    fn num_envs(&self) -> usize {
        self.states.len()
    }

    fn observation_dim(&self) -> usize {
        Self::OBS_DIM
    }

    fn action_count(&self) -> usize {
        Self::ACTIONS
    }

    fn reset(&mut self) -> Vec<f32> {
        for (state, ticks) in self.states.iter_mut().zip(self.ticks.iter_mut()) {
            *state = CartPoleState::sample(&mut self.rng);
            *ticks = 0;
        }
        self.observations()
    }

    fn step(&mut self, actions: &[usize]) -> Result<VecStep> {
        let num_envs = self.states.len();
        if actions.len() != num_envs {
            bail!(
                "received {} actions for {} environments",
                actions.len(),
                num_envs
            );
        }
        if let Some(bad) = actions.iter().find(|a| **a >= Self::ACTIONS) {
            bail!("invalid CartPole action {bad}; expected 0 or 1");
        }

        // Gym's CartPole pays 1.0 on the terminating step as well.
        let rewards = vec![1.0f32; num_envs];
        let mut dones = vec![false; num_envs];

        for e in 0..num_envs {
            self.states[e].advance(actions[e] == 1);
            self.ticks[e] += 1;

            let terminated = self.states[e].is_terminal();
            let truncated = self.ticks[e] >= self.max_episode_steps;
            if terminated || truncated {
                dones[e] = true;
                self.states[e] = CartPoleState::sample(&mut self.rng);
                self.ticks[e] = 0;
            }
        }

        Ok(VecStep {
            obs: self.observations(),
            rewards,
            dones,
        })
    }
}

/// Builds the vectorized environment registered under `task_id`.
pub fn make_env(task_id: &str, num_envs: usize, seed: u64) -> Result<Box<dyn VectorEnv>> {
    match task_id {
        CARTPOLE_TASK_ID => Ok(Box::new(CartPoleVecEnv::new(
            num_envs,
            CARTPOLE_MAX_EPISODE_STEPS,
            seed,
        )?)),
        other => bail!("unknown task_id '{other}'; registered tasks: {CARTPOLE_TASK_ID}"),
    }
}

impl<E: VectorEnv + ?Sized> VectorEnv for Box<E> {
    fn num_envs(&self) -> usize {
        (**self).num_envs()
    }

    fn observation_dim(&self) -> usize {
        (**self).observation_dim()
    }

    fn action_count(&self) -> usize {
        (**self).action_count()
    }

    fn reset(&mut self) -> Vec<f32> {
        (**self).reset()
    }

    fn step(&mut self, actions: &[usize]) -> Result<VecStep> {
        (**self).step(actions)
    }
}
