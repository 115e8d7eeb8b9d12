use anyhow::{bail, Context, Result};
use burn::optim::{AdamConfig, GradientsParams, Optimizer};
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::{ElementConversion, Tensor, TensorData};
use std::time::{Duration, Instant};
use tracing::{debug, info, span, warn, Level};

use crate::checkpoint::{final_stem, save_policy, update_stem};
use crate::config::Args;
use crate::env::{make_env, VectorEnv};
use crate::grpo::buffer::{Rollout, Trajectories};
use crate::grpo::loss::{
    actions_to_vec, chosen_log_probs, clipped_surrogate_loss, group_advantages,
    sample_actions_categorical, sample_std,
};
use crate::models::PolicyNet;
use crate::plot::render_returns;

const ADAM_EPSILON: f32 = 1.0e-8;

/// Outcome of one call to [`train`].
#[derive(Clone, Debug, Default)]
pub struct TrainingReport {
    /// Average episode reward of every executed iteration, in order.
    pub returns: Vec<f32>,
    /// Surrogate loss of the last inner step of every iteration.
    pub losses: Vec<f32>,
    pub iterations: usize,
    pub stopped_early: bool,
    pub elapsed: Duration,
}

/// Runs one group of `num_envs` episodes for at most `max_steps` steps.
///
/// Done flags are sticky: once an env reports done its raw reward is zeroed
/// for the rest of the pass, but the position penalty `-|x|` of the next
/// observation is still added every step. Collection stops as soon as every
/// env has finished. `_gamma` is accepted for interface parity and unused.
pub fn collect_trajectories<B: Backend, E: VectorEnv + ?Sized>(
    env: &mut E,
    policy: &PolicyNet<B>,
    max_steps: usize,
    _gamma: f32,
    device: &B::Device,
) -> Result<Trajectories> {
    if max_steps == 0 {
        bail!("max_steps must be > 0");
    }
    let num_envs = env.num_envs();
    let obs_dim = env.observation_dim();
    if num_envs == 0 || obs_dim == 0 {
        bail!("environment reports num_envs={num_envs}, observation_dim={obs_dim}");
    }

    let mut obs = env.reset();
    if obs.len() != num_envs * obs_dim {
        bail!(
            "reset returned {} values, expected {}",
            obs.len(),
            num_envs * obs_dim
        );
    }

    let mut roll = Rollout::new(max_steps, num_envs, obs_dim);
    let mut totals = vec![0.0f32; num_envs];
    let mut all_done = vec![false; num_envs];

    for _ in 0..max_steps {
        let obs_t = Tensor::<B, 2>::from_data(
            TensorData::new(obs.clone(), [num_envs, obs_dim]),
            device,
        );
        let probs = policy.forward(obs_t).detach();
        let actions_t = sample_actions_categorical::<B>(probs.clone(), device);
        let log_probs = chosen_log_probs(probs, actions_t.clone())
            .to_data()
            .to_vec::<f32>()
            .map_err(|e| anyhow::anyhow!("failed to read log-probs: {e:?}"))?;
        let actions = actions_to_vec(actions_t)?;

        let step = env.step(&actions)?;
        if step.obs.len() != num_envs * obs_dim
            || step.rewards.len() != num_envs
            || step.dones.len() != num_envs
        {
            bail!(
                "step returned obs={} rewards={} dones={} for {num_envs} envs",
                step.obs.len(),
                step.rewards.len(),
                step.dones.len()
            );
        }

        roll.push_step(&obs, &actions, &log_probs)?;

        for e in 0..num_envs {
            all_done[e] |= step.dones[e];
            let raw = if all_done[e] { 0.0 } else { step.rewards[e] };
            totals[e] += raw - step.obs[e * obs_dim].abs();
        }

        obs = step.obs;
        if all_done.iter().all(|d| *d) {
            break;
        }
    }

    roll.into_trajectories(&totals)
}

/// `inner_iterations` clipped-surrogate steps on one group.
///
/// Returns the updated policy and the loss of the last inner step.
pub fn grpo_update<B, O>(
    traj: &Trajectories,
    mut policy: PolicyNet<B>,
    optim: &mut O,
    learning_rate: f64,
    inner_iterations: usize,
    clip_eps: f32,
    device: &B::Device,
) -> Result<(PolicyNet<B>, f32)>
where
    B: AutodiffBackend,
    O: Optimizer<PolicyNet<B>, B>,
{
    if inner_iterations == 0 {
        bail!("inner_iterations must be > 0");
    }

    let (episodes, steps) = (traj.num_episodes, traj.steps);
    let advantages = Tensor::<B, 2>::from_data(
        TensorData::new(group_advantages(&traj.normalized_rewards), [episodes, 1]),
        device,
    );
    let states = traj.states_tensor::<B>(device);
    let actions = traj.actions_tensor::<B>(device);
    let old_log_probs = traj.log_probs_tensor::<B>(device);

    let mut last_loss = 0.0f32;
    for _ in 0..inner_iterations {
        let probs = policy.forward(states.clone());
        let new_log_probs = chosen_log_probs(probs, actions.clone()).reshape([episodes, steps]);
        let loss = clipped_surrogate_loss(
            new_log_probs,
            old_log_probs.clone(),
            advantages.clone(),
            clip_eps,
        );

        let grads = GradientsParams::from_grads(loss.backward(), &policy);
        policy = optim.step(learning_rate, policy, grads);
        last_loss = loss.into_scalar().elem::<f32>();
    }

    Ok((policy, last_loss))
}

/// Adam with torch's default epsilon.
pub fn adam_config() -> AdamConfig {
    AdamConfig::new().with_epsilon(ADAM_EPSILON)
}

/// Outer GRPO loop against an already constructed environment.
pub fn train<B: AutodiffBackend, E: VectorEnv + ?Sized>(
    args: &Args,
    env: &mut E,
    device: &B::Device,
) -> Result<(PolicyNet<B>, TrainingReport)> {
    args.validate()?;
    if env.num_envs() != args.num_envs {
        bail!(
            "environment has {} copies, configuration asks for {}",
            env.num_envs(),
            args.num_envs
        );
    }

    let started = Instant::now();
    let reward_target = args.reward_target();
    let mut policy =
        PolicyNet::<B>::new(env.observation_dim(), args.hidden_dim, env.action_count(), device);
    let mut optim = adam_config().init::<B, PolicyNet<B>>();
    let mut report = TrainingReport::default();

    for iteration in 0..args.num_iterations {
        let iteration_span = span!(
            Level::INFO,
            "iteration_span",
            iteration,
            num_iterations = args.num_iterations
        );
        let _iteration_guard = iteration_span.enter();

        let rollout_started = Instant::now();
        let traj = collect_trajectories(env, &policy, args.max_steps, args.gamma, device)?;
        let rollout_elapsed = rollout_started.elapsed();

        let avg_reward = traj.mean_episode_reward();
        let steps_collected = traj.steps * traj.num_episodes;

        let (updated, loss) = grpo_update(
            &traj,
            policy,
            &mut optim,
            args.learning_rate,
            args.inner_iterations,
            args.clip_eps,
            device,
        )?;
        policy = updated;

        if !loss.is_finite() {
            warn!(category = "TRAINER", iteration, loss, "non-finite surrogate loss");
        }

        info!(category = "TRAINER", iteration, avg_reward, loss, "train");
        debug!(
            category = "ACTOR",
            max_reward = traj.max_episode_reward(),
            min_reward = traj.min_episode_reward(),
            reward_std = sample_std(&traj.episode_rewards),
            steps_collected,
            episode_steps = traj.steps,
            "actor"
        );
        debug!(
            category = "MISC",
            steps_per_second = steps_collected as f64 / rollout_elapsed.as_secs_f64().max(1e-9),
            learning_rate = args.learning_rate,
            "misc"
        );

        report.returns.push(avg_reward);
        report.losses.push(loss);
        report.iterations = iteration + 1;

        if args.checkpoint_interval > 0 && iteration != 0 && iteration % args.checkpoint_interval == 0
        {
            let stem = update_stem(&args.run_name, iteration);
            match save_policy(&policy, &args.weights_dir, &stem) {
                Ok(path) => {
                    info!(category = "CHECKPOINT", iteration, path = %path.display(), "checkpoint")
                }
                Err(err) => {
                    warn!(category = "CHECKPOINT", iteration, "checkpoint skipped: {err:#}")
                }
            }
        }

        if avg_reward > reward_target {
            info!(
                category = "TRAINER",
                iteration,
                avg_reward,
                reward_target,
                "reward target reached"
            );
            report.stopped_early = true;
            break;
        }
    }

    report.elapsed = started.elapsed();
    Ok((policy, report))
}

/// Builds the environment from `args`, trains, then persists the policy
/// and the reward curve.
pub fn run<B: AutodiffBackend>(args: Args, device: B::Device) -> Result<()> {
    args.validate()?;
    B::seed(&device, args.seed);

    let mut env = make_env(&args.task_id, args.num_envs, args.seed)?;

    info!(
        category = "MISC",
        task = %args.task_id,
        num_envs = args.num_envs,
        max_steps = args.max_steps,
        num_iterations = args.num_iterations,
        inner_iterations = args.inner_iterations,
        obs_dim = env.observation_dim(),
        action_dim = env.action_count(),
        "startup"
    );

    let (policy, report) = train::<B, _>(&args, &mut env, &device)?;

    info!(
        category = "TRAINER",
        iterations = report.iterations,
        stopped_early = report.stopped_early,
        elapsed_secs = report.elapsed.as_secs_f64(),
        "training finished"
    );

    let path = save_policy(&policy, &args.weights_dir, &final_stem(&args.run_name))
        .context("failed to save final checkpoint")?;
    info!(category = "CHECKPOINT", path = %path.display(), "saved final policy");

    let plot_path = args.resolved_plot_path();
    render_returns(&report.returns, &args.task_id, &plot_path)
        .with_context(|| format!("failed to render reward curve to {}", plot_path.display()))?;
    info!(category = "MISC", path = %plot_path.display(), "reward curve written");

    Ok(())
}
