use anyhow::{bail, Context, Result};
use clap::{parser::ValueSource, ArgMatches, CommandFactory, Parser, ValueEnum};
use serde::Deserialize;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

#[derive(Copy, Clone, Debug, ValueEnum, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Cuda,
    Cpu,
}

#[derive(Parser, Debug, Clone)]
#[command(name = "grpo")]
pub struct Args {
    /// Optional YAML config file path.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Environment task id (only "CartPole-v1" is registered)
    #[arg(long, default_value = "CartPole-v1")]
    pub task_id: String,

    /// Number of parallel envs; also the GRPO group size
    #[arg(long, default_value_t = 50)]
    pub num_envs: usize,

    /// Maximum steps collected per episode (T)
    #[arg(long, default_value_t = 500)]
    pub max_steps: usize,

    /// Outer training iterations (collect + update)
    #[arg(long, default_value_t = 100)]
    pub num_iterations: usize,

    /// Gradient steps per collected batch
    #[arg(long, default_value_t = 20)]
    pub inner_iterations: usize,

    /// Discount factor. Accepted for compatibility; the collector does not apply it.
    #[arg(long, default_value_t = 0.99)]
    pub gamma: f32,

    /// Early stop when the average episode reward exceeds max_steps - stop_margin
    #[arg(long, default_value_t = 5.0)]
    pub stop_margin: f32,

    /// PPO clip epsilon
    #[arg(long, default_value_t = 0.2)]
    pub clip_eps: f32,

    /// Policy LR (Adam)
    #[arg(long, default_value_t = 1e-3)]
    pub learning_rate: f64,

    /// Hidden dim of the policy MLP
    #[arg(long, default_value_t = 128)]
    pub hidden_dim: usize,

    /// RNG seed
    #[arg(long, default_value_t = 0)]
    pub seed: u64,

    /// CUDA device index (0 = cuda:0)
    #[arg(long, default_value_t = 0)]
    pub cuda_device: usize,

    /// Device backend to use: cuda or cpu
    #[arg(long, value_enum, default_value_t = DeviceType::Cuda)]
    pub device_type: DeviceType,

    /// Directory receiving policy checkpoints (must already exist)
    #[arg(long, default_value = "./weights")]
    pub weights_dir: PathBuf,

    /// Checkpoint file stem
    #[arg(long, default_value = "grpo_cartpole_policy_update")]
    pub run_name: String,

    /// Iterations between intermediate checkpoints (0 disables them)
    #[arg(long, default_value_t = 0)]
    pub checkpoint_interval: usize,

    /// Reward curve output; defaults to <weights_dir>/<run_name>_returns.svg
    #[arg(long)]
    pub plot_path: Option<PathBuf>,

    /// Base tracing level used when RUST_LOG is not set.
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Show backend (CubeCL/CUDA) context logs in dashboard output.
    #[arg(long, default_value_t = false)]
    pub backend_logs_visible: bool,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            config: None,
            task_id: "CartPole-v1".to_string(),
            num_envs: 50,
            max_steps: 500,
            num_iterations: 100,
            inner_iterations: 20,
            gamma: 0.99,
            stop_margin: 5.0,
            clip_eps: 0.2,
            learning_rate: 1e-3,
            hidden_dim: 128,
            seed: 0,
            cuda_device: 0,
            device_type: DeviceType::Cuda,
            weights_dir: PathBuf::from("./weights"),
            run_name: "grpo_cartpole_policy_update".to_string(),
            checkpoint_interval: 0,
            plot_path: None,
            log_level: "info".to_string(),
            backend_logs_visible: false,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    environment: EnvironmentConfig,
    training: TrainingConfig,
    optimization: OptimizationConfig,
    architecture: ArchitectureConfig,
    hardware: HardwareConfig,
    output: OutputConfig,
    logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
struct EnvironmentConfig {
    task_id: Option<String>,
    num_envs: Option<usize>,
    max_steps: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
struct TrainingConfig {
    num_iterations: Option<usize>,
    inner_iterations: Option<usize>,
    gamma: Option<f32>,
    stop_margin: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
struct OptimizationConfig {
    clip_eps: Option<f32>,
    learning_rate: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
struct ArchitectureConfig {
    hidden_dim: Option<usize>,
    seed: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
struct HardwareConfig {
    device_type: Option<DeviceType>,
    cuda_device: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
struct OutputConfig {
    weights_dir: Option<PathBuf>,
    run_name: Option<String>,
    checkpoint_interval: Option<usize>,
    plot_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
struct LoggingConfig {
    log_level: Option<String>,
    backend_logs_visible: Option<bool>,
}

impl Args {
    pub fn default_tracing_filter(&self) -> String {
        let mut directives = vec![self.log_level.trim().to_string()];

        if !self.backend_logs_visible {
            directives.push("cubecl_cuda=off".to_string());
            directives.push("cubecl_runtime=off".to_string());
        }

        directives.join(",")
    }

    pub fn load() -> Result<Self> {
        Self::load_from(std::env::args_os())
    }

    pub fn load_from<I, T>(argv: I) -> Result<Self>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        let argv = argv.into_iter().map(Into::into).collect::<Vec<OsString>>();
        let cli_args = Self::try_parse_from(&argv)
            .map_err(|e| anyhow::anyhow!(e.to_string()))
            .context("failed to parse CLI arguments")?;
        let matches = Self::command()
            .try_get_matches_from(&argv)
            .map_err(|e| anyhow::anyhow!(e.to_string()))
            .context("failed to parse CLI arguments")?;

        let mut merged = Self::default();

        if let Some(config_path) = cli_args.config.as_deref() {
            let file_config = Self::load_file_config(config_path)?;
            merged.apply_config_file(file_config);
        }

        merged.apply_cli_overrides(&cli_args, &matches);
        merged.config = cli_args.config;

        Ok(merged)
    }

    /// Rejects settings the trainer cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.num_envs == 0 {
            bail!("num_envs must be > 0");
        }
        if self.max_steps == 0 {
            bail!("max_steps must be > 0");
        }
        if self.inner_iterations == 0 {
            bail!("inner_iterations must be > 0");
        }
        if self.hidden_dim == 0 {
            bail!("hidden_dim must be > 0");
        }
        if !(self.clip_eps > 0.0 && self.clip_eps < 1.0) {
            bail!("clip_eps must be in (0, 1), got {}", self.clip_eps);
        }
        if self.run_name.trim().is_empty() {
            bail!("run_name must not be empty");
        }
        Ok(())
    }

    /// Early-stop threshold on the average episode reward.
    pub fn reward_target(&self) -> f32 {
        self.max_steps as f32 - self.stop_margin
    }

    pub fn resolved_plot_path(&self) -> PathBuf {
        self.plot_path.clone().unwrap_or_else(|| {
            self.weights_dir
                .join(format!("{}_returns.svg", self.run_name))
        })
    }

    fn load_file_config(path: &Path) -> Result<FileConfig> {
        let resolved = if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir()
                .context("failed to get current working directory")?
                .join(path)
        };

        let content = std::fs::read_to_string(&resolved)
            .with_context(|| format!("failed to read config file at {}", resolved.display()))?;

        serde_yaml::from_str::<FileConfig>(&content)
            .with_context(|| format!("failed to parse YAML config at {}", resolved.display()))
    }

    fn apply_config_file(&mut self, file: FileConfig) {
        macro_rules! set_if_some {
            ($field:ident, $value:expr) => {
                if let Some(value) = $value {
                    self.$field = value;
                }
            };
        }

        set_if_some!(task_id, file.environment.task_id);
        set_if_some!(num_envs, file.environment.num_envs);
        set_if_some!(max_steps, file.environment.max_steps);

        set_if_some!(num_iterations, file.training.num_iterations);
        set_if_some!(inner_iterations, file.training.inner_iterations);
        set_if_some!(gamma, file.training.gamma);
        set_if_some!(stop_margin, file.training.stop_margin);

        set_if_some!(clip_eps, file.optimization.clip_eps);
        set_if_some!(learning_rate, file.optimization.learning_rate);

        set_if_some!(hidden_dim, file.architecture.hidden_dim);
        set_if_some!(seed, file.architecture.seed);

        set_if_some!(device_type, file.hardware.device_type);
        set_if_some!(cuda_device, file.hardware.cuda_device);

        set_if_some!(weights_dir, file.output.weights_dir);
        set_if_some!(run_name, file.output.run_name);
        set_if_some!(checkpoint_interval, file.output.checkpoint_interval);
        if let Some(value) = file.output.plot_path {
            self.plot_path = Some(value);
        }

        set_if_some!(log_level, file.logging.log_level);
        set_if_some!(backend_logs_visible, file.logging.backend_logs_visible);
    }

    fn apply_cli_overrides(&mut self, cli: &Self, matches: &ArgMatches) {
        macro_rules! set_if_cli {
            ($field:ident, $arg_name:literal) => {
                if Self::provided_on_cli(matches, $arg_name) {
                    self.$field = cli.$field.clone();
                }
            };
        }

        set_if_cli!(task_id, "task_id");
        set_if_cli!(num_envs, "num_envs");
        set_if_cli!(max_steps, "max_steps");

        set_if_cli!(num_iterations, "num_iterations");
        set_if_cli!(inner_iterations, "inner_iterations");
        set_if_cli!(gamma, "gamma");
        set_if_cli!(stop_margin, "stop_margin");

        set_if_cli!(clip_eps, "clip_eps");
        set_if_cli!(learning_rate, "learning_rate");

        set_if_cli!(hidden_dim, "hidden_dim");
        set_if_cli!(seed, "seed");

        set_if_cli!(device_type, "device_type");
        set_if_cli!(cuda_device, "cuda_device");

        set_if_cli!(weights_dir, "weights_dir");
        set_if_cli!(run_name, "run_name");
        set_if_cli!(checkpoint_interval, "checkpoint_interval");
        set_if_cli!(plot_path, "plot_path");

        set_if_cli!(log_level, "log_level");
        set_if_cli!(backend_logs_visible, "backend_logs_visible");
    }

    fn provided_on_cli(matches: &ArgMatches, arg_name: &str) -> bool {
        matches.value_source(arg_name) == Some(ValueSource::CommandLine)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_yaml(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().expect("temp config");
        file.write_all(content.as_bytes()).expect("write config");
        file
    }

    #[test]
    fn defaults_match_reference_hyperparameters() {
        let args = Args::load_from(["grpo"]).unwrap();

        assert_eq!(args.task_id, "CartPole-v1");
        assert_eq!(args.num_envs, 50);
        assert_eq!(args.max_steps, 500);
        assert_eq!(args.num_iterations, 100);
        assert_eq!(args.inner_iterations, 20);
        assert!((args.clip_eps - 0.2).abs() < 1e-6);
        assert!((args.learning_rate - 1e-3).abs() < 1e-12);
        assert_eq!(args.hidden_dim, 128);
        assert_eq!(args.checkpoint_interval, 0);
        assert!((args.reward_target() - 495.0).abs() < 1e-6);
        args.validate().unwrap();
    }

    #[test]
    fn yaml_values_apply_and_cli_wins() {
        let file = write_yaml(
            "environment:\n  num_envs: 8\n  max_steps: 64\ntraining:\n  num_iterations: 3\noptimization:\n  learning_rate: 0.01\nhardware:\n  device_type: cpu\n",
        );
        let path = file.path().to_string_lossy().to_string();

        let args = Args::load_from(["grpo", "--config", &path, "--num-envs", "4"]).unwrap();

        assert_eq!(args.num_envs, 4);
        assert_eq!(args.max_steps, 64);
        assert_eq!(args.num_iterations, 3);
        assert!((args.learning_rate - 0.01).abs() < 1e-12);
        assert_eq!(args.device_type, DeviceType::Cpu);
        assert_eq!(args.config.as_deref(), Some(file.path()));
    }

    #[test]
    fn shipped_config_reproduces_defaults() {
        let path = concat!(env!("CARGO_MANIFEST_DIR"), "/configs/grpo_cartpole.yaml");
        let args = Args::load_from(["grpo", "--config", path]).unwrap();
        let defaults = Args::default();

        assert_eq!(args.num_envs, defaults.num_envs);
        assert_eq!(args.max_steps, defaults.max_steps);
        assert_eq!(args.inner_iterations, defaults.inner_iterations);
        assert_eq!(args.run_name, defaults.run_name);
        assert_eq!(args.device_type, defaults.device_type);
    }

    #[test]
    fn unknown_yaml_keys_are_rejected() {
        let file = write_yaml("training:\n  gae_lambda: 0.95\n");
        let path = file.path().to_string_lossy().to_string();

        let err = Args::load_from(["grpo", "--config", &path]).unwrap_err();
        assert!(format!("{err:#}").contains("failed to parse YAML config"));
    }

    #[test]
    fn validate_rejects_empty_group() {
        let args = Args {
            num_envs: 0,
            ..Args::default()
        };
        assert!(args.validate().is_err());

        let args = Args {
            clip_eps: 1.5,
            ..Args::default()
        };
        assert!(args.validate().is_err());
    }

    #[test]
    fn tracing_filter_silences_backend_logs_by_default() {
        let args = Args::default();
        assert_eq!(
            args.default_tracing_filter(),
            "info,cubecl_cuda=off,cubecl_runtime=off"
        );

        let args = Args {
            backend_logs_visible: true,
            log_level: "debug".to_string(),
            ..Args::default()
        };
        assert_eq!(args.default_tracing_filter(), "debug");
    }

    #[test]
    fn plot_path_defaults_next_to_weights() {
        let args = Args::default();
        assert_eq!(
            args.resolved_plot_path(),
            PathBuf::from("./weights/grpo_cartpole_policy_update_returns.svg")
        );
    }
}
