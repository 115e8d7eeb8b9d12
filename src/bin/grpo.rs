use anyhow::Result;
use burn::backend::autodiff::Autodiff;
#[cfg(feature = "cuda")]
use burn::backend::cuda::{Cuda, CudaDevice};
use burn_ndarray::{NdArray, NdArrayDevice};
use tracing_subscriber::EnvFilter;

use rust_grpo::backend::{resolve_backend, RuntimeBackend};
use rust_grpo::config::Args;
use rust_grpo::grpo::train;
use rust_grpo::telemetry::{DashboardFormatter, MetricRegistry};

fn main() -> Result<()> {
    let args = Args::load()?;

    let formatter = DashboardFormatter::new(MetricRegistry::with_defaults().with_env_overrides());
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.default_tracing_filter()));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(false)
        .without_time()
        .with_file(false)
        .with_line_number(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .event_format(formatter)
        .try_init();

    let backend = resolve_backend(&args);
    match backend.backend {
        RuntimeBackend::Cpu => train::run::<Autodiff<NdArray<f32>>>(args, NdArrayDevice::Cpu),
        #[cfg(feature = "cuda")]
        RuntimeBackend::Cuda { device } => {
            train::run::<Autodiff<Cuda<f32, i32>>>(args, CudaDevice::new(device))
        }
        // The probe only selects CUDA when the feature is compiled in.
        #[cfg(not(feature = "cuda"))]
        RuntimeBackend::Cuda { .. } => {
            train::run::<Autodiff<NdArray<f32>>>(args, NdArrayDevice::Cpu)
        }
    }
}
