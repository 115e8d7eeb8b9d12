//! Runtime choice between the ndarray CPU backend and burn's CUDA backend.

use std::fmt;
use tracing::warn;

use crate::config::{Args, DeviceType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeBackend {
    Cpu,
    Cuda { device: usize },
}

/// Why a CUDA request was turned down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CudaUnavailable {
    NotCompiled,
    NoDevice,
    DeviceOutOfRange { requested: usize, visible: usize },
    Driver(String),
    Nvrtc(String),
    Panicked(String),
}

impl fmt::Display for CudaUnavailable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotCompiled => write!(f, "built without the `cuda` feature"),
            Self::NoDevice => write!(f, "no CUDA device visible to the driver"),
            Self::DeviceOutOfRange { requested, visible } => {
                write!(f, "cuda_device={requested} requested, {visible} visible")
            }
            Self::Driver(detail) => write!(f, "driver error: {detail}"),
            Self::Nvrtc(detail) => write!(f, "NVRTC unusable: {detail}"),
            Self::Panicked(detail) => write!(f, "CUDA initialization panicked: {detail}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendChoice {
    pub backend: RuntimeBackend,
    /// Set when CUDA was asked for and the trainer fell back to CPU.
    pub fallback: Option<CudaUnavailable>,
}

pub fn resolve_backend(args: &Args) -> BackendChoice {
    choose_backend(args, probe_cuda)
}

pub(crate) fn choose_backend<F>(args: &Args, probe: F) -> BackendChoice
where
    F: FnOnce(usize) -> Result<(), CudaUnavailable>,
{
    if args.device_type == DeviceType::Cpu {
        return BackendChoice {
            backend: RuntimeBackend::Cpu,
            fallback: None,
        };
    }

    match probe(args.cuda_device) {
        Ok(()) => BackendChoice {
            backend: RuntimeBackend::Cuda {
                device: args.cuda_device,
            },
            fallback: None,
        },
        Err(reason) => {
            warn!(
                category = "MISC",
                cuda_device = args.cuda_device,
                "CUDA unavailable ({reason}), training on CPU"
            );
            BackendChoice {
                backend: RuntimeBackend::Cpu,
                fallback: Some(reason),
            }
        }
    }
}

#[cfg(not(feature = "cuda"))]
fn probe_cuda(_cuda_device: usize) -> Result<(), CudaUnavailable> {
    Err(CudaUnavailable::NotCompiled)
}

#[cfg(feature = "cuda")]
const PROBE_KERNEL: &str = "extern \"C\" __global__ void grpo_probe(float *x) { x[0] = 0.0f; }";

/// Driver, context and NVRTC must all work before burn's CUDA backend is
/// trusted; any of them can panic on a half-installed toolkit.
#[cfg(feature = "cuda")]
fn probe_cuda(cuda_device: usize) -> Result<(), CudaUnavailable> {
    use cudarc::driver::CudaContext;
    use cudarc::nvrtc::compile_ptx;

    let visible = quiet_unwind(CudaContext::device_count)?
        .map_err(|e| CudaUnavailable::Driver(format!("{e:?}")))?;
    if visible <= 0 {
        return Err(CudaUnavailable::NoDevice);
    }
    if cuda_device >= visible as usize {
        return Err(CudaUnavailable::DeviceOutOfRange {
            requested: cuda_device,
            visible: visible as usize,
        });
    }

    quiet_unwind(|| CudaContext::new(cuda_device))?
        .map_err(|e| CudaUnavailable::Driver(format!("{e:?}")))?;
    quiet_unwind(|| compile_ptx(PROBE_KERNEL))?
        .map_err(|e| CudaUnavailable::Nvrtc(format!("{e:?}")))?;

    Ok(())
}

/// Runs `f` with the panic hook silenced, reporting a panic as an error.
#[cfg(feature = "cuda")]
fn quiet_unwind<T>(f: impl FnOnce() -> T) -> Result<T, CudaUnavailable> {
    use std::panic::{self, AssertUnwindSafe};
    use std::sync::Mutex;

    static HOOK_LOCK: Mutex<()> = Mutex::new(());
    let _hook_guard = HOOK_LOCK.lock().unwrap_or_else(|p| p.into_inner());

    let hook = panic::take_hook();
    panic::set_hook(Box::new(|_| {}));
    let outcome = panic::catch_unwind(AssertUnwindSafe(f));
    panic::set_hook(hook);

    outcome.map_err(|payload| {
        let detail = payload
            .downcast_ref::<String>()
            .cloned()
            .or_else(|| payload.downcast_ref::<&str>().map(|s| s.to_string()))
            .unwrap_or_else(|| "non-string panic payload".to_string());
        CudaUnavailable::Panicked(detail)
    })
}
