//! Policy checkpoints on disk, written with burn's binary file recorder.
//!
//! The weights directory is never created here: saving into a missing
//! directory is reported as an error to the caller.

use anyhow::{anyhow, bail, Result};
use burn::module::Module;
use burn::record::{BinFileRecorder, FullPrecisionSettings};
use burn::tensor::backend::Backend;
use std::path::{Path, PathBuf};

use crate::models::PolicyNet;

const EXTENSION: &str = "bin";

/// File stem of the checkpoint written when training ends.
pub fn final_stem(run_name: &str) -> String {
    format!("{run_name}_final")
}

/// File stem of an intermediate checkpoint taken after `iteration`.
pub fn update_stem(run_name: &str, iteration: usize) -> String {
    format!("{run_name}_update_{iteration}")
}

/// Path the recorder writes for `stem` inside `dir`.
pub fn checkpoint_path(dir: &Path, stem: &str) -> PathBuf {
    dir.join(format!("{stem}.{EXTENSION}"))
}

pub fn save_policy<B: Backend>(policy: &PolicyNet<B>, dir: &Path, stem: &str) -> Result<PathBuf> {
    if !dir.is_dir() {
        bail!("checkpoint directory {} does not exist", dir.display());
    }

    let path = checkpoint_path(dir, stem);
    let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
    policy
        .clone()
        .save_file(path.clone(), &recorder)
        .map_err(|e| anyhow!("failed to save policy to {}: {e}", path.display()))?;

    Ok(path)
}

/// Loads parameters from `path` into a freshly built `template`.
pub fn load_policy<B: Backend>(
    template: PolicyNet<B>,
    path: &Path,
    device: &B::Device,
) -> Result<PolicyNet<B>> {
    let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
    template
        .load_file(path.to_path_buf(), &recorder, device)
        .map_err(|e| anyhow!("failed to load policy from {}: {e}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::autodiff::Autodiff;
    use burn::tensor::{Tensor, TensorData};
    use burn_ndarray::{NdArray, NdArrayDevice};

    type TestBackend = Autodiff<NdArray<f32>>;

    fn probe_obs() -> Tensor<TestBackend, 2> {
        Tensor::from_data(
            TensorData::new(vec![0.01f32, -0.2, 0.03, 0.4, 1.0, 0.5, -0.1, -0.3], [2, 4]),
            &NdArrayDevice::Cpu,
        )
    }

    #[test]
    fn round_trip_preserves_outputs() {
        let device = NdArrayDevice::Cpu;
        let dir = tempfile::tempdir().unwrap();
        let policy = PolicyNet::<TestBackend>::new(4, 16, 2, &device);

        let path = save_policy(&policy, dir.path(), &final_stem("grpo_test")).unwrap();
        assert_eq!(path, dir.path().join("grpo_test_final.bin"));
        assert!(path.exists());

        let restored =
            load_policy(PolicyNet::<TestBackend>::new(4, 16, 2, &device), &path, &device).unwrap();

        let expected: Vec<f32> = policy.forward(probe_obs()).to_data().to_vec().unwrap();
        let actual: Vec<f32> = restored.forward(probe_obs()).to_data().to_vec().unwrap();
        for (a, b) in expected.iter().zip(actual.iter()) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn missing_directory_is_an_error() {
        let device = NdArrayDevice::Cpu;
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("weights");
        let policy = PolicyNet::<TestBackend>::new(4, 8, 2, &device);

        let err = save_policy(&policy, &missing, "run_final").unwrap_err();
        assert!(err.to_string().contains("does not exist"));
        assert!(!missing.exists());
    }

    #[test]
    fn stems_follow_run_name() {
        assert_eq!(final_stem("grpo"), "grpo_final");
        assert_eq!(update_stem("grpo", 20), "grpo_update_20");
    }
}
