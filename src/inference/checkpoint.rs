use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;

use anyhow::Context;
use burn::{
    module::Module,
    record::{FullPrecisionSettings, Recorder},
    tensor::backend::Backend,
};
use burn_import::pytorch::{LoadArgs, PyTorchFileRecorder};
use tracing::{debug, warn};

/// Training checkpoints often wrap the state dict as `{"model": state_dict, ...}`.
const NESTED_KEY: &str = "model";

fn load_args(path: &Path, remap: &[(&str, &str)], nested: bool) -> LoadArgs {
    let mut args = LoadArgs::new(path.to_path_buf());
    for (pattern, replacement) in remap {
        args = args.with_key_remap(pattern, replacement);
    }
    if nested {
        args = args.with_top_level_key(NESTED_KEY);
    }
    args
}

/// Run one recorder pass. The PyTorch adapter panics on some absent tensors (a linear without
/// `weight`, a norm without `weight`/`bias`); those panics come back as errors.
fn read<B, M>(args: LoadArgs, device: &B::Device) -> anyhow::Result<M::Record>
where
    B: Backend,
    M: Module<B>,
{
    let recorder = PyTorchFileRecorder::<FullPrecisionSettings>::default();
    let attempt = panic::catch_unwind(AssertUnwindSafe(|| {
        Recorder::<B>::load::<M::Record>(&recorder, args, device)
    }));
    match attempt {
        Ok(result) => result.map_err(|e| anyhow::anyhow!("{e}")),
        Err(payload) => Err(anyhow::anyhow!(
            "checkpoint reader panicked: {}",
            panic_message(&*payload)
        )),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// Load `record` into `module`. Burn asserts that every `Vec` in the record has the module's
/// length; a checkpoint with a different block count comes back as an error.
pub fn apply_record<B, M>(module: M, record: M::Record) -> anyhow::Result<M>
where
    B: Backend,
    M: Module<B>,
{
    panic::catch_unwind(AssertUnwindSafe(|| module.load_record(record))).map_err(|payload| {
        anyhow::anyhow!("checkpoint does not fit: {}", panic_message(&*payload))
    })
}

/// Read the record for module `M` out of a PyTorch checkpoint.
///
/// A top-level `model` entry is read first; the top level itself is read only when that entry
/// does not exist. Keys present in the file but absent from `M` (the classification head) are
/// ignored; keys `M` needs but the file lacks are an error.
pub fn load_record<B, M>(
    path: &Path,
    remap: &[(&str, &str)],
    device: &B::Device,
) -> anyhow::Result<M::Record>
where
    B: Backend,
    M: Module<B>,
{
    anyhow::ensure!(path.is_file(), "checkpoint {} not found", path.display());

    let result = match read::<B, M>(load_args(path, remap, true), device) {
        Ok(record) => {
            debug!(path = %path.display(), "loaded nested `{NESTED_KEY}` state dict");
            Ok(record)
        }
        Err(e) if e.to_string().contains(&format!("key {NESTED_KEY} not found")) => {
            debug!(path = %path.display(), "no `{NESTED_KEY}` entry, reading top level");
            read::<B, M>(load_args(path, remap, false), device)
        }
        Err(e) => Err(e),
    };

    result
        .inspect_err(|e| warn!(path = %path.display(), error = %e, "checkpoint load failed"))
        .with_context(|| format!("load checkpoint {}", path.display()))
}
