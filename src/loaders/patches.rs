//! Per-instance patch layer.
//!
//! Rather than rewriting shared runtime classes at load time, each fix
//! wraps the backend of the one model being resolved; the ledger on the
//! model handle refuses a second application of the same patch id, so
//! resolving two catalog keys that share a family fix leaves every backend
//! singly wrapped.

use candle_core::{DType, Tensor};

use crate::model::ModelHandle;
use crate::requirements::RuntimeEnv;
use crate::runtime::ModelBackend;
use crate::types::PatchId;

/// A backend with one patch behavior layered on top.
pub struct PatchedBackend {
    inner: Box<dyn ModelBackend>,
    id: PatchId,
}

impl PatchedBackend {
    pub fn new(inner: Box<dyn ModelBackend>, id: PatchId) -> Self {
        Self { inner, id }
    }

    pub fn id(&self) -> PatchId {
        self.id
    }
}

impl ModelBackend for PatchedBackend {
    fn forward(&mut self, input: &Tensor, index_pos: usize) -> candle_core::Result<Tensor> {
        let logits = self.inner.forward(input, index_pos)?;
        match self.id {
            // The affected lm-head produces garbage when evaluated in half
            // precision; force the logits path through f32.
            PatchId::LmHeadFullPrecision => logits.to_dtype(DType::F32),
            // Markers with no tensor-level behavior.
            PatchId::GptqTrainingGuard | PatchId::CheckpointSignature => Ok(logits),
        }
    }

    fn reset(&mut self) {
        self.inner.reset();
    }
}

/// Structural shims tied to the hosting runtime version rather than to any
/// model family. Run once per resolved model; the ledger keeps repeated
/// calls from stacking.
pub(crate) fn apply_runtime_shims(env: &RuntimeEnv, model: &mut ModelHandle) {
    // Runtimes from 0.5 on changed the checkpoint serialization convention;
    // the export path consults this tag to pick the right one.
    if env.at_least("candle", "0.5") {
        model.apply_patch(PatchId::CheckpointSignature);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Architecture, ModelConfigData, ModelHandle};
    use crate::runtime::testing::StaticBackend;
    use crate::types::Dtype;
    use candle_core::Device;

    fn test_handle() -> ModelHandle {
        let config = ModelConfigData::from_value(serde_json::json!({
            "architectures": ["BaichuanForCausalLM"],
        }))
        .unwrap();
        ModelHandle::new(
            "baichuan2-7b-chat",
            "/tmp/fake",
            Architecture::Baichuan,
            config,
            Dtype::F16,
            Device::Cpu,
            Box::new(StaticBackend::new(vec![0.25, 0.5, 1.0])),
        )
    }

    #[test]
    fn test_patch_applies_once() {
        let mut model = test_handle();
        assert!(model.apply_patch(PatchId::LmHeadFullPrecision));
        assert!(!model.apply_patch(PatchId::LmHeadFullPrecision));
        assert_eq!(model.patches(), &[PatchId::LmHeadFullPrecision]);
    }

    #[test]
    fn test_patched_forward_matches_single_wrap() {
        let device = Device::Cpu;
        let input = Tensor::new(&[1u32], &device).unwrap();

        let mut model = test_handle();
        model.apply_patch(PatchId::LmHeadFullPrecision);
        let once = model.backend_mut().forward(&input, 0).unwrap();

        // A second application is rejected, so the output is unchanged.
        model.apply_patch(PatchId::LmHeadFullPrecision);
        let twice = model.backend_mut().forward(&input, 0).unwrap();

        assert_eq!(once.to_vec1::<f32>().unwrap(), twice.to_vec1::<f32>().unwrap());
        assert_eq!(once.dtype(), DType::F32);
    }

    #[test]
    fn test_runtime_shims_idempotent() {
        let env = RuntimeEnv::empty().with_component("candle", "0.7.2");
        let mut model = test_handle();
        apply_runtime_shims(&env, &mut model);
        apply_runtime_shims(&env, &mut model);
        assert_eq!(model.patches(), &[PatchId::CheckpointSignature]);
    }

    #[test]
    fn test_old_runtime_skips_signature_shim() {
        let env = RuntimeEnv::empty().with_component("candle", "0.4.0");
        let mut model = test_handle();
        apply_runtime_shims(&env, &mut model);
        assert!(model.patches().is_empty());
    }
}
