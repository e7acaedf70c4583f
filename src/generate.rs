//! Inference drivers consuming a resolved model/tokenizer pair.
//!
//! Single-turn and streaming generation over the backend seam. Sampling
//! parameters fall back to the checkpoint's generation config when the
//! caller leaves them unset.

use std::time::{Duration, Instant};

use candle_core::{DType, Tensor};
use candle_transformers::generation::{LogitsProcessor, Sampling};
use candle_transformers::utils::apply_repeat_penalty;
use tokio::sync::mpsc;
use tracing::debug;

use crate::config::GenerationConfig;
use crate::error::{LoaderError, Result};
use crate::model::ResolvedModel;

/// Sampling controls for one generation call.
#[derive(Debug, Clone)]
pub struct GenerateParams {
    pub max_new_tokens: usize,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub top_k: Option<usize>,
    pub do_sample: bool,
    pub repetition_penalty: f32,
    /// How far back the repetition penalty looks.
    pub repetition_context: usize,
    pub seed: u64,
}

impl Default for GenerateParams {
    fn default() -> Self {
        Self {
            max_new_tokens: 512,
            temperature: None,
            top_p: None,
            top_k: None,
            do_sample: false,
            repetition_penalty: 1.0,
            repetition_context: 64,
            seed: 299792458,
        }
    }
}

impl GenerateParams {
    /// Fill unset fields from a checkpoint's generation config.
    fn merged_with(&self, config: Option<&GenerationConfig>) -> Self {
        let mut params = self.clone();
        if let Some(config) = config {
            if params.temperature.is_none() {
                params.temperature = config.temperature;
            }
            if params.top_p.is_none() {
                params.top_p = config.top_p;
            }
            if params.top_k.is_none() {
                params.top_k = config.top_k;
            }
            params.do_sample = params.do_sample || config.do_sample;
            if let Some(penalty) = config.repetition_penalty {
                if (params.repetition_penalty - 1.0).abs() < f32::EPSILON {
                    params.repetition_penalty = penalty;
                }
            }
        }
        params
    }

    fn sampling(&self) -> Sampling {
        if !self.do_sample {
            return Sampling::ArgMax;
        }
        let temperature = self.temperature.unwrap_or(1.0).max(f64::MIN_POSITIVE);
        match (self.top_k, self.top_p) {
            (Some(k), Some(p)) => Sampling::TopKThenTopP { k, p, temperature },
            (Some(k), None) => Sampling::TopK { k, temperature },
            (None, Some(p)) => Sampling::TopP { p, temperature },
            (None, None) => Sampling::All { temperature },
        }
    }
}

/// One finished generation.
#[derive(Debug, Clone)]
pub struct GenerateOutput {
    pub text: String,
    pub tokens: Vec<u32>,
    pub elapsed: Duration,
}

/// A token as it is produced.
#[derive(Debug, Clone)]
pub struct StreamEvent {
    pub token_id: u32,
    /// Text newly decoded by this token.
    pub text: String,
}

/// Single-turn generation.
pub async fn generate(
    resolved: &mut ResolvedModel,
    prompt: &str,
    params: &GenerateParams,
) -> Result<GenerateOutput> {
    run_generation(resolved, prompt, params, None).await
}

/// Streaming generation: every token is sent on `events` as soon as it is
/// sampled; the full output is still returned at the end.
pub async fn generate_stream(
    resolved: &mut ResolvedModel,
    prompt: &str,
    params: &GenerateParams,
    events: mpsc::Sender<StreamEvent>,
) -> Result<GenerateOutput> {
    run_generation(resolved, prompt, params, Some(events)).await
}

async fn run_generation(
    resolved: &mut ResolvedModel,
    prompt: &str,
    params: &GenerateParams,
    events: Option<mpsc::Sender<StreamEvent>>,
) -> Result<GenerateOutput> {
    let model = resolved
        .model
        .as_mut()
        .ok_or_else(|| LoaderError::LoaderIncompatible {
            key: resolved.key.clone(),
            reason: "generation needs a loaded model".to_string(),
        })?;
    let tokenizer = &resolved.tokenizer;

    let start = Instant::now();
    let prompt_ids = tokenizer.encode(prompt, true)?;
    if let Some(limit) = model.max_model_len() {
        if prompt_ids.len() >= limit {
            return Err(LoaderError::ContextLengthExceeded {
                requested: prompt_ids.len(),
                supported: limit,
            });
        }
    }
    let eos_id = tokenizer.eos_token_id();
    let device = model.device().clone();

    let params = params.merged_with(model.generation_config.as_ref());
    let mut processor = LogitsProcessor::from_sampling(params.seed, params.sampling());
    debug!(key = %resolved.key, prompt_tokens = prompt_ids.len(), "starting generation");

    let backend = model.backend_mut();
    backend.reset();

    let mut generated: Vec<u32> = Vec::new();
    let mut decoded = String::new();
    let mut input = Tensor::new(prompt_ids.as_slice(), &device)?.unsqueeze(0)?;
    let mut index_pos = 0usize;

    for step in 0..params.max_new_tokens {
        let logits = backend.forward(&input, index_pos)?;
        let logits = flatten_logits(logits)?.to_dtype(DType::F32)?;
        let logits = if (params.repetition_penalty - 1.0).abs() > f32::EPSILON {
            let start_at = generated.len().saturating_sub(params.repetition_context);
            apply_repeat_penalty(&logits, params.repetition_penalty, &generated[start_at..])?
        } else {
            logits
        };

        let next = processor.sample(&logits)?;
        generated.push(next);

        // Incremental decode: emit only the new suffix.
        let full = tokenizer.decode(&generated, true)?;
        let delta = full.get(decoded.len()..).unwrap_or("").to_string();
        decoded = full;
        if let Some(events) = &events {
            if events
                .send(StreamEvent {
                    token_id: next,
                    text: delta,
                })
                .await
                .is_err()
            {
                debug!("stream receiver dropped, stopping generation");
                break;
            }
        }

        if Some(next) == eos_id {
            break;
        }

        index_pos += if step == 0 { prompt_ids.len() } else { 1 };
        input = Tensor::new(&[next], &device)?.unsqueeze(0)?;
    }

    Ok(GenerateOutput {
        text: tokenizer.decode(&generated, true)?,
        tokens: generated,
        elapsed: start.elapsed(),
    })
}

/// Backends return logits with or without a batch dimension; collapse to a
/// rank-1 row.
fn flatten_logits(logits: Tensor) -> candle_core::Result<Tensor> {
    let mut logits = logits;
    while logits.dims().len() > 1 {
        logits = logits.squeeze(0)?;
    }
    Ok(logits)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::tests::tiny_tokenizer;
    use crate::model::{Architecture, ModelConfigData, ModelHandle};
    use crate::runtime::testing::StaticBackend;
    use crate::types::Dtype;
    use candle_core::Device;

    /// Logits that always pick token 3 ("world"), never eos.
    fn resolved(logits: Vec<f32>) -> ResolvedModel {
        let config = ModelConfigData::from_value(serde_json::json!({
            "architectures": ["LlamaForCausalLM"],
        }))
        .unwrap();
        let model = ModelHandle::new(
            "test",
            "/tmp/test",
            Architecture::Llama,
            config,
            Dtype::F32,
            Device::Cpu,
            Box::new(StaticBackend::new(logits)),
        );
        let mut tokenizer = tiny_tokenizer();
        tokenizer.set_eos_token("</s>");
        tokenizer.set_pad_token("</s>");
        ResolvedModel {
            model: Some(model),
            tokenizer,
            model_dir: "/tmp/test".into(),
            dtype: Dtype::F32,
            max_model_len: Some(64),
            key: "test".to_string(),
            template_id: "default".to_string(),
        }
    }

    #[tokio::test]
    async fn test_greedy_generation_stops_at_limit() {
        // Vocabulary: 0 <unk>, 1 </s>, 2 hello, 3 world. Argmax lands on 3.
        let mut resolved = resolved(vec![0.0, 0.1, 0.2, 5.0]);
        let params = GenerateParams {
            max_new_tokens: 4,
            ..Default::default()
        };
        let out = generate(&mut resolved, "hello", &params).await.unwrap();
        assert_eq!(out.tokens, vec![3, 3, 3, 3]);
        assert_eq!(out.text, "world world world world");
    }

    #[tokio::test]
    async fn test_generation_stops_at_eos() {
        // Argmax lands on token 1, the eos.
        let mut resolved = resolved(vec![0.0, 9.0, 0.2, 0.3]);
        let params = GenerateParams {
            max_new_tokens: 16,
            ..Default::default()
        };
        let out = generate(&mut resolved, "hello", &params).await.unwrap();
        assert_eq!(out.tokens, vec![1]);
    }

    #[tokio::test]
    async fn test_prompt_over_limit_rejected() {
        let mut r = resolved(vec![0.0, 0.0, 0.0, 1.0]);
        if let Some(m) = r.model.as_mut() {
            m.set_max_model_len(Some(1));
        }
        let err = generate(&mut r, "hello world", &GenerateParams::default())
            .await
            .unwrap_err();
        assert!(matches!(err, LoaderError::ContextLengthExceeded { .. }));
    }

    #[tokio::test]
    async fn test_stream_emits_every_token() {
        let mut resolved = resolved(vec![0.0, 0.1, 0.2, 5.0]);
        let params = GenerateParams {
            max_new_tokens: 3,
            ..Default::default()
        };
        let (tx, mut rx) = mpsc::channel(8);
        let out = generate_stream(&mut resolved, "hello", &params, tx)
            .await
            .unwrap();
        drop(out);
        let mut streamed = Vec::new();
        while let Ok(event) = rx.try_recv() {
            streamed.push(event.token_id);
        }
        assert_eq!(streamed, vec![3, 3, 3]);
    }

    #[tokio::test]
    async fn test_params_fall_back_to_generation_config() {
        let mut resolved = resolved(vec![0.0, 0.1, 0.2, 5.0]);
        if let Some(m) = resolved.model.as_mut() {
            m.generation_config = Some(GenerationConfig {
                temperature: Some(0.8),
                do_sample: true,
                ..Default::default()
            });
        }
        let merged = GenerateParams::default()
            .merged_with(resolved.model.as_ref().unwrap().generation_config.as_ref());
        assert!(merged.do_sample);
        assert_eq!(merged.temperature, Some(0.8));
    }
}
