//! Wrappers around the loaded model and tokenizer.
//!
//! Everything resolution derives about a model after construction (model
//! type, checkpoint directory, context limit, applied patches) lives in
//! explicit fields on [`ModelHandle`] rather than being injected into the
//! runtime object. The same goes for [`TokenizerHandle`] and special tokens.

use std::path::{Path, PathBuf};

use candle_core::Device;
use serde_json::Value;
use tokenizers::Tokenizer;

use crate::config::GenerationConfig;
use crate::error::{LoaderError, Result};
use crate::loaders::patches::PatchedBackend;
use crate::runtime::ModelBackend;
use crate::types::{Dtype, PatchId};

/// Model families the runtime knows how to tell apart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Architecture {
    Llama,
    Mistral,
    Qwen2,
    /// First-generation qwen with its fused `c_attn` projection.
    QwenLegacy,
    ChatGlm,
    Baichuan,
    InternLm2,
    Phi,
    Other(String),
}

impl Architecture {
    /// Derive the family from checkpoint metadata. `architectures` wins over
    /// `model_type` since the latter is absent from older checkpoints.
    pub fn from_config(config: &ModelConfigData) -> Self {
        let name = config
            .architectures_first()
            .or_else(|| config.get_str("model_type"))
            .unwrap_or_default()
            .to_lowercase();
        Self::from_name(&name)
    }

    pub fn from_name(name: &str) -> Self {
        let n = name.to_lowercase();
        if n.contains("qwen2") {
            Self::Qwen2
        } else if n.contains("qwen") {
            Self::QwenLegacy
        } else if n.contains("mistral") || n.contains("mixtral") {
            Self::Mistral
        } else if n.contains("llama") || n.contains("yi") || n.contains("gemma") || n.contains("deepseek") {
            Self::Llama
        } else if n.contains("chatglm") || n.contains("glm") {
            Self::ChatGlm
        } else if n.contains("baichuan") {
            Self::Baichuan
        } else if n.contains("internlm2") {
            Self::InternLm2
        } else if n.contains("phi") {
            Self::Phi
        } else {
            Self::Other(name.to_string())
        }
    }

    /// Module names adapters may target on this family.
    pub fn module_tree(&self) -> &'static [&'static str] {
        match self {
            Self::Llama | Self::Mistral | Self::Qwen2 => &[
                "q_proj", "k_proj", "v_proj", "o_proj", "gate_proj", "up_proj", "down_proj",
                "embed_tokens", "lm_head",
            ],
            Self::QwenLegacy => &["c_attn", "c_proj", "w1", "w2", "wte", "lm_head"],
            Self::ChatGlm => &[
                "query_key_value", "dense", "dense_h_to_4h", "dense_4h_to_h", "output_layer",
            ],
            Self::Baichuan => &["W_pack", "o_proj", "gate_proj", "up_proj", "down_proj", "lm_head"],
            Self::InternLm2 => &["wqkv", "wo", "w1", "w2", "w3", "output"],
            Self::Phi => &["Wqkv", "qkv_proj", "out_proj", "fc1", "fc2", "lm_head"],
            Self::Other(_) => &[],
        }
    }
}

/// Parsed `config.json` plus typed access to the handful of fields the
/// pipeline cares about. The raw map is kept so family loaders can rewrite
/// family-specific keys without this module knowing about them.
#[derive(Debug, Clone)]
pub struct ModelConfigData {
    raw: serde_json::Map<String, Value>,
}

/// Config keys that can declare a context limit, across families.
const MAX_LEN_KEYS: &[&str] = &[
    "max_position_embeddings",
    "seq_length",
    "max_seq_len",
    "model_max_length",
    "max_sequence_length",
    "n_positions",
];

impl ModelConfigData {
    pub fn from_dir(dir: &Path) -> Result<Self> {
        let path = dir.join("config.json");
        if !path.is_file() {
            return Err(LoaderError::invalid_checkpoint(dir, "missing config.json"));
        }
        let raw: Value = serde_json::from_str(&std::fs::read_to_string(&path)?)?;
        match raw {
            Value::Object(map) => Ok(Self { raw: map }),
            _ => Err(LoaderError::invalid_checkpoint(dir, "config.json is not an object")),
        }
    }

    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(map) => Some(Self { raw: map }),
            _ => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.raw.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.raw.get(key).and_then(Value::as_str)
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.raw.get(key).and_then(Value::as_u64)
    }

    pub fn set(&mut self, key: &str, value: Value) {
        self.raw.insert(key.to_string(), value);
    }

    /// Insert only when the key is absent.
    pub fn set_default(&mut self, key: &str, value: Value) {
        self.raw.entry(key.to_string()).or_insert(value);
    }

    pub fn architectures_first(&self) -> Option<&str> {
        self.raw
            .get("architectures")
            .and_then(Value::as_array)
            .and_then(|a| a.first())
            .and_then(Value::as_str)
    }

    pub fn torch_dtype(&self) -> Option<Dtype> {
        self.get_str("torch_dtype").and_then(Dtype::from_config_str)
    }

    pub fn set_torch_dtype(&mut self, dtype: Dtype) {
        self.set("torch_dtype", Value::String(dtype.config_str().to_string()));
    }

    /// The smallest context limit any known key declares.
    pub fn max_model_len(&self) -> Option<usize> {
        MAX_LEN_KEYS
            .iter()
            .filter_map(|k| self.get_u64(k))
            .min()
            .map(|v| v as usize)
    }

    /// The raw map as a JSON value, for handing to runtime deserializers.
    pub fn to_value(&self) -> Value {
        Value::Object(self.raw.clone())
    }
}

/// Marker recording which quantization family produced the loaded weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuantMarker {
    BitsAndBytes,
    Gptq { bits: u8 },
    Awq,
}

/// What is known about an attached adapter.
#[derive(Debug, Clone)]
pub struct AdapterInfo {
    pub dir: PathBuf,
    pub target_modules: Vec<String>,
    pub rank: Option<usize>,
    pub alpha: Option<f64>,
}

/// A loaded model: the backend doing tensor work plus everything the
/// pipeline derived about it.
pub struct ModelHandle {
    key: String,
    dir: PathBuf,
    arch: Architecture,
    config: ModelConfigData,
    pub generation_config: Option<GenerationConfig>,
    dtype: Dtype,
    device: Device,
    backend: Box<dyn ModelBackend>,
    patches: Vec<PatchId>,
    quantization: Option<QuantMarker>,
    adapter: Option<AdapterInfo>,
    max_model_len: Option<usize>,
}

impl ModelHandle {
    pub fn new(
        key: impl Into<String>,
        dir: impl Into<PathBuf>,
        arch: Architecture,
        config: ModelConfigData,
        dtype: Dtype,
        device: Device,
        backend: Box<dyn ModelBackend>,
    ) -> Self {
        Self {
            key: key.into(),
            dir: dir.into(),
            arch,
            config,
            generation_config: None,
            dtype,
            device,
            backend,
            patches: Vec::new(),
            quantization: None,
            adapter: None,
            max_model_len: None,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn arch(&self) -> &Architecture {
        &self.arch
    }

    pub fn config(&self) -> &ModelConfigData {
        &self.config
    }

    pub fn dtype(&self) -> Dtype {
        self.dtype
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn quantization(&self) -> Option<QuantMarker> {
        self.quantization
    }

    pub fn set_quantization(&mut self, marker: QuantMarker) {
        self.quantization = Some(marker);
    }

    pub fn adapter(&self) -> Option<&AdapterInfo> {
        self.adapter.as_ref()
    }

    pub fn set_adapter(&mut self, info: AdapterInfo) {
        self.adapter = Some(info);
    }

    pub fn max_model_len(&self) -> Option<usize> {
        self.max_model_len
    }

    pub fn set_max_model_len(&mut self, len: Option<usize>) {
        self.max_model_len = len;
    }

    /// Module names adapters may target.
    pub fn module_names(&self) -> &'static [&'static str] {
        self.arch.module_tree()
    }

    pub fn backend_mut(&mut self) -> &mut dyn ModelBackend {
        self.backend.as_mut()
    }

    /// Replace the backend wholesale (adapter attachment).
    pub fn replace_backend(
        &mut self,
        wrap: impl FnOnce(Box<dyn ModelBackend>) -> Box<dyn ModelBackend>,
    ) {
        let inner = std::mem::replace(&mut self.backend, Box::new(NoBackend));
        self.backend = wrap(inner);
    }

    /// Applied patch ids, in application order.
    pub fn patches(&self) -> &[PatchId] {
        &self.patches
    }

    pub fn has_patch(&self, id: PatchId) -> bool {
        self.patches.contains(&id)
    }

    /// Wrap the backend with `id`'s behavior. Applying an id that is already
    /// on the ledger is a no-op, so repeated resolutions through the same
    /// family loader never stack wrappers.
    pub fn apply_patch(&mut self, id: PatchId) -> bool {
        if self.has_patch(id) {
            return false;
        }
        let inner = std::mem::replace(&mut self.backend, Box::new(NoBackend));
        self.backend = Box::new(PatchedBackend::new(inner, id));
        self.patches.push(id);
        true
    }
}

impl std::fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelHandle")
            .field("key", &self.key)
            .field("arch", &self.arch)
            .field("dtype", &self.dtype)
            .field("patches", &self.patches)
            .field("max_model_len", &self.max_model_len)
            .finish_non_exhaustive()
    }
}

/// Placeholder backend used only while a wrapper swap is in flight.
struct NoBackend;

impl ModelBackend for NoBackend {
    fn forward(
        &mut self,
        _input: &candle_core::Tensor,
        _index_pos: usize,
    ) -> candle_core::Result<candle_core::Tensor> {
        candle_core::bail!("model backend is not available")
    }

    fn reset(&mut self) {}
}

/// Tokenizer plus the reconciled special-token state.
#[derive(Clone)]
pub struct TokenizerHandle {
    inner: Tokenizer,
    eos_token: Option<String>,
    pad_token: Option<String>,
    bos_token: Option<String>,
    model_max_length: Option<usize>,
    key: Option<String>,
    dir: Option<PathBuf>,
}

/// `model_max_length` values at or above this are the upstream "unset"
/// sentinel and are ignored.
const MAX_LEN_SENTINEL: f64 = 1e9;

fn token_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Object(map) => map.get("content").and_then(Value::as_str).map(String::from),
        _ => None,
    }
}

impl TokenizerHandle {
    /// Load `tokenizer.json` and the special-token sidecars from a
    /// checkpoint directory.
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join("tokenizer.json");
        if !path.is_file() {
            return Err(LoaderError::invalid_checkpoint(dir, "missing tokenizer.json"));
        }
        let inner = Tokenizer::from_file(&path)?;
        let mut handle = Self::from_tokenizer(inner);
        handle.dir = Some(dir.to_path_buf());
        for sidecar in ["tokenizer_config.json", "special_tokens_map.json"] {
            let p = dir.join(sidecar);
            if !p.is_file() {
                continue;
            }
            let raw: Value = serde_json::from_str(&std::fs::read_to_string(&p)?)?;
            handle.absorb_sidecar(&raw);
        }
        Ok(handle)
    }

    /// Wrap an already constructed tokenizer (caller-injected override).
    pub fn from_tokenizer(inner: Tokenizer) -> Self {
        Self {
            inner,
            eos_token: None,
            pad_token: None,
            bos_token: None,
            model_max_length: None,
            key: None,
            dir: None,
        }
    }

    fn absorb_sidecar(&mut self, raw: &Value) {
        let Some(map) = raw.as_object() else { return };
        if self.eos_token.is_none() {
            self.eos_token = map.get("eos_token").and_then(token_string);
        }
        if self.pad_token.is_none() {
            self.pad_token = map.get("pad_token").and_then(token_string);
        }
        if self.bos_token.is_none() {
            self.bos_token = map.get("bos_token").and_then(token_string);
        }
        if self.model_max_length.is_none() {
            if let Some(len) = map.get("model_max_length").and_then(Value::as_f64) {
                if len > 0.0 && len < MAX_LEN_SENTINEL {
                    self.model_max_length = Some(len as usize);
                }
            }
        }
    }

    pub fn eos_token(&self) -> Option<&str> {
        self.eos_token.as_deref()
    }

    /// Force the end-of-sequence token. Used both by catalog-level eos
    /// overrides and by family loaders fixing checkpoints that ship the
    /// wrong one.
    pub fn set_eos_token(&mut self, token: &str) {
        self.eos_token = Some(token.to_string());
    }

    pub fn eos_token_id(&self) -> Option<u32> {
        self.eos_token.as_deref().and_then(|t| self.inner.token_to_id(t))
    }

    pub fn pad_token(&self) -> Option<&str> {
        self.pad_token.as_deref()
    }

    pub fn set_pad_token(&mut self, token: &str) {
        self.pad_token = Some(token.to_string());
    }

    pub fn pad_token_id(&self) -> Option<u32> {
        self.pad_token.as_deref().and_then(|t| self.inner.token_to_id(t))
    }

    pub fn bos_token(&self) -> Option<&str> {
        self.bos_token.as_deref()
    }

    pub fn model_max_length(&self) -> Option<usize> {
        self.model_max_length
    }

    pub fn model_type(&self) -> Option<&str> {
        self.key.as_deref()
    }

    pub fn model_dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    pub(crate) fn attach_origin(&mut self, key: &str, dir: &Path) {
        self.key = Some(key.to_string());
        self.dir = Some(dir.to_path_buf());
    }

    pub fn token_to_id(&self, token: &str) -> Option<u32> {
        self.inner.token_to_id(token)
    }

    pub fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }

    pub fn encode(&self, text: &str, add_special_tokens: bool) -> Result<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, add_special_tokens)
            .map_err(LoaderError::from)?;
        Ok(encoding.get_ids().to_vec())
    }

    pub fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String> {
        self.inner
            .decode(ids, skip_special_tokens)
            .map_err(LoaderError::from)
    }

    pub fn inner(&self) -> &Tokenizer {
        &self.inner
    }
}

impl std::fmt::Debug for TokenizerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenizerHandle")
            .field("eos_token", &self.eos_token)
            .field("pad_token", &self.pad_token)
            .field("bos_token", &self.bos_token)
            .field("model_max_length", &self.model_max_length)
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

/// Output of a resolution call. Owned by the caller; the registry keeps no
/// handle to it.
#[derive(Debug)]
pub struct ResolvedModel {
    /// None when the caller asked for tokenizer-only resolution.
    pub model: Option<ModelHandle>,
    pub tokenizer: TokenizerHandle,
    pub model_dir: PathBuf,
    pub dtype: Dtype,
    /// Derived context limit, after any caller override was validated.
    pub max_model_len: Option<usize>,
    pub key: String,
    /// Prompt-template id passed through to the templating layer.
    pub template_id: String,
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;
    use tokenizers::models::wordlevel::WordLevel;
    use tokenizers::AddedToken;

    pub(crate) fn tiny_tokenizer() -> TokenizerHandle {
        let vocab: HashMap<String, u32> = [
            ("<unk>".to_string(), 0u32),
            ("</s>".to_string(), 1),
            ("hello".to_string(), 2),
            ("world".to_string(), 3),
        ]
        .into_iter()
        .collect();
        let model = WordLevel::builder()
            .vocab(vocab)
            .unk_token("<unk>".to_string())
            .build()
            .unwrap();
        let mut tok = Tokenizer::new(model);
        tok.with_pre_tokenizer(Some(tokenizers::pre_tokenizers::whitespace::Whitespace {}));
        tok.add_special_tokens(&[AddedToken::from("</s>", true)]);
        TokenizerHandle::from_tokenizer(tok)
    }

    #[test]
    fn test_architecture_from_name() {
        assert_eq!(Architecture::from_name("LlamaForCausalLM"), Architecture::Llama);
        assert_eq!(Architecture::from_name("Qwen2ForCausalLM"), Architecture::Qwen2);
        assert_eq!(Architecture::from_name("QWenLMHeadModel"), Architecture::QwenLegacy);
        assert_eq!(Architecture::from_name("ChatGLMModel"), Architecture::ChatGlm);
        assert!(matches!(
            Architecture::from_name("MambaForCausalLM"),
            Architecture::Other(_)
        ));
    }

    #[test]
    fn test_config_max_len_takes_smallest() {
        let mut cfg = ModelConfigData::from_value(serde_json::json!({
            "max_position_embeddings": 32768,
            "seq_length": 8192,
        }))
        .unwrap();
        assert_eq!(cfg.max_model_len(), Some(8192));

        cfg.set("seq_length", serde_json::json!(2048));
        assert_eq!(cfg.max_model_len(), Some(2048));
    }

    #[test]
    fn test_config_dtype_rewrite() {
        let mut cfg = ModelConfigData::from_value(serde_json::json!({
            "torch_dtype": "float32",
        }))
        .unwrap();
        assert_eq!(cfg.torch_dtype(), Some(Dtype::F32));
        cfg.set_torch_dtype(Dtype::F16);
        assert_eq!(cfg.torch_dtype(), Some(Dtype::F16));
    }

    #[test]
    fn test_set_default_does_not_overwrite() {
        let mut cfg = ModelConfigData::from_value(serde_json::json!({"z_loss_weight": 1})).unwrap();
        cfg.set_default("z_loss_weight", serde_json::json!(0));
        assert_eq!(cfg.get_u64("z_loss_weight"), Some(1));
    }

    #[test]
    fn test_tokenizer_special_tokens() {
        let mut tok = tiny_tokenizer();
        assert!(tok.eos_token().is_none());
        tok.set_eos_token("</s>");
        assert_eq!(tok.eos_token_id(), Some(1));

        let ids = tok.encode("hello world", false).unwrap();
        assert_eq!(ids, vec![2, 3]);
        let text = tok.decode(&ids, true).unwrap();
        assert_eq!(text, "hello world");
    }

    #[test]
    fn test_sidecar_token_forms() {
        let mut tok = tiny_tokenizer();
        tok.absorb_sidecar(&serde_json::json!({
            "eos_token": {"content": "</s>", "lstrip": false},
            "pad_token": "<unk>",
            "model_max_length": 1e30,
        }));
        assert_eq!(tok.eos_token(), Some("</s>"));
        assert_eq!(tok.pad_token(), Some("<unk>"));
        // The sentinel value is ignored.
        assert_eq!(tok.model_max_length(), None);
    }
}
