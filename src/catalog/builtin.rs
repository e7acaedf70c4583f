//! The builtin model table.
//!
//! Keys are stable identifiers; everything else here is the declarative
//! metadata resolution needs. Entries are grouped by the loader they share.

use crate::error::Result;
use crate::loaders::{LoaderArgs, LoaderKey};
use crate::types::Dtype;

use super::{CatalogEntry, FamilyRegistration, ModelCatalog};

const LLAMA_TARGETS: &[&str] = &["q_proj", "k_proj", "v_proj"];
const QWEN_LEGACY_TARGETS: &[&str] = &["c_attn"];
const CHATGLM_TARGETS: &[&str] = &["query_key_value"];
const BAICHUAN_TARGETS: &[&str] = &["W_pack"];
const INTERNLM2_TARGETS: &[&str] = &["wqkv"];
const PHI2_TARGETS: &[&str] = &["Wqkv"];
const PHI3_TARGETS: &[&str] = &["qkv_proj"];

/// Weight files shipped redundantly next to safetensors.
const LEGACY_BIN: &str = r".+\.bin$";

pub(super) fn install(catalog: &ModelCatalog) -> Result<()> {
    llama_family(catalog)?;
    general_family(catalog)?;
    qwen_family(catalog)?;
    qwen2_family(catalog)?;
    chatglm_family(catalog)?;
    baichuan2_family(catalog)?;
    Ok(())
}

fn llama_family(catalog: &ModelCatalog) -> Result<()> {
    let base = |key: &str, hub: &str, mirror: &str| {
        CatalogEntry::new(key, LoaderKey::Llama)
            .hub(hub)
            .mirror(mirror)
            .adapter_targets(LLAMA_TARGETS)
            .ignore(LEGACY_BIN)
            .flash_attn()
            .serving()
    };
    FamilyRegistration::new(LoaderKey::Llama)
        .entry(
            base("llama2-7b", "meta-llama/Llama-2-7b-hf", "modelscope/Llama-2-7b-ms")
                .template("default-generation"),
        )
        .entry(
            base(
                "llama2-7b-chat",
                "meta-llama/Llama-2-7b-chat-hf",
                "modelscope/Llama-2-7b-chat-ms",
            )
            .template("llama2"),
        )
        .entry(
            base("llama2-13b", "meta-llama/Llama-2-13b-hf", "modelscope/Llama-2-13b-ms")
                .template("default-generation"),
        )
        .entry(
            base(
                "llama2-13b-chat",
                "meta-llama/Llama-2-13b-chat-hf",
                "modelscope/Llama-2-13b-chat-ms",
            )
            .template("llama2"),
        )
        .entry(
            base(
                "llama2-70b-chat",
                "meta-llama/Llama-2-70b-chat-hf",
                "modelscope/Llama-2-70b-chat-ms",
            )
            .template("llama2"),
        )
        .entry(
            base(
                "codellama-7b-instruct",
                "codellama/CodeLlama-7b-Instruct-hf",
                "AI-ModelScope/CodeLlama-7b-Instruct-hf",
            )
            .template("llama2")
            .tag("coding"),
        )
        .entry(
            base(
                "codellama-13b-instruct",
                "codellama/CodeLlama-13b-Instruct-hf",
                "AI-ModelScope/CodeLlama-13b-Instruct-hf",
            )
            .template("llama2")
            .tag("coding"),
        )
        .install(catalog)
}

/// Families whose only load-time fix is attention-backend wiring.
fn general_family(catalog: &ModelCatalog) -> Result<()> {
    FamilyRegistration::new(LoaderKey::FlashAttn)
        .entry(
            CatalogEntry::new("yi-6b", LoaderKey::FlashAttn)
                .hub("01-ai/Yi-6B")
                .mirror("01ai/Yi-6B")
                .adapter_targets(LLAMA_TARGETS)
                .template("default-generation")
                .flash_attn()
                .serving(),
        )
        .entry(
            CatalogEntry::new("yi-6b-chat", LoaderKey::FlashAttn)
                .hub("01-ai/Yi-6B-Chat")
                .mirror("01ai/Yi-6B-Chat")
                .adapter_targets(LLAMA_TARGETS)
                .template("chatml")
                .eos("<|im_end|>")
                .flash_attn()
                .serving(),
        )
        .entry(
            CatalogEntry::new("yi-34b-chat", LoaderKey::FlashAttn)
                .hub("01-ai/Yi-34B-Chat")
                .mirror("01ai/Yi-34B-Chat")
                .adapter_targets(LLAMA_TARGETS)
                .template("chatml")
                .eos("<|im_end|>")
                .flash_attn()
                .serving(),
        )
        .entry(
            CatalogEntry::new("mistral-7b", LoaderKey::FlashAttn)
                .hub("mistralai/Mistral-7B-v0.1")
                .mirror("AI-ModelScope/Mistral-7B-v0.1")
                .adapter_targets(LLAMA_TARGETS)
                .template("default-generation")
                .flash_attn()
                .serving(),
        )
        .entry(
            CatalogEntry::new("mistral-7b-instruct-v2", LoaderKey::FlashAttn)
                .hub("mistralai/Mistral-7B-Instruct-v0.2")
                .mirror("AI-ModelScope/Mistral-7B-Instruct-v0.2")
                .adapter_targets(LLAMA_TARGETS)
                .template("mistral")
                .flash_attn()
                .serving(),
        )
        .entry(
            CatalogEntry::new("mixtral-moe-7b-instruct", LoaderKey::FlashAttn)
                .hub("mistralai/Mixtral-8x7B-Instruct-v0.1")
                .mirror("AI-ModelScope/Mixtral-8x7B-Instruct-v0.1")
                .adapter_targets(LLAMA_TARGETS)
                .template("mistral")
                .requires("candle>=0.7")
                .flash_attn()
                .serving(),
        )
        .entry(
            CatalogEntry::new("deepseek-7b-chat", LoaderKey::FlashAttn)
                .hub("deepseek-ai/deepseek-llm-7b-chat")
                .mirror("deepseek-ai/deepseek-llm-7b-chat")
                .adapter_targets(LLAMA_TARGETS)
                .template("deepseek")
                .flash_attn()
                .serving(),
        )
        .entry(
            CatalogEntry::new("deepseek-coder-6_7b-instruct", LoaderKey::FlashAttn)
                .hub("deepseek-ai/deepseek-coder-6.7b-instruct")
                .mirror("deepseek-ai/deepseek-coder-6.7b-instruct")
                .adapter_targets(LLAMA_TARGETS)
                .template("deepseek-coder")
                .tag("coding")
                .flash_attn()
                .serving(),
        )
        .entry(
            CatalogEntry::new("internlm2-7b", LoaderKey::FlashAttn)
                .hub("internlm/internlm2-7b")
                .mirror("Shanghai_AI_Laboratory/internlm2-7b")
                .adapter_targets(INTERNLM2_TARGETS)
                .template("default-generation")
                .requires("tokenizers>=0.15")
                .flash_attn()
                .serving(),
        )
        .entry(
            CatalogEntry::new("internlm2-7b-chat", LoaderKey::FlashAttn)
                .hub("internlm/internlm2-chat-7b")
                .mirror("Shanghai_AI_Laboratory/internlm2-chat-7b")
                .adapter_targets(INTERNLM2_TARGETS)
                .template("internlm2")
                .eos("<|im_end|>")
                .requires("tokenizers>=0.15")
                .flash_attn()
                .serving(),
        )
        .entry(
            CatalogEntry::new("internlm2-20b-chat", LoaderKey::FlashAttn)
                .hub("internlm/internlm2-chat-20b")
                .mirror("Shanghai_AI_Laboratory/internlm2-chat-20b")
                .adapter_targets(INTERNLM2_TARGETS)
                .template("internlm2")
                .eos("<|im_end|>")
                .requires("tokenizers>=0.15")
                .flash_attn()
                .serving(),
        )
        .entry(
            CatalogEntry::new("gemma-2b-instruct", LoaderKey::FlashAttn)
                .hub("google/gemma-2b-it")
                .mirror("AI-ModelScope/gemma-2b-it")
                .adapter_targets(LLAMA_TARGETS)
                .template("gemma")
                .requires("candle>=0.7")
                .flash_attn()
                .serving(),
        )
        .entry(
            CatalogEntry::new("gemma-7b-instruct", LoaderKey::FlashAttn)
                .hub("google/gemma-7b-it")
                .mirror("AI-ModelScope/gemma-7b-it")
                .adapter_targets(LLAMA_TARGETS)
                .template("gemma")
                .requires("candle>=0.7")
                .flash_attn()
                .serving(),
        )
        .entry(
            CatalogEntry::new("phi2-3b", LoaderKey::FlashAttn)
                .hub("microsoft/phi-2")
                .mirror("AI-ModelScope/phi-2")
                .adapter_targets(PHI2_TARGETS)
                .template("default-generation")
                .tag("coding")
                .flash_attn()
                .serving(),
        )
        .entry(
            CatalogEntry::new("phi3-4b-instruct", LoaderKey::FlashAttn)
                .hub("microsoft/Phi-3-mini-4k-instruct")
                .mirror("LLM-Research/Phi-3-mini-4k-instruct")
                .adapter_targets(PHI3_TARGETS)
                .template("phi3")
                .requires("candle>=0.7")
                .flash_attn(),
        )
        .install(catalog)
}

fn qwen_family(catalog: &ModelCatalog) -> Result<()> {
    let base = |key: &str, repo: &str| {
        CatalogEntry::new(key, LoaderKey::QwenBase)
            .hub(&format!("Qwen/{repo}"))
            .mirror(&format!("qwen/{repo}"))
            .adapter_targets(QWEN_LEGACY_TARGETS)
            .template("default-generation")
            .flash_attn()
            .serving()
    };
    FamilyRegistration::new(LoaderKey::QwenBase)
        .entry(base("qwen-1_8b", "Qwen-1_8B"))
        .entry(base("qwen-7b", "Qwen-7B"))
        .entry(base("qwen-14b", "Qwen-14B"))
        .entry(base("qwen-72b", "Qwen-72B"))
        .install(catalog)?;

    let chat = |key: &str, repo: &str| {
        CatalogEntry::new(key, LoaderKey::QwenChat)
            .hub(&format!("Qwen/{repo}"))
            .mirror(&format!("qwen/{repo}"))
            .adapter_targets(QWEN_LEGACY_TARGETS)
            .template("chatml")
            .flash_attn()
            .serving()
    };
    FamilyRegistration::new(LoaderKey::QwenChat)
        .entry(chat("qwen-1_8b-chat", "Qwen-1_8B-Chat"))
        .entry(chat("qwen-7b-chat", "Qwen-7B-Chat"))
        .entry(chat("qwen-14b-chat", "Qwen-14B-Chat"))
        .entry(chat("qwen-72b-chat", "Qwen-72B-Chat"))
        .entry(
            chat("qwen-7b-chat-int4", "Qwen-7B-Chat-Int4")
                .args(LoaderArgs::gptq(4))
                .dtype(Dtype::F16)
                .requires("candle>=0.6"),
        )
        .entry(
            chat("qwen-7b-chat-int8", "Qwen-7B-Chat-Int8")
                .args(LoaderArgs::gptq(8))
                .dtype(Dtype::F16)
                .requires("candle>=0.6"),
        )
        .entry(chat("qwen-vl-chat", "Qwen-VL-Chat").tag("vision"))
        .entry(chat("qwen-audio-chat", "Qwen-Audio-Chat").tag("audio"))
        .install(catalog)
}

fn qwen2_family(catalog: &ModelCatalog) -> Result<()> {
    let base = |key: &str, repo: &str| {
        CatalogEntry::new(key, LoaderKey::Qwen2)
            .hub(&format!("Qwen/{repo}"))
            .mirror(&format!("qwen/{repo}"))
            .adapter_targets(LLAMA_TARGETS)
            .template("chatml")
            .flash_attn()
            .serving()
    };
    let mut family = FamilyRegistration::new(LoaderKey::Qwen2);
    for size in ["0_5b", "1_8b", "4b", "7b", "14b", "72b"] {
        let repo_size = size.replace('_', ".").replace('b', "B");
        family = family
            .entry(
                base(&format!("qwen1half-{size}"), &format!("Qwen1.5-{repo_size}"))
                    .template("default-generation"),
            )
            .entry(base(
                &format!("qwen1half-{size}-chat"),
                &format!("Qwen1.5-{repo_size}-Chat"),
            ));
    }
    family
        .entry(
            base("qwen1half-7b-chat-int4", "Qwen1.5-7B-Chat-GPTQ-Int4")
                .args(LoaderArgs::gptq(4))
                .dtype(Dtype::F16)
                .requires("candle>=0.6"),
        )
        .entry(
            base("qwen1half-14b-chat-int4", "Qwen1.5-14B-Chat-GPTQ-Int4")
                .args(LoaderArgs::gptq(4))
                .dtype(Dtype::F16)
                .requires("candle>=0.6"),
        )
        .entry(
            base("qwen1half-7b-chat-int8", "Qwen1.5-7B-Chat-GPTQ-Int8")
                .args(LoaderArgs::gptq(8))
                .dtype(Dtype::F16)
                .requires("candle>=0.6"),
        )
        .entry(
            base("qwen1half-7b-chat-awq", "Qwen1.5-7B-Chat-AWQ")
                .args(LoaderArgs::awq())
                .dtype(Dtype::F16)
                .requires("candle>=0.6"),
        )
        .install(catalog)
}

fn chatglm_family(catalog: &ModelCatalog) -> Result<()> {
    let base = |key: &str, repo: &str, template: &str| {
        CatalogEntry::new(key, LoaderKey::ChatGlm)
            .hub(&format!("THUDM/{repo}"))
            .mirror(&format!("ZhipuAI/{repo}"))
            .adapter_targets(CHATGLM_TARGETS)
            .template(template)
    };
    FamilyRegistration::new(LoaderKey::ChatGlm)
        .entry(base("chatglm2-6b", "chatglm2-6b", "chatglm2"))
        .entry(base("chatglm2-6b-32k", "chatglm2-6b-32k", "chatglm2"))
        .entry(base("chatglm3-6b-base", "chatglm3-6b-base", "default-generation"))
        .entry(base("chatglm3-6b", "chatglm3-6b", "chatglm3").serving())
        .entry(base("chatglm3-6b-32k", "chatglm3-6b-32k", "chatglm3").serving())
        .install(catalog)
}

fn baichuan2_family(catalog: &ModelCatalog) -> Result<()> {
    let base = |key: &str, repo: &str, template: &str| {
        CatalogEntry::new(key, LoaderKey::Baichuan2)
            .hub(&format!("baichuan-inc/{repo}"))
            .mirror(&format!("baichuan-inc/{repo}"))
            .adapter_targets(BAICHUAN_TARGETS)
            .template(template)
            .serving()
    };
    FamilyRegistration::new(LoaderKey::Baichuan2)
        .entry(base("baichuan2-7b", "Baichuan2-7B-Base", "default-generation"))
        .entry(base("baichuan2-7b-chat", "Baichuan2-7B-Chat", "baichuan"))
        .entry(base("baichuan2-13b", "Baichuan2-13B-Base", "default-generation"))
        .entry(base("baichuan2-13b-chat", "Baichuan2-13B-Chat", "baichuan"))
        .install(catalog)?;

    FamilyRegistration::new(LoaderKey::Baichuan2Quantized)
        .entry(
            CatalogEntry::new("baichuan2-7b-chat-int4", LoaderKey::Baichuan2Quantized)
                .hub("baichuan-inc/Baichuan2-7B-Chat-4bits")
                .mirror("baichuan-inc/Baichuan2-7B-Chat-4bits")
                .adapter_targets(BAICHUAN_TARGETS)
                .template("baichuan")
                .dtype(Dtype::BF16)
                .requires("candle>=0.5"),
        )
        .install(catalog)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quant_variants_share_family_loader() {
        let catalog = ModelCatalog::builtin();
        let plain = catalog.get("qwen1half-7b-chat").unwrap();
        let gptq = catalog.get("qwen1half-7b-chat-int4").unwrap();
        let awq = catalog.get("qwen1half-7b-chat-awq").unwrap();
        assert_eq!(plain.loader, gptq.loader);
        assert_eq!(plain.loader, awq.loader);
        assert_eq!(gptq.loader_args.gptq_bits, 4);
        assert!(awq.loader_args.awq);
        // Quantized checkpoints pin their precision.
        assert_eq!(gptq.declared_dtype, Some(Dtype::F16));
    }

    #[test]
    fn test_modality_tags() {
        let catalog = ModelCatalog::builtin();
        let vl = catalog.get("qwen-vl-chat").unwrap();
        assert!(vl.caps.tags.iter().any(|t| t == "vision"));
    }

    #[test]
    fn test_eos_overrides_present() {
        let catalog = ModelCatalog::builtin();
        assert_eq!(
            catalog.get("internlm2-7b-chat").unwrap().eos_override.as_deref(),
            Some("<|im_end|>")
        );
        assert_eq!(
            catalog.get("yi-6b-chat").unwrap().eos_override.as_deref(),
            Some("<|im_end|>")
        );
    }

    #[test]
    fn test_no_requirement_was_dropped() {
        // `requires` logs and drops unparseable constraints; every builtin
        // entry that quotes one must keep it.
        let catalog = ModelCatalog::builtin();
        for key in ["mixtral-moe-7b-instruct", "internlm2-7b-chat", "qwen-7b-chat-int4"] {
            assert!(
                !catalog.get(key).unwrap().requirements.is_empty(),
                "requirements missing for {key}"
            );
        }
    }

    #[test]
    fn test_qwen15_size_expansion() {
        let catalog = ModelCatalog::builtin();
        for size in ["0_5b", "1_8b", "4b", "7b", "14b", "72b"] {
            assert!(catalog.contains(&format!("qwen1half-{size}-chat")), "{size}");
        }
        let entry = catalog.get("qwen1half-0_5b-chat").unwrap();
        assert_eq!(entry.hub_id.as_deref(), Some("Qwen/Qwen1.5-0.5B-Chat"));
    }
}
