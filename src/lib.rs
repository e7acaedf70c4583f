//! llm-loader - model catalog, checkpoint resolution and load-time patching
//!
//! Maps a stable model-type key to a correctly configured model/tokenizer
//! pair: catalog lookup, dependency checks, checkpoint download, precision
//! selection, family-specific load fixes, and the universal post-load
//! reconciliation every family gets. Quantized variants and adapters ride
//! the same pipeline.
//!
//! ```no_run
//! use llm_loader::{ResolveRequest, Resolver};
//!
//! # async fn run() -> llm_loader::Result<()> {
//! let resolver = Resolver::new();
//! let resolved = resolver
//!     .resolve(ResolveRequest::new("qwen1half-7b-chat").tokenizer_only())
//!     .await?;
//! println!("eos: {:?}", resolved.tokenizer.eos_token());
//! # Ok(())
//! # }
//! ```

use std::fmt;

#[cfg(feature = "cuda")]
use candle_core::Device;

pub mod adapter;
pub mod catalog;
pub mod config;
pub mod error;
pub mod generate;
pub mod hub;
pub mod loaders;
pub mod logging;
pub mod model;
pub mod requirements;
pub mod resolve;
pub mod runtime;
pub mod types;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// Re-exports for the public API.
pub use adapter::{attach_adapter, merge_adapter, AdapterConfig, AdapterRuntime, LoraRuntime};
pub use catalog::{default_catalog, CatalogEntry, Capabilities, FamilyRegistration, ModelCatalog};
pub use config::{GenerationConfig, LoadOptions, QuantizationConfig};
pub use error::{LoaderError, Result};
pub use generate::{generate, generate_stream, GenerateOutput, GenerateParams, StreamEvent};
pub use model::{Architecture, ModelHandle, ResolvedModel, TokenizerHandle};
pub use requirements::{Requirement, RuntimeEnv};
pub use resolve::{ResolveRequest, Resolver, ResolverBuilder};
pub use types::{Dtype, PatchId};

/// Runtime features detected at startup.
pub struct Features {
    /// Whether CUDA support is enabled.
    pub cuda: bool,
    /// Number of detected CUDA devices.
    pub cuda_devices: usize,
    /// Whether the flash-attention kernels are compiled in.
    pub flash_attn: bool,
}

impl Features {
    /// Detect available features at runtime.
    pub fn detect() -> Self {
        #[cfg(feature = "cuda")]
        let (cuda, cuda_devices) = {
            match Device::cuda_if_available(0) {
                Ok(device) if !device.is_cpu() => {
                    let count = (0..8)
                        .filter(|&i| Device::new_cuda(i).is_ok())
                        .count();
                    (true, count)
                }
                _ => (false, 0),
            }
        };

        #[cfg(not(feature = "cuda"))]
        let (cuda, cuda_devices) = (false, 0);

        Self {
            cuda,
            cuda_devices,
            flash_attn: cfg!(feature = "flash-attn"),
        }
    }
}

impl fmt::Display for Features {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "CUDA support: {}", if self.cuda { "yes" } else { "no" })?;
        if self.cuda {
            writeln!(f, "CUDA devices: {}", self.cuda_devices)?;
        }
        writeln!(
            f,
            "flash attention: {}",
            if self.flash_attn { "yes" } else { "no" }
        )?;
        Ok(())
    }
}
