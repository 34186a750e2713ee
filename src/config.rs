//! Server configuration values and the acceptance relation.
//!
//! A [`ServerConfig`] is an immutable description of one `llama-server`
//! invocation. Configs are plain values: structural equality and serde
//! round-trip with null fields omitted. The `effective_*` accessors apply
//! documented defaults, and [`ServerConfig::accepts`] is the pre-order that
//! decides whether a running server can serve a pending request without a
//! restart.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Default context size assumed when a config leaves it unset.
pub const DEFAULT_CONTEXT_SIZE: u32 = 4096;

/// Default bind address.
pub const DEFAULT_HOST: &str = "0.0.0.0";

/// `--gpu-layers 999` means "offload every layer".
pub const ALL_GPU_LAYERS: u32 = 999;

/// Flash-attention mode. `Auto` is equivalent to leaving the field unset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlashAttn {
    On,
    Off,
    Auto,
}

impl FlashAttn {
    pub fn as_str(self) -> &'static str {
        match self {
            FlashAttn::On => "on",
            FlashAttn::Off => "off",
            FlashAttn::Auto => "auto",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    pub model_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threads: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_size: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embeddings: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flash_attention: Option<FlashAttn>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mlock: Option<bool>,
    /// Layers offloaded to the GPU; unset means CPU-only semantics.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_layers: Option<u32>,
    /// Mixture-of-experts layers kept on the CPU.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n_cpu_moe: Option<u32>,
    /// Ordered `name=DEVICE` patterns, e.g. `ffn_up.*=CPU`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub override_tensors: Option<Vec<String>>,
    /// Extra raw argv tokens appended verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,
}

impl ServerConfig {
    /// Minimal config for a model file; everything else at defaults.
    pub fn for_model(model_path: impl Into<PathBuf>) -> Self {
        Self {
            host: None,
            port: None,
            model_path: model_path.into(),
            threads: None,
            context_size: None,
            embeddings: None,
            flash_attention: None,
            mlock: None,
            gpu_layers: None,
            n_cpu_moe: None,
            override_tensors: None,
            args: None,
        }
    }

    pub fn effective_host(&self) -> &str {
        self.host.as_deref().unwrap_or(DEFAULT_HOST)
    }

    pub fn effective_context_size(&self) -> u32 {
        self.context_size.unwrap_or(DEFAULT_CONTEXT_SIZE)
    }

    pub fn effective_embeddings(&self) -> bool {
        self.embeddings.unwrap_or(false)
    }

    pub fn effective_flash_attention(&self) -> FlashAttn {
        self.flash_attention.unwrap_or(FlashAttn::Auto)
    }

    pub fn effective_gpu_layers(&self) -> u32 {
        self.gpu_layers.unwrap_or(0)
    }

    pub fn effective_n_cpu_moe(&self) -> u32 {
        self.n_cpu_moe.unwrap_or(0)
    }

    fn override_tensor_slice(&self) -> &[String] {
        self.override_tensors.as_deref().unwrap_or(&[])
    }

    fn args_slice(&self) -> &[String] {
        self.args.as_deref().unwrap_or(&[])
    }

    /// Whether a server running with `self` can satisfy a request asking for
    /// `pending`. Reflexive but not symmetric: a bigger context, more GPU
    /// layers, or fewer CPU-bound experts dominate smaller demands, while
    /// model path, flash-attention mode, embeddings, override patterns and
    /// raw args must match exactly.
    pub fn accepts(&self, pending: &ServerConfig) -> bool {
        if self == pending {
            return true;
        }
        if self.model_path != pending.model_path {
            return false;
        }
        if self.effective_context_size() < pending.effective_context_size() {
            return false;
        }
        if self.effective_flash_attention() != pending.effective_flash_attention() {
            return false;
        }
        if self.effective_embeddings() != pending.effective_embeddings() {
            return false;
        }
        // Unspecified gpu-layers is not >= a specified count.
        if self.gpu_layers.is_none() && pending.gpu_layers.is_some() {
            return false;
        }
        if self.effective_gpu_layers() < pending.effective_gpu_layers() {
            return false;
        }
        if self.effective_n_cpu_moe() > pending.effective_n_cpu_moe() {
            return false;
        }
        if self.override_tensor_slice() != pending.override_tensor_slice() {
            return false;
        }
        if self.args_slice() != pending.args_slice() {
            return false;
        }
        true
    }

    /// Render the argv for `llama-server`, with the port already resolved.
    ///
    /// `flash_attn_takes_value` selects between the newer
    /// `--flash-attn on|off|auto` form and the older bare flag, which is
    /// only emitted when the mode is `on`.
    pub fn to_args(&self, port: u16, flash_attn_takes_value: bool) -> Vec<String> {
        let mut argv = vec![
            "--host".to_string(),
            self.effective_host().to_string(),
            "--port".to_string(),
            port.to_string(),
            "--model".to_string(),
            self.model_path.to_string_lossy().into_owned(),
        ];
        if let Some(threads) = self.threads {
            argv.push("--threads".to_string());
            argv.push(threads.to_string());
        }
        if let Some(ctx) = self.context_size {
            argv.push("--ctx-size".to_string());
            argv.push(ctx.to_string());
        }
        if let Some(layers) = self.gpu_layers {
            argv.push("--gpu-layers".to_string());
            argv.push(layers.to_string());
        }
        if let Some(moe) = self.n_cpu_moe {
            argv.push("--n-cpu-moe".to_string());
            argv.push(moe.to_string());
        }
        if self.embeddings == Some(true) {
            argv.push("--embeddings".to_string());
        }
        if self.mlock == Some(true) {
            argv.push("--mlock".to_string());
        }
        if flash_attn_takes_value {
            if let Some(mode) = self.flash_attention {
                argv.push("--flash-attn".to_string());
                argv.push(mode.as_str().to_string());
            }
        } else if self.flash_attention == Some(FlashAttn::On) {
            argv.push("--flash-attn".to_string());
        }
        for pattern in self.override_tensor_slice() {
            argv.push("--override-tensors".to_string());
            argv.push(pattern.clone());
        }
        argv.extend(self.args_slice().iter().cloned());
        argv
    }
}
