//! Model file inspection: size, content hash and GGUF-derived facts.

use std::collections::BTreeSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;

use crate::error::Result;
use crate::gguf::GgufFile;

/// Metadata values whose JSON encoding exceeds this many bytes are dropped
/// from the trimmed bag, chat templates excepted.
const METADATA_VALUE_LIMIT: usize = 200;

const CHAT_TEMPLATE_KEY: &str = "tokenizer.chat_template";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelFileInfo {
    pub file_size: u64,
    /// Lowercase hex SHA-256 of the file contents.
    pub sha256: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub architecture: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_length: Option<u64>,
    /// Transformer blocks, counted from `blk.<i>.` tensor names.
    pub block_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameter_count: Option<u64>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl ModelFileInfo {
    /// Inspect the `.gguf` file at `path`.
    pub async fn inspect(path: &Path) -> Result<Self> {
        let file_size = tokio::fs::metadata(path).await?.len();
        let sha256 = sha256_hex(path).await?;

        // Header parsing is synchronous and cheap next to the hash pass.
        let gguf = {
            let path = path.to_path_buf();
            tokio::task::spawn_blocking(move || GgufFile::read(&path))
                .await
                .map_err(|e| std::io::Error::other(e))??
        };

        let architecture = gguf
            .get("general.architecture")
            .and_then(|v| v.as_str())
            .map(str::to_owned);
        let context_length = architecture.as_deref().and_then(|arch| {
            gguf.get(&format!("{arch}.context_length"))
                .and_then(|v| v.as_int())
                .and_then(|v| u64::try_from(v).ok())
        });

        let mut block_indices = BTreeSet::new();
        let mut parameter_count: u64 = 0;
        for tensor in &gguf.tensors {
            if let Some(rest) = tensor.name.strip_prefix("blk.") {
                if let Some(index) = rest.split('.').next().and_then(|s| s.parse::<u32>().ok()) {
                    block_indices.insert(index);
                }
            }
            parameter_count = parameter_count.saturating_add(tensor.element_count());
        }

        let mut metadata = serde_json::Map::new();
        for (key, value) in &gguf.metadata {
            let json = value.to_json();
            let keep = key == CHAT_TEMPLATE_KEY
                || serde_json::to_string(&json)
                    .map(|s| s.len() <= METADATA_VALUE_LIMIT)
                    .unwrap_or(false);
            if keep {
                metadata.insert(key.clone(), json);
            }
        }

        Ok(Self {
            file_size,
            sha256,
            architecture,
            context_length,
            block_count: block_indices.len() as u32,
            parameter_count: (parameter_count > 0).then_some(parameter_count),
            metadata,
        })
    }
}

/// Streamed SHA-256 over the file contents.
async fn sha256_hex(path: &Path) -> Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 256 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    let digest = hasher.finalize();
    let mut hex = String::with_capacity(64);
    for byte in digest {
        hex.push_str(&format!("{byte:02x}"));
    }
    Ok(hex)
}
