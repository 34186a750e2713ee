//! Registry mapping model identifiers to validated server configurations.
//!
//! Entries come from detection output; selection resolves a user-supplied
//! identifier (content hash, alias, file name, or quantization-stripped file
//! name) plus a requested context size to the first matching entry.

use regex::Regex;

use crate::config::ServerConfig;
use crate::detect::DetectionResult;
use crate::installation::Installation;
use crate::switch::LlamaSpec;

/// Strips a trailing quantization suffix, e.g. `-q4_k_m` or `-q8_0`.
const QUANT_SUFFIX_PATTERN: &str = r"-q\d+[_k].*$";

#[derive(Debug, Clone)]
struct Entry {
    config: ServerConfig,
    sha256: String,
    aliases: Vec<String>,
}

impl Entry {
    fn matches(&self, input: &str, quant_suffix: &Regex) -> bool {
        if input == self.sha256 {
            return true;
        }
        if self.aliases.iter().any(|a| a == input) {
            return true;
        }
        let Some(stem) = self
            .config
            .model_path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| {
                let lower = n.to_lowercase();
                lower
                    .strip_suffix(".gguf")
                    .map(str::to_owned)
                    .unwrap_or(lower)
            })
        else {
            return false;
        };
        if input == stem {
            return true;
        }
        input == quant_suffix.replace(&stem, "")
    }
}

/// Ordered collection of prepared specs; insertion order decides ties.
pub struct SpecRegistry {
    installation: Installation,
    entries: Vec<Entry>,
    quant_suffix: Regex,
}

impl SpecRegistry {
    pub fn new(installation: Installation) -> Self {
        Self {
            installation,
            entries: Vec::new(),
            quant_suffix: Regex::new(QUANT_SUFFIX_PATTERN).expect("const regex"),
        }
    }

    /// Register every benchmark of a detection run, preserving order.
    pub fn add_detection_result(&mut self, result: &DetectionResult, aliases: &[String]) {
        for benchmark in &result.benchmarks {
            self.entries.push(Entry {
                config: benchmark.config.clone(),
                sha256: result.file_info.sha256.clone(),
                aliases: aliases.to_vec(),
            });
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// First entry (in insertion order) that matches `input` and whose
    /// effective context covers `context_size` (default 4096).
    pub fn select_spec(&self, input: &str, context_size: Option<u32>) -> Option<LlamaSpec> {
        let wanted = context_size.unwrap_or(4096);
        self.entries
            .iter()
            .find(|entry| {
                entry.config.effective_context_size() >= wanted
                    && entry.matches(input, &self.quant_suffix)
            })
            .map(|entry| LlamaSpec::new(self.installation.clone(), entry.config.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::Benchmark;
    use crate::model_file::ModelFileInfo;

    const SHA: &str = "ed5fa30c487b282ec156c29062f1222e5c20875a944ac98289dbd242e947f747";

    fn sample_result() -> DetectionResult {
        let file_info = ModelFileInfo {
            file_size: 105_454_144,
            sha256: SHA.to_string(),
            architecture: Some("llama".to_string()),
            context_length: Some(8192),
            block_count: 30,
            parameter_count: Some(134_515_008),
            metadata: serde_json::Map::new(),
        };
        let benchmarks = [4096u32, 8192]
            .into_iter()
            .map(|ctx| {
                let mut config =
                    ServerConfig::for_model("/models/SmolLM2-135M-Instruct-Q4_K_M.gguf");
                config.context_size = Some(ctx);
                Benchmark {
                    context_size: ctx,
                    config,
                    prompt_tps: 100.0,
                    generation_tps: 40.0,
                }
            })
            .collect();
        DetectionResult {
            file_info,
            benchmarks,
        }
    }

    fn registry() -> SpecRegistry {
        let mut registry = SpecRegistry::new(Installation::at("/opt/llama"));
        registry.add_detection_result(
            &sample_result(),
            &["test-model".to_string(), "my-model".to_string()],
        );
        registry
    }

    #[test]
    fn selects_by_sha_alias_and_filename_forms() {
        let registry = registry();

        let by_sha = registry.select_spec(SHA, Some(4096)).unwrap();
        assert_eq!(by_sha.config().context_size, Some(4096));

        let by_alias = registry.select_spec("test-model", Some(4096)).unwrap();
        assert_eq!(by_alias.config().context_size, Some(4096));

        // Full lowercased file name without the .gguf extension.
        assert!(registry
            .select_spec("smollm2-135m-instruct-q4_k_m", Some(4096))
            .is_some());
        // Quantization suffix stripped.
        assert!(registry
            .select_spec("smollm2-135m-instruct", Some(4096))
            .is_some());
    }

    #[test]
    fn context_requirement_picks_the_first_covering_entry() {
        let registry = registry();
        // 5000 tokens does not fit the 4096 entry; the 8192 one serves it.
        let spec = registry.select_spec("test-model", Some(5000)).unwrap();
        assert_eq!(spec.config().context_size, Some(8192));
        // Nothing covers 16384.
        assert!(registry.select_spec("test-model", Some(16384)).is_none());
    }

    #[test]
    fn unknown_identifiers_yield_nothing() {
        let registry = registry();
        let zeros = "0".repeat(64);
        assert!(registry.select_spec(&zeros, None).is_none());
        assert!(registry.select_spec("nonexistent", Some(4096)).is_none());
    }

    #[test]
    fn default_context_is_4096() {
        let registry = registry();
        let spec = registry.select_spec("my-model", None).unwrap();
        assert_eq!(spec.config().context_size, Some(4096));
    }

    #[test]
    fn insertion_order_breaks_ties() {
        let mut registry = SpecRegistry::new(Installation::at("/opt/llama"));
        let mut first = sample_result();
        first.benchmarks.truncate(1);
        first.benchmarks[0].config.threads = Some(4);
        let mut second = sample_result();
        second.benchmarks.truncate(1);
        second.benchmarks[0].config.threads = Some(8);
        registry.add_detection_result(&first, &["m".to_string()]);
        registry.add_detection_result(&second, &["m".to_string()]);
        let spec = registry.select_spec("m", Some(4096)).unwrap();
        assert_eq!(spec.config().threads, Some(4));
    }
}
