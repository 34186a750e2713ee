//! Capability detection: search the runtime-configuration space of a model
//! on the current hardware and benchmark what works.
//!
//! Detection walks an increasing ladder of context sizes. At each rung it
//! probes candidate configs by actually starting a server and timing three
//! short completions; out-of-memory loads, hangs and protocol misbehavior
//! all count as "infeasible" and narrow the search. Feasibility shrinks
//! monotonically as context grows, which lets each rung start from the
//! previous rung's frontier.

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::client::CompletionClient;
use crate::config::{FlashAttn, ServerConfig, ALL_GPU_LAYERS};
use crate::error::{Error, Result};
use crate::installation::Installation;
use crate::model_file::ModelFileInfo;
use crate::server::{noop_log_sink, LlamaServer, DEFAULT_START_TIMEOUT};

/// Context sizes to try, ascending.
pub const CONTEXT_LADDER: [u32; 11] = [
    4096, 8192, 16384, 24576, 32768, 49152, 65536, 98304, 131072, 196608, 262144,
];

/// Ceiling applied when the model does not advertise a trained context.
const DEFAULT_CONTEXT_CEILING: u64 = 128 * 1024;

/// Prompts timed during benchmarking.
pub const BENCH_PROMPTS: [&str; 3] = [
    "What is machine learning and how does it differ from traditional programming?",
    "What are the essential ingredients needed to make pasta from scratch?",
    "How many players are on a basketball team during a game?",
];

const BENCH_MAX_TOKENS: u32 = 20;

const COMPLETION_TIMEOUT: Duration = Duration::from_secs(120);

/// Tensor-override patterns probed on GPU builds, cheapest savings first.
pub const OVERRIDE_PATTERNS: [&[&str]; 6] = [
    &["ffn_up.*=CPU"],
    &["ffn_down.*=CPU"],
    &["ffn_gate.*=CPU"],
    &["ffn_up.*=CPU", "ffn_down.*=CPU"],
    &["ffn_up.*=CPU", "ffn_gate.*=CPU"],
    &["attn.*=CPU"],
];

/// One validated configuration with its measured throughput.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Benchmark {
    pub context_size: u32,
    pub config: ServerConfig,
    pub prompt_tps: f64,
    pub generation_tps: f64,
}

impl Benchmark {
    /// Ranking score; the raw figures stay available.
    pub fn score(&self) -> f64 {
        self.prompt_tps + self.generation_tps
    }
}

/// Everything detection learned about one model file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionResult {
    pub file_info: ModelFileInfo,
    /// Best benchmark per feasible context size, ascending.
    pub benchmarks: Vec<Benchmark>,
}

/// Frontier carried from one ladder rung to the next, per flash-attention
/// mode.
struct Frontier {
    /// Right edge for the gpu-layers search.
    layers_hi: u32,
    /// No layer count worked at the previous rung; skip the search.
    layers_dead: bool,
    /// Minimum feasible n-cpu-moe found previously, used as an entry probe.
    moe_floor: Option<u32>,
    moe_dead: bool,
    /// Override patterns still alive at this rung.
    patterns: Vec<Vec<String>>,
}

impl Frontier {
    fn new(block_count: u32) -> Self {
        Self {
            layers_hi: block_count.min(ALL_GPU_LAYERS),
            layers_dead: false,
            moe_floor: None,
            moe_dead: false,
            patterns: OVERRIDE_PATTERNS
                .iter()
                .map(|p| p.iter().map(|s| s.to_string()).collect())
                .collect(),
        }
    }
}

pub struct Detector {
    installation: Installation,
    start_timeout: Duration,
    completion_timeout: Duration,
}

impl Detector {
    pub fn new(installation: Installation) -> Self {
        Self {
            installation,
            start_timeout: DEFAULT_START_TIMEOUT,
            completion_timeout: COMPLETION_TIMEOUT,
        }
    }

    /// Shorter bounds for tests against fake servers.
    pub fn with_timeouts(mut self, start: Duration, completion: Duration) -> Self {
        self.start_timeout = start;
        self.completion_timeout = completion;
        self
    }

    /// Run full detection for the model at `path`.
    pub async fn detect(&self, path: &Path) -> Result<DetectionResult> {
        let file_info = ModelFileInfo::inspect(path).await?;
        let has_gpu = self.installation.has_cuda().await?;
        let ceiling = file_info.context_length.unwrap_or(DEFAULT_CONTEXT_CEILING);
        let block_count = file_info.block_count;
        log::info!(
            "detecting capabilities for {} (gpu={has_gpu}, blocks={block_count}, ctx ceiling={ceiling})",
            path.display()
        );

        let mut frontiers = [Frontier::new(block_count), Frontier::new(block_count)];
        let mut benchmarks = Vec::new();
        for context_size in CONTEXT_LADDER {
            if u64::from(context_size) > ceiling {
                break;
            }
            let mut round: Vec<Benchmark> = Vec::new();
            for (slot, flash) in [FlashAttn::On, FlashAttn::Off].into_iter().enumerate() {
                let base = self.base_config(path, context_size, flash);
                if has_gpu {
                    self.probe_gpu_configs(&base, block_count, &mut frontiers[slot], &mut round)
                        .await?;
                } else if let Some(bench) = self.benchmark(base).await? {
                    round.push(bench);
                }
            }
            match best_of(round) {
                Some(best) => {
                    log::info!(
                        "context {context_size}: best score {:.1} ({:.1} prompt, {:.1} gen)",
                        best.score(),
                        best.prompt_tps,
                        best.generation_tps
                    );
                    benchmarks.push(best);
                }
                None => log::info!("context {context_size}: no working configuration"),
            }
        }

        Ok(DetectionResult {
            file_info,
            benchmarks,
        })
    }

    fn base_config(&self, path: &Path, context_size: u32, flash: FlashAttn) -> ServerConfig {
        let mut config = ServerConfig::for_model(path);
        config.context_size = Some(context_size);
        config.flash_attention = Some(flash);
        config
    }

    /// GPU-side probing for one flash-attention mode at one rung.
    async fn probe_gpu_configs(
        &self,
        base: &ServerConfig,
        block_count: u32,
        frontier: &mut Frontier,
        round: &mut Vec<Benchmark>,
    ) -> Result<()> {
        // Everything on the GPU is the common case; when it works there is
        // no point searching below it.
        let mut all_gpu = base.clone();
        all_gpu.gpu_layers = Some(ALL_GPU_LAYERS);
        if let Some(bench) = self.benchmark(all_gpu).await? {
            round.push(bench);
            return Ok(());
        }

        if !frontier.layers_dead {
            let probe = |layers: u32| {
                let mut config = base.clone();
                config.gpu_layers = (layers > 0).then_some(layers);
                self.benchmark(config)
            };
            match search_extreme(0, frontier.layers_hi, true, None, probe).await? {
                Some((layers, bench)) => {
                    frontier.layers_hi = layers;
                    round.push(bench);
                }
                None => frontier.layers_dead = true,
            }
        }

        if !frontier.moe_dead {
            let probe = |moe: u32| {
                let mut config = base.clone();
                config.gpu_layers = Some(ALL_GPU_LAYERS);
                config.n_cpu_moe = Some(moe);
                self.benchmark(config)
            };
            match search_extreme(0, block_count, false, frontier.moe_floor, probe).await? {
                Some((moe, bench)) => {
                    frontier.moe_floor = Some(moe);
                    round.push(bench);
                }
                None => frontier.moe_dead = true,
            }
        }

        let mut survivors = Vec::with_capacity(frontier.patterns.len());
        for pattern in std::mem::take(&mut frontier.patterns) {
            let mut config = base.clone();
            config.gpu_layers = Some(ALL_GPU_LAYERS);
            config.override_tensors = Some(pattern.clone());
            if let Some(bench) = self.benchmark(config).await? {
                round.push(bench);
                survivors.push(pattern);
            }
        }
        frontier.patterns = survivors;

        Ok(())
    }

    /// Start a silenced server with `config`, time the three fixed prompts
    /// and average the reported throughput. Probe-level failures (start
    /// failure, timeout, protocol errors) come back as `None`; anything else
    /// aborts detection.
    pub async fn benchmark(&self, config: ServerConfig) -> Result<Option<Benchmark>> {
        let context_size = config.effective_context_size();
        let mut server = LlamaServer::new(self.installation.clone(), config.clone())
            .with_log_sink(noop_log_sink())
            .with_start_timeout(self.start_timeout);
        let outcome = self.run_probe(&mut server).await;
        // Unconditional teardown, success or not.
        let _ = server.stop(true).await;

        match outcome {
            Ok((prompt_tps, generation_tps)) => Ok(Some(Benchmark {
                context_size,
                config,
                prompt_tps,
                generation_tps,
            })),
            Err(e) if e.is_probe_failure() => {
                log::debug!("probe failed: {e}");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn run_probe(&self, server: &mut LlamaServer) -> Result<(f64, f64)> {
        server.start().await?;
        let port = server.port().ok_or_else(|| {
            Error::InvalidArgument("started server reported no port".to_string())
        })?;
        let client = CompletionClient::new(format!("http://localhost:{port}"))?;
        time_prompts(&client, self.completion_timeout).await
    }
}

async fn time_prompts(client: &CompletionClient, timeout: Duration) -> Result<(f64, f64)> {
    let mut prompt_total = 0.0;
    let mut generation_total = 0.0;
    for prompt in BENCH_PROMPTS {
        let response = client.completion(prompt, BENCH_MAX_TOKENS, timeout).await?;
        let timings = response.timings()?;
        prompt_total += timings.prompt_per_second;
        generation_total += timings.predicted_per_second;
    }
    let n = BENCH_PROMPTS.len() as f64;
    Ok((prompt_total / n, generation_total / n))
}

fn best_of(round: Vec<Benchmark>) -> Option<Benchmark> {
    round
        .into_iter()
        .max_by(|a, b| a.score().total_cmp(&b.score()))
}

/// Binary search for the extreme feasible value in `[left, right]`.
///
/// `probe` benchmarks a candidate; `None` means infeasible. When `initial`
/// is given it is probed first and an initial failure short-circuits the
/// whole search (the monotone cutoff carried between ladder rungs). Returns
/// the best value seen together with its benchmark.
pub(crate) async fn search_extreme<P, Fut>(
    left: u32,
    right: u32,
    maximize: bool,
    initial: Option<u32>,
    mut probe: P,
) -> Result<Option<(u32, Benchmark)>>
where
    P: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<Option<Benchmark>>>,
{
    let mut best: Option<(u32, Benchmark)> = None;
    if let Some(init) = initial {
        match probe(init).await? {
            Some(bench) => best = Some((init, bench)),
            None => return Ok(None),
        }
    }

    let (mut lo, mut hi) = (left, right);
    while lo <= hi {
        let mid = lo + (hi - lo) / 2;
        match probe(mid).await? {
            Some(bench) => {
                let improved = match &best {
                    None => true,
                    Some((v, _)) => {
                        if maximize {
                            mid > *v
                        } else {
                            mid < *v
                        }
                    }
                };
                if improved {
                    best = Some((mid, bench));
                }
                if maximize {
                    lo = mid + 1;
                } else {
                    if mid == 0 {
                        break;
                    }
                    hi = mid - 1;
                }
            }
            None => {
                if maximize {
                    if mid == 0 {
                        break;
                    }
                    hi = mid - 1;
                } else {
                    lo = mid + 1;
                }
            }
        }
    }
    Ok(best)
}
