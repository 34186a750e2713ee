//! End-to-end scenarios against a real llama.cpp installation and model.
//!
//! Ignored by default; point the env vars at local artifacts to run them:
//!
//! ```sh
//! LLAMACTL_INSTALL_DIR=~/llama.cpp LLAMACTL_MODEL=~/models/SmolLM2-135M-Instruct-Q4_K_M.gguf \
//!     cargo test --test e2e -- --ignored
//! ```

use std::path::PathBuf;

use llamactl::config::ServerConfig;
use llamactl::detect::Detector;
use llamactl::installation::Installation;
use llamactl::server::{LlamaServer, ServerProcess};

fn env_path(name: &str) -> PathBuf {
    PathBuf::from(std::env::var(name).unwrap_or_else(|_| panic!("{name} must be set")))
}

fn installation() -> Installation {
    Installation::detect(&env_path("LLAMACTL_INSTALL_DIR")).expect("no installation found")
}

#[tokio::test]
#[ignore = "needs a real llama-server and model"]
async fn health_check_round_trip() {
    let install = installation();
    let config = ServerConfig::for_model(env_path("LLAMACTL_MODEL"));
    let mut server = LlamaServer::new(install, config);
    server.start().await.unwrap();

    let mut process = ServerProcess::from_server(server).unwrap();
    assert!(process.client().health().await.unwrap());
    process.close(false).await.unwrap();
}

#[tokio::test]
#[ignore = "needs a real llama-server and model"]
async fn detection_produces_positive_benchmarks() {
    let install = installation();
    let model = env_path("LLAMACTL_MODEL");
    let result = Detector::new(install).detect(&model).await.unwrap();

    assert!(!result.benchmarks.is_empty());
    let mut previous = 0;
    for bench in &result.benchmarks {
        assert!(bench.context_size > previous);
        previous = bench.context_size;
        assert_eq!(bench.config.context_size, Some(bench.context_size));
        assert!(bench.prompt_tps > 0.0);
        assert!(bench.generation_tps > 0.0);
    }
    assert!(result.file_info.block_count > 0);
}
