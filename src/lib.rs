//! llamactl: lifecycle management for a local `llama-server`.
//!
//! The crate does three things on top of a llama.cpp release:
//!
//! - **supervise** a `llama-server` subprocess: build its argv from a
//!   [`ServerConfig`], watch its log for the readiness banner, and guarantee
//!   teardown ([`LlamaServer`]);
//! - **detect** which runtime configurations (context size, GPU offload,
//!   MoE placement, tensor overrides, flash attention) actually load and
//!   run on the current hardware, benchmarking each ([`Detector`]);
//! - **switch** a single server slot between incoming model requests,
//!   reusing the running process whenever its configuration accepts the
//!   pending one ([`ProcessSwitcher`]).
//!
//! Detection output ([`DetectionResult`]) serializes to JSON and feeds the
//! [`SpecRegistry`], which resolves model identifiers (content hash, alias,
//! file name, quantization-stripped file name) back to validated specs.

pub mod client;
pub mod config;
pub mod detect;
pub mod error;
pub mod gguf;
pub mod installation;
pub mod model_file;
pub mod registry;
pub mod server;
pub mod setup;
pub mod switch;

pub use client::{CompletionClient, CompletionResponse, Timings};
pub use config::{FlashAttn, ServerConfig, ALL_GPU_LAYERS};
pub use detect::{Benchmark, DetectionResult, Detector};
pub use error::{Error, Result};
pub use installation::Installation;
pub use model_file::ModelFileInfo;
pub use registry::SpecRegistry;
pub use server::{LlamaServer, ServerProcess, ServerStatus};
pub use setup::{install, Installer};
pub use switch::{LlamaSpec, ProcessContext, ProcessSpec, ProcessSwitcher};
