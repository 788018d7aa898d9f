//! `agora-runtime` – Kernel Assembly
//!
//! Turns the collaborator seams of `agora-middleware` and the services of
//! `agora-kernel` into one running kernel process.
//!
//! # Modules
//!
//! - [`kernel`] – [`Kernel`][kernel::Kernel] and
//!   [`KernelBuilder`][kernel::KernelBuilder]: wires discovery, the directory
//!   and the network bridge under one [`ServiceManager`][agora_kernel::ServiceManager],
//!   binds the transport and creates the root context.
//! - [`config`] – [`KernelConfig`][config::KernelConfig]: the
//!   `~/.agora/kernel.toml` file with `AGORA_*` environment overrides.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]:
//!   initialises the global `tracing` subscriber with an optional OTLP span
//!   exporter.  Set `OTEL_EXPORTER_OTLP_ENDPOINT` to enable live trace export
//!   to Jaeger, Grafana Tempo, or any OTLP-compatible collector.

pub mod config;
pub mod kernel;
pub mod telemetry;

pub use config::KernelConfig;
pub use kernel::{Kernel, KernelBuilder};
pub use telemetry::{TracerProviderGuard, init_tracing};
