//! Aggregation pipelines
//!
//! This module turns a stream of raw records into windowed counts:
//! - Per-stream capability sets ([`PipelineDefinition`])
//! - A fluent builder wiring source, sink and checkpoint storage
//! - The aggregation engine with its record and clock loops
//! - A runtime hosting one pipeline per event stream
//!
//! # Example
//!
//! ```rust,no_run
//! use processor::config::ProcessorConfig;
//! use processor::pipeline::AggregatorRuntime;
//! use tokio::sync::watch;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = ProcessorConfig::load(None)?;
//! let (stop_tx, stop_rx) = watch::channel(false);
//!
//! let runtime = tokio::spawn(AggregatorRuntime::new(config)?.run(stop_rx));
//! tokio::signal::ctrl_c().await?;
//! stop_tx.send(true)?;
//!
//! let report = runtime.await??;
//! assert!(report.is_success());
//! # Ok(())
//! # }
//! ```

pub mod builder;
pub mod engine;
pub mod runtime;
pub mod definition;

pub use builder::PipelineBuilder;
pub use engine::{AggregationEngine, EngineSettings, EngineStats, PipelineState, RecordOutcome};
pub use runtime::{AggregatorRuntime, PipelineReport, RuntimeReport};
pub use definition::{pipeline_name, PipelineDefinition};
