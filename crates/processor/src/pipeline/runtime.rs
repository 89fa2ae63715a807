//! Runtime hosting the five event pipelines
//!
//! Every enabled pipeline gets its own consumer, producer, state store and
//! checkpoint directory and runs as an independent task. All pipelines share
//! one stop signal; a pipeline that fails does not stop the others.

use serde::Serialize;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

use super::builder::PipelineBuilder;
use super::engine::EngineStats;
use super::definition::{pipeline_name, PipelineDefinition};
use crate::config::ProcessorConfig;
use crate::error::{ProcessorError, Result};
use crate::kafka::{KafkaSink, KafkaSource};
use adstream_types::EventKind;

type PipelineTask = Pin<Box<dyn Future<Output = Result<EngineStats>> + Send>>;

/// Outcome of one pipeline
#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub pipeline: &'static str,
    pub stats: Option<EngineStats>,
    pub error: Option<String>,
}

impl PipelineReport {
    pub fn is_failure(&self) -> bool {
        self.error.is_some()
    }
}

/// Outcome of all pipelines
#[derive(Debug, Clone, Default, Serialize)]
pub struct RuntimeReport {
    pub pipelines: Vec<PipelineReport>,
}

impl RuntimeReport {
    pub fn failures(&self) -> impl Iterator<Item = &PipelineReport> {
        self.pipelines.iter().filter(|p| p.is_failure())
    }

    pub fn is_success(&self) -> bool {
        self.failures().next().is_none()
    }
}

/// Runs the enabled pipelines until shutdown
pub struct AggregatorRuntime {
    config: ProcessorConfig,
}

impl AggregatorRuntime {
    pub fn new(config: ProcessorConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    fn prepare<T: Send + 'static>(
        &self,
        definition: PipelineDefinition<T>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<PipelineTask> {
        let topics = self.config.pipelines.get(definition.kind);
        let source = KafkaSource::new(&self.config.kafka, &topics.source_topic)?;
        let sink = KafkaSink::new(&self.config.kafka, &topics.sink_topic)?;

        info!(
            pipeline = definition.name(),
            source = %topics.source_topic,
            sink = %topics.sink_topic,
            "Configured pipeline"
        );

        let engine = PipelineBuilder::from_config(definition, &self.config)
            .with_source(Arc::new(source))
            .with_sink(Arc::new(sink))
            .build()?;
        Ok(Box::pin(engine.run(shutdown)))
    }

    fn prepare_kind(&self, kind: EventKind, shutdown: watch::Receiver<bool>) -> Result<PipelineTask> {
        let max_payload = self.config.engine.max_payload_bytes;
        match kind {
            EventKind::BidRequest => self.prepare(PipelineDefinition::bid_requests(max_payload), shutdown),
            EventKind::BidResponse => {
                self.prepare(PipelineDefinition::bid_responses(max_payload), shutdown)
            }
            EventKind::WinNotification => self.prepare(PipelineDefinition::wins(max_payload), shutdown),
            EventKind::Impression => self.prepare(PipelineDefinition::impressions(max_payload), shutdown),
            EventKind::Click => self.prepare(PipelineDefinition::clicks(max_payload), shutdown),
        }
    }

    /// Build and run every enabled pipeline until `shutdown` turns true.
    /// Construction errors abort before anything runs.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<RuntimeReport> {
        let kinds = self.config.pipelines.enabled();
        if kinds.is_empty() {
            return Err(ProcessorError::config("no pipeline is enabled"));
        }

        let mut tasks = Vec::with_capacity(kinds.len());
        for kind in kinds {
            tasks.push((pipeline_name(kind), self.prepare_kind(kind, shutdown.clone())?));
        }

        let handles: Vec<_> = tasks
            .into_iter()
            .map(|(name, task)| (name, tokio::spawn(task)))
            .collect();
        info!(pipelines = handles.len(), "Aggregator runtime started");

        let mut report = RuntimeReport::default();
        for (pipeline, handle) in handles {
            let entry = match handle.await {
                Ok(Ok(stats)) => PipelineReport {
                    pipeline,
                    stats: Some(stats),
                    error: None,
                },
                Ok(Err(e)) => {
                    error!(pipeline, error = %e, "Pipeline failed");
                    PipelineReport {
                        pipeline,
                        stats: None,
                        error: Some(e.to_string()),
                    }
                }
                Err(e) => {
                    error!(pipeline, "Pipeline task panicked: {}", e);
                    PipelineReport {
                        pipeline,
                        stats: None,
                        error: Some(format!("task panicked: {}", e)),
                    }
                }
            };
            report.pipelines.push(entry);
        }

        info!(
            pipelines = report.pipelines.len(),
            failed = report.failures().count(),
            "Aggregator runtime stopped"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;

    #[tokio::test]
    async fn test_runtime_requires_enabled_pipeline() {
        let mut config = ProcessorConfig::default();
        for kind in EventKind::ALL {
            let pipeline = match kind {
                EventKind::BidRequest => &mut config.pipelines.bid_requests,
                EventKind::BidResponse => &mut config.pipelines.bid_responses,
                EventKind::WinNotification => &mut config.pipelines.wins,
                EventKind::Impression => &mut config.pipelines.impressions,
                EventKind::Click => &mut config.pipelines.clicks,
            };
            *pipeline = PipelineConfig {
                enabled: false,
                ..PipelineConfig::for_kind(kind)
            };
        }

        let runtime = AggregatorRuntime::new(config).unwrap();
        let (_tx, rx) = watch::channel(false);
        assert!(runtime.run(rx).await.is_err());
    }

    #[test]
    fn test_report_failures() {
        let report = RuntimeReport {
            pipelines: vec![
                PipelineReport {
                    pipeline: "wins",
                    stats: Some(EngineStats::default()),
                    error: None,
                },
                PipelineReport {
                    pipeline: "clicks",
                    stats: None,
                    error: Some("restore failed".to_string()),
                },
            ],
        };
        assert!(!report.is_success());
        assert_eq!(report.failures().count(), 1);
    }
}
