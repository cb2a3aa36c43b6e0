//! Dedup/dispatch engine: pulls each source's item stream, notifies on unseen
//! ids, and persists the per-source seen-set.

mod config;

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use fundwatch_adapters::{AdapterContext, ItemStream, PageFetcher, StopReason};
use fundwatch_core::{notification_title, RunCap};
use fundwatch_notify::{LogSink, NotificationSink, PushbulletConfig, PushbulletSink};
use fundwatch_storage::{HttpClientConfig, HttpFetcher, SeenStore};
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub use config::{ConfiguredSource, SourceConfig, SourceRegistry, SyncConfig};

pub const CRATE_NAME: &str = "fundwatch-sync";

#[derive(Debug, Clone, Serialize)]
pub struct SourceReport {
    pub source_id: String,
    pub display_name: String,
    /// Items pulled from the stream, seen or not.
    pub examined: usize,
    pub dispatched: usize,
    pub skipped_seen: usize,
    pub sink_failures: usize,
    pub stop_reason: Option<StopReason>,
    /// Fetch or parse failure that ended the stream early.
    pub error: Option<String>,
    /// Seen-set write failure; ids dispatched this run will be pushed again.
    pub persist_error: Option<String>,
}

impl SourceReport {
    fn new(source: &ConfiguredSource) -> Self {
        Self {
            source_id: source.adapter.source_id().to_string(),
            display_name: source.display_name.clone(),
            examined: 0,
            dispatched: 0,
            skipped_seen: 0,
            sink_failures: 0,
            stop_reason: None,
            error: None,
            persist_error: None,
        }
    }

    pub fn is_failed(&self) -> bool {
        self.error.is_some() || self.persist_error.is_some()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sources: Vec<SourceReport>,
}

impl SyncRunSummary {
    pub fn failed_sources(&self) -> Vec<&SourceReport> {
        self.sources.iter().filter(|s| s.is_failed()).collect()
    }

    pub fn total_dispatched(&self) -> usize {
        self.sources.iter().map(|s| s.dispatched).sum()
    }

    /// True when there was at least one source and none of them finished cleanly.
    pub fn all_failed(&self) -> bool {
        !self.sources.is_empty() && self.sources.iter().all(SourceReport::is_failed)
    }
}

pub struct SyncPipeline {
    config: SyncConfig,
    seen_store: SeenStore,
    fetcher: Arc<dyn PageFetcher>,
    sink: Arc<dyn NotificationSink>,
    sources: Vec<ConfiguredSource>,
    persist_state: bool,
}

impl SyncPipeline {
    pub fn new(
        config: SyncConfig,
        sources: Vec<ConfiguredSource>,
        fetcher: Arc<dyn PageFetcher>,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        let seen_store = SeenStore::new(config.state_dir.clone(), config.retention);
        Self {
            config,
            seen_store,
            fetcher,
            sink,
            sources,
            persist_state: true,
        }
    }

    /// Leave seen-set files untouched (dry runs).
    pub fn with_state_persistence(mut self, persist_state: bool) -> Self {
        self.persist_state = persist_state;
        self
    }

    pub fn sources(&self) -> &[ConfiguredSource] {
        &self.sources
    }

    /// Runs every configured source once. A failing source is reported, never propagated.
    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let workers = Arc::new(Semaphore::new(self.config.workers.max(1)));
        info!(%run_id, sources = self.sources.len(), workers = self.config.workers, "starting sync run");

        let handles = self
            .sources
            .iter()
            .map(|source| {
                let job = SourceJob {
                    source: source.clone(),
                    ctx: AdapterContext::new(run_id),
                    fetcher: Arc::clone(&self.fetcher),
                    sink: Arc::clone(&self.sink),
                    seen_store: self.seen_store.clone(),
                    max_pages: self.config.max_pages,
                    persist_state: self.persist_state,
                };
                let workers = Arc::clone(&workers);
                tokio::spawn(async move {
                    let Ok(_permit) = workers.acquire_owned().await else {
                        let mut report = SourceReport::new(&job.source);
                        report.error = Some("worker pool closed".to_string());
                        return report;
                    };
                    job.run().await
                })
            })
            .collect::<Vec<_>>();

        let mut reports = Vec::with_capacity(handles.len());
        for (source, handle) in self.sources.iter().zip(handles) {
            let report = match handle.await {
                Ok(report) => report,
                Err(err) => {
                    error!(source_id = source.adapter.source_id(), error = %err, "source task aborted");
                    let mut report = SourceReport::new(source);
                    report.error = Some(format!("source task aborted: {err}"));
                    report
                }
            };
            reports.push(report);
        }

        let summary = SyncRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            sources: reports,
        };
        info!(
            %run_id,
            dispatched = summary.total_dispatched(),
            failed = summary.failed_sources().len(),
            "sync run finished"
        );
        Ok(summary)
    }
}

/// Everything one source needs to run on its own task.
struct SourceJob {
    source: ConfiguredSource,
    ctx: AdapterContext,
    fetcher: Arc<dyn PageFetcher>,
    sink: Arc<dyn NotificationSink>,
    seen_store: SeenStore,
    max_pages: usize,
    persist_state: bool,
}

impl SourceJob {
    async fn run(self) -> SourceReport {
        let source_id = self.source.adapter.source_id();
        let span = info_span!("sync_source", run_id = %self.ctx.run_id, source_id);
        self.process().instrument(span).await
    }

    async fn process(self) -> SourceReport {
        let adapter = &*self.source.adapter;
        let state_key = adapter.state_key();
        let mut report = SourceReport::new(&self.source);

        let mut seen = self.seen_store.load(state_key).await;
        let known = seen.len();

        let mut stream = ItemStream::new(adapter, &*self.fetcher, self.ctx.clone(), self.source.cap)
            .with_max_pages(self.max_pages);
        let outcome = loop {
            let item = match stream.next().await {
                Ok(Some(item)) => item,
                Ok(None) => break Ok(()),
                Err(err) => break Err(err),
            };
            if seen.contains(&item.id) {
                report.skipped_seen += 1;
                continue;
            }

            let title = notification_title(&self.source.display_name, &item);
            match self.sink.push(&title, &item.description).await {
                Ok(()) => {
                    seen.record(item.id);
                    report.dispatched += 1;
                }
                Err(err) => {
                    // Left unrecorded so the next run retries it.
                    warn!(id = %item.id, error = %err, "notification failed");
                    report.sink_failures += 1;
                }
            }
        };
        report.examined = stream.examined();
        report.stop_reason = stream.stop_reason();

        // Ids dispatched before a fetch/parse failure are still worth keeping.
        if self.persist_state {
            if let Err(err) = self
                .seen_store
                .persist(state_key, &seen)
                .await
                .with_context(|| format!("persisting seen-set for {}", adapter.source_id()))
            {
                error!(error = %format!("{err:#}"), dispatched = report.dispatched, "seen-set not persisted");
                report.persist_error = Some(format!("{err:#}"));
            }
        }

        if let Err(err) = outcome {
            error!(error = %err, examined = report.examined, "source run aborted");
            report.error = Some(err.to_string());
        }

        info!(
            known,
            examined = report.examined,
            dispatched = report.dispatched,
            skipped = report.skipped_seen,
            sink_failures = report.sink_failures,
            stop = ?report.stop_reason,
            "source processed"
        );
        report
    }
}

/// Wires the HTTP fetcher, the configured sink and the registry into a pipeline.
pub async fn pipeline_from_config(config: SyncConfig, dry_run: bool) -> Result<SyncPipeline> {
    let registry = SourceRegistry::load(&config.registry_path()).await?;
    let sources = registry.resolve(config.run_cap)?;

    let http = HttpFetcher::new(HttpClientConfig {
        timeout: config.http_timeout(),
        user_agent: Some(config.user_agent.clone()),
        global_concurrency: config.workers.max(1),
        ..Default::default()
    })?;

    let sink: Arc<dyn NotificationSink> = if dry_run {
        Arc::new(LogSink)
    } else {
        let api_key = config
            .pushbullet_api_key
            .clone()
            .context("PUSHBULLET_API_KEY is not set (use --dry-run to only log notifications)")?;
        Arc::new(
            PushbulletSink::new(PushbulletConfig {
                api_key,
                channel: config.pushbullet_channel.clone(),
                endpoint: None,
                timeout: Some(config.http_timeout()),
            })
            .context("building pushbullet client")?,
        )
    };

    Ok(SyncPipeline::new(config, sources, Arc::new(http), sink).with_state_persistence(!dry_run))
}

pub async fn run_sync_once_from_env(dry_run: bool) -> Result<SyncRunSummary> {
    let pipeline = pipeline_from_config(SyncConfig::from_env(), dry_run).await?;
    pipeline.run_once().await
}

/// Registry entries resolved against the current config, for listing.
pub async fn configured_sources_from_env() -> Result<Vec<ConfiguredSource>> {
    let config = SyncConfig::from_env();
    let registry = SourceRegistry::load(&config.registry_path()).await?;
    registry.resolve(config.run_cap)
}

pub fn describe_cap(cap: RunCap) -> String {
    match cap.limit() {
        Some(limit) => limit.to_string(),
        None => "unbounded".to_string(),
    }
}
