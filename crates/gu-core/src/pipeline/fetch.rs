//! Fetch stage: resolve pending versions and download them in parallel.

use super::context::{Download, UpdateContext};
use super::{Next, PipelineError, Stage};
use crate::cancel::CancelToken;
use crate::events::{event_names as progress, Phase, ProgressEmitter, ProgressEvent};
use crate::log_event;
use crate::logging::{event_names, LogContext, Stage as LogStage};
use crate::platform::PlatformStrategy;
use crate::source::{pending_updates, PackageDescriptor, PackageSource, SourceError};
use gu_config::FetchConfig;
use rand::Rng;
use std::path::Path;
use std::thread;
use std::time::Duration;
use tracing::error;

/// Delay before retry `attempt` (0-based): exponential, capped, jittered
/// into the upper half of the window.
pub(crate) fn backoff_delay(config: &FetchConfig, attempt: u32) -> Duration {
    let base = config
        .initial_backoff_ms
        .saturating_mul(1u64 << attempt.min(20))
        .min(config.max_backoff_ms);
    let half = base / 2;
    let jitter = if half == 0 {
        0
    } else {
        rand::rng().random_range(0..=half)
    };
    Duration::from_millis(base - half + jitter)
}

/// Why a retried call gave up.
#[derive(Debug)]
enum Retry {
    Failed(SourceError),
    /// Cancelled while waiting to retry.
    Cancelled,
}

impl Retry {
    fn into_pipeline(self, wrap: impl FnOnce(SourceError) -> PipelineError) -> PipelineError {
        match self {
            Retry::Failed(e) => wrap(e),
            Retry::Cancelled => PipelineError::Cancelled,
        }
    }
}

/// Run `op`, retrying transient failures with backoff.
fn with_retry<T>(
    config: &FetchConfig,
    cancel: &CancelToken,
    log: &LogContext,
    what: &str,
    mut op: impl FnMut() -> Result<T, SourceError>,
) -> Result<T, Retry> {
    let mut attempt = 0;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < config.max_retries && !cancel.is_cancelled() => {
                let delay = backoff_delay(config, attempt);
                log_event!(
                    log,
                    WARN,
                    event_names::FETCH_RETRY,
                    LogStage::Fetch,
                    format!("{} failed, retrying: {}", what, e),
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64
                );
                if !cancel.sleep(delay) {
                    return Err(Retry::Cancelled);
                }
                attempt += 1;
            }
            Err(e) => return Err(Retry::Failed(e)),
        }
    }
}

struct Fetcher<'a> {
    strategy: &'a PlatformStrategy,
    source: &'a dyn PackageSource,
    emitter: &'a dyn ProgressEmitter,
    config: &'a FetchConfig,
    cancel: &'a CancelToken,
    log: &'a LogContext,
    session: &'a str,
}

impl Fetcher<'_> {
    fn download(&self, descriptor: &PackageDescriptor, dest: &Path) -> Result<Download, PipelineError> {
        if self.cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        let event = |name: &str| {
            ProgressEvent::new(name, Phase::Fetch)
                .with_session_id(self.session)
                .with_detail("package", &descriptor.name)
                .with_detail("version", &descriptor.version)
        };
        self.emitter.emit(event(progress::DOWNLOAD_STARTED));

        let path = with_retry(self.config, self.cancel, self.log, &descriptor.file_name(), || {
            self.strategy.fetch(self.source, descriptor, dest, &mut |read, total| {
                self.emitter
                    .emit(event(progress::DOWNLOAD_PROGRESS).with_progress(read, total.or(descriptor.size)));
            })
        })
        .map_err(|e| {
            e.into_pipeline(|source| PipelineError::Fetch {
                package: descriptor.file_name(),
                source,
            })
        })?;

        self.emitter.emit(event(progress::DOWNLOAD_COMPLETED));
        Ok(Download {
            descriptor: descriptor.clone(),
            path,
        })
    }
}

/// Checks for newer versions and downloads every one of them.
pub struct FetchStage;

impl Stage for FetchStage {
    fn name(&self) -> LogStage {
        LogStage::Fetch
    }

    fn run(&self, ctx: &mut UpdateContext<'_>, next: Next<'_>) -> Result<(), PipelineError> {
        ctx.emit(progress::UPDATE_CHECK_STARTED, Phase::Check);
        let config = &ctx.config.fetch;
        let metadata = with_retry(config, &ctx.cancel, &ctx.log, "version metadata", || {
            ctx.source.fetch_metadata()
        })
        .map_err(|e| e.into_pipeline(PipelineError::Metadata))?;

        ctx.pending = pending_updates(&metadata, &ctx.current_version);
        let Some(latest) = ctx.pending.last() else {
            log_event!(
                ctx.log,
                INFO,
                event_names::UPDATE_NOT_NEEDED,
                LogStage::Fetch,
                "already up to date",
                current = ctx.current_version.as_str()
            );
            ctx.emit(progress::UPDATE_NOT_NEEDED, Phase::Check);
            return Ok(());
        };
        ctx.target_version = Some(latest.version.clone());

        log_event!(
            ctx.log,
            INFO,
            event_names::FETCH_STARTED,
            LogStage::Fetch,
            "downloading updates",
            packages = ctx.pending.len(),
            target_version = latest.version.as_str()
        );

        let dest = ctx.downloads_dir();
        let session = ctx.session_id.to_string();
        let fetcher = Fetcher {
            strategy: ctx.strategy,
            source: ctx.source,
            emitter: ctx.emitter(),
            config,
            cancel: &ctx.cancel,
            log: &ctx.log,
            session: &session,
        };

        let workers = config.workers.max(1);
        let results: Vec<Result<Download, PipelineError>> = ctx
            .pending
            .chunks(workers)
            .flat_map(|chunk| {
                thread::scope(|s| {
                    let handles: Vec<_> = chunk
                        .iter()
                        .map(|descriptor| s.spawn(|| fetcher.download(descriptor, &dest)))
                        .collect();
                    handles
                        .into_iter()
                        .map(|h| {
                            h.join().unwrap_or_else(|_| {
                                error!("download thread panicked");
                                Err(PipelineError::Internal("download thread panicked".to_string()))
                            })
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut downloads = Vec::with_capacity(results.len());
        let mut failure = None;
        for result in results {
            match result {
                Ok(download) => downloads.push(download),
                // Keep the first real error over a follow-on cancellation.
                Err(e) => match &failure {
                    Some(PipelineError::Cancelled) | None => failure = Some(e),
                    Some(_) => {}
                },
            }
        }
        if let Some(e) = failure {
            let _ = std::fs::remove_dir_all(&dest);
            return Err(e);
        }

        log_event!(
            ctx.log,
            INFO,
            event_names::FETCH_FINISHED,
            LogStage::Fetch,
            "downloads complete",
            packages = downloads.len()
        );
        ctx.downloads = downloads;
        next.run(ctx)
    }
}
