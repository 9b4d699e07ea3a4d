//! Verify, Backup, Apply and Launch stages.

use super::context::UpdateContext;
use super::plan::{FilePlan, StagedPackage, VERSION_MARKER};
use super::{Next, PipelineError, Stage};
use crate::archive;
use crate::events::{event_names as progress, Phase, ProgressEvent};
use crate::log_event;
use crate::logging::{event_names, Stage as LogStage};
use crate::platform::{LaunchOutcome, LaunchRequest};
use std::fs;

/// Checks every digest, then unpacks the packages into staging.
///
/// Nothing outside the staging area has been touched when this fails.
pub struct VerifyStage;

impl Stage for VerifyStage {
    fn name(&self) -> LogStage {
        LogStage::Verify
    }

    fn run(&self, ctx: &mut UpdateContext<'_>, next: Next<'_>) -> Result<(), PipelineError> {
        for download in &ctx.downloads {
            let matches = ctx
                .strategy
                .verify(&download.path, &download.descriptor.digest)
                .map_err(|e| PipelineError::io(&download.path, e))?;
            if !matches {
                let actual = crate::digest::compute_digest(&download.path)
                    .unwrap_or_else(|_| "unreadable".to_string());
                log_event!(
                    ctx.log,
                    ERROR,
                    event_names::VERIFY_MISMATCH,
                    LogStage::Verify,
                    "digest mismatch",
                    package = download.descriptor.file_name().as_str(),
                    expected = download.descriptor.digest.as_str(),
                    actual = actual.as_str()
                );
                return Err(PipelineError::DigestMismatch {
                    package: download.descriptor.file_name(),
                    expected: download.descriptor.digest.clone(),
                    actual,
                });
            }
        }

        let mut staged = Vec::with_capacity(ctx.downloads.len());
        for download in &ctx.downloads {
            let root = ctx.unpack_dir(&download.descriptor.version);
            archive::decompress(&download.path, &root).map_err(|source| PipelineError::Archive {
                package: download.descriptor.file_name(),
                source,
            })?;
            staged.push(StagedPackage {
                descriptor: download.descriptor.clone(),
                root,
            });
        }
        ctx.staged = staged;

        log_event!(
            ctx.log,
            INFO,
            event_names::VERIFY_FINISHED,
            LogStage::Verify,
            "packages verified",
            packages = ctx.staged.len()
        );
        ctx.emit(progress::VERIFY_COMPLETED, Phase::Verify);
        next.run(ctx)
    }
}

/// Copies every live file the update will touch, then commits that batch.
pub struct BackupStage;

impl Stage for BackupStage {
    fn name(&self) -> LogStage {
        LogStage::Backup
    }

    fn run(&self, ctx: &mut UpdateContext<'_>, next: Next<'_>) -> Result<(), PipelineError> {
        let marker = ctx.staging.join(VERSION_MARKER);
        if let Some(version) = &ctx.target_version {
            fs::create_dir_all(&ctx.staging).map_err(|e| PipelineError::io(&ctx.staging, e))?;
            fs::write(&marker, version).map_err(|e| PipelineError::io(&marker, e))?;
        }
        let drivers = ctx
            .config
            .drivers
            .enabled
            .then(|| (ctx.strategy.drivers(), ctx.config.drivers.directory.as_str()));
        let mut plan = FilePlan::build(
            &ctx.staged,
            marker.exists().then_some(marker.as_path()),
            drivers,
            &ctx.config.files,
        )
        .map_err(|e| PipelineError::io(&ctx.staging, e))?;

        let files = plan.backup_targets(&ctx.install_dir, &ctx.backup_root);
        let driver_backups = if ctx.config.drivers.enabled {
            plan.driver_backups(ctx.strategy.drivers(), &ctx.backup_root)
        } else {
            Vec::new()
        };
        let mut batch = ctx.strategy.backup(&ctx.session_id, &files, &driver_backups);
        ctx.plan = Some(plan);

        if !batch.is_empty() {
            let id = ctx.journal.push(&mut batch)?;
            ctx.batches.push(batch);
            let batch = ctx.batches.last_mut().ok_or_else(|| {
                PipelineError::Internal("backup batch vanished".to_string())
            })?;
            ctx.strategy
                .apply(batch, &ctx.cancel)
                .map_err(|source| PipelineError::Execute {
                    stage: "backup".to_string(),
                    source,
                })?;
            log_event!(
                ctx.log,
                INFO,
                event_names::BACKUP_COMMITTED,
                LogStage::Backup,
                "live files backed up",
                batch = tracing::field::display(id),
                files = files.len(),
                drivers = driver_backups.len()
            );
        }
        ctx.emit_event(
            ProgressEvent::new(progress::BACKUP_COMMITTED, Phase::Backup).with_detail("files", files.len()),
        );
        next.run(ctx)
    }
}

/// Replaces, deletes and registers artifacts in one committed batch.
pub struct ApplyStage;

impl Stage for ApplyStage {
    fn name(&self) -> LogStage {
        LogStage::Apply
    }

    fn run(&self, ctx: &mut UpdateContext<'_>, next: Next<'_>) -> Result<(), PipelineError> {
        let Some(plan) = ctx.plan.as_ref() else {
            return Err(PipelineError::Internal("apply without a plan".to_string()));
        };
        let mut batch = plan.apply_batch(&ctx.session_id, &ctx.install_dir, &ctx.backup_root);
        if batch.is_empty() {
            return next.run(ctx);
        }

        let id = ctx.journal.push(&mut batch)?;
        let operations = batch.len();
        ctx.batches.push(batch);
        ctx.emit(progress::APPLY_COMMITTED, Phase::Apply);

        let batch = ctx
            .batches
            .last_mut()
            .ok_or_else(|| PipelineError::Internal("apply batch vanished".to_string()))?;
        if let Err(source) = ctx.strategy.apply(batch, &ctx.cancel) {
            log_event!(
                ctx.log,
                WARN,
                event_names::APPLY_FAILED,
                LogStage::Apply,
                "apply failed",
                batch = tracing::field::display(id),
                error = tracing::field::display(&source)
            );
            return Err(PipelineError::Execute {
                stage: "apply".to_string(),
                source,
            });
        }

        log_event!(
            ctx.log,
            INFO,
            event_names::APPLY_COMMITTED,
            LogStage::Apply,
            "update applied",
            batch = tracing::field::display(id),
            operations = operations
        );
        ctx.emit_event(
            ProgressEvent::new(progress::INSTALLATION_COMPLETED, Phase::Apply)
                .with_detail("version", &ctx.target_version),
        );
        next.run(ctx)
    }
}

/// Starts the updated executable; supervision is the watchdog's job.
pub struct LaunchStage;

impl Stage for LaunchStage {
    fn name(&self) -> LogStage {
        LogStage::Launch
    }

    fn run(&self, ctx: &mut UpdateContext<'_>, next: Next<'_>) -> Result<(), PipelineError> {
        if !ctx.launch {
            return next.run(ctx);
        }
        let app = &ctx.config.app;
        let request = LaunchRequest {
            executable: ctx
                .strategy
                .executable_path(&ctx.install_dir, std::path::Path::new(&app.main_executable)),
            args: app.launch_args.clone(),
            working_dir: ctx.install_dir.clone(),
            launch_script: app.launch_script.clone(),
            output_dir: Some(
                ctx.config
                    .diagnostics_dir()
                    .join(ctx.target_id.as_str())
                    .join("output"),
            ),
        };
        log_event!(
            ctx.log,
            INFO,
            event_names::LAUNCH_STARTED,
            LogStage::Launch,
            "launching updated target",
            executable = tracing::field::display(request.executable.display())
        );

        match ctx.strategy.launch(&request) {
            Ok(LaunchOutcome::Started(handle)) => {
                ctx.emit_event(
                    ProgressEvent::new(progress::LAUNCH_COMPLETED, Phase::Launch).with_detail("pid", handle.pid),
                );
                ctx.launched = Some(handle);
            }
            Ok(LaunchOutcome::Deferred) => {
                ctx.emit_event(
                    ProgressEvent::new(progress::LAUNCH_COMPLETED, Phase::Launch).with_detail("deferred", true),
                );
            }
            Err(e) => {
                log_event!(
                    ctx.log,
                    ERROR,
                    event_names::LAUNCH_FAILED,
                    LogStage::Launch,
                    "launch failed",
                    error = tracing::field::display(&e)
                );
                return Err(PipelineError::Launch(e));
            }
        }
        next.run(ctx)
    }
}
