use crate::config::StageSettings;
use crate::error::{StageError, StoreError};
use crate::stages::{Disposition, Stage, StageContext};
use crate::{ImageStatus, StageJob};
use async_channel::Receiver;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::*;
use uuid::Uuid;

#[derive(Debug)]
pub enum WorkMessage {
    /// Succeeded; waiting for the bulk status update.
    JobCompleted(Uuid),
    /// Succeeded and already moved to the next status by the stage.
    JobAdvanced(Uuid),
    /// Left untouched for the next cycle.
    JobSkipped(Uuid, String),
    JobFailed(Uuid, String),
}

/// Outcome of one cycle.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub selected: usize,
    pub advanced: Vec<Uuid>,
    pub skipped: Vec<Uuid>,
    pub failed: Vec<Uuid>,
}

/// Runs one stage over batches of eligible images.
#[derive(Clone)]
pub struct StageWorker {
    inner: Arc<WorkerInner>,
}

struct WorkerInner {
    settings: StageSettings,
    stage: Arc<dyn Stage>,
    ctx: StageContext,
}

impl StageWorker {
    pub fn new(settings: StageSettings, stage: Arc<dyn Stage>, ctx: StageContext) -> Self {
        Self {
            inner: Arc::new(WorkerInner {
                settings,
                stage,
                ctx,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.settings.name
    }

    pub fn settings(&self) -> &StageSettings {
        &self.inner.settings
    }

    /// Claims a batch, processes every image in isolation, then moves the images
    /// that succeeded to `status_on_done` in one update.
    ///
    /// Only store failures while selecting the batch or issuing the final update
    /// fail the cycle; per-image problems end up in the report.
    pub async fn run_cycle(&self, cancel: &CancellationToken) -> Result<CycleReport, StoreError> {
        let settings = &self.inner.settings;
        let ctx = &self.inner.ctx;

        let image_ids = ctx
            .store
            .select_eligible(settings.status_on_start, settings.batch_limit, settings.min_dwell)
            .await?;
        if image_ids.is_empty() {
            trace!("No images to process");
            return Ok(CycleReport::default());
        }
        info!("{} is processing {} images", settings.name, image_ids.len());

        let workers_count = settings.concurrency.clamp(1, image_ids.len());
        let (send_to_queue, recv_from_queue) = async_channel::bounded::<Uuid>(workers_count);
        let (send_to_cycle, mut recv_from_worker) = mpsc::unbounded_channel::<WorkMessage>();

        let mut workers = Vec::with_capacity(workers_count);
        for _ in 0..workers_count {
            let inner = Arc::clone(&self.inner);
            let cancel_token = cancel.clone();
            let recv_from_queue = recv_from_queue.clone();
            let send_to_cycle = send_to_cycle.clone();
            workers.push(tokio::spawn(
                async move {
                    start(inner, cancel_token, recv_from_queue, send_to_cycle).await;
                }
                .in_current_span(),
            ));
        }
        drop(send_to_cycle);
        drop(recv_from_queue);

        for image_id in &image_ids {
            if cancel.is_cancelled() || send_to_queue.send(*image_id).await.is_err() {
                break;
            }
        }
        send_to_queue.close();

        let mut report = CycleReport {
            selected: image_ids.len(),
            ..Default::default()
        };
        let mut completed = Vec::new();
        while let Some(msg) = recv_from_worker.recv().await {
            match msg {
                WorkMessage::JobCompleted(image_id) => completed.push(image_id),
                WorkMessage::JobAdvanced(image_id) => report.advanced.push(image_id),
                WorkMessage::JobSkipped(image_id, _) => report.skipped.push(image_id),
                WorkMessage::JobFailed(image_id, _) => report.failed.push(image_id),
            }
        }

        for result in futures::future::join_all(workers).await {
            if let Err(err) = result {
                error!(message = "Stage worker task ended abnormally", error = ?err);
            }
        }

        if !completed.is_empty() {
            let updated = ctx
                .store
                .set_statuses(&completed, settings.status_on_done)
                .await?;
            if updated != completed.len() as u64 {
                warn!(expected = completed.len(), updated, "Bulk status update changed fewer rows than expected");
            }
            if settings.cleanup_on_success {
                for image_id in &completed {
                    ctx.scratch.cleanup(*image_id).await;
                }
            }
            report.advanced.extend(completed);
        }

        info!(
            advanced = report.advanced.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            "{} processed {} images",
            settings.name,
            report.selected
        );
        Ok(report)
    }
}

async fn start(
    inner: Arc<WorkerInner>,
    cancel_token: CancellationToken,
    recv_from_queue: Receiver<Uuid>,
    send_to_cycle: UnboundedSender<WorkMessage>,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel_token.cancelled() => {
                debug!("Worker Cancelled");
                break;
            },
            image_id = recv_from_queue.recv() => {
                let Ok(image_id) = image_id else {
                    break;
                };
                let msg = match AssertUnwindSafe(process(&inner, image_id)).catch_unwind().await {
                    Ok(msg) => msg,
                    Err(panic) => {
                        let err = StageError::Panicked(panic_message(panic.as_ref()));
                        fail(&inner, image_id, &err).await;
                        WorkMessage::JobFailed(image_id, err.to_string())
                    }
                };
                if send_to_cycle.send(msg).is_err() {
                    error!("Cycle stopped listening, dropping worker");
                    break;
                }
            }
        }
    }
}

#[instrument(skip_all, fields(stage = %inner.settings.name, image_id = %image_id))]
async fn process(inner: &WorkerInner, image_id: Uuid) -> WorkMessage {
    match run_stage(inner, image_id).await {
        Ok(Disposition::Completed) => WorkMessage::JobCompleted(image_id),
        Ok(Disposition::Advanced) => {
            if inner.settings.cleanup_on_success {
                inner.ctx.scratch.cleanup(image_id).await;
            }
            WorkMessage::JobAdvanced(image_id)
        }
        Err(err) if err.is_transient(inner.settings.missing_blob) => {
            error!(
                error = %err,
                "{} could not download image with id ({}), will retry later",
                inner.settings.name, image_id
            );
            WorkMessage::JobSkipped(image_id, err.to_string())
        }
        Err(err) => {
            fail(inner, image_id, &err).await;
            WorkMessage::JobFailed(image_id, err.to_string())
        }
    }
}

async fn run_stage(inner: &WorkerInner, image_id: Uuid) -> Result<Disposition, StageError> {
    let ctx = &inner.ctx;
    let remote_key = inner.stage.input_key(ctx, image_id).await?;
    let local_path = ctx.scratch.materialize(ctx.blobs.as_ref(), &remote_key).await?;
    let job = StageJob {
        image_id,
        local_path,
        remote_key,
    };
    inner.stage.process(ctx, &inner.settings, &job).await
}

async fn fail(inner: &WorkerInner, image_id: Uuid, err: &StageError) {
    error!(
        message = "Image failed",
        stage = %inner.settings.name,
        image_id = %image_id,
        error = %err
    );
    if let Err(store_err) = inner.ctx.store.set_status(image_id, ImageStatus::Failed).await {
        error!(
            message = "Could not mark image failed",
            image_id = %image_id,
            error = %store_err
        );
    }
    inner.ctx.scratch.cleanup(image_id).await;
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
