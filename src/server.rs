use crate::blob::{BlobStore, LocalBlobStore};
use crate::config::PipelineConfig;
use crate::db::DbHandle;
use crate::scheduler::StageScheduler;
use crate::scratch::Scratch;
use crate::stages::{StageContext, StageKind};
use crate::store::StatusStore;
use crate::subprocess::{ProcessRunner, ScriptRunner};
use crate::worker::StageWorker;
use anyhow::Error;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::*;

/// Owns one scheduler per enabled stage.
pub struct Supervisor {
    workers: Vec<StageWorker>,
}

impl Supervisor {
    pub fn new(
        config: &PipelineConfig,
        store: Arc<dyn StatusStore>,
        blobs: Arc<dyn BlobStore>,
        runner: Arc<dyn ProcessRunner>,
    ) -> Self {
        let ctx = StageContext {
            store,
            blobs,
            runner,
            scratch: Scratch::new(&config.scratch_dir),
        };

        for kind in StageKind::ALL {
            if config.stage(kind).is_none() {
                info!("{} has no script configured, stage disabled", kind.name());
            }
        }

        let workers = config
            .stages
            .iter()
            .map(|settings| StageWorker::new(settings.clone(), settings.kind.build(), ctx.clone()))
            .collect();
        Self { workers }
    }

    pub fn workers(&self) -> &[StageWorker] {
        &self.workers
    }

    /// Spawns every stage scheduler. The handles finish once `cancel` fires
    /// and each stage's running cycle has returned.
    pub fn start(self, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
        self.workers
            .into_iter()
            .map(|worker| {
                let cancel = cancel.clone();
                tokio::spawn(
                    StageScheduler::new(worker)
                        .run(cancel)
                        .in_current_span(),
                )
            })
            .collect()
    }
}

pub async fn serve(
    cancel_token: CancellationToken,
    config: PipelineConfig,
    connect_url: String,
    max_connections: u32,
) -> Result<(), Error> {
    trace!("Connecting to db:{}", connect_url);
    let handle = DbHandle::new(&connect_url, max_connections).await?;

    let runner = ScriptRunner::new(&config.interpreter).with_timeout(config.process_timeout);
    let supervisor = Supervisor::new(
        &config,
        Arc::new(handle),
        Arc::new(LocalBlobStore::new(&config.storage_dir)),
        Arc::new(runner),
    );
    info!(
        stages = supervisor.workers().len(),
        storage = %config.storage_dir.display(),
        scratch = %config.scratch_dir.display(),
        "Starting pipeline"
    );

    let schedulers = supervisor.start(&cancel_token);

    // Wait for all stages to wind down
    futures::future::join_all(schedulers)
        .await
        .into_iter()
        .collect::<Result<Vec<_>, _>>()?;

    info!("Server stopped.");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StageSettings;
    use crate::testing::{output, FakeRunner, Harness};
    use std::path::PathBuf;
    use std::time::Duration;

    #[tokio::test]
    async fn runs_one_scheduler_per_enabled_stage_until_cancelled() {
        let h = Harness::new();
        let mut config = PipelineConfig::new("unused");
        config.scratch_dir = h.scratch.root().to_path_buf();
        config.stages = vec![
            StageSettings::new(StageKind::Initiation, "init.py"),
            StageSettings::new(StageKind::Contour, "contour.py"),
        ];
        let runner = Arc::new(FakeRunner::new(|args: &[PathBuf]| Ok(output(&args[0]))));

        let supervisor = Supervisor::new(&config, h.store.clone(), h.blobs.clone(), runner);
        let names: Vec<_> = supervisor.workers().iter().map(|w| w.name().to_string()).collect();
        assert_eq!(names, ["initiation", "contour"]);

        let cancel = CancellationToken::new();
        let handles = supervisor.start(&cancel);
        assert_eq!(handles.len(), 2);

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), futures::future::join_all(handles))
            .await
            .unwrap();
    }
}
