use super::{result_file, Disposition, Stage, StageContext};
use crate::blob::{find_raw_key, processed_key};
use crate::config::StageSettings;
use crate::error::StageError;
use crate::StageJob;
use async_trait::async_trait;
use tracing::debug;
use uuid::Uuid;

/// Validates and normalizes a fresh upload into the canonical processed image.
pub struct Initiation;

#[async_trait]
impl Stage for Initiation {
    async fn input_key(&self, ctx: &StageContext, image_id: Uuid) -> Result<String, StageError> {
        find_raw_key(ctx.blobs.as_ref(), image_id)
            .await
            .ok_or_else(|| StageError::MissingBlob {
                key: format!("{image_id}/{image_id}.{{jpg,jpeg,png}}"),
            })
    }

    async fn process(
        &self,
        ctx: &StageContext,
        settings: &StageSettings,
        job: &StageJob,
    ) -> Result<Disposition, StageError> {
        let output = ctx
            .runner
            .run(&settings.script, &[job.local_path.clone()])
            .await?;
        let normalized = result_file(&output).await?;
        debug!(raw = %job.remote_key, path = %normalized.display(), "Image initiated");

        ctx.scratch
            .publish(ctx.blobs.as_ref(), &normalized, &processed_key(job.image_id))
            .await?;

        Ok(Disposition::Completed)
    }
}
