use super::{result_file, Disposition, Stage, StageContext};
use crate::blob::processed_key;
use crate::config::StageSettings;
use crate::error::StageError;
use crate::StageJob;
use async_trait::async_trait;

/// Re-renders the canonical image (e.g. rectified to the detected grid) in place.
pub struct Render;

#[async_trait]
impl Stage for Render {
    async fn process(
        &self,
        ctx: &StageContext,
        settings: &StageSettings,
        job: &StageJob,
    ) -> Result<Disposition, StageError> {
        let outpath = ctx.scratch.artifact(job.image_id, &settings.name, "out.jpg");
        let output = ctx
            .runner
            .run(&settings.script, &[job.local_path.clone(), outpath])
            .await?;
        let rendered = result_file(&output).await?;

        ctx.scratch
            .publish(ctx.blobs.as_ref(), &rendered, &processed_key(job.image_id))
            .await?;

        Ok(Disposition::Completed)
    }
}
