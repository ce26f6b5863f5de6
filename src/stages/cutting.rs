use super::{result_file, write_manifest, Disposition, Stage, StageContext};
use crate::blob::cell_key;
use crate::config::StageSettings;
use crate::error::StageError;
use crate::scratch::read_json;
use crate::StageJob;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::PathBuf;
use tracing::debug;

/// Crops every cell out of the canonical image into its own blob.
pub struct Cutting;

#[derive(Debug, Deserialize)]
struct CropsResult {
    crops: Vec<Crop>,
}

#[derive(Debug, Deserialize)]
struct Crop {
    rect_id: i32,
    path: PathBuf,
}

#[async_trait]
impl Stage for Cutting {
    async fn process(
        &self,
        ctx: &StageContext,
        settings: &StageSettings,
        job: &StageJob,
    ) -> Result<Disposition, StageError> {
        let cells = ctx.store.cells_for_image(job.image_id, &[]).await?;
        if cells.is_empty() {
            debug!("No cells to cut");
            return Ok(Disposition::Completed);
        }

        let manifest = write_manifest(&ctx.scratch, settings, job.image_id, &cells).await?;
        let outpath = ctx.scratch.artifact(job.image_id, &settings.name, "out.json");
        let output = ctx
            .runner
            .run(&settings.script, &[job.local_path.clone(), outpath, manifest])
            .await?;

        let result: CropsResult = read_json(&result_file(&output).await?).await?;
        if result.crops.is_empty() {
            return Err(StageError::invalid("no crops produced"));
        }

        let known: HashSet<i32> = cells.iter().map(|cell| cell.rect_id).collect();
        for crop in &result.crops {
            if !known.contains(&crop.rect_id) {
                return Err(StageError::invalid(format!("unknown rect_id {}", crop.rect_id)));
            }
            let data = tokio::fs::read(&crop.path)
                .await
                .map_err(|e| StageError::io(&crop.path, e))?;
            ctx.blobs
                .put(&data, &cell_key(job.image_id, crop.rect_id))
                .await?;
        }

        debug!(crops = result.crops.len(), "Uploaded cell crops");
        Ok(Disposition::Completed)
    }
}
