use super::{result_file, write_manifest, Disposition, Stage, StageContext};
use crate::config::StageSettings;
use crate::error::StageError;
use crate::scratch::read_json;
use crate::{CellValue, StageJob};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashSet;
use tracing::debug;

/// Hands the cells of the selected data types to a script and stores the values it reads.
pub struct Decoding {
    data_types: Vec<String>,
}

impl Decoding {
    pub fn new<I, S>(data_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            data_types: data_types.into_iter().map(Into::into).collect(),
        }
    }

    /// Every cell regardless of type.
    pub fn all() -> Self {
        Self {
            data_types: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ValuesResult {
    cells: Vec<RawValue>,
}

#[derive(Debug, Deserialize)]
struct RawValue {
    rect_id: i32,
    #[serde(default)]
    value: Value,
    #[serde(default)]
    confidence: Option<f64>,
}

impl From<RawValue> for CellValue {
    fn from(raw: RawValue) -> Self {
        let value = match raw.value {
            Value::Null => None,
            Value::String(s) => Some(s),
            other => Some(other.to_string()),
        };
        CellValue {
            rect_id: raw.rect_id,
            value,
            confidence: raw.confidence,
        }
    }
}

#[async_trait]
impl Stage for Decoding {
    async fn process(
        &self,
        ctx: &StageContext,
        settings: &StageSettings,
        job: &StageJob,
    ) -> Result<Disposition, StageError> {
        let cells = ctx
            .store
            .cells_for_image(job.image_id, &self.data_types)
            .await?;
        if cells.is_empty() {
            debug!(data_types = ?self.data_types, "No cells to decode");
            return Ok(Disposition::Completed);
        }

        let manifest = write_manifest(&ctx.scratch, settings, job.image_id, &cells).await?;
        let outpath = ctx.scratch.artifact(job.image_id, &settings.name, "out.json");
        let output = ctx
            .runner
            .run(&settings.script, &[job.local_path.clone(), outpath, manifest])
            .await?;

        let result: ValuesResult = read_json(&result_file(&output).await?).await?;
        if result.cells.is_empty() {
            return Err(StageError::invalid("no values produced"));
        }

        let known: HashSet<i32> = cells.iter().map(|cell| cell.rect_id).collect();
        let values: Vec<CellValue> = result.cells.into_iter().map(CellValue::from).collect();
        if let Some(unknown) = values.iter().find(|v| !known.contains(&v.rect_id)) {
            return Err(StageError::invalid(format!(
                "value for unknown rect_id {}",
                unknown.rect_id
            )));
        }

        ctx.store.update_cell_values(job.image_id, &values).await?;
        debug!(values = values.len(), "Stored decoded values");
        Ok(Disposition::Completed)
    }
}
