use super::{result_file, Disposition, Stage, StageContext};
use crate::config::StageSettings;
use crate::error::StageError;
use crate::scratch::read_json;
use crate::{NewCell, Quad, StageJob};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashSet;
use tracing::info;

/// Detects the table grid of an image and replaces its cells.
pub struct Contour;

/// A validated contour script result.
#[derive(Debug, Clone, PartialEq)]
pub struct ContourResult {
    pub table_template_id: i64,
    pub rotation: i32,
    pub cells: Vec<NewCell>,
}

#[async_trait]
impl Stage for Contour {
    async fn process(
        &self,
        ctx: &StageContext,
        settings: &StageSettings,
        job: &StageJob,
    ) -> Result<Disposition, StageError> {
        let outpath = ctx.scratch.artifact(job.image_id, &settings.name, "out.json");
        let output = ctx
            .runner
            .run(&settings.script, &[job.local_path.clone(), outpath])
            .await?;

        let result_path = result_file(&output).await?;
        let raw: Value = read_json(&result_path).await?;
        let result = parse_contour(&raw)?;

        // Status moves together with the cells so a later stage never sees a partial set.
        ctx.store
            .replace_cells(
                job.image_id,
                &result.cells,
                result.rotation,
                settings.status_on_done,
            )
            .await?;

        info!(
            table_template_id = result.table_template_id,
            cells = result.cells.len(),
            rotation = result.rotation,
            "Extracted tables"
        );
        Ok(Disposition::Advanced)
    }
}

pub fn parse_contour(raw: &Value) -> Result<ContourResult, StageError> {
    let obj = raw
        .as_object()
        .ok_or_else(|| StageError::invalid("contour result is not an object"))?;

    let table_template_id = obj
        .get("table_template_id")
        .and_then(Value::as_f64)
        .ok_or_else(|| StageError::invalid("table_template_id is not a number"))?;
    let table_template_id = Some(table_template_id.trunc())
        .filter(|id| id.abs() < i64::MAX as f64)
        .map(|id| id as i64)
        .ok_or_else(|| StageError::invalid(format!("table_template_id {table_template_id} is out of range")))?;

    let rectangles = obj
        .get("rectangles")
        .and_then(Value::as_array)
        .filter(|rects| !rects.is_empty())
        .ok_or_else(|| StageError::invalid("rectangles is missing or empty"))?;

    let rotation = match obj.get("rotation").and_then(Value::as_f64) {
        Some(r) => to_i32(r).ok_or_else(|| StageError::invalid(format!("rotation {r} is out of range")))?,
        None => 0,
    };

    let mut seen = HashSet::new();
    let mut cells = Vec::with_capacity(rectangles.len());
    for (index, rect) in rectangles.iter().enumerate() {
        let rect = rect
            .as_object()
            .ok_or_else(|| StageError::invalid(format!("rectangle {index} is not an object")))?;
        let cell = parse_rectangle(rect)
            .map_err(|msg| StageError::invalid(format!("rectangle {index}: {msg}")))?;
        if !seen.insert(cell.rect_id) {
            return Err(StageError::invalid(format!(
                "duplicate rect_id {}",
                cell.rect_id
            )));
        }
        cells.push(cell);
    }

    Ok(ContourResult {
        table_template_id,
        rotation,
        cells,
    })
}

fn parse_rectangle(rect: &Map<String, Value>) -> Result<NewCell, String> {
    let int = |name: &str| int_field(rect, name);

    let data_type = match rect.get("data_type") {
        Some(Value::String(s)) => s.clone(),
        None | Some(Value::Null) => String::new(),
        Some(other) => other.to_string(),
    };
    let opts = match rect.get("opts") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(other) => Some(other.to_string()),
    };

    Ok(NewCell {
        rect_id: int("rect_id")?,
        data_type,
        opts,
        quad: Quad {
            tl_x: int("tl_x")?,
            tl_y: int("tl_y")?,
            tr_x: int("tr_x")?,
            tr_y: int("tr_y")?,
            br_x: int("br_x")?,
            br_y: int("br_y")?,
            bl_x: int("bl_x")?,
            bl_y: int("bl_y")?,
        },
    })
}

/// Numbers and numeric strings are both accepted; fractions are truncated.
fn int_field(rect: &Map<String, Value>, name: &str) -> Result<i32, String> {
    let number = match rect.get(name) {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    let number = number.ok_or_else(|| format!("{name} is missing or not a number"))?;
    to_i32(number).ok_or_else(|| format!("{name} {number} is out of range"))
}

/// Truncates toward zero; `None` for non-finite values and anything outside `i32`.
fn to_i32(n: f64) -> Option<i32> {
    let n = n.trunc();
    (n.is_finite() && n >= f64::from(i32::MIN) && n <= f64::from(i32::MAX)).then(|| n as i32)
}
