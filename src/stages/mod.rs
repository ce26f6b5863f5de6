//! Per-stage behaviour plugged into the generic [`StageWorker`](crate::worker::StageWorker).
//!
//! | stage           | consumes | produces | result token                      |
//! |-----------------|----------|----------|-----------------------------------|
//! | initiation      | null     | 7        | normalized image path             |
//! | contour         | 7        | 6        | contour JSON path                 |
//! | sharding        | 6        | 5        | rectified image path              |
//! | cutting         | 5        | 4        | crops JSON path                   |
//! | decoding-bubble | 4        | 3        | values JSON path                  |
//! | decoding-number | 3        | 2        | values JSON path                  |
//! | annotation      | 2        | 1        | values JSON path                  |

use crate::blob::{processed_key, BlobStore};
use crate::config::{MissingBlobPolicy, StageSettings};
use crate::error::StageError;
use crate::scratch::{write_json, Scratch};
use crate::store::StatusStore;
use crate::subprocess::{ProcessOutput, ProcessRunner};
use crate::{Cell, ImageStatus, StageJob};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

mod contour;
mod cutting;
mod decoding;
mod initiation;
mod render;

pub use contour::{parse_contour, Contour, ContourResult};
pub use cutting::Cutting;
pub use decoding::Decoding;
pub use initiation::Initiation;
pub use render::Render;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    Initiation,
    Contour,
    Sharding,
    Cutting,
    DecodingBubble,
    DecodingNumber,
    Annotation,
}

impl StageKind {
    pub const ALL: [StageKind; 7] = [
        StageKind::Initiation,
        StageKind::Contour,
        StageKind::Sharding,
        StageKind::Cutting,
        StageKind::DecodingBubble,
        StageKind::DecodingNumber,
        StageKind::Annotation,
    ];

    pub fn name(self) -> &'static str {
        match self {
            StageKind::Initiation => "initiation",
            StageKind::Contour => "contour",
            StageKind::Sharding => "sharding",
            StageKind::Cutting => "cutting",
            StageKind::DecodingBubble => "decoding-bubble",
            StageKind::DecodingNumber => "decoding-number",
            StageKind::Annotation => "annotation",
        }
    }

    pub fn status_on_start(self) -> ImageStatus {
        match self {
            StageKind::Initiation => ImageStatus::Uploading,
            StageKind::Contour => ImageStatus::Contour,
            StageKind::Sharding => ImageStatus::Sharding,
            StageKind::Cutting => ImageStatus::Cutting,
            StageKind::DecodingBubble => ImageStatus::DecodingBubble,
            StageKind::DecodingNumber => ImageStatus::DecodingNumber,
            StageKind::Annotation => ImageStatus::Annotation,
        }
    }

    pub fn status_on_done(self) -> ImageStatus {
        match self {
            StageKind::Initiation => ImageStatus::Contour,
            StageKind::Contour => ImageStatus::Sharding,
            StageKind::Sharding => ImageStatus::Cutting,
            StageKind::Cutting => ImageStatus::DecodingBubble,
            StageKind::DecodingBubble => ImageStatus::DecodingNumber,
            StageKind::DecodingNumber => ImageStatus::Annotation,
            StageKind::Annotation => ImageStatus::Done,
        }
    }

    /// A raw upload that is not there yet may still be arriving; anything later is gone.
    pub fn missing_blob_policy(self) -> MissingBlobPolicy {
        match self {
            StageKind::Initiation => MissingBlobPolicy::Skip,
            _ => MissingBlobPolicy::Fail,
        }
    }

    pub fn build(self) -> Arc<dyn Stage> {
        match self {
            StageKind::Initiation => Arc::new(Initiation),
            StageKind::Contour => Arc::new(Contour),
            StageKind::Sharding => Arc::new(Render),
            StageKind::Cutting => Arc::new(Cutting),
            StageKind::DecodingBubble => Arc::new(Decoding::new(["bubble"])),
            StageKind::DecodingNumber => Arc::new(Decoding::new(["integer", "float"])),
            StageKind::Annotation => Arc::new(Decoding::all()),
        }
    }
}

/// How a successful image leaves the stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Moved to `status_on_done` by the bulk update at the end of the cycle.
    Completed,
    /// The stage already wrote `status_on_done` itself.
    Advanced,
}

/// Dependencies shared by every stage of a pipeline.
#[derive(Clone)]
pub struct StageContext {
    pub store: Arc<dyn StatusStore>,
    pub blobs: Arc<dyn BlobStore>,
    pub runner: Arc<dyn ProcessRunner>,
    pub scratch: Scratch,
}

#[async_trait]
pub trait Stage: Send + Sync {
    /// Blob key of the stage's input image.
    async fn input_key(&self, _ctx: &StageContext, image_id: Uuid) -> Result<String, StageError> {
        Ok(processed_key(image_id))
    }

    async fn process(
        &self,
        ctx: &StageContext,
        settings: &StageSettings,
        job: &StageJob,
    ) -> Result<Disposition, StageError>;
}

/// The result token read as a path to a file that must exist.
pub(crate) async fn result_file(output: &ProcessOutput) -> Result<PathBuf, StageError> {
    let token = output
        .result
        .as_deref()
        .ok_or_else(|| StageError::invalid("subprocess printed no result"))?;
    let path = PathBuf::from(token);
    if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
        return Err(StageError::invalid(format!(
            "result file '{}' does not exist",
            path.display()
        )));
    }
    Ok(path)
}

/// Writes the cells a script should look at next to the image and returns the path.
pub(crate) async fn write_manifest(
    scratch: &Scratch,
    settings: &StageSettings,
    image_id: Uuid,
    cells: &[Cell],
) -> Result<PathBuf, StageError> {
    let path = scratch.artifact(image_id, &settings.name, "cells.json");
    write_json(&path, &serde_json::json!({ "image_id": image_id, "cells": cells })).await?;
    Ok(path)
}
