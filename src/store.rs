//! The access patterns stage workers need from the relational store.

use crate::error::StoreError;
use crate::{Cell, CellValue, Image, ImageStatus, NewCell};
use async_trait::async_trait;
use std::time::Duration;
use uuid::Uuid;

#[async_trait]
pub trait StatusStore: Send + Sync {
    /// Up to `limit` image ids in `status`, oldest first. With `min_dwell`, only
    /// images whose last update is at least that old are returned.
    async fn select_eligible(
        &self,
        status: ImageStatus,
        limit: i64,
        min_dwell: Option<Duration>,
    ) -> Result<Vec<Uuid>, StoreError>;

    async fn set_status(&self, id: Uuid, status: ImageStatus) -> Result<(), StoreError>;

    /// Returns the number of rows changed.
    async fn set_statuses(&self, ids: &[Uuid], status: ImageStatus) -> Result<u64, StoreError>;

    /// Replaces every cell of the image, then writes rotation, clears the table
    /// template and sets `status`, all in one transaction.
    async fn replace_cells(
        &self,
        image_id: Uuid,
        cells: &[NewCell],
        rotation: i32,
        status: ImageStatus,
    ) -> Result<(), StoreError>;

    /// Cells ordered by `rect_id`. An empty `data_types` selects all cells.
    async fn cells_for_image(
        &self,
        image_id: Uuid,
        data_types: &[String],
    ) -> Result<Vec<Cell>, StoreError>;

    async fn update_cell_values(
        &self,
        image_id: Uuid,
        values: &[CellValue],
    ) -> Result<(), StoreError>;

    async fn image(&self, id: Uuid) -> Result<Option<Image>, StoreError>;
}
