use crate::error::StoreError;
use crate::store::StatusStore;
use crate::{Cell, CellValue, Image, ImageStatus, NewCell};
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Executor, Postgres, QueryBuilder};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};
use uuid::Uuid;

/// Rows per bulk cell insert; keeps each statement well under the bind limit.
const CELL_INSERT_CHUNK: usize = 1000;

#[derive(Clone)]
pub struct DbHandle {
    pool: Arc<PgPool>,
}

impl DbHandle {
    #[instrument(name = "db.new", skip(url))]
    pub async fn new(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;

        (&pool).execute(include_str!("setup.sql")).await?;

        Ok(DbHandle {
            pool: Arc::new(pool),
        })
    }
}

#[async_trait]
impl StatusStore for DbHandle {
    #[instrument(name = "db.select_eligible", skip_all, fields(status = %status, limit = limit))]
    async fn select_eligible(
        &self,
        status: ImageStatus,
        limit: i64,
        min_dwell: Option<Duration>,
    ) -> Result<Vec<Uuid>, StoreError> {
        debug!("Getting up to {} images", limit);
        let ids = sqlx::query_scalar::<_, Uuid>(
            "SELECT id \
            FROM image \
            WHERE status IS NOT DISTINCT FROM $1 \
            AND ($2::double precision IS NULL \
                OR updated_at < NOW() - make_interval(secs => $2::double precision)) \
            ORDER BY created_at ASC \
            LIMIT $3",
        )
        .bind(status.code())
        .bind(min_dwell.map(|d| d.as_secs_f64()))
        .bind(limit)
        .fetch_all(&*self.pool)
        .await?;

        Ok(ids)
    }

    #[instrument(name = "db.set_status", skip_all, fields(image_id = %id, status = %status))]
    async fn set_status(&self, id: Uuid, status: ImageStatus) -> Result<(), StoreError> {
        sqlx::query("UPDATE image SET status = $1, updated_at = NOW() WHERE id = $2")
            .bind(status.code())
            .bind(id)
            .execute(&*self.pool)
            .await?;

        Ok(())
    }

    #[instrument(name = "db.set_statuses", skip_all, fields(count = ids.len(), status = %status))]
    async fn set_statuses(&self, ids: &[Uuid], status: ImageStatus) -> Result<u64, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }

        let result = sqlx::query("UPDATE image SET status = $1, updated_at = NOW() WHERE id = ANY($2)")
            .bind(status.code())
            .bind(ids)
            .execute(&*self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    #[instrument(name = "db.replace_cells", skip_all, fields(image_id = %image_id, count = cells.len()))]
    async fn replace_cells(
        &self,
        image_id: Uuid,
        cells: &[NewCell],
        rotation: i32,
        status: ImageStatus,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM cell WHERE image_id = $1")
            .bind(image_id)
            .execute(&mut *tx)
            .await?;

        for chunk in cells.chunks(CELL_INSERT_CHUNK) {
            let mut builder = QueryBuilder::<Postgres>::new(
                "INSERT INTO cell \
                (image_id, rect_id, data_type, opts, tl_x, tl_y, tr_x, tr_y, bl_x, bl_y, br_x, br_y) ",
            );
            builder.push_values(chunk, |mut row, cell| {
                row.push_bind(image_id)
                    .push_bind(cell.rect_id)
                    .push_bind(&cell.data_type)
                    .push_bind(&cell.opts)
                    .push_bind(cell.quad.tl_x)
                    .push_bind(cell.quad.tl_y)
                    .push_bind(cell.quad.tr_x)
                    .push_bind(cell.quad.tr_y)
                    .push_bind(cell.quad.bl_x)
                    .push_bind(cell.quad.bl_y)
                    .push_bind(cell.quad.br_x)
                    .push_bind(cell.quad.br_y);
            });
            builder.build().execute(&mut *tx).await?;
        }

        let result = sqlx::query(
            "UPDATE image \
                SET rotation = $1, \
                table_template_id = NULL, \
                status = $2, \
                updated_at = NOW() \
            WHERE id = $3",
        )
        .bind(rotation)
        .bind(status.code())
        .bind(image_id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::ImageNotFound(image_id));
        }

        tx.commit().await?;
        Ok(())
    }

    #[instrument(name = "db.cells_for_image", skip_all, fields(image_id = %image_id))]
    async fn cells_for_image(
        &self,
        image_id: Uuid,
        data_types: &[String],
    ) -> Result<Vec<Cell>, StoreError> {
        let cells = sqlx::query_as::<_, Cell>(
            "SELECT image_id, rect_id, data_type, opts, \
                COALESCE(tl_x, 0) AS tl_x, COALESCE(tl_y, 0) AS tl_y, \
                COALESCE(tr_x, 0) AS tr_x, COALESCE(tr_y, 0) AS tr_y, \
                COALESCE(br_x, 0) AS br_x, COALESCE(br_y, 0) AS br_y, \
                COALESCE(bl_x, 0) AS bl_x, COALESCE(bl_y, 0) AS bl_y, \
                value, confidence \
            FROM cell \
            WHERE image_id = $1 \
            AND (cardinality($2::text[]) = 0 OR data_type = ANY($2::text[])) \
            ORDER BY rect_id ASC",
        )
        .bind(image_id)
        .bind(data_types)
        .fetch_all(&*self.pool)
        .await?;

        Ok(cells)
    }

    #[instrument(name = "db.update_cell_values", skip_all, fields(image_id = %image_id, count = values.len()))]
    async fn update_cell_values(
        &self,
        image_id: Uuid,
        values: &[CellValue],
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        for value in values {
            sqlx::query(
                "UPDATE cell \
                    SET value = $1, \
                    confidence = $2, \
                    updated_at = NOW() \
                WHERE image_id = $3 AND rect_id = $4",
            )
            .bind(&value.value)
            .bind(value.confidence)
            .bind(image_id)
            .bind(value.rect_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    #[instrument(name = "db.image", skip_all, fields(image_id = %id))]
    async fn image(&self, id: Uuid) -> Result<Option<Image>, StoreError> {
        Ok(sqlx::query_as::<_, Image>(
            "SELECT id, status, rotation, table_template_id, created_at, updated_at \
            FROM image \
            WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&*self.pool)
        .await?)
    }
}
