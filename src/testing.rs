//! In-memory collaborators for exercising stage workers without PostgreSQL.

use crate::blob::LocalBlobStore;
use crate::config::StageSettings;
use crate::error::{ProcessError, StoreError};
use crate::scratch::Scratch;
use crate::stages::{StageContext, StageKind};
use crate::store::StatusStore;
use crate::subprocess::{ProcessOutput, ProcessRunner};
use crate::worker::StageWorker;
use crate::{Cell, CellValue, Image, ImageStatus, NewCell};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use uuid::Uuid;

#[derive(Default)]
struct State {
    images: HashMap<Uuid, Image>,
    cells: BTreeMap<(Uuid, i32), Cell>,
    writes: usize,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    unreachable: AtomicBool,
}

impl MemoryStore {
    /// Inserts an image created and last updated `age` ago.
    pub fn insert_image(&self, status: ImageStatus, age: Duration) -> Uuid {
        let id = Uuid::new_v4();
        let mut state = self.state.lock().unwrap();
        // Keep insertion order strictly increasing for FIFO checks.
        let at = Utc::now() - chrono::Duration::from_std(age).unwrap()
            + chrono::Duration::microseconds(state.images.len() as i64);
        state.images.insert(
            id,
            Image {
                id,
                status: status.code(),
                rotation: 0,
                table_template_id: Some(99),
                created_at: at,
                updated_at: at,
            },
        );
        id
    }

    pub fn image_row(&self, id: Uuid) -> Image {
        self.state.lock().unwrap().images[&id].clone()
    }

    pub fn status(&self, id: Uuid) -> Option<ImageStatus> {
        self.image_row(id).pipeline_status()
    }

    pub fn set_updated_at(&self, id: Uuid, at: DateTime<Utc>) {
        self.state.lock().unwrap().images.get_mut(&id).unwrap().updated_at = at;
    }

    /// Moves an image back into `status` as if it had been waiting there for `age`.
    pub fn reset(&self, id: Uuid, status: ImageStatus, age: Duration) {
        let mut state = self.state.lock().unwrap();
        let image = state.images.get_mut(&id).unwrap();
        image.status = status.code();
        image.updated_at = Utc::now() - chrono::Duration::from_std(age).unwrap();
    }

    pub fn cells(&self, id: Uuid) -> Vec<Cell> {
        self.state
            .lock()
            .unwrap()
            .cells
            .values()
            .filter(|cell| cell.image_id == id)
            .cloned()
            .collect()
    }

    pub fn insert_cell(&self, id: Uuid, rect_id: i32, data_type: &str) {
        self.state.lock().unwrap().cells.insert(
            (id, rect_id),
            Cell {
                image_id: id,
                rect_id,
                data_type: data_type.to_string(),
                opts: None,
                quad: Default::default(),
                value: None,
                confidence: None,
            },
        );
    }

    pub fn writes(&self) -> usize {
        self.state.lock().unwrap().writes
    }

    pub fn make_unreachable(&self) {
        self.unreachable.store(true, Ordering::SeqCst);
    }

    fn check_reachable(&self) -> Result<(), StoreError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
        }
        Ok(())
    }
}

#[async_trait]
impl StatusStore for MemoryStore {
    async fn select_eligible(
        &self,
        status: ImageStatus,
        limit: i64,
        min_dwell: Option<Duration>,
    ) -> Result<Vec<Uuid>, StoreError> {
        self.check_reachable()?;
        let state = self.state.lock().unwrap();
        let cutoff = min_dwell.map(|d| Utc::now() - chrono::Duration::from_std(d).unwrap());
        let mut eligible: Vec<&Image> = state
            .images
            .values()
            .filter(|image| image.status == status.code())
            .filter(|image| cutoff.map_or(true, |cutoff| image.updated_at < cutoff))
            .collect();
        eligible.sort_by_key(|image| image.created_at);
        Ok(eligible
            .into_iter()
            .take(limit as usize)
            .map(|image| image.id)
            .collect())
    }

    async fn set_status(&self, id: Uuid, status: ImageStatus) -> Result<(), StoreError> {
        self.check_reachable()?;
        let mut state = self.state.lock().unwrap();
        state.writes += 1;
        if let Some(image) = state.images.get_mut(&id) {
            image.status = status.code();
            image.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn set_statuses(&self, ids: &[Uuid], status: ImageStatus) -> Result<u64, StoreError> {
        self.check_reachable()?;
        if ids.is_empty() {
            return Ok(0);
        }
        let mut state = self.state.lock().unwrap();
        state.writes += 1;
        let mut updated = 0;
        for id in ids {
            if let Some(image) = state.images.get_mut(id) {
                image.status = status.code();
                image.updated_at = Utc::now();
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn replace_cells(
        &self,
        image_id: Uuid,
        cells: &[NewCell],
        rotation: i32,
        status: ImageStatus,
    ) -> Result<(), StoreError> {
        self.check_reachable()?;
        let mut state = self.state.lock().unwrap();
        if !state.images.contains_key(&image_id) {
            return Err(StoreError::ImageNotFound(image_id));
        }
        state.writes += 1;
        state.cells.retain(|(id, _), _| *id != image_id);
        for cell in cells {
            state.cells.insert(
                (image_id, cell.rect_id),
                Cell {
                    image_id,
                    rect_id: cell.rect_id,
                    data_type: cell.data_type.clone(),
                    opts: cell.opts.clone(),
                    quad: cell.quad,
                    value: None,
                    confidence: None,
                },
            );
        }
        let image = state.images.get_mut(&image_id).unwrap();
        image.rotation = rotation;
        image.table_template_id = None;
        image.status = status.code();
        image.updated_at = Utc::now();
        Ok(())
    }

    async fn cells_for_image(
        &self,
        image_id: Uuid,
        data_types: &[String],
    ) -> Result<Vec<Cell>, StoreError> {
        self.check_reachable()?;
        Ok(self
            .cells(image_id)
            .into_iter()
            .filter(|cell| data_types.is_empty() || data_types.contains(&cell.data_type))
            .collect())
    }

    async fn update_cell_values(
        &self,
        image_id: Uuid,
        values: &[CellValue],
    ) -> Result<(), StoreError> {
        self.check_reachable()?;
        let mut state = self.state.lock().unwrap();
        state.writes += 1;
        for value in values {
            if let Some(cell) = state.cells.get_mut(&(image_id, value.rect_id)) {
                cell.value = value.value.clone();
                cell.confidence = value.confidence;
            }
        }
        Ok(())
    }

    async fn image(&self, id: Uuid) -> Result<Option<Image>, StoreError> {
        self.check_reachable()?;
        Ok(self.state.lock().unwrap().images.get(&id).cloned())
    }
}

type Handler = dyn Fn(&[PathBuf]) -> Result<ProcessOutput, ProcessError> + Send + Sync;

/// A [`ProcessRunner`] driven by a closure, recording how it was called.
pub struct FakeRunner {
    handler: Box<Handler>,
    delay: Option<Duration>,
    calls: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl FakeRunner {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&[PathBuf]) -> Result<ProcessOutput, ProcessError> + Send + Sync + 'static,
    {
        Self {
            handler: Box::new(handler),
            delay: None,
            calls: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProcessRunner for FakeRunner {
    async fn run(&self, _script: &Path, args: &[PathBuf]) -> Result<ProcessOutput, ProcessError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let result = (self.handler)(args);
        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// Output whose result token is `token`.
pub fn output(token: impl AsRef<Path>) -> ProcessOutput {
    ProcessOutput {
        result: Some(token.as_ref().display().to_string()),
        ..Default::default()
    }
}

pub fn exit_failure(msg: &str) -> ProcessError {
    ProcessError::Exit {
        code: Some(1),
        stderr: msg.to_string(),
    }
}

/// Old enough to pass the default dwell gate.
pub const AGED: Duration = Duration::from_secs(600);

pub struct Harness {
    _dir: TempDir,
    pub store: Arc<MemoryStore>,
    pub blobs: Arc<LocalBlobStore>,
    pub scratch: Scratch,
}

impl Harness {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let blobs = Arc::new(LocalBlobStore::new(dir.path().join("storage")));
        let scratch = Scratch::new(dir.path().join("tmp"));
        Self {
            _dir: dir,
            store: Arc::new(MemoryStore::default()),
            blobs,
            scratch,
        }
    }

    pub fn ctx(&self, runner: Arc<FakeRunner>) -> StageContext {
        StageContext {
            store: self.store.clone(),
            blobs: self.blobs.clone(),
            runner,
            scratch: self.scratch.clone(),
        }
    }

    pub fn worker(&self, kind: StageKind, runner: Arc<FakeRunner>) -> StageWorker {
        self.worker_with(StageSettings::new(kind, "run.py"), runner)
    }

    pub fn worker_with(&self, settings: StageSettings, runner: Arc<FakeRunner>) -> StageWorker {
        let stage = settings.kind.build();
        StageWorker::new(settings, stage, self.ctx(runner))
    }
}
