//! Copy and move between storages.
//!
//! [`TransferService::transfer`] resolves both ends. Same-storage requests use
//! the driver's native copy/move when it offers one; everything else becomes a
//! [`FileTransferTask`] handed to an external [`TaskManager`]. The manager owns
//! scheduling and retries and drives the task through the [`Task`] hooks.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::config::StreamEnv;
use crate::coordinator::{Payload, TransferCoordinator};
use crate::core::{Context, FsError, Result};
use crate::driver::{CacheInvalidator, Driver, StorageManager, join_path, parent_path};
use crate::model::{LinkArgs, Obj};
use crate::stream::{FileStream, FileStreamer, SeekableStream};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Copy,
    Move,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskKind::Copy => f.write_str("copy"),
            TaskKind::Move => f.write_str("move"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

/// Hooks a task runner drives. Scheduling, persistence and the retry loop
/// belong to the runner.
pub trait Task: Send {
    fn id(&self) -> &str;
    fn name(&self) -> String;
    fn run(&mut self) -> Result<()>;
    fn on_succeeded(&mut self);
    fn on_failed(&mut self);
    /// Called before every attempt; `retry` is 0 on the first one.
    fn set_retry(&mut self, retry: usize, max_retry: usize);
}

/// Queue accepting transfer tasks, one per kind.
pub trait TaskManager: Send + Sync {
    fn add(&self, task: FileTransferTask);
}

/// Everything a transfer needs besides its own paths.
pub struct TransferService {
    env: Arc<StreamEnv>,
    storages: Arc<StorageManager>,
    coordinator: Arc<TransferCoordinator>,
    invalidator: Arc<dyn CacheInvalidator>,
    copy_tasks: Arc<dyn TaskManager>,
    move_tasks: Arc<dyn TaskManager>,
}

/// How a transfer request was carried out.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransferOutcome {
    /// Done synchronously by the storage itself.
    Native,
    /// Queued as a task with this id.
    Queued(String),
}

impl TransferService {
    pub fn new(
        env: Arc<StreamEnv>,
        storages: Arc<StorageManager>,
        coordinator: Arc<TransferCoordinator>,
        invalidator: Arc<dyn CacheInvalidator>,
        copy_tasks: Arc<dyn TaskManager>,
        move_tasks: Arc<dyn TaskManager>,
    ) -> Arc<Self> {
        Arc::new(Self {
            env,
            storages,
            coordinator,
            invalidator,
            copy_tasks,
            move_tasks,
        })
    }

    pub fn coordinator(&self) -> &Arc<TransferCoordinator> {
        &self.coordinator
    }

    fn manager(&self, kind: TaskKind) -> &Arc<dyn TaskManager> {
        match kind {
            TaskKind::Copy => &self.copy_tasks,
            TaskKind::Move => &self.move_tasks,
        }
    }

    /// Copies or moves the object at `src_obj_path` into `dst_dir_path`.
    pub fn transfer(
        self: &Arc<Self>,
        ctx: &Context,
        kind: TaskKind,
        src_obj_path: &str,
        dst_dir_path: &str,
    ) -> Result<TransferOutcome> {
        let (src, src_actual) = self
            .storages
            .get_storage_and_actual_path(src_obj_path)
            .map_err(|e| e.with_message("failed get src storage"))?;
        let (dst, dst_actual) = self
            .storages
            .get_storage_and_actual_path(dst_dir_path)
            .map_err(|e| e.with_message("failed get dst storage"))?;

        if src.mount_path() == dst.mount_path()
            && let Some(native) = src.native_transfer()
        {
            let result = match kind {
                TaskKind::Copy => native.copy(ctx, &src_actual, &dst_actual),
                TaskKind::Move => native.move_to(ctx, &src_actual, &dst_actual),
            };
            match result {
                Err(FsError::NotImplement | FsError::NotSupport) => {
                    debug!(%kind, src = src_obj_path, "native transfer unavailable, streaming instead");
                }
                Err(e) => return Err(e),
                Ok(()) => {
                    self.invalidator.clear_cache(dst.as_ref(), &dst_actual);
                    if kind == TaskKind::Move {
                        self.invalidator.clear_cache(src.as_ref(), &parent_path(&src_actual));
                    }
                    return Ok(TransferOutcome::Native);
                }
            }
        }

        let mut task = FileTransferTask::new(
            Arc::clone(self),
            kind,
            src.mount_path(),
            &src_actual,
            dst.mount_path(),
            &dst_actual,
        );
        task.group_id = join_path(dst.mount_path(), &dst_actual);
        let payload = (kind == TaskKind::Move).then(|| Payload::SrcPathToRemove(join_path(src.mount_path(), &src_actual)));
        self.coordinator.add_task(&task.group_id, &task.id, payload);

        let id = task.id.clone();
        info!(task_id = %id, name = %task.name(), "transfer task queued");
        self.manager(kind).add(task);
        Ok(TransferOutcome::Queued(id))
    }
}

/// Persisted form of a task. The batch group is deliberately absent: a task
/// restored after a restart re-registers itself on its first attempt.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferTaskRecord {
    pub id: String,
    pub kind: TaskKind,
    pub src_storage_mp: String,
    pub src_actual_path: String,
    pub dst_storage_mp: String,
    pub dst_actual_path: String,
}

pub struct FileTransferTask {
    id: String,
    kind: TaskKind,
    src_storage_mp: String,
    src_actual_path: String,
    dst_storage_mp: String,
    dst_actual_path: String,
    group_id: String,
    state: TaskState,
    error: Option<String>,
    retry: usize,
    max_retry: usize,
    status: String,
    total_bytes: u64,
    progress: Arc<AtomicU64>,
    ctx: Context,
    service: Arc<TransferService>,
}

impl FileTransferTask {
    fn new(
        service: Arc<TransferService>,
        kind: TaskKind,
        src_storage_mp: &str,
        src_actual_path: &str,
        dst_storage_mp: &str,
        dst_actual_path: &str,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            src_storage_mp: src_storage_mp.to_string(),
            src_actual_path: src_actual_path.to_string(),
            dst_storage_mp: dst_storage_mp.to_string(),
            dst_actual_path: dst_actual_path.to_string(),
            group_id: String::new(),
            state: TaskState::Pending,
            error: None,
            retry: 0,
            max_retry: 0,
            status: String::new(),
            total_bytes: 0,
            progress: Arc::new(AtomicU64::new(0f64.to_bits())),
            ctx: Context::new(),
            service,
        }
    }

    /// Restores a persisted task. It joins its batch again on the first attempt.
    pub fn from_record(record: TransferTaskRecord, service: Arc<TransferService>) -> Self {
        let mut task = Self::new(
            service,
            record.kind,
            &record.src_storage_mp,
            &record.src_actual_path,
            &record.dst_storage_mp,
            &record.dst_actual_path,
        );
        task.id = record.id;
        task
    }

    pub fn to_record(&self) -> TransferTaskRecord {
        TransferTaskRecord {
            id: self.id.clone(),
            kind: self.kind,
            src_storage_mp: self.src_storage_mp.clone(),
            src_actual_path: self.src_actual_path.clone(),
            dst_storage_mp: self.dst_storage_mp.clone(),
            dst_actual_path: self.dst_actual_path.clone(),
        }
    }

    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    /// Lets the runner reflect transitions it owns, such as re-queueing.
    pub fn set_state(&mut self, state: TaskState) {
        self.state = state;
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Clears the recorded error before a manual retry.
    pub fn clear_error(&mut self) {
        self.error = None;
    }

    pub fn status(&self) -> &str {
        &self.status
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn progress(&self) -> f64 {
        f64::from_bits(self.progress.load(Ordering::Relaxed))
    }

    pub fn retry(&self) -> (usize, usize) {
        (self.retry, self.max_retry)
    }

    /// Cancels the running attempt.
    pub fn cancel(&self) {
        self.ctx.cancel();
    }

    fn child(&self, src_actual_path: String, dst_actual_path: String) -> Self {
        let mut task = Self::new(
            Arc::clone(&self.service),
            self.kind,
            &self.src_storage_mp,
            &src_actual_path,
            &self.dst_storage_mp,
            &dst_actual_path,
        );
        task.group_id = self.group_id.clone();
        task
    }

    fn run_inner(&mut self) -> Result<()> {
        let service = Arc::clone(&self.service);
        let src = service
            .storages
            .get_by_mount_path(&self.src_storage_mp)
            .map_err(|e| e.with_message("failed get storage"))?;
        let dst = service
            .storages
            .get_by_mount_path(&self.dst_storage_mp)
            .map_err(|e| e.with_message("failed get storage"))?;

        self.status = "getting src object".into();
        let src_obj = src
            .get(&self.ctx, &self.src_actual_path)
            .map_err(|e| e.with_message(format!("failed get src [{}] file", self.src_actual_path)))?;

        if src_obj.is_dir() {
            return self.fan_out(&service, src.as_ref(), dst.as_ref(), src_obj.as_ref());
        }
        self.put_file(&service, src.as_ref(), dst.as_ref(), src_obj)
    }

    /// Queues one sub-task per child in the same batch. The directory task
    /// completes as soon as its children are queued.
    fn fan_out(
        &mut self,
        service: &TransferService,
        src: &dyn Driver,
        dst: &dyn Driver,
        src_obj: &dyn Obj,
    ) -> Result<()> {
        self.status = "src object is dir, listing objs".into();
        let objs = src
            .list(&self.ctx, &self.src_actual_path)
            .map_err(|e| e.with_message(format!("failed list src [{}] objs", self.src_actual_path)))?;

        let dst_actual_path = join_path(&self.dst_actual_path, src_obj.name());
        dst.make_dir(&self.ctx, &dst_actual_path)
            .map_err(|e| e.with_message(format!("failed make dst dir [{dst_actual_path}]")))?;
        service.coordinator.append_payload(
            &self.group_id,
            Payload::DstPathToRefresh(join_path(&self.dst_storage_mp, &dst_actual_path)),
        );

        for obj in &objs {
            self.ctx.check()?;
            let child = self.child(join_path(&self.src_actual_path, obj.name()), dst_actual_path.clone());
            service.coordinator.add_task(&child.group_id, &child.id, None);
            service.manager(self.kind).add(child);
        }
        self.status = format!("src object is dir, added all {} tasks of objs", self.kind);
        debug!(task_id = %self.id, children = objs.len(), "directory fanned out");
        Ok(())
    }

    fn put_file(
        &mut self,
        service: &TransferService,
        src: &dyn Driver,
        dst: &dyn Driver,
        src_obj: Arc<dyn Obj>,
    ) -> Result<()> {
        self.total_bytes = src_obj.size();
        self.status = "getting src link".into();
        let link = src
            .link(&self.ctx, &self.src_actual_path, &LinkArgs::default())
            .map_err(|e| e.with_message(format!("failed get [{}] link", self.src_actual_path)))?;

        let fs = FileStream::new(Arc::clone(&service.env), self.ctx.clone(), src_obj);
        // the link is released with the stream, on success or failure
        let mut stream = SeekableStream::new(fs, Some(link))
            .map_err(|e| e.with_message(format!("failed get [{}] stream", self.src_actual_path)))?;
        self.total_bytes = stream.get_size();

        self.status = "uploading".into();
        let progress = Arc::clone(&self.progress);
        let mut up = |percent: f64| progress.store(percent.to_bits(), Ordering::Relaxed);
        let result = dst.put(&self.ctx, &self.dst_actual_path, &mut stream, &mut up);
        let closed = stream.close();
        result?;
        closed
    }
}

impl Task for FileTransferTask {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> String {
        format!(
            "{} [{}]({}) to [{}]({})",
            self.kind, self.src_storage_mp, self.src_actual_path, self.dst_storage_mp, self.dst_actual_path
        )
    }

    fn run(&mut self) -> Result<()> {
        if self.ctx.is_done() {
            // a fresh scope for each attempt after a cancel
            self.ctx = Context::new();
        }
        self.state = TaskState::Running;
        let result = self.run_inner();
        self.error = result.as_ref().err().map(ToString::to_string);
        result
    }

    fn on_succeeded(&mut self) {
        self.state = TaskState::Succeeded;
        self.progress.store(100f64.to_bits(), Ordering::Relaxed);
        self.service.coordinator.done(&self.group_id, &self.id, true);
    }

    fn on_failed(&mut self) {
        self.state = if self.ctx.is_done() {
            TaskState::Canceled
        } else {
            TaskState::Failed
        };
        error!(
            task_id = %self.id,
            name = %self.name(),
            error = self.error.as_deref().unwrap_or_default(),
            "transfer task failed"
        );
        self.service.coordinator.done(&self.group_id, &self.id, false);
    }

    /// Joins the batch on the first attempt of a restored task or of a manual
    /// retry. Automatic retries keep their existing membership.
    fn set_retry(&mut self, retry: usize, max_retry: usize) {
        self.retry = retry;
        self.max_retry = max_retry;
        let restored = self.group_id.is_empty();
        let manual_retry = self.error.is_none() && self.state != TaskState::Pending;
        if retry == 0 && (restored || manual_retry) {
            self.group_id = join_path(&self.dst_storage_mp, &self.dst_actual_path);
            let payload = (self.kind == TaskKind::Move)
                .then(|| Payload::SrcPathToRemove(join_path(&self.src_storage_mp, &self.src_actual_path)));
            self.service.coordinator.add_task(&self.group_id, &self.id, payload);
        }
    }
}

impl fmt::Debug for FileTransferTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileTransferTask")
            .field("id", &self.id)
            .field("name", &self.name())
            .field("group_id", &self.group_id)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}
