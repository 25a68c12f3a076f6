//! Static snapshot collection.
//!
//! At build time the application's [`ServerEntry::handle_build`] yields a
//! stream of [`BuildTask`]s. [`SnapshotCollector`] schedules one background
//! write per file task and keeps the handles, so [`wait_for_tasks`] can act as
//! the barrier the build has to pass before it is finished.
//!
//! # Output layout
//!
//! | pathname           | file                          |
//! |--------------------|-------------------------------|
//! | `/`                | `index.html`                  |
//! | `/about`           | `about/index.html`            |
//! | `/404`             | `404.html`                    |
//! | `/RSC/_.txt`       | `RSC/_.txt`                   |
//!
//! All files land under [`RscConfig::output_dir`]. Writes go to a temporary
//! sibling first and are renamed into place, so readers never observe a
//! partially written file.
//!
//! [`ServerEntry::handle_build`]: crate::render::ServerEntry::handle_build
//! [`wait_for_tasks`]: SnapshotCollector::wait_for_tasks

use crate::codec::encode_rsc_path;
use crate::config::RscConfig;
use crate::error::{Result, RscError};
use crate::render::{HandlerOutput, PageOptions, RenderOps, RscHandler};
use crate::runtime::{Element, Elements};
use crate::stream::ByteStream;
use futures::StreamExt;
use parking_lot::Mutex;
use path_clean::PathClean;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::AsyncWriteExt;
use tokio::task::JoinSet;

/// Render operations available while building.
#[derive(Clone, Debug)]
pub struct BuildOps {
    render: RenderOps,
    rsc_base: String,
}

impl BuildOps {
    pub fn new(render: RenderOps, rsc_base: String) -> Self {
        Self { render, rsc_base }
    }

    pub fn render_ops(&self) -> &RenderOps {
        &self.render
    }

    /// See [`RenderOps::render_data`].
    pub fn render_data(&self, elements: Elements) -> ByteStream {
        self.render.render_data(elements)
    }

    /// Render a page and return only its body.
    pub async fn render_page(
        &self,
        elements: Elements,
        page: Element,
        options: PageOptions,
    ) -> anyhow::Result<ByteStream> {
        match self.render.render_page(elements, page, options).await? {
            HandlerOutput::Stream(body) => Ok(body),
            HandlerOutput::Parts { body, .. } => {
                body.ok_or_else(|| anyhow::anyhow!("page render produced no body"))
            }
        }
    }

    /// Pathname the payload for `rsc_path` is requested from.
    ///
    /// ```
    /// # use fob_rsc::{BuildOps, RenderOps};
    /// # fn ops(render: RenderOps) {
    /// let ops = BuildOps::new(render, "RSC".to_string());
    /// assert_eq!(ops.rsc_path_to_pathname(""), "/RSC/_.txt");
    /// assert_eq!(ops.rsc_path_to_pathname("blog/post"), "/RSC/blog/post.txt");
    /// # }
    /// ```
    pub fn rsc_path_to_pathname(&self, rsc_path: &str) -> String {
        format!("/{}/{}", self.rsc_base, encode_rsc_path(rsc_path))
    }
}

/// Unit of build output.
pub enum BuildTask {
    /// Write `body` to the static file for `pathname`
    File { pathname: String, body: ByteStream },
    /// Task kind this version does not know; logged and skipped
    Other { kind: String },
}

impl BuildTask {
    pub fn file(pathname: impl Into<String>, body: ByteStream) -> Self {
        BuildTask::File {
            pathname: pathname.into(),
            body,
        }
    }

    pub fn kind(&self) -> &str {
        match self {
            BuildTask::File { .. } => "file",
            BuildTask::Other { kind } => kind,
        }
    }
}

impl fmt::Debug for BuildTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildTask::File { pathname, .. } => f
                .debug_struct("File")
                .field("pathname", pathname)
                .finish_non_exhaustive(),
            BuildTask::Other { kind } => f.debug_struct("Other").field("kind", kind).finish(),
        }
    }
}

/// Summary of one collection run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SnapshotReport {
    /// Files scheduled for writing, relative to the output directory
    pub scheduled: Vec<PathBuf>,
    /// Kinds of tasks that were skipped
    pub skipped: Vec<String>,
}

/// Schedules snapshot writes and tracks them until they complete.
pub struct SnapshotCollector {
    out_dir: PathBuf,
    tasks: Mutex<JoinSet<Result<PathBuf>>>,
    next_write: AtomicU64,
}

impl SnapshotCollector {
    /// Relative directories are resolved against the current directory.
    pub fn new(out_dir: impl Into<PathBuf>) -> Self {
        let out_dir = out_dir.into();
        let out_dir = if out_dir.is_absolute() {
            out_dir
        } else {
            std::env::current_dir()
                .map(|cwd| cwd.join(&out_dir))
                .unwrap_or(out_dir)
        };
        Self {
            out_dir: out_dir.clean(),
            tasks: Mutex::new(JoinSet::new()),
            next_write: AtomicU64::new(0),
        }
    }

    /// Collector writing to `<dist_dir>/<public_dir>`.
    pub fn from_config(config: &RscConfig) -> Self {
        Self::new(config.output_dir())
    }

    pub fn out_dir(&self) -> &Path {
        &self.out_dir
    }

    /// Number of writes not yet awaited.
    pub fn pending(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Schedule `body` to be written as the static file for `pathname`.
    ///
    /// The target is validated before anything is scheduled; the write itself
    /// runs in the background. Must be called inside a tokio runtime.
    pub fn emit_static_file(&self, pathname: &str, body: ByteStream) -> Result<PathBuf> {
        let relative = static_file_path(pathname);
        let target = validate_output_path(&self.out_dir, &relative)?;

        let write_id = self.next_write.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(pathname, file = %target.display(), "scheduling snapshot write");
        self.tasks.lock().spawn(write_atomic(target, body, write_id));
        Ok(PathBuf::from(relative))
    }

    /// Resolve once every scheduled write has finished.
    ///
    /// Writes scheduled while waiting are awaited too. All writes are driven
    /// to completion even if one fails; the first failure is returned.
    pub async fn wait_for_tasks(&self) -> Result<Vec<PathBuf>> {
        let mut written = Vec::new();
        let mut first_error = None;

        loop {
            let mut tasks = std::mem::take(&mut *self.tasks.lock());
            if tasks.is_empty() {
                break;
            }
            while let Some(joined) = tasks.join_next().await {
                match joined.map_err(std::io::Error::from) {
                    Ok(Ok(path)) => written.push(path),
                    Ok(Err(err)) => {
                        tracing::error!(error = %err, "snapshot write failed");
                        first_error.get_or_insert(err);
                    }
                    Err(err) => {
                        first_error.get_or_insert(RscError::Io(err));
                    }
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(written),
        }
    }

    /// Drain the entry's build stream and schedule its file tasks.
    ///
    /// Does not wait for the writes; call [`wait_for_tasks`](Self::wait_for_tasks)
    /// or use [`run`](Self::run).
    pub async fn collect(&self, handler: &RscHandler) -> Result<SnapshotReport> {
        let mut report = SnapshotReport::default();
        let mut tasks = handler.entry().handle_build(handler.build_ops());

        while let Some(task) = tasks.next().await {
            let task = task.map_err(|err| RscError::Render(format!("{err:#}")))?;
            match task {
                BuildTask::File { pathname, body } => {
                    report.scheduled.push(self.emit_static_file(&pathname, body)?);
                }
                BuildTask::Other { kind } => {
                    tracing::warn!(kind = %kind, "skipping unknown build task");
                    report.skipped.push(kind);
                }
            }
        }

        Ok(report)
    }

    /// [`collect`](Self::collect) followed by [`wait_for_tasks`](Self::wait_for_tasks).
    pub async fn run(&self, handler: &RscHandler) -> Result<SnapshotReport> {
        let collected = self.collect(handler).await;
        let written = self.wait_for_tasks().await;
        let report = collected?;
        written?;

        tracing::info!(
            files = report.scheduled.len(),
            skipped = report.skipped.len(),
            out_dir = %self.out_dir.display(),
            "snapshot complete"
        );
        Ok(report)
    }
}

impl fmt::Debug for SnapshotCollector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapshotCollector")
            .field("out_dir", &self.out_dir)
            .field("pending", &self.pending())
            .finish()
    }
}

/// File a pathname is written to, relative to the output directory.
pub fn static_file_path(pathname: &str) -> String {
    let trimmed = pathname.trim_matches('/');
    let last = trimmed.rsplit('/').next().unwrap_or_default();

    if last.contains('.') {
        trimmed.to_string()
    } else if trimmed == "404" {
        "404.html".to_string()
    } else if trimmed.is_empty() {
        "index.html".to_string()
    } else {
        format!("{trimmed}/index.html")
    }
}

fn validate_output_path(base_dir: &Path, relative: &str) -> Result<PathBuf> {
    if relative.contains('\0') {
        return Err(RscError::InvalidOutputPath(
            "path contains null byte".to_string(),
        ));
    }

    let full_path = base_dir.join(Path::new(relative).clean()).clean();
    if !full_path.starts_with(base_dir) || full_path == base_dir {
        return Err(RscError::InvalidOutputPath(format!(
            "'{}' escapes output directory '{}'",
            relative,
            base_dir.display()
        )));
    }

    Ok(full_path)
}

/// Write through a temp file unique to this write, then rename. Concurrent
/// writes to one target each rename a complete file; the last rename wins.
async fn write_atomic(target: PathBuf, mut body: ByteStream, write_id: u64) -> Result<PathBuf> {
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let file_name = target
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp_path = target.with_file_name(format!(".{file_name}.{write_id}.tmp"));

    let written = async {
        let mut file = tokio::fs::File::create(&temp_path).await?;
        while let Some(chunk) = body.next().await {
            file.write_all(&chunk?).await?;
        }
        file.flush().await?;
        file.sync_all().await?;
        tokio::fs::rename(&temp_path, &target).await
    }
    .await;

    if let Err(err) = written {
        if let Err(cleanup) = tokio::fs::remove_file(&temp_path).await {
            tracing::debug!(error = %cleanup, file = %temp_path.display(), "temp file cleanup failed");
        }
        return Err(RscError::Io(err));
    }

    Ok(target)
}
