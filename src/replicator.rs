//! Orchestrates one selective replica build.
//!
//! The run moves through [`Phase`]s in a fixed order:
//!
//! ```text
//! Init -> FilterResolved -> CaptureStarted -> WindowOpen -> Copying
//!      -> WindowClosed -> CaptureStopped -> Promoted
//! ```
//!
//! Any error moves the session to `Failed`. Once WAL capture has started,
//! closing the backup window and stopping capture are always attempted, in
//! that order and independently of each other; their failures end up in the
//! [`CleanupReport`] and never replace the error that ended the run.

use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::time::{Duration, Instant};
use tokio::fs;
use tracing::{debug, error, info, warn};

use crate::backup_window::BackupWindow;
use crate::capture::{self, WalCapture};
use crate::config::{ReplicaProfile, RunOptions};
use crate::copy::{self, CopyPlan, FileCopier, RemoteSource};
use crate::error::{CleanupReport, CleanupWarning};
use crate::filter;
use crate::postgres::{BackupStop, Catalog, CatalogSnapshot};
use crate::preconditions;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    FilterResolved,
    CaptureStarted,
    WindowOpen,
    Copying,
    WindowClosed,
    CaptureStopped,
    Promoted,
    Failed,
}

/// Runtime state of one build. Never persisted.
#[derive(Debug, Clone)]
pub struct BackupSession {
    phase: Phase,
    history: Vec<Phase>,
    started_at: Instant,
    label: Option<String>,
    window_open: bool,
    copy_completed: bool,
}

impl BackupSession {
    fn new() -> Self {
        Self {
            phase: Phase::Init,
            history: vec![Phase::Init],
            started_at: Instant::now(),
            label: None,
            window_open: false,
            copy_completed: false,
        }
    }

    fn advance(&mut self, phase: Phase) {
        debug!(from = ?self.phase, to = ?phase, "Phase change");
        self.phase = phase;
        self.history.push(phase);
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Every phase entered, in order.
    pub fn history(&self) -> &[Phase] {
        &self.history
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub fn window_open(&self) -> bool {
        self.window_open
    }

    pub fn copy_completed(&self) -> bool {
        self.copy_completed
    }
}

/// Outcome of [`Replicator::run`].
#[derive(Debug)]
pub struct RunReport {
    pub outcome: Result<()>,
    pub cleanup: CleanupReport,
    pub session: BackupSession,
    pub elapsed: Duration,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }
}

pub struct Replicator<C, W, F> {
    catalog: C,
    capture: W,
    copier: F,
    profile: ReplicaProfile,
    source: RemoteSource,
    options: RunOptions,
}

impl<C, W, F> Replicator<C, W, F>
where
    C: Catalog,
    W: WalCapture,
    F: FileCopier,
{
    pub fn new(
        catalog: C,
        capture: W,
        copier: F,
        profile: ReplicaProfile,
        source_host: impl Into<String>,
        options: RunOptions,
    ) -> Self {
        let source = RemoteSource::new(options.copy_user.clone(), source_host);
        Self {
            catalog,
            capture,
            copier,
            profile,
            source,
            options,
        }
    }

    /// Builds the replica. `shutdown` resolving interrupts the warm-up or the
    /// copy; cleanup still runs before this returns.
    pub async fn run<S>(&mut self, shutdown: S) -> RunReport
    where
        S: Future<Output = ()>,
    {
        info!(
            replica = %self.profile.name,
            destination = %self.options.destination.display(),
            dry_run = self.options.dry_run,
            "Building selective replica"
        );

        tokio::pin!(shutdown);
        let mut session = BackupSession::new();
        let mut cleanup = CleanupReport::default();

        let outcome = self.drive(&mut session, &mut cleanup, shutdown).await;

        if let Err(e) = &outcome {
            error!(phase = ?session.phase, "Replica build failed: {}", e);
            session.advance(Phase::Failed);
        }

        RunReport {
            outcome,
            cleanup,
            elapsed: session.started_at.elapsed(),
            session,
        }
    }

    async fn drive<S>(
        &mut self,
        session: &mut BackupSession,
        cleanup: &mut CleanupReport,
        shutdown: Pin<&mut S>,
    ) -> Result<()>
    where
        S: Future<Output = ()>,
    {
        let Replicator {
            catalog,
            capture,
            copier,
            profile,
            source,
            options,
        } = self;

        preconditions::check_targets(options).await?;

        let snapshot = CatalogSnapshot::load(catalog).await?;
        let filter = filter::resolve(profile, &snapshot)?;
        let data_directory = catalog.data_directory().await?;
        let version = catalog.server_version().await?;
        info!(
            data_directory = %data_directory.display(),
            server_version = %version,
            "Source cluster"
        );
        let plan = CopyPlan::new(
            source,
            &data_directory,
            &options.destination,
            &filter,
            version.wal_dir_name(),
        );
        session.advance(Phase::FilterResolved);

        if !options.dry_run {
            preconditions::create_staging_dir(&options.staging_dir).await?;
        }
        capture.start(&options.staging_dir).await?;
        session.advance(Phase::CaptureStarted);

        let mut window = BackupWindow::new(&*catalog, options.dry_run);
        let copied = open_window_and_copy(
            &*catalog,
            capture,
            &*copier,
            &mut window,
            session,
            &plan,
            options,
            shutdown,
        )
        .await;

        // Cleanup: both steps run whatever happened above.
        let was_open = window.is_open();
        let stop = match window.close().await {
            Ok(stop) => stop,
            Err(e) => {
                let warning = CleanupWarning::WindowClose(e.to_string());
                error!("{}", warning);
                cleanup.push(warning);
                None
            }
        };
        session.window_open = false;
        if was_open {
            session.advance(Phase::WindowClosed);
        }

        if was_open && !options.dry_run {
            capture::wait_for_flush(
                &*catalog,
                capture.application_name(),
                stop.as_ref().map(|s| s.lsn),
                options.drain,
                options.poll_interval,
            )
            .await;
        }
        if let Err(e) = capture.stop().await {
            let warning = CleanupWarning::CaptureStop(e.to_string());
            error!("{}", warning);
            cleanup.push(warning);
        }
        session.advance(Phase::CaptureStopped);

        if let Err(e) = copied {
            if !options.dry_run {
                warn!(
                    staging = %options.staging_dir.display(),
                    "Leaving staged WAL in place for manual recovery"
                );
            }
            return Err(e);
        }

        // A non-exclusive backup is only restorable with the label the stop
        // call hands back.
        let has_label = stop.as_ref().is_some_and(|s| s.label_file.is_some());
        if was_open && !options.dry_run && version.non_exclusive_backup() && !has_label {
            let warning = CleanupWarning::BackupLabelMissing(options.destination.clone());
            error!("{}", warning);
            cleanup.push(warning);
        }

        promote(options, version.wal_dir_name(), stop.as_ref()).await?;
        session.advance(Phase::Promoted);
        Ok(())
    }
}

#[allow(clippy::too_many_arguments)]
async fn open_window_and_copy<C, W, F, S>(
    catalog: &C,
    capture: &mut W,
    copier: &F,
    window: &mut BackupWindow<'_, C>,
    session: &mut BackupSession,
    plan: &CopyPlan,
    options: &RunOptions,
    mut shutdown: Pin<&mut S>,
) -> Result<()>
where
    C: Catalog + ?Sized,
    W: WalCapture + ?Sized,
    F: FileCopier + ?Sized,
    S: Future<Output = ()>,
{
    if !options.dry_run {
        tokio::select! {
            ready = capture::wait_until_streaming(catalog, capture, options.warmup, options.poll_interval) => {
                ready?;
            }
            _ = shutdown.as_mut() => {
                warn!("Interrupted during WAL capture warm-up");
                return Err(Error::Shutdown);
            }
        }
    }

    let label = window.open().await?;
    session.label = Some(label);
    session.window_open = true;
    session.advance(Phase::WindowOpen);

    session.advance(Phase::Copying);
    tokio::select! {
        copied = copy::execute(copier, plan, options.max_parallel_copies) => {
            copied?;
        }
        _ = shutdown.as_mut() => {
            warn!("Interrupted during file copy; cleaning up");
            return Err(Error::Shutdown);
        }
    }

    if capture.has_exited()? {
        return Err(Error::Launch {
            message: "WAL capture process exited while files were being copied; \
                      the copy cannot be made consistent"
                .to_string(),
        });
    }

    session.copy_completed = true;
    Ok(())
}

/// Moves staged WAL into the replica and writes the files a non-exclusive
/// backup hands back.
async fn promote(options: &RunOptions, wal_dir_name: &str, stop: Option<&BackupStop>) -> Result<()> {
    let target = options.destination.join(wal_dir_name);
    info!(
        "Moving staged WAL {} to {}",
        options.staging_dir.display(),
        target.display()
    );
    if options.dry_run {
        return Ok(());
    }

    finalize_partial_segments(&options.staging_dir).await?;
    fs::create_dir_all(&options.destination).await?;
    move_dir(&options.staging_dir, &target).await?;

    if let Some(stop) = stop {
        if let Some(label) = &stop.label_file {
            fs::write(options.destination.join("backup_label"), label).await?;
            info!("Wrote backup_label");
        }
        if let Some(map) = &stop.tablespace_map {
            fs::write(options.destination.join("tablespace_map"), map).await?;
            info!("Wrote tablespace_map");
        }
    }
    Ok(())
}

/// Renames `from` to `to`, copying across filesystems when a rename cannot.
async fn move_dir(from: &Path, to: &Path) -> Result<()> {
    match fs::rename(from, to).await {
        Ok(()) => Ok(()),
        Err(e) if e.raw_os_error() == Some(libc::EXDEV) => {
            warn!(
                from = %from.display(),
                to = %to.display(),
                "Staging directory is on another filesystem; copying WAL instead"
            );
            copy_dir(from, to).await?;
            fs::remove_dir_all(from).await?;
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

async fn copy_dir(from: &Path, to: &Path) -> Result<()> {
    let mut pending = vec![(from.to_path_buf(), to.to_path_buf())];
    while let Some((source, target)) = pending.pop() {
        fs::create_dir(&target).await?;
        let mut entries = fs::read_dir(&source).await?;
        while let Some(entry) = entries.next_entry().await? {
            let entry_target = target.join(entry.file_name());
            if entry.file_type().await?.is_dir() {
                pending.push((entry.path(), entry_target));
            } else {
                fs::copy(entry.path(), &entry_target).await?;
                fs::File::open(&entry_target).await?.sync_all().await?;
            }
        }
    }
    Ok(())
}

/// Renames `*.partial` segments to their final names so recovery replays them.
async fn finalize_partial_segments(dir: &Path) -> Result<()> {
    let mut entries = fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let Some(segment) = name.to_str().and_then(|n| n.strip_suffix(".partial")) else {
            continue;
        };
        let final_path = dir.join(segment);
        if fs::try_exists(&final_path).await? {
            warn!(segment, "Complete segment already present; keeping the .partial file as is");
            continue;
        }
        fs::rename(entry.path(), &final_path).await?;
        info!(segment, "Finalized partial WAL segment");
    }
    Ok(())
}
