//! Installation scripting pipeline.
//!
//! Handles all calls to the distributor's stage scripts. The installation
//! consists of three steps:
//! * Preparation. Used e.g. for updating mirrors.
//! * Installation. Installs an OS onto a disk.
//! * Configuration. Configures the OS according to the user's choices.
//!
//! Steps are unlocked one milestone page at a time by the navigation machine
//! and run strictly in order, never more than one at a time. Three cursors
//! track the run: `ready_step` (furthest unlocked), `running_step` (executing
//! now) and `finished_step` (furthest completed). A stage without a usable
//! script is skipped, not failed; the config loader guarantees at least one
//! of install/configure exists.
//!
//! Scripts are spawned as `sh <path>` attached to a pseudo-terminal whose
//! output streams into the shared [`TerminalSink`]. A watcher thread per
//! child delivers the exit status back here; everything the exit handler
//! tells the rest of the wizard travels through the store, never by calling
//! into navigation directly, so the navigation lock is never taken from a
//! pipeline thread.

use crate::config_file::{RunMode, Scripts};
use crate::envvars::create_envs;
use crate::pages::Page;
use crate::process_guard::ChildRegistry;
use crate::store::{Key, Store, Value};
use crate::terminal::TerminalSink;
use anyhow::{Context, Result};
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize, SlavePty};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::Duration;
use strum::Display;
use tracing::{error, info, warn};

/// One step of the installation, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display)]
#[strum(serialize_all = "lowercase")]
#[repr(u8)]
pub enum Stage {
    None = 0,
    Prepare = 1,
    Install = 2,
    Configure = 3,
    Done = 4,
}

impl Stage {
    /// The next stage in the sequence, or `None` past the end.
    pub const fn next(self) -> Option<Self> {
        match self {
            Stage::None => Some(Stage::Prepare),
            Stage::Prepare => Some(Stage::Install),
            Stage::Install => Some(Stage::Configure),
            Stage::Configure => Some(Stage::Done),
            Stage::Done => None,
        }
    }

    /// Whether a script can be associated with this stage.
    pub const fn is_runnable(self) -> bool {
        matches!(self, Stage::Prepare | Stage::Install | Stage::Configure)
    }
}

/// Shared cancellation handle for all stage spawns.
///
/// Cancelling stops the pipeline from starting further stages and gracefully
/// terminates the running child's process group. Partially applied changes
/// are not rolled back.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

struct CancelInner {
    cancelled: AtomicBool,
    child_pid: Mutex<Option<u32>>,
}

impl CancelToken {
    fn new() -> Self {
        Self {
            inner: Arc::new(CancelInner {
                cancelled: AtomicBool::new(false),
                child_pid: Mutex::new(None),
            }),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Cancelling installation scripting");
        let pid = *self.inner.child_pid.lock().expect("cancel pid lock");
        if let Some(pid) = pid {
            crate::process_guard::terminate_gracefully(pid, Duration::from_secs(5));
        }
    }

    fn set_child(&self, pid: Option<u32>) {
        *self.inner.child_pid.lock().expect("cancel pid lock") = pid;
    }
}

struct PipelineState {
    ready: Stage,
    running: Stage,
    finished: Stage,
    halted: bool,
    // keeps the pty alive while a child runs
    master: Option<Box<dyn MasterPty + Send>>,
}

pub struct InstallationPipeline {
    state: Mutex<PipelineState>,
    store: Arc<Store>,
    scripts: Scripts,
    run_mode: RunMode,
    terminal: Arc<TerminalSink>,
    cancel: CancelToken,
    // handle to ourselves for the stage watcher threads
    weak: Weak<InstallationPipeline>,
}

impl InstallationPipeline {
    pub fn new(
        store: Arc<Store>,
        scripts: Scripts,
        run_mode: RunMode,
        terminal: Arc<TerminalSink>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            state: Mutex::new(PipelineState {
                ready: Stage::None,
                running: Stage::None,
                finished: Stage::None,
                halted: false,
                master: None,
            }),
            store,
            scripts,
            run_mode,
            terminal,
            cancel: CancelToken::new(),
            weak: weak.clone(),
        })
    }

    /// The cancellation token shared by all stage spawns.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// The shared console buffer the stages write into.
    pub fn terminal(&self) -> Arc<TerminalSink> {
        Arc::clone(&self.terminal)
    }

    pub fn ready_step(&self) -> Stage {
        self.state.lock().expect("pipeline lock").ready
    }

    pub fn running_step(&self) -> Stage {
        self.state.lock().expect("pipeline lock").running
    }

    pub fn finished_step(&self) -> Stage {
        self.state.lock().expect("pipeline lock").finished
    }

    pub fn can_run_prepare(&self) {
        self.set_ok_to_start(Stage::Prepare);
    }

    pub fn can_run_install(&self) {
        self.set_ok_to_start(Stage::Install);
    }

    pub fn can_run_configure(&self) {
        self.set_ok_to_start(Stage::Configure);
    }

    /// Raise `ready_step` to `stage` and start whatever is now runnable.
    ///
    /// Called by the navigation machine when a milestone page is reached.
    /// Readiness only ever increases.
    pub fn set_ok_to_start(&self, stage: Stage) {
        let mut state = self.state.lock().expect("pipeline lock");
        if state.ready < stage {
            state.ready = stage;
            self.try_start_next(&mut state);
        }
    }

    fn script_for(&self, stage: Stage) -> Option<PathBuf> {
        match stage {
            Stage::Prepare => self.scripts.prepare.clone(),
            Stage::Install => self.scripts.install.clone(),
            Stage::Configure => self.scripts.configure.clone(),
            _ => None,
        }
    }

    /// Start the next unlocked stage, skipping stages with no usable script.
    ///
    /// Iterative rather than recursive: each skip marks the stage finished
    /// and loops to consider the one after it.
    fn try_start_next(&self, state: &mut PipelineState) {
        loop {
            if state.halted || self.cancel.is_cancelled() {
                return;
            }
            if state.running != Stage::None {
                return;
            }
            if state.finished >= state.ready {
                return;
            }

            let next = state
                .finished
                .next()
                .expect("finished below ready implies a next stage");
            debug_assert!(next.is_runnable());

            if next != Stage::Prepare {
                self.store.set(Key::InstallationRunning, Value::Bool(true));
            }

            match self.script_for(next) {
                Some(path) if path.exists() => {
                    info!("Starting step \"{next}\"...");
                    match self.spawn_stage(next, &path) {
                        Ok(master) => {
                            state.running = next;
                            state.master = Some(master);
                            return;
                        }
                        Err(e) => {
                            // spawn failure counts as a failed stage
                            error!("Error starting step \"{next}\": {e:#}");
                            self.fail_installation(state);
                            return;
                        }
                    }
                }
                Some(path) => {
                    warn!(
                        "Could not find configured script \"{}\", skipping step \"{next}\"",
                        path.display()
                    );
                    if self.mark_finished(state, next) {
                        return;
                    }
                }
                None => {
                    info!("Skipping step \"{next}\"");
                    if self.mark_finished(state, next) {
                        return;
                    }
                }
            }
        }
    }

    /// Record `stage` as finished. Returns true when the run is complete.
    fn mark_finished(&self, state: &mut PipelineState, stage: Stage) -> bool {
        state.finished = stage;
        if stage == Stage::Configure {
            self.complete_installation(state);
            true
        } else {
            false
        }
    }

    fn complete_installation(&self, state: &mut PipelineState) {
        state.finished = Stage::Done;
        self.store.set(Key::InstallationRunning, Value::Bool(false));
        self.store
            .set(Key::SendNotification, Value::Str("Finished Installation".into()));
        // advance past the install page; the guard-free request is handled
        // on the event loop, never from this thread
        self.store.request_advance(None);
    }

    fn fail_installation(&self, state: &mut PipelineState) {
        state.halted = true;
        self.store.set(Key::InstallationRunning, Value::Bool(false));
        self.store.request_page(Page::Failed);
        self.store
            .set(Key::SendNotification, Value::Str("Installation Failed".into()));
    }

    fn spawn_stage(&self, stage: Stage, script: &Path) -> Result<Box<dyn MasterPty + Send>> {
        let pty = native_pty_system()
            .openpty(PtySize {
                rows: 24,
                cols: 80,
                pixel_width: 0,
                pixel_height: 0,
            })
            .context("failed to open pty")?;

        let mut cmd = CommandBuilder::new("sh");
        cmd.arg(script);
        cmd.cwd("/");
        for (key, value) in create_envs(&self.store, stage) {
            cmd.env(key, value);
        }

        let mut child = pty
            .slave
            .spawn_command(cmd)
            .with_context(|| format!("failed to spawn script {}", script.display()))?;
        drop(pty.slave);

        let reader = pty
            .master
            .try_clone_reader()
            .context("failed to clone pty reader")?;
        Arc::clone(&self.terminal).attach_reader(reader);

        let pid = child.process_id();
        if let Some(pid) = pid {
            if let Ok(mut registry) = ChildRegistry::global().lock() {
                registry.register(pid);
            }
        }
        self.cancel.set_child(pid);

        let pipeline = self.weak.upgrade().expect("pipeline outlives its spawns");
        thread::Builder::new()
            .name(format!("stage-{stage}"))
            .spawn(move || {
                let status = child.wait();
                if let Some(pid) = pid {
                    if let Ok(mut registry) = ChildRegistry::global().lock() {
                        registry.unregister(pid);
                    }
                }
                pipeline.on_child_exited(stage, status);
            })
            .context("failed to spawn stage watcher thread")?;

        Ok(pty.master)
    }

    fn on_child_exited(&self, stage: Stage, status: std::io::Result<portable_pty::ExitStatus>) {
        let mut state = self.state.lock().expect("pipeline lock");
        state.finished = state.running;
        state.running = Stage::None;
        state.master = None;
        self.cancel.set_child(None);

        if self.cancel.is_cancelled() {
            info!("Step \"{stage}\" ended after cancellation");
            return;
        }

        let success = matches!(&status, Ok(s) if s.success());
        if !success && !self.run_mode.is_demo() {
            match status {
                Ok(s) => error!("Failure during step \"{stage}\" (exit code {})", s.exit_code()),
                Err(e) => error!("Failure during step \"{stage}\": {e}"),
            }
            self.fail_installation(&mut state);
            return;
        }

        info!("Finished step \"{stage}\".");

        if state.finished == Stage::Configure {
            self.complete_installation(&mut state);
        } else {
            self.try_start_next(&mut state);
        }
    }
}
