//! In-memory sandbox used by unit tests.

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering},
};
use std::time::Duration;

use async_trait::async_trait;
use livepane_process::FileTree;
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::config::CommandSpec;
use crate::controller::Controller;
use crate::environment::HostEnvironment;
use crate::logs::RunLog;
use crate::preview::PreviewBridge;
use crate::runtime_handle::RuntimeHandle;
use crate::sandbox::{
    ProcessKill, SandboxError, SandboxPlatform, SandboxProcess, SandboxRuntime, ServerReady,
};

pub(crate) struct FakePlatform {
    runtime: Arc<FakeRuntime>,
    failure: Mutex<Option<SandboxError>>,
    delay: Duration,
    boots: AtomicUsize,
}

impl FakePlatform {
    pub(crate) fn ok() -> Self {
        Self {
            runtime: Arc::new(FakeRuntime::new()),
            failure: Mutex::new(None),
            delay: Duration::ZERO,
            boots: AtomicUsize::new(0),
        }
    }

    pub(crate) fn failing(err: SandboxError) -> Self {
        let p = Self::ok();
        *p.failure.lock().unwrap() = Some(err);
        p
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub(crate) fn succeed_next(&self) {
        *self.failure.lock().unwrap() = None;
    }

    pub(crate) fn boot_count(&self) -> usize {
        self.boots.load(Ordering::SeqCst)
    }

    pub(crate) fn runtime(&self) -> Arc<FakeRuntime> {
        self.runtime.clone()
    }
}

#[async_trait]
impl SandboxPlatform for FakePlatform {
    fn name(&self) -> &str {
        "fake"
    }

    async fn boot(&self) -> Result<Arc<dyn SandboxRuntime>, SandboxError> {
        self.boots.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(err) = self.failure.lock().unwrap().clone() {
            return Err(err);
        }
        Ok(self.runtime.clone())
    }
}

pub(crate) struct FakeProcess {
    pub(crate) command: String,
    exit_tx: Mutex<Option<oneshot::Sender<i32>>>,
    output_tx: Mutex<Option<mpsc::UnboundedSender<String>>>,
    killed: AtomicBool,
}

impl FakeProcess {
    pub(crate) fn exit(&self, code: i32) {
        self.output_tx.lock().unwrap().take();
        if let Some(tx) = self.exit_tx.lock().unwrap().take() {
            let _ = tx.send(code);
        }
    }

    pub(crate) fn print(&self, line: &str) {
        if let Some(tx) = self.output_tx.lock().unwrap().as_ref() {
            let _ = tx.send(line.to_string());
        }
    }

    pub(crate) fn is_live(&self) -> bool {
        self.exit_tx.lock().unwrap().is_some()
    }

    pub(crate) fn was_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }
}

impl ProcessKill for FakeProcess {
    fn kill(&self) {
        self.killed.store(true, Ordering::SeqCst);
        self.exit(-1);
    }
}

/// Records mounts and spawns. The install command exits right away with
/// `install_exit`; every other command stays alive until told otherwise.
pub(crate) struct FakeRuntime {
    pub(crate) mounts: Mutex<Vec<FileTree>>,
    pub(crate) mount_error: Mutex<Option<SandboxError>>,
    pub(crate) spawn_error: Mutex<Option<SandboxError>>,
    pub(crate) install_exit: AtomicI32,
    processes: Mutex<Vec<Arc<FakeProcess>>>,
    ready_tx: broadcast::Sender<ServerReady>,
}

impl FakeRuntime {
    fn new() -> Self {
        let (ready_tx, _) = broadcast::channel(16);
        Self {
            mounts: Mutex::new(Vec::new()),
            mount_error: Mutex::new(None),
            spawn_error: Mutex::new(None),
            install_exit: AtomicI32::new(0),
            processes: Mutex::new(Vec::new()),
            ready_tx,
        }
    }

    pub(crate) fn processes(&self) -> Vec<Arc<FakeProcess>> {
        self.processes.lock().unwrap().clone()
    }

    pub(crate) fn commands(&self) -> Vec<String> {
        self.processes().iter().map(|p| p.command.clone()).collect()
    }

    pub(crate) fn starts(&self) -> Vec<Arc<FakeProcess>> {
        self.processes()
            .into_iter()
            .filter(|p| p.command != "npm install")
            .collect()
    }

    pub(crate) fn live_starts(&self) -> usize {
        self.starts().iter().filter(|p| p.is_live()).count()
    }

    pub(crate) fn last_mount(&self) -> Option<FileTree> {
        self.mounts.lock().unwrap().last().cloned()
    }

    pub(crate) fn announce(&self, port: u16, url: &str) {
        let _ = self.ready_tx.send(ServerReady {
            port,
            url: url.to_string(),
        });
    }
}

#[async_trait]
impl SandboxRuntime for FakeRuntime {
    async fn mount(&self, tree: &FileTree) -> Result<(), SandboxError> {
        if let Some(err) = self.mount_error.lock().unwrap().clone() {
            return Err(err);
        }
        self.mounts.lock().unwrap().push(tree.clone());
        Ok(())
    }

    async fn spawn(&self, program: &str, args: &[String]) -> Result<SandboxProcess, SandboxError> {
        if let Some(err) = self.spawn_error.lock().unwrap().clone() {
            return Err(err);
        }
        let command = std::iter::once(program.to_string())
            .chain(args.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ");
        let (output_tx, output) = mpsc::unbounded_channel();
        let (exit_tx, exit) = oneshot::channel();
        let proc = Arc::new(FakeProcess {
            command: command.clone(),
            exit_tx: Mutex::new(Some(exit_tx)),
            output_tx: Mutex::new(Some(output_tx)),
            killed: AtomicBool::new(false),
        });
        self.processes.lock().unwrap().push(proc.clone());

        if command == "npm install" {
            proc.print("added 1 package");
            proc.exit(self.install_exit.load(Ordering::SeqCst));
        }

        Ok(SandboxProcess {
            output,
            exit,
            killer: proc,
        })
    }

    fn subscribe_server_ready(&self) -> broadcast::Receiver<ServerReady> {
        self.ready_tx.subscribe()
    }
}

/// Polls `check` until it holds or a second passes.
pub(crate) async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check().await
}

/// A controller over a booted fake runtime, without persistence.
pub(crate) async fn booted_controller() -> (Arc<Controller>, Arc<FakeRuntime>) {
    let platform = Arc::new(FakePlatform::ok());
    let fake = platform.runtime();
    let handle = Arc::new(RuntimeHandle::new(
        platform,
        HostEnvironment::new("http://localhost:8787", true, true, ""),
    ));
    handle.boot().await.unwrap();
    let controller = Arc::new(Controller::new(
        handle,
        PreviewBridge::new(),
        RunLog::new(1000),
        CommandSpec::parse("npm install").unwrap(),
        CommandSpec::parse("npm start").unwrap(),
        None,
    ));
    (controller, fake)
}
