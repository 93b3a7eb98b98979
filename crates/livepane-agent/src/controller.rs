//! Mount/install/start pipeline around one sandbox runtime.
//!
//! All mutable state sits behind one mutex that is never held across a
//! sandbox call. Each Run gets a fresh [`SessionId`]; the supervisor task
//! of a superseded session keeps running until its process exits but can
//! no longer change anything.

use std::{collections::VecDeque, sync::Arc};

use livepane_process::{
    FileTree, RunFailure, RunFailureKind, RunPhase, RunStatus, SessionId, TreeError,
};
use serde::Serialize;
use tokio::sync::{Mutex, broadcast, mpsc, oneshot};
use tracing::Instrument;

use crate::config::CommandSpec;
use crate::logs::RunLog;
use crate::manifest::{self, MANIFEST_FILE};
use crate::preview::PreviewBridge;
use crate::project_client::TreePersister;
use crate::run_state::{
    RunEvent, RunMachine, RunRejected, RuntimeAvailability, Transition, gate_run, run_label,
};
use crate::runtime_handle::RuntimeHandle;
use crate::sandbox::{ProcessKill, SandboxError, SandboxProcess, ServerReady, classify_run};

const MAX_NOTICES: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeLevel {
    Info,
    Warning,
    Error,
}

/// A message the UI shows once, alert style.
#[derive(Debug, Clone, Serialize)]
pub struct Notice {
    pub id: u64,
    pub level: NoticeLevel,
    pub message: String,
    pub at: String,
}

pub fn failure_message(kind: RunFailureKind, raw: &str) -> String {
    let detail = match kind {
        RunFailureKind::NestedDirectoryMount => Some(
            "This error is usually caused by nested directory structures in the file tree. The project files could not be mounted.",
        ),
        RunFailureKind::Mount => {
            Some("Sandbox mounting failed. This might be due to file structure issues.")
        }
        RunFailureKind::Spawn => Some(
            "Failed to start the application process. Check if all dependencies are properly installed.",
        ),
        RunFailureKind::Stream => Some(
            "Stream handling error. This is usually temporary and the application should still work.",
        ),
        RunFailureKind::InstallFailed => Some("Failed to install dependencies."),
        RunFailureKind::Other => None,
    };

    let mut msg = format!("Error running application: {raw}");
    if let Some(detail) = detail {
        msg.push_str("\n\n");
        msg.push_str(detail);
    }
    msg.push_str("\n\nCheck the run log for more details.");
    msg
}

fn sandbox_failure(err: SandboxError) -> RunFailure {
    RunFailure {
        kind: classify_run(&err),
        message: err.to_string(),
    }
}

struct ControllerState {
    machine: RunMachine,
    tree: FileTree,
    selected: Option<String>,
    start: Option<Arc<dyn ProcessKill>>,
    notices: VecDeque<Notice>,
    next_notice: u64,
}

impl ControllerState {
    fn push_notice(&mut self, level: NoticeLevel, message: String) {
        self.next_notice += 1;
        self.notices.push_back(Notice {
            id: self.next_notice,
            level,
            message,
            at: chrono::Utc::now().to_rfc3339(),
        });
        while self.notices.len() > MAX_NOTICES {
            self.notices.pop_front();
        }
    }
}

pub struct Controller {
    runtime: Arc<RuntimeHandle>,
    preview: PreviewBridge,
    log: RunLog,
    install: CommandSpec,
    start: CommandSpec,
    persister: Option<TreePersister>,
    state: Mutex<ControllerState>,
}

impl Controller {
    pub fn new(
        runtime: Arc<RuntimeHandle>,
        preview: PreviewBridge,
        log: RunLog,
        install: CommandSpec,
        start: CommandSpec,
        persister: Option<TreePersister>,
    ) -> Self {
        Self {
            runtime,
            preview,
            log,
            install,
            start,
            persister,
            state: Mutex::new(ControllerState {
                machine: RunMachine::default(),
                tree: FileTree::new(),
                selected: None,
                start: None,
                notices: VecDeque::new(),
                next_notice: 0,
            }),
        }
    }

    pub fn runtime(&self) -> &Arc<RuntimeHandle> {
        &self.runtime
    }

    pub fn preview(&self) -> &PreviewBridge {
        &self.preview
    }

    pub fn log(&self) -> &RunLog {
        &self.log
    }

    pub async fn availability(&self) -> RuntimeAvailability {
        if let Some(err) = self.runtime.last_error().await {
            return RuntimeAvailability::Errored(err.message);
        }
        if self.runtime.is_available().await {
            RuntimeAvailability::Ready
        } else if self.runtime.is_booting().await {
            RuntimeAvailability::Booting
        } else {
            RuntimeAvailability::NotBooted
        }
    }

    pub async fn run(self: &Arc<Self>) -> Result<SessionId, RunRejected> {
        let session = self.begin_run().await?;
        self.clone().drive(session.clone()).await;
        Ok(session)
    }

    /// Checks the Run preconditions and opens a new session.
    ///
    /// Any start process of the previous session is killed before this
    /// returns. The pipeline itself runs in [`Controller::drive`].
    pub async fn begin_run(&self) -> Result<SessionId, RunRejected> {
        let availability = self.availability().await;
        let mut st = self.state.lock().await;
        if let Err(rejected) = gate_run(&availability, st.tree.is_empty(), st.machine.phase()) {
            tracing::info!(reason = rejected.code(), "run rejected");
            return Err(rejected);
        }

        let session = SessionId::new();
        st.machine
            .apply(&session, RunEvent::Run)
            .map_err(|_| RunRejected::InFlight)?;
        if let Some(previous) = st.start.take() {
            tracing::info!("terminating previous start process");
            previous.kill();
        }
        self.preview.clear();
        tracing::info!(%session, files = st.tree.file_paths().len(), "run started");
        Ok(session)
    }

    pub async fn drive(self: Arc<Self>, session: SessionId) {
        let span = tracing::info_span!("run_session", %session);
        async {
            if let Err(failure) = self.pipeline(&session).await {
                self.fail(&session, failure).await;
            }
        }
        .instrument(span)
        .await
    }

    async fn pipeline(self: &Arc<Self>, session: &SessionId) -> Result<(), RunFailure> {
        let runtime = self.runtime.current().await.ok_or_else(|| RunFailure {
            kind: RunFailureKind::Other,
            message: "sandbox runtime is not available".to_string(),
        })?;
        let snapshot = self.state.lock().await.tree.clone();

        self.log
            .emit(format!("[livepane] mounting {} files", snapshot.file_paths().len()))
            .await;
        runtime.mount(&snapshot).await.map_err(sandbox_failure)?;
        if !self.advance(session, RunEvent::MountDone).await? {
            return Ok(());
        }

        let mut augmented = snapshot;
        if let Some(entry) = manifest::ensure_manifest(&mut augmented) {
            self.log
                .emit(format!("[livepane] no {MANIFEST_FILE} found, generated one for {entry}"))
                .await;
            runtime.mount(&augmented).await.map_err(sandbox_failure)?;
            let tree = {
                let mut st = self.state.lock().await;
                if let Some(node) = augmented.get(MANIFEST_FILE) {
                    st.tree.insert(MANIFEST_FILE, node.clone());
                }
                st.tree.clone()
            };
            self.persist(tree);
        }
        if !self.advance(session, RunEvent::EntrypointReady).await? {
            return Ok(());
        }

        self.log
            .emit(format!("[livepane] $ {}", self.install.display()))
            .await;
        let install = runtime
            .spawn(&self.install.program, &self.install.args)
            .await
            .map_err(sandbox_failure)?;
        self.pump(install.output, "install");
        let code = install.exit.await.map_err(|_| RunFailure {
            kind: RunFailureKind::Stream,
            message: "install process closed without an exit status".to_string(),
        })?;
        self.log
            .emit(format!("[livepane] install exited with code {code}"))
            .await;
        if !self.advance(session, RunEvent::InstallExit(code)).await? {
            return Ok(());
        }
        if code != 0 {
            return Err(RunFailure {
                kind: RunFailureKind::InstallFailed,
                message: format!("`{}` exited with code {code}", self.install.display()),
            });
        }

        let ready = runtime.subscribe_server_ready();
        self.log
            .emit(format!("[livepane] $ {}", self.start.display()))
            .await;
        let SandboxProcess {
            output,
            exit,
            killer,
        } = runtime
            .spawn(&self.start.program, &self.start.args)
            .await
            .map_err(sandbox_failure)?;
        self.pump(output, "start");

        {
            let mut st = self.state.lock().await;
            if !st.machine.is_current(session) {
                killer.kill();
                return Ok(());
            }
            st.start = Some(killer);
            st.machine
                .apply(session, RunEvent::StartSpawned)
                .map_err(|e| RunFailure {
                    kind: RunFailureKind::Other,
                    message: e.to_string(),
                })?;
        }
        self.supervise(session.clone(), ready, exit);
        Ok(())
    }

    /// Applies a pipeline step. `false` means the session was superseded.
    async fn advance(&self, session: &SessionId, event: RunEvent) -> Result<bool, RunFailure> {
        let mut st = self.state.lock().await;
        match st.machine.apply(session, event) {
            Ok(Transition::Ignored) => Ok(false),
            Ok(_) => Ok(true),
            Err(e) => Err(RunFailure {
                kind: RunFailureKind::Other,
                message: e.to_string(),
            }),
        }
    }

    fn pump(&self, mut output: mpsc::UnboundedReceiver<String>, tag: &'static str) {
        let log = self.log.clone();
        tokio::spawn(async move {
            while let Some(line) = output.recv().await {
                log.emit(format!("[{tag}] {line}")).await;
            }
        });
    }

    fn supervise(
        self: &Arc<Self>,
        session: SessionId,
        mut ready: broadcast::Receiver<ServerReady>,
        mut exit: oneshot::Receiver<i32>,
    ) {
        let this = self.clone();
        let span = tracing::info_span!("start_supervisor", %session);
        tokio::spawn(
            async move {
                loop {
                    tokio::select! {
                        code = &mut exit => {
                            this.on_start_exit(&session, code.unwrap_or(-1)).await;
                            return;
                        }
                        evt = ready.recv() => match evt {
                            Ok(evt) => this.on_server_ready(&session, evt).await,
                            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                tracing::warn!(skipped, "server-ready notifications lagged");
                            }
                            Err(broadcast::error::RecvError::Closed) => {
                                let code = (&mut exit).await.unwrap_or(-1);
                                this.on_start_exit(&session, code).await;
                                return;
                            }
                        },
                    }
                }
            }
            .instrument(span),
        );
    }

    async fn on_server_ready(&self, session: &SessionId, evt: ServerReady) {
        let applied = {
            let mut st = self.state.lock().await;
            let applied = st.machine.apply(
                session,
                RunEvent::ServerReady {
                    port: evt.port,
                    url: evt.url.clone(),
                },
            );
            if matches!(applied, Ok(Transition::Changed { .. } | Transition::Unchanged(_))) {
                self.preview.publish(&evt.url);
            }
            applied
        };

        match applied {
            Ok(Transition::Ignored) => {
                tracing::debug!(port = evt.port, "server-ready for superseded session")
            }
            Ok(_) => {
                self.log
                    .emit(format!("[livepane] server ready on port {} at {}", evt.port, evt.url))
                    .await;
            }
            Err(e) => tracing::debug!(error = %e, "server-ready ignored"),
        }
    }

    async fn on_start_exit(&self, session: &SessionId, code: i32) {
        let (applied, requested) = {
            let mut st = self.state.lock().await;
            let requested = st.machine.stop_requested();
            let applied = st.machine.apply(session, RunEvent::StartExit(code));
            if matches!(applied, Ok(Transition::Changed { .. } | Transition::Unchanged(_))) {
                st.start = None;
                self.preview.clear();
            }
            (applied, requested)
        };

        match applied {
            Ok(Transition::Ignored) => {
                self.log
                    .emit(format!("[livepane] previous start process exited with code {code}"))
                    .await;
            }
            Ok(_) => {
                self.log
                    .emit(format!("[livepane] start process exited with code {code}"))
                    .await;
                if requested {
                    tracing::info!(code, "start process stopped");
                } else {
                    tracing::warn!(code, "start process exited on its own");
                }
            }
            Err(e) => tracing::debug!(error = %e, code, "start exit ignored"),
        }
    }

    async fn fail(&self, session: &SessionId, failure: RunFailure) {
        let text = failure_message(failure.kind, &failure.message);
        tracing::error!(kind = ?failure.kind, error = %failure.message, "run failed");
        self.log.emit(format!("[livepane] {text}")).await;

        let mut st = self.state.lock().await;
        if !st.machine.is_current(session) {
            return;
        }
        let shown = RunFailure {
            kind: failure.kind,
            message: text.clone(),
        };
        if let Err(e) = st.machine.apply(session, RunEvent::Error(shown)) {
            tracing::debug!(error = %e, "failure not recorded");
        }
        if let Some(start) = st.start.take() {
            start.kill();
        }
        if let Err(e) = st.machine.apply(session, RunEvent::Reset) {
            tracing::debug!(error = %e, "reset after failure ignored");
        }
        st.push_notice(NoticeLevel::Error, text);
        self.preview.clear();
    }

    /// Kills the start process. Cleanup happens when its exit arrives.
    pub async fn stop(&self) -> bool {
        let mut st = self.state.lock().await;
        let Some(killer) = st.start.clone() else {
            return false;
        };
        if let Some(session) = st.machine.session().cloned()
            && let Err(e) = st.machine.apply(&session, RunEvent::Stop)
        {
            tracing::debug!(error = %e, "stop event ignored");
        }
        killer.kill();
        tracing::info!("stop requested");
        true
    }

    fn persist(&self, tree: FileTree) {
        if let Some(persister) = &self.persister {
            persister.persist(tree);
        }
    }

    /// Swaps in a new tree and mounts it if the runtime is up.
    pub async fn replace_tree(&self, tree: FileTree) -> Result<(), TreeError> {
        let tree = tree.normalized()?;
        {
            let mut st = self.state.lock().await;
            st.selected = tree.file_paths().into_iter().next();
            st.tree = tree.clone();
        }
        tracing::info!(files = tree.file_paths().len(), "file tree replaced");

        if let Some(runtime) = self.runtime.current().await
            && let Err(e) = runtime.mount(&tree).await
        {
            tracing::warn!(error = %e, "mount of updated file tree failed");
            self.notify(
                NoticeLevel::Warning,
                format!("Failed to mount updated files: {e}"),
            )
            .await;
        }
        Ok(())
    }

    pub async fn tree(&self) -> FileTree {
        self.state.lock().await.tree.clone()
    }

    pub async fn files(&self) -> Vec<String> {
        self.state.lock().await.tree.file_paths()
    }

    pub async fn file(&self, path: &str) -> Option<String> {
        self.state.lock().await.tree.file(path).map(str::to_string)
    }

    pub async fn selected_file(&self) -> Option<String> {
        self.state.lock().await.selected.clone()
    }

    pub async fn select_file(&self, path: &str) -> bool {
        let mut st = self.state.lock().await;
        if !st.tree.contains_file(path) {
            return false;
        }
        st.selected = Some(path.to_string());
        true
    }

    pub async fn edit_file(&self, path: &str, contents: String) -> Result<(), TreeError> {
        let tree = {
            let mut st = self.state.lock().await;
            st.tree.set_file(path, contents)?;
            st.tree.clone()
        };
        tracing::debug!(path, "file edited");
        self.persist(tree);
        Ok(())
    }

    pub async fn notify(&self, level: NoticeLevel, message: String) {
        self.state.lock().await.push_notice(level, message);
    }

    pub async fn notices(&self, after: u64) -> Vec<Notice> {
        let st = self.state.lock().await;
        st.notices.iter().filter(|n| n.id > after).cloned().collect()
    }

    pub async fn status(&self) -> RunStatus {
        let availability = self.availability().await;
        let runtime_error = match &availability {
            RuntimeAvailability::Errored(msg) => Some(msg.clone()),
            _ => None,
        };

        let st = self.state.lock().await;
        let phase = st.machine.phase();
        RunStatus {
            session_id: st.machine.session().cloned(),
            phase,
            label: run_label(&availability, phase).to_string(),
            can_run: gate_run(&availability, st.tree.is_empty(), phase).is_ok(),
            can_stop: st.start.is_some() && matches!(phase, RunPhase::Starting | RunPhase::Running),
            install_exit_code: st.machine.install_exit(),
            exit_code: st.machine.exit_code(),
            preview_url: self.preview.snapshot().published,
            preview_port: st.machine.endpoint().map(|e| e.port),
            last_failure: st.machine.last_failure().cloned(),
            failure_code: st
                .machine
                .last_failure()
                .map(|f| f.kind.code().to_string()),
            runtime_error,
            file_count: st.tree.file_paths().len(),
        }
    }
}
