//! Pure state machine behind the Run/Stop controls.
//!
//! The machine owns no processes. The controller feeds it events tagged
//! with the session they belong to; events for any other session are
//! dropped so late exits of a superseded run never touch current state.

use livepane_process::{RunFailure, RunFailureKind, RunPhase, SessionId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunEvent {
    Run,
    MountDone,
    EntrypointReady,
    InstallExit(i32),
    StartSpawned,
    ServerReady { port: u16, url: String },
    StartExit(i32),
    Stop,
    Error(RunFailure),
    Reset,
}

impl RunEvent {
    fn name(&self) -> &'static str {
        match self {
            RunEvent::Run => "run",
            RunEvent::MountDone => "mount_done",
            RunEvent::EntrypointReady => "entrypoint_ready",
            RunEvent::InstallExit(_) => "install_exit",
            RunEvent::StartSpawned => "start_spawned",
            RunEvent::ServerReady { .. } => "server_ready",
            RunEvent::StartExit(_) => "start_exit",
            RunEvent::Stop => "stop",
            RunEvent::Error(_) => "error",
            RunEvent::Reset => "reset",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Changed { from: RunPhase, to: RunPhase },
    Unchanged(RunPhase),
    /// The event belonged to a session that is no longer current.
    Ignored,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("event {event} is not valid in phase {phase:?}")]
pub struct InvalidTransition {
    pub phase: RunPhase,
    pub event: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub port: u16,
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct RunMachine {
    session: Option<SessionId>,
    phase: RunPhase,
    install_exit: Option<i32>,
    exit_code: Option<i32>,
    endpoint: Option<Endpoint>,
    last_failure: Option<RunFailure>,
    stop_requested: bool,
}

impl Default for RunMachine {
    fn default() -> Self {
        Self {
            session: None,
            phase: RunPhase::Idle,
            install_exit: None,
            exit_code: None,
            endpoint: None,
            last_failure: None,
            stop_requested: false,
        }
    }
}

impl RunMachine {
    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    pub fn session(&self) -> Option<&SessionId> {
        self.session.as_ref()
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    pub fn install_exit(&self) -> Option<i32> {
        self.install_exit
    }

    pub fn endpoint(&self) -> Option<&Endpoint> {
        self.endpoint.as_ref()
    }

    pub fn last_failure(&self) -> Option<&RunFailure> {
        self.last_failure.as_ref()
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_requested
    }

    pub fn is_current(&self, session: &SessionId) -> bool {
        self.session.as_ref() == Some(session)
    }

    pub fn apply(
        &mut self,
        session: &SessionId,
        event: RunEvent,
    ) -> Result<Transition, InvalidTransition> {
        use RunPhase::*;

        if !matches!(event, RunEvent::Run) && !self.is_current(session) {
            return Ok(Transition::Ignored);
        }

        let from = self.phase;
        let invalid = || InvalidTransition {
            phase: from,
            event: event.name(),
        };

        let to = match (&event, from) {
            (RunEvent::Run, Idle | Stopped | Running) => {
                self.session = Some(session.clone());
                self.install_exit = None;
                self.exit_code = None;
                self.endpoint = None;
                self.last_failure = None;
                self.stop_requested = false;
                Mounting
            }
            (RunEvent::MountDone, Mounting) => EnsuringEntrypoint,
            (RunEvent::EntrypointReady, EnsuringEntrypoint) => Installing,
            (RunEvent::InstallExit(code), Installing) => {
                self.install_exit = Some(*code);
                if *code == 0 {
                    Starting
                } else {
                    self.last_failure = Some(RunFailure {
                        kind: RunFailureKind::InstallFailed,
                        message: format!("dependency install exited with code {code}"),
                    });
                    Failed
                }
            }
            (RunEvent::StartSpawned, Starting) => Starting,
            (RunEvent::ServerReady { port, url }, Starting | Running) => {
                self.endpoint = Some(Endpoint {
                    port: *port,
                    url: url.clone(),
                });
                Running
            }
            (RunEvent::StartExit(code), Starting | Running) => {
                self.exit_code = Some(*code);
                self.endpoint = None;
                Stopped
            }
            (RunEvent::Stop, Starting | Running) => {
                self.stop_requested = true;
                from
            }
            (RunEvent::Error(failure), p) if p != Idle => {
                self.last_failure = Some(failure.clone());
                self.endpoint = None;
                Failed
            }
            (RunEvent::Reset, Failed | Stopped) => {
                self.session = None;
                self.endpoint = None;
                Idle
            }
            _ => return Err(invalid()),
        };

        self.phase = to;
        if from == to {
            Ok(Transition::Unchanged(to))
        } else {
            Ok(Transition::Changed { from, to })
        }
    }
}

/// What the Run control knows about the sandbox runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeAvailability {
    Booting,
    NotBooted,
    Ready,
    Errored(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RunRejected {
    #[error("The sandbox runtime is still initializing. Please wait a moment and try again.")]
    StillInitializing,
    #[error("The sandbox runtime is not available due to an error: {0}\n\nPlease try the retry button or check your browser settings.")]
    RuntimeErrored(String),
    #[error("The sandbox runtime is not ready yet. Please wait a moment and try again.")]
    RuntimeNotReady,
    #[error("No files to run. Please ask AI to create a project first.")]
    EmptyTree,
    #[error("A run is already in progress.")]
    InFlight,
}

impl RunRejected {
    pub fn code(&self) -> &'static str {
        match self {
            RunRejected::StillInitializing => "runtime_initializing",
            RunRejected::RuntimeErrored(_) => "runtime_error",
            RunRejected::RuntimeNotReady => "runtime_not_ready",
            RunRejected::EmptyTree => "empty_tree",
            RunRejected::InFlight => "run_in_flight",
        }
    }
}

pub fn gate_run(
    runtime: &RuntimeAvailability,
    tree_empty: bool,
    phase: RunPhase,
) -> Result<(), RunRejected> {
    match runtime {
        RuntimeAvailability::Errored(msg) => return Err(RunRejected::RuntimeErrored(msg.clone())),
        RuntimeAvailability::Booting => return Err(RunRejected::StillInitializing),
        RuntimeAvailability::NotBooted => return Err(RunRejected::RuntimeNotReady),
        RuntimeAvailability::Ready => {}
    }
    if tree_empty {
        return Err(RunRejected::EmptyTree);
    }
    if phase.is_in_flight() {
        return Err(RunRejected::InFlight);
    }
    Ok(())
}

pub fn run_label(runtime: &RuntimeAvailability, phase: RunPhase) -> &'static str {
    match runtime {
        RuntimeAvailability::Errored(_) => "Runtime Error",
        RuntimeAvailability::Booting | RuntimeAvailability::NotBooted => "Initializing...",
        RuntimeAvailability::Ready if phase.is_in_flight() => "Starting...",
        RuntimeAvailability::Ready if phase == RunPhase::Running => "Running...",
        RuntimeAvailability::Ready => "Run",
    }
}
