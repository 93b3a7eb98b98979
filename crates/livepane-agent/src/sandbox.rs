//! The seam between the agent and a sandbox runtime implementation.
//!
//! A platform boots at most one runtime; the runtime mounts file trees,
//! spawns processes against them and announces listening ports.

use std::sync::Arc;

use async_trait::async_trait;
use livepane_process::{FileTree, RunFailureKind};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot};

/// A process inside the sandbox opened a listening port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerReady {
    pub port: u16,
    pub url: String,
}

pub trait ProcessKill: Send + Sync {
    fn kill(&self);
}

/// Handle to a spawned sandbox process.
///
/// `exit` resolves with the exit code (`-1` when the process was killed by a
/// signal). Output lines arrive on `output` until the process closes its
/// streams.
pub struct SandboxProcess {
    pub output: mpsc::UnboundedReceiver<String>,
    pub exit: oneshot::Receiver<i32>,
    pub killer: Arc<dyn ProcessKill>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SandboxError {
    #[error("SharedArrayBuffer is not available: {0}")]
    SharedArrayBufferUnsupported(String),
    #[error("sandbox requires a secure context: {0}")]
    SecureContextRequired(String),
    #[error("EIO: invalid file name: {0}")]
    InvalidFileName(String),
    #[error("mount failed: {0}")]
    Mount(String),
    #[error("spawn failed: {0}")]
    Spawn(String),
    #[error("output stream failed: {0}")]
    Stream(String),
    #[error("{0}")]
    Other(String),
}

#[async_trait]
pub trait SandboxPlatform: Send + Sync {
    fn name(&self) -> &str;

    async fn boot(&self) -> Result<Arc<dyn SandboxRuntime>, SandboxError>;
}

#[async_trait]
pub trait SandboxRuntime: Send + Sync {
    async fn mount(&self, tree: &FileTree) -> Result<(), SandboxError>;

    async fn spawn(&self, program: &str, args: &[String]) -> Result<SandboxProcess, SandboxError>;

    fn subscribe_server_ready(&self) -> broadcast::Receiver<ServerReady>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BootErrorKind {
    SharedArrayBufferUnsupported,
    SecureContextRequired,
    Unknown,
}

impl BootErrorKind {
    pub fn code(self) -> &'static str {
        match self {
            BootErrorKind::SharedArrayBufferUnsupported => "shared_array_buffer_unsupported",
            BootErrorKind::SecureContextRequired => "secure_context_required",
            BootErrorKind::Unknown => "boot_failed",
        }
    }
}

// Runtimes that only hand back free-form messages are classified here and
// nowhere else.

pub fn classify_boot(err: &SandboxError) -> BootErrorKind {
    match err {
        SandboxError::SharedArrayBufferUnsupported(_) => {
            BootErrorKind::SharedArrayBufferUnsupported
        }
        SandboxError::SecureContextRequired(_) => BootErrorKind::SecureContextRequired,
        SandboxError::Other(msg) if msg.contains("SharedArrayBuffer") => {
            BootErrorKind::SharedArrayBufferUnsupported
        }
        SandboxError::Other(msg) if msg.to_ascii_lowercase().contains("secure context") => {
            BootErrorKind::SecureContextRequired
        }
        _ => BootErrorKind::Unknown,
    }
}

pub fn classify_run(err: &SandboxError) -> RunFailureKind {
    match err {
        SandboxError::InvalidFileName(_) => RunFailureKind::NestedDirectoryMount,
        SandboxError::Mount(_) => RunFailureKind::Mount,
        SandboxError::Spawn(_) => RunFailureKind::Spawn,
        SandboxError::Stream(_) => RunFailureKind::Stream,
        SandboxError::Other(msg) => {
            if msg.contains("EIO: invalid file name") {
                RunFailureKind::NestedDirectoryMount
            } else if msg.contains("mount") {
                RunFailureKind::Mount
            } else if msg.contains("spawn") {
                RunFailureKind::Spawn
            } else if msg.contains("ReadableStream") || msg.contains("stream") {
                RunFailureKind::Stream
            } else {
                RunFailureKind::Other
            }
        }
        SandboxError::SharedArrayBufferUnsupported(_) | SandboxError::SecureContextRequired(_) => {
            RunFailureKind::Other
        }
    }
}
