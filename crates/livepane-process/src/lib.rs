pub mod file_tree;

pub use file_tree::{FileNode, FileTree, TreeError};

/// Identifies one mount/install/start attempt.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum RunPhase {
    Idle,
    Mounting,
    EnsuringEntrypoint,
    Installing,
    Starting,
    Running,
    Stopped,
    Failed,
}

impl RunPhase {
    /// Between the Run action and the start process being spawned.
    pub fn is_in_flight(self) -> bool {
        matches!(
            self,
            RunPhase::Mounting
                | RunPhase::EnsuringEntrypoint
                | RunPhase::Installing
                | RunPhase::Starting
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum RunFailureKind {
    InstallFailed,
    NestedDirectoryMount,
    Mount,
    Spawn,
    Stream,
    Other,
}

impl RunFailureKind {
    pub fn code(self) -> &'static str {
        match self {
            RunFailureKind::InstallFailed => "install_failed",
            RunFailureKind::NestedDirectoryMount => "nested_directory_mount",
            RunFailureKind::Mount => "mount_failed",
            RunFailureKind::Spawn => "spawn_failed",
            RunFailureKind::Stream => "stream_failed",
            RunFailureKind::Other => "run_failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RunFailure {
    pub kind: RunFailureKind,
    pub message: String,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RunStatus {
    pub session_id: Option<SessionId>,
    pub phase: RunPhase,
    pub label: String,
    pub can_run: bool,
    pub can_stop: bool,
    pub install_exit_code: Option<i32>,
    pub exit_code: Option<i32>,
    pub preview_url: Option<String>,
    pub preview_port: Option<u16>,
    pub last_failure: Option<RunFailure>,
    pub failure_code: Option<String>,
    pub runtime_error: Option<String>,
    pub file_count: usize,
}
