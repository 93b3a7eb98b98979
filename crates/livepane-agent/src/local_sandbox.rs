//! Sandbox runtime that runs projects as local processes in a work
//! directory. One process group per spawned command.

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use livepane_process::{FileNode, FileTree};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    sync::{broadcast, mpsc, oneshot, watch},
};

use crate::config::AgentConfig;
use crate::sandbox::{
    ProcessKill, SandboxError, SandboxPlatform, SandboxProcess, SandboxRuntime, ServerReady,
};

pub struct LocalPlatform {
    work_dir: PathBuf,
    programs: Vec<String>,
    preview_host: String,
    probe_timeout: Duration,
    reserved_ports: Vec<u16>,
}

impl LocalPlatform {
    pub fn new(
        work_dir: PathBuf,
        programs: Vec<String>,
        preview_host: impl Into<String>,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            work_dir,
            programs,
            preview_host: preview_host.into(),
            probe_timeout,
            reserved_ports: Vec::new(),
        }
    }

    /// Ports that are never reported as the app's server, such as the
    /// agent's own listener.
    pub fn with_reserved_ports(mut self, ports: impl IntoIterator<Item = u16>) -> Self {
        self.reserved_ports = ports.into_iter().collect();
        self
    }

    pub fn from_config(cfg: &AgentConfig) -> Self {
        let mut programs = vec![cfg.install.program.clone()];
        if cfg.start.program != cfg.install.program {
            programs.push(cfg.start.program.clone());
        }
        Self::new(
            cfg.work_dir.clone(),
            programs,
            cfg.preview_host.clone(),
            cfg.port_probe_timeout,
        )
        .with_reserved_ports([cfg.listen_addr.port()])
    }
}

#[async_trait]
impl SandboxPlatform for LocalPlatform {
    fn name(&self) -> &str {
        "local"
    }

    async fn boot(&self) -> Result<Arc<dyn SandboxRuntime>, SandboxError> {
        tokio::fs::create_dir_all(&self.work_dir).await.map_err(|e| {
            SandboxError::Other(format!(
                "create work dir {}: {e}",
                self.work_dir.display()
            ))
        })?;
        let root = tokio::fs::canonicalize(&self.work_dir)
            .await
            .map_err(|e| SandboxError::Other(format!("resolve work dir: {e}")))?;

        for program in &self.programs {
            let resolved = which::which(program)
                .map_err(|e| SandboxError::Other(format!("{program} not found on PATH: {e}")))?;
            tracing::debug!(program, path = %resolved.display(), "resolved sandbox program");
        }

        let (ready_tx, _) = broadcast::channel(16);
        Ok(Arc::new(LocalRuntime {
            root,
            preview_host: self.preview_host.clone(),
            probe_timeout: self.probe_timeout,
            reserved_ports: self.reserved_ports.clone(),
            ready_tx,
        }))
    }
}

pub struct LocalRuntime {
    root: PathBuf,
    preview_host: String,
    probe_timeout: Duration,
    reserved_ports: Vec<u16>,
    ready_tx: broadcast::Sender<ServerReady>,
}

enum MountEntry {
    Dir(PathBuf),
    File(PathBuf, String),
}

fn valid_segment(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '\0'])
}

fn collect_entries(
    tree: &FileTree,
    dir: &Path,
    display: &str,
    out: &mut Vec<MountEntry>,
) -> Result<(), SandboxError> {
    for (name, node) in tree.iter() {
        let shown = if display.is_empty() {
            name.to_string()
        } else {
            format!("{display}/{name}")
        };
        if !valid_segment(name) {
            return Err(SandboxError::InvalidFileName(shown));
        }
        let path = dir.join(name);
        match node {
            FileNode::File { contents } => out.push(MountEntry::File(path, contents.clone())),
            FileNode::Directory(children) => {
                out.push(MountEntry::Dir(path.clone()));
                collect_entries(children, &path, &shown, out)?;
            }
        }
    }
    Ok(())
}

fn free_tcp_port() -> std::io::Result<u16> {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0))?;
    Ok(listener.local_addr()?.port())
}

/// Finds a port announced in a line of server output.
pub(crate) fn detect_port(line: &str) -> Option<u16> {
    let lower = line.to_ascii_lowercase();
    for marker in ["localhost:", "127.0.0.1:", "0.0.0.0:", "[::]:", "port ", "port:"] {
        let mut rest = lower.as_str();
        while let Some(idx) = rest.find(marker) {
            rest = &rest[idx + marker.len()..];
            let digits: String = rest
                .trim_start()
                .chars()
                .take_while(|c| c.is_ascii_digit())
                .collect();
            if let Ok(port) = digits.parse::<u16>()
                && port != 0
            {
                return Some(port);
            }
        }
    }
    None
}

/// Local ports in LISTEN state according to a `/proc/net/tcp{,6}` table.
fn parse_listening_ports(table: &str) -> impl Iterator<Item = u16> + '_ {
    table.lines().skip(1).filter_map(|line| {
        let mut cols = line.split_whitespace();
        let local = cols.nth(1)?;
        let state = cols.nth(1)?;
        if state != "0A" {
            return None;
        }
        let (_, port) = local.rsplit_once(':')?;
        u16::from_str_radix(port, 16).ok()
    })
}

#[cfg(target_os = "linux")]
async fn listening_ports() -> HashSet<u16> {
    let mut ports = HashSet::new();
    for table in ["/proc/net/tcp", "/proc/net/tcp6"] {
        if let Ok(s) = tokio::fs::read_to_string(table).await {
            ports.extend(parse_listening_ports(&s));
        }
    }
    ports
}

#[cfg(not(target_os = "linux"))]
async fn listening_ports() -> HashSet<u16> {
    HashSet::new()
}

#[cfg(target_os = "linux")]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    Ok(())
}

struct GroupKill {
    pgid: Option<i32>,
}

impl ProcessKill for GroupKill {
    fn kill(&self) {
        #[cfg(unix)]
        if let Some(pgid) = self.pgid {
            unsafe {
                libc::kill(-pgid, libc::SIGKILL);
            }
        }
    }
}

/// Drains one output pipe to EOF. Bytes that are not UTF-8 are replaced,
/// never treated as the end of the stream.
async fn pump_output<R: AsyncRead + Unpin>(
    reader: R,
    out_tx: mpsc::UnboundedSender<String>,
    port_tx: mpsc::UnboundedSender<u16>,
) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&buf);
                let line = text.trim_end_matches(['\n', '\r']).to_string();
                if let Some(p) = detect_port(&line) {
                    let _ = port_tx.send(p);
                }
                let _ = out_tx.send(line);
            }
            Err(e) => {
                tracing::debug!(error = %e, "read sandbox output failed");
                break;
            }
        }
    }
}

/// Polls the assigned port and any port the process announces until one
/// accepts a connection. Announced ports in `foreign` belong to someone
/// else and are skipped.
async fn wait_for_ready(
    assigned: u16,
    mut announced: mpsc::UnboundedReceiver<u16>,
    foreign: HashSet<u16>,
    mut exited: watch::Receiver<bool>,
    timeout: Duration,
) -> Option<u16> {
    let deadline = tokio::time::Instant::now() + timeout;
    let mut candidates = vec![assigned];
    loop {
        while let Ok(port) = announced.try_recv() {
            if foreign.contains(&port) {
                tracing::debug!(port, "ignoring announced port owned by another listener");
                continue;
            }
            if !candidates.contains(&port) {
                candidates.push(port);
            }
        }
        for &port in &candidates {
            if tokio::net::TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
                return Some(port);
            }
        }
        if *exited.borrow() || tokio::time::Instant::now() >= deadline {
            return None;
        }
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(250)) => {}
            _ = exited.changed() => {}
        }
    }
}

#[async_trait]
impl SandboxRuntime for LocalRuntime {
    async fn mount(&self, tree: &FileTree) -> Result<(), SandboxError> {
        let mut entries = Vec::new();
        collect_entries(tree, &self.root, "", &mut entries)?;

        for entry in entries {
            match entry {
                MountEntry::Dir(path) => {
                    tokio::fs::create_dir_all(&path).await.map_err(|e| {
                        SandboxError::Mount(format!("{}: {e}", path.display()))
                    })?;
                }
                MountEntry::File(path, contents) => {
                    if let Some(parent) = path.parent() {
                        tokio::fs::create_dir_all(parent).await.map_err(|e| {
                            SandboxError::Mount(format!("{}: {e}", parent.display()))
                        })?;
                    }
                    tokio::fs::write(&path, contents).await.map_err(|e| {
                        SandboxError::Mount(format!("{}: {e}", path.display()))
                    })?;
                }
            }
        }
        tracing::debug!(
            root = %self.root.display(),
            files = tree.file_paths().len(),
            "mounted file tree"
        );
        Ok(())
    }

    async fn spawn(&self, program: &str, args: &[String]) -> Result<SandboxProcess, SandboxError> {
        let port = free_tcp_port()
            .map_err(|e| SandboxError::Spawn(format!("allocate port: {e}")))?;
        let mut foreign = listening_ports().await;
        foreign.extend(self.reserved_ports.iter().copied());
        foreign.remove(&port);

        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args)
            .current_dir(&self.root)
            .env("PORT", port.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        #[cfg(unix)]
        {
            unsafe {
                cmd.pre_exec(|| {
                    set_parent_death_signal()?;
                    if libc::setsid() == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| SandboxError::Spawn(format!("{program}: {e}")))?;
        let pid = child.id();
        tracing::info!(program, ?pid, port, "spawned sandbox process");

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (port_tx, port_rx) = mpsc::unbounded_channel();

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump_output(stdout, out_tx.clone(), port_tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump_output(stderr, out_tx.clone(), port_tx.clone()));
        }
        drop(out_tx);
        drop(port_tx);

        let (exit_tx, exit_rx) = oneshot::channel();
        let (done_tx, done_rx) = watch::channel(false);
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status.code().unwrap_or(-1),
                Err(e) => {
                    tracing::warn!(error = %e, "wait for sandbox process failed");
                    -1
                }
            };
            tracing::info!(?pid, code, "sandbox process exited");
            let _ = done_tx.send(true);
            let _ = exit_tx.send(code);
        });

        let ready_tx = self.ready_tx.clone();
        let host = self.preview_host.clone();
        let timeout = self.probe_timeout;
        tokio::spawn(async move {
            match wait_for_ready(port, port_rx, foreign, done_rx, timeout).await {
                Some(open) => {
                    let url = format!("http://{host}:{open}");
                    tracing::info!(port = open, %url, "sandbox server ready");
                    let _ = ready_tx.send(ServerReady { port: open, url });
                }
                None => tracing::debug!(port, "no listening port observed for sandbox process"),
            }
        });

        Ok(SandboxProcess {
            output: out_rx,
            exit: exit_rx,
            killer: Arc::new(GroupKill {
                pgid: pid.map(|p| p as i32),
            }),
        })
    }

    fn subscribe_server_ready(&self) -> broadcast::Receiver<ServerReady> {
        self.ready_tx.subscribe()
    }
}
