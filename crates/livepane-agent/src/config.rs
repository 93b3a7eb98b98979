use std::{net::SocketAddr, path::PathBuf, time::Duration};

use anyhow::Context;

const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8787";
const DEFAULT_PUBLIC_ORIGIN: &str = "http://localhost:8787";
const DEFAULT_WORK_DIR: &str = ".livepane/work";
const DEFAULT_INSTALL_CMD: &str = "npm install";
const DEFAULT_START_CMD: &str = "npm start";
const DEFAULT_LOG_MAX_LINES: usize = 1000;
const DEFAULT_PORT_PROBE_TIMEOUT_MS: u64 = 90_000;

/// A program plus arguments, parsed from a whitespace separated string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn parse(raw: &str) -> Option<Self> {
        let mut parts = raw.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self {
            program,
            args: parts.collect(),
        })
    }

    pub fn display(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub listen_addr: SocketAddr,
    pub public_origin: String,
    pub work_dir: PathBuf,
    pub api_url: Option<String>,
    pub chat_ws_url: Option<String>,
    pub token: Option<String>,
    pub project_id: Option<String>,
    pub install: CommandSpec,
    pub start: CommandSpec,
    pub preview_host: String,
    pub port_probe_timeout: Duration,
    pub log_max_lines: usize,
    pub isolation_headers: bool,
    pub secure_context: Option<bool>,
    pub cross_origin_isolated: Option<bool>,
    pub user_agent: String,
    pub log_dir: Option<PathBuf>,
}

struct Vars<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Vars<F> {
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn u64(&self, name: &str) -> Option<u64> {
        self.string(name).and_then(|v| v.parse::<u64>().ok())
    }

    fn usize(&self, name: &str) -> Option<usize> {
        self.string(name).and_then(|v| v.parse::<usize>().ok())
    }

    fn flag(&self, name: &str) -> Option<bool> {
        let v = self.string(name)?.to_ascii_lowercase();
        match v.as_str() {
            "1" | "true" | "yes" | "on" => Some(true),
            "0" | "false" | "no" | "off" => Some(false),
            _ => None,
        }
    }
}

impl AgentConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let vars = Vars { lookup };

        let listen_raw = vars
            .string("LIVEPANE_LISTEN_ADDR")
            .unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_string());
        let listen_addr: SocketAddr = listen_raw
            .parse()
            .with_context(|| format!("invalid LIVEPANE_LISTEN_ADDR: {listen_raw}"))?;

        let install = match vars.string("LIVEPANE_INSTALL_CMD") {
            Some(raw) => CommandSpec::parse(&raw)
                .with_context(|| format!("invalid LIVEPANE_INSTALL_CMD: {raw}"))?,
            None => CommandSpec::parse(DEFAULT_INSTALL_CMD).context("default install command")?,
        };
        let start = match vars.string("LIVEPANE_START_CMD") {
            Some(raw) => CommandSpec::parse(&raw)
                .with_context(|| format!("invalid LIVEPANE_START_CMD: {raw}"))?,
            None => CommandSpec::parse(DEFAULT_START_CMD).context("default start command")?,
        };

        let port_probe_timeout = Duration::from_millis(
            vars.u64("LIVEPANE_PORT_PROBE_TIMEOUT_MS")
                .map(|v| v.clamp(1000, 10 * 60 * 1000))
                .unwrap_or(DEFAULT_PORT_PROBE_TIMEOUT_MS),
        );
        let log_max_lines = vars
            .usize("LIVEPANE_LOG_MAX_LINES")
            .map(|v| v.clamp(100, 50_000))
            .unwrap_or(DEFAULT_LOG_MAX_LINES);

        Ok(Self {
            listen_addr,
            public_origin: vars
                .string("LIVEPANE_PUBLIC_ORIGIN")
                .unwrap_or_else(|| DEFAULT_PUBLIC_ORIGIN.to_string()),
            work_dir: vars
                .string("LIVEPANE_WORK_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_WORK_DIR)),
            api_url: vars
                .string("LIVEPANE_API_URL")
                .map(|v| v.trim_end_matches('/').to_string()),
            chat_ws_url: vars.string("LIVEPANE_CHAT_WS_URL"),
            token: vars.string("LIVEPANE_TOKEN"),
            project_id: vars.string("LIVEPANE_PROJECT_ID"),
            install,
            start,
            preview_host: vars
                .string("LIVEPANE_PREVIEW_HOST")
                .unwrap_or_else(|| "localhost".to_string()),
            port_probe_timeout,
            log_max_lines,
            isolation_headers: vars.flag("LIVEPANE_ISOLATION_HEADERS").unwrap_or(true),
            secure_context: vars.flag("LIVEPANE_SECURE_CONTEXT"),
            cross_origin_isolated: vars.flag("LIVEPANE_CROSS_ORIGIN_ISOLATED"),
            user_agent: vars.string("LIVEPANE_USER_AGENT").unwrap_or_default(),
            log_dir: vars.string("LIVEPANE_LOG_DIR").map(PathBuf::from),
        })
    }
}
