//! Environment preconditions for booting the sandbox runtime.
//!
//! The runtime needs a secure context and cross-origin isolation in the page
//! that hosts the preview. The agent derives its own view from config at
//! startup, and the browser can report the flags it actually observes
//! (`window.isSecureContext`, `window.crossOriginIsolated`) for an on-demand
//! diagnosis.

use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::config::AgentConfig;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostEnvironment {
    pub url: String,
    pub protocol: String,
    pub hostname: String,
    pub secure_context: bool,
    pub cross_origin_isolated: bool,
    pub user_agent: String,
}

/// Flags as reported by the browser UI.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportedEnvironment {
    pub url: String,
    pub is_secure_context: bool,
    pub cross_origin_isolated: bool,
    #[serde(default)]
    pub user_agent: String,
}

fn is_local_hostname(hostname: &str) -> bool {
    hostname.contains("localhost") || hostname.contains("127.0.0.1")
}

impl HostEnvironment {
    pub fn new(
        url: &str,
        secure_context: bool,
        cross_origin_isolated: bool,
        user_agent: &str,
    ) -> Self {
        let (protocol, hostname) = match Url::parse(url) {
            Ok(u) => (
                format!("{}:", u.scheme()),
                u.host_str().unwrap_or_default().to_string(),
            ),
            Err(_) => (String::new(), String::new()),
        };
        Self {
            url: url.to_string(),
            protocol,
            hostname,
            secure_context,
            cross_origin_isolated,
            user_agent: user_agent.to_string(),
        }
    }

    /// The agent's own view of the page it serves.
    ///
    /// Browsers treat `https:` and local hosts as secure contexts, and only
    /// grant cross-origin isolation to secure contexts that received the
    /// COOP/COEP headers. Explicit overrides win.
    pub fn from_config(cfg: &AgentConfig) -> Self {
        let probe = Self::new(&cfg.public_origin, false, false, &cfg.user_agent);
        let secure = cfg
            .secure_context
            .unwrap_or(probe.protocol == "https:" || probe.is_local());
        let isolated = cfg
            .cross_origin_isolated
            .unwrap_or(cfg.isolation_headers && secure);
        Self {
            secure_context: secure,
            cross_origin_isolated: isolated,
            ..probe
        }
    }

    pub fn is_local(&self) -> bool {
        is_local_hostname(&self.hostname)
    }
}

impl From<ReportedEnvironment> for HostEnvironment {
    fn from(r: ReportedEnvironment) -> Self {
        HostEnvironment::new(
            &r.url,
            r.is_secure_context,
            r.cross_origin_isolated,
            &r.user_agent,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OriginKind {
    LocalDevelopment,
    Vercel,
    Netlify,
    UnknownProduction,
}

impl OriginKind {
    pub fn classify(hostname: &str) -> Self {
        if is_local_hostname(hostname) {
            OriginKind::LocalDevelopment
        } else if hostname.contains("vercel.app") {
            OriginKind::Vercel
        } else if hostname.contains("netlify.app") {
            OriginKind::Netlify
        } else {
            OriginKind::UnknownProduction
        }
    }

    pub fn remediation(self) -> &'static str {
        match self {
            OriginKind::LocalDevelopment => {
                "Open the workspace on http://localhost (not 127.0.0.1) and keep LIVEPANE_ISOLATION_HEADERS enabled."
            }
            OriginKind::Vercel => {
                "Add Cross-Origin-Embedder-Policy: require-corp and Cross-Origin-Opener-Policy: same-origin to vercel.json, then redeploy."
            }
            OriginKind::Netlify => {
                "Add Cross-Origin-Embedder-Policy: require-corp and Cross-Origin-Opener-Policy: same-origin to the _headers file, then redeploy."
            }
            OriginKind::UnknownProduction => {
                "Serve the workspace over HTTPS with Cross-Origin-Embedder-Policy: require-corp and Cross-Origin-Opener-Policy: same-origin."
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BrowserEngine {
    Chrome,
    Edge,
    Firefox,
    Safari,
    Unknown,
}

impl BrowserEngine {
    pub fn detect(user_agent: &str) -> Self {
        // Edge and Chrome both advertise "Chrome"; Chrome also advertises "Safari".
        if user_agent.contains("Edg") {
            BrowserEngine::Edge
        } else if user_agent.contains("Firefox") {
            BrowserEngine::Firefox
        } else if user_agent.contains("Chrome") {
            BrowserEngine::Chrome
        } else if user_agent.contains("Safari") {
            BrowserEngine::Safari
        } else {
            BrowserEngine::Unknown
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum IssueKind {
    NotSecureContext,
    NotCrossOriginIsolated,
    InsecureTransport,
    LimitedBrowserSupport,
    UnsupportedBrowser,
    PlatformHint,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Issue {
    pub kind: IssueKind,
    pub severity: Severity,
    pub message: String,
}

impl Issue {
    fn new(kind: IssueKind, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            kind,
            severity,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PreconditionDiagnosis {
    pub environment: HostEnvironment,
    pub origin: OriginKind,
    pub browser: BrowserEngine,
    pub remediation: String,
    pub issues: Vec<Issue>,
    pub can_proceed: bool,
    pub checked_at: String,
}

impl PreconditionDiagnosis {
    pub fn has_issue(&self, kind: IssueKind) -> bool {
        self.issues.iter().any(|i| i.kind == kind)
    }
}

pub fn diagnose(env: &HostEnvironment) -> PreconditionDiagnosis {
    let origin = OriginKind::classify(&env.hostname);
    let browser = BrowserEngine::detect(&env.user_agent);
    let mut issues = Vec::new();

    if !env.secure_context {
        issues.push(Issue::new(
            IssueKind::NotSecureContext,
            Severity::Error,
            "Not in secure context (HTTPS or localhost required)",
        ));
    }
    if !env.cross_origin_isolated {
        issues.push(Issue::new(
            IssueKind::NotCrossOriginIsolated,
            Severity::Error,
            "crossOriginIsolated is false (COOP/COEP headers missing)",
        ));
    }
    if env.protocol != "https:" && !env.is_local() {
        issues.push(Issue::new(
            IssueKind::InsecureTransport,
            Severity::Error,
            "Not using HTTPS (required for production)",
        ));
    }

    // An empty user agent means the agent itself is diagnosing; there is no browser to judge.
    if !env.user_agent.is_empty() {
        match browser {
            BrowserEngine::Safari => issues.push(Issue::new(
                IssueKind::LimitedBrowserSupport,
                Severity::Warning,
                "Safari has limited sandbox support (use Chrome/Edge/Firefox)",
            )),
            BrowserEngine::Unknown => issues.push(Issue::new(
                IssueKind::UnsupportedBrowser,
                Severity::Warning,
                "Unsupported browser (use Chrome/Edge/Firefox)",
            )),
            _ => {}
        }
    }

    let platform_hint = match origin {
        OriginKind::Vercel => Some("Vercel deployment detected - check vercel.json configuration"),
        OriginKind::Netlify => Some("Netlify deployment detected - check _headers file"),
        OriginKind::UnknownProduction => {
            Some("Production deployment - cross-origin isolation headers may be missing")
        }
        OriginKind::LocalDevelopment => None,
    };
    if let Some(hint) = platform_hint {
        issues.push(Issue::new(IssueKind::PlatformHint, Severity::Info, hint));
    }

    let can_proceed = env.secure_context && env.cross_origin_isolated;

    if issues.is_empty() {
        tracing::info!(url = %env.url, "sandbox preconditions met");
    } else {
        for issue in &issues {
            tracing::debug!(kind = ?issue.kind, severity = ?issue.severity, "{}", issue.message);
        }
        tracing::info!(
            url = %env.url,
            issues = issues.len(),
            can_proceed,
            "sandbox preconditions diagnosed"
        );
    }

    PreconditionDiagnosis {
        environment: env.clone(),
        origin,
        browser,
        remediation: origin.remediation().to_string(),
        issues,
        can_proceed,
        checked_at: chrono::Utc::now().to_rfc3339(),
    }
}
