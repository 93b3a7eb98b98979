use std::sync::Arc;

use reqwest::Url;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};

use crate::environment::{HostEnvironment, OriginKind};
use crate::sandbox::{BootErrorKind, SandboxPlatform, SandboxRuntime, classify_boot};

/// A recorded boot failure with a message the user can act on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[error("{message}")]
pub struct BootError {
    pub kind: BootErrorKind,
    pub message: String,
}

fn local_origin(env: &HostEnvironment) -> String {
    let port = Url::parse(&env.url)
        .ok()
        .and_then(|u| u.port_or_known_default());
    match port {
        Some(p) => format!("http://localhost:{p}"),
        None => "http://localhost".to_string(),
    }
}

pub fn boot_error_message(kind: BootErrorKind, raw: &str, env: &HostEnvironment) -> String {
    match kind {
        BootErrorKind::SharedArrayBufferUnsupported => {
            let mut msg =
                String::from("The sandbox runtime requires SharedArrayBuffer support.\n\n");
            if env.is_local() {
                msg.push_str("You are on localhost but still getting this error.\n\n");
                msg.push_str("SOLUTIONS:\n");
                msg.push_str(&format!("1. Use {} (not 127.0.0.1)\n", local_origin(env)));
                msg.push_str("2. Restart the agent with LIVEPANE_ISOLATION_HEADERS=true\n");
                msg.push_str("3. Clear browser cache and try again");
            } else {
                let origin = OriginKind::classify(&env.hostname);
                msg.push_str("You are not on localhost.\n\n");
                msg.push_str("SOLUTIONS:\n");
                msg.push_str("1. Use localhost for development\n");
                msg.push_str(&format!(
                    "2. Or redeploy with cross-origin isolation headers: {}\n",
                    origin.remediation()
                ));
                msg.push_str("3. Check the COOP/COEP response headers in the Network tab");
            }
            msg
        }
        BootErrorKind::SecureContextRequired => {
            "The sandbox runtime requires HTTPS or localhost. Please use a secure connection."
                .to_string()
        }
        BootErrorKind::Unknown => format!("Sandbox initialization failed: {raw}"),
    }
}

#[derive(Default)]
struct HandleState {
    runtime: Option<Arc<dyn SandboxRuntime>>,
    last_error: Option<BootError>,
    booting: bool,
}

/// Owns the single sandbox runtime of this agent.
///
/// Boots lazily, at most one boot at a time. A failure sticks until
/// [`RuntimeHandle::reset`]; success clears it.
pub struct RuntimeHandle {
    platform: Arc<dyn SandboxPlatform>,
    env: HostEnvironment,
    state: RwLock<HandleState>,
    boot_gate: Mutex<()>,
}

impl RuntimeHandle {
    pub fn new(platform: Arc<dyn SandboxPlatform>, env: HostEnvironment) -> Self {
        Self {
            platform,
            env,
            state: RwLock::new(HandleState::default()),
            boot_gate: Mutex::new(()),
        }
    }

    pub fn environment(&self) -> &HostEnvironment {
        &self.env
    }

    pub async fn boot(&self) -> Result<Arc<dyn SandboxRuntime>, BootError> {
        if let Some(cached) = self.cached().await {
            return cached;
        }

        // Callers that lost the race wait here and then see the cached outcome.
        let _gate = self.boot_gate.lock().await;
        if let Some(cached) = self.cached().await {
            return cached;
        }

        self.state.write().await.booting = true;
        let result = self.boot_once().await;

        let mut st = self.state.write().await;
        st.booting = false;
        match result {
            Ok(runtime) => {
                st.runtime = Some(runtime.clone());
                st.last_error = None;
                Ok(runtime)
            }
            Err(err) => {
                st.last_error = Some(err.clone());
                Err(err)
            }
        }
    }

    async fn cached(&self) -> Option<Result<Arc<dyn SandboxRuntime>, BootError>> {
        let st = self.state.read().await;
        if let Some(rt) = &st.runtime {
            return Some(Ok(rt.clone()));
        }
        st.last_error.clone().map(Err)
    }

    async fn boot_once(&self) -> Result<Arc<dyn SandboxRuntime>, BootError> {
        if !self.env.secure_context {
            let kind = BootErrorKind::SecureContextRequired;
            let message = boot_error_message(kind, "not a secure context", &self.env);
            tracing::error!(
                url = %self.env.url,
                "refusing to boot sandbox outside a secure context"
            );
            return Err(BootError { kind, message });
        }

        if !self.env.cross_origin_isolated {
            let origin = OriginKind::classify(&self.env.hostname);
            tracing::warn!(
                url = %self.env.url,
                ?origin,
                hint = origin.remediation(),
                "sandbox may not work without cross-origin isolation"
            );
        }

        tracing::info!(platform = self.platform.name(), "booting sandbox runtime");
        match self.platform.boot().await {
            Ok(runtime) => {
                tracing::info!(platform = self.platform.name(), "sandbox runtime booted");
                Ok(runtime)
            }
            Err(err) => {
                let kind = classify_boot(&err);
                let message = boot_error_message(kind, &err.to_string(), &self.env);
                tracing::error!(error = %err, ?kind, "sandbox runtime boot failed");
                Err(BootError { kind, message })
            }
        }
    }

    pub async fn current(&self) -> Option<Arc<dyn SandboxRuntime>> {
        self.state.read().await.runtime.clone()
    }

    pub async fn last_error(&self) -> Option<BootError> {
        self.state.read().await.last_error.clone()
    }

    pub async fn is_available(&self) -> bool {
        self.state.read().await.runtime.is_some()
    }

    pub async fn is_booting(&self) -> bool {
        self.state.read().await.booting
    }

    /// Back to "not yet booted": forgets both the runtime and any failure.
    pub async fn reset(&self) {
        let mut st = self.state.write().await;
        st.runtime = None;
        st.last_error = None;
    }

    pub async fn retry(&self) -> Result<Arc<dyn SandboxRuntime>, BootError> {
        tracing::info!("retrying sandbox runtime boot");
        self.reset().await;
        self.boot().await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures_util::future::join_all;

    use super::*;
    use crate::sandbox::SandboxError;
    use crate::testing::FakePlatform;

    fn env(url: &str, secure: bool, isolated: bool) -> HostEnvironment {
        HostEnvironment::new(url, secure, isolated, "")
    }

    #[tokio::test]
    async fn concurrent_boots_invoke_platform_once() {
        let platform = Arc::new(FakePlatform::ok().with_delay(Duration::from_millis(50)));
        let handle = Arc::new(RuntimeHandle::new(
            platform.clone(),
            env("http://localhost:8787", true, true),
        ));

        let calls = (0..8).map(|_| {
            let handle = handle.clone();
            async move { handle.boot().await }
        });
        let results = join_all(calls).await;

        assert_eq!(platform.boot_count(), 1);
        let first = results[0].as_ref().unwrap().clone();
        for r in &results {
            assert!(Arc::ptr_eq(r.as_ref().unwrap(), &first));
        }
        assert!(handle.is_available().await);
    }

    #[tokio::test]
    async fn concurrent_boots_share_one_failure() {
        let platform = Arc::new(
            FakePlatform::failing(SandboxError::Other("boom".into()))
                .with_delay(Duration::from_millis(20)),
        );
        let handle = Arc::new(RuntimeHandle::new(
            platform.clone(),
            env("http://localhost:8787", true, true),
        ));

        let calls = (0..4).map(|_| {
            let handle = handle.clone();
            async move { handle.boot().await }
        });
        let results = join_all(calls).await;

        assert_eq!(platform.boot_count(), 1);
        let first = results[0].clone().err().unwrap();
        assert_eq!(first.kind, BootErrorKind::Unknown);
        assert!(first.message.contains("boom"));
        for r in results {
            assert_eq!(r.err(), Some(first.clone()));
        }
    }

    #[tokio::test]
    async fn insecure_context_fails_without_booting() {
        let platform = Arc::new(FakePlatform::ok());
        let handle = RuntimeHandle::new(platform.clone(), env("http://example.com", false, false));

        let err = handle.boot().await.err().unwrap();
        assert_eq!(err.kind, BootErrorKind::SecureContextRequired);
        assert!(err.message.contains("HTTPS or localhost"));
        assert_eq!(platform.boot_count(), 0);
        assert_eq!(handle.last_error().await, Some(err));
    }

    #[tokio::test]
    async fn missing_isolation_still_attempts_boot() {
        let platform = Arc::new(FakePlatform::ok());
        let handle = RuntimeHandle::new(platform.clone(), env("https://x.vercel.app", true, false));
        assert!(handle.boot().await.is_ok());
        assert_eq!(platform.boot_count(), 1);
    }

    #[tokio::test]
    async fn shared_array_buffer_on_localhost_gets_local_steps() {
        let platform = Arc::new(FakePlatform::failing(SandboxError::Other(
            "SharedArrayBuffer is not defined".into(),
        )));
        let handle = RuntimeHandle::new(platform, env("http://localhost:5173/", true, false));

        let err = handle.boot().await.err().unwrap();
        assert_eq!(err.kind, BootErrorKind::SharedArrayBufferUnsupported);
        assert!(err.message.contains("You are on localhost"));
        assert!(err.message.contains("http://localhost:5173 (not 127.0.0.1)"));
        assert!(!err.message.contains("You are not on localhost"));
    }

    #[tokio::test]
    async fn shared_array_buffer_remote_gets_deploy_steps() {
        let platform = Arc::new(FakePlatform::failing(
            SandboxError::SharedArrayBufferUnsupported("no isolation".into()),
        ));
        let handle = RuntimeHandle::new(platform, env("https://site.netlify.app", true, false));

        let err = handle.boot().await.err().unwrap();
        assert!(err.message.contains("You are not on localhost"));
        assert!(err.message.contains("_headers"));
    }

    #[tokio::test]
    async fn failure_sticks_until_retry() {
        let platform = Arc::new(FakePlatform::failing(SandboxError::Other("flaky".into())));
        let handle = RuntimeHandle::new(platform.clone(), env("http://localhost:8787", true, true));

        assert!(handle.boot().await.is_err());
        assert!(handle.boot().await.is_err());
        assert_eq!(platform.boot_count(), 1);

        platform.succeed_next();
        let rt = handle.retry().await;
        assert!(rt.is_ok());
        assert_eq!(platform.boot_count(), 2);
        assert!(handle.last_error().await.is_none());
        assert!(handle.is_available().await);
    }
}
