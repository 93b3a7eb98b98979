use serde::Serialize;
use tokio::sync::watch;

/// What the preview pane shows.
///
/// `published` is the URL the running app announced; `address` is what
/// the frame points at, which the user may edit freely.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PreviewState {
    pub published: Option<String>,
    pub address: Option<String>,
}

#[derive(Clone)]
pub struct PreviewBridge {
    tx: watch::Sender<PreviewState>,
}

impl Default for PreviewBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl PreviewBridge {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(PreviewState::default());
        Self { tx }
    }

    pub fn publish(&self, url: &str) {
        tracing::info!(%url, "preview published");
        self.tx.send_replace(PreviewState {
            published: Some(url.to_string()),
            address: Some(url.to_string()),
        });
    }

    pub fn clear(&self) {
        self.tx.send_replace(PreviewState::default());
    }

    /// Points the frame somewhere else. No validation.
    pub fn navigate(&self, address: impl Into<String>) {
        let address = address.into();
        self.tx.send_modify(|st| st.address = Some(address));
    }

    pub fn snapshot(&self) -> PreviewState {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PreviewState> {
        self.tx.subscribe()
    }
}
