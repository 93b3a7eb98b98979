//! Client for the project service that owns the persisted file tree.

use std::{sync::Arc, time::Duration};

use anyhow::Context;
use async_trait::async_trait;
use livepane_process::FileTree;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

#[async_trait]
pub trait TreeStore: Send + Sync {
    async fn save_tree(&self, tree: &FileTree) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Deserialize)]
pub struct Project {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "fileTree", default)]
    pub file_tree: Option<FileTree>,
}

#[derive(Deserialize)]
struct ProjectEnvelope {
    project: Project,
}

#[derive(Serialize)]
struct UpdateFileTree<'a> {
    #[serde(rename = "projectId")]
    project_id: &'a str,
    #[serde(rename = "fileTree")]
    file_tree: &'a FileTree,
}

#[derive(Clone)]
pub struct ProjectClient {
    http: reqwest::Client,
    base_url: String,
    project_id: String,
    token: Option<String>,
}

impl ProjectClient {
    pub fn new(
        base_url: impl Into<String>,
        project_id: impl Into<String>,
        token: Option<String>,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent("livepane-agent")
            .timeout(Duration::from_secs(30))
            .build()
            .context("build http client")?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            project_id: project_id.into(),
            token,
        })
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    pub async fn fetch_project(&self) -> anyhow::Result<Project> {
        let url = format!("{}/projects/get-project/{}", self.base_url, self.project_id);
        let resp = self
            .authorize(self.http.get(&url))
            .send()
            .await
            .with_context(|| format!("GET {url}"))?
            .error_for_status()
            .with_context(|| format!("GET {url}"))?;
        let body: ProjectEnvelope = resp.json().await.context("decode project response")?;
        Ok(body.project)
    }

    pub async fn update_file_tree(&self, tree: &FileTree) -> anyhow::Result<()> {
        let url = format!("{}/projects/update-file-tree", self.base_url);
        self.authorize(self.http.put(&url))
            .json(&UpdateFileTree {
                project_id: &self.project_id,
                file_tree: tree,
            })
            .send()
            .await
            .with_context(|| format!("PUT {url}"))?
            .error_for_status()
            .with_context(|| format!("PUT {url}"))?;
        Ok(())
    }
}

#[async_trait]
impl TreeStore for ProjectClient {
    async fn save_tree(&self, tree: &FileTree) -> anyhow::Result<()> {
        self.update_file_tree(tree).await
    }
}

/// Writes trees in the background, one request at a time.
///
/// Trees queued while a write is in flight collapse into the newest one.
#[derive(Clone)]
pub struct TreePersister {
    tx: watch::Sender<Option<FileTree>>,
}

impl TreePersister {
    pub fn spawn(store: Arc<dyn TreeStore>) -> Self {
        let (tx, mut rx) = watch::channel::<Option<FileTree>>(None);
        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let Some(tree) = rx.borrow_and_update().clone() else {
                    continue;
                };
                match store.save_tree(&tree).await {
                    Ok(()) => {
                        tracing::debug!(files = tree.file_paths().len(), "file tree persisted")
                    }
                    Err(e) => tracing::warn!(error = %e, "persist file tree failed"),
                }
            }
        });
        Self { tx }
    }

    pub fn persist(&self, tree: FileTree) {
        self.tx.send_replace(Some(tree));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use axum::{
        Json, Router,
        extract::{Path, State},
        http::HeaderMap,
        routing::{get, put},
    };

    use super::*;

    #[derive(Default)]
    struct Recorded {
        puts: Mutex<Vec<serde_json::Value>>,
        auth: Mutex<Vec<String>>,
    }

    async fn serve(recorded: Arc<Recorded>) -> String {
        async fn get_project(
            State(rec): State<Arc<Recorded>>,
            headers: HeaderMap,
            Path(id): Path<String>,
        ) -> Json<serde_json::Value> {
            if let Some(v) = headers.get("authorization") {
                rec.auth.lock().unwrap().push(v.to_str().unwrap().to_string());
            }
            Json(serde_json::json!({
                "project": {
                    "_id": id,
                    "name": "demo",
                    "fileTree": {
                        "server.js": {"file": {"contents": "a"}},
                        "app.js": {"file": {"contents": "b"}}
                    }
                }
            }))
        }

        async fn update_tree(
            State(rec): State<Arc<Recorded>>,
            Json(body): Json<serde_json::Value>,
        ) -> Json<serde_json::Value> {
            rec.puts.lock().unwrap().push(body);
            Json(serde_json::json!({"ok": true}))
        }

        let app = Router::new()
            .route("/projects/get-project/:id", get(get_project))
            .route("/projects/update-file-tree", put(update_tree))
            .with_state(recorded);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn fetches_project_tree_in_order() {
        let rec = Arc::new(Recorded::default());
        let base = serve(rec.clone()).await;
        let client = ProjectClient::new(base, "p1", Some("tok".into())).unwrap();

        let project = client.fetch_project().await.unwrap();
        assert_eq!(project.id, "p1");
        assert_eq!(project.name, "demo");
        let tree = project.file_tree.unwrap();
        assert_eq!(tree.file_paths(), vec!["server.js", "app.js"]);
        assert_eq!(rec.auth.lock().unwrap().as_slice(), ["Bearer tok"]);
    }

    #[tokio::test]
    async fn puts_tree_with_project_id() {
        let rec = Arc::new(Recorded::default());
        let base = serve(rec.clone()).await;
        let client = ProjectClient::new(format!("{base}/"), "p1", None).unwrap();

        let mut tree = FileTree::new();
        tree.set_file("src/index.js", "x").unwrap();
        client.update_file_tree(&tree).await.unwrap();

        let puts = rec.puts.lock().unwrap();
        assert_eq!(puts.len(), 1);
        assert_eq!(puts[0]["projectId"], "p1");
        assert_eq!(puts[0]["fileTree"]["src"]["index.js"]["file"]["contents"], "x");
    }

    struct SlowStore {
        saved: Mutex<Vec<FileTree>>,
    }

    #[async_trait]
    impl TreeStore for SlowStore {
        async fn save_tree(&self, tree: &FileTree) -> anyhow::Result<()> {
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.saved.lock().unwrap().push(tree.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn persister_keeps_last_write() {
        let store = Arc::new(SlowStore {
            saved: Mutex::new(Vec::new()),
        });
        let persister = TreePersister::spawn(store.clone());

        for i in 0..5 {
            let mut tree = FileTree::new();
            tree.set_file("n.txt", i.to_string()).unwrap();
            persister.persist(tree);
        }

        let done = crate::testing::eventually(|| {
            let store = store.clone();
            async move {
                store
                    .saved
                    .lock()
                    .unwrap()
                    .last()
                    .is_some_and(|t| t.file("n.txt") == Some("4"))
            }
        })
        .await;
        assert!(done);
        assert!(store.saved.lock().unwrap().len() < 5);
    }
}
