//! File operation executor.

use async_trait::async_trait;
use serde_json::json;
use std::path::Path;

use super::{config_mismatch, ExecutionContext, Executor, ExecutorOutcome};
use crate::dag::{FileOperation, NodeConfig};
use crate::error::{CascadeError, Result};

#[derive(Default)]
pub struct FileExecutor;

impl FileExecutor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Executor for FileExecutor {
    fn kind(&self) -> &'static str {
        "file"
    }

    async fn execute(
        &self,
        config: &NodeConfig,
        _ctx: &ExecutionContext,
    ) -> Result<ExecutorOutcome> {
        let NodeConfig::File(config) = config else {
            return Err(config_mismatch(self.kind()));
        };

        let path = Path::new(&config.path);
        let result = match config.operation {
            FileOperation::Read => {
                let content = tokio::fs::read_to_string(path).await.map_err(io_err)?;
                json!({ "content": content, "bytes": content.len() })
            }
            FileOperation::Write => {
                let content = config.content.clone().unwrap_or_default();
                ensure_parent(path).await?;
                tokio::fs::write(path, &content).await.map_err(io_err)?;
                json!({ "written": true, "bytes": content.len() })
            }
            FileOperation::Append => {
                use tokio::io::AsyncWriteExt;
                let content = config.content.clone().unwrap_or_default();
                ensure_parent(path).await?;
                let mut file = tokio::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .await
                    .map_err(io_err)?;
                file.write_all(content.as_bytes()).await.map_err(io_err)?;
                json!({ "appended": true, "bytes": content.len() })
            }
            FileOperation::Delete => {
                tokio::fs::remove_file(path).await.map_err(io_err)?;
                json!({ "deleted": true })
            }
            FileOperation::Copy => {
                let destination = config.destination.as_deref().ok_or_else(|| {
                    CascadeError::validation("File copy requires a destination")
                })?;
                ensure_parent(Path::new(destination)).await?;
                let bytes = tokio::fs::copy(path, destination).await.map_err(io_err)?;
                json!({ "copied": true, "bytes": bytes, "destination": destination })
            }
            FileOperation::Exists => {
                let exists = tokio::fs::try_exists(path).await.map_err(io_err)?;
                json!({ "exists": exists })
            }
        };

        Ok(ExecutorOutcome::Success(result))
    }
}

async fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }
    }
    Ok(())
}

fn io_err(e: std::io::Error) -> CascadeError {
    CascadeError::executor_failure(format!("File operation failed: {}", e))
}
