//! Filesystem-backed task store.
//!
//! Each partition is a directory under the store root; each artifact is a
//! markdown file named `{id}.md`. Transitions are `rename(2)` calls, which
//! are atomic within one filesystem, and writes publish via a temp file plus
//! rename so a concurrent scan never sees a half-written artifact. Plans
//! live under `plans/` outside the partitions.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tracing::debug;
use uuid::Uuid;

use crate::error::StoreError;
use crate::store::{Partition, TaskStore, TransitionOutcome};

/// Task store rooted at a directory on the local filesystem.
pub struct FsTaskStore {
    root: PathBuf,
}

impl FsTaskStore {
    /// Open (creating if necessary) a store rooted at `root`.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        for partition in Partition::ALL {
            fs::create_dir_all(root.join(partition.dir_name()))
                .await
                .map_err(|e| StoreError::RootInaccessible {
                    path: root.clone(),
                    reason: e.to_string(),
                })?;
        }
        fs::create_dir_all(root.join("plans"))
            .await
            .map_err(|e| StoreError::RootInaccessible {
                path: root.clone(),
                reason: e.to_string(),
            })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn artifact_path(&self, partition: Partition, id: Uuid) -> PathBuf {
        self.root
            .join(partition.dir_name())
            .join(format!("{id}.md"))
    }

    fn plan_path(&self, task_id: Uuid) -> PathBuf {
        self.root.join("plans").join(format!("{task_id}.json"))
    }

    /// Write `content` then rename into place, so readers only ever see a
    /// complete artifact.
    async fn write_atomic(
        &self,
        partition_name: &str,
        path: &Path,
        content: &str,
    ) -> Result<(), StoreError> {
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, content)
            .await
            .map_err(|e| io_err(partition_name, e))?;
        fs::rename(&tmp, path)
            .await
            .map_err(|e| io_err(partition_name, e))?;
        Ok(())
    }
}

fn io_err(partition: &str, source: std::io::Error) -> StoreError {
    StoreError::Io {
        partition: partition.to_string(),
        source,
    }
}

#[async_trait]
impl TaskStore for FsTaskStore {
    async fn put(&self, partition: Partition, id: Uuid, content: &str) -> Result<(), StoreError> {
        let path = self.artifact_path(partition, id);
        self.write_atomic(partition.dir_name(), &path, content)
            .await
    }

    async fn read(&self, partition: Partition, id: Uuid) -> Result<Option<String>, StoreError> {
        match fs::read_to_string(self.artifact_path(partition, id)).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_err(partition.dir_name(), e)),
        }
    }

    async fn append(
        &self,
        partition: Partition,
        id: Uuid,
        suffix: &str,
    ) -> Result<TransitionOutcome, StoreError> {
        let Some(mut content) = self.read(partition, id).await? else {
            return Ok(TransitionOutcome::NotFound);
        };
        content.push_str(suffix);
        let path = self.artifact_path(partition, id);
        self.write_atomic(partition.dir_name(), &path, &content)
            .await?;
        Ok(TransitionOutcome::Moved)
    }

    async fn transition(
        &self,
        id: Uuid,
        from: Partition,
        to: Partition,
    ) -> Result<TransitionOutcome, StoreError> {
        let src = self.artifact_path(from, id);
        let dst = self.artifact_path(to, id);
        match fs::rename(&src, &dst).await {
            Ok(()) => {
                debug!(%id, %from, %to, "artifact moved");
                Ok(TransitionOutcome::Moved)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(%id, %from, %to, "transition source missing");
                Ok(TransitionOutcome::NotFound)
            }
            Err(e) => Err(io_err(from.dir_name(), e)),
        }
    }

    async fn list(&self, partition: Partition) -> Result<Vec<Uuid>, StoreError> {
        let dir = self.root.join(partition.dir_name());
        let mut entries = fs::read_dir(&dir)
            .await
            .map_err(|e| io_err(partition.dir_name(), e))?;

        let mut ids = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| io_err(partition.dir_name(), e))?
        {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(stem) = name.strip_suffix(".md")
                && let Ok(id) = stem.parse::<Uuid>()
            {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }

    async fn locate(&self, id: Uuid) -> Result<Option<Partition>, StoreError> {
        for partition in Partition::ALL {
            match fs::try_exists(self.artifact_path(partition, id)).await {
                Ok(true) => return Ok(Some(partition)),
                Ok(false) => {}
                Err(e) => return Err(io_err(partition.dir_name(), e)),
            }
        }
        Ok(None)
    }

    async fn save_plan(&self, task_id: Uuid, plan: &str) -> Result<(), StoreError> {
        let path = self.plan_path(task_id);
        self.write_atomic("plans", &path, plan).await
    }

    async fn load_plan(&self, task_id: Uuid) -> Result<Option<String>, StoreError> {
        match fs::read_to_string(self.plan_path(task_id)).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_err("plans", e)),
        }
    }
}
