//! 文件内容存储：每个文件一个磁盘文件，路径由 id 决定

use std::path::{Path, PathBuf};

use taskhub_core::models::FileRecord;
use taskhub_core::{HubError, HubResult};
use tokio::io::AsyncWriteExt;

#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn write(&self, file: &FileRecord, content: &[u8]) -> HubResult<()> {
        if let Some(parent) = Path::new(&file.path).parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&file.path, content).await?;
        Ok(())
    }

    pub async fn append(&self, file: &FileRecord, content: &[u8]) -> HubResult<()> {
        let mut handle = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&file.path)
            .await?;
        handle.write_all(content).await?;
        handle.flush().await?;
        Ok(())
    }

    pub async fn read(&self, file: &FileRecord) -> HubResult<Vec<u8>> {
        match tokio::fs::read(&file.path).await {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn read_to_string(&self, file: &FileRecord) -> HubResult<String> {
        let content = self.read(file).await?;
        Ok(String::from_utf8_lossy(&content).into_owned())
    }

    pub async fn remove(&self, file: &FileRecord) -> HubResult<()> {
        match tokio::fs::remove_file(&file.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// 将文件打包为 TAR，条目名为 `%03d-<name>`（文件 id 与名称）
    pub async fn tar(&self, files: Vec<FileRecord>) -> HubResult<Vec<u8>> {
        tokio::task::spawn_blocking(move || {
            let mut builder = tar::Builder::new(Vec::new());
            for file in files {
                let name = format!("{:03}-{}", file.id, file.name);
                let path = Path::new(&file.path);
                if path.exists() {
                    builder.append_path_with_name(path, &name)?;
                } else {
                    let mut header = tar::Header::new_gnu();
                    header.set_size(0);
                    header.set_mode(0o644);
                    header.set_cksum();
                    builder.append_data(&mut header, &name, std::io::empty())?;
                }
            }
            Ok::<_, HubError>(builder.into_inner()?)
        })
        .await
        .map_err(|e| HubError::Internal(format!("打包任务失败: {e}")))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::io::Read;

    fn record(root: &Path, id: i64, name: &str) -> FileRecord {
        FileRecord {
            id,
            name: name.to_string(),
            encoding: String::new(),
            path: root.join(id.to_string()).to_string_lossy().into_owned(),
            expiration: None,
            create_user: String::new(),
            create_time: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_append_and_tar() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        let file = record(dir.path(), 7, "addon.log");
        store.write(&file, b"one\n").await.unwrap();
        store.append(&file, b"two\n").await.unwrap();
        assert_eq!(store.read_to_string(&file).await.unwrap(), "one\ntwo\n");

        let bytes = store.tar(vec![file.clone()]).await.unwrap();
        let mut archive = tar::Archive::new(&bytes[..]);
        let mut entry = archive.entries().unwrap().next().unwrap().unwrap();
        assert_eq!(entry.path().unwrap().to_string_lossy(), "007-addon.log");
        let mut content = String::new();
        entry.read_to_string(&mut content).unwrap();
        assert_eq!(content, "one\ntwo\n");

        store.remove(&file).await.unwrap();
        store.remove(&file).await.unwrap();
        assert!(store.read(&file).await.unwrap().is_empty());
    }
}
