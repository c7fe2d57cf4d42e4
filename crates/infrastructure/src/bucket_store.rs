//! Bucket 目录的文件系统操作
//!
//! 目录以 gzip 压缩的 TAR 传输；请求路径先归一化，任何逃出 bucket 根目录的路径都被拒绝。
//! 符号链接不会被解压，也不会被打包；已存在的路径按真实路径校验。

use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use taskhub_core::models::{glob_match, Bucket};
use taskhub_core::{HubError, HubResult};
use tracing::debug;

/// bucket 中某个路径的内容
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BucketEntry {
    File(PathBuf),
    Directory(PathBuf),
}

#[derive(Debug, Clone)]
pub struct BucketStore {
    root: PathBuf,
}

impl BucketStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// 归一化相对路径，拒绝逃逸
    pub fn resolve(&self, bucket: &Bucket, rel: &str) -> HubResult<PathBuf> {
        let root = Path::new(&bucket.path);
        let mut resolved = root.to_path_buf();
        let mut depth = 0usize;
        for component in Path::new(rel.trim_start_matches('/')).components() {
            match component {
                Component::Normal(part) => {
                    resolved.push(part);
                    depth += 1;
                }
                Component::CurDir => {}
                Component::ParentDir => {
                    if depth == 0 {
                        return Err(HubError::bad_request(format!("路径越界: {rel}")));
                    }
                    resolved.pop();
                    depth -= 1;
                }
                Component::RootDir | Component::Prefix(_) => {
                    return Err(HubError::bad_request(format!("非法路径: {rel}")));
                }
            }
        }
        confine(root, &resolved)
            .map_err(|_| HubError::bad_request(format!("路径越界: {rel}")))?;
        Ok(resolved)
    }

    pub async fn ensure(&self, bucket: &Bucket) -> HubResult<()> {
        tokio::fs::create_dir_all(&bucket.path).await?;
        Ok(())
    }

    pub async fn stat(&self, bucket: &Bucket, rel: &str) -> HubResult<BucketEntry> {
        let path = self.resolve(bucket, rel)?;
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_dir() => Ok(BucketEntry::Directory(path)),
            Ok(_) => Ok(BucketEntry::File(path)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(HubError::not_found("Bucket path", rel))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn write_file(&self, bucket: &Bucket, rel: &str, content: &[u8]) -> HubResult<()> {
        let path = self.resolve(bucket, rel)?;
        if path == Path::new(&bucket.path) {
            return Err(HubError::bad_request("文件路径不能为空"));
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, content).await?;
        debug!("写入 bucket 文件: {}", path.display());
        Ok(())
    }

    /// 将 gzip TAR 解压到目标目录（先清空目标目录）
    pub async fn expand(&self, bucket: &Bucket, rel: &str, archive: Vec<u8>) -> HubResult<()> {
        let target = self.resolve(bucket, rel)?;
        tokio::task::spawn_blocking(move || extract_tar_gz(&archive, &target))
            .await
            .map_err(|e| HubError::Internal(format!("解压任务失败: {e}")))?
    }

    /// 将目录打包为 gzip TAR，可用 glob 过滤
    pub async fn archive(&self, dir: PathBuf, filter: Option<String>) -> HubResult<Vec<u8>> {
        tokio::task::spawn_blocking(move || tar_gz_dir(&dir, filter.as_deref()))
            .await
            .map_err(|e| HubError::Internal(format!("打包任务失败: {e}")))?
    }

    /// 递归删除路径；路径为空时删除整个 bucket 目录
    pub async fn delete(&self, bucket: &Bucket, rel: &str) -> HubResult<()> {
        let path = self.resolve(bucket, rel)?;
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(&path).await?,
            Ok(_) => tokio::fs::remove_file(&path).await?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    /// 目录列表的 HTML 页面
    pub async fn index_html(&self, dir: &Path, rel: &str) -> HubResult<String> {
        let mut entries = Vec::new();
        let mut reader = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = reader.next_entry().await? {
            let name = escape_html(&entry.file_name().to_string_lossy());
            let meta = entry.metadata().await?;
            entries.push((name, meta.is_dir(), meta.len()));
        }
        entries.sort();

        let base = escape_html(rel.trim_matches('/'));
        let base = base.as_str();
        let mut html = format!("<html><head><title>{base}</title></head><body><h1>/{base}</h1><ul>");
        for (name, is_dir, size) in entries {
            let href = if base.is_empty() {
                name.clone()
            } else {
                format!("{base}/{name}")
            };
            if is_dir {
                html.push_str(&format!("<li><a href=\"/{href}\">{name}/</a></li>"));
            } else {
                html.push_str(&format!("<li><a href=\"/{href}\">{name}</a> ({size})</li>"));
            }
        }
        html.push_str("</ul></body></html>");
        Ok(html)
    }
}

/// 路径中已存在的最深一级按真实路径计算后仍须位于 bucket 目录内
fn confine(root: &Path, path: &Path) -> std::io::Result<()> {
    let Ok(real_root) = fs::canonicalize(root) else {
        // bucket 目录尚未创建，其下不可能存在链接
        return Ok(());
    };
    let Some(existing) = path.ancestors().find(|a| fs::symlink_metadata(a).is_ok()) else {
        return Ok(());
    };
    if fs::canonicalize(existing)?.starts_with(&real_root) {
        Ok(())
    } else {
        Err(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "path escapes bucket",
        ))
    }
}

fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            c => escaped.push(c),
        }
    }
    escaped
}

fn tar_gz_dir(dir: &Path, filter: Option<&str>) -> HubResult<Vec<u8>> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    append_dir(&mut builder, dir, Path::new(""), filter)?;
    let encoder = builder.into_inner()?;
    Ok(encoder.finish()?)
}

fn append_dir<W: Write>(
    builder: &mut tar::Builder<W>,
    dir: &Path,
    prefix: &Path,
    filter: Option<&str>,
) -> HubResult<()> {
    let mut entries: Vec<_> = fs::read_dir(dir)?.collect::<Result<_, _>>()?;
    entries.sort_by_key(|e| e.file_name());
    for entry in entries {
        let path = entry.path();
        let name = prefix.join(entry.file_name());
        let file_type = fs::symlink_metadata(&path)?.file_type();
        if file_type.is_symlink() {
            debug!("打包时跳过符号链接: {}", path.display());
            continue;
        }
        if file_type.is_dir() {
            append_dir(builder, &path, &name, filter)?;
            continue;
        }
        if let Some(pattern) = filter {
            let rel = name.to_string_lossy();
            let base = entry.file_name().to_string_lossy().into_owned();
            if !glob_match(pattern, &rel) && !glob_match(pattern, &base) {
                continue;
            }
        }
        builder.append_path_with_name(&path, &name)?;
    }
    Ok(())
}

fn extract_tar_gz(archive: &[u8], target: &Path) -> HubResult<()> {
    if target.exists() {
        fs::remove_dir_all(target)?;
    }
    fs::create_dir_all(target)?;
    let mut tar = tar::Archive::new(GzDecoder::new(archive));
    for entry in tar.entries()? {
        let mut entry = entry?;
        let kind = entry.header().entry_type();
        if kind.is_symlink() || kind.is_hard_link() {
            return Err(HubError::bad_request(format!(
                "归档中不允许链接: {}",
                entry.path()?.display()
            )));
        }
        if !entry.unpack_in(target)? {
            return Err(HubError::bad_request(format!(
                "归档条目越界: {}",
                entry.path()?.display()
            )));
        }
    }
    Ok(())
}
