//! Local directory to object storage upload.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use cloudtrain_service::{ObjectStore, ObjectUri};

use crate::error::Result;

/// One uploaded file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadedObject {
    pub uri: ObjectUri,
    pub bytes: u64,
    /// SHA-256 of the uploaded content, lowercase hex
    pub sha256: String,
}

/// Result of uploading a directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadReport {
    /// Location handle for the whole directory
    pub prefix: ObjectUri,
    pub objects: Vec<UploadedObject>,
}

impl UploadReport {
    pub fn total_bytes(&self) -> u64 {
        self.objects.iter().map(|o| o.bytes).sum()
    }
}

/// Upload one file to `uri`.
pub async fn upload_file<S>(store: &S, path: &Path, uri: &ObjectUri) -> Result<UploadedObject>
where
    S: ObjectStore + ?Sized,
{
    let data = tokio::fs::read(path).await?;
    let sha256 = hex::encode(Sha256::digest(&data));
    let bytes = data.len() as u64;
    store.put_object(uri, data).await?;
    debug!(uri = %uri, bytes, sha256 = %sha256, "uploaded object");
    Ok(UploadedObject {
        uri: uri.clone(),
        bytes,
        sha256,
    })
}

/// Upload every regular file below `dir` to `prefix/<relative path>`.
/// Files are uploaded in sorted path order; no retries.
pub async fn upload_directory<S>(store: &S, dir: &Path, prefix: &ObjectUri) -> Result<UploadReport>
where
    S: ObjectStore + ?Sized,
{
    let mut files = walk_files(dir)?;
    files.sort();

    let mut objects = Vec::with_capacity(files.len());
    for file in files {
        let relative = file
            .strip_prefix(dir)
            .unwrap_or(&file)
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");
        objects.push(upload_file(store, &file, &prefix.join(relative)).await?);
    }

    let report = UploadReport {
        prefix: prefix.clone(),
        objects,
    };
    info!(
        prefix = %report.prefix,
        files = report.objects.len(),
        bytes = report.total_bytes(),
        "directory uploaded"
    );
    Ok(report)
}

fn walk_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            files.extend(walk_files(&path)?);
        } else if path.is_file() {
            files.push(path);
        }
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloudtrain_service::fakes::MemoryCloud;

    #[tokio::test]
    async fn test_upload_directory_keeps_relative_layout() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("nested")).unwrap();
        std::fs::write(dir.path().join("x_train.npy"), b"xx").unwrap();
        std::fs::write(dir.path().join("nested/y_train.npy"), b"y").unwrap();

        let cloud = MemoryCloud::new();
        let prefix = ObjectUri::new("bucket", "data/train");
        let report = upload_directory(&cloud, dir.path(), &prefix).await.unwrap();

        assert_eq!(report.prefix.to_string(), "s3://bucket/data/train");
        assert_eq!(report.objects.len(), 2);
        assert_eq!(report.total_bytes(), 3);
        let uris: Vec<String> = report.objects.iter().map(|o| o.uri.to_string()).collect();
        assert_eq!(
            uris,
            vec![
                "s3://bucket/data/train/nested/y_train.npy",
                "s3://bucket/data/train/x_train.npy",
            ]
        );
        let stored = cloud
            .get_object(&ObjectUri::new("bucket", "data/train/x_train.npy"))
            .await
            .unwrap();
        assert_eq!(stored, b"xx".to_vec());
    }

    #[tokio::test]
    async fn test_upload_file_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob");
        std::fs::write(&path, b"hello world").unwrap();
        let cloud = MemoryCloud::new();
        let uploaded = upload_file(&cloud, &path, &ObjectUri::new("b", "k"))
            .await
            .unwrap();
        assert_eq!(
            uploaded.sha256,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn test_missing_directory_is_io_error() {
        let cloud = MemoryCloud::new();
        let err = upload_directory(
            &cloud,
            Path::new("/definitely/not/here"),
            &ObjectUri::new("b", "k"),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, crate::error::PipelineError::Io(_)));
    }
}
