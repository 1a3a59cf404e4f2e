//! Retrieval of auxiliary job outputs (training plots).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use cloudtrain_service::{ObjectStore, ObjectUri};

use crate::command::extract_tar_gz;
use crate::error::Result;

/// Downloaded and unpacked job output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievedArtifacts {
    pub archive: PathBuf,
    pub dir: PathBuf,
    /// `*.png` files found in the archive, sorted
    pub plots: Vec<PathBuf>,
}

/// Download `output_data` into `dest`, unpack it and list the plots.
///
/// An empty archive is valid and yields no plots.
pub async fn retrieve_artifacts<S>(
    store: &S,
    output_data: &ObjectUri,
    dest: &Path,
) -> Result<RetrievedArtifacts>
where
    S: ObjectStore + ?Sized,
{
    let bytes = store.get_object(output_data).await?;
    std::fs::create_dir_all(dest)?;
    let archive = dest.join(output_data.file_name().unwrap_or("output.tar.gz"));
    tokio::fs::write(&archive, &bytes).await?;

    let dir = dest.join("output");
    let mut plots = Vec::new();
    if !bytes.is_empty() {
        extract_tar_gz(&archive, &dir).await?;
        collect_plots(&dir, &mut plots)?;
        plots.sort();
    }
    info!(
        source = %output_data,
        plots = plots.len(),
        dir = %dir.display(),
        "job artifacts retrieved"
    );
    Ok(RetrievedArtifacts {
        archive,
        dir,
        plots,
    })
}

fn collect_plots(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_plots(&path, out)?;
        } else if path
            .extension()
            .map(|e| e.eq_ignore_ascii_case("png"))
            .unwrap_or(false)
        {
            out.push(path);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::create_tar_gz;
    use cloudtrain_service::fakes::MemoryCloud;

    #[tokio::test]
    async fn test_retrieve_lists_plots() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        std::fs::create_dir_all(src.join("plots")).unwrap();
        std::fs::write(src.join("plots/loss.png"), b"png").unwrap();
        std::fs::write(src.join("accuracy.PNG"), b"png").unwrap();
        std::fs::write(src.join("history.json"), b"{}").unwrap();
        let archive = dir.path().join("output.tar.gz");
        create_tar_gz(&src, &archive).await.unwrap();

        let cloud = MemoryCloud::new();
        let uri = ObjectUri::new("b", "jobs/j/output/output.tar.gz");
        cloud
            .put_object(&uri, std::fs::read(&archive).unwrap())
            .await
            .unwrap();

        let dest = dir.path().join("dest");
        let retrieved = retrieve_artifacts(&cloud, &uri, &dest).await.unwrap();
        assert_eq!(retrieved.archive, dest.join("output.tar.gz"));
        let names: Vec<String> = retrieved
            .plots
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 2);
        assert!(names.contains(&"loss.png".to_string()));
        assert!(names.contains(&"accuracy.PNG".to_string()));
    }

    #[tokio::test]
    async fn test_empty_archive_has_no_plots() {
        let dir = tempfile::tempdir().unwrap();
        let cloud = MemoryCloud::new();
        let uri = ObjectUri::new("b", "output.tar.gz");
        cloud.put_object(&uri, Vec::new()).await.unwrap();
        let retrieved = retrieve_artifacts(&cloud, &uri, dir.path()).await.unwrap();
        assert!(retrieved.plots.is_empty());
    }

    #[tokio::test]
    async fn test_missing_output_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let cloud = MemoryCloud::new();
        let err = retrieve_artifacts(&cloud, &ObjectUri::new("b", "nope"), dir.path())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("object not found"));
    }
}
