use std::io;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

use crate::storage::meta::{self, Metadata};

/// On-disk blob store: `<root>/<repo>/<key>/blob` plus a `meta.json`
/// sidecar. Blobs are immutable once published and replaced only by atomic
/// rename, so concurrent readers holding an open descriptor keep seeing the
/// bytes they opened.
#[derive(Clone)]
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    pub fn open(root: &Path) -> io::Result<Self> {
        std::fs::create_dir_all(root)?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// True iff both the blob and its sidecar are present. A blob without a
    /// sidecar (crash between the two renames) counts as absent.
    pub fn exists(&self, repo: &str, key: &str) -> bool {
        meta::blob_path(&self.root, repo, key).is_file()
            && meta::meta_path(&self.root, repo, key).is_file()
    }

    /// Opens the blob for reading and loads the sidecar. Both or neither.
    pub async fn get(&self, repo: &str, key: &str) -> io::Result<(File, Metadata)> {
        let metadata = meta::load(&meta::meta_path(&self.root, repo, key))?;
        let file = File::open(meta::blob_path(&self.root, repo, key)).await?;
        Ok((file, metadata))
    }

    /// Consumes `chunks` into `blob.tmp`, fsyncs, renames to `blob`, then
    /// publishes the sidecar the same way. `meta.size` is set from the bytes
    /// actually written. An `Err` chunk marks the stream as aborted. On any
    /// failure nothing observable remains: the temp file is removed, and if
    /// the sidecar write fails after the blob rename the blob is removed
    /// too.
    pub async fn put(
        &self,
        repo: &str,
        key: &str,
        mut chunks: mpsc::Receiver<io::Result<Bytes>>,
        mut metadata: Metadata,
    ) -> io::Result<Metadata> {
        let blob = meta::blob_path(&self.root, repo, key);
        let sidecar = meta::meta_path(&self.root, repo, key);
        if let Some(dir) = blob.parent() {
            fs::create_dir_all(dir).await?;
        }

        let tmp = meta::tmp_path(&blob);
        let mut file = File::create(&tmp).await?;
        let mut written = 0u64;
        let write_result: io::Result<()> = async {
            while let Some(chunk) = chunks.recv().await {
                let chunk = chunk?;
                file.write_all(&chunk).await?;
                written += chunk.len() as u64;
            }
            file.flush().await?;
            file.sync_all().await?;
            Ok(())
        }
        .await;
        drop(file);

        if let Err(err) = write_result {
            let _ = fs::remove_file(&tmp).await;
            return Err(err);
        }

        metadata.size = written;

        if let Err(err) = fs::rename(&tmp, &blob).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(err);
        }

        if let Err(err) = meta::save(&sidecar, &metadata) {
            let _ = fs::remove_file(&blob).await;
            return Err(err);
        }

        Ok(metadata)
    }

    /// Atomically replaces the sidecar only; the blob is not touched.
    pub fn update_metadata(&self, repo: &str, key: &str, metadata: &Metadata) -> io::Result<()> {
        meta::save(&meta::meta_path(&self.root, repo, key), metadata)
    }

    /// Best-effort removal of blob, sidecar and the then-empty key
    /// directory. Missing files are not errors.
    pub async fn delete(&self, repo: &str, key: &str) -> io::Result<()> {
        let blob = meta::blob_path(&self.root, repo, key);
        let sidecar = meta::meta_path(&self.root, repo, key);
        ok_if_missing(fs::remove_file(&blob).await)?;
        ok_if_missing(fs::remove_file(&sidecar).await)?;
        ok_if_missing(fs::remove_file(meta::tmp_path(&blob)).await)?;
        if let Some(dir) = blob.parent() {
            let _ = fs::remove_dir(dir).await;
        }
        Ok(())
    }
}

fn ok_if_missing(res: io::Result<()>) -> io::Result<()> {
    match res {
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}
