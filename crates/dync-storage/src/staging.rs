//! Staging and atomic landing of in-flight uploads.
//!
//! Each upload owns exactly one [`StagingFile`], keyed by a [`uuid::Uuid`]
//! in [`Storage`]'s arena. Nothing in this module holds a reference back to
//! `Storage` from a `StagingFile`; callers always go `Storage -> id ->
//! StagingFile`, which keeps the ownership graph a tree instead of a cycle.

use std::collections::HashSet;
use std::path::PathBuf;

use sha2::{Digest, Sha256};
use serde_json::Value;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::dropbox::{clean_filename, finished_marker_path, DropboxConfig};
use crate::error::{Result, StorageError};

/// One upload in flight: a staged file plus the hashing state and bookkeeping
/// needed to land it atomically once the client reports completion.
pub struct StagingFile {
    origin: String,
    orig_name: String,
    clean_name: String,
    dest_dir: PathBuf,
    stage_dir: PathBuf,
    file: fs::File,
    hasher: Sha256,
    written: u64,
    untar: bool,
}

/// Archive entries beyond this count make an upload's `untar` request fail;
/// this caps how much an untrusted tar can expand into a dropbox.
const MAX_TAR_ENTRIES: usize = 10;

impl StagingFile {
    /// Bytes accepted so far. This is the server's authoritative seek
    /// position, echoed back to the client in `status-report` so that a
    /// resumed upload knows where to continue from.
    #[must_use]
    pub fn bytes_written(&self) -> u64 {
        self.written
    }
}

/// Owns every in-flight upload's staged file and the set of destination
/// paths currently reserved, so two sessions can never land on the same
/// final path.
pub struct Storage {
    tmp_root: PathBuf,
    config: DropboxConfig,
    files: std::collections::HashMap<Uuid, StagingFile>,
    reserved: HashSet<PathBuf>,
}

impl Storage {
    /// Construct a storage layer rooted at `tmp_root` for staging, governed
    /// by `config` for destination resolution.
    pub fn new(tmp_root: PathBuf, config: DropboxConfig) -> Self {
        Storage {
            tmp_root,
            config,
            files: std::collections::HashMap::new(),
            reserved: HashSet::new(),
        }
    }

    /// Begin staging a new upload. Resolves the destination directory from
    /// `meta` and `origin`, rejects names that are already taken, and
    /// creates a unique staging directory under `tmp_root`.
    pub async fn add_file(&mut self, origin: &str, name: &str, meta: &Value) -> Result<Uuid> {
        let clean_name = clean_filename(name)?;
        let dest_dir = self.config.resolve_dest_dir(origin, &clean_name, meta)?;
        let final_dest = dest_dir.join(&clean_name);

        if final_dest.exists() || self.reserved.contains(&final_dest) {
            return Err(StorageError::DestinationTaken(
                final_dest.display().to_string(),
            ));
        }

        let id = Uuid::new_v4();
        let stage_dir = self.tmp_root.join(id.to_string());
        fs::create_dir_all(&stage_dir).await?;

        let file_path = stage_dir.join(&clean_name);
        let file = fs::File::create(&file_path).await?;

        let untar = meta.get("untar").and_then(Value::as_str) == Some("True");

        self.reserved.insert(final_dest);
        self.files.insert(
            id,
            StagingFile {
                origin: origin.to_string(),
                orig_name: name.to_string(),
                clean_name,
                dest_dir,
                stage_dir,
                file,
                hasher: Sha256::new(),
                written: 0,
                untar,
            },
        );

        Ok(id)
    }

    /// Current seek position (bytes accepted) for `id`.
    pub fn bytes_written(&self, id: Uuid) -> Result<u64> {
        self.staging(id).map(StagingFile::bytes_written)
    }

    /// Append `data` to the staged file and the running hash. Returns the
    /// new total byte count. Out-of-order chunks are never routed here;
    /// the session layer is responsible for silently dropping them before
    /// they reach storage.
    pub async fn write(&mut self, id: Uuid, data: &[u8]) -> Result<u64> {
        let staging = self
            .files
            .get_mut(&id)
            .ok_or_else(|| StorageError::InvalidUploadRequest(format!("unknown upload {id}")))?;

        staging.file.write_all(data).await?;
        staging.hasher.update(data);
        staging.written += data.len() as u64;
        Ok(staging.written)
    }

    /// Abandon an in-flight upload: drop the reserved destination and
    /// remove the staging directory. Best-effort; failures are logged by
    /// the caller and never propagated, since abort itself is already the
    /// error-recovery path.
    pub async fn abort(&mut self, id: Uuid) {
        if let Some(staging) = self.files.remove(&id) {
            let final_dest = staging.dest_dir.join(&staging.clean_name);
            self.reserved.remove(&final_dest);
            drop(staging.file);
            let _ = fs::remove_dir_all(&staging.stage_dir).await;
        }
    }

    /// Verify the remote-supplied checksum, write sidecar metadata
    /// alongside the staged file, then atomically rename the whole staging
    /// directory into its final destination. Returns the landed path.
    ///
    /// On checksum mismatch the staged file is cleaned up and
    /// [`StorageError::ChecksumMismatch`] is returned; the caller reports
    /// this to the client and the session ends in `Failed`.
    pub async fn finalize(&mut self, id: Uuid, expected_sha256_hex: &str) -> Result<PathBuf> {
        let staging = self
            .files
            .remove(&id)
            .ok_or_else(|| StorageError::InvalidUploadRequest(format!("unknown upload {id}")))?;

        let final_dest = staging.dest_dir.join(&staging.clean_name);
        self.reserved.remove(&final_dest);

        let computed = hex::encode(staging.hasher.finalize());
        if !computed.eq_ignore_ascii_case(expected_sha256_hex) {
            let _ = fs::remove_dir_all(&staging.stage_dir).await;
            return Err(StorageError::ChecksumMismatch);
        }

        if let Err(e) = self.land(&staging, &final_dest, &computed).await {
            let _ = fs::remove_dir_all(&staging.stage_dir).await;
            return Err(StorageError::LandingFailure(e.to_string()));
        }

        Ok(final_dest)
    }

    async fn land(
        &self,
        staging: &StagingFile,
        final_dest: &PathBuf,
        sha256_hex: &str,
    ) -> Result<()> {
        staging.file.sync_all().await?;

        fs::write(
            staging.stage_dir.join(format!("{}.sha256sum", staging.clean_name)),
            format!("{sha256_hex}\t{}", staging.clean_name),
        )
        .await?;
        fs::write(
            staging
                .stage_dir
                .join(format!("{}.origlabfilename", staging.clean_name)),
            &staging.orig_name,
        )
        .await?;
        fs::write(staging.stage_dir.join("source_dropbox.txt"), &staging.origin).await?;

        if staging.untar {
            extract_tar_in_place(&staging.stage_dir, &staging.clean_name).await?;
        }

        fsync_dir(&staging.stage_dir).await?;

        fs::rename(&staging.stage_dir, final_dest).await?;
        fsync_dir(&staging.dest_dir).await?;

        if let Some(marker) = finished_marker_path(final_dest) {
            if let Err(e) = fs::write(&marker, b"").await {
                tracing::warn!(path = %marker.display(), error = %e, "failed writing completion marker");
            }
        }

        Ok(())
    }

    fn staging(&self, id: Uuid) -> Result<&StagingFile> {
        self.files
            .get(&id)
            .ok_or_else(|| StorageError::InvalidUploadRequest(format!("unknown upload {id}")))
    }
}

async fn fsync_dir(dir: &std::path::Path) -> Result<()> {
    let dir = fs::File::open(dir).await?;
    dir.sync_all().await?;
    Ok(())
}

/// Extract `stage_dir/clean_name` as a tar archive into `stage_dir`, then
/// remove the archive itself so the bundle directory holds only the
/// extracted tree. Archives with more than [`MAX_TAR_ENTRIES`] members are
/// rejected without unpacking anything further.
async fn extract_tar_in_place(stage_dir: &std::path::Path, clean_name: &str) -> Result<()> {
    let tar_path = stage_dir.join(clean_name);
    let stage_dir = stage_dir.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<()> {
        let file = std::fs::File::open(&tar_path)?;
        let mut archive = tar::Archive::new(file);
        for (count, entry) in archive.entries()?.enumerate() {
            if count >= MAX_TAR_ENTRIES {
                return Err(StorageError::InvalidUploadRequest(format!(
                    "tar archive contains more than {MAX_TAR_ENTRIES} entries"
                )));
            }
            entry?.unpack_in(&stage_dir)?;
        }
        std::fs::remove_file(&tar_path)?;
        Ok(())
    })
    .await
    .map_err(|e| StorageError::LandingFailure(e.to_string()))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dropbox::DropboxRule;
    use serde_json::json;
    use tempfile::tempdir;

    fn config(dest: PathBuf) -> DropboxConfig {
        DropboxConfig {
            path: dest.clone(),
            manual: dest.clone(),
            dropboxes: vec![DropboxRule {
                regexp: ".*".to_string(),
                path: dest,
                origin: None,
                match_file: true,
                match_dir: false,
                requires_barcode: false,
            }],
        }
    }

    #[tokio::test]
    async fn happy_path_lands_file_with_sidecars() {
        let tmp = tempdir().unwrap();
        let dest = tempdir().unwrap();
        let mut storage = Storage::new(tmp.path().to_path_buf(), config(dest.path().to_path_buf()));

        let id = storage
            .add_file("client-a", "sample.raw", &json!({}))
            .await
            .unwrap();
        storage.write(id, b"hello ").await.unwrap();
        storage.write(id, b"world").await.unwrap();
        assert_eq!(storage.bytes_written(id).unwrap(), 11);

        let digest = hex::encode(Sha256::digest(b"hello world"));
        let landed = storage.finalize(id, &digest).await.unwrap();

        assert!(landed.join("sample.raw").exists());
        assert!(landed.join("sample.raw.sha256sum").exists());
        assert!(landed.join("sample.raw.origlabfilename").exists());
        assert!(landed.join("source_dropbox.txt").exists());
    }

    #[tokio::test]
    async fn checksum_mismatch_cleans_up_staging_dir() {
        let tmp = tempdir().unwrap();
        let dest = tempdir().unwrap();
        let mut storage = Storage::new(tmp.path().to_path_buf(), config(dest.path().to_path_buf()));

        let id = storage
            .add_file("client-a", "sample.raw", &json!({}))
            .await
            .unwrap();
        storage.write(id, b"hello").await.unwrap();

        let err = storage.finalize(id, "0000").await.unwrap_err();
        assert!(matches!(err, StorageError::ChecksumMismatch));
        assert!(!dest.path().join("sample.raw").exists());
    }

    #[tokio::test]
    async fn duplicate_destination_rejected() {
        let tmp = tempdir().unwrap();
        let dest = tempdir().unwrap();
        let mut storage = Storage::new(tmp.path().to_path_buf(), config(dest.path().to_path_buf()));

        let _id = storage
            .add_file("client-a", "sample.raw", &json!({}))
            .await
            .unwrap();
        let err = storage
            .add_file("client-b", "sample.raw", &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::DestinationTaken(_)));
    }
}
