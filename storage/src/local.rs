use camino::{Utf8Path, Utf8PathBuf};
use eyre::WrapErr;
use tokio::io::AsyncWriteExt;
use tracing::Instrument;

use storage_driver::{
    Driver, Metadata, Persisted, Reader, StorageError, StorageErrorKind, Writer,
};

const ENGINE: &str = "local";

fn io_error(err: std::io::Error, context: &'static str) -> StorageError {
    let kind = StorageErrorKind::from_io(err.kind());
    StorageError::builder(ENGINE, kind, err)
        .context(context)
        .build()
}

/// Storage driver that keeps objects as files below a root directory.
///
/// Objects live at `<root>/<bucket>/b/<remote>`.
#[derive(Debug)]
pub struct LocalDriver {
    root: Utf8PathBuf,
}

impl LocalDriver {
    /// Create a driver rooted at `root`.
    pub fn new(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    fn base(&self, bucket: &str) -> Utf8PathBuf {
        let mut path = self.root.join(bucket);
        path.push("b");
        path
    }

    fn path(&self, bucket: &str, remote: &Utf8Path) -> Utf8PathBuf {
        self.base(bucket).join(remote)
    }

    async fn create_parent(&self, path: &Utf8Path) -> Result<(), StorageError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| io_error(err, "create_dir_all"))?;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Driver for LocalDriver {
    fn name(&self) -> &'static str {
        ENGINE
    }

    async fn metadata(&self, bucket: &str, remote: &Utf8Path) -> Result<Metadata, StorageError> {
        let remote = self.path(bucket, remote);
        let metadata = tokio::fs::metadata(remote)
            .await
            .map_err(|err| io_error(err, "metadata"))?;
        Ok(Metadata {
            size: metadata.len(),
            created: metadata
                .created()
                .or_else(|_| metadata.modified())
                .map_err(|err| io_error(err, "metadata timestamp"))?
                .into(),
        })
    }

    async fn upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        local: &mut Reader<'_>,
    ) -> Result<(), StorageError> {
        let remote = self.path(bucket, remote);
        self.create_parent(&remote).await?;

        // Write next to the destination and rename, so readers never see a
        // partially written object.
        let staging = remote.with_extension(format!("partial-{}", uuid::Uuid::new_v4()));
        let mut writer = tokio::io::BufWriter::new(
            tokio::fs::File::create(&staging)
                .await
                .map_err(|err| io_error(err, "create staging file"))?,
        );

        tokio::io::copy_buf(local, &mut writer)
            .await
            .map_err(|err| io_error(err, "copy"))?;

        writer
            .shutdown()
            .await
            .map_err(|err| io_error(err, "shutdown writer"))?;

        tokio::fs::rename(&staging, &remote)
            .await
            .map_err(|err| io_error(err, "rename staging file"))?;
        Ok(())
    }

    async fn append(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        local: &mut Reader<'_>,
    ) -> Result<u64, StorageError> {
        let remote = self.path(bucket, remote);
        self.create_parent(&remote).await?;

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&remote)
            .await
            .map_err(|err| io_error(err, "open for append"))?;
        let mut writer = tokio::io::BufWriter::new(file);

        let appended = tokio::io::copy_buf(local, &mut writer)
            .await
            .map_err(|err| io_error(err, "append"))?;

        writer
            .shutdown()
            .await
            .map_err(|err| io_error(err, "shutdown writer"))?;
        Ok(appended)
    }

    async fn truncate(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        size: u64,
    ) -> Result<(), StorageError> {
        let remote = self.path(bucket, remote);
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(&remote)
            .await
            .map_err(|err| io_error(err, "open for truncate"))?;
        file.set_len(size)
            .await
            .map_err(|err| io_error(err, "truncate"))
    }

    async fn persist(
        &self,
        bucket: &str,
        from: &Utf8Path,
        to: &Utf8Path,
    ) -> Result<Persisted, StorageError> {
        let from = self.path(bucket, from);
        let to = self.path(bucket, to);
        self.create_parent(&to).await?;

        // hard_link refuses to replace an existing destination, which gives
        // first-writer-wins without a separate existence check.
        let outcome = match tokio::fs::hard_link(&from, &to).await {
            Ok(()) => Persisted::Created,
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                tracing::trace!(%from, %to, "destination exists, discarding source");
                Persisted::Existing
            }
            Err(err) => return Err(io_error(err, "link into place")),
        };

        tokio::fs::remove_file(&from)
            .await
            .map_err(|err| io_error(err, "remove source"))?;
        Ok(outcome)
    }

    async fn download(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        local: &mut Writer<'_>,
    ) -> Result<(), StorageError> {
        let remote = self.path(bucket, remote);

        let mut reader = tokio::io::BufReader::new(
            tokio::fs::File::open(&remote)
                .await
                .map_err(|err| io_error(err, "open remote file"))?,
        );

        tokio::io::copy_buf(&mut reader, local)
            .await
            .map_err(|err| io_error(err, "copy"))?;

        local
            .flush()
            .await
            .map_err(|err| io_error(err, "flush writer"))?;

        Ok(())
    }

    async fn delete(&self, bucket: &str, remote: &Utf8Path) -> Result<(), StorageError> {
        let remote = self.path(bucket, remote);
        match tokio::fs::remove_file(remote).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(io_error(err, "remove_file")),
        }
    }

    async fn list(
        &self,
        bucket: &str,
        prefix: Option<&Utf8Path>,
    ) -> Result<Vec<String>, StorageError> {
        let base = self.base(bucket);
        let prefix = prefix.map(|p| p.to_owned());

        let mut items = tokio::task::spawn_blocking(move || collect_list(&base))
            .in_current_span()
            .await
            .wrap_err("local driver")
            .map_err(StorageError::with(ENGINE, StorageErrorKind::Other))?
            .map_err(StorageError::with(ENGINE, StorageErrorKind::Io))?;

        if let Some(prefix) = prefix {
            items.retain(|path| path.starts_with(&prefix));
        }

        tracing::debug!("Found {} entries", items.len());
        let mut items: Vec<String> = items.into_iter().map(|p| p.to_string()).collect();
        items.sort();
        Ok(items)
    }
}

#[tracing::instrument]
fn collect_list(base: &Utf8Path) -> eyre::Result<Vec<Utf8PathBuf>> {
    let mut files = Vec::new();
    if !base.exists() {
        return Ok(files);
    }

    visit(base, &mut files)?;

    Ok(files
        .into_iter()
        .filter_map(|p| p.strip_prefix(base).ok().map(|p| p.to_owned()))
        .filter(|p| !p.extension().is_some_and(|ext| ext.starts_with("partial-")))
        .collect())
}

fn visit(path: &Utf8Path, files: &mut Vec<Utf8PathBuf>) -> eyre::Result<()> {
    for entry in path.read_dir_utf8().wrap_err_with(|| format!("read {path}"))? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            visit(entry.path(), files)?;
        } else {
            files.push(entry.path().to_owned())
        }
    }

    Ok(())
}
