use std::path::{Path, PathBuf};

use log::debug;
use tokio::fs::{self, File};
use tokio::io::{AsyncRead, AsyncWriteExt};

use crate::cryptography::{decrypt_copy, path_digest};
use crate::{Result, DEFAULT_SEGMENT_LEN, KEY_SIZE};

/// Storage-layout record for one key: the ordered directory segments and
/// the filename, both derived from the same digest. Joining the segments
/// and appending the filename yields the path below the owner directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathKey {
    pub segments: Vec<String>,
    pub filename: String,
}

impl PathKey {
    /// Directory part of the layout, below the owner segment.
    pub fn dir_path(&self) -> PathBuf {
        self.segments.iter().collect()
    }

    /// Full path of the content file, below the owner segment.
    pub fn full_path(&self) -> PathBuf {
        self.dir_path().join(&self.filename)
    }

    /// First directory segment; the unit of deletion.
    pub fn root_segment(&self) -> &str {
        &self.segments[0]
    }
}

/// Mapping from a key to its on-disk layout.
#[derive(Debug, Clone)]
pub enum PathTransform {
    /// Reference layout: hash the key to a 160-bit hex digest and split
    /// it every `segment_len` characters, bounding per-directory fanout.
    /// `segment_len` must divide the 40-character digest evenly.
    Hash { segment_len: usize },
    /// Flat layout using the key verbatim. Test and bench use only.
    Identity,
}

impl PathTransform {
    pub fn hash(segment_len: usize) -> Self {
        debug_assert!(segment_len > 0 && 40 % segment_len == 0);
        PathTransform::Hash { segment_len }
    }

    pub fn transform(&self, key: &str) -> PathKey {
        match self {
            PathTransform::Hash { segment_len } => {
                let digest = path_digest(key);
                let segments = digest
                    .as_bytes()
                    .chunks(*segment_len)
                    .map(|c| String::from_utf8_lossy(c).into_owned())
                    .collect();
                PathKey {
                    segments,
                    filename: digest,
                }
            }
            PathTransform::Identity => PathKey {
                segments: vec![key.to_string()],
                filename: key.to_string(),
            },
        }
    }
}

impl Default for PathTransform {
    fn default() -> Self {
        PathTransform::hash(DEFAULT_SEGMENT_LEN)
    }
}

/// Content-addressed store rooted at a single directory. Every operation
/// is scoped by the id of the node that originated the data, so a node's
/// own plaintext originals and the ciphertext replicas it holds for
/// others never share a subtree.
#[derive(Debug, Clone)]
pub struct Store {
    root: PathBuf,
    transform: PathTransform,
}

impl Store {
    pub fn new(root: impl Into<PathBuf>, transform: PathTransform) -> Self {
        Self {
            root: root.into(),
            transform,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Full on-disk path for a key held on behalf of `owner`.
    pub fn path_for(&self, owner: &str, key: &str) -> PathBuf {
        self.root.join(owner).join(self.transform.transform(key).full_path())
    }

    /// Whether the key resolves to an existing regular file. Any other
    /// outcome, including filesystem errors, reports false.
    pub fn has(&self, owner: &str, key: &str) -> bool {
        let path = self.path_for(owner, key);
        match std::fs::metadata(&path) {
            Ok(meta) => meta.is_file(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => {
                debug!("stat of {} failed: {}", path.display(), e);
                false
            }
        }
    }

    /// Copy `src` in full into the file for (owner, key), creating the
    /// intermediate directories and truncating any previous content.
    /// Returns the number of bytes written.
    pub async fn write<R>(&self, owner: &str, key: &str, src: &mut R) -> Result<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut file = self.create(owner, key).await?;
        let written = tokio::io::copy(src, &mut file).await?;
        file.flush().await?;

        debug!(
            "wrote {} bytes to {}",
            written,
            self.path_for(owner, key).display()
        );
        Ok(written)
    }

    /// Like `write`, but pipe `src` through the stream decryption codec.
    /// Returns the number of plaintext bytes written.
    pub async fn write_decrypt<R>(
        &self,
        enc_key: &[u8; KEY_SIZE],
        owner: &str,
        key: &str,
        src: &mut R,
    ) -> Result<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut file = self.create(owner, key).await?;
        let written = decrypt_copy(enc_key, src, &mut file).await?;

        debug!(
            "wrote {} decrypted bytes to {}",
            written,
            self.path_for(owner, key).display()
        );
        Ok(written)
    }

    /// Open the file for (owner, key) and return its size alongside the
    /// reader. The caller drops the file handle when done.
    pub async fn read(&self, owner: &str, key: &str) -> Result<(u64, File)> {
        let path = self.path_for(owner, key);
        let file = File::open(&path).await?;
        let size = file.metadata().await?.len();
        Ok((size, file))
    }

    /// Remove the whole first-segment subtree that (owner, key) lives
    /// under. With the hash layout each value tends to get a unique first
    /// segment, so this usually removes exactly one value; two keys
    /// sharing a first segment are removed together. Deleting what is
    /// already absent is not an error.
    pub async fn delete(&self, owner: &str, key: &str) -> Result<()> {
        let path_key = self.transform.transform(key);
        let subtree = self.root.join(owner).join(path_key.root_segment());

        match fs::remove_dir_all(&subtree).await {
            Ok(()) => {
                debug!("deleted {}", subtree.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove the entire storage root.
    pub async fn clear(&self) -> Result<()> {
        match fs::remove_dir_all(&self.root).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn create(&self, owner: &str, key: &str) -> Result<File> {
        let path_key = self.transform.transform(key);
        let dir = self.root.join(owner).join(path_key.dir_path());
        fs::create_dir_all(&dir).await?;
        Ok(File::create(dir.join(&path_key.filename)).await?)
    }
}
