//! Upload task description

use std::path::Path;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncSeek};

use stow_core::{Destination, LocalSource, StowResult};
use stow_storage::RequestSigner;

use crate::progress::ProgressSink;

/// Rewindable plaintext input. Retries seek it back to the start.
pub trait PlaintextSource: AsyncRead + AsyncSeek + Unpin + Send {}

impl<T> PlaintextSource for T where T: AsyncRead + AsyncSeek + Unpin + Send {}

/// Everything needed to upload one attachment.
pub struct UploadTask {
    pub plaintext: Box<dyn PlaintextSource>,
    pub destination: Destination,
    pub local: LocalSource,
    pub signer: Arc<dyn RequestSigner>,
    /// Opaque id of the conversation the attachment belongs to; only logged.
    pub conversation_id: Vec<u8>,
    pub progress: Option<Arc<dyn ProgressSink>>,
}

impl UploadTask {
    pub fn new(
        plaintext: impl PlaintextSource + 'static,
        destination: Destination,
        local: LocalSource,
        signer: Arc<dyn RequestSigner>,
    ) -> Self {
        Self {
            plaintext: Box::new(plaintext),
            destination,
            local,
            signer,
            conversation_id: Vec::new(),
            progress: None,
        }
    }

    /// Build a task that reads `path`, sized from its metadata.
    pub async fn from_file(
        path: &Path,
        destination: Destination,
        signer: Arc<dyn RequestSigner>,
    ) -> StowResult<Self> {
        let file = tokio::fs::File::open(path).await?;
        let size = file.metadata().await?.len();
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(Self::new(
            file,
            destination,
            LocalSource { filename, size },
            signer,
        ))
    }

    pub fn with_conversation_id(mut self, id: impl Into<Vec<u8>>) -> Self {
        self.conversation_id = id.into();
        self
    }

    pub fn with_progress(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.progress = Some(sink);
        self
    }

    pub(crate) fn conversation_hex(&self) -> String {
        use std::fmt::Write;
        self.conversation_id
            .iter()
            .fold(String::with_capacity(self.conversation_id.len() * 2), |mut s, b| {
                let _ = write!(s, "{b:02x}");
                s
            })
    }
}

impl std::fmt::Debug for UploadTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadTask")
            .field("destination", &self.destination)
            .field("local", &self.local)
            .field("conversation_id", &self.conversation_hex())
            .field("progress", &self.progress.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use stow_storage::KeyedSigner;

    #[test]
    fn test_conversation_hex() {
        let task = UploadTask::new(
            Cursor::new(Vec::new()),
            Destination::new("b", "k"),
            LocalSource { filename: "f".into(), size: 0 },
            Arc::new(KeyedSigner::new([0u8; 32])),
        )
        .with_conversation_id(vec![0x0a, 0xff]);
        assert_eq!(task.conversation_hex(), "0aff");
    }

    #[tokio::test]
    async fn test_from_file_reads_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("photo.jpg");
        std::fs::write(&path, vec![7u8; 1234]).unwrap();

        let task = UploadTask::from_file(&path, Destination::new("b", "k"), Arc::new(KeyedSigner::new([0u8; 32])))
            .await
            .unwrap();
        assert_eq!(task.local.size, 1234);
        assert_eq!(task.local.filename, "photo.jpg");
    }
}
