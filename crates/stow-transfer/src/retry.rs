//! Retry loops around upload and download
//!
//! Both stop at the first non-retryable failure (integrity, ordering,
//! framing, configuration) and on cancellation. Delays grow linearly with
//! the attempt number.

use std::io::SeekFrom;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncSeekExt, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use stow_core::{Asset, Destination, StowError, StowResult};
use stow_storage::RequestSigner;

use crate::progress::ProgressSink;
use crate::task::UploadTask;
use crate::upload::AttachmentStore;

/// Upload `task`, rewinding its plaintext to the start before every attempt.
///
/// Attempts after the first resume the multi-part session the previous
/// attempt left behind.
pub async fn upload_with_retry(
    store: &AttachmentStore,
    cancel: &CancellationToken,
    task: &mut UploadTask,
) -> StowResult<Asset> {
    let max_retries = store.config().max_retries;
    let mut attempt = 0u32;
    loop {
        task.plaintext.seek(SeekFrom::Start(0)).await?;
        let err = match store.upload_asset(cancel, task).await {
            Ok(asset) => return Ok(asset),
            Err(e) => e,
        };
        if !should_retry(&err, attempt, max_retries) {
            return Err(err);
        }
        attempt += 1;
        warn!(
            dest = %task.destination,
            attempt,
            max_retries,
            error = %err,
            "upload failed; retrying"
        );
        backoff(store, cancel, attempt).await?;
    }
}

/// Download `asset` into `sink`, continuing after the last verified chunk
/// when an attempt fails part-way.
pub async fn download_with_retry<W>(
    store: &AttachmentStore,
    cancel: &CancellationToken,
    dest: &Destination,
    asset: &Asset,
    sink: &mut W,
    signer: &dyn RequestSigner,
    progress: Option<Arc<dyn ProgressSink>>,
) -> StowResult<u64>
where
    W: AsyncWrite + Unpin + Send,
{
    let max_retries = store.config().max_retries;
    let mut written = 0u64;
    let mut attempt = 0u32;
    loop {
        let err = match store
            .stream_plaintext(
                cancel,
                dest,
                asset,
                sink,
                signer,
                progress.clone(),
                written,
                &mut written,
            )
            .await
        {
            Ok(()) => return Ok(written),
            Err(e) => e,
        };
        if !should_resume_download(&err, attempt, max_retries) {
            return Err(err);
        }
        attempt += 1;
        warn!(
            dest = %dest,
            attempt,
            max_retries,
            verified = written,
            error = %err,
            "download failed; resuming"
        );
        backoff(store, cancel, attempt).await?;
    }
}

fn should_retry(err: &StowError, attempt: u32, max_retries: u32) -> bool {
    !err.is_canceled() && err.is_retryable() && attempt < max_retries
}

/// Sink write failures end the download: the sink may already hold part of
/// the chunk being written, so resuming after `written` would duplicate it.
fn should_resume_download(err: &StowError, attempt: u32, max_retries: u32) -> bool {
    !matches!(err, StowError::Io(_)) && should_retry(err, attempt, max_retries)
}

async fn backoff(store: &AttachmentStore, cancel: &CancellationToken, attempt: u32) -> StowResult<()> {
    let delay = Duration::from_millis(store.config().retry_backoff_ms.saturating_mul(attempt.into()));
    tokio::select! {
        _ = cancel.cancelled() => Err(StowError::Canceled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_retry() {
        let transfer = StowError::transfer(anyhow::anyhow!("reset"));
        assert!(should_retry(&transfer, 0, 3));
        assert!(!should_retry(&transfer, 3, 3));
        assert!(!should_retry(&StowError::Canceled, 0, 3));
        assert!(!should_retry(&StowError::Integrity { index: 0 }, 0, 3));
        assert!(should_retry(&StowError::Truncation { chunks: 1 }, 0, 3));
    }

    #[test]
    fn test_sink_errors_end_download() {
        let sink = StowError::Io(std::io::Error::other("disk full"));
        assert!(should_retry(&sink, 0, 3));
        assert!(!should_resume_download(&sink, 0, 3));
        assert!(should_resume_download(&StowError::Truncation { chunks: 1 }, 0, 3));
    }
}
