//! Verified asset download

use std::sync::Arc;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use stow_core::{Asset, Destination, StowError, StowResult};
use stow_crypto::{plaintext_len, sealed_offset, CryptoError, SignDecrypter, SymmetricKey, VerifyKey, CHUNK_SIZE};
use stow_storage::{ByteRange, RequestSigner};

use crate::progress::{ProgressSink, ProgressTracker};
use crate::upload::AttachmentStore;

impl AttachmentStore {
    /// Fetch, verify and decrypt `asset` into `sink`.
    ///
    /// Returns the number of plaintext bytes written. On failure `sink` holds
    /// exactly the plaintext of the chunks that verified.
    pub async fn download_asset<W>(
        &self,
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
        self.download_asset_from(cancel, dest, asset, sink, signer, progress, 0)
            .await
    }

    /// Like [`download_asset`](Self::download_asset), starting at
    /// `plaintext_offset`, which must fall on a chunk boundary.
    ///
    /// Only the sealed bytes from that chunk onward are requested, so a caller
    /// that kept a verified prefix can continue where it stopped.
    #[allow(clippy::too_many_arguments)]
    pub async fn download_asset_from<W>(
        &self,
        cancel: &CancellationToken,
        dest: &Destination,
        asset: &Asset,
        sink: &mut W,
        signer: &dyn RequestSigner,
        progress: Option<Arc<dyn ProgressSink>>,
        plaintext_offset: u64,
    ) -> StowResult<u64>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let mut written = 0;
        self.stream_plaintext(
            cancel,
            dest,
            asset,
            sink,
            signer,
            progress,
            plaintext_offset,
            &mut written,
        )
        .await?;
        Ok(written)
    }

    /// Download loop shared with the retry helpers; `written` tracks the
    /// verified bytes delivered to `sink` even when the call fails.
    ///
    /// Only writes to `sink` surface as [`StowError::Io`]; a failed write may
    /// leave part of a chunk behind it.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn stream_plaintext<W>(
        &self,
        cancel: &CancellationToken,
        dest: &Destination,
        asset: &Asset,
        sink: &mut W,
        signer: &dyn RequestSigner,
        progress: Option<Arc<dyn ProgressSink>>,
        plaintext_offset: u64,
        written: &mut u64,
    ) -> StowResult<()>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let total = plaintext_len(asset.size).ok_or_else(|| {
            StowError::Framing(format!("{} is not a valid sealed length", asset.size))
        })?;
        if plaintext_offset % CHUNK_SIZE as u64 != 0 || plaintext_offset > total {
            return Err(StowError::Config(format!(
                "download offset {plaintext_offset} is not a chunk boundary within {total} bytes"
            )));
        }

        let key = SymmetricKey::from_bytes(asset.encrypt_key);
        let verify_key = VerifyKey::from_bytes(&asset.verify_key)?;
        let first_index = plaintext_offset / CHUNK_SIZE as u64;
        let range = ByteRange::from_offset(sealed_offset(first_index));

        info!(dest = %dest, offset = plaintext_offset, plaintext = total, "downloading asset");
        let token = cancel.child_token();
        let mut progress =
            ProgressTracker::new(total, progress, token.clone()).starting_at(plaintext_offset);

        let body = tokio::select! {
            _ = token.cancelled() => return Err(StowError::Canceled),
            body = self.object_store().get_object(dest, range, signer) => {
                body.map_err(StowError::transfer)?
            }
        };
        let mut stream = SignDecrypter::new()
            .decrypt_from(body, &key, &verify_key, first_index)
            .with_sealed_len(asset.size.saturating_sub(sealed_offset(first_index)));

        loop {
            progress.check_canceled()?;
            let next = tokio::select! {
                _ = token.cancelled() => return Err(StowError::Canceled),
                next = stream.next_chunk() => next.map_err(source_error)?,
            };
            let Some(chunk) = next else { break };

            sink.write_all(&chunk.payload).await?;
            let len = chunk.payload.len() as u64;
            *written += len;
            progress.advance(len)?;
        }
        sink.flush().await?;

        debug!(dest = %dest, bytes = *written, "asset verified");
        Ok(())
    }
}

/// Read failures of the object body are storage failures; everything else
/// keeps its codec classification.
fn source_error(err: CryptoError) -> StowError {
    match err {
        CryptoError::Io(e) => StowError::transfer(e),
        other => other.into(),
    }
}
