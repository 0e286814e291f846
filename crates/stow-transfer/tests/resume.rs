//! Interrupted uploads: cancellation, resumption and retry.

use std::io::Cursor;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::AsyncWrite;
use tokio_util::sync::CancellationToken;

use stow_core::config::TransferConfig;
use stow_core::{Destination, LocalSource, StowError};
use stow_crypto::{encrypted_len, sealed_offset};
use stow_storage::{KeyedSigner, MemStore, RequestSigner};
use stow_transfer::{
    download_with_retry, upload_with_retry, AttachmentStore, ProgressControl, ProgressSink,
    UploadTask,
};

const MIB: u64 = 1024 * 1024;
const PART: u64 = 5 * MIB;

fn sample(len: u64) -> Vec<u8> {
    (0..len as usize).map(|i| (i % 253) as u8 ^ (i >> 16) as u8).collect()
}

fn signer() -> Arc<dyn RequestSigner> {
    Arc::new(KeyedSigner::new([9u8; 32]))
}

fn config(max_concurrent_parts: usize) -> TransferConfig {
    TransferConfig {
        part_size: PART,
        max_concurrent_parts,
        max_retries: 3,
        retry_backoff_ms: 1,
    }
}

fn task(data: &[u8], dest: &Destination) -> UploadTask {
    UploadTask::new(
        Cursor::new(data.to_vec()),
        dest.clone(),
        LocalSource {
            filename: "video.mp4".into(),
            size: data.len() as u64,
        },
        signer(),
    )
}

/// Sink that aborts the first transfer to pass `limit` bytes.
fn abort_after(limit: u64) -> Arc<dyn ProgressSink> {
    let fired = AtomicBool::new(false);
    Arc::new(move |done: u64, _total: u64| {
        if done > limit && !fired.swap(true, Ordering::SeqCst) {
            ProgressControl::Abort
        } else {
            ProgressControl::Continue
        }
    })
}

async fn fetch(store: &AttachmentStore, dest: &Destination, asset: &stow_core::Asset) -> Vec<u8> {
    let mut out = Vec::new();
    store
        .download_asset(&CancellationToken::new(), dest, asset, &mut out, &*signer(), None)
        .await
        .unwrap();
    out
}

#[tokio::test]
async fn canceled_upload_resumes_without_resending_parts() {
    let mem = Arc::new(MemStore::new());
    let store = AttachmentStore::new(mem.clone(), config(1));
    let dest = Destination::new("attachments", "resume");
    let data = sample(12 * MIB);
    let total = encrypted_len(data.len() as u64);

    let mut t = task(&data, &dest).with_progress(abort_after(7 * MIB));
    let err = store.upload_asset(&CancellationToken::new(), &mut t).await.unwrap_err();
    assert!(err.is_canceled(), "{err}");
    assert_eq!(mem.pending_uploads(), 1, "session stays registered");
    assert!(mem.object(&dest).is_none());
    assert!(store.has_resumable(&dest));
    assert_eq!(mem.stats().parts_received, 2);

    mem.reset_stats();
    t.plaintext = Box::new(Cursor::new(data.clone()));
    let asset = store.upload_asset(&CancellationToken::new(), &mut t).await.unwrap();

    assert_eq!(asset.size, total);
    let stats = mem.stats();
    assert_eq!(stats.parts_received, 1);
    assert_eq!(stats.bytes_received, total - 2 * PART);
    assert_eq!(mem.pending_uploads(), 0);
    assert!(!store.has_resumable(&dest));

    assert_eq!(fetch(&store, &dest, &asset).await, data);
}

#[tokio::test]
async fn token_cancellation_leaves_session_for_retry() {
    let mem = Arc::new(MemStore::new());
    let store = AttachmentStore::new(mem.clone(), config(2));
    let dest = Destination::new("attachments", "token");
    let data = sample(16 * MIB);
    let total = encrypted_len(data.len() as u64);

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let sink: Arc<dyn ProgressSink> = Arc::new(move |done: u64, _: u64| {
        if done >= PART {
            trigger.cancel();
        }
        ProgressControl::Continue
    });

    let mut t = task(&data, &dest).with_progress(sink);
    let err = store.upload_asset(&cancel, &mut t).await.unwrap_err();
    assert!(matches!(err, StowError::Canceled), "{err}");
    assert_eq!(mem.pending_uploads(), 1);

    mem.reset_stats();
    t.progress = None;
    let asset = upload_with_retry(&store, &CancellationToken::new(), &mut t)
        .await
        .unwrap();

    assert_eq!(asset.size, total);
    assert!(mem.stats().bytes_received <= total - PART);
    assert_eq!(fetch(&store, &dest, &asset).await, data);
}

#[tokio::test]
async fn stale_session_without_keys_is_discarded() {
    let mem = Arc::new(MemStore::new());
    let dest = Destination::new("attachments", "stale");
    let data = sample(11 * MIB);
    let total = encrypted_len(data.len() as u64);

    let first = AttachmentStore::new(mem.clone(), config(1));
    let mut t = task(&data, &dest).with_progress(abort_after(PART));
    assert!(first.upload_asset(&CancellationToken::new(), &mut t).await.is_err());
    assert_eq!(mem.pending_uploads(), 1);

    // a new process has no key material for the old session
    let second = AttachmentStore::new(mem.clone(), config(1));
    mem.reset_stats();
    let asset = second
        .upload_asset(&CancellationToken::new(), &mut task(&data, &dest))
        .await
        .unwrap();

    assert_eq!(mem.stats().bytes_received, total, "everything re-sent under new keys");
    assert_eq!(mem.pending_uploads(), 0);
    assert_eq!(fetch(&second, &dest, &asset).await, data);
}

#[tokio::test]
async fn changed_plaintext_restarts_upload() {
    let mem = Arc::new(MemStore::new());
    let store = AttachmentStore::new(mem.clone(), config(1));
    let dest = Destination::new("attachments", "changed");
    let data = sample(11 * MIB);

    let mut t = task(&data, &dest).with_progress(abort_after(PART));
    assert!(store.upload_asset(&CancellationToken::new(), &mut t).await.is_err());

    let mut edited = data.clone();
    edited[10] ^= 0xff;
    let asset = store
        .upload_asset(&CancellationToken::new(), &mut task(&edited, &dest))
        .await
        .unwrap();

    assert_eq!(mem.pending_uploads(), 0);
    assert_eq!(fetch(&store, &dest, &asset).await, edited);
}

#[tokio::test]
async fn retry_recovers_from_transient_part_failure() {
    let mem = Arc::new(MemStore::new());
    let store = AttachmentStore::new(mem.clone(), config(1));
    let dest = Destination::new("attachments", "flaky");
    let data = sample(12 * MIB);

    mem.fail_next_parts(2);
    let asset = upload_with_retry(&store, &CancellationToken::new(), &mut task(&data, &dest))
        .await
        .unwrap();

    assert_eq!(asset.size, encrypted_len(data.len() as u64));
    assert_eq!(fetch(&store, &dest, &asset).await, data);
}

#[tokio::test]
async fn retry_gives_up_after_max_retries() {
    let mem = Arc::new(MemStore::new());
    let store = AttachmentStore::new(mem.clone(), config(1));
    let dest = Destination::new("attachments", "down");
    let data = sample(12 * MIB);

    mem.fail_next_parts(100);
    let err = upload_with_retry(&store, &CancellationToken::new(), &mut task(&data, &dest))
        .await
        .unwrap_err();
    assert!(matches!(err, StowError::Transfer(_)), "{err}");
}

#[tokio::test]
async fn download_with_retry_roundtrip() {
    let mem = Arc::new(MemStore::new());
    let store = AttachmentStore::new(mem.clone(), config(4));
    let dest = Destination::new("attachments", "dl");
    let data = sample(9 * MIB + 17);

    let asset = store
        .upload_asset(&CancellationToken::new(), &mut task(&data, &dest))
        .await
        .unwrap();

    let mut out = Vec::new();
    let n = download_with_retry(
        &store,
        &CancellationToken::new(),
        &dest,
        &asset,
        &mut out,
        &*signer(),
        None,
    )
    .await
    .unwrap();
    assert_eq!(n, data.len() as u64);
    assert_eq!(out, data);
}

#[tokio::test]
async fn download_with_retry_stops_on_integrity_failure() {
    let mem = Arc::new(MemStore::new());
    let store = AttachmentStore::new(mem.clone(), config(4));
    let dest = Destination::new("attachments", "bad");
    let data = sample(2 * MIB);

    let asset = store
        .upload_asset(&CancellationToken::new(), &mut task(&data, &dest))
        .await
        .unwrap();
    let mut sealed = mem.object(&dest).unwrap().to_vec();
    let last = sealed.len() - 1;
    sealed[last] ^= 0x40;
    mem.replace_object(&dest, sealed.into());

    mem.reset_stats();
    let mut out = Vec::new();
    let err = download_with_retry(&store, &CancellationToken::new(), &dest, &asset, &mut out, &*signer(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, StowError::Integrity { index: 2 }), "{err}");
    assert_eq!(out, data);
    assert_eq!(mem.stats().signed_requests, 1, "integrity failures are not retried");
}

#[tokio::test]
async fn download_with_retry_retries_body_cut_inside_chunk() {
    let mem = Arc::new(MemStore::new());
    let store = AttachmentStore::new(mem.clone(), config(4));
    let dest = Destination::new("attachments", "cut");
    let data = sample(3 * MIB + 10);

    let asset = store
        .upload_asset(&CancellationToken::new(), &mut task(&data, &dest))
        .await
        .unwrap();
    let sealed = mem.object(&dest).unwrap();
    mem.replace_object(&dest, sealed.slice(..sealed_offset(1) as usize + 500 * 1024));

    mem.reset_stats();
    let mut out = Vec::new();
    let err = download_with_retry(&store, &CancellationToken::new(), &dest, &asset, &mut out, &*signer(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, StowError::Truncation { chunks: 1 }), "{err}");
    assert!(err.is_retryable());
    assert_eq!(out, &data[..MIB as usize]);
    assert_eq!(mem.stats().signed_requests, 1 + 3, "every retry re-requests the tail");
}

/// Accepts `limit` bytes, then fails every write.
struct FullDisk {
    buf: Vec<u8>,
    limit: usize,
}

impl AsyncWrite for FullDisk {
    fn poll_write(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let room = self.limit - self.buf.len();
        if room == 0 {
            return Poll::Ready(Err(std::io::Error::other("disk full")));
        }
        let n = room.min(data.len());
        self.buf.extend_from_slice(&data[..n]);
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[tokio::test]
async fn download_with_retry_stops_on_sink_failure() {
    let mem = Arc::new(MemStore::new());
    let store = AttachmentStore::new(mem.clone(), config(4));
    let dest = Destination::new("attachments", "full-disk");
    let data = sample(3 * MIB);

    let asset = store
        .upload_asset(&CancellationToken::new(), &mut task(&data, &dest))
        .await
        .unwrap();

    mem.reset_stats();
    let limit = MIB as usize + 1000;
    let mut sink = FullDisk {
        buf: Vec::new(),
        limit,
    };
    let err = download_with_retry(&store, &CancellationToken::new(), &dest, &asset, &mut sink, &*signer(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, StowError::Io(_)), "{err}");
    assert_eq!(mem.stats().signed_requests, 1, "sink failures are not retried");
    assert_eq!(sink.buf, &data[..limit], "no chunk is written twice");
}
