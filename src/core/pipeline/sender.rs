//! Chunk sender.
//!
//! Reads the file one chunk at a time, waits while the channel's outbound
//! buffer is above the threshold, sends the frame, records progress and
//! yields to the scheduler before the next chunk. Resumed sessions start at
//! `last_chunk_index + 1`.

use super::chunk::{encode_frame, hex_digest, ChunkMeta};
use crate::core::config::{TransferConfig, BACKPRESSURE_RECHECK};
use crate::core::connection::PeerChannel;
use crate::core::error::TransferError;
use crate::core::session::TransferSession;
use sha3::{Digest, Sha3_256};
use std::io::SeekFrom;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt};
use tracing::{debug, info, warn};

const HASH_BUF: usize = 256 * 1024;

/// SHA3-256 of the whole stream as lowercase hex. Rewinds to the start.
pub async fn compute_checksum<R>(reader: &mut R) -> Result<String, TransferError>
where
    R: AsyncRead + AsyncSeek + Unpin,
{
    reader.seek(SeekFrom::Start(0)).await?;
    let mut hasher = Sha3_256::new();
    let mut buf = vec![0u8; HASH_BUF];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    reader.seek(SeekFrom::Start(0)).await?;
    Ok(hex_digest(hasher))
}

/// Fill `buf` from `reader` until full or EOF. Returns bytes read.
async fn read_chunk<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Block until the channel's buffered amount is at or below `threshold`.
///
/// Woken by the low-buffer callback, with a periodic re-check in case the
/// callback is missed.
pub async fn wait_for_buffer(channel: &dyn PeerChannel, threshold: usize) -> Result<(), TransferError> {
    let low = channel.buffered_amount_low();
    let mut logged = false;
    loop {
        let notified = low.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if !channel.is_open() {
            return Err(TransferError::ChannelUnavailable);
        }
        let buffered = channel.buffered_amount().await;
        if buffered <= threshold {
            return Ok(());
        }
        if !logged {
            debug!(
                event = "backpressure_wait",
                buffered,
                threshold,
                "Waiting for data channel buffer to drain"
            );
            logged = true;
        }
        let _ = tokio::time::timeout(BACKPRESSURE_RECHECK, notified).await;
    }
}

/// Send `session`'s remaining chunks from `reader` over `channel`.
///
/// `on_chunk` runs after every delivered chunk with the updated session and
/// the payload size, so the caller can persist progress and publish events.
pub async fn send_chunks<R, F>(
    channel: &dyn PeerChannel,
    reader: &mut R,
    session: &mut TransferSession,
    config: &TransferConfig,
    mut on_chunk: F,
) -> Result<(), TransferError>
where
    R: AsyncRead + AsyncSeek + Unpin,
    F: FnMut(&TransferSession, usize),
{
    let chunk_size = config.chunk_size;
    let start = session.next_index();
    if start >= session.total_chunks {
        session.completed = true;
        return Ok(());
    }

    reader
        .seek(SeekFrom::Start(u64::from(start) * chunk_size as u64))
        .await?;
    info!(
        event = "send_started",
        session = %session.id,
        file = %session.file_name,
        from_chunk = start,
        total_chunks = session.total_chunks,
    );

    let mut buf = vec![0u8; chunk_size];
    for index in start..session.total_chunks {
        let n = read_chunk(reader, &mut buf).await?;
        let is_last = index + 1 == session.total_chunks;
        let mut meta = ChunkMeta::new(index, is_last);
        if is_last && !session.checksum.is_empty() {
            meta.checksum = Some(session.checksum.clone());
        }
        let frame = encode_frame(&meta, &buf[..n])?;

        wait_for_buffer(channel, config.buffered_amount_threshold).await?;
        channel.send(frame).await.map_err(|e| {
            warn!(event = "chunk_send_failure", session = %session.id, index, error = %e);
            TransferError::ChannelUnavailable
        })?;

        session.record_chunk(index);
        on_chunk(session, n);
        tokio::task::yield_now().await;
    }

    info!(event = "send_finished", session = %session.id, file = %session.file_name);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::connection::mock::MockChannel;
    use crate::core::pipeline::chunk::decode_frame;
    use crate::core::pipeline::receiver::ChunkReceiver;
    use bytes::Bytes;
    use std::io::Cursor;
    use std::sync::Arc;
    use std::time::Duration;

    const C: usize = 16 * 1024;

    fn config() -> TransferConfig {
        TransferConfig::from_kib(16)
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    async fn send_all(data: &[u8], session: &mut TransferSession) -> Arc<MockChannel> {
        let channel = MockChannel::new();
        let mut reader = Cursor::new(data.to_vec());
        send_chunks(channel.as_ref(), &mut reader, session, &config(), |_, _| {})
            .await
            .unwrap();
        channel
    }

    fn reassemble(frames: &[Bytes], size: u64) -> Bytes {
        let mut rx = ChunkReceiver::new("f", size);
        let mut out = None;
        for f in frames {
            if let Some(done) = rx.accept(f).unwrap().assembled {
                out = Some(done);
            }
        }
        out.expect("transfer never completed")
    }

    #[tokio::test]
    async fn chunk_round_trip_for_boundary_sizes() {
        for size in [0, C - 1, C, C + 1, 10 * C + 37] {
            let data = pattern(size);
            let mut session = TransferSession::new("f", size as u64, "peer", C);
            let channel = send_all(&data, &mut session).await;
            let frames = channel.sent();
            assert_eq!(frames.len() as u32, session.total_chunks, "size {size}");
            assert!(session.completed);
            assert_eq!(&reassemble(&frames, size as u64)[..], &data[..], "size {size}");
        }
    }

    #[tokio::test]
    async fn resumed_send_skips_delivered_chunks() {
        let size = 10 * C + 37;
        let data = pattern(size);

        let mut first = TransferSession::new("f", size as u64, "peer", C);
        let channel = MockChannel::new();
        channel.fail_after(4);
        let mut reader = Cursor::new(data.clone());
        let err = send_chunks(channel.as_ref(), &mut reader, &mut first, &config(), |_, _| {})
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::ChannelUnavailable));
        assert_eq!(first.last_chunk_index, Some(3));

        // Session reloaded from the store with last_chunk_index = 3.
        let mut resumed = first.clone();
        let channel2 = send_all(&data, &mut resumed).await;
        let second = channel2.sent();
        let indices: Vec<u32> = second
            .iter()
            .map(|f| decode_frame(f).unwrap().0.index)
            .collect();
        assert_eq!(indices, (4..11).collect::<Vec<_>>());

        let mut all = channel.sent();
        all.extend(second);
        assert_eq!(&reassemble(&all, size as u64)[..], &data[..]);
    }

    #[tokio::test]
    async fn last_chunk_carries_checksum() {
        let data = pattern(C + 5);
        let mut session = TransferSession::new("f", data.len() as u64, "peer", C);
        let mut reader = Cursor::new(data.clone());
        session.checksum = compute_checksum(&mut reader).await.unwrap();
        let channel = send_all(&data, &mut session).await;
        let frames = channel.sent();
        let (first, _) = decode_frame(&frames[0]).unwrap();
        let (last, _) = decode_frame(&frames[1]).unwrap();
        assert_eq!(first.checksum, None);
        assert_eq!(last.checksum.as_deref(), Some(session.checksum.as_str()));
        assert_eq!(session.checksum, super::super::chunk::checksum(&data));
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_low_buffer_before_sending() {
        let threshold = config().buffered_amount_threshold;
        let channel = MockChannel::new();
        channel.set_buffered(threshold + 1);

        let data = pattern(3 * C);
        let task = {
            let channel = channel.clone();
            tokio::spawn(async move {
                let mut session = TransferSession::new("f", data.len() as u64, "peer", C);
                let mut reader = Cursor::new(data);
                send_chunks(channel.as_ref(), &mut reader, &mut session, &config(), |_, _| {}).await
            })
        };

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(channel.sent().is_empty());

        channel.drain();
        task.await.unwrap().unwrap();
        assert_eq!(channel.sent().len(), 3);
        assert!(channel.buffered_at_send().iter().all(|b| *b <= threshold));
    }

    #[tokio::test]
    async fn closed_channel_aborts_send() {
        let channel = MockChannel::new();
        channel.set_open(false);
        let mut session = TransferSession::new("f", 10, "peer", C);
        let mut reader = Cursor::new(vec![0u8; 10]);
        let err = send_chunks(channel.as_ref(), &mut reader, &mut session, &config(), |_, _| {})
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::ChannelUnavailable));
        assert_eq!(session.last_chunk_index, None);
    }
}
