//! Newline-delimited JSON framing over UNIX stream sockets.

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

use crate::{Envelope, IpcError, MAX_FRAME_BYTES};

/// Read the next envelope from a buffered stream half.
///
/// Returns `Ok(None)` at end of stream. An oversize frame is consumed and
/// reported as [`IpcError::OversizeFrame`] so the caller can count it and
/// keep reading.
pub async fn read_envelope<R>(reader: &mut BufReader<R>) -> Result<Option<Envelope>, IpcError>
where
    R: AsyncRead + Unpin,
{
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            return Ok(None);
        }

        if n > MAX_FRAME_BYTES {
            return Err(IpcError::OversizeFrame { len: n });
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        return Envelope::parse(trimmed).map(Some);
    }
}

/// Write one envelope as a newline-terminated frame.
pub async fn write_envelope<W>(writer: &mut W, envelope: &Envelope) -> Result<(), IpcError>
where
    W: AsyncWrite + Unpin,
{
    let frame = envelope.to_frame()?;
    if frame.len() > MAX_FRAME_BYTES {
        return Err(IpcError::OversizeFrame { len: frame.len() });
    }
    writer.write_all(frame.as_bytes()).await?;
    Ok(())
}

/// Spawn a write queue for one connection. Envelopes sent on the returned
/// channel are written in order; the task exits when the channel closes or
/// the peer goes away.
pub fn spawn_writer<W>(mut writer: W) -> mpsc::Sender<Envelope>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<Envelope>(64);
    tokio::spawn(async move {
        while let Some(envelope) = rx.recv().await {
            if let Err(err) = write_envelope(&mut writer, &envelope).await {
                tracing::debug!(kind = %envelope.kind, ?err, "IPC write failed, closing queue");
                break;
            }
        }
    });
    tx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{msg, Source};
    use tokio::net::UnixStream;
    use serde_json::json;

    #[tokio::test]
    async fn round_trip_over_socket_pair() {
        let (client, server) = UnixStream::pair().unwrap();
        let (read_half, _keep) = tokio::io::split(server);
        let (_keep2, mut write_half) = tokio::io::split(client);

        let envelope = Envelope::new(
            msg::VISION_GLANCE_REQUEST,
            json!({"request_id": "abc"}),
            Source::Core,
        );
        write_envelope(&mut write_half, &envelope).await.unwrap();
        write_half.shutdown().await.unwrap();

        let mut reader = BufReader::new(read_half);
        let received = read_envelope(&mut reader).await.unwrap().unwrap();
        assert_eq!(received.kind, msg::VISION_GLANCE_REQUEST);
        assert_eq!(received.payload["request_id"], json!("abc"));

        assert!(read_envelope(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn oversize_frame_is_surfaced_not_fatal() {
        let (client, server) = UnixStream::pair().unwrap();
        let (read_half, _keep) = tokio::io::split(server);
        let (_keep2, mut write_half) = tokio::io::split(client);

        let big = "x".repeat(MAX_FRAME_BYTES + 16);
        let frame = format!("{{\"type\":\"BIG\",\"payload\":{{\"blob\":\"{big}\"}},\"ts\":0.0,\"source\":\"external\"}}\n");
        write_half.write_all(frame.as_bytes()).await.unwrap();

        let small = Envelope::new(msg::CANCEL, json!({}), Source::External);
        write_envelope(&mut write_half, &small).await.unwrap();
        write_half.shutdown().await.unwrap();

        let mut reader = BufReader::new(read_half);
        match read_envelope(&mut reader).await {
            Err(IpcError::OversizeFrame { len }) => assert!(len > MAX_FRAME_BYTES),
            other => panic!("expected oversize error, got {other:?}"),
        }

        // The stream stays usable after the drop.
        let next = read_envelope(&mut reader).await.unwrap().unwrap();
        assert_eq!(next.kind, msg::CANCEL);
    }

    #[tokio::test]
    async fn writer_queue_preserves_order() {
        let (client, server) = UnixStream::pair().unwrap();
        let (read_half, _keep) = tokio::io::split(server);
        let (_keep2, write_half) = tokio::io::split(client);

        let tx = spawn_writer(write_half);
        for i in 0..5 {
            tx.send(Envelope::new("SEQ", json!({ "i": i }), Source::Core))
                .await
                .unwrap();
        }
        drop(tx);

        let mut reader = BufReader::new(read_half);
        for i in 0..5 {
            let envelope = read_envelope(&mut reader).await.unwrap().unwrap();
            assert_eq!(envelope.payload["i"], json!(i));
        }
    }
}
