//! Consumers of the tensor stream
//!
//! [`drain`] pulls messages until a terminal marker arrives and hands each
//! one to a [`Sink`]. An `Exit` marker turns into [`LoaderError::Aborted`]
//! after the sink has seen it, so sinks can discard partial output.

use crate::errors::{LoaderError, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tracing::{debug, info, warn};

use super::{LoaderMessage, MessageReceiver};

/// Maximum encoded size of one stream frame (1 GiB)
pub const FRAME_SIZE_LIMIT: usize = 1 << 30;

/// Receives stream messages in order
#[async_trait]
pub trait Sink: Send {
    async fn accept(&mut self, message: LoaderMessage) -> Result<()>;
}

/// Totals over the non-terminal messages of a stream
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamSummary {
    pub messages: usize,
    pub tensors: usize,
    pub bytes: usize,
}

/// Feed every message from `rx` into `sink` until the stream terminates
pub async fn drain<S: Sink + ?Sized>(
    rx: &mut MessageReceiver,
    sink: &mut S,
) -> Result<StreamSummary> {
    let mut summary = StreamSummary::default();
    while let Some(message) = rx.recv().await {
        match message {
            LoaderMessage::Done => {
                sink.accept(LoaderMessage::Done).await?;
                info!(
                    messages = summary.messages,
                    tensors = summary.tensors,
                    bytes = summary.bytes,
                    "Stream finished"
                );
                return Ok(summary);
            }
            LoaderMessage::Exit { reason } => {
                warn!(reason = %reason, "Producer aborted the stream");
                sink.accept(LoaderMessage::Exit {
                    reason: reason.clone(),
                })
                .await?;
                return Err(LoaderError::Aborted(reason));
            }
            message => {
                if let LoaderMessage::Tensors(named) = &message {
                    summary.tensors += named.tensors.len();
                    summary.bytes += named.size_bytes();
                }
                summary.messages += 1;
                sink.accept(message).await?;
            }
        }
    }
    Err(LoaderError::Channel(
        "stream closed without a terminal marker".to_string(),
    ))
}

/// Keeps every message in memory
#[derive(Debug, Default)]
pub struct CollectSink {
    pub messages: Vec<LoaderMessage>,
}

impl CollectSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Message names in arrival order
    pub fn names(&self) -> Vec<&str> {
        self.messages.iter().map(LoaderMessage::name).collect()
    }
}

#[async_trait]
impl Sink for CollectSink {
    async fn accept(&mut self, message: LoaderMessage) -> Result<()> {
        self.messages.push(message);
        Ok(())
    }
}

/// Logs one line per message with its tensor shapes
#[derive(Debug, Default)]
pub struct SummarySink;

#[async_trait]
impl Sink for SummarySink {
    async fn accept(&mut self, message: LoaderMessage) -> Result<()> {
        match &message {
            LoaderMessage::Metadata(md) => info!(
                model_type = %md.model_type,
                layers = md.num_layers,
                hidden = md.hidden_size,
                tp = md.previous_tensor_parallel_size,
                pp = md.previous_pipeline_parallel_size,
                consumed_train = md.consumed_train_samples,
                "Received metadata"
            ),
            LoaderMessage::Tensors(named) => {
                for (label, tensor) in &named.tensors {
                    debug!(bundle = %named.name, label = %label, shape = ?tensor.shape, "Tensor");
                }
                info!(name = %named.name, tensors = named.tensors.len(), "Received message");
            }
            LoaderMessage::Done => info!("Received done marker"),
            LoaderMessage::Exit { reason } => warn!(reason = %reason, "Received exit marker"),
        }
        Ok(())
    }
}

/// Encode one length-prefixed CBOR frame (u32 big-endian length)
pub async fn write_frame<W>(writer: &mut W, message: &LoaderMessage) -> Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    let mut buf = Vec::new();
    ciborium::into_writer(message, &mut buf)?;
    if buf.len() > FRAME_SIZE_LIMIT {
        return Err(LoaderError::Serialization(format!(
            "message '{}' encodes to {} bytes, exceeds frame limit {}",
            message.name(),
            buf.len(),
            FRAME_SIZE_LIMIT
        )));
    }
    let len = buf.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&buf).await?;
    Ok(())
}

/// Decode the next frame; `None` only when input ends on a frame boundary
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<LoaderMessage>>
where
    R: AsyncRead + Unpin + Send,
{
    let mut len_buf = [0u8; 4];
    match reader.read_u8().await {
        Ok(byte) => len_buf[0] = byte,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    reader.read_exact(&mut len_buf[1..]).await.map_err(|e| {
        LoaderError::Serialization(format!("truncated frame header: {}", e))
    })?;
    let len = u32::from_be_bytes(len_buf) as usize;

    if len > FRAME_SIZE_LIMIT {
        return Err(LoaderError::Serialization(format!(
            "frame size {} exceeds limit {}",
            len, FRAME_SIZE_LIMIT
        )));
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await.map_err(|e| {
        LoaderError::Serialization(format!("truncated frame of {} bytes: {}", len, e))
    })?;
    Ok(Some(ciborium::from_reader(&buf[..])?))
}

/// Read back every frame of a stream file
pub async fn read_stream(path: &Path) -> Result<Vec<LoaderMessage>> {
    let mut reader = BufReader::new(File::open(path).await?);
    let mut messages = Vec::new();
    while let Some(message) = read_frame(&mut reader).await? {
        messages.push(message);
    }
    Ok(messages)
}

/// Writes the stream to a file of CBOR frames
///
/// The file is removed when the stream ends with `Exit`.
pub struct CborStreamSink {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    frames: usize,
}

impl CborStreamSink {
    pub async fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = File::create(&path).await?;
        Ok(Self {
            path,
            writer: Some(BufWriter::new(file)),
            frames: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn frames(&self) -> usize {
        self.frames
    }

    fn writer(&mut self) -> Result<&mut BufWriter<File>> {
        self.writer.as_mut().ok_or_else(|| {
            LoaderError::Internal(format!(
                "stream file {} already closed",
                self.path.display()
            ))
        })
    }
}

#[async_trait]
impl Sink for CborStreamSink {
    async fn accept(&mut self, message: LoaderMessage) -> Result<()> {
        match message {
            LoaderMessage::Exit { .. } => {
                if let Some(mut writer) = self.writer.take() {
                    writer.shutdown().await?;
                }
                tokio::fs::remove_file(&self.path).await?;
                warn!(path = %self.path.display(), "Discarded partial stream file");
            }
            message => {
                let done = message == LoaderMessage::Done;
                let writer = self.writer()?;
                write_frame(writer, &message).await?;
                self.frames += 1;
                if done {
                    if let Some(mut writer) = self.writer.take() {
                        writer.shutdown().await?;
                    }
                    info!(path = %self.path.display(), frames = self.frames, "Wrote stream file");
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{channel, NamedTensors};
    use crate::tensor::Tensor;
    use tempfile::TempDir;

    fn layer(i: usize) -> LoaderMessage {
        let mut msg = NamedTensors::new(format!("transformer layer {}", i));
        msg.insert("qkv weight", Tensor::zeros(vec![3, 2]));
        LoaderMessage::Tensors(msg)
    }

    #[tokio::test]
    async fn test_drain_stops_at_done() {
        let (tx, mut rx) = channel(8);
        tx.send(layer(0)).await.unwrap();
        tx.send(layer(1)).await.unwrap();
        tx.done().await.unwrap();

        let mut sink = CollectSink::new();
        let summary = drain(&mut rx, &mut sink).await.unwrap();
        assert_eq!(
            summary,
            StreamSummary {
                messages: 2,
                tensors: 2,
                bytes: 48
            }
        );
        assert_eq!(
            sink.names(),
            vec!["transformer layer 0", "transformer layer 1", "done"]
        );
    }

    #[tokio::test]
    async fn test_drain_reports_abort() {
        let (tx, mut rx) = channel(8);
        tx.send(layer(0)).await.unwrap();
        tx.exit("shard tp=1 diverges").await.unwrap();

        let mut sink = CollectSink::new();
        match drain(&mut rx, &mut sink).await {
            Err(LoaderError::Aborted(reason)) => assert_eq!(reason, "shard tp=1 diverges"),
            other => panic!("expected Aborted, got {:?}", other),
        }
        assert_eq!(sink.names(), vec!["transformer layer 0", "exit"]);
    }

    #[tokio::test]
    async fn test_drain_without_marker_is_channel_error() {
        let (tx, mut rx) = channel(8);
        tx.send(layer(0)).await.unwrap();
        drop(tx);
        let result = drain(&mut rx, &mut SummarySink).await;
        assert!(matches!(result, Err(LoaderError::Channel(_))));
    }

    #[tokio::test]
    async fn test_cbor_sink_writes_frames() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out").join("stream.cbor");
        let mut sink = CborStreamSink::create(&path).await.unwrap();

        sink.accept(layer(0)).await.unwrap();
        sink.accept(LoaderMessage::Done).await.unwrap();
        assert_eq!(sink.frames(), 2);

        let messages = read_stream(&path).await.unwrap();
        assert_eq!(messages, vec![layer(0), LoaderMessage::Done]);
    }

    #[tokio::test]
    async fn test_cbor_sink_discards_on_exit() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stream.cbor");
        let mut sink = CborStreamSink::create(&path).await.unwrap();

        sink.accept(layer(0)).await.unwrap();
        sink.accept(LoaderMessage::Exit {
            reason: "boom".to_string(),
        })
        .await
        .unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_truncated_header_is_an_error() {
        let mut bytes = Vec::new();
        write_frame(&mut bytes, &LoaderMessage::Done).await.unwrap();
        let mut reader = &bytes[..];
        assert_eq!(read_frame(&mut reader).await.unwrap(), Some(LoaderMessage::Done));
        assert_eq!(read_frame(&mut reader).await.unwrap(), None);

        bytes.extend_from_slice(&[0x00, 0x01]);
        let mut reader = &bytes[..];
        read_frame(&mut reader).await.unwrap();
        assert!(matches!(
            read_frame(&mut reader).await,
            Err(LoaderError::Serialization(_))
        ));
    }

    #[tokio::test]
    async fn test_truncated_payload_is_an_error() {
        let mut bytes = Vec::new();
        write_frame(&mut bytes, &layer(0)).await.unwrap();
        bytes.truncate(bytes.len() - 3);
        let mut reader = &bytes[..];
        assert!(matches!(
            read_frame(&mut reader).await,
            Err(LoaderError::Serialization(_))
        ));
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let bytes = [0xFF, 0xFF, 0xFF, 0xF0, 0x00];
        let mut reader = &bytes[..];
        match read_frame(&mut reader).await {
            Err(LoaderError::Serialization(msg)) => assert!(msg.contains("exceeds limit")),
            other => panic!("expected frame limit error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_read_stream_rejects_cut_off_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stream.cbor");
        let mut sink = CborStreamSink::create(&path).await.unwrap();
        sink.accept(layer(0)).await.unwrap();
        sink.accept(LoaderMessage::Done).await.unwrap();

        let mut bytes = tokio::fs::read(&path).await.unwrap();
        bytes.extend_from_slice(&[0x00, 0x01]);
        tokio::fs::write(&path, &bytes).await.unwrap();
        assert!(read_stream(&path).await.is_err());
    }
}
