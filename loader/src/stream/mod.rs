//! Stream emitter and the message channel it writes to
//!
//! The loader is a producer: it pushes an ordered sequence of messages into
//! a bounded channel and a consumer (a converter or saver) drains it.
//!
//! ```text
//! Metadata ─► "embeddings" ─► "transformer layer 0" ─► ... ─► "transformer layer N-1"
//!          ─► "final norm" ─► ["output layer"] ─► [BERT heads] ─► ["logits_check"] ─► Done
//!
//! any fault ─► Exit { reason }
//! ```
//!
//! Every stream ends with exactly one terminal marker. The producer never
//! waits for acknowledgements; with the default capacity of 1 it blocks
//! until the consumer has taken the previous message.

pub mod emitter;
pub mod sink;

pub use emitter::{load_checkpoint, Emitter};
pub use sink::{drain, CborStreamSink, CollectSink, Sink, StreamSummary, SummarySink};

use crate::checkpoint::ModelMetadata;
use crate::errors::{LoaderError, Result};
use crate::tensor::Tensor;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::mpsc;
use tracing::info;

/// A named bundle of merged tensors, e.g. `"transformer layer 3"`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedTensors {
    pub name: String,
    pub tensors: BTreeMap<String, Tensor>,
}

impl NamedTensors {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tensors: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, label: impl Into<String>, tensor: Tensor) {
        self.tensors.insert(label.into(), tensor);
    }

    pub fn get(&self, label: &str) -> Option<&Tensor> {
        self.tensors.get(label)
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(String::as_str)
    }

    pub fn size_bytes(&self) -> usize {
        self.tensors.values().map(Tensor::size_bytes).sum()
    }
}

/// One message of the tensor stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LoaderMessage {
    Metadata(Box<ModelMetadata>),
    Tensors(NamedTensors),
    /// Normal termination
    Done,
    /// Abnormal termination; everything received so far must be discarded
    Exit { reason: String },
}

impl LoaderMessage {
    /// Short name for logs: the bundle name, or the marker kind
    pub fn name(&self) -> &str {
        match self {
            LoaderMessage::Metadata(_) => "metadata",
            LoaderMessage::Tensors(named) => &named.name,
            LoaderMessage::Done => "done",
            LoaderMessage::Exit { .. } => "exit",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, LoaderMessage::Done | LoaderMessage::Exit { .. })
    }
}

/// Producer half of the stream
#[derive(Debug, Clone)]
pub struct MessageSender {
    tx: mpsc::Sender<LoaderMessage>,
}

/// Consumer half of the stream
#[derive(Debug)]
pub struct MessageReceiver {
    rx: mpsc::Receiver<LoaderMessage>,
}

/// Create a bounded stream channel
pub fn channel(capacity: usize) -> (MessageSender, MessageReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (MessageSender { tx }, MessageReceiver { rx })
}

impl MessageSender {
    /// Push a message, waiting for channel capacity
    pub async fn send(&self, message: LoaderMessage) -> Result<()> {
        let name = message.name().to_string();
        self.tx.send(message).await.map_err(|_| {
            LoaderError::Channel(format!("consumer hung up before message '{}'", name))
        })
    }

    /// Push a named tensor bundle
    pub async fn send_tensors(&self, message: NamedTensors) -> Result<()> {
        info!(
            name = %message.name,
            tensors = message.tensors.len(),
            bytes = message.size_bytes(),
            "Sending message"
        );
        self.send(LoaderMessage::Tensors(message)).await
    }

    pub async fn done(&self) -> Result<()> {
        self.send(LoaderMessage::Done).await
    }

    pub async fn exit(&self, reason: impl Into<String>) -> Result<()> {
        self.send(LoaderMessage::Exit {
            reason: reason.into(),
        })
        .await
    }
}

impl MessageReceiver {
    /// Next message; `None` once every sender is dropped and the buffer is empty
    pub async fn recv(&mut self) -> Option<LoaderMessage> {
        self.rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_preserves_order() {
        let (tx, mut rx) = channel(4);
        let mut layer = NamedTensors::new("transformer layer 0");
        layer.insert("qkv weight", Tensor::zeros(vec![6, 2]));

        tx.send_tensors(layer.clone()).await.unwrap();
        tx.done().await.unwrap();
        drop(tx);

        assert_eq!(rx.recv().await, Some(LoaderMessage::Tensors(layer)));
        let done = rx.recv().await.unwrap();
        assert!(done.is_terminal());
        assert_eq!(done.name(), "done");
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_send_after_consumer_drop_fails() {
        let (tx, rx) = channel(1);
        drop(rx);
        let err = tx.exit("boom").await.unwrap_err();
        assert!(matches!(err, LoaderError::Channel(_)));
    }

    #[test]
    fn test_named_tensors_accessors() {
        let mut msg = NamedTensors::new("final norm");
        msg.insert("weight", Tensor::zeros(vec![4]));
        assert_eq!(msg.labels().collect::<Vec<_>>(), vec!["weight"]);
        assert_eq!(msg.size_bytes(), 16);
        assert!(msg.get("bias").is_none());
    }
}
