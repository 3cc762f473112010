use anyhow::Result;
use async_trait::async_trait;
use csvflow_core::{EnvelopeRx, Message, Operator, Sink};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Prints every envelope as one JSON object per line.
pub struct StdoutSink {
    id: String,
}

impl StdoutSink {
    pub fn new(id: String) -> Self {
        Self { id }
    }
}

#[async_trait]
impl Operator for StdoutSink {
    fn name(&self) -> &str {
        &self.id
    }
}

#[async_trait]
impl Sink for StdoutSink {
    async fn run(&mut self, mut rx: EnvelopeRx, _cancel: CancellationToken) -> Result<()> {
        let mut printed = 0usize;
        while let Some(msg) = rx.recv().await {
            match msg {
                Message::Envelope(envelope) => {
                    println!("{}", serde_json::to_string(&envelope)?);
                    printed += 1;
                }
                Message::Eos => break,
            }
        }
        info!(sink = %self.id, printed, "stdout sink finished");
        Ok(())
    }
}
