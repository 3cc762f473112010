use anyhow::{Context, Result};
use arcstr::ArcStr;
use async_trait::async_trait;
use csvflow_core::{EnvelopeRx, Message, Operator, Sink};
use std::collections::HashMap;
use std::io::{BufWriter, Write};
use std::{fs, path::PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Writes envelopes as newline-delimited JSON records, one
/// `<channel>.jsonl` file per destination channel.
///
/// Each line carries the partition and offset keys next to the record so a
/// consumer can resume from the last line it read.
pub struct JsonDirSink {
    id: String,
    dir: PathBuf,
}

impl JsonDirSink {
    pub fn new(id: String, dir: PathBuf) -> Self {
        Self { id, dir }
    }

    fn writer<'a>(
        &self,
        writers: &'a mut HashMap<ArcStr, BufWriter<fs::File>>,
        channel: &ArcStr,
    ) -> Result<&'a mut BufWriter<fs::File>> {
        if !writers.contains_key(channel) {
            let path = self.dir.join(format!("{channel}.jsonl"));
            let file = fs::File::create(&path)
                .with_context(|| format!("create {}", path.display()))?;
            info!(channel = %channel, path = %path.display(), "opened channel file");
            writers.insert(channel.clone(), BufWriter::new(file));
        }
        writers
            .get_mut(channel)
            .with_context(|| format!("no writer for channel {channel}"))
    }
}

#[async_trait]
impl Operator for JsonDirSink {
    fn name(&self) -> &str {
        &self.id
    }
}

#[async_trait]
impl Sink for JsonDirSink {
    async fn run(&mut self, mut rx: EnvelopeRx, _cancel: CancellationToken) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let mut writers: HashMap<ArcStr, BufWriter<fs::File>> = HashMap::new();
        while let Some(msg) = rx.recv().await {
            match msg {
                Message::Envelope(envelope) => {
                    let writer = self.writer(&mut writers, &envelope.channel)?;
                    serde_json::to_writer(&mut *writer, &envelope)?;
                    writer.write_all(b"\n")?;
                }
                Message::Eos => break,
            }
        }
        for (channel, mut writer) in writers {
            writer
                .flush()
                .with_context(|| format!("flush channel {channel}"))?;
        }
        Ok(())
    }
}
