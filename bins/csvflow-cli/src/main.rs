use anyhow::{Context, Result};
use clap::Parser;
use csvflow_core::{PipelineSpec, Sink, SinkSpec, Source, SourceSpec};
use csvflow_io::{sink_json_dir::JsonDirSink, sink_stdout::StdoutSink, source_csv::CsvSource};
use std::path::PathBuf;
use tokio::{signal, sync::mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "csvflow", about = "Convert delimited text files into typed records")]
struct Args {
    /// Pipeline YAML
    #[arg(short, long)]
    pipeline: PathBuf,
    /// Bounded channel capacity between source and sink
    #[arg(long, default_value_t = 8)]
    channel_capacity: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();
    let args = Args::parse();
    let spec: PipelineSpec = {
        let y = std::fs::read_to_string(&args.pipeline)
            .with_context(|| format!("read {}", args.pipeline.display()))?;
        PipelineSpec::from_yaml(&y)?
    };
    if spec.sources.len() > 1 || spec.sinks.len() > 1 {
        warn!(pipeline = %spec.name, "only the first source and sink are run");
    }
    // v0: single source -> single sink
    let cancel = CancellationToken::new();
    let (tx, rx) = mpsc::channel(args.channel_capacity);
    let mut source = match &spec.sources[0] {
        SourceSpec::Csv(csv) => CsvSource::try_new(csv.clone())?,
    };
    let mut sink: Box<dyn Sink> = match &spec.sinks[0] {
        SinkSpec::Stdout { id } => Box::new(StdoutSink::new(id.clone())),
        SinkSpec::JsonDir { id, path } => {
            Box::new(JsonDirSink::new(id.clone(), PathBuf::from(path)))
        }
    };
    info!(pipeline = %spec.name, "starting pipeline");
    // Spawn tasks
    let c1 = cancel.child_token();
    let src_handle = tokio::spawn(async move { source.run(tx, c1).await });
    let c2 = cancel.child_token();
    let sink_handle = tokio::spawn(async move { sink.run(rx, c2).await });
    // Ctrl-C handling
    let ctrl_c = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if signal::ctrl_c().await.is_ok() {
                info!("interrupt received, shutting down");
                cancel.cancel();
            }
        })
    };
    // Join
    src_handle.await??;
    sink_handle.await??;
    ctrl_c.abort();
    info!(pipeline = %spec.name, "pipeline finished");
    Ok(())
}
