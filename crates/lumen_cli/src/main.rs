use anyhow::Context;
use clap::Parser;
use lumen_core::{Graph, GraphSeed, LumenConfig, SourceKey, SourceType};
use lumen_runtime::{
    Collaborators, EngineService, GuardedEmbedder, HashEmbedder, InMemoryGraphStore, TickEngine,
    TracingSink,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Parser, Debug)]
#[command(name = "lumen", author, version, about, long_about = None)]
struct Args {
    /// Path to the TOML config file (missing file means defaults)
    #[arg(short, long, env = "LUMEN_CONFIG", default_value = "lumen.toml")]
    config: PathBuf,

    /// JSON graph seed: {"nodes": [...], "links": [...]}
    #[arg(short, long)]
    graph: Option<PathBuf>,

    /// Ticks to run in batch mode
    #[arg(short = 'n', long, default_value_t = 10)]
    ticks: u64,

    /// Stimulus text injected before the first tick (repeatable)
    #[arg(short, long)]
    stimulus: Vec<String>,

    /// Source type for injected stimuli
    #[arg(long, default_value = "user_message")]
    source: SourceType,

    /// Scope within the source type (channel, tool name, feed...)
    #[arg(long, default_value = SourceKey::GLOBAL_SCOPE)]
    scope: String,

    /// Embed stimuli and node ids with the built-in hashing embedder
    #[arg(long)]
    embed: bool,

    /// Print every tick report as a JSON line
    #[arg(long)]
    reports: bool,

    /// Run the background service; stdin lines become stimuli until EOF or Ctrl-C
    #[arg(long)]
    serve: bool,

    /// Emit logs as JSON
    #[arg(long, env = "LUMEN_LOG_JSON")]
    log_json: bool,

    /// Also write daily-rotated log files into this directory
    #[arg(long, env = "LUMEN_LOG_DIR")]
    log_dir: Option<PathBuf>,
}

fn init_logging(json: bool, log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let mut layers = Vec::new();
    let stderr = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);
    layers.push(if json { stderr.json().boxed() } else { stderr.boxed() });

    let guard = log_dir.map(|dir| {
        let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, "lumen.log"));
        layers.push(
            tracing_subscriber::fmt::layer()
                .json()
                .with_ansi(false)
                .with_writer(writer)
                .boxed(),
        );
        guard
    });

    tracing_subscriber::registry().with(layers).with(filter).init();
    guard
}

fn load_graph(path: Option<&Path>, embedder: Option<&HashEmbedder>) -> anyhow::Result<Graph> {
    let mut graph = match path {
        Some(p) => {
            let raw = std::fs::read_to_string(p)
                .with_context(|| format!("Failed to read graph seed: {}", p.display()))?;
            let seed: GraphSeed = serde_json::from_str(&raw).context("Failed to parse graph seed")?;
            Graph::from_seed(seed)?
        }
        None => Graph::new(),
    };
    if let Some(e) = embedder {
        for node in graph.nodes_mut().filter(|n| n.embedding.is_none()) {
            node.embedding = Some(e.embed_sync(node.id.as_str()));
        }
    }
    Ok(graph)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();
    let _guard = init_logging(args.log_json, args.log_dir.as_deref());

    let config = LumenConfig::load_or_default(&args.config);
    let embedder = args
        .embed
        .then(|| HashEmbedder::new(config.embedding.dimensions));
    let graph = load_graph(args.graph.as_deref(), embedder.as_ref())?;
    info!(
        "Loaded graph: {} nodes, {} links",
        graph.node_count(),
        graph.link_count()
    );
    let source = SourceKey::new(args.source, args.scope.clone());

    if args.serve {
        return serve(args, config, graph, embedder, source).await;
    }

    let mut engine = TickEngine::new(config, graph).with_telemetry(Arc::new(TracingSink));
    for text in &args.stimulus {
        let embedding = embedder.as_ref().map(|e| e.embed_sync(text));
        engine.inject_stimulus(text.as_str(), embedding, source.clone());
    }
    for _ in 0..args.ticks {
        let report = engine.tick()?;
        if args.reports {
            println!("{}", serde_json::to_string(&report)?);
        }
    }
    println!("{}", serde_json::to_string_pretty(&engine.snapshot())?);
    Ok(())
}

async fn serve(
    args: Args,
    config: LumenConfig,
    graph: Graph,
    embedder: Option<HashEmbedder>,
    source: SourceKey,
) -> anyhow::Result<()> {
    let store = Arc::new(InMemoryGraphStore::with_graph(
        config.persistence.graph_name.clone(),
        graph.clone(),
    ));
    let guarded = embedder.map(|e| Arc::new(GuardedEmbedder::new(Arc::new(e), &config.embedding)));
    let collaborators = Collaborators {
        store: Some(store.clone()),
        embedder: guarded,
    };
    let engine = TickEngine::new(config, graph).with_telemetry(Arc::new(TracingSink));
    let service = EngineService::spawn(engine, collaborators);
    for text in args.stimulus {
        service.inject_stimulus(text, None, source.clone()).await?;
    }

    println!("Lumen engine running. Each input line is a stimulus; Ctrl-C or EOF to stop.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => match line? {
                Some(text) if text.trim().is_empty() => continue,
                Some(text) => {
                    let id = service.inject_stimulus(text.trim(), None, source.clone()).await?;
                    info!("Stimulus {} queued", id);
                }
                None => break,
            },
        }
        if !service.is_running() {
            break;
        }
    }

    let engine = service.shutdown().await?;
    info!(
        "Stopped after {} ticks, {} node-state writes",
        engine.tick_count(),
        store.write_count()
    );
    println!("{}", serde_json::to_string_pretty(&engine.snapshot())?);
    Ok(())
}
