use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use git2::Repository;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use reviewd::analyzer::{Analyzer, WsAnalyzerClient};
use reviewd::config::{AnalyzerConfig, ServeConfig};
use reviewd::data::client::DataClient;
use reviewd::data::uast::{BblfshParser, Parser as UastParser};
use reviewd::data::{build_pipeline, FileGetter};
use reviewd::dummy::DummyAnalyzer;
use reviewd::event::{CommitRevision, Event, EventKind, PushEvent, ReferencePointer, ReviewEvent};
use reviewd::health;
use reviewd::poster::LogPoster;
use reviewd::provider::json::JsonWatcher;
use reviewd::provider::Watcher;
use reviewd::rpc::{self, RpcService};
use reviewd::server::{Server, ServerOptions};
use reviewd::store::memory::{MemCommentOperator, MemEventOperator};
use reviewd::store::sqlite::SqliteStore;
use reviewd::store::{CommentOperator, EventOperator, OrganizationOperator};

#[derive(Parser)]
#[command(
    name = "reviewd",
    about = "Code-review automation daemon — fans events out to analyzers and posts their comments",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Log filter (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info", env = "REVIEWD_LOG")]
    log: String,
}

#[derive(Subcommand)]
enum Command {
    /// Watch stdin for JSON events and orchestrate analysis for each
    Serve {
        /// Server configuration (analyzers, timeouts, data server)
        #[arg(long, default_value = "config.yml", env = "REVIEWD_CONFIG")]
        config: PathBuf,

        /// TCP address for the health probe endpoints
        #[arg(long, default_value = "0.0.0.0:8090", env = "REVIEWD_PROBES_ADDR")]
        probes_addr: String,
    },
    /// Fire a single review event at one analyzer and log its comments
    Review(EventArgs),
    /// Fire a single push event at one analyzer and log its comments
    Push(EventArgs),
    /// Serve the built-in dummy analyzer (for testing the pipeline)
    Dummy {
        /// Address to bind the analyzer to
        #[arg(long, default_value = "127.0.0.1:9930", env = "REVIEWD_ANALYZER")]
        addr: String,

        /// Address of the data server
        #[arg(long, default_value = "127.0.0.1:10301", env = "REVIEWD_DATA_SERVER")]
        data_server: String,

        /// On push events, request the head file tree and report on it
        #[arg(long)]
        files: bool,

        /// Request syntax trees from the data server
        #[arg(long)]
        uast: bool,

        /// TCP address for the health probe endpoints
        #[arg(long, default_value = "0.0.0.0:8091", env = "REVIEWD_ANALYZER_PROBES_ADDR")]
        probes_addr: String,
    },
}

#[derive(ClapArgs)]
struct EventArgs {
    /// Path to the git repository to analyze
    #[arg(long, default_value = ".", env = "GIT_DIR")]
    git_dir: PathBuf,

    /// Base revision of the event
    #[arg(long = "from", default_value = "HEAD^")]
    rev_from: String,

    /// Head revision of the event
    #[arg(long = "to", default_value = "HEAD")]
    rev_to: String,

    /// Arbitrary JSON settings passed to the analyzer
    #[arg(long)]
    config_json: Option<String>,

    /// Bind address for the ephemeral data server
    #[arg(long, default_value = "127.0.0.1:10301", env = "REVIEWD_DATA_SERVER")]
    data_server: String,

    /// Address of the bblfsh parser; unset disables syntax trees
    #[arg(long, env = "REVIEWD_BBLFSH")]
    bblfsh: Option<String>,

    /// Address of the analyzer to notify
    #[arg(default_value = "127.0.0.1:9930")]
    analyzer: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(&cli.log)
        .compact()
        .init();

    match cli.command {
        Command::Serve { config, probes_addr } => run_serve(config, probes_addr).await,
        Command::Review(args) => run_event(EventKind::Review, args).await,
        Command::Push(args) => run_event(EventKind::Push, args).await,
        Command::Dummy {
            addr,
            data_server,
            files,
            uast,
            probes_addr,
        } => run_dummy(addr, data_server, files, uast, probes_addr).await,
    }
}

// ─── serve ───────────────────────────────────────────────────────────────────

async fn run_serve(config_path: PathBuf, probes_addr: String) -> Result<()> {
    info!(version = env!("CARGO_PKG_VERSION"), "reviewd starting");
    let cfg = ServeConfig::load(&config_path)?;

    let shutdown = CancellationToken::new();
    spawn_shutdown_listener(shutdown.clone());
    spawn_probes(probes_addr, shutdown.child_token());

    // Data service pipeline over the configured repository.
    let parser = connect_parser(cfg.bblfsh.as_deref()).await;
    let handler = build_pipeline(cfg.git_dir.clone(), parser);
    let file_getter = handler.files.clone();
    let listener = TcpListener::bind(&cfg.data_server)
        .await
        .with_context(|| format!("can't bind data server to '{}'", cfg.data_server))?;
    info!(addr = %cfg.data_server, "starting data server");
    tokio::spawn(rpc::serve(
        listener,
        Arc::new(handler) as Arc<dyn RpcService>,
        shutdown.child_token(),
    ));

    // Analyzer connections are long-lived, established once at startup.
    let mut analyzers = HashMap::new();
    for analyzer_cfg in &cfg.analyzers {
        info!(analyzer = %analyzer_cfg.name, addr = %analyzer_cfg.addr, "connecting to analyzer");
        let client = WsAnalyzerClient::connect(&analyzer_cfg.addr)
            .await
            .map_err(|e| anyhow!("can't connect to analyzer '{}': {e}", analyzer_cfg.name))?;
        analyzers.insert(
            analyzer_cfg.name.clone(),
            Analyzer {
                client: Arc::new(client),
                config: analyzer_cfg.clone(),
            },
        );
    }

    let (event_op, comment_op, organization_op) = build_stores(cfg.db.as_deref()).await?;

    let server = Server::new(ServerOptions {
        poster: Arc::new(LogPoster),
        file_getter,
        analyzers,
        event_op,
        comment_op,
        organization_op,
        review_timeout: Duration::from_secs(cfg.timeout.analyzer_review),
        push_timeout: Duration::from_secs(cfg.timeout.analyzer_push),
        exit_on_error: cfg.exit_on_error,
    });

    info!("waiting for JSON events on stdin");
    let mut watcher = JsonWatcher::new(tokio::io::stdin());
    let result = watcher.watch(&shutdown, &server).await;
    shutdown.cancel();
    result
}

type Stores = (
    Option<Arc<dyn EventOperator>>,
    Option<Arc<dyn CommentOperator>>,
    Option<Arc<dyn OrganizationOperator>>,
);

async fn build_stores(db: Option<&std::path::Path>) -> Result<Stores> {
    match db {
        Some(path) => {
            info!(db = %path.display(), "using sqlite store");
            let store = Arc::new(SqliteStore::new(path).await?);
            Ok((
                Some(store.clone()),
                Some(store.clone()),
                Some(store),
            ))
        }
        None => Ok((
            Some(Arc::new(MemEventOperator::new())),
            Some(Arc::new(MemCommentOperator::new())),
            None,
        )),
    }
}

async fn connect_parser(addr: Option<&str>) -> Option<Arc<dyn UastParser>> {
    let addr = addr?;
    match tokio::time::timeout(Duration::from_secs(1), BblfshParser::connect(addr)).await {
        Ok(Ok(parser)) => {
            info!(addr = %addr, "connected to bblfsh");
            Some(Arc::new(parser))
        }
        Ok(Err(e)) => {
            warn!(addr = %addr, err = %e, "bblfsh instance could not be found, no UASTs will be available to analyzers");
            None
        }
        Err(_) => {
            warn!(addr = %addr, "bblfsh connection timed out, no UASTs will be available to analyzers");
            None
        }
    }
}

// ─── review / push ───────────────────────────────────────────────────────────

async fn run_event(kind: EventKind, args: EventArgs) -> Result<()> {
    let repo = Repository::open(&args.git_dir)
        .with_context(|| format!("can't open repository at path '{}'", args.git_dir.display()))?;

    info!(from = %args.rev_from, to = %args.rev_to, "resolving event revisions");
    let base_hash = resolve_rev(&repo, &args.rev_from)
        .with_context(|| format!("base revision '{}' error", args.rev_from))?;
    let head_hash = resolve_rev(&repo, &args.rev_to)
        .with_context(|| format!("head revision '{}' error", args.rev_to))?;

    let full_path = std::fs::canonicalize(&args.git_dir)
        .with_context(|| format!("can't resolve '{}' full path", args.git_dir.display()))?;
    let repository_url = format!("file://{}", full_path.display());

    let commit_revision = CommitRevision {
        base: ReferencePointer {
            internal_repository_url: repository_url.clone(),
            reference_name: "HEAD".to_string(),
            hash: base_hash,
        },
        head: ReferencePointer {
            internal_repository_url: repository_url,
            reference_name: "HEAD".to_string(),
            hash: head_hash,
        },
    };

    let settings = match &args.config_json {
        Some(raw) => serde_json::from_str(raw).context("can't parse the config-json option")?,
        None => serde_json::Map::new(),
    };

    let shutdown = CancellationToken::new();
    spawn_shutdown_listener(shutdown.clone());

    // Ephemeral data server for the analyzer to read from.
    let parser = connect_parser(args.bblfsh.as_deref()).await;
    let handler = build_pipeline(args.git_dir.clone(), parser);
    let file_getter: Arc<dyn FileGetter> = handler.files.clone();
    let listener = TcpListener::bind(&args.data_server)
        .await
        .with_context(|| format!("can't bind data server to '{}'", args.data_server))?;
    info!(addr = %args.data_server, "starting a data server");
    tokio::spawn(rpc::serve(
        listener,
        Arc::new(handler) as Arc<dyn RpcService>,
        shutdown.child_token(),
    ));

    info!(addr = %args.analyzer, "connecting to the analyzer");
    let client = WsAnalyzerClient::connect(&args.analyzer)
        .await
        .map_err(|e| anyhow!("can't connect to analyzer '{}': {e}", args.analyzer))?;
    let config = AnalyzerConfig {
        name: "test-analyzer".to_string(),
        addr: args.analyzer.clone(),
        settings,
        ..Default::default()
    };
    let analyzers = HashMap::from([(
        config.name.clone(),
        Analyzer {
            client: Arc::new(client),
            config,
        },
    )]);

    let server = Server::new(ServerOptions {
        poster: Arc::new(LogPoster),
        file_getter,
        analyzers,
        event_op: Some(Arc::new(MemEventOperator::new())),
        comment_op: Some(Arc::new(MemCommentOperator::new())),
        organization_op: None,
        review_timeout: Duration::ZERO,
        push_timeout: Duration::ZERO,
        exit_on_error: true,
    });

    let internal_id = uuid::Uuid::new_v4().to_string();
    let now = Some(chrono::Utc::now());
    let event = match kind {
        EventKind::Review => Event::Review(ReviewEvent {
            internal_id,
            provider: "cli".to_string(),
            created_at: now,
            updated_at: now,
            is_mergeable: true,
            source: commit_revision.head.clone(),
            commit_revision,
            ..Default::default()
        }),
        EventKind::Push => {
            let commits = count_commits(&repo, &commit_revision)?;
            Event::Push(PushEvent {
                internal_id,
                provider: "cli".to_string(),
                created_at: now,
                commits,
                commit_revision,
                ..Default::default()
            })
        }
    };

    let result = server.handle_event(&shutdown, &event).await;
    shutdown.cancel();
    result
}

fn resolve_rev(repo: &Repository, rev: &str) -> Result<String> {
    if rev.is_empty() {
        anyhow::bail!("revision can't be empty");
    }
    let commit = repo.revparse_single(rev)?.peel_to_commit()?;
    Ok(commit.id().to_string())
}

fn count_commits(repo: &Repository, revision: &CommitRevision) -> Result<u32> {
    let mut walk = repo.revwalk()?;
    walk.push(git2::Oid::from_str(&revision.head.hash)?)?;
    walk.hide(git2::Oid::from_str(&revision.base.hash)?)?;
    Ok(walk.filter(|id| id.is_ok()).count() as u32)
}

// ─── dummy ───────────────────────────────────────────────────────────────────

async fn run_dummy(
    addr: String,
    data_server: String,
    files: bool,
    uast: bool,
    probes_addr: String,
) -> Result<()> {
    let shutdown = CancellationToken::new();
    spawn_shutdown_listener(shutdown.clone());
    spawn_probes(probes_addr, shutdown.child_token());

    let data = DataClient::connect(&data_server)
        .await
        .map_err(|e| anyhow!("can't connect to data server '{data_server}': {e}"))?;
    let analyzer = Arc::new(DummyAnalyzer {
        version: env!("CARGO_PKG_VERSION").to_string(),
        data,
        request_uast: uast,
        request_files_push: files,
    });

    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("can't bind analyzer to '{addr}'"))?;
    info!(addr = %addr, "dummy analyzer has started");
    rpc::serve(listener, analyzer, shutdown).await
}

// ─── shared wiring ───────────────────────────────────────────────────────────

fn spawn_probes(addr: String, token: CancellationToken) {
    tokio::spawn(async move {
        if let Err(e) = health::serve_probes(&addr, token).await {
            warn!(err = %e, "health probes stopped");
        }
    });
}

fn spawn_shutdown_listener(token: CancellationToken) {
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received, draining");
        token.cancel();
    });
}

/// Resolves when a shutdown signal arrives: SIGTERM or Ctrl-C on Unix,
/// Ctrl-C elsewhere.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
    }
}
