//! LightRAG PostgreSQL storage CLI - maintenance entry point
//!
//! Opens the shared pool for one workspace and inspects what the stores hold.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use lightrag_pg::namespace::{DOC_STATUS, GRAPH_STORE_CHUNK_ENTITY_RELATION};
use lightrag_pg::storage::DocStatus;
use lightrag_pg::{
    make_namespace, metrics, ClientManager, DocStatusStorage, GlobalConfig, GraphStorage,
    PgDocStatusStorage, PgGraphStorage, PostgresDb,
};

#[derive(Parser)]
#[command(name = "lightrag_pg")]
#[command(about = "LightRAG PostgreSQL storage maintenance", long_about = None)]
#[command(version)]
struct Cli {
    /// Workspace to operate on (overrides POSTGRES_WORKSPACE and config.yml)
    #[arg(long, global = true)]
    workspace: Option<String>,

    /// AGE graph name (overrides AGE_GRAPH_NAME)
    #[arg(long, global = true)]
    graph: Option<String>,

    /// Config file with `postgres:` and `lightrag:` sections
    #[arg(long, global = true, env = "LIGHTRAG_CONFIG")]
    config: Option<PathBuf>,

    /// Print storage metrics in Prometheus text format on exit
    #[arg(long, global = true, default_value_t = false)]
    print_metrics: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and create any missing tables
    Init,

    /// Document counts per processing status
    Status,

    /// List every node id in the graph
    Labels,

    /// Print the subgraph around a node as JSON
    Graph {
        /// Start node id, or "*" for the whole graph
        #[arg(default_value = "*")]
        label: String,

        /// Maximum traversal depth from the start node
        #[arg(short, long, default_value = "3")]
        max_depth: usize,
    },

    /// Print the properties of one node as JSON
    Node {
        /// Node id
        id: String,
    },
}

impl Commands {
    fn name(&self) -> &'static str {
        match self {
            Commands::Init => "init",
            Commands::Status => "status",
            Commands::Labels => "labels",
            Commands::Graph { .. } => "graph",
            Commands::Node { .. } => "node",
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env for local development
    let _ = dotenvy::dotenv();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("lightrag_pg=info".parse()?))
        .init();

    let cli = Cli::parse();

    let mut global = match cli.config.as_deref() {
        Some(path) => GlobalConfig::load_from_file(path)?,
        None => GlobalConfig::new(),
    };
    if let Some(graph) = cli.graph {
        global.graph_name = Some(graph);
    }

    let command_name = cli.command.name();
    let start = Instant::now();

    let manager = ClientManager::global();
    let db = manager.acquire(cli.workspace.as_deref(), &global).await?;
    let result = execute_command(cli.command, &global, Arc::clone(&db)).await;
    manager.release(db).await;

    metrics::record_operation("cli", command_name, start.elapsed(), result.is_ok());
    if cli.print_metrics {
        print!("{}", metrics::encode_text()?);
    }

    result
}

async fn execute_command(
    command: Commands,
    global: &GlobalConfig,
    db: Arc<PostgresDb>,
) -> anyhow::Result<()> {
    let prefix = global.namespace_prefix.as_deref().unwrap_or_default();

    match command {
        Commands::Init => {
            println!(
                "Schema ready on {} (workspace {})",
                db.target(),
                db.workspace()
            );
        }
        Commands::Status => {
            let store = PgDocStatusStorage::new(&make_namespace(prefix, DOC_STATUS), db)?;
            let counts = store.get_status_counts().await?;
            for status in DocStatus::ALL {
                println!("{:<12} {}", status.as_str(), counts.get(&status).copied().unwrap_or(0));
            }
        }
        Commands::Labels => {
            let graph = graph_store(prefix, global, db)?;
            for label in graph.get_all_labels().await? {
                println!("{label}");
            }
        }
        Commands::Graph { label, max_depth } => {
            let graph = graph_store(prefix, global, db)?;
            let kg = graph.get_knowledge_graph(&label, max_depth).await?;
            println!("{}", serde_json::to_string_pretty(&kg)?);
        }
        Commands::Node { id } => {
            let graph = graph_store(prefix, global, db)?;
            match graph.get_node(&id).await? {
                Some(properties) => println!("{}", serde_json::to_string_pretty(&properties)?),
                None => anyhow::bail!("node {id:?} not found"),
            }
        }
    }

    Ok(())
}

fn graph_store(
    prefix: &str,
    global: &GlobalConfig,
    db: Arc<PostgresDb>,
) -> anyhow::Result<PgGraphStorage> {
    let namespace = make_namespace(prefix, GRAPH_STORE_CHUNK_ENTITY_RELATION);
    Ok(PgGraphStorage::new(&namespace, global, db)?)
}
