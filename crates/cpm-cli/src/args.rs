use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug, Clone)]
#[command(name = "cpm", version, about = "Context packet manager")]
pub struct Cli {
    /// Emit JSON output on stdout.
    #[arg(long, global = true)]
    pub json: bool,

    /// Project directory whose `.cpm` workspace is used.
    #[arg(long, global = true, default_value = ".")]
    pub workspace_dir: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Build, verify or re-lock a packet from a source tree.
    Build {
        #[command(subcommand)]
        action: BuildAction,
    },

    /// Query a packet for relevant context.
    Query(QueryArgs),

    /// Replay a recorded query log and verify its output hash.
    Replay {
        /// Path to the query log JSON.
        log: String,
    },

    /// Diff two packet versions and estimate embedding drift.
    Diff {
        /// Left packet ref (name[@version] or path).
        left: String,
        /// Right packet ref (name[@version] or path).
        right: String,
        /// Fail when drift exceeds this threshold.
        #[arg(long)]
        max_drift: Option<f64>,
    },

    /// Install a packet from the OCI registry.
    Install(InstallArgs),

    /// Remove a packet and its workspace state.
    Uninstall {
        /// Packet name.
        name: String,
    },

    /// Pin and activate a packet version.
    Use {
        /// Packet spec `name[@version]` (`@latest` consults the registry).
        spec: String,
    },

    /// Remove old versions, keeping pinned/active and the newest `keep`.
    Prune {
        /// Packet name.
        name: String,
        #[arg(long, default_value_t = 1)]
        keep: usize,
    },

    /// Check the registry for a newer version and install it.
    Update {
        /// Packet name.
        name: String,
    },

    /// List installed packets.
    List,

    /// List versions published on the registry.
    ListRemote {
        /// Packet name.
        name: String,
    },

    /// Publish a packet archive to the registry.
    Publish {
        /// Packet spec `name@version`.
        spec: String,
        /// Registry base URL override.
        #[arg(long)]
        registry: Option<String>,
    },

    /// Manage embedding providers (`embeddings.yml`).
    Embed {
        #[command(subcommand)]
        action: EmbedAction,
    },

    /// Embedding pool server management.
    Pool {
        #[command(subcommand)]
        action: PoolAction,
    },

    /// Run a query benchmark with KPI gates.
    Benchmark(BenchmarkArgs),

    /// List discovered plugins and their load state.
    Plugins,

    /// Run environment checks.
    Doctor,
}

#[derive(Subcommand, Debug, Clone)]
pub enum BuildAction {
    /// Run a packet build.
    Run(BuildArgs),
    /// Verify the lockfile against current inputs and artifacts.
    Verify {
        /// Packet output directory (defaults to build.toml [output].dir).
        #[arg(long)]
        packet_dir: Option<String>,
        /// Source directory (defaults to build.toml [source].dir).
        #[arg(long)]
        source: Option<String>,
    },
    /// Regenerate the lockfile against current inputs and artifacts.
    Lock {
        #[arg(long)]
        packet_dir: Option<String>,
        #[arg(long)]
        source: Option<String>,
        /// Required confirmation flag.
        #[arg(long)]
        update_lock: bool,
    },
}

#[derive(Args, Debug, Clone)]
pub struct BuildArgs {
    /// Source directory to scan.
    #[arg(long)]
    pub source: Option<String>,
    /// Packet name (defaults to the output directory name).
    #[arg(long)]
    pub name: Option<String>,
    /// Packet output directory.
    #[arg(long)]
    pub out: Option<String>,
    /// Packet version.
    #[arg(long = "packet-version")]
    pub packet_version: Option<String>,
    /// Embedding model override.
    #[arg(long)]
    pub model: Option<String>,
    /// Embedding endpoint override.
    #[arg(long)]
    pub embed_url: Option<String>,
    /// Produce an archive next to the packet directory.
    #[arg(long)]
    pub archive: bool,
    /// Archive format: tar.gz or zip.
    #[arg(long)]
    pub archive_format: Option<String>,
    /// Accept lockfile drift and regenerate it.
    #[arg(long)]
    pub update_lock: bool,
}

#[derive(Args, Debug, Clone)]
pub struct QueryArgs {
    /// Packet name[@version], path, or source URI (dir://...).
    #[arg(long)]
    pub packet: String,
    /// Query text.
    #[arg(long)]
    pub query: String,
    /// Number of results.
    #[arg(short, default_value_t = 5)]
    pub k: usize,
    /// Retriever name or group:name.
    #[arg(long)]
    pub retriever: Option<String>,
    /// Indexer strategy.
    #[arg(long, default_value = "faiss-flatip")]
    pub indexer: String,
    /// Reranker strategy.
    #[arg(long, default_value = "none")]
    pub reranker: String,
    /// Embedding endpoint override.
    #[arg(long)]
    pub embed_url: Option<String>,
    /// Embedding transport mode override (pool|http).
    #[arg(long)]
    pub embed_mode: Option<String>,
    /// Token budget for the compiled context.
    #[arg(long, default_value_t = 6000)]
    pub max_context_tokens: u64,
    /// Resolve the packet version as of this RFC3339 timestamp.
    #[arg(long)]
    pub as_of: Option<String>,
    /// Write the query payload (with output hash) to this path.
    #[arg(long)]
    pub save_log: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub struct InstallArgs {
    /// Packet spec `name@version`.
    pub spec: String,
    /// OCI registry repository, e.g. registry.local/cpm.
    #[arg(long)]
    pub registry: Option<String>,
    /// Override the selected embedding model.
    #[arg(long)]
    pub model: Option<String>,
    /// Preferred embedding provider name.
    #[arg(long)]
    pub provider: Option<String>,
    /// Allow insecure TLS for OCI operations.
    #[arg(long)]
    pub insecure: bool,
    /// Force provider discovery refresh.
    #[arg(long)]
    pub force_discovery: bool,
    /// Install without vectors and index artifacts.
    #[arg(long)]
    pub no_embed: bool,
}

#[derive(Subcommand, Debug, Clone)]
pub enum EmbedAction {
    /// Add or update a provider.
    Add {
        name: String,
        #[arg(long)]
        url: String,
        /// Provider type (http).
        #[arg(long, default_value = "http")]
        r#type: String,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        dims: Option<u32>,
        #[arg(long)]
        batch_size: Option<usize>,
        #[arg(long)]
        timeout: Option<f64>,
        /// Bearer token for authentication.
        #[arg(long)]
        token: Option<String>,
        /// Make this the default provider.
        #[arg(long)]
        set_default: bool,
    },
    /// List configured providers.
    List,
    /// Set the default provider.
    SetDefault { name: String },
    /// Remove a provider.
    Remove { name: String },
}

#[derive(Subcommand, Debug, Clone)]
pub enum PoolAction {
    /// Run the embedding pool server.
    Serve {
        /// Pool server config (`config.yml`).
        #[arg(long)]
        config: Option<String>,
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
    /// Show a running pool's status.
    Status {
        #[arg(long, default_value = "http://127.0.0.1:8876")]
        url: String,
    },
}

#[derive(Args, Debug, Clone)]
pub struct BenchmarkArgs {
    /// Packet name[@version] or path.
    #[arg(long)]
    pub packet: String,
    /// JSON file with a list of query strings.
    #[arg(long)]
    pub queries: String,
    #[arg(short, default_value_t = 5)]
    pub k: usize,
    /// Embedding endpoint override.
    #[arg(long)]
    pub embed_url: Option<String>,
    /// Fail when citation coverage drops below this fraction.
    #[arg(long, default_value_t = 1.0)]
    pub min_citation_coverage: f64,
    /// Fail when the mean top score drops below this value.
    #[arg(long)]
    pub min_top_score: Option<f64>,
}
