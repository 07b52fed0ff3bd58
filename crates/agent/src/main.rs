#![forbid(unsafe_code)]

//! Code-agent worker: claims `code-agent/run` jobs from the daemon and runs
//! them against local sandbox sessions.

use std::{path::PathBuf, sync::Arc, time::Duration};

use builder_agent::completion::{CompletionSignal, TASK_SUMMARY_MARKER};
use builder_agent::local_sandbox::{LocalSandbox, LocalSandboxConfig};
use builder_agent::network::DEFAULT_MAX_ITER;
use builder_agent::openai::{OpenAiChatModel, DEFAULT_BASE_URL, DEFAULT_OPENAI_MODEL};
use builder_agent::remote::DaemonClient;
use builder_agent::sandbox::{DEFAULT_TEMPLATE, SERVING_PORT};
use builder_agent::worker::{run_worker, WorkerConfig};
use builder_agent::{CodeAgentJob, JobConfig};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "builder-agent")]
struct Args {
    /// Daemon base URL, e.g. http://127.0.0.1:3000
    #[arg(long, default_value = "http://127.0.0.1:3000")]
    daemon: String,

    /// Agent identifier.
    #[arg(long, default_value = "agent-1")]
    agent_id: String,

    /// Poll interval in milliseconds.
    #[arg(long, default_value_t = 1_000)]
    poll_ms: u64,

    /// Lease heartbeat interval in milliseconds.
    #[arg(long, default_value_t = 10_000)]
    heartbeat_ms: u64,

    /// Root directory for sandbox sessions.
    #[arg(long, default_value = ".builder/sandboxes")]
    sandbox_root: PathBuf,

    /// Directory with one sub-directory per sandbox template.
    #[arg(long)]
    templates_dir: Option<PathBuf>,

    /// Template new sessions are created from.
    #[arg(long, default_value = DEFAULT_TEMPLATE)]
    template: String,

    /// Domain used for public sandbox hosts.
    #[arg(long, default_value = "localhost")]
    sandbox_domain: String,

    /// Sandbox session lifetime in seconds, refreshed on every tool call.
    #[arg(long, default_value_t = 30 * 60)]
    sandbox_timeout_secs: u64,

    /// Per-command timeout in seconds.
    #[arg(long, default_value_t = 10 * 60)]
    command_timeout_secs: u64,

    /// Maximum live sandbox sessions on this host.
    #[arg(long, default_value_t = 16)]
    max_sessions: usize,

    /// Port the generated app is served on inside the sandbox.
    #[arg(long, default_value_t = SERVING_PORT)]
    serving_port: u16,

    /// Chat model name.
    #[arg(long, env = "OPENAI_MODEL", default_value = DEFAULT_OPENAI_MODEL)]
    model: String,

    /// OpenAI-compatible API base URL.
    #[arg(long, env = "OPENAI_BASE_URL", default_value = DEFAULT_BASE_URL)]
    openai_base_url: String,

    /// Agent loop iteration ceiling.
    #[arg(long, default_value_t = DEFAULT_MAX_ITER)]
    max_iter: usize,

    /// Completion marker the agent is told to emit.
    #[arg(long, default_value = TASK_SUMMARY_MARKER)]
    completion_marker: String,

    /// If set, claim and run at most one job then exit (useful for scripts).
    #[arg(long)]
    once: bool,

    /// Log level (env-filter syntax).
    #[arg(long, default_value = "info")]
    log: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(&args.log))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tokio::fs::create_dir_all(&args.sandbox_root).await?;

    let model = OpenAiChatModel::try_from_env(&args.model)?.with_base_url(&args.openai_base_url);
    tracing::info!(model = %model.model(), "chat model configured");

    let sandbox = LocalSandbox::new(LocalSandboxConfig {
        root: args.sandbox_root.clone(),
        templates_dir: args.templates_dir.clone(),
        domain: args.sandbox_domain.clone(),
        command_timeout: Duration::from_secs(args.command_timeout_secs),
        max_sessions: args.max_sessions,
    });

    let job = CodeAgentJob::new(
        Arc::new(sandbox),
        Arc::new(model),
        JobConfig {
            template: args.template.clone(),
            sandbox_timeout: Duration::from_secs(args.sandbox_timeout_secs),
            max_iter: args.max_iter,
            serving_port: args.serving_port,
            completion: CompletionSignal::new(args.completion_marker.clone()),
            ..JobConfig::default()
        },
    );

    run_worker(
        DaemonClient::new(&args.daemon),
        Arc::new(job),
        WorkerConfig {
            agent_id: args.agent_id.clone(),
            poll: Duration::from_millis(args.poll_ms),
            heartbeat: Duration::from_millis(args.heartbeat_ms),
            once: args.once,
        },
    )
    .await
}
