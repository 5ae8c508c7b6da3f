//! Admin utility for the crucible orchestration plane.
//!
//! Exit codes: 0 success, 2 bad input, 3 backend unreachable, 4 key
//! conflict.

use std::io::IsTerminal;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context as _;
use clap::{CommandFactory, Parser, Subcommand};

use crucible::catalog;
use crucible::queue::names;
use crucible::weights::WeightAllocator;
use crucible::{CrucibleConfig, Ctx};
use crucible_types::frame;
use crucible_types::{BuildOutput, WeightedHarness};

const EXIT_BAD_INPUT: u8 = 2;
const EXIT_BACKEND: u8 = 3;
const EXIT_CONFLICT: u8 = 4;

#[derive(Parser, Debug)]
#[command(name = "crucible-admin", version)]
#[command(about = "Queue and registry administration for the crucible orchestration plane")]
struct Cli {
    /// Path to crucible.toml (default: ./crucible.toml, then built-ins)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the KV/queue store address (memory: or file:<path>)
    #[arg(long)]
    kv_endpoint: Option<String>,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Push a framed record from a file onto a queue.
    SendQueue { queue: String, file: PathBuf },
    /// Peek (no group) or pop one record (group present) from a queue.
    ReadQueue {
        queue: String,
        #[arg(long)]
        group: Option<String>,
    },
    /// List every queue with backing state.
    ListQueues,
    /// Remove a queue and all its consumer-group state.
    DeleteQueue { queue: String },
    /// Register a harness weight from a JSON file.
    AddHarness { file: PathBuf },
    /// Register a build output from a JSON file.
    AddBuild { file: PathBuf },
    /// Print every registered harness weight.
    ReadHarnesses,
    /// Print the build outputs of one task and build type.
    ReadBuilds { task_id: String, build_type: String },
    /// Print one task's state and counters.
    Status { task_id: String },
    /// Print dead-letter records.
    ReadDeadLetter {
        #[arg(long, default_value_t = 20)]
        max: usize,
    },
    /// Print environment and backend diagnostics.
    Doctor,
    /// Generate shell completions.
    Completions { shell: clap_complete::Shell },
}

/// Command failure carrying its exit code.
#[derive(Debug)]
enum CliError {
    BadInput(String),
    Backend(String),
    Conflict(String),
}

impl CliError {
    fn code(&self) -> u8 {
        match self {
            CliError::BadInput(_) => EXIT_BAD_INPUT,
            CliError::Backend(_) => EXIT_BACKEND,
            CliError::Conflict(_) => EXIT_CONFLICT,
        }
    }

    fn message(&self) -> &str {
        match self {
            CliError::BadInput(m) | CliError::Backend(m) | CliError::Conflict(m) => m,
        }
    }
}

fn bad_input(e: impl std::fmt::Display) -> CliError {
    CliError::BadInput(e.to_string())
}

fn backend(e: impl std::fmt::Display) -> CliError {
    CliError::Backend(e.to_string())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("[error] {}", e.message());
            ExitCode::from(e.code())
        }
    }
}

fn run(cli: Cli) -> Result<(), CliError> {
    if let Commands::Completions { shell } = &cli.cmd {
        clap_complete::generate(
            *shell,
            &mut Cli::command(),
            "crucible-admin",
            &mut std::io::stdout(),
        );
        return Ok(());
    }

    let mut config = CrucibleConfig::load(cli.config.as_deref()).map_err(bad_input)?;
    if let Some(kv_endpoint) = cli.kv_endpoint {
        config.kv_endpoint = kv_endpoint;
    }
    let ctx = Ctx::initialize(config).map_err(backend)?;

    match cli.cmd {
        Commands::Completions { .. } => unreachable!("handled above"),
        Commands::SendQueue { queue, file } => send_queue(&ctx, &queue, &file),
        Commands::ReadQueue { queue, group } => read_queue(&ctx, &queue, group.as_deref()),
        Commands::ListQueues => {
            for name in ctx.queues().list().map_err(backend)? {
                println!("{name}");
            }
            Ok(())
        }
        Commands::DeleteQueue { queue } => ctx.queues().delete_queue(&queue).map_err(backend),
        Commands::AddHarness { file } => add_harness(&ctx, &file),
        Commands::AddBuild { file } => add_build(&ctx, &file),
        Commands::ReadHarnesses => read_harnesses(&ctx),
        Commands::ReadBuilds {
            task_id,
            build_type,
        } => read_builds(&ctx, &task_id, &build_type),
        Commands::Status { task_id } => status(&ctx, &task_id),
        Commands::ReadDeadLetter { max } => read_dead_letter(&ctx, max),
        Commands::Doctor => doctor(&ctx),
    }
}

/// `send-queue <queue> <file>`: the file holds one length-prefixed frame.
fn send_queue(ctx: &Ctx, queue: &str, file: &PathBuf) -> Result<(), CliError> {
    let bytes = std::fs::read(file)
        .with_context(|| format!("failed to read {}", file.display()))
        .map_err(bad_input)?;
    let (tag, _) = frame::decode_any(&bytes).map_err(bad_input)?;
    // Strip the transport length prefix; queues store bare values.
    let msg_id = ctx
        .queues()
        .push_raw(queue, &bytes[4..])
        .map_err(backend)?;
    println!("enqueued {} as {queue}#{msg_id}", tag.name());
    Ok(())
}

fn print_record(bytes: &[u8]) -> Result<(), CliError> {
    let (tag, body) = frame::decode_value_any(bytes).map_err(bad_input)?;
    let rendered = serde_json::to_string_pretty(&body).map_err(bad_input)?;
    println!("record: {}", tag.name());
    println!("{rendered}");
    Ok(())
}

fn read_queue(ctx: &Ctx, queue: &str, group: Option<&str>) -> Result<(), CliError> {
    match group {
        None => {
            for (msg_id, bytes) in ctx.queues().peek(queue, 1).map_err(backend)? {
                println!("msg_id: {msg_id}");
                print_record(&bytes)?;
            }
        }
        Some(group) => {
            let deliveries = ctx
                .queues()
                .reserve(queue, group, "crucible-admin", 1, Duration::ZERO)
                .map_err(backend)?;
            for delivery in deliveries {
                println!("msg_id: {}", delivery.msg_id);
                print_record(&delivery.bytes)?;
                ctx.queues()
                    .ack(queue, group, delivery.msg_id)
                    .map_err(backend)?;
            }
        }
    }
    Ok(())
}

fn add_harness(ctx: &Ctx, file: &PathBuf) -> Result<(), CliError> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))
        .map_err(bad_input)?;
    let record: WeightedHarness = serde_json::from_str(&content).map_err(bad_input)?;
    let inserted = catalog::harness_weights(ctx.kv())
        .insert_if_absent(
            &[&record.task_id, &record.package, &record.harness],
            &record,
        )
        .map_err(backend)?;
    if !inserted {
        return Err(CliError::Conflict(format!(
            "harness {}/{}/{} already registered",
            record.task_id, record.package, record.harness
        )));
    }
    println!(
        "registered {}/{}/{} at weight {}",
        record.task_id, record.package, record.harness, record.weight
    );
    Ok(())
}

fn add_build(ctx: &Ctx, file: &PathBuf) -> Result<(), CliError> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))
        .map_err(bad_input)?;
    let record: BuildOutput = serde_json::from_str(&content).map_err(bad_input)?;
    let parts = catalog::build_parts(&record.build);
    let parts: Vec<&str> = parts.iter().map(String::as_str).collect();
    let inserted = catalog::builds(ctx.kv())
        .insert_if_absent(&parts, &record)
        .map_err(backend)?;
    if !inserted {
        return Err(CliError::Conflict(format!(
            "build {} already registered",
            parts.join("/")
        )));
    }
    println!("registered build {}", parts.join("/"));
    Ok(())
}

fn read_harnesses(ctx: &Ctx) -> Result<(), CliError> {
    for record in WeightAllocator::new(ctx.kv()).all().map_err(backend)? {
        println!(
            "{}/{}/{}: {}",
            record.task_id, record.package, record.harness, record.weight
        );
    }
    Ok(())
}

fn read_builds(ctx: &Ctx, task_id: &str, build_type: &str) -> Result<(), CliError> {
    let records = catalog::builds(ctx.kv())
        .scan(&[task_id])
        .map_err(backend)?;
    for (_, record) in records {
        if record.build.build_type.as_str() != build_type {
            continue;
        }
        let rendered = serde_json::to_string_pretty(&record).map_err(bad_input)?;
        println!("{rendered}");
    }
    Ok(())
}

fn status(ctx: &Ctx, task_id: &str) -> Result<(), CliError> {
    let Some(record) = catalog::tasks(ctx.kv()).get(&[task_id]).map_err(backend)? else {
        return Err(CliError::BadInput(format!("unknown task {task_id}")));
    };
    println!("task: {task_id}");
    println!("project: {}", record.task.project_name);
    println!("state: {:?}", record.state);
    println!("deadline: {}", record.task.deadline.to_rfc3339());
    println!("cancelled: {}", record.task.cancelled);
    for (counter, value) in &record.counters {
        println!("{counter}: {value}");
    }
    Ok(())
}

fn read_dead_letter(ctx: &Ctx, max: usize) -> Result<(), CliError> {
    for (msg_id, bytes) in ctx
        .queues()
        .peek(names::DEAD_LETTER, max)
        .map_err(backend)?
    {
        println!("msg_id: {msg_id}");
        print_record(&bytes)?;
    }
    Ok(())
}

fn doctor(ctx: &Ctx) -> Result<(), CliError> {
    println!("kv_endpoint: {}", ctx.config.kv_endpoint);
    println!("scratch_root: {}", ctx.config.scratch_root.display());
    println!(
        "external_api: {}",
        if ctx.config.external_api.endpoint.is_empty() {
            "(unconfigured)"
        } else {
            &ctx.config.external_api.endpoint
        }
    );
    println!("log_level: {}", ctx.config.log_level);
    println!(
        "interactive: {}",
        std::io::stdout().is_terminal()
    );

    // Probe the backend with a write + read + delete.
    let probe_key = format!("doctor_probe:{}", std::process::id());
    ctx.kv().put(&probe_key, b"ok").map_err(backend)?;
    let ok = ctx
        .kv()
        .get(&probe_key)
        .map_err(backend)?
        .as_deref()
        == Some(b"ok".as_slice());
    ctx.kv().delete(&probe_key).map_err(backend)?;
    println!("kv_reachable: {ok}");

    println!("queues: {}", ctx.queues().list().map_err(backend)?.len());
    println!("build_tool: {}", ctx.config.builder.tool);
    Ok(())
}
