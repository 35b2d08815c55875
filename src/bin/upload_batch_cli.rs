//! upload-batch CLI — 运行模拟或真实的并发上传批处理并输出结果
//!
//! Usage:
//!   upload-batch-cli simulate [OPTIONS]              Run a batch against the simulated store
//!   upload-batch-cli put --endpoint <url> ...        PUT a file N times to an HTTP object store
//!   upload-batch-cli version                         Show version information

use anyhow::{anyhow, bail, Context};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use upload_batch::batch::{Batch, BatchConfig, BatchHandle, PayloadRef};
use upload_batch::transport::{HttpPutConfig, HttpPutTransport, Script, SimulatedTransport};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        print_usage();
        return ExitCode::from(1);
    }

    let outcome = match args[1].as_str() {
        "simulate" => cmd_simulate(&args[2..]).await,
        "put" => cmd_put(&args[2..]).await,
        "version" | "--version" | "-V" => {
            cmd_version();
            return ExitCode::SUCCESS;
        }
        "help" | "--help" | "-h" => {
            print_usage();
            return ExitCode::SUCCESS;
        }
        other => {
            eprintln!("Unknown command: {other}");
            eprintln!();
            print_usage();
            return ExitCode::from(1);
        }
    };

    match outcome {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::from(1)
        }
    }
}

fn print_usage() {
    println!(
        r#"upload-batch-cli — 并发上传批处理工具

USAGE:
    upload-batch-cli <COMMAND> [OPTIONS]

COMMANDS:
    simulate    Run a batch against the simulated object store
                  --ops <n>              operations (default 20)
                  --limit <n>            concurrency limit (default from config)
                  --fail <i,j,..>        operations that fail
                  --reject <i,j,..>      operations refused synchronously
                  --latency-ms <ms>      per-operation latency (default 50)
                  --payload-bytes <n>    payload size (default 1024)
                  --capacity-bytes <n>   store capacity; later uploads fail once full
    put         Upload one file repeatedly with HTTP PUT
                  --endpoint <url>       object store endpoint (required)
                  --bucket <name>        bucket (required)
                  --file <path>          payload file (required)
                  --count <n>            uploads (default 20)
                  --limit <n>            concurrency limit
    version     Show version information
    help        Show this help message

COMMON OPTIONS:
    --config <path>          YAML batch config
    --timeout-ms <ms>        abort the batch after this long
    --operation-timeout-ms   per-operation deadline
    --max-failures <n>       cancel the batch after n failures

ENVIRONMENT:
    UPLOAD_BATCH_CONCURRENCY, UPLOAD_BATCH_OPERATION_TIMEOUT_MS,
    UPLOAD_BATCH_MAX_FAILURES, UPLOAD_BATCH_ABORT_IN_FLIGHT, RUST_LOG

EXIT CODES:
    0 all operations succeeded, 2 some failed or were cancelled, 1 error"#
    );
}

fn cmd_version() {
    println!("upload-batch-cli {}", env!("CARGO_PKG_VERSION"));
}

fn flag<'a>(args: &'a [String], name: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == name)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

fn parse_flag<T>(args: &[String], name: &str) -> anyhow::Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    flag(args, name)
        .map(|v| v.parse::<T>().map_err(|e| anyhow!("invalid value for {name}: {e}")))
        .transpose()
}

fn parse_list(args: &[String], name: &str) -> anyhow::Result<Vec<usize>> {
    match flag(args, name) {
        None => Ok(Vec::new()),
        Some(v) => v
            .split(',')
            .filter(|s| !s.trim().is_empty())
            .map(|s| {
                s.trim()
                    .parse::<usize>()
                    .map_err(|e| anyhow!("invalid index {s:?} in {name}: {e}"))
            })
            .collect(),
    }
}

fn load_config(args: &[String]) -> anyhow::Result<BatchConfig> {
    let mut cfg = match flag(args, "--config") {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading config {path}"))?;
            BatchConfig::from_yaml_str(&raw)?
        }
        None => BatchConfig::default(),
    }
    .merge_env();

    if let Some(limit) = parse_flag::<usize>(args, "--limit")? {
        cfg = cfg.with_concurrency_limit(limit);
    }
    if let Some(ms) = parse_flag::<u64>(args, "--operation-timeout-ms")? {
        cfg = cfg.with_operation_timeout(Duration::from_millis(ms));
    }
    if let Some(n) = parse_flag::<usize>(args, "--max-failures")? {
        cfg = cfg.with_max_failures(n);
    }
    cfg.validate()?;
    Ok(cfg)
}

async fn cmd_simulate(args: &[String]) -> anyhow::Result<ExitCode> {
    let cfg = load_config(args)?;
    let ops = parse_flag::<usize>(args, "--ops")?.unwrap_or(20);
    let latency = parse_flag::<u64>(args, "--latency-ms")?.unwrap_or(50);
    let payload_bytes = parse_flag::<usize>(args, "--payload-bytes")?.unwrap_or(1024);

    let mut transport = SimulatedTransport::new()
        .with_latency(Duration::from_millis(latency))
        .failing(parse_list(args, "--fail")?);
    for i in parse_list(args, "--reject")? {
        transport = transport.with_script(i, Script::Reject(format!("operation {i} refused")));
    }
    if let Some(cap) = parse_flag::<u64>(args, "--capacity-bytes")? {
        transport = transport.with_capacity(cap);
    }

    let payload = PayloadRef::bytes(vec![0u8; payload_bytes]);
    let batch = Batch::builder()
        .config(cfg)
        .spawn(Arc::new(transport), (0..ops).map(|_| payload.clone()))?;
    finish(batch, parse_flag::<u64>(args, "--timeout-ms")?).await
}

async fn cmd_put(args: &[String]) -> anyhow::Result<ExitCode> {
    let cfg = load_config(args)?;
    let endpoint = flag(args, "--endpoint").ok_or_else(|| anyhow!("--endpoint is required"))?;
    let bucket = flag(args, "--bucket").ok_or_else(|| anyhow!("--bucket is required"))?;
    let file = PathBuf::from(flag(args, "--file").ok_or_else(|| anyhow!("--file is required"))?);
    let count = parse_flag::<usize>(args, "--count")?.unwrap_or(20);

    if !file.is_file() {
        bail!("{} is not a readable file", file.display());
    }
    let endpoint = url::Url::parse(endpoint).with_context(|| format!("parsing endpoint {endpoint}"))?;
    let transport = HttpPutTransport::new(HttpPutConfig::new(endpoint, bucket))?;

    let batch = Batch::builder()
        .config(cfg)
        .spawn(Arc::new(transport), (0..count).map(|_| PayloadRef::file(&file)))?;
    finish(batch, parse_flag::<u64>(args, "--timeout-ms")?).await
}

async fn finish(batch: BatchHandle, timeout_ms: Option<u64>) -> anyhow::Result<ExitCode> {
    let interrupt = {
        let batch = batch.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("Interrupted, cancelling pending uploads...");
                batch.cancel();
            }
        })
    };

    let result = match timeout_ms {
        Some(ms) => batch.wait_timeout(Duration::from_millis(ms)).await?,
        None => batch.wait().await?,
    };
    interrupt.abort();

    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(if result.all_succeeded() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(2)
    })
}
