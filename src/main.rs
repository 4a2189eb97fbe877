use std::error::Error;
use std::io::Write;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing_subscriber::EnvFilter;

use teleworker::grpc::JobServer;
use teleworker::shutdown;
use teleworker::tls::TlsIdentity;
use teleworker::worker::{self, Job, Worker};

fn main() {
    // Take the shortcut if the first argument is the child-exec marker; that
    // path must not start a runtime or touch the normal dispatcher
    let args: Vec<String> = std::env::args().collect();
    if args.len() > 1 && args[1] == worker::CHILD_EXEC_ARG {
        child_exec_main(&args[2..]);
    }
    cli_main();
}

#[cfg(target_os = "linux")]
fn child_exec_main(args: &[String]) -> ! {
    match worker::child_exec::run(args) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("Unexpected child-exec error: {err}");
            std::process::exit(1);
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn child_exec_main(_args: &[String]) -> ! {
    eprintln!("child-exec is only supported on linux");
    std::process::exit(1);
}

#[derive(Parser, Debug)]
#[command(name = "teleworker")]
#[command(about = "Worker for running jobs under per-job isolation")]
struct Cli {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Start the gRPC job server
    Serve(ServeArgs),
    /// Run a single command as a job on an in-process worker
    DirectExec(DirectExecArgs),
    /// Internal utility to perform diagnostics and dump the result
    Diag(DiagArgs),
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Address to listen on (port 0 picks a free port)
    #[arg(long, default_value = "127.0.0.1:0")]
    address: SocketAddr,

    /// CA certificate file used to verify client certificates
    #[arg(long)]
    client_ca_cert: PathBuf,

    /// Server certificate file presented to clients
    #[arg(long)]
    server_cert: PathBuf,

    /// Server key file for server auth
    #[arg(long)]
    server_key: PathBuf,

    /// Run without any resource limits
    #[arg(long)]
    without_limits: bool,
}

#[derive(Args, Debug)]
struct DirectExecArgs {
    /// Run without any resource limits
    #[arg(long)]
    without_limits: bool,

    /// Change the root of the job (requires limits)
    #[arg(long)]
    root: Option<String>,

    /// Command and arguments to run
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

#[derive(Args, Debug)]
struct DiagArgs {
    /// Amount of bytes to attempt to allocate
    #[arg(long, default_value_t = 0)]
    alloc_mem: usize,

    /// Test disk write speed
    #[arg(long)]
    write_disk: bool,
}

#[tokio::main]
async fn cli_main() {
    // Logs go to stderr so mirrored job output on stdout stays clean
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Cmd::Serve(args) => serve(args).await,
        Cmd::DirectExec(args) => match direct_exec(args).await {
            Ok(code) => std::process::exit(code),
            Err(err) => Err(err),
        },
        Cmd::Diag(args) => diag(args),
    };
    if let Err(err) = result {
        tracing::error!(error = %err, "command failed");
        std::process::exit(1);
    }
}

async fn serve(args: ServeArgs) -> Result<(), Box<dyn Error>> {
    let tls =
        TlsIdentity::load(&args.client_ca_cert, &args.server_cert, &args.server_key).await?;
    let config = if args.without_limits {
        worker::Config::default()
    } else {
        worker::Config::standard()
    };
    let worker = Arc::new(Worker::new(config)?);
    let listener = TcpListener::bind(args.address).await?;

    let shutdown = shutdown::install_shutdown_handler();
    let server = JobServer::new(listener, worker.clone(), tls.server_tls_config());
    server.run(shutdown).await?;

    tracing::info!("Attempting worker shutdown");
    match timeout(Duration::from_secs(3), worker.shutdown(false)).await {
        Ok(result) => return Ok(result?),
        Err(_) => tracing::warn!("Shutdown timed out, attempting forced shutdown"),
    }
    match timeout(Duration::from_secs(3), worker.shutdown(true)).await {
        Ok(Ok(())) => Ok(()),
        // The drain is single-shot; the timed-out soft attempt already
        // consumed it
        Ok(Err(err)) => {
            tracing::warn!(error = %err, "Forced shutdown rejected");
            Ok(())
        }
        Err(_) => Err("forced shutdown timed out".into()),
    }
}

async fn direct_exec(args: DirectExecArgs) -> Result<i32, Box<dyn Error>> {
    let config = if args.without_limits {
        worker::Config::default()
    } else {
        worker::Config::standard()
    };
    let worker = Worker::new(config)?;
    let (command, rest) = args
        .command
        .split_first()
        .ok_or("at least one argument required")?;
    let job = worker
        .submit_job("", "", command, rest.to_vec(), args.root)
        .await?;

    let (updates, mut wake) = mpsc::channel(5);
    job.add_update_listener(updates).await;
    let shutdown = shutdown::install_shutdown_handler();

    let mut buf = [0u8; 1024];
    let mut stdout_offset = 0;
    let mut stderr_offset = 0;
    loop {
        // Snapshot the exit code before draining so output appended just
        // before completion is never cut off
        let exit_code = job.exit_code().await;
        stdout_offset = mirror_output(&job, false, &mut buf, stdout_offset).await?;
        stderr_offset = mirror_output(&job, true, &mut buf, stderr_offset).await?;
        if let Some(code) = exit_code {
            return Ok(code);
        }
        tokio::select! {
            // Any update kind triggers a re-loop
            _ = wake.recv() => {}
            _ = shutdown.cancelled() => {
                tracing::info!("Termination signal received, attempting shutdown");
                if let Ok(code) = timeout(Duration::from_secs(3), job.stop(false)).await {
                    return Ok(code);
                }
                tracing::warn!("Shutdown timed out, attempting forced shutdown");
                if let Ok(code) = timeout(Duration::from_secs(3), job.stop(true)).await {
                    return Ok(code);
                }
                return Err("failed shutting down job".into());
            }
        }
    }
}

/// Copies job output from `offset` on into this process's matching stream,
/// returning the next offset.
async fn mirror_output(
    job: &Job,
    stderr: bool,
    buf: &mut [u8],
    mut offset: usize,
) -> Result<usize, Box<dyn Error>> {
    loop {
        let (read, _, _) = job.read_output(stderr, buf, offset).await?;
        if read == 0 {
            return Ok(offset);
        }
        if stderr {
            std::io::stderr().write_all(&buf[..read])?;
        } else {
            let mut stdout = std::io::stdout();
            stdout.write_all(&buf[..read])?;
            stdout.flush()?;
        }
        offset += read;
    }
}

/// Diagnostic output of the `diag` subcommand, consumed by the isolation
/// tests.
#[derive(Debug, Serialize)]
struct DiagnosticResult {
    pid: i32,
    ppid: i32,
    net_interface_avail: bool,
    dir: String,
    cpu_task_nanos: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    disk_bps: Option<f64>,
}

fn diag(args: DiagArgs) -> Result<(), Box<dyn Error>> {
    let mut result = DiagnosticResult {
        pid: std::process::id() as i32,
        ppid: nix::unistd::getppid().as_raw(),
        net_interface_avail: false,
        dir: std::env::current_dir()?.to_string_lossy().into_owned(),
        cpu_task_nanos: 0,
        disk_bps: None,
    };

    // An interface counts as available when it has flags beyond plain
    // loopback (tunl/sit style interfaces report none)
    for ifaddr in nix::ifaddrs::getifaddrs()? {
        let flags = ifaddr.flags;
        if !flags.is_empty() && !flags.contains(nix::net::if_::InterfaceFlags::IFF_LOOPBACK) {
            result.net_interface_avail = true;
            break;
        }
    }

    // If an allocation is requested, attempt it with every page touched
    if args.alloc_mem > 0 {
        let mut block: Vec<u8> = Vec::new();
        block.resize(args.alloc_mem, 1);
        std::hint::black_box(&block);
    }

    // Simulate some CPU
    let started = Instant::now();
    let mut acc: u64 = 0;
    for i in 0..500_000_000u64 {
        acc = acc.wrapping_add(i);
    }
    std::hint::black_box(acc);
    result.cpu_task_nanos = started.elapsed().as_nanos() as i64;

    if args.write_disk {
        result.disk_bps = Some(write_disk_bps()?);
    }

    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

/// Writes 5MB through direct IO and returns the observed bytes per second.
fn write_disk_bps() -> Result<f64, Box<dyn Error>> {
    use std::os::unix::fs::OpenOptionsExt;

    const BLOCK_SIZE: usize = 4096;
    const BYTES_TOTAL: usize = 5 * 1024 * 1024;

    // O_DIRECT requires a block-aligned buffer
    let raw = vec![0u8; BLOCK_SIZE * 2];
    let aligned = raw.as_ptr().align_offset(BLOCK_SIZE);
    let block = &raw[aligned..aligned + BLOCK_SIZE];

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .custom_flags(libc::O_DIRECT | libc::O_SYNC)
        .open("temp-file")?;
    let started = Instant::now();
    let mut written = 0;
    while written < BYTES_TOTAL {
        file.write_all(block)?;
        written += block.len();
    }
    let elapsed = started.elapsed();
    drop(file);
    let _ = std::fs::remove_file("temp-file");
    Ok(BYTES_TOTAL as f64 / elapsed.as_secs_f64())
}
