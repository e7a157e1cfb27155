use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, BufReader};

use dbgscope_capture::OnDemandDispatcher;
use dbgscope_logs::{
    DbWinNames, PolledMessage, Session, SessionOptions, SourceDescriptor, SourceType,
    format_text_line,
};

mod action;

use action::Action;

/// dbgscope - collect debug output from processes, pipes, sockets and log files
#[derive(Parser, Debug)]
#[command(name = "dbgscope")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Program to run with its stdout and stderr captured
    #[arg(value_name = "COMMAND", trailing_var_arg = true)]
    command: Vec<String>,

    /// Maximum number of retained messages (0 keeps everything)
    #[arg(long, default_value = "0")]
    history_size: usize,

    /// Milliseconds between polls of the capture sources
    #[arg(long, default_value = "40")]
    poll_interval: u64,

    /// Do not capture the shared-memory debug output
    #[arg(long)]
    no_capture: bool,

    /// Capture the local scope only, never the global one
    #[arg(long)]
    no_global: bool,

    /// Base name of the shared-memory objects
    #[arg(long, default_value = "DBWIN")]
    dbwin_name: String,

    /// Keep partial writes pending until a newline arrives
    #[arg(long)]
    no_auto_newline: bool,

    /// Listen for UDP datagrams on this port
    #[arg(long = "udp", value_name = "PORT")]
    udp_ports: Vec<u16>,

    /// Read lines from a TCP server
    #[arg(long = "tcp", value_name = "HOST:PORT")]
    tcp_addrs: Vec<String>,

    /// Replay a saved log or text file
    #[arg(long = "file", value_name = "PATH")]
    files: Vec<String>,

    /// Follow a growing saved log or text file
    #[arg(long = "tail", value_name = "PATH")]
    tails: Vec<String>,

    /// Capture standard input instead of reading commands from it
    #[arg(long)]
    stdin: bool,

    /// Load a configuration file
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Append every captured message to this saved log
    #[arg(long, value_name = "PATH")]
    log_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let result = run(args).await;

    if let Err(e) = &result {
        eprintln!("Error: {:#}", e);
    }

    result
}

fn parse_tcp_addr(addr: &str) -> Result<SourceDescriptor> {
    let (host, port) = addr
        .rsplit_once(':')
        .with_context(|| format!("TCP address '{addr}' has no port"))?;
    let port = port
        .parse()
        .with_context(|| format!("invalid port in TCP address '{addr}'"))?;
    Ok(SourceDescriptor::tcp(host, port))
}

/// Sources requested on the command line
fn descriptors(args: &Args) -> Result<Vec<SourceDescriptor>> {
    let mut descriptors = Vec::new();
    if let Some((program, rest)) = args.command.split_first() {
        descriptors.push(SourceDescriptor::process(program.as_str(), rest.to_vec()));
    }
    if args.stdin {
        let mut pipe = SourceDescriptor::new(SourceType::Pipe);
        pipe.address = "-".to_string();
        descriptors.push(pipe);
    }
    descriptors.extend(args.udp_ports.iter().map(|&port| SourceDescriptor::udp(port)));
    for addr in &args.tcp_addrs {
        descriptors.push(parse_tcp_addr(addr)?);
    }
    descriptors.extend(args.files.iter().map(|path| SourceDescriptor::file(path.as_str(), false)));
    descriptors.extend(args.tails.iter().map(|path| SourceDescriptor::file(path.as_str(), true)));
    Ok(descriptors)
}

/// Print the messages accepted by the first view
fn print_messages(polled: &[PolledMessage]) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    for message in polled {
        let outcome = message.outcome(0);
        if !outcome.accepted {
            continue;
        }
        writeln!(stdout, "{}", format_text_line(&message.message))?;
        if outcome.stop {
            tracing::info!(index = message.index, "stop rule matched");
        }
    }
    stdout.flush()?;
    Ok(())
}

async fn run(args: Args) -> Result<()> {
    let names = DbWinNames::new(args.dbwin_name.as_str());
    let poll_interval = Duration::from_millis(args.poll_interval.max(1));

    let mut session = Session::new(SessionOptions {
        history_size: args.history_size,
        auto_newline: !args.no_auto_newline,
        poll_interval,
        try_global: !args.no_global,
        dbwin_names: names.clone(),
    });

    if let Some(path) = &args.config {
        session
            .load_config(path)
            .with_context(|| format!("failed to load configuration {}", path.display()))?;
    }

    for descriptor in descriptors(&args)? {
        session
            .add_source(&descriptor)
            .with_context(|| format!("failed to start {} source", descriptor.source_type))?;
    }

    if !args.no_capture {
        let status = session.resume().context("failed to capture debug output")?;
        if status.global_downgraded {
            tracing::warn!("capturing local debug output only");
        }
    }

    if let Some(path) = &args.log_file {
        session
            .start_tail(path)
            .with_context(|| format!("failed to create {}", path.display()))?;
    }

    let session = Arc::new(Mutex::new(session));
    let commands = OnDemandDispatcher::new("console");
    let mut failures = commands.subscribe_failures();
    let mut new_lines = session.lock().subscribe();

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut reading_commands = !args.stdin;
    let mut ticker = tokio::time::interval(poll_interval);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = new_lines.recv() => {}
            line = stdin.next_line(), if reading_commands => match line {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => match line.parse::<Action>() {
                    Ok(Action::Quit) => break,
                    Ok(action) => {
                        let session = Arc::clone(&session);
                        let names = names.clone();
                        commands.queue(move || action.apply(&mut session.lock(), &names));
                    }
                    Err(e) => eprintln!("{e:#}"),
                },
                Ok(None) => reading_commands = false,
                Err(e) => {
                    tracing::warn!("stdin closed: {e}");
                    reading_commands = false;
                }
            },
            _ = tokio::signal::ctrl_c() => break,
        }

        commands.execute_queued_jobs();
        while let Ok(failure) = failures.try_recv() {
            eprintln!("{}", failure.message);
        }

        let polled = session.lock().poll();
        print_messages(&polled)?;
    }

    let mut session = session.lock();
    if let Some(count) = session.stop_tail()? {
        tracing::info!(count, "log file closed");
    }
    session.reset();
    Ok(())
}
