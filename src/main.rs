use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use gdbcore::{AttachResult, CoreConfig, DebugSession, InferiorStatus};
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(long, env = "TRACEHOUND_CONFIG")]
    config: Option<PathBuf>,

    /// Debugger binary, overrides the configuration
    #[arg(long, env = "TRACEHOUND_GDB")]
    gdb: Option<PathBuf>,

    /// Attach to a running process
    #[arg(long, conflicts_with = "exec")]
    pid: Option<i32>,

    /// Start a program under the debugger
    #[arg(long)]
    exec: Option<PathBuf>,

    /// Arguments for `--exec`
    #[arg(long, default_value_t = String::new(), requires = "exec")]
    args: String,

    /// Library preloaded into `--exec`
    #[arg(long, requires = "exec")]
    preload: Option<PathBuf>,

    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let core_level = if args.verbose {
        log::LevelFilter::Trace
    } else {
        log::LevelFilter::Debug
    };
    if let Err(e) = simple_logger::SimpleLogger::new()
        .with_level(log::LevelFilter::Info)
        .with_module_level("gdbcore", core_level)
        .init()
    {
        eprintln!("failed to initialize logging: {e}");
        return ExitCode::FAILURE;
    }

    let mut config = match &args.config {
        Some(path) => match CoreConfig::load(path) {
            Ok(config) => config,
            Err(e) => {
                log::error!("{}", e);
                return ExitCode::FAILURE;
            }
        },
        None => CoreConfig::default(),
    };
    if let Some(gdb) = args.gdb.clone() {
        config.gdb_path = gdb;
    }

    log::info!("tracehound starting, debugger {}", config.gdb_path.display());
    let session = DebugSession::new(config);
    match run(&session, &args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(session: &DebugSession, args: &Args) -> gdbcore::Result<()> {
    if let Some(pid) = args.pid {
        let result = session.attach(pid).await?;
        if result != AttachResult::Successful {
            log::error!("can't attach to {}: {}", pid, result);
            return Ok(());
        }
    } else if let Some(path) = &args.exec {
        if !session
            .create_process(path, &args.args, args.preload.as_deref())
            .await?
        {
            log::error!("can't start {}", path.display());
            return Ok(());
        }
        log::info!("started {} as process {}", path.display(), session.pid());
    } else {
        session.init_gdb().await?;
    }

    let (subscription, mut events) = session.subscribe();
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let status_change = session.status_change();
        let process_exit = session.process_exit();
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                if session.status() == InferiorStatus::Running {
                    session.interrupt_inferior(gdbcore::StopReason::Pause).await?;
                    continue;
                }
                break;
            }
            Some(event) = events.recv() => println!("{event}"),
            _ = status_change.wait() => {
                log::info!("inferior {:?}", session.status());
            }
            _ = process_exit.wait() => {
                log::info!("inferior exited");
                break;
            }
            line = stdin.next_line() => match line {
                Ok(Some(command)) if command.trim().is_empty() => {}
                Ok(Some(command)) => {
                    let response = session.execute(command.trim()).await?;
                    print!("{}", response.console);
                    if let Some(msg) = response.error_message() {
                        eprintln!("error: {msg}");
                    }
                }
                Ok(None) | Err(_) => break,
            },
        }
    }

    session.unsubscribe(subscription);
    if session.is_initialized() {
        session.detach().await?;
    }
    Ok(())
}
