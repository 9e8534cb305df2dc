//! Convoy volume daemon
//!
//! Starts the drivers listed on the command line (or recorded in
//! `<root>/convoy.cfg` by an earlier start) and serves requests on a Unix socket.

use anyhow::{Context, Result};
use clap::Parser;
use env_logger::Env;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use convoy::config::{self, Config};
use convoy::daemon::{self, Daemon, DaemonOptions};
use convoy::driver::Opts;

#[derive(Parser, Debug)]
#[command(name = "convoy")]
#[command(about = "Volume daemon with thin-pool, filesystem and cloud drivers", long_about = None)]
struct Args {
    /// Debug logging
    #[arg(long)]
    debug: bool,

    /// Append logs to this file instead of stderr
    #[arg(long)]
    log: Option<PathBuf>,

    /// Directory holding the daemon and driver records
    #[arg(long)]
    root: Option<PathBuf>,

    /// TOML file with [daemon] and [drivers.<name>] tables
    #[arg(long)]
    config: Option<PathBuf>,

    /// Mount namespace to mount volumes in, e.g. /proc/1/ns/mnt
    #[arg(long = "mnt-ns")]
    mnt_ns: Option<String>,

    #[arg(long)]
    ignore_docker_delete: bool,

    #[arg(long)]
    create_on_docker_mount: bool,

    /// Time limit for each command, at least 1m
    #[arg(long)]
    cmd_timeout: Option<String>,

    /// Rebuild convoy.cfg from the command line
    #[arg(long)]
    ignore_config_file: bool,

    /// Drivers to enable; the first is the default
    #[arg(long, value_delimiter = ',')]
    drivers: Vec<String>,

    /// Driver options as key=value, e.g. vfs.path=/opt/volumes
    #[arg(long = "driver-opts", value_delimiter = ',')]
    driver_opts: Vec<String>,

    /// Unix socket to serve requests on
    #[arg(long)]
    socket: Option<PathBuf>,
}

fn parse_driver_opts(opts: &[String]) -> Result<Opts> {
    opts.iter()
        .map(|kv| {
            let (key, value) = kv
                .split_once('=')
                .with_context(|| format!("driver option {:?} is not key=value", kv))?;
            Ok((key.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}

fn init_logging(debug: bool, log_file: Option<&PathBuf>) -> Result<()> {
    let level = if debug { "debug" } else { "info" };
    let mut builder = env_logger::Builder::from_env(Env::default().default_filter_or(level));
    if debug {
        builder.filter_level(log::LevelFilter::Debug);
    }
    if let Some(path) = log_file {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("cannot open log file {}", path.display()))?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }
    builder.init();
    Ok(())
}

/// Command-line flags override the `[daemon]` table of the config file
fn build_options(args: &Args, file: &Config) -> Result<(DaemonOptions, PathBuf)> {
    let section = &file.daemon;

    let mut driver_opts = file.driver_opts();
    driver_opts.extend(parse_driver_opts(&args.driver_opts)?);

    let cmd_timeout = match args.cmd_timeout.as_ref().or(section.cmd_timeout.as_ref()) {
        Some(value) => config::parse_cmd_timeout(value)?,
        None => convoy::util::DEFAULT_CMD_TIMEOUT,
    };

    let options = DaemonOptions {
        root: args
            .root
            .clone()
            .or_else(|| section.root.as_ref().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(daemon::DEFAULT_ROOT)),
        drivers: if args.drivers.is_empty() {
            section.drivers.clone().unwrap_or_default()
        } else {
            args.drivers.clone()
        },
        driver_opts,
        mnt_ns: args
            .mnt_ns
            .clone()
            .or_else(|| section.mnt_ns.clone())
            .unwrap_or_default(),
        ignore_docker_delete: args.ignore_docker_delete
            || section.ignore_docker_delete.unwrap_or(false),
        create_on_docker_mount: args.create_on_docker_mount
            || section.create_on_docker_mount.unwrap_or(false),
        cmd_timeout,
        ignore_config_file: args.ignore_config_file,
    };
    let socket = args
        .socket
        .clone()
        .or_else(|| section.socket.as_ref().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(daemon::DEFAULT_SOCKET));
    Ok((options, socket))
}

fn run(args: Args, file: Config) -> Result<()> {
    let (options, socket) = build_options(&args, &file)?;

    log::info!("Starting convoy in {}", options.root.display());
    let daemon = Arc::new(Daemon::start(options).context("daemon failed to start")?);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("cannot build async runtime")?;
    let served = runtime.block_on(daemon::server::serve(daemon.clone(), &socket));

    daemon.shutdown();
    served.with_context(|| format!("server on {} failed", socket.display()))
}

fn main() {
    let args = Args::parse();

    let file = match &args.config {
        Some(path) => match Config::load(path) {
            Ok(file) => file,
            Err(e) => {
                eprintln!("convoy: cannot load config {}: {}", path.display(), e);
                process::exit(1);
            }
        },
        None => Config::default(),
    };

    let debug = args.debug || file.daemon.debug.unwrap_or(false);
    let log_file = args.log.clone().or_else(|| file.daemon.log.as_ref().map(PathBuf::from));
    if let Err(e) = init_logging(debug, log_file.as_ref()) {
        eprintln!("convoy: {:#}", e);
        process::exit(1);
    }

    if let Err(e) = run(args, file) {
        log::error!("{:#}", e);
        process::exit(1);
    }
}
