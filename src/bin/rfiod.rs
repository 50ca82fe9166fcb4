// Copyright 2020 Joyent, Inc.

use std::net::SocketAddr;
use std::process;
use std::sync::{Arc, Mutex};

use clap::{crate_version, value_t, App, Arg, ArgMatches};
use slog::{crit, info, o, Drain, Logger};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use rfio::backend::LocalBackend;
use rfio::config::{ConfigSource, RfioConfig};
use rfio::error::RfioError;
use rfio::server;
use rfio::session::ServerContext;

static APP: &str = "rfiod";
static DEFAULT_LISTEN: &str = "0.0.0.0:5001";

pub fn parse_opts<'a>(app: String) -> ArgMatches<'a> {
    App::new(app)
        .about("RFIO v3 file transfer server")
        .version(crate_version!())
        .arg(
            Arg::with_name("config")
                .help("Path of the configuration file")
                .long("config")
                .short("c")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("listen")
                .help("Address to listen on (Default: 0.0.0.0:5001)")
                .long("listen")
                .short("l")
                .takes_value(true),
        )
        .get_matches()
}

async fn run(matches: &ArgMatches<'_>, log: &Logger) -> Result<(), RfioError> {
    let source = match matches.value_of("config") {
        Some(path) => ConfigSource::from_file(path)?,
        None => ConfigSource::new(),
    };
    let config = RfioConfig::from_source(&source)?;
    info!(log, "configuration loaded";
        "read_threads" => config.read.use_threads,
        "write_threads" => config.write.use_threads,
        "port_range" => ?config.port_range,
        "checksum" => config.checksum_enabled());

    let addr = value_t!(matches, "listen", SocketAddr).unwrap_or_else(|_| {
        DEFAULT_LISTEN
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 5001)))
    });
    let listener = TcpListener::bind(addr).await?;
    let ctx = Arc::new(ServerContext::new(config, Arc::new(LocalBackend)));

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    let signal_log = log.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!(signal_log, "interrupted");
            signal_cancel.cancel();
        }
    });

    server::serve(listener, ctx, cancel, Some(log)).await
}

#[tokio::main]
async fn main() {
    let matches = parse_opts(APP.to_string());

    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    let root_log = Logger::root(
        Mutex::new(slog_term::FullFormat::new(plain).build()).fuse(),
        o!("build-id" => crate_version!()),
    );

    if let Err(e) = run(&matches, &root_log).await {
        crit!(root_log, "rfiod failed"; "err" => %e);
        process::exit(1);
    }
}
