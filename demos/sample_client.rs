// Copyright 2026 Commlink Contributors

//! Sample commlink client: connects through the connection manager and
//! issues blocking echo and status requests.

use std::net::SocketAddr;
use std::process;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::Parser;
use slog::{error, info, o, Drain, Logger};

use commlink::serialize;
use commlink::{
    check_response, Comm, CommConfig, ConnectionManager, RetryPolicy,
};

const COMMAND_ECHO: u16 = 0;
const COMMAND_STATUS: u16 = 1;

#[derive(Debug, Parser)]
struct Cli {
    /// Server address
    #[arg(default_value = "127.0.0.1:38060")]
    address: SocketAddr,
    /// Message to echo
    #[arg(long, default_value = "hello from commlink")]
    message: String,
    /// Number of echo requests to send
    #[arg(long, default_value_t = 3)]
    count: u32,
}

fn main() {
    let cli = Cli::parse();

    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    let root_log = Logger::root(
        Mutex::new(slog_term::FullFormat::new(plain).build()).fuse(),
        o!("build-id" => "0.1.0"),
    );

    let comm = Arc::new(
        Comm::new(CommConfig::default(), root_log.clone())
            .expect("failed to start comm layer"),
    );
    let manager = ConnectionManager::new(
        Arc::clone(&comm),
        RetryPolicy {
            limit: 3,
            interval: Duration::from_millis(500),
        },
        root_log.clone(),
    );

    manager.add(cli.address, "sample");
    if !manager.wait_for_connection(cli.address, Duration::from_secs(10)) {
        error!(root_log, "could not connect"; "address" => %cli.address);
        process::exit(1);
    }

    for i in 0..cli.count {
        let request = Comm::build_request(COMMAND_ECHO, &cli.message);
        match comm
            .send_request_blocking(cli.address, request, Some(Duration::from_secs(5)))
            .and_then(|event| check_response(&event))
        {
            Ok(mut body) => match serialize::decode_string(&mut body) {
                Ok(echoed) => {
                    info!(root_log, "echo response"; "n" => i, "text" => echoed)
                }
                Err(e) => error!(root_log, "bad echo payload"; "err" => %e),
            },
            Err(e) => {
                error!(root_log, "echo request failed"; "err" => %e);
                process::exit(1);
            }
        }
    }

    let request = Comm::build_request_empty(COMMAND_STATUS);
    match comm
        .send_request_blocking(cli.address, request, Some(Duration::from_secs(5)))
        .and_then(|event| check_response(&event))
    {
        Ok(mut body) => match serialize::decode_string(&mut body) {
            Ok(status) => info!(root_log, "server status"; "status" => status),
            Err(e) => error!(root_log, "bad status payload"; "err" => %e),
        },
        Err(e) => {
            error!(root_log, "status request failed"; "err" => %e);
            process::exit(1);
        }
    }
}
