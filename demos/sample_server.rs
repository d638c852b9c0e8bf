// Copyright 2026 Commlink Contributors

//! Sample commlink server: an echo/status service showing how a command
//! handler set plugs into the dispatcher and work queue.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use clap::Parser;
use slog::{debug, error, o, Drain, Logger};

use commlink::serialize;
use commlink::{
    Comm, CommConfig, CommandTable, ErrorCode, ResponseCallback,
    ServiceDispatcher, ServiceHandler, WorkQueue,
};

const COMMAND_ECHO: u16 = 0;
const COMMAND_STATUS: u16 = 1;

const TABLE: CommandTable = CommandTable::new("sample", &["echo", "status"]);

#[derive(Debug, Parser)]
struct Cli {
    /// Listen for requests at this address
    #[arg(default_value = "127.0.0.1:38060")]
    address: SocketAddr,
    /// Reactor thread count
    #[arg(long, default_value_t = 2)]
    reactors: usize,
    /// Worker thread count
    #[arg(long, default_value_t = 4)]
    workers: usize,
}

struct SampleService {
    log: Logger,
    started: Instant,
}

impl ServiceHandler for SampleService {
    fn table(&self) -> &CommandTable {
        &TABLE
    }

    fn run(&self, command: u16, cb: ResponseCallback, mut payload: Bytes) {
        let result = match command {
            COMMAND_ECHO => match serialize::decode_string(&mut payload) {
                Ok(text) => {
                    debug!(self.log, "handling echo request"; "len" => text.len());
                    let mut body = BytesMut::with_capacity(serialize::string_len(&text));
                    serialize::encode_string(&mut body, &text);
                    cb.ok_with(body.freeze())
                }
                Err(e) => cb.error(
                    ErrorCode::RequestTruncated as i32,
                    &format!("bad echo arguments: {}", e),
                ),
            },
            COMMAND_STATUS => {
                debug!(self.log, "handling status request");
                let status =
                    format!("ok, up {} seconds", self.started.elapsed().as_secs());
                let mut body = BytesMut::with_capacity(serialize::string_len(&status));
                serialize::encode_string(&mut body, &status);
                cb.ok_with(body.freeze())
            }
            // the dispatcher has already validated the code against TABLE
            other => cb.error(
                ErrorCode::ProtocolError as i32,
                &format!("command code {} not implemented", other),
            ),
        };
        if let Err(e) = result {
            error!(self.log, "failed to send response"; "err" => %e);
        }
    }
}

fn main() {
    let cli = Cli::parse();

    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    let root_log = Logger::root(
        Mutex::new(slog_term::FullFormat::new(plain).build()).fuse(),
        o!("build-id" => "0.1.0"),
    );

    let comm = Arc::new(
        Comm::new(
            CommConfig {
                reactor_threads: cli.reactors,
                ..CommConfig::default()
            },
            root_log.clone(),
        )
        .expect("failed to start comm layer"),
    );
    let queue = Arc::new(WorkQueue::new(cli.workers, root_log.clone()));
    let service = Arc::new(SampleService {
        log: root_log.clone(),
        started: Instant::now(),
    });
    let dispatcher =
        ServiceDispatcher::new(Arc::clone(&comm), queue, service, root_log.clone());

    comm.listen(cli.address, Arc::new(dispatcher))
        .expect("failed to bind listen address");

    loop {
        thread::park();
    }
}
