//! Line-delimited chat relay demonstrating cross-service messaging: one
//! native service (`ingest`) owns the listener and every client connection,
//! relaying each line to its other peers at the socket layer, while also
//! notifying a second service (`logger`) of every line over the service
//! message contract. Two statically configured services installed before any
//! worker thread starts, addressed deterministically (spec §4.G "services are
//! installed... before any worker thread starts").

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::{App, Arg};
use ember_core::addr::Address;
use ember_core::buffer::Buffer;
use ember_core::envelope::{Envelope, EnvelopeType};
use ember_core::logging::{info, LogConfig};
use ember_net::framer::delimited::ReadRequest;
use ember_net::server::subtype;
use ember_net::wire::WireMode;
use ember_runtime::config::{RuntimeConfig, ServiceSpec};
use ember_runtime::service::{Service, ServiceContext};
use ember_runtime::worker::ServiceFactory;
use ember_runtime::Runtime;

const LINE_DELIM: u8 = b'\n';

/// Owns the listener and every accepted connection; relays each line to
/// every other connected client and notifies `logger_addr` of it.
struct IngestService {
    host: String,
    port: u16,
    logger_addr: u32,
    listen_fd: Option<u32>,
    clients: Vec<u32>,
    next_session: i64,
}

impl IngestService {
    fn new(host: String, port: u16, logger_addr: u32) -> IngestService {
        IngestService {
            host,
            port,
            logger_addr,
            listen_fd: None,
            clients: Vec::new(),
            next_session: 1,
        }
    }

    fn accept_next(&mut self, ctx: &mut ServiceContext) {
        let fd = match self.listen_fd {
            Some(fd) => fd,
            None => return,
        };
        let session = self.next_session;
        self.next_session += 1;
        if let Ok(Some(envelope)) = ctx.accept(fd, session) {
            let self_addr = ctx.self_addr();
            ctx.send(self_addr, envelope);
        }
    }

    fn begin_read(&mut self, ctx: &mut ServiceContext, fd: u32) {
        let session = self.next_session;
        self.next_session += 1;
        if let Ok(Some(data)) = ctx.read(fd, ReadRequest::UntilDelimiter(vec![LINE_DELIM]), session) {
            self.handle_line(ctx, fd, data);
        }
    }

    fn handle_line(&mut self, ctx: &mut ServiceContext, from_fd: u32, line: Vec<u8>) {
        for &fd in &self.clients {
            if fd != from_fd {
                let mut framed = line.clone();
                framed.push(LINE_DELIM);
                ctx.write(fd, &framed);
            }
        }

        let self_addr = ctx.self_addr();
        let logger_addr = self.logger_addr;
        ctx.send(logger_addr, Envelope::new(EnvelopeType::ServiceMsg, self_addr, logger_addr, 0, Buffer::from_slice(&line)));

        self.begin_read(ctx, from_fd);
    }
}

impl Service for IngestService {
    fn init(&mut self, ctx: &mut ServiceContext, _params: &serde_json::Value) -> bool {
        match ctx.listen(&self.host, self.port, WireMode::Delimited, None) {
            Ok(fd) => {
                self.listen_fd = Some(fd);
                true
            }
            Err(_) => false,
        }
    }

    fn start(&mut self, ctx: &mut ServiceContext) {
        self.accept_next(ctx);
    }

    fn on_message(&mut self, ctx: &mut ServiceContext, envelope: Envelope) {
        if envelope.kind != EnvelopeType::SocketTcp {
            return;
        }

        match envelope.subtype {
            subtype::SOCKET_ACCEPT => {
                let payload = envelope.payload.as_slice();
                if payload.len() == 4 {
                    let fd = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
                    self.clients.push(fd);
                    self.begin_read(ctx, fd);
                }
                self.accept_next(ctx);
            }
            subtype::SOCKET_RECV => {
                let line = envelope.payload.as_slice().to_vec();
                self.handle_line(ctx, envelope.sender, line);
            }
            subtype::SOCKET_CLOSE => {
                self.clients.retain(|&fd| fd != envelope.sender);
            }
            _ => {}
        }
    }

    fn destroy(&mut self, _ctx: &mut ServiceContext) {}
}

/// Receives every chat line as a service message and logs it; has no socket
/// access of its own, so it can land on any worker without touching
/// connections owned by `ingest`.
struct LoggerService {
    lines_seen: u64,
}

impl LoggerService {
    fn new() -> LoggerService {
        LoggerService { lines_seen: 0 }
    }
}

impl Service for LoggerService {
    fn init(&mut self, _ctx: &mut ServiceContext, _params: &serde_json::Value) -> bool {
        true
    }

    fn start(&mut self, _ctx: &mut ServiceContext) {}

    fn on_message(&mut self, ctx: &mut ServiceContext, envelope: Envelope) {
        if envelope.kind != EnvelopeType::ServiceMsg {
            return;
        }
        self.lines_seen += 1;
        let line = String::from_utf8_lossy(envelope.payload.as_slice()).into_owned();
        info!(ctx.log, "chat line"; "from" => envelope.sender, "seq" => self.lines_seen, "line" => line);
    }

    fn destroy(&mut self, _ctx: &mut ServiceContext) {}
}

fn main() {
    let matches = App::new("chatrelay")
        .version("1.0")
        .author("SleepingPills Industries")
        .about("Line-delimited chat relay built on the ember runtime")
        .arg(Arg::with_name("host").long("host").takes_value(true).default_value("127.0.0.1"))
        .arg(Arg::with_name("port").long("port").takes_value(true).default_value("7001"))
        .get_matches();

    let host = matches.value_of("host").unwrap().to_string();
    let port: u16 = matches.value_of("port").unwrap().parse().expect("invalid --port");

    let log = LogConfig::default().build();
    info!(log, "starting chat relay"; "host" => &host, "port" => port);

    let mut config = RuntimeConfig::default();
    config.worker_num = 1;
    config.services.push(ServiceSpec {
        name: "ingest".to_string(),
        source: "native:chat_ingest".to_string(),
        enable_update: false,
        params: serde_json::Value::Null,
    });
    config.services.push(ServiceSpec {
        name: "logger".to_string(),
        source: "native:chat_logger".to_string(),
        enable_update: false,
        params: serde_json::Value::Null,
    });

    // Services are installed synchronously, in config order, before any
    // worker thread starts (one worker here), so `logger`'s address is
    // known up front: worker 0, local id 1 (`ingest` takes local id 0).
    let logger_addr: u32 = Address::new(config.machine_id, 0, 1).into();

    let factory: ServiceFactory = Arc::new(move |spec: &ServiceSpec| -> Option<Box<dyn Service>> {
        match spec.source.as_str() {
            "native:chat_ingest" => Some(Box::new(IngestService::new(host.clone(), port, logger_addr))),
            "native:chat_logger" => Some(Box::new(LoggerService::new())),
            _ => None,
        }
    });

    let _runtime = Runtime::spawn_with_logger(&config, factory, log).expect("failed to start runtime");

    loop {
        thread::sleep(Duration::from_secs(3600));
    }
}
