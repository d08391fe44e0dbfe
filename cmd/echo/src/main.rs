//! Length-prefixed TCP echo service (spec §8 scenario S1), demonstrating the
//! runtime end-to-end: one native service owns a listener, accepts
//! connections and echoes every received frame back to its sender.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::{App, Arg};
use ember_core::envelope::{Envelope, EnvelopeType};
use ember_core::logging::{error, info, LogConfig};
use ember_net::server::subtype;
use ember_net::wire::WireMode;
use ember_runtime::config::{RuntimeConfig, ServiceSpec};
use ember_runtime::service::{Service, ServiceContext};
use ember_runtime::worker::ServiceFactory;
use ember_runtime::Runtime;

struct EchoService {
    host: String,
    port: u16,
    listen_fd: Option<u32>,
    next_session: i64,
}

impl EchoService {
    fn new(host: String, port: u16) -> EchoService {
        EchoService {
            host,
            port,
            listen_fd: None,
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

        // `accept` can complete synchronously if a connection is already
        // waiting; in that case feed the result back to ourselves so it
        // goes through the same `on_message` path as the async case.
        if let Ok(Some(envelope)) = ctx.accept(fd, session) {
            let self_addr = ctx.self_addr();
            ctx.send(self_addr, envelope);
        }
    }
}

impl Service for EchoService {
    fn init(&mut self, ctx: &mut ServiceContext, _params: &serde_json::Value) -> bool {
        match ctx.listen(&self.host, self.port, WireMode::LengthPrefixed, None) {
            Ok(fd) => {
                self.listen_fd = Some(fd);
                true
            }
            Err(err) => {
                error!(ctx.log, "failed to bind listener"; "host" => &self.host, "port" => self.port, "error" => %err);
                false
            }
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
            subtype::SOCKET_ACCEPT => self.accept_next(ctx),
            subtype::SOCKET_RECV => {
                ctx.write(envelope.sender, envelope.payload.as_slice());
            }
            _ => {}
        }
    }

    fn destroy(&mut self, _ctx: &mut ServiceContext) {}
}

fn main() {
    let matches = App::new("echo")
        .version("1.0")
        .author("SleepingPills Industries")
        .about("Length-prefixed TCP echo service built on the ember runtime")
        .arg(Arg::with_name("host").long("host").takes_value(true).default_value("127.0.0.1"))
        .arg(Arg::with_name("port").long("port").takes_value(true).default_value("7000"))
        .get_matches();

    let host = matches.value_of("host").unwrap().to_string();
    let port: u16 = matches.value_of("port").unwrap().parse().expect("invalid --port");

    let log = LogConfig::default().build();
    info!(log, "starting echo service"; "host" => &host, "port" => port);

    let mut config = RuntimeConfig::default();
    config.services.push(ServiceSpec {
        name: "echo".to_string(),
        source: "native:echo".to_string(),
        enable_update: false,
        params: serde_json::Value::Null,
    });

    let factory: ServiceFactory = Arc::new(move |spec: &ServiceSpec| -> Option<Box<dyn Service>> {
        if spec.source == "native:echo" {
            Some(Box::new(EchoService::new(host.clone(), port)))
        } else {
            None
        }
    });

    let _runtime = Runtime::spawn_with_logger(&config, factory, log).expect("failed to start runtime");

    loop {
        thread::sleep(Duration::from_secs(3600));
    }
}
