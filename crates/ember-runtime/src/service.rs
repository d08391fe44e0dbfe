//! The `Service` trait and the per-call `ServiceContext` handed to it (spec
//! §4.C). Deep inheritance hierarchies in the original source flatten to this
//! one trait (spec §9): concrete service kinds are just types that implement
//! it, chosen at creation via `ServiceSpec::source`.

use ember_core::envelope::{Envelope, EnvelopeType};
use ember_core::logging::Logger;
use ember_net::framer::delimited::ReadRequest;
use ember_net::framer::websocket::Role as WsRole;
use ember_net::server::SocketServer;
use ember_net::wire::WireMode;
use ember_timer::wheel::{FiredTimer, Repeat, TimerId, TimerWheel};

use crate::config::ServiceSpec;
use crate::worker::RuntimeHandle;

/// A pending cross-service send queued by a handler call, delivered by the
/// worker once the handler returns (so a handler can never observe its own
/// sends reentrantly mid-call).
pub(crate) enum Outbound {
    Local { receiver: u32, envelope: Envelope },
    CreateService { spec: ServiceSpec, reply_to: u32, session: i64 },
    RemoveService { addr: u32 },
}

/// Borrowed, call-scoped context a service's handler uses to talk back to its
/// owning worker. One of these is built fresh for every `init`/`start`/
/// `on_message`/`destroy` invocation; nothing in it outlives that call.
pub struct ServiceContext<'a> {
    pub(crate) self_addr: u32,
    pub(crate) worker_id: u8,
    pub(crate) siblings: &'a [u32],
    pub(crate) sockets: &'a mut SocketServer,
    pub(crate) timers: &'a mut TimerWheel,
    pub(crate) runtime: &'a RuntimeHandle,
    pub(crate) outbound: &'a mut Vec<Outbound>,
    pub(crate) exiting: &'a mut bool,
    pub log: &'a Logger,
}

impl<'a> ServiceContext<'a> {
    #[inline]
    pub fn self_addr(&self) -> u32 {
        self.self_addr
    }

    // -- contract operations (spec §4.C "service -> runtime") --------------

    /// Asynchronous send; ordering is preserved between any one
    /// (sender, receiver) pair regardless of whether `to` lives on this
    /// worker or another one (spec §5).
    pub fn send(&mut self, to: u32, envelope: Envelope) {
        if ember_core::addr::Address::from(to).worker_id() == self.worker_id {
            self.outbound.push(Outbound::Local { receiver: to, envelope });
        } else {
            self.runtime.deliver(to, envelope);
        }
    }

    /// Same as `send`, but negates `session` first so the receiver sees it
    /// as a response rather than a new request.
    pub fn response(&mut self, to: u32, session: i64, kind: EnvelopeType, payload: ember_core::buffer::Buffer) {
        let envelope = Envelope::new(kind, self.self_addr, to, -session, payload);
        self.send(to, envelope);
    }

    /// Delivered to every other service on this worker; the caller is
    /// skipped (spec §4.C).
    pub fn broadcast(&mut self, envelope: Envelope) {
        for &addr in self.siblings {
            if addr != self.self_addr {
                self.outbound.push(Outbound::Local {
                    receiver: addr,
                    envelope: envelope.clone(),
                });
            }
        }
    }

    /// Requests creation of a new service. Completion (success or
    /// `service_init_failed`) arrives later as a `system` envelope to
    /// `self_addr`, with `session` negated, per the session convention used
    /// for accept/connect (spec §4.E, §7).
    pub fn new_service(&mut self, spec: ServiceSpec, session: i64) {
        self.outbound.push(Outbound::CreateService {
            spec,
            reply_to: self.self_addr,
            session,
        });
    }

    pub fn remove_service(&mut self, addr: u32) {
        self.outbound.push(Outbound::RemoveService { addr });
    }

    /// Marks this service for removal once the current handler call
    /// returns; equivalent to observing a `quit` envelope in its own inbox.
    pub fn exit(&mut self) {
        *self.exiting = true;
    }

    // -- socket operations, indirected through the worker's socket server --

    pub fn listen(&mut self, host: &str, port: u16, wire_mode: WireMode, ws_role: Option<WsRole>) -> std::io::Result<u32> {
        self.sockets.listen(host, port, self.self_addr, wire_mode, ws_role)
    }

    pub fn accept(&mut self, listen_fd: u32, session: i64) -> ember_core::error::NetResult<Option<Envelope>> {
        self.sockets.accept(listen_fd, session)
    }

    pub fn connect(&mut self, host: &str, port: u16, wire_mode: WireMode, session: i64) -> ember_core::error::NetResult<()> {
        self.sockets.connect(host, port, self.self_addr, wire_mode, session)
    }

    pub fn read(&mut self, fd: u32, req: ReadRequest, session: i64) -> ember_core::error::NetResult<Option<Vec<u8>>> {
        self.sockets.read(fd, req, session)
    }

    /// Per spec §7, a failed write still reports back to the connection's
    /// owner as an envelope (`socket_close` on queue overflow, `error` on an
    /// oversized non-chunked payload) rather than silently dropping the data;
    /// this just routes that envelope and collapses the result to `bool` for
    /// callers that only care whether the write was accepted.
    pub fn write(&mut self, fd: u32, payload: &[u8]) -> bool {
        match self.sockets.write(fd, payload) {
            ember_net::server::WriteOutcome::Enqueued => true,
            ember_net::server::WriteOutcome::Unknown => false,
            ember_net::server::WriteOutcome::QueueOverflow(envelope) | ember_net::server::WriteOutcome::TooBig(envelope) => {
                let receiver = envelope.receiver;
                self.outbound.push(Outbound::Local { receiver, envelope });
                false
            }
        }
    }

    pub fn close(&mut self, fd: u32) -> bool {
        self.sockets.close(fd)
    }

    pub fn settimeout(&mut self, fd: u32, seconds: u64) -> bool {
        self.sockets.settimeout(fd, seconds)
    }

    pub fn setnodelay(&mut self, fd: u32) -> bool {
        self.sockets.setnodelay(fd)
    }

    pub fn set_enable_chunked(&mut self, fd: u32, recv: bool, send: bool) -> bool {
        self.sockets.set_enable_chunked(fd, recv, send)
    }

    // -- timer operations, indirected through the worker's timer wheel ------

    pub fn timer_once(&mut self, delay_ms: u64) -> TimerId {
        self.timers.insert_once(self.self_addr, delay_ms)
    }

    pub fn timer_repeat(&mut self, period_ms: u64, repeat: Repeat) -> TimerId {
        self.timers.insert_repeat(self.self_addr, period_ms, repeat)
    }

    pub fn cancel_timer(&mut self, id: TimerId) -> bool {
        self.timers.cancel(id)
    }
}

/// Turns a fired timer entry into the `timer` envelope delivered to its
/// owner's inbox (spec §4.B "Tick").
pub(crate) fn timer_envelope(fired: &FiredTimer) -> Envelope {
    Envelope::new(EnvelopeType::Timer, 0, fired.owner, 0, ember_core::buffer::Buffer::new(0)).with_subtype(fired_subtype(fired))
}

fn fired_subtype(fired: &FiredTimer) -> u8 {
    (fired.id & 0xFF) as u8
}

/// User logic hosted by one address on exactly one worker at a time (spec
/// §4.C). Exactly four callbacks; the runtime never calls more than one of
/// them concurrently for the same service (spec §8 invariant 1).
pub trait Service: Send {
    /// Called once, before any message is delivered. Returning `false`
    /// aborts creation: the service is torn down without `start`/`destroy`
    /// and the creator is notified via the `new_service` session.
    fn init(&mut self, ctx: &mut ServiceContext, params: &serde_json::Value) -> bool;

    /// Called once, after `init` returns `true`.
    fn start(&mut self, ctx: &mut ServiceContext);

    /// Called with the inbox head. Must not block.
    fn on_message(&mut self, ctx: &mut ServiceContext, envelope: Envelope);

    /// Called once, after inbox draining, before removal.
    fn destroy(&mut self, ctx: &mut ServiceContext);
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_core::buffer::Buffer;
    use ember_net::server::SocketServer;
    use ember_timer::wheel::TimerWheel;

    struct Echo {
        received: Vec<u8>,
    }

    impl Service for Echo {
        fn init(&mut self, _ctx: &mut ServiceContext, _params: &serde_json::Value) -> bool {
            true
        }
        fn start(&mut self, _ctx: &mut ServiceContext) {}
        fn on_message(&mut self, ctx: &mut ServiceContext, envelope: Envelope) {
            self.received = envelope.payload.as_slice().to_vec();
            ctx.send(envelope.sender, envelope.reply(EnvelopeType::ServiceResponse, Buffer::new(0)));
        }
        fn destroy(&mut self, _ctx: &mut ServiceContext) {}
    }

    fn harness(f: impl FnOnce(&mut ServiceContext)) -> Vec<Outbound> {
        let mut sockets = SocketServer::new(0).unwrap();
        let mut timers = TimerWheel::new();
        let runtime = RuntimeHandle::for_test(0);
        let mut outbound = Vec::new();
        let mut exiting = false;
        let siblings = [1u32, 2u32];
        let log = ember_core::logging::LogConfig::discard();
        {
            let mut ctx = ServiceContext {
                self_addr: 1,
                worker_id: 0,
                siblings: &siblings,
                sockets: &mut sockets,
                timers: &mut timers,
                runtime: &runtime,
                outbound: &mut outbound,
                exiting: &mut exiting,
                log: &log,
            };
            f(&mut ctx);
        }
        outbound
    }

    #[test]
    fn send_to_own_worker_queues_a_local_outbound() {
        let out = harness(|ctx| {
            ctx.send(2, Envelope::new(EnvelopeType::ServiceMsg, 1, 2, 0, Buffer::new(0)));
        });
        assert_eq!(out.len(), 1);
        match &out[0] {
            Outbound::Local { receiver, .. } => assert_eq!(*receiver, 2),
            _ => panic!("expected a local outbound"),
        }
    }

    #[test]
    fn broadcast_skips_the_caller() {
        let out = harness(|ctx| {
            ctx.broadcast(Envelope::new(EnvelopeType::System, 1, 0, 0, Buffer::new(0)));
        });
        assert_eq!(out.len(), 1);
        match &out[0] {
            Outbound::Local { receiver, .. } => assert_eq!(*receiver, 2),
            _ => panic!("expected a local outbound"),
        }
    }

    #[test]
    fn exit_sets_the_exiting_flag() {
        let mut sockets = SocketServer::new(0).unwrap();
        let mut timers = TimerWheel::new();
        let runtime = RuntimeHandle::for_test(0);
        let mut outbound = Vec::new();
        let mut exiting = false;
        let siblings = [1u32];
        let log = ember_core::logging::LogConfig::discard();
        {
            let mut ctx = ServiceContext {
                self_addr: 1,
                worker_id: 0,
                siblings: &siblings,
                sockets: &mut sockets,
                timers: &mut timers,
                runtime: &runtime,
                outbound: &mut outbound,
                exiting: &mut exiting,
                log: &log,
            };
            ctx.exit();
        }
        assert!(exiting);
    }
}
