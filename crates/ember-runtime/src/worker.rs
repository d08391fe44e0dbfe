//! The worker event loop (spec §4.F): one OS thread per worker, running a
//! cooperative loop over its reactor, its timer wheel, and the runnable list
//! of services it owns exclusively. Grounded in
//! `neutronium::world::World::run`/`run_once` for the overall shape of a
//! fixed-cadence loop with structured `slog` tracing around each phase,
//! generalized from "one game frame" to "one reactor+timer+inbox pass".

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use ember_core::addr::Address;
use ember_core::buffer::Buffer;
use ember_core::envelope::{Envelope, EnvelopeType};
use ember_core::logging::{debug, o, trace, warn, Logger};
use ember_net::server::SocketServer;
use ember_timer::wheel::{FiredTimer, TimerWheel};
use indexmap::IndexMap;

use crate::config::ServiceSpec;
use crate::service::{timer_envelope, Outbound, Service, ServiceContext};

/// How many inbox envelopes a runnable service is drained of per visit (spec
/// §4.F: "`K` caps per-service latency starvation; a common value is 64").
pub const DEFAULT_DRAIN_CAP: usize = 64;

/// Cross-thread instruction delivered to one worker's command channel. Every
/// cross-worker effect a service triggers (a send to an address on another
/// worker, a `new_service`/`remove_service` targeting another worker,
/// shutdown) takes this path rather than touching another worker's state
/// directly.
pub enum WorkerCommand {
    Deliver(Envelope),
    CreateService {
        spec: ServiceSpec,
        reply_to: u32,
        session: i64,
    },
    RemoveService(u32),
    Shutdown,
}

/// Shared, read-mostly handle every worker holds to reach its siblings:
/// their command channels plus the round-robin counter used to place newly
/// created services (spec §4.G "Allocates service addresses (round-robin
/// worker assignment)").
pub struct RuntimeHandle {
    machine_id: u8,
    worker_senders: Vec<Sender<WorkerCommand>>,
    next_worker: AtomicUsize,
    /// Cluster-facing address bookkeeping table: read-mostly,
    /// guarded by an RwLock. Not consulted for routing (the worker id is
    /// already embedded in the address) but kept so a future cluster-facing
    /// lookup (e.g. liveness, migration) has a single source of truth.
    address_table: RwLock<std::collections::HashMap<u32, u8>>,
}

impl RuntimeHandle {
    pub fn new(machine_id: u8, worker_senders: Vec<Sender<WorkerCommand>>) -> RuntimeHandle {
        RuntimeHandle {
            machine_id,
            worker_senders,
            next_worker: AtomicUsize::new(0),
            address_table: RwLock::new(std::collections::HashMap::new()),
        }
    }

    #[cfg(test)]
    pub(crate) fn for_test(machine_id: u8) -> RuntimeHandle {
        RuntimeHandle::new(machine_id, Vec::new())
    }

    pub fn machine_id(&self) -> u8 {
        self.machine_id
    }

    pub fn worker_count(&self) -> u8 {
        self.worker_senders.len() as u8
    }

    /// Round-robin target worker for the next `new_service` call.
    pub fn next_worker_id(&self) -> u8 {
        let n = self.worker_senders.len().max(1);
        (self.next_worker.fetch_add(1, Ordering::Relaxed) % n) as u8
    }

    pub fn record_address(&self, addr: u32, worker_id: u8) {
        if let Ok(mut table) = self.address_table.write() {
            table.insert(addr, worker_id);
        }
    }

    pub fn forget_address(&self, addr: u32) {
        if let Ok(mut table) = self.address_table.write() {
            table.remove(&addr);
        }
    }

    /// Delivers `envelope` to `to`, routing by the worker id embedded in the
    /// address (spec §4.G "Forwards cross-worker sends"). Silently dropped
    /// if the target worker's channel is gone (worker already shut down).
    pub fn deliver(&self, to: u32, envelope: Envelope) {
        let worker_id = Address::from(to).worker_id();
        if let Some(sender) = self.worker_senders.get(worker_id as usize) {
            let _ = sender.send(WorkerCommand::Deliver(envelope));
        }
    }

    pub fn send_command(&self, worker_id: u8, command: WorkerCommand) {
        if let Some(sender) = self.worker_senders.get(worker_id as usize) {
            let _ = sender.send(command);
        }
    }

    pub fn shutdown_all(&self) {
        for sender in &self.worker_senders {
            let _ = sender.send(WorkerCommand::Shutdown);
        }
    }
}

struct ServiceSlot {
    service: Box<dyn Service>,
    inbox: VecDeque<Envelope>,
    in_runnable: bool,
}

pub struct Worker {
    worker_id: u8,
    runtime: Arc<RuntimeHandle>,
    cmd_rx: Receiver<WorkerCommand>,
    sockets: SocketServer,
    timers: TimerWheel,
    services: IndexMap<u32, ServiceSlot>,
    runnable: VecDeque<u32>,
    next_local_id: u16,
    wrapped_local_id: bool,
    drain_cap: usize,
    factory: ServiceFactory,
    log: Logger,
    shutting_down: bool,
}

/// Resolves a `ServiceSpec::source` tag to a concrete, boxed `Service`.
/// Script-hosted sources are out of scope (spec §1 "Out of scope: script
/// bindings"); the runtime only dispatches native tags, and an unrecognized
/// tag is `None` (surfaced to the creator as `service_init_failed`).
pub type ServiceFactory = Arc<dyn Fn(&ServiceSpec) -> Option<Box<dyn Service>> + Send + Sync>;

impl Worker {
    pub fn new(worker_id: u8, runtime: Arc<RuntimeHandle>, cmd_rx: Receiver<WorkerCommand>, factory: ServiceFactory, log: Logger) -> std::io::Result<Worker> {
        Ok(Worker {
            worker_id,
            runtime,
            cmd_rx,
            sockets: SocketServer::new(worker_id)?,
            timers: TimerWheel::new(),
            services: IndexMap::new(),
            runnable: VecDeque::new(),
            next_local_id: 0,
            wrapped_local_id: false,
            drain_cap: DEFAULT_DRAIN_CAP,
            factory,
            log: log.new(o!("worker_id" => worker_id)),
            shutting_down: false,
        })
    }

    fn alloc_local_id(&mut self) -> Option<u16> {
        if !self.wrapped_local_id {
            let id = self.next_local_id;
            let (next, overflowed) = self.next_local_id.overflowing_add(1);
            self.next_local_id = next;
            if overflowed {
                self.wrapped_local_id = true;
            }
            return Some(id);
        }

        let start = self.next_local_id;
        let mut probe = start;
        loop {
            let addr = Address::new(self.runtime.machine_id(), self.worker_id, probe);
            if !self.services.contains_key(&u32::from(addr)) {
                self.next_local_id = probe.wrapping_add(1);
                return Some(probe);
            }
            probe = probe.wrapping_add(1);
            if probe == start {
                return None;
            }
        }
    }

    /// Instantiates `spec` on this worker via `factory`, running `init` and
    /// (if it returns `true`) `start`. Replies to `reply_to` by `session`
    /// either way, per the session convention used throughout the network
    /// layer (spec §4.E "Response message convention", §7 `service_init_failed`).
    fn create_service(&mut self, spec: ServiceSpec, reply_to: u32, session: i64) {
        let mut service = match (self.factory)(&spec) {
            Some(service) => service,
            None => {
                warn!(self.log, "unknown service source"; "source" => %spec.source);
                self.reply_create_failed(reply_to, session);
                return;
            }
        };

        let local_id = match self.alloc_local_id() {
            Some(id) => id,
            None => {
                warn!(self.log, "worker out of local service ids"; "worker_id" => self.worker_id);
                self.reply_create_failed(reply_to, session);
                return;
            }
        };
        let addr = u32::from(Address::new(self.runtime.machine_id(), self.worker_id, local_id));

        let params = spec.params.clone();

        let mut outbound = Vec::new();
        let mut exiting = false;
        let siblings: Vec<u32> = self.services.keys().copied().collect();
        let ok = {
            let mut ctx = ServiceContext {
                self_addr: addr,
                worker_id: self.worker_id,
                siblings: &siblings,
                sockets: &mut self.sockets,
                timers: &mut self.timers,
                runtime: &self.runtime,
                outbound: &mut outbound,
                exiting: &mut exiting,
                log: &self.log,
            };
            service.init(&mut ctx, &params)
        };

        if !ok {
            debug!(self.log, "service init returned false"; "addr" => format!("{:#010x}", addr));
            self.reply_create_failed(reply_to, session);
            return;
        }

        {
            let mut ctx = ServiceContext {
                self_addr: addr,
                worker_id: self.worker_id,
                siblings: &siblings,
                sockets: &mut self.sockets,
                timers: &mut self.timers,
                runtime: &self.runtime,
                outbound: &mut outbound,
                exiting: &mut exiting,
                log: &self.log,
            };
            service.start(&mut ctx);
        }

        self.runtime.record_address(addr, self.worker_id);
        self.services.insert(
            addr,
            ServiceSlot {
                service,
                inbox: VecDeque::new(),
                in_runnable: false,
            },
        );
        self.apply_outbound(outbound);

        let mut payload = Buffer::new(4);
        payload.write_back(&addr.to_be_bytes());
        let reply = Envelope::new(EnvelopeType::System, addr, reply_to, -session, payload);
        self.deliver_reply(reply_to, reply);
    }

    fn reply_create_failed(&mut self, reply_to: u32, session: i64) {
        let reply = Envelope::new(EnvelopeType::Error, 0, reply_to, -session, Buffer::new(0));
        self.deliver_reply(reply_to, reply);
    }

    fn deliver_reply(&mut self, to: u32, envelope: Envelope) {
        if Address::from(to).worker_id() == self.worker_id {
            self.route_local(to, envelope);
        } else {
            self.runtime.deliver(to, envelope);
        }
    }

    /// Calls `destroy()` on the owning worker, then drops the service and
    /// its remaining (discarded) inbox (spec §3 "exiting... destroyed").
    fn remove_service(&mut self, addr: u32) {
        let slot = match self.services.shift_remove(&addr) {
            Some(slot) => slot,
            None => return,
        };
        let mut service = slot.service;
        let mut outbound = Vec::new();
        let mut exiting = false;
        let siblings: Vec<u32> = self.services.keys().copied().collect();
        {
            let mut ctx = ServiceContext {
                self_addr: addr,
                worker_id: self.worker_id,
                siblings: &siblings,
                sockets: &mut self.sockets,
                timers: &mut self.timers,
                runtime: &self.runtime,
                outbound: &mut outbound,
                exiting: &mut exiting,
                log: &self.log,
            };
            service.destroy(&mut ctx);
        }
        self.runtime.forget_address(addr);
        self.apply_outbound(outbound);
    }

    /// Pushes an envelope onto an owned service's inbox, marking it runnable
    /// if it wasn't already (spec §3 "Inbox").
    fn route_local(&mut self, receiver: u32, envelope: Envelope) {
        if let Some(slot) = self.services.get_mut(&receiver) {
            slot.inbox.push_back(envelope);
            if !slot.in_runnable {
                slot.in_runnable = true;
                self.runnable.push_back(receiver);
            }
        }
    }

    fn route_network(&mut self, envelope: Envelope) {
        self.route_local(envelope.receiver, envelope);
    }

    fn route_timer(&mut self, fired: FiredTimer) {
        let envelope = timer_envelope(&fired);
        self.route_local(fired.owner, envelope);
    }

    fn apply_outbound(&mut self, outbound: Vec<Outbound>) {
        for item in outbound {
            match item {
                Outbound::Local { receiver, envelope } => self.route_local(receiver, envelope),
                Outbound::CreateService { spec, reply_to, session } => {
                    let target = self.runtime.next_worker_id();
                    if target == self.worker_id {
                        self.create_service(spec, reply_to, session);
                    } else {
                        self.runtime.send_command(target, WorkerCommand::CreateService { spec, reply_to, session });
                    }
                }
                Outbound::RemoveService { addr } => {
                    if Address::from(addr).worker_id() == self.worker_id {
                        self.remove_service(addr);
                    } else {
                        self.runtime.send_command(Address::from(addr).worker_id(), WorkerCommand::RemoveService(addr));
                    }
                }
            }
        }
    }

    /// Drains up to one runnable service's inbox by `drain_cap` envelopes,
    /// re-queuing it if work remains (spec §4.F step 3).
    fn drain_one_runnable(&mut self) {
        let addr = match self.runnable.pop_front() {
            Some(addr) => addr,
            None => return,
        };

        let mut processed = 0;
        let mut should_remove = false;

        while processed < self.drain_cap {
            let envelope = match self.services.get_mut(&addr).and_then(|slot| slot.inbox.pop_front()) {
                Some(envelope) => envelope,
                None => break,
            };
            processed += 1;

            if envelope.kind == EnvelopeType::Quit {
                should_remove = true;
                break;
            }

            let mut outbound = Vec::new();
            let mut exiting = false;
            let siblings: Vec<u32> = self.services.keys().copied().collect();
            {
                let service = match self.services.get_mut(&addr) {
                    Some(slot) => &mut slot.service,
                    None => break,
                };
                let mut ctx = ServiceContext {
                    self_addr: addr,
                    worker_id: self.worker_id,
                    siblings: &siblings,
                    sockets: &mut self.sockets,
                    timers: &mut self.timers,
                    runtime: &self.runtime,
                    outbound: &mut outbound,
                    exiting: &mut exiting,
                    log: &self.log,
                };
                service.on_message(&mut ctx, envelope);
            }
            self.apply_outbound(outbound);
            if exiting {
                should_remove = true;
                break;
            }
        }

        if should_remove {
            self.remove_service(addr);
            return;
        }

        let still_pending = self.services.get(&addr).map(|slot| !slot.inbox.is_empty()).unwrap_or(false);
        if let Some(slot) = self.services.get_mut(&addr) {
            if still_pending {
                self.runnable.push_back(addr);
            } else {
                slot.in_runnable = false;
            }
        }
    }

    /// Runs the event loop until a `Shutdown` command arrives. One iteration
    /// is: reactor pump, timer advance, drain control commands, drain one
    /// runnable service (spec §4.F).
    pub fn run(&mut self) {
        let mut prev_tick = Instant::now();
        trace!(self.log, "worker starting");

        while !self.shutting_down {
            let now = Instant::now();

            match self.sockets.pump(now, Duration::from_millis(10)) {
                Ok(envelopes) => {
                    for envelope in envelopes {
                        self.route_network(envelope);
                    }
                }
                Err(err) => warn!(self.log, "reactor pump failed"; "error" => %err),
            }

            let elapsed_ms = now.saturating_duration_since(prev_tick).as_millis() as u64;
            prev_tick = now;
            let fired = self.timers.advance(elapsed_ms);
            for entry in fired {
                self.route_timer(entry);
            }

            while let Ok(command) = self.cmd_rx.try_recv() {
                match command {
                    WorkerCommand::Deliver(envelope) => self.route_network(envelope),
                    WorkerCommand::CreateService { spec, reply_to, session } => {
                        self.create_service(spec, reply_to, session);
                    }
                    WorkerCommand::RemoveService(addr) => self.remove_service(addr),
                    WorkerCommand::Shutdown => {
                        self.shutting_down = true;
                    }
                }
            }

            if self.shutting_down {
                break;
            }

            if !self.runnable.is_empty() {
                self.drain_one_runnable();
            }
        }

        // Every pending accept/connect/read gets exactly one terminating
        // envelope before the services that might be waiting on it are torn
        // down (spec §9's open question on graceful shutdown, resolved
        // uniformly rather than silently dropping in-flight operations).
        // Those envelopes are drained through `on_message` here, rather than
        // just enqueued and discarded, so the waiting caller actually
        // observes them.
        for envelope in self.sockets.shutdown() {
            self.route_network(envelope);
        }
        while !self.runnable.is_empty() {
            self.drain_one_runnable();
        }

        let addrs: Vec<u32> = self.services.keys().copied().collect();
        for addr in addrs {
            self.remove_service(addr);
        }
        debug!(self.log, "worker stopped");
    }

    /// Creates and installs a service on this worker directly, bypassing
    /// the command channel. Used by `Runtime::spawn` to seed the services
    /// named in `RuntimeConfig` before any worker thread starts running.
    pub fn install(&mut self, spec: ServiceSpec) -> Option<u32> {
        let before = self.services.len();
        self.create_service(spec, 0, 0);
        if self.services.len() > before {
            self.services.keys().last().copied()
        } else {
            None
        }
    }
}
