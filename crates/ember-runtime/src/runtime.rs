//! The runtime/router facade (spec §4.G): owns the worker pool, hands out
//! addresses round-robin, and forwards cross-worker sends. A small object on
//! purpose — everything it does is delegate to a `Worker` or a `RuntimeHandle`.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Sender};
use ember_core::logging::{info, LogConfig, Logger};

use crate::config::{RuntimeConfig, ServiceSpec};
use crate::worker::{RuntimeHandle, ServiceFactory, Worker, WorkerCommand};

/// Owns the worker pool for the lifetime of the process. Built once from a
/// `RuntimeConfig` and a `ServiceFactory` that knows how to instantiate every
/// `ServiceSpec::source` tag the config can name.
pub struct Runtime {
    handle: Arc<RuntimeHandle>,
    threads: Vec<JoinHandle<()>>,
    log: Logger,
}

impl Runtime {
    /// Spawns `config.worker_num` worker threads and installs every service
    /// in `config.services` onto its round-robin-assigned worker, all before
    /// any worker's event loop starts running (so the services named in the
    /// config are guaranteed to exist by the time `Runtime::spawn` returns).
    pub fn spawn(config: &RuntimeConfig, factory: ServiceFactory) -> std::io::Result<Runtime> {
        let log = config.log.build();
        Self::spawn_with_logger(config, factory, log)
    }

    pub fn spawn_with_logger(config: &RuntimeConfig, factory: ServiceFactory, log: Logger) -> std::io::Result<Runtime> {
        let worker_num = config.worker_num.max(1);

        let mut senders: Vec<Sender<WorkerCommand>> = Vec::with_capacity(worker_num as usize);
        let mut receivers = Vec::with_capacity(worker_num as usize);
        for _ in 0..worker_num {
            let (tx, rx) = unbounded();
            senders.push(tx);
            receivers.push(rx);
        }

        let handle = Arc::new(RuntimeHandle::new(config.machine_id, senders));

        let mut workers: Vec<Worker> = Vec::with_capacity(worker_num as usize);
        for (worker_id, rx) in receivers.into_iter().enumerate() {
            let worker = Worker::new(worker_id as u8, handle.clone(), rx, factory.clone(), log.clone())?;
            workers.push(worker);
        }

        for (i, spec) in config.services.iter().enumerate() {
            let worker_index = i % workers.len();
            workers[worker_index].install(spec.clone());
        }

        let mut threads = Vec::with_capacity(workers.len());
        for mut worker in workers {
            threads.push(thread::spawn(move || worker.run()));
        }

        info!(log, "runtime started"; "worker_num" => worker_num, "machine_id" => config.machine_id);

        Ok(Runtime { handle, threads, log })
    }

    /// Convenience constructor that discards log output; useful for tests
    /// and tools that don't care about runtime diagnostics.
    pub fn spawn_quiet(config: &RuntimeConfig, factory: ServiceFactory) -> std::io::Result<Runtime> {
        Self::spawn_with_logger(config, factory, LogConfig::discard())
    }

    pub fn machine_id(&self) -> u8 {
        self.handle.machine_id()
    }

    pub fn worker_count(&self) -> u8 {
        self.handle.worker_count()
    }

    /// Delivers an envelope into the runtime from outside any worker thread
    /// (e.g. from a CLI, a signal handler, or a test harness).
    pub fn deliver(&self, to: u32, envelope: ember_core::envelope::Envelope) {
        self.handle.deliver(to, envelope);
    }

    /// Requests creation of a top-level service, round-robin assigned like
    /// any other `new_service` call. `reply_to`/`session` let the caller
    /// correlate the completion envelope the way any other service would.
    pub fn create_service(&self, spec: ServiceSpec, reply_to: u32, session: i64) {
        let worker_id = self.handle.next_worker_id();
        self.handle.send_command(worker_id, WorkerCommand::CreateService { spec, reply_to, session });
    }

    pub fn remove_service(&self, addr: u32) {
        let worker_id = ember_core::addr::Address::from(addr).worker_id();
        self.handle.send_command(worker_id, WorkerCommand::RemoveService(addr));
    }

    /// Signals every worker to stop after its current iteration and blocks
    /// until all worker threads have exited (spec §4.G "Starts/stops the pool").
    pub fn shutdown(mut self) {
        self.handle.shutdown_all();
        for thread in self.threads.drain(..) {
            let _ = thread.join();
        }
        info!(self.log, "runtime stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{Service, ServiceContext};
    use ember_core::envelope::{Envelope, EnvelopeType};
    use std::sync::atomic::{AtomicUsize as StdAtomicUsize, Ordering as StdOrdering};
    use std::sync::Arc as StdArc;
    use std::time::Duration;

    struct CountingService {
        counter: StdArc<StdAtomicUsize>,
    }

    impl Service for CountingService {
        fn init(&mut self, _ctx: &mut ServiceContext, _params: &serde_json::Value) -> bool {
            true
        }
        fn start(&mut self, _ctx: &mut ServiceContext) {}
        fn on_message(&mut self, _ctx: &mut ServiceContext, _envelope: Envelope) {
            self.counter.fetch_add(1, StdOrdering::SeqCst);
        }
        fn destroy(&mut self, _ctx: &mut ServiceContext) {}
    }

    #[test]
    fn spawn_installs_configured_services_and_routes_messages_to_them() {
        let counter = StdArc::new(StdAtomicUsize::new(0));
        let counter_for_factory = counter.clone();

        let mut config = RuntimeConfig::default();
        config.worker_num = 1;
        config.services.push(ServiceSpec {
            name: "counter".to_string(),
            source: "native:counter".to_string(),
            enable_update: false,
            params: serde_json::Value::Null,
        });

        let factory: ServiceFactory = Arc::new(move |spec: &ServiceSpec| -> Option<Box<dyn Service>> {
            if spec.source == "native:counter" {
                Some(Box::new(CountingService {
                    counter: counter_for_factory.clone(),
                }))
            } else {
                None
            }
        });

        let runtime = Runtime::spawn_quiet(&config, factory).unwrap();
        let target = ember_core::addr::Address::new(runtime.machine_id(), 0, 0);
        runtime.deliver(u32::from(target), Envelope::new(EnvelopeType::ServiceMsg, 0, u32::from(target), 0, ember_core::buffer::Buffer::new(0)));

        thread::sleep(Duration::from_millis(100));
        runtime.shutdown();

        assert_eq!(counter.load(StdOrdering::SeqCst), 1);
    }
}
