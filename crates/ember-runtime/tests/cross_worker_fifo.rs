//! End-to-end scenario S6 (spec §8): two services on two different workers,
//! where the sender issues `send(B, m1)` then `send(B, m2)` back to back. `B`
//! must observe `m1` before `m2`, even though delivery crosses the
//! inbox-to-command-channel boundary described in spec §4.G.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use ember_core::addr::Address;
use ember_core::buffer::Buffer;
use ember_core::envelope::{Envelope, EnvelopeType};
use ember_runtime::config::{RuntimeConfig, ServiceSpec};
use ember_runtime::service::{Service, ServiceContext};
use ember_runtime::worker::ServiceFactory;
use ember_runtime::Runtime;

/// Worker 0: on receiving the kickoff `ServiceMsg`, fires two ordered sends
/// to `peer` in immediate succession.
struct SenderService {
    peer: u32,
}

impl Service for SenderService {
    fn init(&mut self, _ctx: &mut ServiceContext, _params: &serde_json::Value) -> bool {
        true
    }
    fn start(&mut self, _ctx: &mut ServiceContext) {}
    fn on_message(&mut self, ctx: &mut ServiceContext, envelope: Envelope) {
        if envelope.kind != EnvelopeType::ServiceMsg {
            return;
        }
        let self_addr = ctx.self_addr();
        let m1 = Envelope::new(EnvelopeType::ServiceMsg, self_addr, self.peer, 1, Buffer::new(0));
        let m2 = Envelope::new(EnvelopeType::ServiceMsg, self_addr, self.peer, 2, Buffer::new(0));
        ctx.send(self.peer, m1);
        ctx.send(self.peer, m2);
    }
    fn destroy(&mut self, _ctx: &mut ServiceContext) {}
}

/// Worker 1: records every session id it observes, in arrival order.
struct ReceiverService {
    observed: Arc<Mutex<Vec<i64>>>,
}

impl Service for ReceiverService {
    fn init(&mut self, _ctx: &mut ServiceContext, _params: &serde_json::Value) -> bool {
        true
    }
    fn start(&mut self, _ctx: &mut ServiceContext) {}
    fn on_message(&mut self, _ctx: &mut ServiceContext, envelope: Envelope) {
        if envelope.kind == EnvelopeType::ServiceMsg {
            self.observed.lock().unwrap().push(envelope.session);
        }
    }
    fn destroy(&mut self, _ctx: &mut ServiceContext) {}
}

#[test]
fn s6_cross_worker_sends_preserve_enqueue_order() {
    let observed = Arc::new(Mutex::new(Vec::new()));
    let observed_for_factory = observed.clone();
    let installed_sender = Arc::new(AtomicBool::new(false));

    let mut config = RuntimeConfig::default();
    config.worker_num = 2;
    // Installed round-robin: index 0 -> worker 0 ("sender"), index 1 -> worker 1 ("receiver").
    config.services.push(ServiceSpec {
        name: "sender".to_string(),
        source: "native:sender".to_string(),
        enable_update: false,
        params: serde_json::Value::Null,
    });
    config.services.push(ServiceSpec {
        name: "receiver".to_string(),
        source: "native:receiver".to_string(),
        enable_update: false,
        params: serde_json::Value::Null,
    });

    // The receiver is worker 1, local id 0: the first (and only) service
    // installed on that worker.
    let receiver_addr: u32 = Address::new(config.machine_id, 1, 0).into();
    let sender_addr: u32 = Address::new(config.machine_id, 0, 0).into();

    let factory: ServiceFactory = Arc::new(move |spec: &ServiceSpec| -> Option<Box<dyn Service>> {
        match spec.source.as_str() {
            "native:sender" => {
                installed_sender.store(true, Ordering::SeqCst);
                Some(Box::new(SenderService { peer: receiver_addr }))
            }
            "native:receiver" => Some(Box::new(ReceiverService {
                observed: observed_for_factory.clone(),
            })),
            _ => None,
        }
    });

    let runtime = Runtime::spawn_quiet(&config, factory).unwrap();

    // Kick the sender off from outside the runtime, same path a CLI or an
    // accepted connection's first envelope would take.
    runtime.deliver(sender_addr, Envelope::new(EnvelopeType::ServiceMsg, 0, sender_addr, 0, Buffer::new(0)));

    thread::sleep(Duration::from_millis(200));
    runtime.shutdown();

    let seen = observed.lock().unwrap().clone();
    assert_eq!(seen, vec![1, 2], "B must observe m1 before m2 despite crossing workers");
}
