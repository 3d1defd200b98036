//! Shared harness: a full `Lifecycle`/`Scheduler`/`AgentRegistry`/`EventBus`
//! stack over `broker-mocks::MockStore`, with scheduler timeouts short
//! enough to assert on ack-timeout/stale-progress reaping without sleeping
//! seconds in a test.

use broker_core::eventbus::EventBus;
use broker_core::lifecycle::Lifecycle;
use broker_core::poller::Notifier;
use broker_core::registry::AgentRegistry;
use broker_core::scheduler::{Scheduler, SchedulerConfig};
use broker_core::security::NoopScanner;
use broker_core::capability_inference::NoopCapabilityInferrer;
use broker_mocks::MockStore;
use std::sync::Arc;
use std::time::Duration;

pub struct Harness {
    pub lifecycle: Arc<Lifecycle<MockStore>>,
    pub registry: Arc<AgentRegistry<MockStore>>,
    pub scheduler: Scheduler<MockStore>,
}

/// A fresh stack with a `MockStore`, millisecond-scale scheduler timeouts.
pub fn harness() -> Harness {
    let store = Arc::new(MockStore::new());
    let events = Arc::new(EventBus::new(256));
    let notifier = Arc::new(Notifier::new());
    let lifecycle = Arc::new(Lifecycle::new(
        store.clone(),
        events,
        notifier,
        Arc::new(NoopScanner),
        Arc::new(NoopCapabilityInferrer),
    ));
    let registry = Arc::new(AgentRegistry::new(store));
    let config = SchedulerConfig {
        tick_interval: Duration::from_millis(10),
        ack_timeout: Duration::from_millis(20),
        heartbeat_timeout: Duration::from_millis(50),
        stale_wait_timeout: Duration::from_millis(50),
    };
    let scheduler = Scheduler::new(lifecycle.clone(), config);
    Harness { lifecycle, registry, scheduler }
}
