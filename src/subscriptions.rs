//! Reference-counted stats pollers.
//!
//! One background task exists per `(host, vm)` with at least one subscriber.
//! Samples are published on the event bus; the poller stops when its last
//! subscriber leaves or the VM drops out of the running state.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::driver::{DomainState, VmSample};
use crate::events::{ClientId, Event, EventBus};
use crate::pool::ConnectionPool;

pub const POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SubKey {
    host_id: String,
    vm_name: String,
}

struct SubState {
    subscribers: HashSet<ClientId>,
    last_sample: Option<VmSample>,
}

struct Subscription {
    key: SubKey,
    state: Mutex<SubState>,
    cancel: CancellationToken,
}

pub struct SubscriptionManager {
    pool: Arc<ConnectionPool>,
    bus: Arc<EventBus>,
    // Outer lock guards the map only; per-entry state has its own lock.
    subscriptions: Mutex<HashMap<SubKey, Arc<Subscription>>>,
}

impl SubscriptionManager {
    pub fn new(pool: Arc<ConnectionPool>, bus: Arc<EventBus>) -> Arc<Self> {
        Arc::new(SubscriptionManager {
            pool,
            bus,
            subscriptions: Mutex::new(HashMap::new()),
        })
    }

    pub fn subscribe(self: &Arc<Self>, session: ClientId, host_id: &str, vm_name: &str) {
        let key = SubKey {
            host_id: host_id.to_string(),
            vm_name: vm_name.to_string(),
        };

        let mut subscriptions = self.subscriptions.lock().unwrap();
        match subscriptions.get(&key) {
            Some(subscription) => {
                subscription.state.lock().unwrap().subscribers.insert(session);
            }
            None => {
                let subscription = Arc::new(Subscription {
                    key: key.clone(),
                    state: Mutex::new(SubState {
                        subscribers: HashSet::from([session]),
                        last_sample: None,
                    }),
                    cancel: CancellationToken::new(),
                });
                subscriptions.insert(key.clone(), Arc::clone(&subscription));
                debug!(host_id, vm_name, "starting stats poller");
                tokio::spawn(poll_loop(Arc::clone(self), subscription));
            }
        }
    }

    pub fn unsubscribe(&self, session: ClientId, host_id: &str, vm_name: &str) {
        let key = SubKey {
            host_id: host_id.to_string(),
            vm_name: vm_name.to_string(),
        };

        let mut subscriptions = self.subscriptions.lock().unwrap();
        if let Some(subscription) = subscriptions.get(&key) {
            let empty = {
                let mut state = subscription.state.lock().unwrap();
                state.subscribers.remove(&session);
                state.subscribers.is_empty()
            };
            if empty {
                debug!(host_id, vm_name, "last subscriber left, stopping poller");
                subscription.cancel.cancel();
                subscriptions.remove(&key);
            }
        }
    }

    /// Releases every subscription this session holds. Called on disconnect.
    pub fn unsubscribe_all(&self, session: ClientId) {
        let mut subscriptions = self.subscriptions.lock().unwrap();
        subscriptions.retain(|_, subscription| {
            let empty = {
                let mut state = subscription.state.lock().unwrap();
                state.subscribers.remove(&session);
                state.subscribers.is_empty()
            };
            if empty {
                subscription.cancel.cancel();
            }
            !empty
        });
    }

    /// Latest sample an active poller produced, if one exists. Lets the
    /// one-shot stats endpoint piggyback instead of issuing a driver call.
    pub fn last_known(&self, host_id: &str, vm_name: &str) -> Option<VmSample> {
        let key = SubKey {
            host_id: host_id.to_string(),
            vm_name: vm_name.to_string(),
        };
        let subscriptions = self.subscriptions.lock().unwrap();
        let subscription = subscriptions.get(&key)?;
        let state = subscription.state.lock().unwrap();
        state.last_sample.clone()
    }

    pub fn active_pollers(&self) -> usize {
        self.subscriptions.lock().unwrap().len()
    }

    pub fn subscriber_count(&self, host_id: &str, vm_name: &str) -> usize {
        let key = SubKey {
            host_id: host_id.to_string(),
            vm_name: vm_name.to_string(),
        };
        let subscriptions = self.subscriptions.lock().unwrap();
        subscriptions
            .get(&key)
            .map(|subscription| subscription.state.lock().unwrap().subscribers.len())
            .unwrap_or(0)
    }

    /// Removes the entry iff it still maps to this poller's subscription.
    fn remove_if_current(&self, subscription: &Arc<Subscription>) {
        let mut subscriptions = self.subscriptions.lock().unwrap();
        if let Some(current) = subscriptions.get(&subscription.key)
            && Arc::ptr_eq(current, subscription)
        {
            subscriptions.remove(&subscription.key);
        }
    }

    /// One reading. Any failure (host gone, domain gone, RPC error) becomes
    /// a synthetic stopped sample so subscribers observe the VM going away.
    async fn sample(&self, key: &SubKey) -> VmSample {
        let result = async {
            let driver = self.pool.get(&key.host_id).await?;
            let domain = driver.lookup_domain(&key.vm_name).await?;
            Ok::<VmSample, crate::errors::Error>(driver.stats(&domain).await?)
        }
        .await;

        match result {
            Ok(sample) => sample,
            Err(error) => {
                debug!(host = %key.host_id, vm = %key.vm_name, %error, "stats poll failed");
                VmSample::idle(DomainState::Stopped, 0, 0)
            }
        }
    }
}

async fn poll_loop(manager: Arc<SubscriptionManager>, subscription: Arc<Subscription>) {
    let mut ticker = tokio::time::interval(POLL_INTERVAL);

    loop {
        tokio::select! {
            _ = subscription.cancel.cancelled() => break,
            _ = ticker.tick() => {
                let sample = manager.sample(&subscription.key).await;
                let running = sample.state.is_running();

                subscription.state.lock().unwrap().last_sample = Some(sample.clone());
                manager.bus.publish(&Event::VmStatsUpdated {
                    host_id: subscription.key.host_id.clone(),
                    vm_name: subscription.key.vm_name.clone(),
                    stats: sample,
                });

                if !running {
                    // Subscribers saw the non-running state; they re-subscribe
                    // if and when the VM comes back.
                    manager.remove_if_current(&subscription);
                    break;
                }
            }
        }
    }

    debug!(host = %subscription.key.host_id, vm = %subscription.key.vm_name, "stats poller stopped");
}
