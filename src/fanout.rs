//! Event fan-out: a registry of typed listeners.
//!
//! The dispatcher and the channel reader call [`EventFanout::emit`]; every
//! listener registered for that event type is invoked synchronously, in
//! registration order, on the emitting worker's thread. The registry lock is
//! released before listeners run, so a listener may register or remove other
//! listeners. Slow listeners slow down the emitting worker; that is the
//! caller's responsibility. A listener that panics is logged and skipped, and
//! delivery continues with the next one.
//!
//! ```rust
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//! use rs_trainz_bridge::fanout::EventFanout;
//! use rs_trainz_bridge::events::{BridgeEvent, PowerEvent};
//!
//! let fanout = EventFanout::new();
//! let seen = Arc::new(AtomicUsize::new(0));
//! let counter = Arc::clone(&seen);
//! fanout.add_power_listener(move |e: &PowerEvent| {
//!     assert!(e.on);
//!     counter.fetch_add(1, Ordering::SeqCst);
//! });
//!
//! fanout.emit(BridgeEvent::Power(PowerEvent { on: true }));
//! assert_eq!(seen.load(Ordering::SeqCst), 1);
//! ```

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::events::{
    AccessoryEvent, BridgeEvent, LocomotiveDirectionEvent, LocomotiveFunctionEvent,
    LocomotiveSpeedEvent, PowerEvent, SensorEvent,
};

/// Callback invoked for one event type.
///
/// Implemented for every `Fn(&E) + Send + Sync` closure.
pub trait EventListener<E>: Send + Sync {
    /// Handle one event.
    fn on_event(&self, event: &E);
}

impl<E, F> EventListener<E> for F
where
    F: Fn(&E) + Send + Sync,
{
    fn on_event(&self, event: &E) {
        self(event)
    }
}

/// Handle returned on registration, used to remove the listener again.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Registry<E> {
    listeners: RwLock<Vec<(ListenerId, Arc<dyn EventListener<E>>)>>,
}

impl<E> Registry<E> {
    fn new() -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
        }
    }

    fn add(&self, id: ListenerId, listener: Arc<dyn EventListener<E>>) {
        self.listeners.write().push((id, listener));
    }

    fn remove(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    fn deliver(&self, event: &E) {
        let snapshot: Vec<(ListenerId, Arc<dyn EventListener<E>>)> = self
            .listeners
            .read()
            .iter()
            .map(|(id, l)| (*id, Arc::clone(l)))
            .collect();
        for (id, listener) in snapshot {
            // the emitting thread is a dispatcher or reader worker and must survive
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| listener.on_event(event)))
            {
                tracing::error!(
                    listener = id.0,
                    panic = panic_message(payload.as_ref()),
                    "event listener panicked"
                );
            }
        }
    }

    fn len(&self) -> usize {
        self.listeners.read().len()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

/// Typed listener registry shared by all workers of one connection.
pub struct EventFanout {
    next_id: AtomicU64,
    sensor: Registry<SensorEvent>,
    power: Registry<PowerEvent>,
    speed: Registry<LocomotiveSpeedEvent>,
    direction: Registry<LocomotiveDirectionEvent>,
    function: Registry<LocomotiveFunctionEvent>,
    accessory: Registry<AccessoryEvent>,
    any: Registry<BridgeEvent>,
}

impl Default for EventFanout {
    fn default() -> Self {
        Self::new()
    }
}

impl EventFanout {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            sensor: Registry::new(),
            power: Registry::new(),
            speed: Registry::new(),
            direction: Registry::new(),
            function: Registry::new(),
            accessory: Registry::new(),
            any: Registry::new(),
        }
    }

    fn next(&self) -> ListenerId {
        ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Register a sensor change listener.
    pub fn add_sensor_listener(&self, l: impl EventListener<SensorEvent> + 'static) -> ListenerId {
        let id = self.next();
        self.sensor.add(id, Arc::new(l));
        id
    }

    /// Register a power change listener.
    pub fn add_power_listener(&self, l: impl EventListener<PowerEvent> + 'static) -> ListenerId {
        let id = self.next();
        self.power.add(id, Arc::new(l));
        id
    }

    /// Register a locomotive speed listener.
    pub fn add_speed_listener(
        &self,
        l: impl EventListener<LocomotiveSpeedEvent> + 'static,
    ) -> ListenerId {
        let id = self.next();
        self.speed.add(id, Arc::new(l));
        id
    }

    /// Register a locomotive direction listener.
    pub fn add_direction_listener(
        &self,
        l: impl EventListener<LocomotiveDirectionEvent> + 'static,
    ) -> ListenerId {
        let id = self.next();
        self.direction.add(id, Arc::new(l));
        id
    }

    /// Register a locomotive function listener.
    pub fn add_function_listener(
        &self,
        l: impl EventListener<LocomotiveFunctionEvent> + 'static,
    ) -> ListenerId {
        let id = self.next();
        self.function.add(id, Arc::new(l));
        id
    }

    /// Register an accessory listener.
    pub fn add_accessory_listener(
        &self,
        l: impl EventListener<AccessoryEvent> + 'static,
    ) -> ListenerId {
        let id = self.next();
        self.accessory.add(id, Arc::new(l));
        id
    }

    /// Register a listener that receives every event (used by the MQTT bridge).
    pub fn add_listener(&self, l: impl EventListener<BridgeEvent> + 'static) -> ListenerId {
        let id = self.next();
        self.any.add(id, Arc::new(l));
        id
    }

    /// Remove a listener of any type. Returns false if the id was unknown.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.sensor.remove(id)
            || self.power.remove(id)
            || self.speed.remove(id)
            || self.direction.remove(id)
            || self.function.remove(id)
            || self.accessory.remove(id)
            || self.any.remove(id)
    }

    /// Total number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.sensor.len()
            + self.power.len()
            + self.speed.len()
            + self.direction.len()
            + self.function.len()
            + self.accessory.len()
            + self.any.len()
    }

    /// Deliver one event to the typed listeners, then to catch-all listeners.
    pub fn emit(&self, event: BridgeEvent) {
        tracing::trace!(event = event.name(), "emit");
        match &event {
            BridgeEvent::Sensor(e) => self.sensor.deliver(e),
            BridgeEvent::Power(e) => self.power.deliver(e),
            BridgeEvent::Speed(e) => self.speed.deliver(e),
            BridgeEvent::Direction(e) => self.direction.deliver(e),
            BridgeEvent::Function(e) => self.function.deliver(e),
            BridgeEvent::Accessory(e) => self.accessory.deliver(e),
        }
        self.any.deliver(&event);
    }

    /// Deliver several events in order.
    pub fn emit_all(&self, events: impl IntoIterator<Item = BridgeEvent>) {
        for event in events {
            self.emit(event);
        }
    }
}
