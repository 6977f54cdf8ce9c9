// Event bus: a bounded ring queue plus a filtered subscriber table.
//
// Producers (sensor shims, timers, protocol handlers) publish;
// consumers (automation hooks, session observers) subscribe with an
// optional kind filter and an optional source filter. Payloads are
// copied into the queue at publish time, so a producer's buffer may
// die the moment publish returns.
//
// The bus uses interior mutability so that a handler running inside
// process() can publish follow-up events. Those events are not
// delivered in the same process() call: the drain budget is fixed
// when the call begins.

use std::cell::{Cell, RefCell};


#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EventKind {
    Sensor,
    Actuator,
    Timer,
    System,
    Protocol,
    Custom(u16),
}

impl EventKind {
    // Wire name used by event-trigger filters in automation rules.
    pub fn name(self) -> &'static str {
        match self {
            EventKind::Sensor => "sensor",
            EventKind::Actuator => "actuator",
            EventKind::Timer => "timer",
            EventKind::System => "system",
            EventKind::Protocol => "protocol",
            EventKind::Custom(_) => "custom",
        }
    }
}


#[derive(Clone, Debug, PartialEq)]
pub struct Event {
    pub kind: EventKind,
    pub id: u32,
    pub source: Option<String>,
    pub timestamp_ms: u64,
    pub data: Vec<u8>,
}


#[derive(Clone, Debug, PartialEq)]
pub enum EventError {
    QueueFull,
    TableFull,
    NotFound,
    Busy,
}

pub type Result<T> = core::result::Result<T, EventError>;

pub type SubscriptionId = u32;
pub type EventHandler = Box<dyn FnMut(&Event)>;


struct Subscription {
    id: SubscriptionId,
    kind: Option<EventKind>,
    source: Option<String>,
    handler: EventHandler,
}

impl Subscription {
    fn matches(&self, event: &Event) -> bool {
        if let Some(kind) = self.kind {
            if kind != event.kind {
                return false;
            }
        }
        match (&self.source, &event.source) {
            (Some(want), Some(have)) => want == have,
            // A source filter cannot match a sourceless event.
            (Some(_), None) => false,
            (None, _) => true,
        }
    }
}


struct Ring {
    slots: Vec<Option<Event>>,
    head: usize,
    tail: usize,
    count: usize,
}

impl Ring {
    fn new(size: usize) -> Ring {
        let mut slots = Vec::with_capacity(size);
        slots.resize_with(size, || None);
        Ring { slots, head: 0, tail: 0, count: 0 }
    }

    fn push(&mut self, event: Event) -> Result<()> {
        if self.count == self.slots.len() {
            return Err(EventError::QueueFull);
        }
        self.slots[self.tail] = Some(event);
        self.tail = (self.tail + 1) % self.slots.len();
        self.count += 1;
        Ok(())
    }

    fn pop(&mut self) -> Option<Event> {
        if self.count == 0 {
            return None;
        }
        let event = self.slots[self.head].take();
        self.head = (self.head + 1) % self.slots.len();
        self.count -= 1;
        event
    }
}


pub struct EventBus {
    queue: RefCell<Ring>,
    subscribers: RefCell<Vec<Option<Subscription>>>,
    next_id: Cell<SubscriptionId>,
    next_event_id: Cell<u32>,
}

impl EventBus {
    pub fn new(max_handlers: usize, queue_size: usize) -> EventBus {
        let mut subscribers = Vec::with_capacity(max_handlers);
        subscribers.resize_with(max_handlers, || None);
        EventBus {
            queue: RefCell::new(Ring::new(queue_size)),
            subscribers: RefCell::new(subscribers),
            next_id: Cell::new(1),
            next_event_id: Cell::new(1),
        }
    }

    pub fn subscribe(
        &self,
        kind: Option<EventKind>,
        source: Option<&str>,
        handler: EventHandler
    ) -> Result<SubscriptionId> {
        let mut subs = self.subscribers
            .try_borrow_mut()
            .map_err(|_| EventError::Busy)?;

        let slot = subs
            .iter()
            .position(Option::is_none)
            .ok_or(EventError::TableFull)?;

        let id = self.next_id.get();
        self.next_id.set(id + 1);

        subs[slot] = Some(Subscription {
            id,
            kind,
            source: source.map(String::from),
            handler,
        });

        Ok(id)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> Result<()> {
        let mut subs = self.subscribers
            .try_borrow_mut()
            .map_err(|_| EventError::Busy)?;

        let slot = subs
            .iter()
            .position(|s| s.as_ref().map_or(false, |s| s.id == id))
            .ok_or(EventError::NotFound)?;

        subs[slot] = None;
        Ok(())
    }

    // Enqueue an event. Overflow is an error, never a silent drop.
    pub fn publish(
        &self,
        kind: EventKind,
        source: Option<&str>,
        timestamp_ms: u64,
        data: &[u8]
    ) -> Result<u32> {
        let id = self.next_event_id.get();
        self.next_event_id.set(id + 1);

        self.queue.borrow_mut().push(Event {
            kind,
            id,
            source: source.map(String::from),
            timestamp_ms,
            data: data.to_vec(),
        })?;

        Ok(id)
    }

    pub fn pending(&self) -> usize {
        self.queue.borrow().count
    }

    // Drain up to max_events queued events (0 = all currently
    // queued) and dispatch each to every matching subscriber in
    // registration order. An event counts once no matter how many
    // subscribers see it.
    pub fn process(&self, max_events: usize) -> usize {
        let budget = {
            let queued = self.queue.borrow().count;
            if max_events == 0 { queued } else { max_events.min(queued) }
        };

        let mut processed = 0;
        for _ in 0..budget {
            let event = match self.queue.borrow_mut().pop() {
                Some(e) => e,
                None => break,
            };

            let mut subs = self.subscribers.borrow_mut();
            for sub in subs.iter_mut().flatten() {
                if sub.matches(&event) {
                    (sub.handler)(&event);
                }
            }
            drop(subs);

            processed += 1;
        }

        processed
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    fn counter(bus: &EventBus, kind: Option<EventKind>, source: Option<&str>)
        -> Rc<RefCell<usize>>
    {
        let count = Rc::new(RefCell::new(0));
        let count2 = count.clone();
        bus.subscribe(kind, source, Box::new(move |_| {
            *count2.borrow_mut() += 1;
        })).unwrap();
        count
    }

    #[test]
    fn test_filters() {
        let bus = EventBus::new(8, 8);
        let h1 = counter(&bus, Some(EventKind::Sensor), Some("temp1"));
        let h2 = counter(&bus, Some(EventKind::Sensor), None);
        let h3 = counter(&bus, Some(EventKind::Actuator), None);

        bus.publish(EventKind::Sensor, Some("temp1"), 0, b"").unwrap();
        bus.process(0);

        assert_eq!(*h1.borrow(), 1);
        assert_eq!(*h2.borrow(), 1);
        assert_eq!(*h3.borrow(), 0);
    }

    #[test]
    fn test_source_filter_rejects_sourceless() {
        let bus = EventBus::new(4, 4);
        let filtered = counter(&bus, None, Some("temp1"));

        bus.publish(EventKind::Sensor, None, 0, b"").unwrap();
        bus.process(0);

        assert_eq!(*filtered.borrow(), 0);
    }

    #[test]
    fn test_queue_full() {
        let bus = EventBus::new(1, 2);
        bus.publish(EventKind::Timer, None, 0, b"").unwrap();
        bus.publish(EventKind::Timer, None, 1, b"").unwrap();
        assert_eq!(
            bus.publish(EventKind::Timer, None, 2, b""),
            Err(EventError::QueueFull)
        );
    }

    #[test]
    fn test_fifo_order() {
        let bus = EventBus::new(1, 8);
        let seen = Rc::new(RefCell::new(Vec::new()));
        let seen2 = seen.clone();
        bus.subscribe(None, None, Box::new(move |e: &Event| {
            seen2.borrow_mut().push(e.id);
        })).unwrap();

        let a = bus.publish(EventKind::Timer, None, 0, b"").unwrap();
        let b = bus.publish(EventKind::Timer, None, 1, b"").unwrap();
        let c = bus.publish(EventKind::Timer, None, 2, b"").unwrap();
        bus.process(0);

        assert_eq!(*seen.borrow(), vec![a, b, c]);
    }

    #[test]
    fn test_publish_during_dispatch_waits_for_next_process() {
        let bus = Rc::new(EventBus::new(2, 8));
        let bus2 = bus.clone();
        let count = Rc::new(RefCell::new(0));
        let count2 = count.clone();

        bus.subscribe(Some(EventKind::Timer), None, Box::new(move |e| {
            *count2.borrow_mut() += 1;
            if e.source.is_none() {
                // Re-publish with a source so it only cascades once.
                bus2.publish(EventKind::Timer, Some("again"), 0, b"").unwrap();
            }
        })).unwrap();

        bus.publish(EventKind::Timer, None, 0, b"").unwrap();

        // First drain only sees the original event.
        assert_eq!(bus.process(0), 1);
        assert_eq!(*count.borrow(), 1);

        // The event published mid-dispatch arrives on the next call.
        assert_eq!(bus.process(0), 1);
        assert_eq!(*count.borrow(), 2);
    }

    #[test]
    fn test_payload_copied() {
        let bus = EventBus::new(2, 2);
        let got = Rc::new(RefCell::new(Vec::new()));
        let got2 = got.clone();
        bus.subscribe(None, None, Box::new(move |e: &Event| {
            *got2.borrow_mut() = e.data.clone();
        })).unwrap();

        {
            let transient = vec![1u8, 2, 3];
            bus.publish(EventKind::Sensor, None, 0, &transient).unwrap();
            // transient dropped here; the queue owns its copy
        }
        bus.process(0);
        assert_eq!(*got.borrow(), vec![1, 2, 3]);
    }

    #[test]
    fn test_unsubscribe() {
        let bus = EventBus::new(2, 4);
        let count = Rc::new(RefCell::new(0));
        let count2 = count.clone();
        let id = bus.subscribe(None, None, Box::new(move |_| {
            *count2.borrow_mut() += 1;
        })).unwrap();

        bus.unsubscribe(id).unwrap();
        assert_eq!(bus.unsubscribe(id), Err(EventError::NotFound));

        bus.publish(EventKind::Timer, None, 0, b"").unwrap();
        bus.process(0);
        assert_eq!(*count.borrow(), 0);
    }

    #[test]
    fn test_max_events_budget() {
        let bus = EventBus::new(1, 8);
        for i in 0..4 {
            bus.publish(EventKind::Timer, None, i, b"").unwrap();
        }
        assert_eq!(bus.process(3), 3);
        assert_eq!(bus.pending(), 1);
        assert_eq!(bus.process(0), 1);
    }
}
