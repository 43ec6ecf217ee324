use disruptor::{
    BusySpin, EventPoller, MultiProducer, MultiProducerBarrier, Producer, SingleConsumerBarrier,
    build_multi_producer,
};
use parking_lot::Mutex;

use crate::connection::Connection;

/// Ring slot carrying one fully built connection to its service thread. The poller
/// only sees `&HandoffSlot`, hence the lock around the payload.
pub struct HandoffSlot {
    conn: Mutex<Option<Connection>>,
}

impl HandoffSlot {
    /// Factory for disruptor - empty slots that adopters fill.
    pub fn factory() -> Self {
        Self {
            conn: Mutex::new(None),
        }
    }

    pub fn take(&self) -> Option<Connection> {
        self.conn.lock().take()
    }
}

// Concrete types for the handoff MPSC channel: any thread adopts, one service thread consumes.
pub type RawHandoffProducer = MultiProducer<HandoffSlot, SingleConsumerBarrier>;
pub type HandoffPoller = EventPoller<HandoffSlot, MultiProducerBarrier>;

/// Producer half; shared by every thread that adopts onto this service thread.
pub struct HandoffProducer {
    producer: RawHandoffProducer,
}

impl HandoffProducer {
    /// Publish `conn`. A full ring hands the connection back untouched.
    pub fn send(&mut self, conn: Connection) -> Result<(), Connection> {
        let mut conn = Some(conn);
        let _ = self.producer.try_publish(|slot| {
            *slot.conn.get_mut() = conn.take();
        });
        match conn {
            Some(conn) => Err(conn),
            None => Ok(()),
        }
    }
}

/// Build a matched producer/poller pair for one service thread.
pub fn build_handoff_channel(capacity: usize) -> (HandoffProducer, HandoffPoller) {
    let builder = build_multi_producer(capacity, HandoffSlot::factory, BusySpin);
    let (poller, builder) = builder.event_poller();
    let producer = builder.build();

    (HandoffProducer { producer }, poller)
}
