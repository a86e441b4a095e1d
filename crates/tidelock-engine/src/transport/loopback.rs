//! In-process transport.
//!
//! A [`LocalLoopback`] endpoint either talks to itself ([`LocalLoopback::new`])
//! or to a partner endpoint ([`LocalLoopback::pair`]). Delivery is
//! synchronous once connected: `send` invokes the receiving endpoint's
//! handler before returning. Messages sent before `connect` are queued and
//! flushed in order on connect.
//!
//! Handlers run with the link unlocked, so a handler may send on the link it
//! is receiving from. Such a send is queued behind the message being handled
//! and delivered once the handler returns.
//!
//! An optional latency (in ticks) holds messages until the sender's
//! [`Transport::pump`] reaches their due tick, which is handy for exercising
//! lockstep stalls in tests.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tidelock_core::Tick;
use tracing::{debug, trace};

use super::{ReceiveHandler, Transport, TransportMessage, TransportStats};
use crate::error::TransportError;

/// Loopback tuning.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopbackConfig {
    /// Ticks between send and delivery. Zero delivers immediately.
    pub latency_ticks: u64,
}

#[derive(Default)]
struct Endpoint {
    handler: Option<ReceiveHandler>,
    connected: bool,
    closed: bool,
    /// Sent before connect.
    outbox: VecDeque<TransportMessage>,
    /// Sent with latency: (due tick, message).
    in_flight: VecDeque<(Tick, TransportMessage)>,
    /// Awaiting this endpoint's handler: (sending endpoint, message).
    inbox: VecDeque<(usize, TransportMessage)>,
    /// Set while some caller is draining `inbox`.
    dispatching: bool,
    clock: Tick,
    stats: TransportStats,
}

#[derive(Default)]
struct Link {
    endpoints: Vec<Endpoint>,
}

impl Link {
    /// Queue a message for `to`. Returns true when the caller must drain the
    /// inbox with [`dispatch`] after releasing the lock.
    fn post(&mut self, from: usize, to: usize, message: TransportMessage) -> bool {
        let endpoint = &mut self.endpoints[to];
        endpoint.inbox.push_back((from, message));
        !std::mem::replace(&mut endpoint.dispatching, true)
    }
}

/// Hand every queued message of endpoint `to` to its handler. The lock is
/// released around each handler call.
fn dispatch(link: &Mutex<Link>, to: usize) {
    loop {
        let (from, message, handler) = {
            let mut guard = link.lock();
            let endpoint = &mut guard.endpoints[to];
            let Some((from, message)) = endpoint.inbox.pop_front() else {
                endpoint.dispatching = false;
                return;
            };
            (from, message, endpoint.handler.take())
        };
        trace!(kind = message.kind_name(), tick = message.tick(), "loopback deliver");
        match handler {
            Some(mut handler) => {
                handler(message);
                let mut guard = link.lock();
                let endpoint = &mut guard.endpoints[to];
                endpoint.stats.messages_received += 1;
                // A handler installed from inside the callback wins.
                if endpoint.handler.is_none() {
                    endpoint.handler = Some(handler);
                }
            }
            None => {
                debug!(kind = message.kind_name(), "loopback message has no receiver");
                link.lock().endpoints[from].stats.undelivered += 1;
            }
        }
    }
}

/// One end of an in-process link.
#[derive(Clone)]
pub struct LocalLoopback {
    link: Arc<Mutex<Link>>,
    me: usize,
    peer: usize,
    config: LoopbackConfig,
}

impl LocalLoopback {
    /// An endpoint that delivers to its own handler.
    pub fn new(config: LoopbackConfig) -> Self {
        let link = Link {
            endpoints: vec![Endpoint::default()],
        };
        Self {
            link: Arc::new(Mutex::new(link)),
            me: 0,
            peer: 0,
            config,
        }
    }

    /// Two endpoints delivering to each other.
    pub fn pair(config: LoopbackConfig) -> (Self, Self) {
        let link = Arc::new(Mutex::new(Link {
            endpoints: vec![Endpoint::default(), Endpoint::default()],
        }));
        let a = Self {
            link: Arc::clone(&link),
            me: 0,
            peer: 1,
            config: config.clone(),
        };
        let b = Self {
            link,
            me: 1,
            peer: 0,
            config,
        };
        (a, b)
    }

    /// Number of messages queued before connect or held by latency.
    pub fn queued(&self) -> usize {
        let link = self.link.lock();
        let me = &link.endpoints[self.me];
        me.outbox.len() + me.in_flight.len()
    }

    /// Deliver now or hold for latency. Returns true when the peer's inbox
    /// needs draining.
    fn route(&self, link: &mut Link, message: TransportMessage) -> bool {
        if self.config.latency_ticks == 0 {
            link.post(self.me, self.peer, message)
        } else {
            let me = &mut link.endpoints[self.me];
            let due = me.clock + self.config.latency_ticks;
            me.in_flight.push_back((due, message));
            false
        }
    }

    fn wake_peer(&self, wake: bool) {
        if wake {
            dispatch(&self.link, self.peer);
        }
    }
}

impl Transport for LocalLoopback {
    fn connect(&mut self) -> Result<(), TransportError> {
        let wake = {
            let mut link = self.link.lock();
            let me = &mut link.endpoints[self.me];
            me.connected = true;
            me.closed = false;
            let queued: Vec<TransportMessage> = me.outbox.drain(..).collect();
            if !queued.is_empty() {
                debug!(count = queued.len(), "flushing messages queued before connect");
            }
            let mut wake = false;
            for message in queued {
                wake |= self.route(&mut link, message);
            }
            wake
        };
        self.wake_peer(wake);
        Ok(())
    }

    fn disconnect(&mut self) {
        let mut link = self.link.lock();
        let me = &mut link.endpoints[self.me];
        me.connected = false;
        me.closed = true;
        let dropped = (me.outbox.len() + me.in_flight.len()) as u64;
        me.outbox.clear();
        me.in_flight.clear();
        me.stats.undelivered += dropped;
    }

    fn send(&mut self, message: TransportMessage) -> Result<(), TransportError> {
        let wake = {
            let mut link = self.link.lock();
            let me = &mut link.endpoints[self.me];
            if me.closed {
                return Err(TransportError::Closed);
            }
            me.stats.messages_sent += 1;
            if !me.connected {
                me.outbox.push_back(message);
                return Ok(());
            }
            self.route(&mut link, message)
        };
        self.wake_peer(wake);
        Ok(())
    }

    fn on_receive(&mut self, handler: ReceiveHandler) {
        self.link.lock().endpoints[self.me].handler = Some(handler);
    }

    fn stats(&self) -> TransportStats {
        self.link.lock().endpoints[self.me].stats
    }

    fn is_connected(&self) -> bool {
        self.link.lock().endpoints[self.me].connected
    }

    fn pump(&mut self, tick: Tick) -> Result<(), TransportError> {
        let wake = {
            let mut link = self.link.lock();
            let me = &mut link.endpoints[self.me];
            me.clock = tick;
            let mut due = Vec::new();
            while me.in_flight.front().is_some_and(|(t, _)| *t <= tick) {
                if let Some((_, message)) = me.in_flight.pop_front() {
                    due.push(message);
                }
            }
            let mut wake = false;
            for message in due {
                wake |= link.post(self.me, self.peer, message);
            }
            wake
        };
        self.wake_peer(wake);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder(transport: &mut LocalLoopback) -> Arc<Mutex<Vec<Tick>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        transport.on_receive(Box::new(move |msg| sink.lock().push(msg.tick())));
        seen
    }

    fn beat(tick: Tick) -> TransportMessage {
        TransportMessage::Heartbeat { tick }
    }

    #[test]
    fn self_loop_delivers_synchronously() {
        let mut lb = LocalLoopback::new(LoopbackConfig::default());
        let seen = recorder(&mut lb);
        lb.connect().unwrap();
        lb.send(beat(1)).unwrap();
        assert_eq!(*seen.lock(), vec![1]);
        assert_eq!(lb.stats().messages_sent, 1);
        assert_eq!(lb.stats().messages_received, 1);
    }

    #[test]
    fn messages_before_connect_are_flushed_in_order() {
        let mut lb = LocalLoopback::new(LoopbackConfig::default());
        let seen = recorder(&mut lb);
        lb.send(beat(1)).unwrap();
        lb.send(beat(2)).unwrap();
        assert!(seen.lock().is_empty());
        assert_eq!(lb.queued(), 2);

        lb.connect().unwrap();
        assert_eq!(*seen.lock(), vec![1, 2]);
    }

    #[test]
    fn pair_delivers_to_the_other_end() {
        let (mut a, mut b) = LocalLoopback::pair(LoopbackConfig::default());
        let at_a = recorder(&mut a);
        let at_b = recorder(&mut b);
        a.connect().unwrap();
        b.connect().unwrap();

        a.send(beat(5)).unwrap();
        b.send(beat(6)).unwrap();
        assert_eq!(*at_b.lock(), vec![5]);
        assert_eq!(*at_a.lock(), vec![6]);
    }

    #[test]
    fn send_after_disconnect_fails() {
        let mut lb = LocalLoopback::new(LoopbackConfig::default());
        lb.connect().unwrap();
        lb.disconnect();
        assert_eq!(lb.send(beat(1)), Err(TransportError::Closed));
        assert!(!lb.is_connected());
    }

    #[test]
    fn latency_holds_messages_until_pumped() {
        let (mut a, mut b) = LocalLoopback::pair(LoopbackConfig { latency_ticks: 2 });
        let at_b = recorder(&mut b);
        a.connect().unwrap();
        a.pump(10).unwrap();
        a.send(beat(10)).unwrap();

        a.pump(11).unwrap();
        assert!(at_b.lock().is_empty());
        a.pump(12).unwrap();
        assert_eq!(*at_b.lock(), vec![10]);
    }

    #[test]
    fn handler_may_send_on_its_own_link() {
        let mut lb = LocalLoopback::new(LoopbackConfig::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let mut echo = lb.clone();
        lb.on_receive(Box::new(move |msg| {
            let tick = msg.tick();
            sink.lock().push(tick);
            if tick < 3 {
                echo.send(beat(tick + 1)).unwrap();
            }
        }));
        lb.connect().unwrap();

        lb.send(beat(1)).unwrap();
        assert_eq!(*seen.lock(), vec![1, 2, 3]);
        assert_eq!(lb.stats().messages_received, 3);
    }

    #[test]
    fn handler_may_reply_to_its_partner() {
        let (mut a, mut b) = LocalLoopback::pair(LoopbackConfig::default());
        let at_a = recorder(&mut a);
        let mut reply = b.clone();
        b.on_receive(Box::new(move |msg| {
            reply.send(beat(msg.tick() * 10)).unwrap();
        }));
        a.connect().unwrap();
        b.connect().unwrap();

        a.send(beat(1)).unwrap();
        a.send(beat(2)).unwrap();
        assert_eq!(*at_a.lock(), vec![10, 20]);
        assert_eq!(b.stats().messages_received, 2);
    }

    #[test]
    fn missing_receiver_counts_as_undelivered() {
        let (mut a, _b) = LocalLoopback::pair(LoopbackConfig::default());
        a.connect().unwrap();
        a.send(beat(1)).unwrap();
        assert_eq!(a.stats().undelivered, 1);
    }
}
