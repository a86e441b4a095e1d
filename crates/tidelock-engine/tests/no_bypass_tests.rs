//! Integration tests for the single intake path.
//!
//! The queue has no public enqueue; the only way in is a transport's receive
//! handler. A transport that never delivers therefore never changes the
//! simulation.

mod common;

use std::sync::Arc;

use common::{kernel, kernel_with_input, send, spawn};
use parking_lot::Mutex;
use tidelock_core::prelude::*;
use tidelock_engine::prelude::*;
use tidelock_engine::transport::ReceiveHandler;

/// Accepts every message and never calls its handler.
#[derive(Default)]
struct Deaf {
    sent: Vec<TransportMessage>,
    connected: bool,
}

impl Transport for Deaf {
    fn connect(&mut self) -> Result<(), TransportError> {
        self.connected = true;
        Ok(())
    }

    fn disconnect(&mut self) {
        self.connected = false;
    }

    fn send(&mut self, message: TransportMessage) -> Result<(), TransportError> {
        self.sent.push(message);
        Ok(())
    }

    fn on_receive(&mut self, _handler: ReceiveHandler) {}

    fn stats(&self) -> TransportStats {
        TransportStats {
            messages_sent: self.sent.len() as u64,
            ..TransportStats::default()
        }
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}


#[test]
fn transport_that_never_delivers_keeps_queue_empty() {
    let mut kernel = kernel(1);
    let mut deaf = Deaf::default();
    kernel.attach_transport(PeerId::HOST, &mut deaf);
    deaf.connect().unwrap();

    let mut factory = CommandFactory::new(PeerId::HOST);
    for i in 0..3 {
        let cmd = factory.build(spawn(i as f64, 0.0), vec![]);
        deaf.send(TransportMessage::Command { tick: 0, command: cmd })
            .unwrap();
    }
    assert_eq!(deaf.stats().messages_sent, 3);

    kernel.step();
    kernel.step();
    assert_eq!(kernel.simulation().queue().pending_count(), 0);
    assert!(kernel.world().is_empty());
}

#[test]
fn unconnected_loopback_holds_commands_back() {
    let mut kernel = kernel(1);
    let mut input = LocalLoopback::new(LoopbackConfig::default());
    kernel.attach_transport(PeerId::HOST, &mut input);

    let mut factory = CommandFactory::new(PeerId::HOST);
    send(&mut input, 0, factory.build(spawn(0.0, 0.0), vec![]));
    kernel.step();
    assert_eq!(kernel.simulation().queue().pending_count(), 0);
    assert_eq!(input.queued(), 1);

    // Connecting flushes the held message into the port.
    input.connect().unwrap();
    kernel.step();
    kernel.step();
    assert_eq!(kernel.world().len(), 1);
}

#[test]
fn detached_transport_no_longer_feeds_the_queue() {
    let (mut kernel, mut input) = kernel_with_input(1);
    assert!(kernel.detach_transport(PeerId::HOST));

    let mut factory = CommandFactory::new(PeerId::HOST);
    send(&mut input, 0, factory.build(spawn(0.0, 0.0), vec![]));
    kernel.step();
    kernel.step();
    assert_eq!(kernel.simulation().queue().pending_count(), 0);
    assert!(kernel.world().is_empty());
}

#[test]
fn malformed_commands_are_rejected_at_intake() {
    let (mut kernel, mut input) = kernel_with_input(1);
    let rejected = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&rejected);
    let _sub = kernel
        .events()
        .subscribe(EventKind::CommandRejected, move |event| {
            sink.lock().push(event.clone());
        });

    let mut factory = CommandFactory::new(PeerId::HOST);
    // Stop without targets fails the shape check.
    send(&mut input, 0, factory.build(CommandKind::Stop, vec![]));
    kernel.step();

    assert_eq!(kernel.simulation().queue().pending_count(), 0);
    assert_eq!(rejected.lock().len(), 1);
}
