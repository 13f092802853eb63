//! In-memory duplex socket pair for end-to-end tests.
//!
//! Routes frames between a room and a client without any network I/O. The
//! client half implements `weft_client::Connection`, the server half
//! `weft_server::SessionSocket`; frames queue in both directions and are
//! pumped by the test harness.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

#[derive(Default)]
struct WireQueues {
    to_server: VecDeque<String>,
    to_client: VecDeque<String>,
}

/// Harness-side view of one wire: frames the client sent, plus whether the
/// client hung up and the room still has to be told.
#[derive(Clone)]
pub struct WireMonitor {
    queues: Rc<RefCell<WireQueues>>,
    open: Rc<Cell<bool>>,
    client_hung_up: Rc<Cell<bool>>,
}

impl WireMonitor {
    pub fn next_inbound_frame(&self) -> Option<String> {
        self.queues.borrow_mut().to_server.pop_front()
    }

    pub fn client_hung_up(&self) -> bool {
        self.client_hung_up.get()
    }

    pub fn is_open(&self) -> bool {
        self.open.get()
    }

    /// Severs the wire as a flaky network would, with no close frames in
    /// either direction.
    pub fn drop_link(&self) {
        self.open.set(false);
    }
}

/// The client half of a wire.
pub struct ClientEnd {
    queues: Rc<RefCell<WireQueues>>,
    open: Rc<Cell<bool>>,
    client_hung_up: Rc<Cell<bool>>,
}

impl weft_client::Connection for ClientEnd {
    fn send(&mut self, frame: &str) -> Result<(), weft_client::SendError> {
        if !self.open.get() {
            return Err(weft_client::SendError);
        }
        self.queues.borrow_mut().to_server.push_back(frame.to_string());
        Ok(())
    }

    fn receive(&mut self) -> Result<Option<String>, weft_client::RecvError> {
        if !self.open.get() {
            return Err(weft_client::RecvError);
        }
        Ok(self.queues.borrow_mut().to_client.pop_front())
    }

    fn close(&mut self) {
        self.open.set(false);
        self.client_hung_up.set(true);
    }
}

/// The room half of a wire.
pub struct ServerEnd {
    queues: Rc<RefCell<WireQueues>>,
    open: Rc<Cell<bool>>,
}

impl weft_server::SessionSocket for ServerEnd {
    fn send(&mut self, frame: &str) -> Result<(), weft_server::SendError> {
        if !self.open.get() {
            return Err(weft_server::SendError);
        }
        self.queues.borrow_mut().to_client.push_back(frame.to_string());
        Ok(())
    }

    fn close(&mut self) {
        self.open.set(false);
    }
}

/// A connected pair of socket halves plus the monitor observing them.
pub fn wire() -> (ClientEnd, ServerEnd, WireMonitor) {
    let queues = Rc::new(RefCell::new(WireQueues::default()));
    let open = Rc::new(Cell::new(true));
    let client_hung_up = Rc::new(Cell::new(false));
    (
        ClientEnd {
            queues: Rc::clone(&queues),
            open: Rc::clone(&open),
            client_hung_up: Rc::clone(&client_hung_up),
        },
        ServerEnd {
            queues: Rc::clone(&queues),
            open: Rc::clone(&open),
        },
        WireMonitor {
            queues,
            open,
            client_hung_up,
        },
    )
}
