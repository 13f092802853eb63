//! Test doubles for driving rooms without any real network.
#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use weft_server::{SendError, SessionSocket};

pub use weft_shared::ServerMessage;

/// A session socket that records every frame for later inspection.
pub struct RecordingSocket {
    frames: Rc<RefCell<Vec<String>>>,
    closed: Rc<Cell<bool>>,
    fail_sends: bool,
}

/// The observer half of a [`RecordingSocket`].
pub struct SocketProbe {
    frames: Rc<RefCell<Vec<String>>>,
    closed: Rc<Cell<bool>>,
}

pub fn socket() -> (RecordingSocket, SocketProbe) {
    socket_with_failures(false)
}

/// A socket whose sends always fail, for exercising the ignore-and-log
/// policy.
pub fn broken_socket() -> (RecordingSocket, SocketProbe) {
    socket_with_failures(true)
}

fn socket_with_failures(fail_sends: bool) -> (RecordingSocket, SocketProbe) {
    let frames = Rc::new(RefCell::new(Vec::new()));
    let closed = Rc::new(Cell::new(false));
    (
        RecordingSocket {
            frames: Rc::clone(&frames),
            closed: Rc::clone(&closed),
            fail_sends,
        },
        SocketProbe { frames, closed },
    )
}

impl SessionSocket for RecordingSocket {
    fn send(&mut self, frame: &str) -> Result<(), SendError> {
        if self.fail_sends {
            return Err(SendError);
        }
        self.frames.borrow_mut().push(frame.to_string());
        Ok(())
    }

    fn close(&mut self) {
        self.closed.set(true);
    }
}

impl SocketProbe {
    /// Drains and decodes everything received since the last call.
    pub fn take_messages(&self) -> Vec<ServerMessage> {
        self.frames
            .borrow_mut()
            .drain(..)
            .map(|frame| ServerMessage::decode(&frame).expect("room sent an undecodable frame"))
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.get()
    }
}
