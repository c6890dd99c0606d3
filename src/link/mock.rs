// Scripted link for unit tests
//
// A responder closure plays the device: it sees every outbound frame and
// returns the bytes the device would answer with.

use std::collections::VecDeque;
use std::io::ErrorKind;
use std::sync::{Arc, Mutex};

use super::SerialLink;
use crate::error::TransportError;

type Responder = Box<dyn FnMut(&[u8]) -> Vec<u8> + Send>;

#[derive(Clone, Default)]
pub(crate) struct MockLink {
    inner: Arc<Mutex<MockLinkInner>>,
}

#[derive(Default)]
struct MockLinkInner {
    rx: VecDeque<u8>,
    sent: Vec<Vec<u8>>,
    responder: Option<Responder>,
    broken: bool,
}

impl MockLink {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_responder<F>(responder: F) -> Self
    where
        F: FnMut(&[u8]) -> Vec<u8> + Send + 'static,
    {
        let link = Self::new();
        link.inner.lock().unwrap().responder = Some(Box::new(responder));
        link
    }

    /// Queue bytes for the next receive calls
    pub(crate) fn inject_read(&self, data: &[u8]) {
        self.inner.lock().unwrap().rx.extend(data);
    }

    /// Every frame passed to `send`, in order
    pub(crate) fn sent(&self) -> Vec<Vec<u8>> {
        self.inner.lock().unwrap().sent.clone()
    }

    /// A broken link fails every call with an I/O error
    pub(crate) fn set_broken(&self, broken: bool) {
        self.inner.lock().unwrap().broken = broken;
    }
}

fn broken_pipe() -> TransportError {
    TransportError::Io(std::io::Error::new(ErrorKind::BrokenPipe, "mock link broken"))
}

impl SerialLink for MockLink {
    fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.broken {
            return Err(broken_pipe());
        }
        inner.sent.push(bytes.to_vec());
        if let Some(responder) = inner.responder.as_mut() {
            let reply = responder(bytes);
            inner.rx.extend(reply);
        }
        Ok(())
    }

    fn receive(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.broken {
            return Err(broken_pipe());
        }
        let available = inner.rx.len().min(buf.len());
        for (slot, byte) in buf.iter_mut().zip(inner.rx.drain(..available)) {
            *slot = byte;
        }
        Ok(available)
    }

    fn discard_input(&mut self) -> Result<(), TransportError> {
        self.inner.lock().unwrap().rx.clear();
        Ok(())
    }
}
