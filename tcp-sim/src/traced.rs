//! Observable values.
//!
//! A [`TracedValue`] owns its value and a list of subscribers.  Writing a
//! different value calls every subscriber with `(old, new)`; writing the same
//! value is silent.  Dependents subscribe instead of holding pointers into the
//! owner, so the owner stays the only writer.
//!
//! [`SegmentTrace`] is the per-segment flavour: it has no value, only a
//! stream of `(header, payload, socket)` events.

use std::fmt;

use crate::packet::TcpHeader;
use crate::socket::SocketId;

/// Boxed change observer.
pub type ValueSink<T> = Box<dyn FnMut(T, T) + Send>;

/// A value that reports every change to its subscribers.
pub struct TracedValue<T> {
    value: T,
    sinks: Vec<ValueSink<T>>,
}

impl<T: Copy + PartialEq> TracedValue<T> {
    pub fn new(value: T) -> Self {
        Self {
            value,
            sinks: Vec::new(),
        }
    }

    pub fn get(&self) -> T {
        self.value
    }

    /// Store `value`, notifying subscribers if it differs from the current one.
    pub fn set(&mut self, value: T) {
        if value == self.value {
            return;
        }
        let old = std::mem::replace(&mut self.value, value);
        for sink in &mut self.sinks {
            sink(old, value);
        }
    }

    /// Subscribe to future changes.
    pub fn connect(&mut self, sink: impl FnMut(T, T) + Send + 'static) {
        self.sinks.push(Box::new(sink));
    }
}

impl<T: Copy + PartialEq + Default> Default for TracedValue<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: fmt::Debug> fmt::Debug for TracedValue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TracedValue")
            .field("value", &self.value)
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

/// Boxed segment observer.
pub type SegmentSink = Box<dyn FnMut(&TcpHeader, &[u8], SocketId) + Send>;

/// Fan-out of per-segment transmit or receive events.
#[derive(Default)]
pub struct SegmentTrace {
    sinks: Vec<SegmentSink>,
}

impl SegmentTrace {
    pub fn connect(&mut self, sink: impl FnMut(&TcpHeader, &[u8], SocketId) + Send + 'static) {
        self.sinks.push(Box::new(sink));
    }

    pub fn fire(&mut self, header: &TcpHeader, payload: &[u8], socket: SocketId) {
        for sink in &mut self.sinks {
            sink(header, payload, socket);
        }
    }
}

impl fmt::Debug for SegmentTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SegmentTrace({} sinks)", self.sinks.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn fires_only_on_change() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut v = TracedValue::new(1u32);
        let sink = Arc::clone(&seen);
        v.connect(move |old, new| sink.lock().unwrap().push((old, new)));

        v.set(1);
        v.set(5);
        v.set(5);
        v.set(2);

        assert_eq!(v.get(), 2);
        assert_eq!(*seen.lock().unwrap(), vec![(1, 5), (5, 2)]);
    }

    #[test]
    fn segment_trace_reaches_every_sink() {
        let count = Arc::new(Mutex::new(0usize));
        let mut trace = SegmentTrace::default();
        for _ in 0..2 {
            let c = Arc::clone(&count);
            trace.connect(move |_, payload, _| *c.lock().unwrap() += payload.len());
        }
        trace.fire(&TcpHeader::default(), b"abc", SocketId(7));
        assert_eq!(*count.lock().unwrap(), 6);
    }
}
