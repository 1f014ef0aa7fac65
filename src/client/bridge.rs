use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::trace;

use crate::att::{ErrorCode, MAX_VAL_LEN};
use crate::host::{ClientEvent, ConnHandle, OpCallback, OpData, OpEvent, Status};

/// Result slot shared between a blocked application thread and the host
/// context for one submitted operation.
///
/// The application thread submits the operation with a callback capturing
/// the record, then parks on the condvar. Callbacks run on the host context:
/// non-terminal deliveries accumulate without waking the waiter, the
/// terminal delivery stores the status and wakes it. A callback may fire
/// before the waiter ever parks (a stack that completes synchronously during
/// submission); the `done` flag makes that ordering safe.
pub(super) struct OpRecord {
    conn: ConnHandle,
    state: Mutex<OpState>,
    cv: Condvar,
}

#[derive(Default)]
struct OpState {
    done: bool,
    status: Option<Status>,
    data: Vec<u8>,
}

impl OpRecord {
    #[inline]
    pub fn new(conn: ConnHandle) -> Arc<Self> {
        Arc::new(Self {
            conn,
            state: Mutex::new(OpState::default()),
            cv: Condvar::new(),
        })
    }

    #[inline]
    pub const fn conn(&self) -> ConnHandle {
        self.conn
    }

    /// Blocks the calling thread until the terminal status arrives.
    pub fn wait(&self) -> Status {
        let mut st = self.state.lock();
        while !st.done {
            self.cv.wait(&mut st);
        }
        st.status.unwrap_or(Status::Failed)
    }

    /// Stores the terminal status and wakes the waiter. Later completions
    /// (e.g. a disconnect racing the real terminal callback) are ignored.
    pub fn complete(&self, status: Status) {
        let mut st = self.state.lock();
        if st.done {
            return;
        }
        st.done = true;
        st.status = Some(status);
        self.cv.notify_all();
    }

    /// Takes the accumulated value fragments.
    #[inline]
    pub fn take_data(&self) -> Vec<u8> {
        std::mem::take(&mut self.state.lock().data)
    }

    /// Appends one value fragment. Accumulation past the maximum attribute
    /// value length terminates the operation with a length error.
    fn append(&self, frag: &[u8]) {
        let mut st = self.state.lock();
        if st.done {
            return;
        }
        if st.data.len() + frag.len() > MAX_VAL_LEN {
            trace!("Aborting read on {}: value exceeds {MAX_VAL_LEN}", self.conn);
            st.done = true;
            st.status = Some(Status::Att(ErrorCode::InvalidAttributeValueLength));
            self.cv.notify_all();
            return;
        }
        st.data.extend_from_slice(frag);
    }

    /// Builds the completion callback for value-transfer operations.
    /// Fragments accumulate in the record; events for other connections are
    /// discarded.
    pub fn value_callback(self: &Arc<Self>) -> OpCallback {
        let rec = Arc::clone(self);
        Box::new(move |ev: ClientEvent| {
            if ev.conn != rec.conn {
                return;
            }
            match ev.event {
                OpEvent::Item(OpData::Fragment(v)) => rec.append(&v),
                OpEvent::Item(_) => {}
                OpEvent::Complete(st) => rec.complete(st),
            }
        })
    }

    /// Builds the completion callback for discovery operations, routing each
    /// discovered item to `item`. Events for other connections are
    /// discarded.
    pub fn item_callback(
        self: &Arc<Self>,
        mut item: impl FnMut(OpData) + Send + 'static,
    ) -> OpCallback {
        let rec = Arc::clone(self);
        Box::new(move |ev: ClientEvent| {
            if ev.conn != rec.conn {
                return;
            }
            match ev.event {
                OpEvent::Item(data) => item(data),
                OpEvent::Complete(st) => rec.complete(st),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wake_on_complete() {
        let rec = OpRecord::new(ConnHandle::new(1));
        let waiter = Arc::clone(&rec);
        let t = std::thread::spawn(move || waiter.wait());
        rec.append(&[1, 2]);
        rec.append(&[3]);
        rec.complete(Status::Done);
        assert_eq!(t.join().unwrap(), Status::Done);
        assert_eq!(rec.take_data(), vec![1, 2, 3]);
        // Only the first completion counts
        rec.complete(Status::Disconnected);
        assert_eq!(rec.wait(), Status::Done);
    }

    #[test]
    fn cross_connection_guard() {
        let rec = OpRecord::new(ConnHandle::new(1));
        let mut cb = rec.value_callback();
        cb(ClientEvent {
            conn: ConnHandle::new(2),
            event: OpEvent::Complete(Status::Done),
        });
        assert!(!rec.state.lock().done);
        cb(ClientEvent {
            conn: ConnHandle::new(1),
            event: OpEvent::Complete(Status::Done),
        });
        assert!(rec.state.lock().done);
    }

    #[test]
    fn oversized_read_fails() {
        let rec = OpRecord::new(ConnHandle::new(1));
        rec.append(&[0; MAX_VAL_LEN]);
        rec.append(&[0; 1]);
        assert_eq!(
            rec.wait(),
            Status::Att(ErrorCode::InvalidAttributeValueLength)
        );
    }
}
