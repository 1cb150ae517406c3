//! The send queue: collects submitted requests and drains them into wire-ready
//! batches.
//!
//! The send loop blocks on [`MessagePacker::get`] until at least one request
//! is queued, then greedily drains more while the accumulated payload stays
//! under the single-message budget. Multi-message batches are wrapped in a
//! `msg_container` whose outer id is allocated after the inner ids so it
//! compares greater than all of them.

use std::collections::VecDeque;

use courier_mtproto::EncryptedSession;
use courier_tl_types::service::MessageContainer;
use courier_tl_types::Identifiable;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::request::{RequestError, RequestState};

/// At most this many messages go into one container.
pub(crate) const MAX_BATCH_LEN: usize = 100;

/// Conservative upper bound on the message stream handed to encryption.
pub(crate) const MAX_PAYLOAD_LEN: usize = 1_044_456;

/// `msg_id` + `seq_no` + length prefix per framed message.
const MESSAGE_OVERHEAD: usize = 16;

/// A drained batch: the plaintext message stream plus the states that went
/// into it, now bearing their assigned identifiers.
pub(crate) struct Batch {
    pub(crate) data: Vec<u8>,
    pub(crate) states: Vec<RequestState>,
}

/// Queue entries are `None` for the shutdown sentinel a reconnect inserts to
/// wake the send loop.
pub(crate) struct MessagePacker {
    queue: Mutex<VecDeque<Option<RequestState>>>,
    ready: Notify,
}

impl MessagePacker {
    pub(crate) fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            ready: Notify::new(),
        }
    }

    /// Enqueue a single request.
    pub(crate) fn append(&self, state: RequestState) {
        self.queue.lock().push_back(Some(state));
        self.ready.notify_one();
    }

    /// Enqueue many requests, preserving their order.
    pub(crate) fn extend(&self, states: Vec<RequestState>) {
        if states.is_empty() {
            return;
        }
        let mut queue = self.queue.lock();
        queue.extend(states.into_iter().map(Some));
        drop(queue);
        self.ready.notify_one();
    }

    /// Insert the shutdown sentinel so a blocked [`get`] returns `None`.
    ///
    /// [`get`]: Self::get
    pub(crate) fn append_sentinel(&self) {
        self.queue.lock().push_back(None);
        self.ready.notify_one();
    }

    /// Reject every queued request with a disconnection error and clear the
    /// queue.
    pub(crate) fn reject_all(&self) {
        let drained: Vec<_> = self.queue.lock().drain(..).collect();
        for state in drained.into_iter().flatten() {
            let mut state = state;
            state.reject(RequestError::Disconnected);
        }
    }

    /// Wait for requests and drain them into a batch.
    ///
    /// Returns `None` when the shutdown sentinel is reached or no session is
    /// installed; the send loop re-checks its exit conditions in both cases.
    pub(crate) async fn get(&self, session: &Mutex<Option<EncryptedSession>>) -> Option<Batch> {
        loop {
            loop {
                let notified = self.ready.notified();
                if !self.queue.lock().is_empty() {
                    break;
                }
                notified.await;
            }

            let mut queue = self.queue.lock();
            let mut session_guard = session.lock();
            let session = session_guard.as_mut()?;

            let mut data = Vec::new();
            let mut states: Vec<RequestState> = Vec::new();
            let mut size = 0;

            while let Some(entry) = queue.front() {
                if states.len() >= MAX_BATCH_LEN {
                    break;
                }
                if entry.is_none() {
                    if states.is_empty() {
                        queue.pop_front();
                        return None;
                    }
                    // Finish this batch; the sentinel is seen next call.
                    break;
                }

                let mut state = match queue.pop_front() {
                    Some(Some(state)) => state,
                    _ => break,
                };

                let needed = state.body.len() + MESSAGE_OVERHEAD;
                if size + needed > MAX_PAYLOAD_LEN {
                    if states.is_empty() {
                        // Nothing can carry this request; fail it rather than
                        // wedging the queue behind it.
                        state.reject(RequestError::PayloadTooLarge);
                        continue;
                    }
                    queue.push_front(Some(state));
                    break;
                }
                size += needed;

                let (msg_id, seq_no) =
                    session.write_message(&mut data, &state.body, state.content_related());
                state.msg_id = msg_id;
                state.seq_no = seq_no;
                state.container_id = None;
                states.push(state);
            }

            if states.is_empty() {
                // Everything drained was rejected; wait for more work.
                continue;
            }

            let data = if states.len() == 1 {
                data
            } else {
                let mut wrapped = Vec::with_capacity(data.len() + 24);
                let container_len = 8 + data.len();
                let container_id = session.new_msg_id();
                let seq_no = session.next_seq_no(false);
                wrapped.extend_from_slice(&container_id.to_le_bytes());
                wrapped.extend_from_slice(&seq_no.to_le_bytes());
                wrapped.extend_from_slice(&(container_len as i32).to_le_bytes());
                wrapped.extend_from_slice(&MessageContainer::CONSTRUCTOR_ID.to_le_bytes());
                wrapped.extend_from_slice(&(states.len() as i32).to_le_bytes());
                wrapped.extend_from_slice(&data);
                for state in &mut states {
                    state.container_id = Some(container_id);
                }
                wrapped
            };

            return Some(Batch { data, states });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_tl_types::service::Ping;
    use courier_tl_types::Serializable;

    fn session() -> Mutex<Option<EncryptedSession>> {
        Mutex::new(Some(EncryptedSession::new([1u8; 256], 0, 0)))
    }

    fn ping_state(ping_id: i64) -> RequestState {
        let (state, rx) = RequestState::rpc(Ping { ping_id }.to_bytes());
        drop(rx);
        state
    }

    #[tokio::test]
    async fn single_request_is_sent_bare() {
        let packer = MessagePacker::new();
        let session = session();
        packer.append(ping_state(1));

        let batch = packer.get(&session).await.unwrap();
        assert_eq!(batch.states.len(), 1);
        assert_eq!(batch.states[0].container_id, None);

        let msg_id = i64::from_le_bytes(batch.data[..8].try_into().unwrap());
        assert_eq!(msg_id, batch.states[0].msg_id);
        let len = i32::from_le_bytes(batch.data[12..16].try_into().unwrap()) as usize;
        assert_eq!(&batch.data[16..16 + len], &batch.states[0].body[..]);
    }

    #[tokio::test]
    async fn multiple_requests_share_a_container() {
        let packer = MessagePacker::new();
        let session = session();
        for i in 0..3 {
            packer.append(ping_state(i));
        }

        let batch = packer.get(&session).await.unwrap();
        assert_eq!(batch.states.len(), 3);

        // Outer header (16 bytes) is followed by the container constructor.
        assert_eq!(
            &batch.data[16..20],
            &MessageContainer::CONSTRUCTOR_ID.to_le_bytes()
        );
        assert_eq!(
            i32::from_le_bytes(batch.data[20..24].try_into().unwrap()),
            3
        );

        let container_id = i64::from_le_bytes(batch.data[..8].try_into().unwrap());
        let mut previous = 0;
        for state in &batch.states {
            assert_eq!(state.container_id, Some(container_id));
            assert!(state.msg_id > previous, "inner ids must increase");
            assert!(state.msg_id < container_id, "outer id is allocated last");
            previous = state.msg_id;
        }
        // Container itself is content-unrelated.
        let seq_no = i32::from_le_bytes(batch.data[8..12].try_into().unwrap());
        assert_eq!(seq_no % 2, 0);
    }

    #[tokio::test]
    async fn sentinel_wakes_the_consumer_with_none() {
        let packer = MessagePacker::new();
        let session = session();
        packer.append_sentinel();
        assert!(packer.get(&session).await.is_none());
    }

    #[tokio::test]
    async fn sentinel_after_requests_finishes_batch_first() {
        let packer = MessagePacker::new();
        let session = session();
        packer.append(ping_state(1));
        packer.append_sentinel();

        assert!(packer.get(&session).await.is_some());
        assert!(packer.get(&session).await.is_none());
    }

    #[tokio::test]
    async fn oversized_request_is_rejected() {
        let packer = MessagePacker::new();
        let session = session();
        let (state, mut rx) = RequestState::rpc(vec![0u8; MAX_PAYLOAD_LEN]);
        packer.append(state);
        packer.append(ping_state(1));

        let batch = packer.get(&session).await.unwrap();
        assert_eq!(batch.states.len(), 1, "only the ping survives");
        assert!(matches!(
            rx.try_recv().unwrap(),
            Err(RequestError::PayloadTooLarge)
        ));
    }

    #[tokio::test]
    async fn budget_splits_large_batches() {
        let packer = MessagePacker::new();
        let session = session();
        // Three thirds never fit in one batch once framing overhead is added.
        let third = MAX_PAYLOAD_LEN / 3;
        for _ in 0..3 {
            let (state, rx) = RequestState::rpc(vec![0u8; third]);
            drop(rx);
            packer.append(state);
        }

        let first = packer.get(&session).await.unwrap();
        let second = packer.get(&session).await.unwrap();
        assert_eq!(first.states.len(), 2);
        assert_eq!(second.states.len(), 1);
        assert!(first.data.len() <= MAX_PAYLOAD_LEN + 24);
    }

    #[tokio::test]
    async fn reject_all_fails_queued_requests() {
        let packer = MessagePacker::new();
        let (state, mut rx) = RequestState::rpc(vec![1, 2, 3]);
        packer.append(state);
        packer.reject_all();
        assert!(matches!(
            rx.try_recv().unwrap(),
            Err(RequestError::Disconnected)
        ));
    }
}
