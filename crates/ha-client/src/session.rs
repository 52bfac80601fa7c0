//! One authenticated connection and its request bookkeeping
//!
//! A session owns the message-ID counter and the table of in-flight
//! requests. Both die with the connection: a replacement session starts
//! counting from 1 again and never sees responses meant for its
//! predecessor.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use ha_core::{RemoteError, RemoteResult};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, trace};

use crate::types::Request;

type Responder = oneshot::Sender<RemoteResult<Value>>;

struct SessionState {
    next_id: u64,
    pending: HashMap<u64, Responder>,
    outbound: Option<mpsc::UnboundedSender<Message>>,
}

pub(crate) struct Session {
    generation: u64,
    request_timeout: Duration,
    state: Mutex<SessionState>,
    closed: watch::Sender<bool>,
}

impl Session {
    pub fn new(
        generation: u64,
        outbound: mpsc::UnboundedSender<Message>,
        request_timeout: Duration,
    ) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            generation,
            request_timeout,
            state: Mutex::new(SessionState {
                next_id: 1,
                pending: HashMap::new(),
                outbound: Some(outbound),
            }),
            closed,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Receiver that flips to true when the session is torn down
    pub fn closed_signal(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }

    /// Send a request and wait for its correlated response
    ///
    /// ID assignment and enqueueing happen under one lock so IDs reach the
    /// wire in increasing order.
    pub async fn request(&self, request: &Request) -> RemoteResult<Value> {
        let (id, rx) = {
            let mut state = self.lock();
            let Some(outbound) = state.outbound.clone() else {
                return Err(RemoteError::Connection("session closed".to_string()));
            };

            let id = state.next_id;
            let frame = request.to_frame(id)?;
            state.next_id += 1;

            let (tx, rx) = oneshot::channel();
            if outbound.send(Message::Text(frame)).is_err() {
                return Err(RemoteError::Connection("writer stopped".to_string()));
            }
            state.pending.insert(id, tx);
            (id, rx)
        };

        trace!(generation = self.generation, id, kind = request.kind(), "Request sent");

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RemoteError::Connection(
                "session ended before response".to_string(),
            )),
            Err(_) => {
                self.lock().pending.remove(&id);
                debug!(generation = self.generation, id, kind = request.kind(), "Request timed out");
                Err(RemoteError::RequestTimeout {
                    id,
                    timeout: self.request_timeout,
                })
            }
        }
    }

    /// Deliver a response; false if nothing was waiting on that ID
    pub fn resolve(&self, id: u64, result: RemoteResult<Value>) -> bool {
        let responder = self.lock().pending.remove(&id);
        match responder {
            Some(tx) => {
                let _ = tx.send(result);
                true
            }
            None => false,
        }
    }

    /// Tear down: fail every in-flight request and release the writer
    ///
    /// Returns the number of requests that were failed. Idempotent.
    pub fn close(&self) -> usize {
        let drained: Vec<Responder> = {
            let mut state = self.lock();
            state.outbound = None;
            state.pending.drain().map(|(_, tx)| tx).collect()
        };
        self.closed.send_replace(true);

        let failed = drained.len();
        for tx in drained {
            let _ = tx.send(Err(RemoteError::Connection(
                "connection lost with request in flight".to_string(),
            )));
        }
        failed
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn frame_id(msg: Message) -> u64 {
        let Message::Text(text) = msg else {
            panic!("expected text frame");
        };
        let value: Value = serde_json::from_str(&text).unwrap();
        value["id"].as_u64().unwrap()
    }

    #[tokio::test]
    async fn test_ids_start_at_one_and_increase() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = Arc::new(Session::new(1, tx, Duration::from_secs(1)));

        let s = session.clone();
        let first = tokio::spawn(async move { s.request(&Request::GetStates).await });
        assert_eq!(frame_id(rx.recv().await.unwrap()), 1);

        let s = session.clone();
        let second = tokio::spawn(async move { s.request(&Request::Ping).await });
        assert_eq!(frame_id(rx.recv().await.unwrap()), 2);

        assert!(session.resolve(2, Ok(Value::Null)));
        assert!(session.resolve(1, Ok(Value::from(7))));
        assert_eq!(second.await.unwrap(), Ok(Value::Null));
        assert_eq!(first.await.unwrap(), Ok(Value::from(7)));
    }

    #[tokio::test]
    async fn test_unknown_id_is_not_resolved() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let session = Session::new(1, tx, Duration::from_secs(1));
        assert!(!session.resolve(42, Ok(Value::Null)));
    }

    #[tokio::test]
    async fn test_timeout_reports_request_id() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let session = Session::new(1, tx, Duration::from_millis(20));
        let result = session.request(&Request::Ping).await;
        assert_eq!(
            result,
            Err(RemoteError::RequestTimeout {
                id: 1,
                timeout: Duration::from_millis(20)
            })
        );
        // The late response finds nothing to deliver to
        assert!(!session.resolve(1, Ok(Value::Null)));
    }

    #[tokio::test]
    async fn test_close_fails_in_flight_requests() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = Arc::new(Session::new(3, tx, Duration::from_secs(5)));

        let s = session.clone();
        let pending = tokio::spawn(async move { s.request(&Request::GetStates).await });
        rx.recv().await.unwrap();

        assert_eq!(session.close(), 1);
        assert!(session.is_closed());
        assert!(matches!(
            pending.await.unwrap(),
            Err(RemoteError::Connection(_))
        ));

        // Writer channel is released and new requests are refused
        assert!(rx.recv().await.is_none());
        assert!(matches!(
            session.request(&Request::Ping).await,
            Err(RemoteError::Connection(_))
        ));
        assert_eq!(session.close(), 0);
    }
}
