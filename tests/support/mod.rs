use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tradestream_core::{Error, Frame, Transport};

/// In-process [`Transport`], grounded on `ethers-providers`'
/// `transports/mock.rs` (`MockProvider`): records every outbound frame and
/// lets the test push inbound ones on demand, with no real socket.
pub struct MockTransport {
    sent: Arc<Mutex<Vec<Value>>>,
    incoming: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
impl Transport for MockTransport {
    async fn send_text(&mut self, text: String) -> Result<(), Error> {
        let value: Value = serde_json::from_str(&text).expect("test always sends valid json");
        self.sent.lock().unwrap().push(value);
        Ok(())
    }

    async fn recv(&mut self) -> Result<Frame, Error> {
        match self.incoming.recv().await {
            Some(text) => Ok(Frame::Text(text)),
            None => Ok(Frame::Closed),
        }
    }

    async fn close(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

pub struct MockHandle {
    sent: Arc<Mutex<Vec<Value>>>,
    push: mpsc::UnboundedSender<String>,
}

impl MockHandle {
    pub fn sent_requests(&self) -> Vec<Value> {
        self.sent.lock().unwrap().clone()
    }

    pub fn push_response(&self, response: Value) {
        self.push.send(response.to_string()).expect("manager task still running");
    }

    /// Polls until at least `count` requests have been sent, or panics
    /// after a generous number of yields (the manager task runs on the
    /// same runtime, so this only ever waits out scheduling, not I/O).
    pub async fn wait_for_sent_count(&self, count: usize) {
        for _ in 0..1000 {
            if self.sent_requests().len() >= count {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("timed out waiting for {count} sent request(s); saw {:?}", self.sent_requests());
    }
}

/// Yields enough times to let the manager task and any spawned watcher
/// tasks drain their channels on a current-thread test runtime. There is
/// no I/O or timer involved in the paths this crate's tests exercise, so
/// a bounded number of cooperative yields is sufficient and deterministic.
pub async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

pub fn mock_pair() -> (MockTransport, MockHandle) {
    let (push_tx, push_rx) = mpsc::unbounded_channel();
    let sent = Arc::new(Mutex::new(Vec::new()));
    (MockTransport { sent: sent.clone(), incoming: push_rx }, MockHandle { sent, push: push_tx })
}
