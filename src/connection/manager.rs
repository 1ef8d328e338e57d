use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::mpsc;

use crate::deferred::DeferredFuture;
use crate::error::{Error, ResponseError, SanityError};
use crate::fingerprint::Fingerprint;
use crate::multicast::MulticastChannel;

use super::subscription::{self, BuyContract};
use super::types::{Event, Forgetter, Frame, Instruction, Transport};

#[derive(Debug, Clone)]
enum PendingKind {
    OneShot,
    Subscription { fp: Fingerprint },
}

#[derive(Clone)]
struct PendingEntry {
    channel: MulticastChannel<Value>,
    kind: PendingKind,
}

/// Owns every piece of mutable state spec.md §3/§5 describes (`PendingTable`,
/// `ExpectationTable`, and the whole `SubscriptionManager` state) behind one
/// task reachable only through [`Instruction`]s — the "single serializing
/// task" spec.md §5 requires, grounded on `ethers-providers`'
/// `RequestManager::spawn`. C7 (connection/dispatch) and C8 (subscription
/// manager) are merged here rather than split into two tasks: both need to
/// see the same pending/subscription state on every incoming frame, and a
/// single task gives that for free without extra synchronisation.
pub struct Manager {
    next_req_id: u64,
    connected: DeferredFuture<()>,
    transport: Box<dyn Transport>,
    transport_owned: bool,

    pending: HashMap<u64, PendingEntry>,
    expectations: HashMap<String, DeferredFuture<Value>>,

    sources: HashMap<Fingerprint, MulticastChannel<Value>>,
    orig_sources: HashMap<Fingerprint, MulticastChannel<Value>>,
    sub_id_to_key: HashMap<String, Fingerprint>,
    key_to_sub_id: HashMap<Fingerprint, String>,
    buy_key_to_contract: HashMap<Fingerprint, BuyContract>,
    subs_per_msg_type: HashMap<String, Vec<Fingerprint>>,
    forgetters: HashMap<Fingerprint, Forgetter>,

    event_bus: MulticastChannel<Event>,
    sanity_errors: MulticastChannel<SanityError>,

    self_sender: mpsc::UnboundedSender<Instruction>,
    instructions: mpsc::UnboundedReceiver<Instruction>,
}

impl Manager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        transport: Box<dyn Transport>,
        transport_owned: bool,
        connected: DeferredFuture<()>,
        event_bus: MulticastChannel<Event>,
        sanity_errors: MulticastChannel<SanityError>,
        self_sender: mpsc::UnboundedSender<Instruction>,
        instructions: mpsc::UnboundedReceiver<Instruction>,
    ) -> Self {
        Manager {
            next_req_id: 1,
            connected,
            transport,
            transport_owned,
            pending: HashMap::new(),
            expectations: HashMap::new(),
            sources: HashMap::new(),
            orig_sources: HashMap::new(),
            sub_id_to_key: HashMap::new(),
            key_to_sub_id: HashMap::new(),
            buy_key_to_contract: HashMap::new(),
            subs_per_msg_type: HashMap::new(),
            forgetters: HashMap::new(),
            event_bus,
            sanity_errors,
            self_sender,
            instructions,
        }
    }

    fn next_req_id(&mut self) -> u64 {
        let id = self.next_req_id;
        self.next_req_id += 1;
        id
    }

    /// Runs until the transport closes or every `ConnectionCore` handle
    /// referencing this manager has been dropped (the instruction channel
    /// closes). Grounded on `ethers-providers`' `RequestManager::spawn`
    /// `select_biased!` loop: frames are always drained before new
    /// instructions, so a response can never be "lost" behind a backlog of
    /// caller requests.
    pub async fn run(mut self) {
        let _ = self.connected.resolve(());
        self.event_bus.next(Event::Connect);

        loop {
            tokio::select! {
                biased;
                frame = self.transport.recv() => {
                    match frame {
                        Ok(Frame::Text(text)) => self.handle_frame(text),
                        Ok(Frame::Closed) => {
                            let _ = self.connected.reject(Error::ConnectionClosed);
                            self.sanity_errors.next(SanityError::Direct(Error::ConnectionClosed));
                            break;
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "read error on connection");
                            self.sanity_errors.next(SanityError::Direct(e));
                        }
                    }
                }
                instruction = self.instructions.recv() => {
                    match instruction {
                        Some(instr) => self.handle_instruction(instr).await,
                        None => break,
                    }
                }
            }
        }
    }

    #[tracing::instrument(skip(self, text))]
    fn handle_frame(&mut self, text: String) {
        tracing::trace!(text, "received frame");
        let response: Value = match serde_json::from_str(&text) {
            Ok(v) => v,
            Err(e) => {
                self.sanity_errors.next(SanityError::Direct(e.into()));
                return;
            }
        };
        self.event_bus.next(Event::Message(response.clone()));

        let Some(req_id) = response.get("req_id").and_then(Value::as_u64) else {
            self.sanity_errors.next(SanityError::Direct(Error::Api("Extra response".into())));
            return;
        };
        let Some((channel, kind)) = self.pending.get(&req_id).map(|e| (e.channel.clone(), e.kind.clone())) else {
            self.sanity_errors.next(SanityError::Direct(Error::Api("Extra response".into())));
            return;
        };

        if let Some(msg_type) = response.get("msg_type").and_then(Value::as_str) {
            if let Some(expectation) = self.expectations.get(msg_type) {
                if expectation.is_pending() {
                    let _ = expectation.resolve(response.clone());
                }
            }
        }

        let echo_req = response.get("echo_req").cloned().unwrap_or(Value::Null);
        let is_parent_poc = subscription::is_parent_poc_subscription(&echo_req);

        if response.get("error").is_some() && !is_parent_poc {
            let err = ResponseError::from_response(&response)
                .map(Error::Response)
                .unwrap_or_else(|| Error::Api("malformed error response".into()));
            channel.error(err);
            self.pending.remove(&req_id);
            return;
        }

        if channel.is_stopped() {
            if let Some(sub_id) = response.get("subscription").and_then(|s| s.get("id")).and_then(Value::as_str) {
                if let PendingKind::Subscription { fp } = &kind {
                    if let Some(forgetter) = self.forgetters.get(fp).cloned() {
                        forgetter(sub_id.to_owned());
                    }
                }
            }
            self.pending.remove(&req_id);
            return;
        }

        channel.next(response);
        if matches!(kind, PendingKind::OneShot) {
            self.pending.remove(&req_id);
            channel.complete();
            channel.dispose();
        }
    }

    async fn handle_instruction(&mut self, instruction: Instruction) {
        match instruction {
            Instruction::SendAndGetSource { request, respond_to } => {
                let channel = MulticastChannel::new();
                let channel = self.dispatch(request, channel, PendingKind::OneShot).await;
                let _ = respond_to.send(Ok(channel));
            }
            Instruction::Subscribe { request, forgetter, respond_to } => {
                let result = self.handle_subscribe(request, forgetter).await;
                let _ = respond_to.send(result);
            }
            Instruction::ForgetLocal { sub_id, respond_to } => {
                self.complete_subs_by_ids(&sub_id);
                let _ = respond_to.send(());
            }
            Instruction::ForgetAllLocal { types, respond_to } => {
                for t in types {
                    let snapshot = self.subs_per_msg_type.get(&t).cloned().unwrap_or_default();
                    for fp in snapshot {
                        self.complete_subs_by_key(&fp);
                    }
                    self.subs_per_msg_type.insert(t, Vec::new());
                }
                let _ = respond_to.send(());
            }
            Instruction::ExpectResponse { types, respond_to } => {
                let mut out = Vec::with_capacity(types.len());
                for t in types {
                    let is_new = !self.expectations.contains_key(&t);
                    let fut = self.expectations.entry(t.clone()).or_insert_with(DeferredFuture::new).clone();
                    out.push((t, fut, is_new));
                }
                let _ = respond_to.send(out);
            }
            Instruction::DeleteFromExpectResponse { msg_type } => {
                let settled = self.expectations.get(&msg_type).map(|f| !f.is_pending()).unwrap_or(false);
                if settled {
                    self.expectations.remove(&msg_type);
                }
            }
            Instruction::SubscriptionSettled { fp, had_buy_key, result } => {
                self.handle_subscription_settled(fp, had_buy_key, result);
            }
            Instruction::ConsumerCountZero { fp } => {
                self.handle_consumer_zero(fp);
            }
            Instruction::Disconnect { respond_to } => {
                if self.connected.is_resolved() {
                    let _ = self.connected.reject(Error::ConnectionClosed);
                    self.event_bus.next(Event::Close);
                    if self.transport_owned {
                        if let Err(e) = self.transport.close().await {
                            tracing::warn!(error = %e, "error closing owned transport");
                        }
                    }
                }
                let _ = respond_to.send(());
            }
        }
    }

    /// Registers `channel` in the pending table under a freshly assigned
    /// `req_id` and writes the request. Shared by the plain one-shot path
    /// and by subscription creation (spec.md §4.5's `sendAndGetSource`).
    async fn dispatch(&mut self, mut request: Value, channel: MulticastChannel<Value>, kind: PendingKind) -> MulticastChannel<Value> {
        let req_id = self.next_req_id();
        if let Value::Object(map) = &mut request {
            map.insert("req_id".to_owned(), serde_json::json!(req_id));
        }
        self.pending.insert(req_id, PendingEntry { channel: channel.clone(), kind });

        if self.connected.is_rejected() {
            channel.error(Error::ConnectionClosed);
            return channel;
        }
        match serde_json::to_string(&request) {
            Ok(text) => {
                if let Err(e) = self.transport.send_text(text).await {
                    channel.error(e);
                }
            }
            Err(e) => channel.error(e.into()),
        }
        channel
    }

    async fn handle_subscribe(&mut self, request: Value, forgetter: Forgetter) -> Result<MulticastChannel<Value>, Error> {
        let Some(msg_type) = subscription::msg_type(&request) else {
            return Err(Error::Api("Subscription type is not found in deriv-api".into()));
        };
        let fp = Fingerprint::of(&request);

        if let Some(existing) = self.sources.get(&fp) {
            return Ok(existing.clone());
        }

        if let Some(contract_id) = request.get("contract_id") {
            let alias = self
                .buy_key_to_contract
                .values()
                .find(|b| &b.contract_id == contract_id)
                .map(|b| b.buy_key.clone());
            if let Some(buy_key) = alias {
                if let Some(existing) = self.sources.get(&buy_key) {
                    return Ok(existing.clone());
                }
            }
        }

        let mut new_request = request.clone();
        if let Value::Object(map) = &mut new_request {
            map.insert("subscribe".to_owned(), serde_json::json!(1));
        }
        let had_buy_key = request.get("buy").is_some();

        let fp_for_hook = fp.clone();
        let self_sender = self.self_sender.clone();
        let channel = MulticastChannel::with_on_finally(move || {
            let _ = self_sender.send(Instruction::ConsumerCountZero { fp: fp_for_hook.clone() });
        });

        self.sources.insert(fp.clone(), channel.clone());
        self.orig_sources.insert(fp.clone(), channel.clone());
        self.subs_per_msg_type.entry(msg_type.to_owned()).or_default().push(fp.clone());
        self.forgetters.insert(fp.clone(), forgetter);

        // Watch (not subscribe-as-a-consumer) before dispatching, so this
        // cannot miss the first emission: nothing can read a frame until
        // this whole instruction handler returns (single-task model). Using
        // the real refcounted `subscribe()` here would make the watcher
        // itself look like a consumer, firing `on_finally` the moment it
        // observes the first emission even though no real consumer has
        // subscribed yet.
        let mut watcher = channel.watch();
        let channel = self.dispatch(new_request, channel, PendingKind::Subscription { fp: fp.clone() }).await;

        let settle_sender = self.self_sender.clone();
        let settle_fp = fp;
        tokio::spawn(async move {
            use crate::multicast::Emission;
            let result = match watcher.next_emission().await {
                Some(Emission::Next(v)) => Ok(v),
                Some(Emission::Error(e)) => Err(e),
                Some(Emission::Complete) | None => {
                    Err(Error::Cancelled("subscription completed before first emission".into()))
                }
            };
            let _ = settle_sender.send(Instruction::SubscriptionSettled { fp: settle_fp, had_buy_key, result });
        });

        Ok(channel)
    }

    fn handle_subscription_settled(&mut self, fp: Fingerprint, had_buy_key: bool, result: Result<Value, Error>) {
        match result {
            Ok(response) => {
                if had_buy_key {
                    if let Some(contract_id) = response.get("buy").and_then(|b| b.get("contract_id")).cloned() {
                        self.buy_key_to_contract.insert(fp.clone(), BuyContract { contract_id, buy_key: fp.clone() });
                    }
                }
                self.save_subs_id(fp, response.get("subscription").cloned());
            }
            Err(_) => self.complete_subs_by_key(&fp),
        }
    }

    fn save_subs_id(&mut self, fp: Fingerprint, subscription: Option<Value>) {
        let id = subscription.as_ref().and_then(|s| s.get("id")).and_then(Value::as_str).map(str::to_owned);
        match id {
            None => self.complete_subs_by_key(&fp),
            Some(id) => {
                if !self.sub_id_to_key.contains_key(&id) {
                    self.sub_id_to_key.insert(id.clone(), fp.clone());
                    self.key_to_sub_id.insert(fp, id);
                }
            }
        }
    }

    fn handle_consumer_zero(&mut self, fp: Fingerprint) {
        if let Some(sub_id) = self.key_to_sub_id.get(&fp).cloned() {
            if let Some(forgetter) = self.forgetters.get(&fp).cloned() {
                forgetter(sub_id);
            }
        }
    }

    fn complete_subs_by_ids(&mut self, sub_id: &str) {
        if let Some(fp) = self.sub_id_to_key.get(sub_id).cloned() {
            self.complete_subs_by_key(&fp);
        }
    }

    /// Idempotent-safe teardown of a subscription source (spec.md §4.6).
    /// Clears the `buy_key_to_contract` alias unconditionally when the
    /// completed fingerprint is itself a recorded buy key — keyed directly
    /// off the buy's own fingerprint, which is what closes the dead branch
    /// spec.md §9 flags (no alias ever escapes teardown).
    fn complete_subs_by_key(&mut self, fp: &Fingerprint) {
        let Some(channel) = self.sources.remove(fp) else {
            return;
        };
        self.orig_sources.remove(fp);
        if let Some(sub_id) = self.key_to_sub_id.remove(fp) {
            self.sub_id_to_key.remove(&sub_id);
        }
        self.buy_key_to_contract.remove(fp);
        self.forgetters.remove(fp);
        for list in self.subs_per_msg_type.values_mut() {
            list.retain(|k| k != fp);
        }
        channel.complete();
        channel.dispose();
    }
}
