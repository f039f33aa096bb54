//! The frame classifier and subscription registry active while a
//! `Connection` is in `PubSub` state.
//!
//! Generalizes `client/subscriber.rs`'s synchronous "write one subscribe,
//! read one ack per channel" loop into an event-driven classifier so
//! server-pushed `message`/`pmessage` frames can interleave with
//! subscribe/unsubscribe acknowledgements on the same socket.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use crate::connection::frame::RespValue;
use crate::error::ConnectionError;
use crate::metrics::METRICS;

/// A message published on a subscribed channel.
#[derive(Clone, Debug)]
pub struct Message {
    pub channel: Bytes,
    pub payload: Bytes,
}

/// A message published on a channel matching a subscribed pattern.
#[derive(Clone, Debug)]
pub struct PatternMessage {
    pub pattern: Bytes,
    pub channel: Bytes,
    pub payload: Bytes,
}

/// `(target-name, current-subscription-count)` hook, invoked for both
/// `on_subscribe` and `on_unsubscribe`.
pub type SubHook = Arc<dyn Fn(&[u8], usize) + Send + Sync>;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AckKind {
    Subscribe,
    Unsubscribe,
    PSubscribe,
    PUnsubscribe,
}

impl AckKind {
    fn is_pattern(self) -> bool {
        matches!(self, AckKind::PSubscribe | AckKind::PUnsubscribe)
    }

    fn is_subscribe(self) -> bool {
        matches!(self, AckKind::Subscribe | AckKind::PSubscribe)
    }
}

/// The result of classifying one inbound frame while in `PubSub` state.
pub enum Classified {
    Ack {
        kind: AckKind,
        target: Option<Bytes>,
        count: i64,
    },
    Message(Message),
    PMessage(PatternMessage),
}

/// Inspects an inbound frame against the pub/sub control-frame shapes. Returns `None` for
/// anything that isn't a recognized pub/sub control or push frame (a `PING`
/// reply, for instance) — those fall through to the ordinary command
/// correlator.
pub fn classify(frame: &RespValue) -> Option<Classified> {
    let items = frame.as_array()?;
    let (first, rest) = items.split_first()?;
    let kind_word = first.as_bytes()?;

    match kind_word {
        b"subscribe" | b"unsubscribe" | b"psubscribe" | b"punsubscribe" => {
            let kind = match kind_word {
                b"subscribe" => AckKind::Subscribe,
                b"unsubscribe" => AckKind::Unsubscribe,
                b"psubscribe" => AckKind::PSubscribe,
                _ => AckKind::PUnsubscribe,
            };
            let target = rest.first().and_then(|v| match v {
                RespValue::BulkString(Some(b)) => Some(b.clone()),
                _ => None,
            });
            let count = match rest.get(1) {
                Some(RespValue::Integer(n)) => *n,
                _ => 0,
            };
            Some(Classified::Ack { kind, target, count })
        }
        b"message" => {
            let channel = rest.first()?.as_bytes()?.to_vec().into();
            let payload = match rest.get(1)? {
                RespValue::BulkString(Some(b)) => b.clone(),
                RespValue::SimpleString(b) => b.clone(),
                _ => return None,
            };
            Some(Classified::Message(Message { channel, payload }))
        }
        b"pmessage" => {
            let pattern = rest.first()?.as_bytes()?.to_vec().into();
            let channel = rest.get(1)?.as_bytes()?.to_vec().into();
            let payload = match rest.get(2)? {
                RespValue::BulkString(Some(b)) => b.clone(),
                RespValue::SimpleString(b) => b.clone(),
                _ => return None,
            };
            Some(Classified::PMessage(PatternMessage {
                pattern,
                channel,
                payload,
            }))
        }
        _ => None,
    }
}

struct PendingCall {
    remaining: usize,
    done: oneshot::Sender<Result<(), ConnectionError>>,
}

/// Owns the channel/pattern subscription registry and the bookkeeping for
/// in-flight subscribe/unsubscribe calls. Lives inside the connection's
/// event-loop task for as long as `ConnectionState::PubSub` is current —
/// one dispatcher per subscribed period, torn down once subscriptions drop to zero.
#[derive(Default)]
pub struct PubSubDispatcher {
    channels: HashMap<Bytes, mpsc::UnboundedSender<Message>>,
    patterns: HashMap<Bytes, mpsc::UnboundedSender<PatternMessage>>,
    ack_queue: VecDeque<u64>,
    calls: HashMap<u64, PendingCall>,
    next_call_id: u64,
    on_subscribe: Option<SubHook>,
    on_unsubscribe: Option<SubHook>,
}

impl PubSubDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the unsubscribe hook up front, as `subscribe`/`psubscribe`
    /// accept both hooks at once rather than waiting for the first
    /// `unsubscribe` call to supply one.
    pub fn set_on_unsubscribe(&mut self, hook: Option<SubHook>) {
        if let Some(hook) = hook {
            self.on_unsubscribe = Some(hook);
        }
    }

    pub fn total_subscriptions(&self) -> usize {
        self.channels.len() + self.patterns.len()
    }

    fn sync_gauges(&self) {
        METRICS.channel_subscriptions_set(self.channels.len() as i64);
        METRICS.pattern_subscriptions_set(self.patterns.len() as i64);
    }

    /// Registers `receiver` against every channel in `targets` and records
    /// that `targets.len()` acknowledgements are owed before `done` resolves.
    /// Called before the `SUBSCRIBE` frame is written so a push message
    /// arriving immediately after the ack routes correctly.
    pub fn begin_subscribe(
        &mut self,
        targets: &[Bytes],
        receiver: mpsc::UnboundedSender<Message>,
        on_subscribe: Option<SubHook>,
        done: oneshot::Sender<Result<(), ConnectionError>>,
    ) {
        if let Some(hook) = on_subscribe {
            self.on_subscribe = Some(hook);
        }
        for target in targets {
            self.channels.insert(target.clone(), receiver.clone());
        }
        self.sync_gauges();
        self.begin_call(targets.len(), done);
    }

    pub fn begin_psubscribe(
        &mut self,
        targets: &[Bytes],
        receiver: mpsc::UnboundedSender<PatternMessage>,
        on_subscribe: Option<SubHook>,
        done: oneshot::Sender<Result<(), ConnectionError>>,
    ) {
        if let Some(hook) = on_subscribe {
            self.on_subscribe = Some(hook);
        }
        for target in targets {
            self.patterns.insert(target.clone(), receiver.clone());
        }
        self.sync_gauges();
        self.begin_call(targets.len(), done);
    }

    /// `targets` empty means "unsubscribe from all": `count` owed acks is
    /// however many the server will actually send (at least one, even with
    /// zero active subscriptions). The registry itself is left untouched
    /// here — each target is removed only once its own ack arrives (see
    /// `on_ack`), so a multi-target call can't report the dispatcher "empty"
    /// on its first ack while later targets in the same call are still
    /// outstanding.
    pub fn begin_unsubscribe(
        &mut self,
        targets: &[Bytes],
        on_unsubscribe: Option<SubHook>,
        done: oneshot::Sender<Result<(), ConnectionError>>,
    ) {
        if let Some(hook) = on_unsubscribe {
            self.on_unsubscribe = Some(hook);
        }
        let owed = if targets.is_empty() {
            self.channels.len()
        } else {
            targets.len()
        };
        self.begin_call(owed, done);
    }

    pub fn begin_punsubscribe(
        &mut self,
        targets: &[Bytes],
        on_unsubscribe: Option<SubHook>,
        done: oneshot::Sender<Result<(), ConnectionError>>,
    ) {
        if let Some(hook) = on_unsubscribe {
            self.on_unsubscribe = Some(hook);
        }
        let owed = if targets.is_empty() {
            self.patterns.len()
        } else {
            targets.len()
        };
        self.begin_call(owed, done);
    }

    fn begin_call(&mut self, num_acks: usize, done: oneshot::Sender<Result<(), ConnectionError>>) {
        let id = self.next_call_id;
        self.next_call_id += 1;
        self.calls.insert(
            id,
            PendingCall {
                remaining: num_acks.max(1),
                done,
            },
        );
        for _ in 0..num_acks.max(1) {
            self.ack_queue.push_back(id);
        }
    }

    /// Feeds one acknowledgement frame into the dispatcher. For an
    /// unsubscribe-family ack, the acked target (if any) is removed from the
    /// registry *now* — at ack arrival, not at call submission — so a
    /// multi-target call's registry shrinks one entry at a time, in step
    /// with the acks actually received. Returns `true` once the ack's own
    /// `count` field (the server's authoritative total, per spec.md §4.4)
    /// reaches zero for an unsubscribe-family ack — the caller's signal to
    /// leave `PubSub` and return to `Open`. Using the server-reported count
    /// rather than local registry size means a multi-target call's earlier
    /// acks (which still report a nonzero count) never trigger this
    /// prematurely, even though this dispatcher's own bookkeeping for the
    /// call as a whole isn't complete until every target's ack has arrived.
    pub fn on_ack(&mut self, kind: AckKind, target: Option<Bytes>, count: i64) -> bool {
        if !kind.is_subscribe() {
            if let Some(target) = target.as_ref() {
                if kind.is_pattern() {
                    self.patterns.remove(target);
                } else {
                    self.channels.remove(target);
                }
                self.sync_gauges();
            }
        }

        let hook = if kind.is_subscribe() {
            self.on_subscribe.clone()
        } else {
            self.on_unsubscribe.clone()
        };
        if let (Some(hook), Some(target)) = (hook, target.as_ref()) {
            hook(target, count.max(0) as usize);
        }

        if let Some(id) = self.ack_queue.pop_front() {
            if let Some(call) = self.calls.get_mut(&id) {
                call.remaining = call.remaining.saturating_sub(1);
                if call.remaining == 0 {
                    if let Some(call) = self.calls.remove(&id) {
                        let _ = call.done.send(Ok(()));
                    }
                }
            }
        }

        !kind.is_subscribe() && count <= 0
    }

    /// Routes a server-pushed `message` frame. Drops silently if the channel
    /// was unsubscribed while the message was already in flight.
    pub fn route_message(&mut self, message: Message) {
        METRICS.subscription_message_received();
        if let Some(sender) = self.channels.get(&message.channel) {
            let _ = sender.send(message);
        }
    }

    /// Routes a server-pushed `pmessage` frame.
    pub fn route_pmessage(&mut self, message: PatternMessage) {
        METRICS.subscription_message_received();
        if let Some(sender) = self.patterns.get(&message.pattern) {
            let _ = sender.send(message);
        }
    }

    /// Fails every outstanding subscribe/unsubscribe call — used when the
    /// transport closes with pub/sub calls still in flight.
    pub fn fail_all_pending(&mut self, err: impl Fn() -> ConnectionError) {
        for (_, call) in self.calls.drain() {
            let _ = call.done.send(Err(err()));
        }
        self.ack_queue.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn classifies_subscribe_ack() {
        let frame = RespValue::Array(Some(vec![
            RespValue::BulkString(Some(Bytes::from_static(b"subscribe"))),
            RespValue::BulkString(Some(Bytes::from_static(b"news"))),
            RespValue::Integer(1),
        ]));
        match classify(&frame) {
            Some(Classified::Ack { kind, target, count }) => {
                assert_eq!(kind, AckKind::Subscribe);
                assert_eq!(target.unwrap(), Bytes::from_static(b"news"));
                assert_eq!(count, 1);
            }
            _ => panic!("expected ack"),
        }
    }

    #[test]
    fn classifies_message() {
        let frame = RespValue::Array(Some(vec![
            RespValue::BulkString(Some(Bytes::from_static(b"message"))),
            RespValue::BulkString(Some(Bytes::from_static(b"news"))),
            RespValue::BulkString(Some(Bytes::from_static(b"hello"))),
        ]));
        match classify(&frame) {
            Some(Classified::Message(m)) => {
                assert_eq!(m.channel, Bytes::from_static(b"news"));
                assert_eq!(m.payload, Bytes::from_static(b"hello"));
            }
            _ => panic!("expected message"),
        }
    }

    #[test]
    fn classifies_pmessage() {
        let frame = RespValue::Array(Some(vec![
            RespValue::BulkString(Some(Bytes::from_static(b"pmessage"))),
            RespValue::BulkString(Some(Bytes::from_static(b"news.*"))),
            RespValue::BulkString(Some(Bytes::from_static(b"news.sports"))),
            RespValue::BulkString(Some(Bytes::from_static(b"goal"))),
        ]));
        match classify(&frame) {
            Some(Classified::PMessage(m)) => {
                assert_eq!(m.pattern, Bytes::from_static(b"news.*"));
                assert_eq!(m.channel, Bytes::from_static(b"news.sports"));
                assert_eq!(m.payload, Bytes::from_static(b"goal"));
            }
            _ => panic!("expected pmessage"),
        }
    }

    #[test]
    fn non_pubsub_frame_is_not_classified() {
        let frame = RespValue::SimpleString(Bytes::from_static(b"PONG"));
        assert!(classify(&frame).is_none());
    }

    #[test]
    fn subscribe_call_completes_once_every_target_acks() {
        let mut dispatcher = PubSubDispatcher::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let (done_tx, mut done_rx) = oneshot::channel();
        dispatcher.begin_subscribe(
            &[Bytes::from_static(b"a"), Bytes::from_static(b"b")],
            tx,
            None,
            done_tx,
        );
        assert!(!dispatcher.on_ack(AckKind::Subscribe, Some(Bytes::from_static(b"a")), 1));
        assert!(done_rx.try_recv().is_err());
        dispatcher.on_ack(AckKind::Subscribe, Some(Bytes::from_static(b"b")), 2);
        assert!(done_rx.try_recv().unwrap().is_ok());
        assert_eq!(dispatcher.total_subscriptions(), 2);
    }

    #[test]
    fn unsubscribing_last_channel_reports_empty() {
        let mut dispatcher = PubSubDispatcher::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let (done_tx, _done_rx) = oneshot::channel();
        dispatcher.begin_subscribe(&[Bytes::from_static(b"a")], tx, None, done_tx);
        let (udone_tx, _udone_rx) = oneshot::channel();
        dispatcher.begin_unsubscribe(&[Bytes::from_static(b"a")], None, udone_tx);
        let now_empty = dispatcher.on_ack(AckKind::Unsubscribe, Some(Bytes::from_static(b"a")), 0);
        assert!(now_empty);
    }

    /// A single `unsubscribe(["a", "b"])` call's *first* ack reports the
    /// server's count for the targets still subscribed (1, since "b" hasn't
    /// acked yet) — the dispatcher must not report "empty" until the second
    /// ack reports 0, and the call's own `done` promise must not resolve
    /// until both acks have arrived.
    #[test]
    fn multi_target_unsubscribe_only_reports_empty_on_the_final_ack() {
        let mut dispatcher = PubSubDispatcher::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let (sub_done, _sub_rx) = oneshot::channel();
        dispatcher.begin_subscribe(
            &[Bytes::from_static(b"a"), Bytes::from_static(b"b")],
            tx,
            None,
            sub_done,
        );
        dispatcher.on_ack(AckKind::Subscribe, Some(Bytes::from_static(b"a")), 1);
        dispatcher.on_ack(AckKind::Subscribe, Some(Bytes::from_static(b"b")), 2);
        assert_eq!(dispatcher.total_subscriptions(), 2);

        let (done_tx, mut done_rx) = oneshot::channel();
        dispatcher.begin_unsubscribe(
            &[Bytes::from_static(b"a"), Bytes::from_static(b"b")],
            None,
            done_tx,
        );

        let now_empty_after_first =
            dispatcher.on_ack(AckKind::Unsubscribe, Some(Bytes::from_static(b"a")), 1);
        assert!(
            !now_empty_after_first,
            "first ack still reports one subscription remaining"
        );
        assert!(
            done_rx.try_recv().is_err(),
            "call isn't satisfied until both targets have acked"
        );
        assert_eq!(
            dispatcher.total_subscriptions(),
            1,
            "only the acked target is removed from the registry"
        );

        let now_empty_after_second =
            dispatcher.on_ack(AckKind::Unsubscribe, Some(Bytes::from_static(b"b")), 0);
        assert!(now_empty_after_second);
        assert!(done_rx.try_recv().unwrap().is_ok());
        assert_eq!(dispatcher.total_subscriptions(), 0);
    }
}
