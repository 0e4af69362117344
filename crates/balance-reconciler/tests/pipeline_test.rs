//! 分区消费单元 + 余额对账的端到端测试（无 broker）

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::channel::mpsc;
use futures::stream::BoxStream;
use parking_lot::Mutex;
use rust_decimal_macros::dec;
use tokio::sync::watch;

use balance_reconciler::{AccountStore, BalanceReconciler, InMemoryAccountStore};
use payment_shared::config::ReversalPolicy;
use payment_shared::error::Result;
use payment_shared::events::{
    AccountKind, PaymentEvent, PaymentEventType, PaymentStatus, PaymentType,
};
use payment_shared::kafka::{
    ConsumerMessage, DeadLetterSink, DispatchContext, PartitionControl, PartitionState,
    PartitionUnit, topics,
};
use payment_shared::retry::RetryPolicy;

type Feed = mpsc::UnboundedSender<(u64, ConsumerMessage)>;

/// 单分区日志：seek 时丢弃已预取的消息，从目标 offset 起重新投递
#[derive(Clone, Default)]
struct PartitionLog {
    log: Arc<Mutex<BTreeMap<i64, ConsumerMessage>>>,
    commits: Arc<Mutex<Vec<i64>>>,
    feed: Arc<Mutex<Option<Feed>>>,
    generation: Arc<AtomicU64>,
}

impl PartitionLog {
    fn subscribe(&self) -> BoxStream<'static, Result<ConsumerMessage>> {
        let (tx, rx) = mpsc::unbounded();
        *self.feed.lock() = Some(tx);
        let generation = self.generation.clone();
        rx.filter_map(move |(tag, msg)| {
            futures::future::ready((tag == generation.load(Ordering::SeqCst)).then_some(Ok(msg)))
        })
        .boxed()
    }

    fn append(&self, payload: Vec<u8>, key: Option<String>) {
        let offset = self.log.lock().len() as i64;
        let msg = ConsumerMessage {
            topic: topics::PAYMENTS.to_string(),
            partition: 0,
            offset,
            key,
            payload,
            timestamp: None,
            headers: HashMap::new(),
        };
        self.log.lock().insert(offset, msg.clone());
        self.deliver(msg);
    }

    fn append_event(&self, event: &PaymentEvent) {
        self.append(event.encode().unwrap(), Some(event.partition_key()));
    }

    fn deliver(&self, msg: ConsumerMessage) {
        if let Some(feed) = self.feed.lock().as_ref() {
            let _ = feed.unbounded_send((self.generation.load(Ordering::SeqCst), msg));
        }
    }

    fn commits(&self) -> Vec<i64> {
        self.commits.lock().clone()
    }
}

impl PartitionControl for PartitionLog {
    fn commit(&self, offset: i64) -> Result<()> {
        self.commits.lock().push(offset);
        Ok(())
    }

    fn seek(&self, offset: i64) -> Result<()> {
        self.generation.fetch_add(1, Ordering::SeqCst);
        let replay: Vec<_> = self
            .log
            .lock()
            .range(offset..)
            .map(|(_, m)| m.clone())
            .collect();
        for msg in replay {
            self.deliver(msg);
        }
        Ok(())
    }
}

#[derive(Default)]
struct CollectingDeadLetter {
    sent: Mutex<Vec<(i64, u32)>>,
}

#[async_trait]
impl DeadLetterSink for CollectingDeadLetter {
    async fn send(&self, message: &ConsumerMessage, _error: &str, redeliveries: u32) -> Result<()> {
        self.sent.lock().push((message.offset, redeliveries));
        Ok(())
    }
}

fn card_event(event_type: PaymentEventType, payment_id: i64, card_id: i64) -> PaymentEvent {
    PaymentEvent::new(
        event_type,
        payment_id,
        1,
        Some(card_id),
        dec!(50.00),
        PaymentType::Card,
        PaymentStatus::Pending,
        None,
    )
}

struct Harness {
    log: PartitionLog,
    store: Arc<InMemoryAccountStore>,
    dead_letter: Arc<CollectingDeadLetter>,
    shutdown: watch::Sender<bool>,
    unit: tokio::task::JoinHandle<PartitionState>,
}

fn start() -> Harness {
    let log = PartitionLog::default();
    let store = InMemoryAccountStore::new();
    store.open_account(AccountKind::Card, 7, dec!(500.00));
    let store = Arc::new(store);
    let dead_letter = Arc::new(CollectingDeadLetter::default());

    let ctx = DispatchContext {
        handler: Arc::new(BalanceReconciler::new(
            store.clone(),
            ReversalPolicy::Unconditional,
        )),
        dead_letter: dead_letter.clone(),
        redelivery: RetryPolicy::fixed(2, Duration::from_millis(100)),
    };

    let (shutdown, rx) = watch::channel(false);
    let unit = PartitionUnit::new(
        topics::PAYMENTS,
        0,
        log.subscribe(),
        log.clone(),
        ctx,
        rx,
    );

    Harness {
        log,
        store,
        dead_letter,
        shutdown,
        unit: tokio::spawn(unit.run()),
    }
}

impl Harness {
    async fn stop(self) -> PartitionState {
        self.shutdown.send(true).unwrap();
        self.unit.await.unwrap()
    }
}

#[tokio::test(start_paused = true)]
async fn test_partition_absorbs_duplicates_and_bad_messages() {
    let h = start();

    let created = card_event(PaymentEventType::Created, 1, 7);
    h.log.append_event(&created);
    h.log.append(b"{not json".to_vec(), None);
    h.log.append(
        br#"{"event_type":"PAYMENT_REFUNDED","payment_id":1}"#.to_vec(),
        Some("1".to_string()),
    );
    h.log.append_event(&created);
    h.log.append_event(&card_event(PaymentEventType::Cancelled, 1, 7));
    h.log.append_event(&card_event(PaymentEventType::Created, 2, 7));

    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(
        h.store.balance(AccountKind::Card, 7).await.unwrap(),
        Some(dec!(450.00))
    );
    assert_eq!(h.log.commits(), vec![0, 1, 2, 3, 4, 5]);
    assert!(h.dead_letter.sent.lock().is_empty());
    assert_eq!(h.stop().await, PartitionState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_unknown_account_is_redelivered_then_dead_lettered() {
    let h = start();

    // 卡 99 不存在：重投递两次后进入死信，后续消息照常处理
    h.log.append_event(&card_event(PaymentEventType::Created, 10, 99));
    h.log.append_event(&card_event(PaymentEventType::Created, 11, 7));

    tokio::time::sleep(Duration::from_secs(2)).await;

    assert_eq!(*h.dead_letter.sent.lock(), vec![(0, 2)]);
    assert_eq!(h.log.commits(), vec![0, 1]);
    assert_eq!(
        h.store.balance(AccountKind::Card, 7).await.unwrap(),
        Some(dec!(450.00))
    );
    assert!(!h.store.is_applied(10, PaymentEventType::Created));
    assert_eq!(h.stop().await, PartitionState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_account_opened_during_backoff_is_applied_on_redelivery() {
    let h = start();

    h.log.append_event(&card_event(PaymentEventType::Created, 20, 8));
    tokio::time::sleep(Duration::from_millis(10)).await;
    h.store.open_account(AccountKind::Card, 8, dec!(100.00));

    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(
        h.store.balance(AccountKind::Card, 8).await.unwrap(),
        Some(dec!(50.00))
    );
    assert_eq!(h.log.commits(), vec![0]);
    assert!(h.dead_letter.sent.lock().is_empty());
    h.stop().await;
}
