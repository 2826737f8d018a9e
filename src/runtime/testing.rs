//! Mock implementations for testing
//!
//! These mocks enable integration testing without real I/O.

use super::traits::*;
use super::{BotRuntime, Services};
use crate::images::ImagePipeline;
use crate::llm::{EditDecision, GatewayError, Intent, LlmError, Review};
use crate::state_machine::{AttachmentRef, BotContext, ButtonAction, Event, InboundMessage, Outbound};
use crate::store::{DatedFile, StoreError};
use crate::transport::TransportError;
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, TimeDelta, Utc};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

// ============================================================================
// Mock Gateway
// ============================================================================

/// A recorded gateway call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayCall {
    Classify {
        text: String,
        prior_turn: Option<String>,
    },
    Review {
        text: String,
    },
    Craft {
        topic: String,
    },
    ExecuteEdit {
        instruction: String,
        date_keys: Vec<String>,
        image_ref: Option<String>,
        today: String,
    },
}

/// Gateway that returns queued responses; an empty queue yields a network error
#[derive(Default)]
pub struct MockGateway {
    intents: Mutex<VecDeque<Result<Intent, GatewayError>>>,
    reviews: Mutex<VecDeque<Result<Review, GatewayError>>>,
    crafts: Mutex<VecDeque<Result<String, GatewayError>>>,
    edits: Mutex<VecDeque<Result<EditDecision, GatewayError>>>,
    calls: Mutex<Vec<GatewayCall>>,
}

fn pop_or_unavailable<T>(queue: &Mutex<VecDeque<Result<T, GatewayError>>>) -> Result<T, GatewayError> {
    queue
        .lock()
        .unwrap()
        .pop_front()
        .unwrap_or_else(|| Err(LlmError::network("No mock response queued").into()))
}

impl MockGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue_intent(&self, intent: Intent) {
        self.intents.lock().unwrap().push_back(Ok(intent));
    }

    pub fn queue_review(&self, review: Review) {
        self.reviews.lock().unwrap().push_back(Ok(review));
    }

    pub fn queue_craft(&self, text: impl Into<String>) {
        self.crafts.lock().unwrap().push_back(Ok(text.into()));
    }

    pub fn queue_edit(&self, decision: EditDecision) {
        self.edits.lock().unwrap().push_back(Ok(decision));
    }

    pub fn calls(&self) -> Vec<GatewayCall> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: GatewayCall) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl Gateway for MockGateway {
    async fn classify(&self, text: &str, prior_turn: Option<&str>) -> Result<Intent, GatewayError> {
        self.record(GatewayCall::Classify {
            text: text.to_string(),
            prior_turn: prior_turn.map(ToString::to_string),
        });
        pop_or_unavailable(&self.intents)
    }

    async fn review(&self, text: &str) -> Result<Review, GatewayError> {
        self.record(GatewayCall::Review {
            text: text.to_string(),
        });
        pop_or_unavailable(&self.reviews)
    }

    async fn craft(&self, topic: &str) -> Result<String, GatewayError> {
        self.record(GatewayCall::Craft {
            topic: topic.to_string(),
        });
        pop_or_unavailable(&self.crafts)
    }

    async fn execute_edit(
        &self,
        instruction: &str,
        recent: &[DatedFile],
        image_ref: Option<&str>,
        today: &str,
    ) -> Result<EditDecision, GatewayError> {
        self.record(GatewayCall::ExecuteEdit {
            instruction: instruction.to_string(),
            date_keys: recent.iter().map(|f| f.date_key.clone()).collect(),
            image_ref: image_ref.map(ToString::to_string),
            today: today.to_string(),
        });
        pop_or_unavailable(&self.edits)
    }
}

// ============================================================================
// In-Memory Content Store
// ============================================================================

/// Content store with real compare-and-swap semantics
#[derive(Default)]
pub struct InMemoryStore {
    files: Mutex<HashMap<String, (String, String)>>,
    images: Mutex<Vec<String>>,
    revision: Mutex<u64>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_revision(&self) -> String {
        let mut revision = self.revision.lock().unwrap();
        *revision += 1;
        format!("rev-{revision}")
    }

    /// Put a file in place and return its revision token
    pub fn seed(&self, date_key: &str, content: &str) -> String {
        let token = self.next_revision();
        self.files
            .lock()
            .unwrap()
            .insert(date_key.to_string(), (content.to_string(), token.clone()));
        token
    }

    /// Simulate a write by someone else
    pub fn tamper(&self, date_key: &str, content: &str) -> String {
        self.seed(date_key, content)
    }

    pub fn content(&self, date_key: &str) -> Option<String> {
        self.files
            .lock()
            .unwrap()
            .get(date_key)
            .map(|(content, _)| content.clone())
    }

    pub fn image_names(&self) -> Vec<String> {
        self.images.lock().unwrap().clone()
    }
}

#[async_trait]
impl ContentStore for InMemoryStore {
    async fn read(&self, date_key: &str) -> Result<Option<DatedFile>, StoreError> {
        Ok(self
            .files
            .lock()
            .unwrap()
            .get(date_key)
            .map(|(content, token)| DatedFile {
                date_key: date_key.to_string(),
                content: content.clone(),
                revision_token: token.clone(),
            }))
    }

    async fn write(
        &self,
        date_key: &str,
        full_text: &str,
        _message: &str,
        expected_revision: Option<&str>,
    ) -> Result<String, StoreError> {
        let path = format!("{date_key}.md");
        let current = self
            .files
            .lock()
            .unwrap()
            .get(date_key)
            .map(|(_, token)| token.clone());
        match (expected_revision, current) {
            (None, Some(_)) => return Err(StoreError::AlreadyExists { path }),
            (Some(expected), Some(current)) if expected != current => {
                return Err(StoreError::Conflict { path })
            }
            (Some(_), None) => return Err(StoreError::Conflict { path }),
            _ => {}
        }
        Ok(self.seed(date_key, full_text))
    }

    async fn write_image(&self, file_name: &str, _bytes: &[u8]) -> Result<(), StoreError> {
        self.images.lock().unwrap().push(file_name.to_string());
        Ok(())
    }
}

// ============================================================================
// Recording Transport
// ============================================================================

/// Transport that forwards every outbound message to a channel
pub struct RecordingTransport {
    outbox: mpsc::UnboundedSender<Outbound>,
    failing_downloads: Mutex<HashSet<String>>,
}

impl RecordingTransport {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (outbox, rx) = mpsc::unbounded_channel();
        (
            Self {
                outbox,
                failing_downloads: Mutex::new(HashSet::new()),
            },
            rx,
        )
    }

    /// Make downloads of this attachment id fail
    pub fn fail_download(&self, id: &str) {
        self.failing_downloads
            .lock()
            .unwrap()
            .insert(id.to_string());
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send(&self, message: &Outbound) -> Result<(), TransportError> {
        self.outbox
            .send(message.clone())
            .map_err(|e| TransportError::Network(e.to_string()))
    }

    async fn download(&self, attachment: &AttachmentRef) -> Result<Vec<u8>, TransportError> {
        if self.failing_downloads.lock().unwrap().contains(&attachment.id) {
            return Err(TransportError::Http {
                status: 404,
                body: "file_not_found".to_string(),
            });
        }
        Ok(attachment.id.as_bytes().to_vec())
    }
}

// ============================================================================
// Manual Clock
// ============================================================================

pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn advance(&self, delta: TimeDelta) {
        *self.now.lock().unwrap() += delta;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

// ============================================================================
// Test Runtime Builder
// ============================================================================

pub const PRINCIPAL: &str = "U-owner";
pub const CHANNEL: &str = "D-owner";

/// Helper for building test runtimes with minimal boilerplate
pub struct TestRuntime {
    pub gateway: Arc<MockGateway>,
    pub store: Arc<InMemoryStore>,
    pub transport: Arc<RecordingTransport>,
    pub clock: Arc<ManualClock>,
    event_tx: mpsc::Sender<Event>,
    outbox: mpsc::UnboundedReceiver<Outbound>,
    _runtime_handle: tokio::task::JoinHandle<()>,
}

pub struct TestRuntimeBuilder {
    gateway: MockGateway,
    store: InMemoryStore,
    now: DateTime<Utc>,
}

impl TestRuntime {
    pub fn builder() -> TestRuntimeBuilder {
        TestRuntimeBuilder {
            gateway: MockGateway::new(),
            store: InMemoryStore::new(),
            now: DateTime::parse_from_rfc3339("2024-03-10T12:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
        }
    }
}

impl TestRuntimeBuilder {
    pub fn gateway(mut self, gateway: MockGateway) -> Self {
        self.gateway = gateway;
        self
    }

    pub fn store(mut self, store: InMemoryStore) -> Self {
        self.store = store;
        self
    }

    pub fn build(self) -> TestRuntime {
        let gateway = Arc::new(self.gateway);
        let store = Arc::new(self.store);
        let (transport, outbox) = RecordingTransport::new();
        let transport = Arc::new(transport);
        let clock = Arc::new(ManualClock::new(self.now));
        let offset = FixedOffset::east_opt(0).unwrap();

        let services = Services {
            transport: transport.clone(),
            gateway: gateway.clone(),
            store: store.clone(),
            images: Arc::new(ImagePipeline::new("/images/daybook", offset)),
        };
        let context = BotContext::new(PRINCIPAL, 7, offset);
        let (event_tx, event_rx) = mpsc::channel(32);
        let runtime = BotRuntime::new(context, services, clock.clone(), event_rx, event_tx.clone());

        let handle = tokio::spawn(async move {
            runtime.run().await;
        });

        TestRuntime {
            gateway,
            store,
            transport,
            clock,
            event_tx,
            outbox,
            _runtime_handle: handle,
        }
    }
}

impl TestRuntime {
    pub async fn send_event(&self, event: Event) {
        self.event_tx
            .send(event)
            .await
            .expect("Failed to send event");
    }

    pub async fn send_message(&self, message: InboundMessage) {
        self.send_event(Event::Message {
            sender: PRINCIPAL.to_string(),
            channel: CHANNEL.to_string(),
            message,
        })
        .await;
    }

    pub async fn send_text(&self, text: &str) {
        self.send_message(InboundMessage::text(text)).await;
    }

    pub async fn press(&self, action: ButtonAction, value: Option<&str>) {
        self.send_event(Event::Button {
            sender: PRINCIPAL.to_string(),
            channel: CHANNEL.to_string(),
            action,
            value: value.map(ToString::to_string),
        })
        .await;
    }

    /// Wait for the next outbound message
    pub async fn next_reply(&mut self) -> Outbound {
        tokio::time::timeout(Duration::from_secs(2), self.outbox.recv())
            .await
            .expect("Timed out waiting for a reply")
            .expect("Transport closed")
    }

    /// True when nothing more is sent within a short grace period
    pub async fn is_quiet(&mut self) -> bool {
        tokio::time::timeout(Duration::from_millis(100), self.outbox.recv())
            .await
            .is_err()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ReviewDecision;
    use crate::state_machine::transition::{IMAGES_DROPPED, NOTHING_PENDING, UNAUTHORIZED_REPLY};

    fn photo(id: &str) -> AttachmentRef {
        AttachmentRef {
            id: id.to_string(),
            name: Some(format!("{id}.jpg")),
            mime_type: Some("image/jpeg".to_string()),
            url: format!("https://files.example/{id}"),
        }
    }

    fn publish(text: &str) -> Review {
        Review {
            decision: ReviewDecision::Publish,
            text: text.to_string(),
            explanation: String::new(),
        }
    }

    const YESTERDAY: &str = "---\ndate: 2024-03-09\n---\n\nI liek teh new tool\n";

    #[tokio::test]
    async fn test_in_memory_store_compare_and_swap() {
        let store = InMemoryStore::new();
        let token = store.write("d", "one", "m", None).await.unwrap();
        assert!(matches!(
            store.write("d", "again", "m", None).await,
            Err(StoreError::AlreadyExists { .. })
        ));
        let next = store.write("d", "two", "m", Some(&token)).await.unwrap();
        assert!(matches!(
            store.write("d", "three", "m", Some(&token)).await,
            Err(StoreError::Conflict { .. })
        ));
        assert_ne!(token, next);
        assert_eq!(store.content("d").as_deref(), Some("two"));
    }

    /// Integration test: instruction flow from message to applied edit
    #[tokio::test]
    async fn test_typo_fix_end_to_end() {
        let gateway = MockGateway::new();
        gateway.queue_intent(Intent::Instruction);
        gateway.queue_edit(EditDecision::Edit {
            date_key: "2024-03-09".to_string(),
            full_text: "---\ndate: 2024-03-09\n---\n\nI liek the new tool\n".to_string(),
            explanation: "Fixed 'teh'".to_string(),
            warning: None,
        });
        let store = InMemoryStore::new();
        store.seed("2024-03-09", YESTERDAY);

        let mut rt = TestRuntime::builder().gateway(gateway).store(store).build();
        rt.send_text("fix the typo: 'teh' -> 'the' in yesterday's post")
            .await;

        let approval = rt.next_reply().await;
        assert!(approval.text.contains("Fixed 'teh'"));
        assert_eq!(approval.choices.len(), 2);

        let calls = rt.gateway.calls();
        assert!(matches!(
            &calls[1],
            GatewayCall::ExecuteEdit { date_keys, today, image_ref: None, .. }
                if date_keys == &vec!["2024-03-09".to_string()] && today == "2024-03-10"
        ));

        rt.press(ButtonAction::ApproveEdit, None).await;
        assert_eq!(rt.next_reply().await.text, "Updated 2024-03-09.");
        assert_eq!(
            rt.store.content("2024-03-09").unwrap(),
            "---\ndate: 2024-03-09\n---\n\nI liek the new tool\n"
        );
    }

    /// Integration test: photos without text publish without any gateway call
    #[tokio::test]
    async fn test_image_only_message() {
        let mut rt = TestRuntime::builder().build();
        rt.send_message(InboundMessage {
            text: None,
            attachments: vec![photo("p1"), photo("p2")],
        })
        .await;

        assert_eq!(rt.next_reply().await.text, "Published to 2024-03-10.");
        assert!(rt.gateway.calls().is_empty());
        assert_eq!(
            rt.store.content("2024-03-10").unwrap(),
            "---\ndate: 2024-03-10\n---\n\n![image](/images/daybook/2024-03-10-120000-0.jpg)\n\n![image](/images/daybook/2024-03-10-120000-1.jpg)\n"
        );
    }

    /// Integration test: a write by someone else between plan and approval
    #[tokio::test]
    async fn test_stale_revision_is_reported() {
        let gateway = MockGateway::new();
        gateway.queue_intent(Intent::Instruction);
        gateway.queue_edit(EditDecision::Edit {
            date_key: "2024-03-09".to_string(),
            full_text: "fixed".to_string(),
            explanation: String::new(),
            warning: None,
        });
        let store = InMemoryStore::new();
        store.seed("2024-03-09", YESTERDAY);

        let mut rt = TestRuntime::builder().gateway(gateway).store(store).build();
        rt.send_text("fix yesterday").await;
        rt.next_reply().await;

        rt.store.tamper("2024-03-09", "edited elsewhere");
        rt.press(ButtonAction::ApproveEdit, None).await;

        let reply = rt.next_reply().await;
        assert!(reply.text.contains("has changed since this edit was prepared"));
        assert_eq!(rt.store.content("2024-03-09").unwrap(), "edited elsewhere");

        // The edit is gone; approving again does nothing
        rt.press(ButtonAction::ApproveEdit, None).await;
        assert_eq!(rt.next_reply().await.text, NOTHING_PENDING);
    }

    /// Integration test: failed image transfers degrade to a text-only entry
    #[tokio::test]
    async fn test_dropped_images_publish_text() {
        let gateway = MockGateway::new();
        gateway.queue_intent(Intent::Content);
        gateway.queue_review(publish("Sunset tonight"));

        let mut rt = TestRuntime::builder().gateway(gateway).build();
        rt.transport.fail_download("p1");
        rt.send_message(InboundMessage {
            text: Some("Sunset tonight".to_string()),
            attachments: vec![photo("p1")],
        })
        .await;

        assert_eq!(rt.next_reply().await.text, IMAGES_DROPPED);
        assert_eq!(rt.next_reply().await.text, "Published to 2024-03-10.");
        assert_eq!(
            rt.store.content("2024-03-10").unwrap(),
            "---\ndate: 2024-03-10\n---\n\nSunset tonight\n"
        );
    }

    /// Integration test: an edit whose new photo fails to upload says so
    #[tokio::test]
    async fn test_dropped_images_reported_for_edit() {
        let gateway = MockGateway::new();
        gateway.queue_intent(Intent::Instruction);
        gateway.queue_edit(EditDecision::Unsupported {
            reason: "There's no photo to add.".to_string(),
        });
        let store = InMemoryStore::new();
        store.seed("2024-03-09", YESTERDAY);

        let mut rt = TestRuntime::builder().gateway(gateway).store(store).build();
        rt.transport.fail_download("p1");
        rt.send_message(InboundMessage {
            text: Some("add this photo to yesterday's post".to_string()),
            attachments: vec![photo("p1")],
        })
        .await;

        assert_eq!(rt.next_reply().await.text, IMAGES_DROPPED);
        assert_eq!(rt.next_reply().await.text, "There's no photo to add.");
        assert!(matches!(
            &rt.gateway.calls()[1],
            GatewayCall::ExecuteEdit { image_ref: None, .. }
        ));
        assert!(rt.store.image_names().is_empty());
    }

    /// Integration test: classification outage still publishes
    #[tokio::test]
    async fn test_classification_failure_defaults_to_content() {
        let gateway = MockGateway::new();
        gateway.queue_review(publish("Hello world"));

        let mut rt = TestRuntime::builder().gateway(gateway).build();
        rt.send_text("helo world").await;

        assert_eq!(rt.next_reply().await.text, "Published to 2024-03-10.");
        assert!(rt.store.content("2024-03-10").unwrap().ends_with("Hello world\n"));
        assert_eq!(
            rt.gateway.calls()[1],
            GatewayCall::Review {
                text: "helo world".to_string()
            }
        );
    }

    /// Integration test: a double click on accept commits once
    #[tokio::test]
    async fn test_duplicate_accept_commits_once() {
        let gateway = MockGateway::new();
        gateway.queue_intent(Intent::Content);
        gateway.queue_review(Review {
            decision: ReviewDecision::Suggest,
            text: "A tidier thought.".to_string(),
            explanation: "grammar".to_string(),
        });

        let mut rt = TestRuntime::builder().gateway(gateway).build();
        rt.send_text("a thought, untidy").await;
        let offer = rt.next_reply().await;
        assert_eq!(offer.choices.len(), 3);

        rt.press(ButtonAction::AcceptProposal, None).await;
        rt.press(ButtonAction::AcceptProposal, None).await;

        let mut texts = vec![rt.next_reply().await.text, rt.next_reply().await.text];
        texts.sort();
        assert_eq!(
            texts,
            vec!["Published to 2024-03-10.".to_string(), NOTHING_PENDING.to_string()]
        );
        assert!(rt.is_quiet().await);
        assert_eq!(
            rt.store.content("2024-03-10").unwrap(),
            "---\ndate: 2024-03-10\n---\n\nA tidier thought.\n"
        );
    }

    /// Integration test: a crafted draft is published only after approval
    #[tokio::test]
    async fn test_craft_then_accept() {
        let gateway = MockGateway::new();
        gateway.queue_craft("Spring arrived quietly this year.");

        let mut rt = TestRuntime::builder().gateway(gateway).build();
        rt.send_text("Help me write about spring").await;

        let offer = rt.next_reply().await;
        assert!(offer.text.contains("Spring arrived quietly this year."));
        assert_eq!(offer.choices.len(), 2);
        assert_eq!(
            rt.gateway.calls(),
            vec![GatewayCall::Craft {
                topic: "spring".to_string()
            }]
        );
        assert!(rt.store.content("2024-03-10").is_none());

        rt.press(ButtonAction::AcceptProposal, None).await;
        assert_eq!(rt.next_reply().await.text, "Published to 2024-03-10.");
        assert!(rt
            .store
            .content("2024-03-10")
            .unwrap()
            .contains("Spring arrived quietly this year."));
    }

    /// Integration test: strangers get a refusal and nothing else
    #[tokio::test]
    async fn test_unauthorized_sender() {
        let mut rt = TestRuntime::builder().build();
        rt.send_event(Event::Message {
            sender: "U-stranger".to_string(),
            channel: "D-stranger".to_string(),
            message: InboundMessage::text("publish this"),
        })
        .await;

        let reply = rt.next_reply().await;
        assert_eq!(reply.channel, "D-stranger");
        assert_eq!(reply.text, UNAUTHORIZED_REPLY);
        assert!(rt.gateway.calls().is_empty());
        assert!(rt.store.content("2024-03-10").is_none());
    }

    /// Integration test: a clarification answer is folded into the instruction
    /// until the context expires
    #[tokio::test]
    async fn test_clarification_round_trip_and_expiry() {
        let gateway = MockGateway::new();
        gateway.queue_intent(Intent::Instruction);
        gateway.queue_edit(EditDecision::Unclear {
            question: "Which post?".to_string(),
        });
        gateway.queue_edit(EditDecision::Unclear {
            question: "Morning or evening?".to_string(),
        });
        gateway.queue_intent(Intent::Content);
        gateway.queue_review(publish("evening"));
        let store = InMemoryStore::new();
        store.seed("2024-03-09", YESTERDAY);

        let mut rt = TestRuntime::builder().gateway(gateway).store(store).build();
        rt.send_text("add a note to my post").await;
        assert_eq!(rt.next_reply().await.text, "Which post?");

        rt.clock.advance(TimeDelta::minutes(4));
        rt.send_text("yesterday's").await;
        assert_eq!(rt.next_reply().await.text, "Morning or evening?");

        match &rt.gateway.calls()[2] {
            GatewayCall::ExecuteEdit { instruction, .. } => assert_eq!(
                instruction,
                "Original request: add a note to my post\nYou asked: Which post?\nMy answer: yesterday's"
            ),
            other => panic!("unexpected call {other:?}"),
        }

        rt.clock.advance(TimeDelta::minutes(5));
        rt.send_text("evening").await;
        assert_eq!(rt.next_reply().await.text, "Published to 2024-03-10.");
        assert!(matches!(rt.gateway.calls()[3], GatewayCall::Classify { .. }));
    }
}
