//! Recording fakes of the host ports for unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use keel_context::TranscriptStore;
use keel_types::{
    MessageId, MessageInfo, ModelRef, Part, PartKind, PersistedMessage, PromptRequest, Role,
    SessionId, Todo,
};
use tempfile::TempDir;

use crate::notifications::{Notifier, Toast, ToastVariant};
use crate::ports::{ApiError, ApiFut, BackgroundTasks, ConversationApi, SessionInfo};

/// Conversation API backed by a real transcript store in a temp dir.
pub(crate) struct FakeApi {
    store: Arc<TranscriptStore>,
    todos: Mutex<HashMap<SessionId, Vec<Todo>>>,
    prompts: Mutex<Vec<(SessionId, PromptRequest)>>,
    aborts: Mutex<Vec<SessionId>>,
    summaries: Mutex<Vec<(SessionId, ModelRef)>>,
    summarize_script: Mutex<VecDeque<bool>>,
    fail_prompts: AtomicBool,
    yield_first: AtomicBool,
}

impl FakeApi {
    pub(crate) fn new(store: Arc<TranscriptStore>) -> Self {
        Self {
            store,
            todos: Mutex::new(HashMap::new()),
            prompts: Mutex::new(Vec::new()),
            aborts: Mutex::new(Vec::new()),
            summaries: Mutex::new(Vec::new()),
            summarize_script: Mutex::new(VecDeque::new()),
            fail_prompts: AtomicBool::new(false),
            yield_first: AtomicBool::new(false),
        }
    }

    pub(crate) fn set_todos(&self, session: &SessionId, todos: Vec<Todo>) {
        self.todos.lock().unwrap().insert(session.clone(), todos);
    }

    /// Queue summarize results; once drained every call succeeds.
    pub(crate) fn script_summaries(&self, results: &[bool]) {
        self.summarize_script.lock().unwrap().extend(results);
    }

    pub(crate) fn fail_prompts(&self, fail: bool) {
        self.fail_prompts.store(fail, Ordering::SeqCst);
    }

    /// Make `list_messages` and `send_prompt` suspend once before answering.
    pub(crate) fn yield_before_calls(&self, yield_first: bool) {
        self.yield_first.store(yield_first, Ordering::SeqCst);
    }

    async fn maybe_yield(&self) {
        if self.yield_first.load(Ordering::SeqCst) {
            tokio::task::yield_now().await;
        }
    }

    pub(crate) fn prompts(&self) -> Vec<(SessionId, PromptRequest)> {
        self.prompts.lock().unwrap().clone()
    }

    pub(crate) fn prompt_texts(&self) -> Vec<String> {
        self.prompts()
            .iter()
            .map(|(_, request)| request.joined_text())
            .collect()
    }

    pub(crate) fn aborts(&self) -> Vec<SessionId> {
        self.aborts.lock().unwrap().clone()
    }

    pub(crate) fn summaries(&self) -> Vec<(SessionId, ModelRef)> {
        self.summaries.lock().unwrap().clone()
    }
}

impl ConversationApi for FakeApi {
    fn send_prompt<'a>(&'a self, session_id: &'a SessionId, request: PromptRequest) -> ApiFut<'a, ()> {
        Box::pin(async move {
            self.maybe_yield().await;
            if self.fail_prompts.load(Ordering::SeqCst) {
                return Err(ApiError::Request("prompt rejected".to_string()));
            }
            self.prompts
                .lock()
                .unwrap()
                .push((session_id.clone(), request));
            Ok(())
        })
    }

    fn abort<'a>(&'a self, session_id: &'a SessionId) -> ApiFut<'a, ()> {
        Box::pin(async move {
            self.aborts.lock().unwrap().push(session_id.clone());
            Ok(())
        })
    }

    fn list_messages<'a>(&'a self, session_id: &'a SessionId) -> ApiFut<'a, Vec<PersistedMessage>> {
        Box::pin(async move {
            self.maybe_yield().await;
            Ok(self.store.list_messages(session_id)?)
        })
    }

    fn list_todos<'a>(&'a self, session_id: &'a SessionId) -> ApiFut<'a, Vec<Todo>> {
        Box::pin(async move {
            Ok(self
                .todos
                .lock()
                .unwrap()
                .get(session_id)
                .cloned()
                .unwrap_or_default())
        })
    }

    fn summarize<'a>(&'a self, session_id: &'a SessionId, model: &'a ModelRef) -> ApiFut<'a, ()> {
        Box::pin(async move {
            self.summaries
                .lock()
                .unwrap()
                .push((session_id.clone(), model.clone()));
            let ok = self
                .summarize_script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(true);
            if ok {
                Ok(())
            } else {
                Err(ApiError::Request("summarize failed".to_string()))
            }
        })
    }

    fn get_session<'a>(&'a self, session_id: &'a SessionId) -> ApiFut<'a, Option<SessionInfo>> {
        Box::pin(async move {
            Ok(Some(SessionInfo {
                id: session_id.clone(),
                parent_id: None,
                title: None,
            }))
        })
    }
}

#[derive(Default)]
pub(crate) struct RecordingNotifier {
    toasts: Mutex<Vec<Toast>>,
}

impl RecordingNotifier {
    pub(crate) fn toasts(&self) -> Vec<Toast> {
        self.toasts.lock().unwrap().clone()
    }

    pub(crate) fn count(&self, variant: ToastVariant) -> usize {
        self.toasts()
            .iter()
            .filter(|toast| toast.variant == variant)
            .count()
    }
}

impl Notifier for RecordingNotifier {
    fn toast(&self, toast: Toast) {
        self.toasts.lock().unwrap().push(toast);
    }
}

#[derive(Default)]
pub(crate) struct FakeTasks {
    running: AtomicBool,
}

impl FakeTasks {
    pub(crate) fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }
}

impl BackgroundTasks for FakeTasks {
    fn has_running(&self, _parent: &SessionId) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// Temp storage plus fakes for every port.
pub(crate) struct Harness {
    _dir: TempDir,
    pub(crate) store: Arc<TranscriptStore>,
    pub(crate) api: Arc<FakeApi>,
    pub(crate) notifier: Arc<RecordingNotifier>,
    pub(crate) tasks: Arc<FakeTasks>,
}

impl Harness {
    pub(crate) fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(TranscriptStore::new(dir.path()));
        let api = Arc::new(FakeApi::new(Arc::clone(&store)));
        Self {
            _dir: dir,
            store,
            api,
            notifier: Arc::new(RecordingNotifier::default()),
            tasks: Arc::new(FakeTasks::default()),
        }
    }
}

/// Writes sequentially numbered messages into a store.
pub(crate) struct Seeder<'a> {
    store: &'a TranscriptStore,
    session: SessionId,
    next: usize,
}

impl<'a> Seeder<'a> {
    pub(crate) fn new(store: &'a TranscriptStore, session: &str) -> Self {
        Self {
            store,
            session: SessionId::new(session),
            next: 1,
        }
    }

    pub(crate) fn message(
        &mut self,
        info: impl FnOnce(MessageInfo) -> MessageInfo,
        role: Role,
        kinds: Vec<PartKind>,
    ) -> MessageId {
        let index = self.next;
        self.next += 1;
        let message_id = MessageId::new(format!("msg_{index:04}"));
        let info = info(MessageInfo::new(
            message_id.clone(),
            self.session.clone(),
            role,
        ));
        let parts = kinds
            .into_iter()
            .enumerate()
            .map(|(i, kind)| {
                Part::new(
                    format!("prt_{index:04}_{:02}", i + 1),
                    self.session.clone(),
                    message_id.clone(),
                    kind,
                )
            })
            .collect();
        self.store
            .write_message(&PersistedMessage::new(info, parts))
            .unwrap();
        message_id
    }

    pub(crate) fn user(&mut self, text: &str) -> MessageId {
        self.message(
            |info| info,
            Role::User,
            vec![PartKind::text(text)],
        )
    }

    pub(crate) fn assistant(&mut self, kinds: Vec<PartKind>) -> MessageId {
        self.message(|info| info, Role::Assistant, kinds)
    }
}
