//! Integration tests for the assembled engine.
//!
//! These drive raw host events through `Keel::dispatch_value` against a real
//! transcript store: error classification → repair or compaction, idle →
//! continuation nudge, idle → bounded loop.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use keel_context::{PruningMode, TranscriptStore};
use keel_engine::{
    ApiFut, CANCELLED_TOOL_RESULT, ConversationApi, HostPorts, Keel, KeelConfig,
    NoBackgroundTasks, Notifier, SessionInfo, StorageConfig, Toast,
};
use keel_types::{
    MessageInfo, ModelRef, Part, PartKind, PersistedMessage, PromptPart, PromptRequest,
    Role, SessionId, Todo, TodoStatus, ToolState,
};
use serde_json::{Value, json};
use tempfile::TempDir;

const SESSION: &str = "ses_flow";

#[derive(Default)]
struct Host {
    store: Mutex<Option<Arc<TranscriptStore>>>,
    todos: Mutex<HashMap<SessionId, Vec<Todo>>>,
    prompts: Mutex<Vec<PromptRequest>>,
    summaries: Mutex<Vec<ModelRef>>,
    aborts: Mutex<usize>,
    toasts: Mutex<Vec<Toast>>,
}

impl Host {
    fn prompts(&self) -> Vec<PromptRequest> {
        self.prompts.lock().unwrap().clone()
    }
}

impl ConversationApi for Host {
    fn send_prompt<'a>(&'a self, _session_id: &'a SessionId, request: PromptRequest) -> ApiFut<'a, ()> {
        Box::pin(async move {
            self.prompts.lock().unwrap().push(request);
            Ok(())
        })
    }

    fn abort<'a>(&'a self, _session_id: &'a SessionId) -> ApiFut<'a, ()> {
        Box::pin(async move {
            *self.aborts.lock().unwrap() += 1;
            Ok(())
        })
    }

    fn list_messages<'a>(&'a self, session_id: &'a SessionId) -> ApiFut<'a, Vec<PersistedMessage>> {
        Box::pin(async move {
            let store = self.store.lock().unwrap().clone();
            match store {
                Some(store) => Ok(store.list_messages(session_id)?),
                None => Ok(Vec::new()),
            }
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

    fn summarize<'a>(&'a self, _session_id: &'a SessionId, model: &'a ModelRef) -> ApiFut<'a, ()> {
        Box::pin(async move {
            self.summaries.lock().unwrap().push(model.clone());
            Ok(())
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

impl Notifier for Host {
    fn toast(&self, toast: Toast) {
        self.toasts.lock().unwrap().push(toast);
    }
}

struct Fixture {
    _dir: TempDir,
    host: Arc<Host>,
    store: Arc<TranscriptStore>,
    keel: Keel,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let config = KeelConfig {
        storage: Some(StorageConfig {
            root: Some(dir.path().join("storage")),
            loop_state_file: Some(dir.path().join("loop-state.json")),
        }),
        ..KeelConfig::default()
    };
    let host = Arc::new(Host::default());
    let keel = Keel::from_config(
        &config,
        HostPorts {
            api: host.clone(),
            notifier: host.clone(),
            tasks: Arc::new(NoBackgroundTasks),
        },
    )
    .unwrap();
    let store = Arc::new(TranscriptStore::new(dir.path().join("storage")));
    *host.store.lock().unwrap() = Some(Arc::clone(&store));
    Fixture {
        _dir: dir,
        host,
        store,
        keel,
    }
}

fn session() -> SessionId {
    SessionId::new(SESSION)
}

fn write(store: &TranscriptStore, info: MessageInfo, kinds: Vec<PartKind>) {
    let message_id = info.id.clone();
    let parts = kinds
        .into_iter()
        .enumerate()
        .map(|(i, kind)| {
            Part::new(
                format!("prt_{}_{i:02}", message_id.as_str()),
                session(),
                message_id.clone(),
                kind,
            )
        })
        .collect();
    store
        .write_message(&PersistedMessage::new(info, parts))
        .unwrap();
}

fn idle() -> Value {
    json!({"type": "session.idle", "properties": {"sessionID": SESSION}})
}

#[tokio::test(start_paused = true)]
async fn missing_tool_result_is_answered_with_cancellations() {
    let f = fixture();
    write(
        &f.store,
        MessageInfo::new("msg_01", session(), Role::User),
        vec![PartKind::text("run it")],
    );
    let error = json!({"message": "messages.1: `tool_use` ids were found without `tool_result` blocks immediately after: toolu_7"});
    let info = MessageInfo::new("msg_02", session(), Role::Assistant).with_error(error);
    write(
        &f.store,
        info.clone(),
        vec![PartKind::ToolUse {
            tool_use_id: "toolu_7".to_string(),
            name: "bash".to_string(),
            input: json!({"command": "make"}),
        }],
    );

    let event = json!({"type": "message.updated", "properties": {"info": info}});
    assert!(f.keel.dispatch_value(&event).await);

    assert_eq!(*f.host.aborts.lock().unwrap(), 1);
    let prompts = f.host.prompts();
    assert_eq!(prompts.len(), 1);
    assert_eq!(
        prompts[0].parts,
        vec![PromptPart::ToolResult {
            tool_use_id: "toolu_7".to_string(),
            content: CANCELLED_TOOL_RESULT.to_string(),
        }]
    );
    assert!(f.host.summaries.lock().unwrap().is_empty());
    assert!(
        f.host
            .toasts
            .lock()
            .unwrap()
            .iter()
            .any(|toast| toast.title == "Session Recovery")
    );
}

#[tokio::test(start_paused = true)]
async fn context_overflow_compacts_on_idle() {
    let f = fixture();
    let model = ModelRef::new("anthropic", "claude-sonnet-4");
    write(
        &f.store,
        MessageInfo::new("msg_01", session(), Role::User),
        vec![PartKind::text("summarize the repo")],
    );
    let info = MessageInfo::new("msg_02", session(), Role::Assistant)
        .with_model(&model)
        .with_error(json!({"name": "APIError", "data": {"message": "prompt is too long: 250000 tokens > 200000 maximum"}}));
    write(&f.store, info.clone(), vec![]);

    f.keel
        .dispatch_value(&json!({"type": "message.updated", "properties": {"info": info}}))
        .await;
    assert!(f.keel.compaction().pending_error(&session()).is_some());

    f.keel.dispatch_value(&idle()).await;

    assert_eq!(*f.host.summaries.lock().unwrap(), vec![model]);
    assert_eq!(*f.host.aborts.lock().unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn idle_with_open_todos_is_nudged() {
    let f = fixture();
    write(
        &f.store,
        MessageInfo::new("msg_01", session(), Role::Assistant).with_agent("build"),
        vec![PartKind::text("started")],
    );
    f.host.todos.lock().unwrap().insert(
        session(),
        vec![
            Todo::new("1", "write parser", TodoStatus::Completed),
            Todo::new("2", "write tests", TodoStatus::Pending),
        ],
    );

    f.keel.dispatch_value(&idle()).await;
    assert!(f.host.prompts().is_empty());

    tokio::time::sleep(Duration::from_secs(3)).await;
    let prompts = f.host.prompts();
    assert_eq!(prompts.len(), 1);
    assert!(prompts[0].joined_text().contains("[Status: 1/2 completed, 1 remaining]"));
    assert_eq!(prompts[0].agent.as_deref(), Some("build"));
}

#[tokio::test(start_paused = true)]
async fn bounded_loop_runs_until_the_promise() {
    let f = fixture();
    f.keel
        .start_loop(&session(), "port the parser", Some(5), Some("SHIPPED".to_string()))
        .unwrap();

    f.keel.dispatch_value(&idle()).await;
    assert_eq!(f.keel.loop_state().map(|state| state.iteration), Some(2));

    write(
        &f.store,
        MessageInfo::new("msg_01", session(), Role::Assistant),
        vec![PartKind::text("done: <promise>shipped</promise>")],
    );
    f.keel.dispatch_value(&idle()).await;

    assert!(f.keel.loop_state().is_none());
    assert_eq!(f.host.prompts().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn recovery_marks_pause_the_loop() {
    let f = fixture();
    f.keel.start_loop(&session(), "task", None, None).unwrap();

    f.keel.mark_recovering(&session());
    f.keel.dispatch_value(&idle()).await;
    assert!(f.host.prompts().is_empty());

    f.keel.mark_recovery_complete(&session());
    f.keel.dispatch_value(&idle()).await;
    assert_eq!(f.host.prompts().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn deleting_the_session_drops_every_component_state() {
    let f = fixture();
    f.keel.start_loop(&session(), "task", None, None).unwrap();
    for (id, path) in [("msg_01", "/a"), ("msg_02", "/a")] {
        write(
            &f.store,
            MessageInfo::new(id, session(), Role::Assistant),
            vec![
                PartKind::StepStart,
                PartKind::Tool {
                    call_id: format!("call_{id}"),
                    tool: "read".to_string(),
                    state: ToolState::completed(json!({"filePath": path}), "contents"),
                },
            ],
        );
    }
    f.keel.execute_pruning(&session(), PruningMode::Commit);

    f.keel
        .dispatch_value(&json!({"type": "session.deleted", "properties": {"info": {"id": SESSION}}}))
        .await;

    assert!(f.keel.loop_state().is_none());
    assert!(f.keel.pruning().state(&session()).is_none());
}

#[tokio::test]
async fn classification_uses_configured_limits() {
    let dir = tempfile::tempdir().unwrap();
    let config: KeelConfig = toml::from_str(&format!(
        r#"
[storage]
root = "{root}"
loop_state_file = "{root}/loop.json"

[[model_limits]]
provider = "acme"
model = "rocket-1"
context_window = 12000
"#,
        root = dir.path().display()
    ))
    .unwrap();
    let host = Arc::new(Host::default());
    let keel = Keel::from_config(
        &config,
        HostPorts {
            api: host.clone(),
            notifier: host,
            tasks: Arc::new(NoBackgroundTasks),
        },
    )
    .unwrap();

    let parsed = keel
        .classify(&json!("context length exceeded"), Some("acme"), Some("rocket-1"))
        .unwrap();
    assert_eq!(parsed.max_tokens, Some(12_000));
    assert!(keel.classify(&json!("rate limited"), None, None).is_none());
    assert_eq!(keel.store().root(), dir.path());
}
