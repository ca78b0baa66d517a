//! Engine integration tests
//!
//! Drives the poll, route and speak flow with mock sources and sinks

use std::sync::Arc;

use mibridge::chat::ChatBackend;
use mibridge::console::{Command, Console, Flow};
use mibridge::home::{FALLBACK_MESSAGE, HomeAutomation};
use mibridge::poll::ConversationSource;
use mibridge::{Engine, Error, Intent};
use tokio::sync::mpsc;

mod common;
use common::{
    MockChat, MockHome, MockSink, MockSource, Spoken, device, fast_dispatcher, test_config,
    test_router,
};

struct Harness {
    engine: Engine,
    source: Arc<MockSource>,
    sink: Arc<MockSink>,
    chat: Arc<MockChat>,
    home: Arc<MockHome>,
}

fn harness_with_home(home: MockHome) -> Harness {
    let source = Arc::new(MockSource::default());
    let sink = Arc::new(MockSink::default());
    let chat = Arc::new(MockChat::default());
    let home = Arc::new(home);

    let engine = Engine::new(
        Arc::clone(&source) as Arc<dyn ConversationSource>,
        Arc::new(fast_dispatcher(&sink)),
        test_router(),
        &test_config(),
    )
    .with_chat(Arc::clone(&chat) as Arc<dyn ChatBackend>)
    .with_home(Arc::clone(&home) as Arc<dyn HomeAutomation>);

    Harness {
        engine,
        source,
        sink,
        chat,
        home,
    }
}

fn harness() -> Harness {
    harness_with_home(MockHome::default())
}

/// Harness started on devices `a` and `b`, both selected
async fn started() -> Harness {
    let mut h = harness();
    let mut config = test_config();
    config.devices.selection = Some("all".to_string());
    h.engine
        .start(&[device("a"), device("b")], &config.devices)
        .await
        .unwrap();
    h
}

#[tokio::test]
async fn start_without_devices_is_fatal() {
    let mut h = harness();
    let err = h
        .engine
        .start(&[], &test_config().devices)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NoDevicesFound));
    assert!(err.is_fatal());
}

#[tokio::test]
async fn history_before_start_is_not_replayed() {
    let mut h = harness();
    h.source.set("a", 1000, "请讲个笑话", "").await;
    h.engine
        .start(&[device("a")], &test_config().devices)
        .await
        .unwrap();

    assert_eq!(h.engine.poller().watermark("a"), 1000);
    assert!(h.engine.tick().await.unwrap().is_empty());
    assert!(h.sink.calls().await.is_empty());
}

#[tokio::test]
async fn chat_query_interrupts_then_speaks_answer() {
    let mut h = started().await;
    h.source.set("a", 1000, "请讲个笑话", "好的").await;

    let dispatched = h.engine.tick().await.unwrap();
    assert_eq!(dispatched.len(), 1);
    assert_eq!(dispatched[0].intent, Intent::ChatAi);
    assert_eq!(dispatched[0].answer.as_deref(), Some("chat:讲个笑话"));
    assert!(dispatched[0].delivered);

    assert_eq!(h.chat.questions().await, vec!["讲个笑话"]);
    assert_eq!(
        h.sink.calls().await,
        vec![
            Spoken {
                device_id: "a".into(),
                text: ".".into(),
                quiet: true
            },
            Spoken {
                device_id: "a".into(),
                text: "chat:讲个笑话".into(),
                quiet: false
            },
        ]
    );
}

#[tokio::test]
async fn same_timestamp_is_dispatched_once() {
    let mut h = started().await;
    h.source.set("a", 1000, "请讲个笑话", "").await;

    assert_eq!(h.engine.tick().await.unwrap().len(), 1);
    assert!(h.engine.tick().await.unwrap().is_empty());
    assert_eq!(h.engine.poller().watermark("a"), 1000);
    assert_eq!(h.chat.questions().await.len(), 1);
}

#[tokio::test]
async fn passthrough_speaks_nothing() {
    let mut h = started().await;
    h.source.set("a", 1000, "今天天气怎么样", "今天晴").await;

    let dispatched = h.engine.tick().await.unwrap();
    assert_eq!(dispatched[0].intent, Intent::Passthrough);
    assert!(dispatched[0].answer.is_none());
    assert!(h.sink.calls().await.is_empty());
    assert!(h.chat.questions().await.is_empty());
}

#[tokio::test]
async fn home_voice_and_text_commands_are_cleaned() {
    let mut h = started().await;
    h.source.set("a", 1000, "小周打开客厅灯", "").await;
    h.source.set("b", 1000, "小爱关闭空调", "").await;

    let dispatched = h.engine.tick().await.unwrap();
    let intents: Vec<Intent> = dispatched.iter().map(|d| d.intent).collect();
    assert_eq!(intents, vec![Intent::HomeAutomationVoice, Intent::HomeAutomationText]);

    assert_eq!(*h.home.voice_commands.lock().await, vec!["打开客厅灯"]);
    assert_eq!(*h.home.text_commands.lock().await, vec!["关闭空调"]);
    assert_eq!(
        h.sink.spoken().await,
        vec![
            ("a".to_string(), "好的，打开客厅灯".to_string()),
            ("b".to_string(), "执行成功：关闭空调".to_string()),
        ]
    );
}

#[tokio::test]
async fn home_failure_speaks_fallback() {
    let mut h = harness_with_home(MockHome {
        failing: true,
        ..MockHome::default()
    });
    h.engine
        .start(&[device("a")], &test_config().devices)
        .await
        .unwrap();
    h.source.set("a", 1000, "小周开灯", "").await;

    let dispatched = h.engine.tick().await.unwrap();
    assert_eq!(dispatched[0].answer.as_deref(), Some(FALLBACK_MESSAGE));
    assert_eq!(
        h.sink.spoken().await,
        vec![("a".to_string(), FALLBACK_MESSAGE.to_string())]
    );
}

#[tokio::test]
async fn reply_fails_over_to_next_selected_device() {
    let mut h = started().await;
    h.source.set("a", 1000, "帮我讲个故事", "").await;
    h.sink.fail_next("a", Error::Timeout("ubus".into())).await;
    // first call to `a` is the interrupt; the reply is the second
    h.sink.fail_next("a", Error::Timeout("ubus".into())).await;

    let dispatched = h.engine.tick().await.unwrap();
    assert!(dispatched[0].delivered);
    assert_eq!(
        h.sink.spoken().await,
        vec![
            ("a".to_string(), "chat:讲个故事".to_string()),
            ("b".to_string(), "chat:讲个故事".to_string()),
        ]
    );
}

#[tokio::test]
async fn busy_device_is_retried_before_failover() {
    let mut h = started().await;
    h.source.set("a", 1000, "请唱首歌", "").await;
    for _ in 0..2 {
        h.sink
            .fail_next(
                "a",
                Error::DeviceBusy {
                    device_id: "a".into(),
                },
            )
            .await;
    }

    let dispatched = h.engine.tick().await.unwrap();
    assert!(dispatched[0].delivered);

    // interrupt (busy, not retried), reply (busy, then success)
    let to_a: Vec<Spoken> = h
        .sink
        .calls()
        .await
        .into_iter()
        .filter(|c| c.device_id == "a")
        .collect();
    assert_eq!(to_a.len(), 3);
    assert!(to_a[0].quiet);
    assert!(h.sink.calls().await.iter().all(|c| c.device_id == "a"));
}

#[tokio::test]
async fn ai_toggle_turns_chat_queries_into_passthrough() {
    let mut h = started().await;
    h.engine.state().write().await.ai_enabled = false;
    h.source.set("a", 1000, "请讲个笑话", "").await;

    let dispatched = h.engine.tick().await.unwrap();
    assert_eq!(dispatched[0].intent, Intent::Passthrough);
    assert!(h.chat.questions().await.is_empty());
}

#[tokio::test]
async fn empty_query_advances_watermark_without_dispatch() {
    let mut h = started().await;
    h.source.set("a", 1000, "", "").await;

    assert!(h.engine.tick().await.unwrap().is_empty());
    assert_eq!(h.engine.poller().watermark("a"), 1000);
}

#[tokio::test]
async fn failing_device_does_not_block_others() {
    let mut h = started().await;
    h.source.fail_with("a", || Error::Timeout("fetch".into())).await;
    h.source.set("b", 1000, "请讲个笑话", "").await;

    let dispatched = h.engine.tick().await.unwrap();
    assert_eq!(dispatched.len(), 1);
    assert_eq!(h.engine.poller().watermark("a"), 0);
    assert_eq!(h.engine.poller().watermark("b"), 1000);
}

#[tokio::test]
async fn run_returns_on_shutdown() {
    let mut h = started().await;
    let (tx, rx) = mpsc::channel(1);
    tx.send(()).await.unwrap();

    h.engine.run(rx).await.unwrap();
    assert!(!h.engine.state().read().await.running);
}

#[tokio::test]
async fn run_surfaces_fatal_errors() {
    let mut h = started().await;
    h.source.fail_with("a", || Error::AuthChallenge).await;
    let (_tx, rx) = mpsc::channel(1);

    let err = h.engine.run(rx).await.unwrap_err();
    assert!(matches!(err, Error::AuthChallenge));
}

#[tokio::test]
async fn console_controls_shared_state() {
    let h = started().await;
    let (tx, mut rx) = mpsc::channel(1);
    let console = Console::new(
        h.engine.state(),
        vec![device("a"), device("b")],
        test_router(),
        Arc::new(fast_dispatcher(&h.sink)),
        tx,
    );

    console.execute(Command::parse("off")).await;
    assert!(!h.engine.state().read().await.ai_enabled);
    console.execute(Command::parse("开启ai")).await;
    assert!(h.engine.state().read().await.ai_enabled);

    console.execute(Command::parse("stop")).await;
    assert!(!h.engine.state().read().await.auto_process);
    console.execute(Command::parse("start")).await;
    assert!(h.engine.state().read().await.auto_process);

    let (_, status) = console.execute(Command::Status).await;
    assert!(status.contains("speaker-a, speaker-b"));

    let (flow, _) = console.execute(Command::parse("exit")).await;
    assert_eq!(flow, Flow::Exit);
    assert!(!h.engine.state().read().await.running);
    assert!(rx.try_recv().is_ok());
}

#[tokio::test]
async fn console_selection_is_primed_before_polling() {
    let mut h = harness();
    let devices = vec![device("a"), device("b")];
    h.engine
        .start(&devices, &test_config().devices)
        .await
        .unwrap();
    h.source.set("b", 500, "请讲个旧笑话", "").await;

    let (tx, _rx) = mpsc::channel(1);
    let console = Console::new(
        h.engine.state(),
        devices,
        test_router(),
        Arc::new(fast_dispatcher(&h.sink)),
        tx,
    );
    let (_, out) = console.execute(Command::parse("select 2")).await;
    assert_eq!(out, "selected: speaker-b");

    // Newly selected device is primed, not replayed
    assert!(h.engine.tick().await.unwrap().is_empty());
    assert_eq!(h.engine.poller().watermark("b"), 500);

    let (_, out) = console.execute(Command::parse("select 7")).await;
    assert!(out.contains("selection unchanged"));
}

#[tokio::test]
async fn console_typed_queries_are_spoken_on_every_device() {
    let h = started().await;
    let (tx, _rx) = mpsc::channel(1);
    let console = Console::new(
        h.engine.state(),
        vec![device("a"), device("b")],
        test_router(),
        Arc::new(fast_dispatcher(&h.sink)),
        tx,
    )
    .with_chat(Arc::clone(&h.chat) as Arc<dyn ChatBackend>);

    console.execute(Command::parse("晚安")).await;
    console.execute(Command::parse("请讲个笑话")).await;

    assert_eq!(
        h.sink.spoken().await,
        vec![
            ("a".to_string(), "晚安".to_string()),
            ("b".to_string(), "晚安".to_string()),
            ("a".to_string(), "chat:讲个笑话".to_string()),
            ("b".to_string(), "chat:讲个笑话".to_string()),
        ]
    );
}
