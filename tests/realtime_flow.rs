//! 端到端流程测试：通过网关走完连接、消息、通知、呼叫的完整生命周期

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;

use pulse_realtime_core::config::RealtimeConfig;
use pulse_realtime_core::events::{ClientEvent, ServerEvent};
use pulse_realtime_core::metrics::RealtimeMetrics;
use pulse_realtime_core::models::MessageType;
use pulse_realtime_core::repository::{
    InMemoryGroupRoster, InMemoryMessageStore, InMemoryNotificationStore, InMemoryPresenceStore,
};
use pulse_realtime_core::{GatewayStores, RealtimeGateway, SessionHandle};

struct Harness {
    gateway: RealtimeGateway,
    messages: Arc<InMemoryMessageStore>,
    notifications: Arc<InMemoryNotificationStore>,
}

fn harness() -> Harness {
    let messages = Arc::new(InMemoryMessageStore::new());
    let notifications = Arc::new(InMemoryNotificationStore::new());
    let stores = GatewayStores {
        messages: messages.clone(),
        groups: Arc::new(InMemoryGroupRoster::new()),
        presence: Arc::new(InMemoryPresenceStore::new()),
        notifications: notifications.clone(),
    };
    let gateway = RealtimeGateway::new(
        &RealtimeConfig::default(),
        stores,
        Arc::new(RealtimeMetrics::new()),
    );
    Harness {
        gateway,
        messages,
        notifications,
    }
}

async fn connect(
    harness: &Harness,
    user: &str,
    session_id: &str,
) -> (SessionHandle, UnboundedReceiver<ServerEvent>) {
    let (handle, rx) = SessionHandle::new(session_id);
    harness
        .gateway
        .handle_event(
            &handle,
            ClientEvent::AddUser {
                user_id: user.to_string(),
            },
        )
        .await
        .unwrap();
    tokio::task::yield_now().await;
    (handle, rx)
}

fn drain(rx: &mut UnboundedReceiver<ServerEvent>) -> Vec<ServerEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn direct_message(sender: &str, receiver: &str, content: &str) -> ClientEvent {
    ClientEvent::SendMessage {
        sender_id: sender.to_string(),
        receiver_id: Some(receiver.to_string()),
        group_id: None,
        content: content.to_string(),
        message_type: None,
        media_url: None,
    }
}

/// 上线广播、直发消息、通知抑制、已读后再次通知
#[tokio::test]
async fn message_flow_with_notification_dedup() {
    let hx = harness();
    let (_alice, mut alice_rx) = connect(&hx, "alice", "s-a").await;
    let (bob, mut bob_rx) = connect(&hx, "bob", "s-b").await;

    // bob 上线时 alice 收到在线广播
    assert!(drain(&mut alice_rx).iter().any(|e| matches!(
        e,
        ServerEvent::UserPresenceUpdate(p) if p.user_id == "bob" && p.is_online
    )));
    drain(&mut bob_rx);

    for text in ["one", "two", "three"] {
        hx.gateway
            .handle_event(&bob, direct_message("bob", "alice", text))
            .await
            .unwrap();
    }

    let events = drain(&mut alice_rx);
    let received = events
        .iter()
        .filter(|e| matches!(e, ServerEvent::ReceiveMessage(_)))
        .count();
    let notified = events
        .iter()
        .filter(|e| matches!(e, ServerEvent::NewNotification(_)))
        .count();
    assert_eq!(received, 3);
    // 未读通知存在时后续消息被抑制
    assert_eq!(notified, 1);
    assert_eq!(hx.messages.saved().await.len(), 3);

    // 已读后下一条消息重新产生通知
    let saved = hx.notifications.saved().await;
    assert_eq!(saved.len(), 1);
    assert!(hx.notifications.mark_read(saved[0].id).await);
    hx.gateway
        .handle_event(&bob, direct_message("bob", "alice", "four"))
        .await
        .unwrap();
    assert!(drain(&mut alice_rx)
        .iter()
        .any(|e| matches!(e, ServerEvent::NewNotification(_))));
    assert_eq!(hx.notifications.saved().await.len(), 2);
}

/// 完整呼叫生命周期：振铃、接通、挂断并落通话记录
#[tokio::test(start_paused = true)]
async fn call_lifecycle_end_to_end() {
    let hx = harness();
    let (alice, mut alice_rx) = connect(&hx, "alice", "s-a").await;
    let (bob, mut bob_rx) = connect(&hx, "bob", "s-b").await;
    drain(&mut alice_rx);
    drain(&mut bob_rx);

    hx.gateway
        .handle_event(
            &alice,
            ClientEvent::CallUser {
                user_to_call: "bob".to_string(),
                signal_data: serde_json::json!({"sdp": "offer"}),
                from_user: "alice".to_string(),
                name: "Alice".to_string(),
            },
        )
        .await
        .unwrap();

    let offers = drain(&mut bob_rx);
    let call_id = match offers.first() {
        Some(ServerEvent::CallOffer { call_id, .. }) => *call_id,
        other => panic!("expected call offer, got {:?}", other),
    };

    hx.gateway
        .handle_event(
            &bob,
            ClientEvent::AnswerCall {
                to: "alice".to_string(),
                signal: serde_json::json!({"sdp": "answer"}),
                call_id: Some(call_id),
            },
        )
        .await
        .unwrap();
    assert!(drain(&mut alice_rx)
        .iter()
        .any(|e| matches!(e, ServerEvent::CallAccepted { .. })));

    tokio::time::advance(Duration::from_secs(90)).await;

    hx.gateway
        .handle_event(
            &alice,
            ClientEvent::EndCall {
                to: "bob".to_string(),
                call_id: Some(call_id),
            },
        )
        .await
        .unwrap();

    assert!(drain(&mut bob_rx)
        .iter()
        .any(|e| matches!(e, ServerEvent::CallEnded)));
    assert!(hx.gateway.calls().live_call("alice", "bob").is_none());

    let saved = hx.messages.saved().await;
    assert_eq!(saved.len(), 1);
    assert_eq!(saved[0].message_type, MessageType::CallLog);
    assert!(saved[0].content.contains("Call ended"));
}

/// 同一用户的新连接顶掉旧连接，旧会话断连不影响新绑定
#[tokio::test]
async fn reconnect_displaces_previous_session() {
    let hx = harness();
    let (_old, mut old_rx) = connect(&hx, "alice", "s-old").await;
    let (_new, _new_rx) = connect(&hx, "alice", "s-new").await;

    // 旧会话的迟到断连不得解绑新会话
    hx.gateway.on_disconnect("s-old").await;
    assert!(hx.gateway.registry().is_bound("alice"));
    drain(&mut old_rx);

    hx.gateway.on_disconnect("s-new").await;
    assert!(!hx.gateway.registry().is_bound("alice"));
}
