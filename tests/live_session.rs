//! MeshSession end to end: mock device, config dump, DM round trip and
//! conversation persistence across restarts.

mod common;

use common::{FrameQueue, ME, PEER};
use meshscope::protocol::MessageStatus;
use meshscope::session::MeshSession;
use meshscope::storage::{JsonMessageStore, MessageRepository};
use meshscope::transport::ConnectionStatus;
use meshscope::validation::safe_filename;
use std::sync::Arc;
use wiremock::MockServer;

async fn start(server: &MockServer, dir: &std::path::Path) -> Arc<MeshSession> {
    let config = common::test_config(dir);
    let session = Arc::new(MeshSession::start(&config, &server.uri()).await.unwrap());
    let runner = Arc::clone(&session);
    tokio::spawn(async move { runner.run().await });
    session
}

#[tokio::test]
async fn config_dump_then_direct_message_round_trip() {
    let tmp = tempfile::tempdir().unwrap();
    let server = MockServer::start().await;
    let device = FrameQueue::default();
    device.mount(&server).await;

    let session = start(&server, tmp.path()).await;
    let request_id = session.request_config().await.unwrap();
    device.push(common::my_info(ME));
    device.push(common::node_info(PEER, "PR", "Peer Node"));
    device.push(common::config_complete(request_id));

    let state = Arc::clone(session.state());
    common::eventually("config dump", || {
        state.nodes().my_node_num() == Some(ME) && state.nodes().get_node(PEER).is_some()
    })
    .await;
    let status = session.status();
    common::eventually("connected", || status.borrow().is_connected()).await;

    let msg = session
        .send_direct_message(PEER, "radio check")
        .await
        .unwrap();
    let sent = common::sent_packets(&server).await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, PEER);
    assert_eq!(sent[0].from, ME);
    assert_eq!(sent[0].id, msg.packet_id);

    device.push(common::routing(PEER, ME, msg.packet_id, 0));
    common::eventually("ack", || {
        state
            .conversations()
            .conversation(PEER)
            .map(|c| c.messages[0].status == MessageStatus::Acked)
            .unwrap_or(false)
    })
    .await;

    session.shutdown().await;
    assert_eq!(
        session.transport().status(),
        ConnectionStatus::Disconnected(Some("user".into()))
    );

    let repo = JsonMessageStore::new(tmp.path().join("conversations"))
        .await
        .unwrap();
    let stored = repo.load(session.session_id()).await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].status, MessageStatus::Acked);
    assert!(tmp
        .path()
        .join("conversations")
        .join(format!("{}.json", safe_filename(session.session_id())))
        .exists());
}

#[tokio::test]
async fn conversations_survive_restart() {
    let tmp = tempfile::tempdir().unwrap();
    let server = MockServer::start().await;
    let device = FrameQueue::default();
    device.mount(&server).await;

    {
        let session = start(&server, tmp.path()).await;
        device.push(common::my_info(ME));
        device.push(common::text(PEER, ME, 501, "are you there?"));
        let state = Arc::clone(session.state());
        common::eventually("incoming dm", || {
            state.conversations().conversation(PEER).is_some()
        })
        .await;
        session.shutdown().await;
    }

    let session = start(&server, tmp.path()).await;
    let thread = session
        .state()
        .conversations()
        .conversation(PEER)
        .expect("history restored");
    assert_eq!(thread.messages.len(), 1);
    assert_eq!(thread.messages[0].text, "are you there?");

    // The same packet replayed by the device does not duplicate history.
    device.push(common::my_info(ME));
    device.push(common::text(PEER, ME, 501, "are you there?"));
    common::eventually("frames consumed", || device.pending() == 0).await;
    let state = Arc::clone(session.state());
    common::eventually("replay ingested", || state.packets().len() >= 2).await;
    assert_eq!(
        state.conversations().conversation(PEER).unwrap().messages.len(),
        1
    );

    // rebuild_derived re-reads stored history before replaying the log.
    session.rebuild_derived().await.unwrap();
    assert_eq!(
        state.conversations().conversation(PEER).unwrap().messages.len(),
        1
    );
    session.shutdown().await;
}

#[tokio::test]
async fn start_fails_when_device_is_down() {
    let tmp = tempfile::tempdir().unwrap();
    let config = common::test_config(tmp.path());
    let err = MeshSession::start(&config, "http://127.0.0.1:9")
        .await
        .err()
        .expect("start must fail");
    assert!(err.to_string().contains("unreachable"), "{err:#}");
}
