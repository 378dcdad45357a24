mod support;

use std::time::Duration;

use tokio::time::timeout;

use redrive::{Command, ConnState, Connection, ConnectionConfig, DriverError, ProtocolVersion, RespValue};
use support::{bulk, MockNode};

fn config_for(node: &MockNode) -> ConnectionConfig {
    ConnectionConfig::new(node.server_addr())
}

#[tokio::test]
async fn test_set_get_round_trip() {
    let node = MockNode::start().await;
    let conn = Connection::connect(config_for(&node)).await.unwrap();

    let reply = conn
        .send(Command::new("SET").arg("k").arg("v"))
        .await
        .unwrap();
    assert_eq!(reply, RespValue::Simple("OK".to_string()));

    let reply = conn.send(Command::new("GET").arg("k")).await.unwrap();
    assert_eq!(reply, bulk("v"));

    let reply = conn.send(Command::new("GET").arg("missing")).await.unwrap();
    assert_eq!(reply, RespValue::Null);
}

#[tokio::test]
async fn test_pipelined_replies_arrive_in_submission_order() {
    let node = MockNode::start().await;
    let conn = Connection::connect(config_for(&node)).await.unwrap();

    // Dispatch without awaiting so all three share the wire; the mock
    // node coalesces the three replies into one socket write.
    let first = conn.dispatch(Command::new("ECHO").arg("one")).unwrap();
    let second = conn.dispatch(Command::new("ECHO").arg("two")).unwrap();
    let third = conn.dispatch(Command::new("ECHO").arg("three")).unwrap();

    assert_eq!(first.wait().await.unwrap(), bulk("one"));
    assert_eq!(second.wait().await.unwrap(), bulk("two"));
    assert_eq!(third.wait().await.unwrap(), bulk("three"));
}

#[tokio::test]
async fn test_commands_queued_while_connecting_flush_in_order() {
    let node = MockNode::start().await;

    // `open` returns before the dial finishes, so these dispatches land
    // in the inbox while the connection is still Connecting.
    let conn = Connection::open(config_for(&node));
    let first = conn.dispatch(Command::new("ECHO").arg("early")).unwrap();
    let second = conn.dispatch(Command::new("ECHO").arg("later")).unwrap();

    assert_eq!(first.wait().await.unwrap(), bulk("early"));
    assert_eq!(second.wait().await.unwrap(), bulk("later"));
    assert_eq!(conn.state(), ConnState::Connected);
}

#[tokio::test]
async fn test_push_between_replies_goes_to_subscriber() {
    let node = MockNode::start().await;
    let conn = Connection::connect(config_for(&node)).await.unwrap();

    let mut pushes = conn.subscribe(vec!["news".to_string()]).await.unwrap();

    // Script the node to slip a pub/sub message between two correlated
    // replies inside one reply batch.
    node.set_handler(|args| match args {
        [get, key, ..] if get == "GET" && key == "k1" => Some(vec![bulk("v1")]),
        [get, key, ..] if get == "GET" && key == "k2" => Some(vec![
            RespValue::Array(vec![bulk("message"), bulk("news"), bulk("hello")]),
            bulk("v2"),
        ]),
        _ => None,
    });

    let first = conn.dispatch(Command::new("GET").arg("k1")).unwrap();
    let second = conn.dispatch(Command::new("GET").arg("k2")).unwrap();

    // The push consumed no pending slot: both replies correlate cleanly.
    assert_eq!(first.wait().await.unwrap(), bulk("v1"));
    assert_eq!(second.wait().await.unwrap(), bulk("v2"));

    let message = timeout(Duration::from_secs(2), pushes.recv())
        .await
        .expect("push should arrive")
        .expect("subscription should be live");
    assert_eq!(message.channel(), Some("news"));
    assert_eq!(message.payload(), Some(&bulk("hello")));

    assert_eq!(conn.state(), ConnState::Connected);
}

#[tokio::test]
async fn test_disconnect_fails_every_pending_request() {
    let node = MockNode::start().await;
    let conn = Connection::connect(config_for(&node)).await.unwrap();

    let first = conn.dispatch(Command::new("ECHO").arg("ok")).unwrap();
    // CRASH makes the node drop the socket without replying.
    let second = conn.dispatch(Command::new("CRASH")).unwrap();
    let third = conn.dispatch(Command::new("ECHO").arg("never")).unwrap();

    assert_eq!(first.wait().await.unwrap(), bulk("ok"));
    assert!(matches!(
        second.wait().await,
        Err(DriverError::ConnectionClosed)
    ));
    assert!(matches!(
        third.wait().await,
        Err(DriverError::ConnectionClosed)
    ));

    timeout(Duration::from_secs(2), conn.closed())
        .await
        .expect("close observer should fire");
    assert_eq!(conn.state(), ConnState::Disconnected);

    // New submissions fail immediately on a dead connection.
    assert!(conn.send(Command::new("PING")).await.is_err());
}

#[tokio::test]
async fn test_reply_without_request_kills_the_connection() {
    let node = MockNode::start().await;
    let conn = Connection::connect(config_for(&node)).await.unwrap();

    // Two replies for one request: the second one is unaccounted for and
    // the byte stream can no longer be trusted.
    node.set_handler(|args| match args {
        [ping, ..] if ping == "PING" => Some(vec![
            RespValue::Simple("PONG".to_string()),
            RespValue::Simple("PONG".to_string()),
        ]),
        _ => None,
    });

    let reply = conn.send(Command::new("PING")).await.unwrap();
    assert_eq!(reply, RespValue::Simple("PONG".to_string()));

    timeout(Duration::from_secs(2), conn.closed())
        .await
        .expect("stray reply should be fatal");
    assert!(conn.send(Command::new("PING")).await.is_err());
}

#[tokio::test]
async fn test_subscribe_family_reply_counting() {
    let node = MockNode::start().await;
    let conn = Connection::connect(config_for(&node)).await.unwrap();

    // One confirmation per channel; the subscribe call resolves only when
    // all three arrived.
    let _pushes = conn
        .subscribe(vec!["a".to_string(), "b".to_string(), "c".to_string()])
        .await
        .unwrap();

    // Bare unsubscribe is confirmed once per registration made above. If
    // the expected count were wrong the next reply would misalign and the
    // PING below would fail or hang.
    conn.unsubscribe(vec![]).await.unwrap();

    let reply = conn.send(Command::new("PING")).await.unwrap();
    assert_eq!(reply, RespValue::Simple("PONG".to_string()));
}

#[tokio::test]
async fn test_unsubscribe_with_nothing_registered_still_correlates() {
    let node = MockNode::start().await;
    let conn = Connection::connect(config_for(&node)).await.unwrap();

    // The server sends exactly one confirmation even though nothing was
    // registered; the driver must expect exactly one.
    conn.unsubscribe(vec![]).await.unwrap();

    let reply = conn.send(Command::new("PING")).await.unwrap();
    assert_eq!(reply, RespValue::Simple("PONG".to_string()));
}

#[tokio::test]
async fn test_resp3_preference_falls_back_on_old_servers() {
    let node = MockNode::start().await;
    let mut config = config_for(&node);
    config.protocol = ProtocolVersion::Resp3;

    // The mock node rejects HELLO like a pre-RESP3 server would; the
    // connection must still come up in RESP2 mode.
    let conn = Connection::connect(config).await.unwrap();
    let reply = conn.send(Command::new("PING")).await.unwrap();
    assert_eq!(reply, RespValue::Simple("PONG".to_string()));

    assert_eq!(node.count_commands("HELLO 3"), 1);
}

#[tokio::test]
async fn test_graceful_close_notifies_observer_once() {
    let node = MockNode::start().await;
    let conn = Connection::connect(config_for(&node)).await.unwrap();

    let observer = {
        let conn = conn.clone();
        tokio::spawn(async move { conn.closed().await })
    };

    conn.close().await;

    timeout(Duration::from_secs(2), observer)
        .await
        .expect("observer should resolve")
        .unwrap();
    assert_eq!(conn.state(), ConnState::Disconnected);
}
