//! Client tables converge to the server's over loopback TCP.

use std::sync::Arc;
use std::time::Duration;

use ntables::constants::ENTRY_PERSISTENT;
use ntables::constants::NET_MODE_CLIENT;
use ntables::constants::NOTIFY_DELETE;
use ntables::constants::NOTIFY_LOCAL;
use ntables::constants::NOTIFY_NEW;
use ntables::constants::NOTIFY_UPDATE;
use ntables::NtInstance;
use ntables::Value;
use parking_lot::Mutex;

use crate::common::double_of;
use crate::common::enable_logger;
use crate::common::new_client;
use crate::common::start_client;
use crate::common::start_server;
use crate::common::test_config;
use crate::common::wait_for;

#[tokio::test]
async fn test_handshake_delivers_server_table() {
    enable_logger();
    let (server, port) = start_server("server").await;
    server.set_entry_value("x", Value::Double(1.0)).unwrap();
    server.set_entry_value("names", Value::StringArray(vec!["a".into(), "b".into()])).unwrap();

    let client = start_client("client", port).await;
    assert_eq!(double_of(&client, "x"), Some(1.0));
    assert_eq!(
        client.get_entry_value("names").as_deref(),
        Some(&Value::StringArray(vec!["a".into(), "b".into()]))
    );
    assert_eq!(client.get_network_mode(), NET_MODE_CLIENT);

    assert!(wait_for(|| server.get_connections().len() == 1).await);
    let connections = server.get_connections();
    assert_eq!(connections[0].remote_id, "client");
    assert_eq!(connections[0].protocol_version, 0x0300);

    client.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn test_updates_flow_both_ways_and_between_clients() {
    enable_logger();
    let (server, port) = start_server("server").await;
    server.set_entry_value("x", Value::Double(1.0)).unwrap();
    let first = start_client("first", port).await;
    let second = start_client("second", port).await;

    server.set_entry_value("x", Value::Double(2.0)).unwrap();
    assert!(wait_for(|| double_of(&first, "x") == Some(2.0)).await);
    assert!(wait_for(|| double_of(&second, "x") == Some(2.0)).await);

    first.set_entry_value("from_first", Value::Boolean(true)).unwrap();
    assert!(wait_for(|| server.get_entry_value("from_first").is_some()).await);
    assert!(wait_for(|| second.get_entry_value("from_first").is_some()).await);

    second.set_entry_value("x", Value::Double(3.0)).unwrap();
    assert!(wait_for(|| double_of(&server, "x") == Some(3.0)).await);
    assert!(wait_for(|| double_of(&first, "x") == Some(3.0)).await);

    server.delete_entry("from_first");
    assert!(wait_for(|| first.get_entry_value("from_first").is_none()).await);
    assert!(wait_for(|| second.get_entry_value("from_first").is_none()).await);

    first.stop().await;
    second.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn test_client_entries_created_offline_reach_server() {
    enable_logger();
    let (server, port) = start_server("server").await;
    server.set_entry_value("shared", Value::Double(10.0)).unwrap();

    let client = new_client("client", port);
    client.set_entry_value("offline", Value::from("hello")).unwrap();
    client.start_client().unwrap();

    assert!(wait_for(|| server.get_entry_value("offline").is_some()).await);
    assert_eq!(server.get_entry_value("offline").as_deref(), Some(&Value::from("hello")));
    assert_eq!(double_of(&client, "shared"), Some(10.0));

    client.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn test_client_listener_sees_remote_changes() {
    enable_logger();
    let (server, port) = start_server("server").await;
    let client = start_client("client", port).await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    client.add_entry_listener("/tele/", NOTIFY_NEW | NOTIFY_UPDATE | NOTIFY_DELETE, move |event| {
        sink.lock().push((event.name.clone(), event.flags))
    });

    server.set_entry_value("/tele/voltage", Value::Double(12.5)).unwrap();
    assert!(wait_for(|| double_of(&client, "/tele/voltage") == Some(12.5)).await);
    server.set_entry_value("/tele/voltage", Value::Double(12.1)).unwrap();
    assert!(wait_for(|| double_of(&client, "/tele/voltage") == Some(12.1)).await);
    assert!(client.wait_for_entry_listener_queue(Some(Duration::from_secs(2))));

    let events = seen.lock().clone();
    assert_eq!(
        events,
        vec![
            ("/tele/voltage".to_string(), NOTIFY_NEW),
            ("/tele/voltage".to_string(), NOTIFY_UPDATE),
        ]
    );
    assert!(events.iter().all(|(_, flags)| flags & NOTIFY_LOCAL == 0));

    client.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn test_persistent_entries_are_saved_by_server() {
    enable_logger();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("networktables.ini");

    let server = Arc::new(NtInstance::new(test_config("server")));
    server
        .start_server(Some(path.clone()), crate::common::any_port())
        .await
        .unwrap();
    let port = server.local_addr().unwrap().port();
    let client = start_client("client", port).await;

    client.set_entry_value("/pref/gain", Value::Double(0.25)).unwrap();
    assert!(wait_for(|| server.get_entry_value("/pref/gain").is_some()).await);
    server.set_entry_flags("/pref/gain", ENTRY_PERSISTENT);
    assert!(wait_for(|| client.get_entry_flags("/pref/gain") == ENTRY_PERSISTENT).await);

    let saved = || {
        std::fs::read_to_string(&path)
            .map(|text| text.contains("double \"/pref/gain\"=0.25"))
            .unwrap_or(false)
    };
    assert!(wait_for(saved).await);

    client.stop().await;
    server.stop().await;
}
