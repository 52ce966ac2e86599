//! Clients ride out a server restart.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use ntables::constants::NET_MODE_CLIENT;
use ntables::constants::NET_MODE_FAILURE;
use ntables::NtInstance;
use ntables::Value;

use crate::common::double_of;
use crate::common::enable_logger;
use crate::common::new_client;
use crate::common::start_client;
use crate::common::start_server;
use crate::common::wait_for;

#[tokio::test]
async fn test_client_reconnects_after_server_restart() {
    enable_logger();
    let (server, port) = start_server("server").await;
    server.set_entry_value("x", Value::Double(1.0)).unwrap();
    let client = start_client("client", port).await;
    assert_eq!(double_of(&client, "x"), Some(1.0));

    server.stop().await;
    assert!(wait_for(|| !client.is_connected()).await);
    assert!(wait_for(|| client.get_network_mode() == NET_MODE_CLIENT | NET_MODE_FAILURE).await);

    // both sides move on while apart
    client.set_entry_value("y", Value::Double(5.0)).unwrap();
    server.set_entry_value("x", Value::Double(2.0)).unwrap();

    let addr: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();
    server.start_server(None, addr).await.unwrap();

    let single_connection = || {
        let connections = client.get_connections();
        assert!(connections.len() <= 1, "client holds {} connections", connections.len());
        client.is_connected()
    };
    assert!(wait_for(single_connection).await);
    assert_eq!(client.get_network_mode(), NET_MODE_CLIENT);

    assert!(wait_for(|| double_of(&client, "x") == Some(2.0)).await);
    assert!(wait_for(|| double_of(&server, "y") == Some(5.0)).await);

    client.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn test_stopped_client_is_not_connected() {
    enable_logger();
    let (server, port) = start_server("server").await;
    let client = start_client("client", port).await;
    assert!(wait_for(|| server.get_connections().len() == 1).await);

    client.stop().await;
    assert!(!client.is_connected());
    assert!(wait_for(|| server.get_connections().is_empty()).await);

    server.stop().await;
}

fn table_of(instance: &NtInstance) -> BTreeMap<String, Arc<Value>> {
    instance
        .get_entry_infos("", 0)
        .into_iter()
        .filter_map(|info| instance.get_entry_value(&info.name).map(|value| (info.name, value)))
        .collect()
}

fn connections_from(
    server: &NtInstance,
    remote_id: &str,
) -> usize {
    server.get_connections().iter().filter(|c| c.remote_id == remote_id).count()
}

#[tokio::test]
async fn test_repeated_client_restarts_leave_one_connection_and_equal_tables() {
    enable_logger();
    let (server, port) = start_server("server").await;
    server.set_entry_value("shared", Value::Double(1.0)).unwrap();

    let client = new_client("cycler", port);
    client.start_client().unwrap();
    assert!(wait_for(|| client.is_connected()).await);

    for cycle in 0..3 {
        client.set_entry_value(&format!("/cycle/{cycle}"), Value::Double(cycle as f64)).unwrap();
        server.set_entry_value("shared", Value::Double(10.0 + cycle as f64)).unwrap();

        client.stop().await;
        assert!(!client.is_connected());
        assert!(wait_for(|| connections_from(&server, "cycler") == 0).await);

        // written while no transport exists
        client.set_entry_value(&format!("/offline/{cycle}"), Value::Boolean(true)).unwrap();

        client.start_client().unwrap();
        let one_connection = || {
            let count = connections_from(&server, "cycler");
            assert!(count <= 1, "cycle {cycle}: server holds {count} connections from the client");
            count == 1 && client.is_connected()
        };
        assert!(wait_for(one_connection).await, "cycle {cycle}: client never came back");
        assert!(
            wait_for(|| table_of(&client) == table_of(&server)).await,
            "cycle {cycle}: tables diverged"
        );
    }

    let table = table_of(&server);
    assert_eq!(table.keys().filter(|name| name.starts_with("/cycle/")).count(), 3);
    assert_eq!(table.keys().filter(|name| name.starts_with("/offline/")).count(), 3);
    assert_eq!(table.get("shared").map(|v| v.as_double()), Some(Some(12.0)));
    assert_eq!(server.get_entry_infos("", 0).len(), table.len());

    client.stop().await;
    server.stop().await;
}
