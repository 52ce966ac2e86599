//! RPC calls made by a client and answered on the server.

use std::time::Duration;

use ntables::RpcOutcome;

use crate::common::enable_logger;
use crate::common::start_client;
use crate::common::start_server;
use crate::common::wait_for;

fn is_rpc_entry(
    instance: &ntables::NtInstance,
    name: &str,
) -> bool {
    instance.get_entry_value(name).is_some_and(|v| v.is_rpc())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_client_calls_server_callback() {
    enable_logger();
    let (server, port) = start_server("server").await;
    let sum = server.get_entry("/rpc/sum").unwrap();
    server
        .create_rpc(sum, vec![0x01], |answer| {
            let total: u32 = answer.params.iter().map(|b| *b as u32).sum();
            total.to_be_bytes().to_vec()
        })
        .unwrap();

    let client = start_client("caller", port).await;
    assert!(wait_for(|| is_rpc_entry(&client, "/rpc/sum")).await);
    let entry = client.get_entry("/rpc/sum").unwrap();
    let call_uid = client.call_rpc(entry, vec![1, 2, 3, 250]).unwrap();

    let waiter = client.clone();
    let outcome = tokio::task::spawn_blocking(move || {
        waiter.get_rpc_result(entry, call_uid, Some(Duration::from_secs(5)))
    })
    .await
    .unwrap();
    assert_eq!(outcome, RpcOutcome::Ready(256u32.to_be_bytes().to_vec()));

    // the slot is consumed by the first wait
    assert_eq!(client.get_rpc_result(entry, call_uid, Some(Duration::ZERO)), RpcOutcome::NotPending);

    client.stop().await;
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_polled_rpc_sees_remote_caller() {
    enable_logger();
    let (server, port) = start_server("server").await;
    let poller = server.create_rpc_call_poller();
    let echo = server.get_entry("/rpc/echo").unwrap();
    server.create_polled_rpc(echo, Vec::new(), poller).unwrap();

    let client = start_client("caller", port).await;
    assert!(wait_for(|| is_rpc_entry(&client, "/rpc/echo")).await);
    let entry = client.get_entry("/rpc/echo").unwrap();
    let call_uid = client.call_rpc(entry, b"ping".to_vec()).unwrap();

    let handler = server.clone();
    let answered = tokio::task::spawn_blocking(move || {
        let polled = handler.poll_rpc(poller, Some(Duration::from_secs(5)));
        let calls = polled.events;
        assert_eq!(calls.len(), 1);
        let call = &calls[0];
        assert_eq!(call.name, "/rpc/echo");
        assert_eq!(call.conn.remote_id, "caller");
        handler.post_rpc_response(call.entry, call.call_uid, call.params.clone())
    })
    .await
    .unwrap();
    assert!(answered);

    let waiter = client.clone();
    let outcome = tokio::task::spawn_blocking(move || {
        waiter.get_rpc_result(entry, call_uid, Some(Duration::from_secs(5)))
    })
    .await
    .unwrap();
    assert_eq!(outcome, RpcOutcome::Ready(b"ping".to_vec()));

    client.stop().await;
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unanswered_call_can_be_canceled() {
    enable_logger();
    let (server, port) = start_server("server").await;
    let poller = server.create_rpc_call_poller();
    let slow = server.get_entry("/rpc/slow").unwrap();
    server.create_polled_rpc(slow, Vec::new(), poller).unwrap();

    let client = start_client("caller", port).await;
    assert!(wait_for(|| is_rpc_entry(&client, "/rpc/slow")).await);
    let entry = client.get_entry("/rpc/slow").unwrap();
    let call_uid = client.call_rpc(entry, Vec::new()).unwrap();

    assert_eq!(
        client.get_rpc_result(entry, call_uid, Some(Duration::from_millis(20))),
        RpcOutcome::TimedOut
    );

    let waiter = client.clone();
    let pending = tokio::task::spawn_blocking(move || waiter.get_rpc_result(entry, call_uid, None));
    tokio::time::sleep(Duration::from_millis(50)).await;
    client.cancel_rpc_result(entry, call_uid);
    assert_eq!(pending.await.unwrap(), RpcOutcome::Canceled);

    client.stop().await;
    server.destroy_rpc_call_poller(poller);
    server.stop().await;
}
