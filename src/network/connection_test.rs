use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tracing_test::traced_test;

use super::*;
use crate::notifier::ConnectionNotifier;
use crate::proto::Message;
use crate::proto::SequenceNumber;
use crate::proto::Value;

struct RejectingHandshake;

#[async_trait]
impl Handshake for RejectingHandshake {
    async fn handshake(
        &self,
        _conn: &Arc<dyn ConnectionHandle>,
        _channel: &mut dyn MessageChannel,
    ) -> bool {
        false
    }
}

async fn connected_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
    (client.unwrap(), accepted.unwrap().0)
}

#[tokio::test]
#[traced_test]
async fn test_batch_posted_after_teardown_is_logged() {
    let (stream, _peer) = connected_pair().await;
    let conn = NetworkConnection::new(
        1,
        stream,
        Arc::new(ConnectionNotifier::new(8)),
        None,
        Duration::from_secs(1),
    );
    let ignore: IncomingHandler = Arc::new(|_: Arc<Message>, _: &Arc<dyn ConnectionHandle>| {});
    conn.start(Arc::new(RejectingHandshake), ignore);
    conn.join().await;
    assert!(conn.is_dead());

    conn.queue_outgoing(Message::entry_update(
        0,
        SequenceNumber::new(2),
        Arc::new(Value::Double(1.0)),
    ));
    conn.post_outgoing(false);

    assert!(logs_contain("write task gone, dropping outgoing batch"));
}
