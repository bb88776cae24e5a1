//! Rendezvous client
//!
//! Sends a heartbeat on a fixed interval and hands every network map the
//! rendezvous sends back to a callback.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::protocol::{Heartbeat, NetworkMap};
use crate::transport::{DatagramConn, DatagramReceiver, DatagramSender};

/// Invoked on the read task for every valid network map
pub type NetworkMapCallback = Arc<dyn Fn(NetworkMap) + Send + Sync>;

pub struct RendezvousClient {
    network_name: String,
    conn: Mutex<Option<DatagramConn>>,
    heartbeat_interval: Duration,
    callback: NetworkMapCallback,
    shutdown: CancellationToken,
}

impl RendezvousClient {
    pub fn new(
        network_name: impl Into<String>,
        conn: DatagramConn,
        heartbeat_interval: Duration,
        callback: NetworkMapCallback,
    ) -> Self {
        Self {
            network_name: network_name.into(),
            conn: Mutex::new(Some(conn)),
            heartbeat_interval,
            callback,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn network_name(&self) -> &str {
        &self.network_name
    }

    /// Run the heartbeat and read loops until stopped or the connection closes
    pub async fn run(&self) -> Result<()> {
        let conn = self
            .conn
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or_else(|| Error::ContractViolation("rendezvous client already running".into()))?;

        let heartbeat = Heartbeat::new(self.network_name.as_str()).encode()?;
        let rendezvous = conn.remote_addr();
        let (sender, receiver) = conn.into_split();

        tracing::info!("Joining network {} via rendezvous {}", self.network_name, rendezvous);

        tokio::join!(self.send_loop(sender, heartbeat), self.read_loop(receiver));
        Ok(())
    }

    async fn send_loop(&self, sender: DatagramSender, heartbeat: Vec<u8>) {
        let mut ticker = tokio::time::interval(self.heartbeat_interval);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if let Err(e) = sender.send(&heartbeat).await {
                tracing::error!("Error sending heartbeat to {}: {}", sender.remote_addr(), e);
            }
        }
    }

    async fn read_loop(&self, mut receiver: DatagramReceiver) {
        loop {
            let datagram = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                datagram = receiver.recv() => match datagram {
                    Some(datagram) => datagram,
                    None => {
                        tracing::error!("Connection to rendezvous {} closed", receiver.remote_addr());
                        // Without a rendezvous there is nothing left to heartbeat for
                        self.shutdown.cancel();
                        break;
                    }
                },
            };

            match NetworkMap::decode(&datagram) {
                Ok(map) => {
                    tracing::debug!("Network map: {} members, we are #{}", map.addresses.len(), map.your_index);
                    (self.callback)(map);
                }
                Err(e) => tracing::warn!("Error decoding message from rendezvous: {}", e),
            }
        }
    }

    /// Stop both loops; a client that never ran drops its connection
    pub fn stop(&self) {
        self.shutdown.cancel();
        self.conn.lock().unwrap_or_else(|e| e.into_inner()).take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::bind_local;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::UdpSocket;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_network_map_reaches_callback() {
        let transport = bind_local("10.0.0.1").await;
        let rendezvous = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let callback: NetworkMapCallback = {
            let calls = Arc::clone(&calls);
            Arc::new(move |map: NetworkMap| {
                calls.fetch_add(1, Ordering::SeqCst);
                let _ = tx.send(map);
            })
        };

        let conn = transport.dial_plain(rendezvous.local_addr().unwrap()).unwrap();
        let client = Arc::new(RendezvousClient::new("testNet", conn, Duration::from_secs(1), callback));
        let task = tokio::spawn({
            let client = Arc::clone(&client);
            async move { client.run().await }
        });

        rendezvous
            .send_to(
                br#"{ "addresses": ["192.168.4.1:2000"], "your_index": 0 }"#,
                transport.local_addr().unwrap(),
            )
            .await
            .unwrap();

        let map = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert_eq!(map.addresses, vec!["192.168.4.1:2000".parse().unwrap()]);
        assert_eq!(map.your_index, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        client.stop();
        timeout(Duration::from_secs(1), task).await.unwrap().unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_sends_heartbeats() {
        let transport = bind_local("10.0.0.1").await;
        let rendezvous = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let conn = transport.dial_plain(rendezvous.local_addr().unwrap()).unwrap();
        let client = Arc::new(RendezvousClient::new(
            "testNet",
            conn,
            Duration::from_millis(20),
            Arc::new(|_: NetworkMap| {}),
        ));
        tokio::spawn({
            let client = Arc::clone(&client);
            async move { client.run().await }
        });

        let mut buf = [0u8; 1000];
        for _ in 0..3 {
            let (n, from) = timeout(Duration::from_secs(1), rendezvous.recv_from(&mut buf))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(from, transport.local_addr().unwrap());
            assert_eq!(Heartbeat::decode(&buf[..n]).unwrap().network_name, "testNet");
        }

        client.stop();
    }

    #[tokio::test]
    async fn test_garbage_is_skipped() {
        let transport = bind_local("10.0.0.1").await;
        let rendezvous = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let conn = transport.dial_plain(rendezvous.local_addr().unwrap()).unwrap();
        let client = Arc::new(RendezvousClient::new(
            "testNet",
            conn,
            Duration::from_secs(1),
            Arc::new(move |map: NetworkMap| {
                let _ = tx.send(map);
            }),
        ));
        tokio::spawn({
            let client = Arc::clone(&client);
            async move { client.run().await }
        });

        let member = transport.local_addr().unwrap();
        rendezvous.send_to(b"garbage", member).await.unwrap();
        rendezvous
            .send_to(br#"{ "addresses": ["10.1.1.1:1"], "your_index": 4 }"#, member)
            .await
            .unwrap();
        rendezvous
            .send_to(br#"{ "addresses": ["10.1.1.1:1"], "your_index": 0 }"#, member)
            .await
            .unwrap();

        let map = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert_eq!(map.your_index, 0);
        assert!(rx.try_recv().is_err());

        client.stop();
    }

    #[tokio::test]
    async fn test_run_twice_is_rejected() {
        let transport = bind_local("10.0.0.1").await;
        let conn = transport.dial_plain("127.0.0.1:9".parse().unwrap()).unwrap();
        let client = RendezvousClient::new("testNet", conn, Duration::from_secs(1), Arc::new(|_: NetworkMap| {}));

        client.stop();
        assert!(matches!(client.run().await, Err(Error::ContractViolation(_))));
        // The connection was released with the stop
        assert_eq!(transport.route_count(), 0);
    }
}
