use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A raw datagram received from the network, tagged with its UDP sender.
#[derive(Clone, Debug)]
pub struct Datagram {
    pub from: SocketAddrV4,
    pub data: Vec<u8>,
}

/// The narrow socket interface the protocol core consumes. Abstracted as a
/// trait so tests can substitute a mock or an in-memory network.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Socket: Send + Sync + 'static {
    /// Local address of the bound socket, `None` before it is opened.
    fn local_address(&self) -> Option<SocketAddrV4>;

    async fn send_to(&self, to: SocketAddrV4, data: &[u8]) -> io::Result<()>;

    /// Register a subscriber for received datagrams. Every subscriber gets a
    /// bounded channel; publication never blocks, and a datagram is dropped
    /// for a subscriber whose channel is full.
    fn subscribe(&self) -> mpsc::Receiver<Datagram>;
}

/// UDP-backed [`Socket`] with a single receive-loop task fanning out to all
/// subscribers.
pub struct UdpSocketAdapter {
    socket: Arc<UdpSocket>,
    subscribers: Arc<Mutex<Vec<mpsc::Sender<Datagram>>>>,
    channel_capacity: usize,
    read_loop: Mutex<Option<JoinHandle<()>>>,
}

impl UdpSocketAdapter {
    /// Bind a UDP socket on `local_ip` with an OS-assigned port and start the
    /// receive loop.
    pub async fn open(
        local_ip: Ipv4Addr,
        udp_buffer_size: usize,
        channel_capacity: usize,
    ) -> io::Result<Arc<UdpSocketAdapter>> {
        let socket = Arc::new(UdpSocket::bind(SocketAddrV4::new(local_ip, 0)).await?);
        info!("bound UDP socket to {:?}", socket.local_addr()?);

        let adapter = Arc::new(UdpSocketAdapter {
            socket: socket.clone(),
            subscribers: Arc::new(Mutex::new(Vec::new())),
            channel_capacity,
            read_loop: Mutex::new(None),
        });

        let handle = tokio::spawn(read_loop(
            socket,
            adapter.subscribers.clone(),
            udp_buffer_size,
        ));
        *adapter.read_loop.lock().unwrap() = Some(handle);

        Ok(adapter)
    }

    /// Stop the receive loop. Subscribers are left registered; they simply
    /// stop seeing datagrams.
    pub fn close(&self) {
        if let Some(handle) = self.read_loop.lock().unwrap().take() {
            handle.abort();
        }
    }
}

impl Drop for UdpSocketAdapter {
    fn drop(&mut self) {
        self.close();
    }
}

#[async_trait]
impl Socket for UdpSocketAdapter {
    fn local_address(&self) -> Option<SocketAddrV4> {
        match self.socket.local_addr() {
            Ok(SocketAddr::V4(addr)) => Some(addr),
            _ => None,
        }
    }

    async fn send_to(&self, to: SocketAddrV4, data: &[u8]) -> io::Result<()> {
        self.socket.send_to(data, SocketAddr::V4(to)).await?;
        Ok(())
    }

    fn subscribe(&self) -> mpsc::Receiver<Datagram> {
        let (tx, rx) = mpsc::channel(self.channel_capacity);
        self.subscribers.lock().unwrap().push(tx);
        rx
    }
}

async fn read_loop(
    socket: Arc<UdpSocket>,
    subscribers: Arc<Mutex<Vec<mpsc::Sender<Datagram>>>>,
    udp_buffer_size: usize,
) {
    let mut buf = vec![0u8; udp_buffer_size];
    loop {
        let (len, from) = match socket.recv_from(&mut buf).await {
            Ok(x) => x,
            Err(e) => {
                warn!("failed to read from UDP socket: {}", e);
                continue;
            }
        };

        let from = match from {
            SocketAddr::V4(addr) => addr,
            SocketAddr::V6(_) => {
                debug!("dropping datagram from non-IPv4 sender {:?}", from);
                continue;
            }
        };

        publish(
            &subscribers,
            Datagram {
                from,
                data: buf[..len].to_vec(),
            },
        );
    }
}

/// Non-blocking fan-out: a lagging subscriber loses the datagram, a closed
/// subscriber is dropped from the registry.
fn publish(subscribers: &Mutex<Vec<mpsc::Sender<Datagram>>>, datagram: Datagram) {
    let mut subscribers = subscribers.lock().unwrap();
    subscribers.retain(|tx| match tx.try_send(datagram.clone()) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
            debug!("subscriber channel full, dropping datagram");
            true
        }
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_datagram(byte: u8) -> Datagram {
        Datagram {
            from: SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 4000),
            data: vec![byte],
        }
    }

    #[tokio::test]
    async fn test_publish_fans_out_to_all_subscribers() {
        let subscribers = Mutex::new(Vec::new());
        let (tx1, mut rx1) = mpsc::channel(4);
        let (tx2, mut rx2) = mpsc::channel(4);
        subscribers.lock().unwrap().push(tx1);
        subscribers.lock().unwrap().push(tx2);

        publish(&subscribers, sample_datagram(7));

        assert_eq!(rx1.recv().await.unwrap().data, vec![7]);
        assert_eq!(rx2.recv().await.unwrap().data, vec![7]);
    }

    #[tokio::test]
    async fn test_publish_drops_for_full_subscriber_only() {
        let subscribers = Mutex::new(Vec::new());
        let (tx_full, mut rx_full) = mpsc::channel(1);
        let (tx_ok, mut rx_ok) = mpsc::channel(4);
        subscribers.lock().unwrap().push(tx_full);
        subscribers.lock().unwrap().push(tx_ok);

        publish(&subscribers, sample_datagram(1));
        publish(&subscribers, sample_datagram(2));

        assert_eq!(rx_full.recv().await.unwrap().data, vec![1]);
        assert!(rx_full.try_recv().is_err());

        assert_eq!(rx_ok.recv().await.unwrap().data, vec![1]);
        assert_eq!(rx_ok.recv().await.unwrap().data, vec![2]);
        assert_eq!(subscribers.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_publish_removes_closed_subscribers() {
        let subscribers = Mutex::new(Vec::new());
        let (tx, rx) = mpsc::channel(4);
        subscribers.lock().unwrap().push(tx);
        drop(rx);

        publish(&subscribers, sample_datagram(1));
        assert!(subscribers.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_loopback_roundtrip() {
        let adapter = UdpSocketAdapter::open(Ipv4Addr::LOCALHOST, 1500, 10)
            .await
            .unwrap();
        let local = adapter.local_address().unwrap();
        let mut rx = adapter.subscribe();

        adapter.send_to(local, b"ping").await.unwrap();

        let datagram = rx.recv().await.unwrap();
        assert_eq!(datagram.data, b"ping");
        assert_eq!(datagram.from, local);
    }
}
