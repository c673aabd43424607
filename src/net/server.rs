//! Server side of the volume transport
//!
//! Volumes handed to the server (through [`VolumeSink::accept`] or
//! [`VolumeServer::send_with`]) are queued and written to the connected
//! client in arrival order. One client is served at a time; after it
//! disconnects the next one is accepted.

use futures_util::SinkExt;
use log::{debug, error, info, trace, warn};
use socket2::TcpKeepalive;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Runtime;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedWrite;
use tokio_util::sync::CancellationToken;

use super::codec::VolumeCodec;
use super::health::{HealthMonitor, TransportHealth};
use crate::assets::KEEPALIVE_SECS;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::volume::{BufferPool, Shape, SharedVolume, Volume, VolumeSink, recycle_shared};

type QueueReceiver = Arc<tokio::sync::Mutex<mpsc::Receiver<SharedVolume>>>;

/// Runtime and listener alive between `open` and `close`
struct Listening {
    runtime: Runtime,
    listener: Arc<TcpListener>,
    local_addr: SocketAddr,
    cancel: Option<CancellationToken>,
    tasks: Vec<JoinHandle<()>>,
}

pub struct VolumeServer {
    pool: BufferPool,
    addr: SocketAddr,
    codec: VolumeCodec,
    acquire_timeout: Duration,
    idle_wait: Duration,
    health_check_interval: Option<Duration>,
    health: Arc<TransportHealth>,
    queue_tx: mpsc::Sender<SharedVolume>,
    queue_rx: QueueReceiver,
    lifecycle: Mutex<Option<Listening>>,
}

impl VolumeServer {
    /// Server streaming volumes acquired from `pool`.
    ///
    /// The send queue holds at most one volume per pooled buffer.
    pub fn new(pool: BufferPool, config: &Config) -> Result<Self> {
        let (queue_tx, queue_rx) = mpsc::channel(pool.capacity());
        Ok(Self {
            addr: config.socket_addr()?,
            codec: config.codec(),
            acquire_timeout: config.acquire_timeout(),
            idle_wait: config.idle_wait(),
            health_check_interval: config.health_check_interval(),
            health: Arc::new(TransportHealth::new()),
            queue_tx,
            queue_rx: Arc::new(tokio::sync::Mutex::new(queue_rx)),
            lifecycle: Mutex::new(None),
            pool,
        })
    }

    fn lifecycle(&self) -> MutexGuard<'_, Option<Listening>> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bind the configured address.
    pub fn open(&self) -> Result<()> {
        self.open_at(self.addr)
    }

    /// Bind `addr`. Port 0 picks an ephemeral port, see [`local_addr`](Self::local_addr).
    pub fn open_at(&self, addr: SocketAddr) -> Result<()> {
        let mut lifecycle = self.lifecycle();
        if lifecycle.is_some() {
            return Err(Error::InvalidState("server already open"));
        }

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("volcast-server")
            .enable_all()
            .build()?;

        let std_listener = std::net::TcpListener::bind(addr)?;
        std_listener.set_nonblocking(true)?;
        let local_addr = std_listener.local_addr()?;
        let listener = {
            let _guard = runtime.enter();
            TcpListener::from_std(std_listener)?
        };

        info!("VolumeServer: listening on {}", local_addr);
        *lifecycle = Some(Listening {
            runtime,
            listener: Arc::new(listener),
            local_addr,
            cancel: None,
            tasks: Vec::new(),
        });
        Ok(())
    }

    /// Start accepting clients and streaming queued volumes. Idempotent.
    pub fn start(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle();
        let listening = lifecycle
            .as_mut()
            .ok_or(Error::InvalidState("server not open"))?;
        if listening.cancel.is_some() {
            return Ok(());
        }

        let cancel = CancellationToken::new();
        let session = Session {
            listener: Arc::clone(&listening.listener),
            queue: Arc::clone(&self.queue_rx),
            codec: self.codec.clone(),
            idle_wait: self.idle_wait,
            health: Arc::clone(&self.health),
            cancel: cancel.clone(),
        };
        listening.tasks.push(listening.runtime.spawn(session.run()));

        if let Some(interval) = self.health_check_interval {
            let monitor = HealthMonitor::new(Arc::clone(&self.health)).with_check_interval(interval);
            let cancel = cancel.clone();
            listening.tasks.push(listening.runtime.spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = monitor.run() => {}
                }
            }));
        }

        listening.cancel = Some(cancel);
        info!("VolumeServer: started");
        Ok(())
    }

    /// Stop streaming and disconnect the current client. Idempotent.
    ///
    /// Must not be called from within an async context.
    pub fn stop(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle();
        let Some(listening) = lifecycle.as_mut() else {
            return Ok(());
        };
        let Some(cancel) = listening.cancel.take() else {
            return Ok(());
        };

        cancel.cancel();
        for task in listening.tasks.drain(..) {
            if let Err(e) = listening.runtime.block_on(task) {
                error!("VolumeServer: task failed: {}", e);
            }
        }
        info!("VolumeServer: stopped");
        Ok(())
    }

    /// Stop, release the listener and return every queued volume to its pool.
    pub fn close(&self) -> Result<()> {
        self.stop()?;
        if let Some(listening) = self.lifecycle().take() {
            drop(listening.listener);
            listening.runtime.shutdown_timeout(Duration::from_millis(100));
            info!("VolumeServer: closed");
        }

        if let Ok(mut queue) = self.queue_rx.try_lock() {
            let mut discarded = 0;
            while let Ok(volume) = queue.try_recv() {
                if let Err(e) = recycle_shared(volume) {
                    debug!("VolumeServer: queued volume not recycled: {}", e);
                }
                discarded += 1;
            }
            if discarded > 0 {
                debug!("VolumeServer: discarded {} queued volumes", discarded);
            }
        }
        Ok(())
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.lifecycle().as_ref().map(|listening| listening.local_addr)
    }

    pub fn is_running(&self) -> bool {
        self.lifecycle()
            .as_ref()
            .is_some_and(|listening| listening.cancel.is_some())
    }

    pub fn health(&self) -> &Arc<TransportHealth> {
        &self.health
    }

    /// Volumes queued but not yet written
    pub fn pending(&self) -> usize {
        self.queue_tx.max_capacity() - self.queue_tx.capacity()
    }

    /// Acquire a buffer for `shape`, let `fill` write it, and queue it.
    ///
    /// Blocks for at most the configured acquire timeout. Returns `false`
    /// when the frame was dropped because no buffer or queue slot was free.
    pub fn send_with<F>(&self, shape: Shape, fill: F) -> Result<bool>
    where
        F: FnOnce(&mut Volume),
    {
        match self.pool.acquire(self.acquire_timeout, shape) {
            Ok(mut volume) => {
                fill(&mut volume);
                Ok(self.enqueue(Arc::new(volume)))
            }
            Err(Error::PoolExhausted { timeout }) => {
                self.health.record_frame_drop();
                warn!(
                    "VolumeServer: no free buffer within {:?}, dropping frame",
                    timeout
                );
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    fn enqueue(&self, volume: SharedVolume) -> bool {
        match self.queue_tx.try_send(volume) {
            Ok(()) => true,
            Err(TrySendError::Full(volume)) | Err(TrySendError::Closed(volume)) => {
                self.health.record_frame_drop();
                warn!(
                    "VolumeServer: send queue full, dropping channel {} time index {}",
                    volume.channel, volume.time_index
                );
                if let Err(e) = recycle_shared(volume) {
                    debug!("VolumeServer: dropped volume not recycled: {}", e);
                }
                false
            }
        }
    }
}

impl VolumeSink for VolumeServer {
    fn accept(&self, volume: SharedVolume) -> Result<()> {
        self.enqueue(volume);
        Ok(())
    }

    fn pool(&self) -> BufferPool {
        self.pool.clone()
    }
}

impl Drop for VolumeServer {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!("VolumeServer: close failed: {}", e);
        }
    }
}

/// State of one running accept/stream loop
struct Session {
    listener: Arc<TcpListener>,
    queue: QueueReceiver,
    codec: VolumeCodec,
    idle_wait: Duration,
    health: Arc<TransportHealth>,
    cancel: CancellationToken,
}

impl Session {
    async fn run(self) {
        let mut queue = self.queue.lock().await;
        loop {
            let accepted = tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };
            let (stream, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    self.health.record_network_error();
                    warn!("VolumeServer: accept failed: {}", e);
                    tokio::time::sleep(self.idle_wait).await;
                    continue;
                }
            };

            info!("VolumeServer: client {} connected", peer);
            configure_stream(&stream);
            match self.stream_to(stream, &mut queue).await {
                Ok(()) => info!("VolumeServer: client {} released", peer),
                Err(e) => {
                    self.health.record_network_error();
                    warn!("VolumeServer: client {} disconnected: {}", peer, e);
                }
            }
        }
    }

    /// Write queued volumes until cancelled or the connection fails.
    async fn stream_to(
        &self,
        stream: TcpStream,
        queue: &mut mpsc::Receiver<SharedVolume>,
    ) -> Result<()> {
        let mut framed = FramedWrite::new(stream, self.codec.clone());
        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                next = tokio::time::timeout(self.idle_wait, queue.recv()) => next,
            };
            let volume = match next {
                Ok(Some(volume)) => volume,
                Ok(None) => return Ok(()),
                // idle: nothing queued, keep the connection
                Err(_) => continue,
            };

            let size = volume.byte_len();
            trace!(
                "VolumeServer: sending channel {} time index {} ({} bytes)",
                volume.channel, volume.time_index, size
            );
            let sent = tokio::select! {
                _ = self.cancel.cancelled() => {
                    // possibly half written; the connection is dropped with it
                    self.health.record_frame_drop();
                    warn!(
                        "VolumeServer: stopped while sending channel {} time index {}, frame dropped",
                        volume.channel, volume.time_index
                    );
                    return Ok(());
                }
                sent = framed.send(Arc::clone(&volume)) => sent,
            };
            match sent {
                Ok(()) => self.health.record_frame(size),
                // rejected before any byte was buffered, the stream is intact
                Err(Error::MalformedFrame(reason)) => {
                    self.health.record_frame_drop();
                    warn!("VolumeServer: cannot encode frame, dropping it: {}", reason);
                }
                Err(e) => return Err(e),
            }

            if let Err(e) = recycle_shared(volume) {
                debug!("VolumeServer: sent volume not recycled: {}", e);
            }
        }
    }
}

fn configure_stream(stream: &TcpStream) {
    if let Err(e) = stream.set_nodelay(true) {
        warn!("VolumeServer: cannot set TCP_NODELAY: {}", e);
    }

    let sock_ref = socket2::SockRef::from(stream);
    let keep_alive = TcpKeepalive::new().with_time(Duration::from_secs(KEEPALIVE_SECS));
    if let Err(e) = sock_ref.set_tcp_keepalive(&keep_alive) {
        warn!("VolumeServer: cannot enable keepalive: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::codec::{FrameHeader, HEADER_LEN};
    use crate::volume::ElementType;
    use std::io::Read;
    use std::time::Instant;

    fn loopback_config() -> Config {
        let mut config = Config::default();
        config.network.port = 0;
        config.pool.acquire_timeout_ms = 20;
        config
    }

    #[test]
    fn test_lifecycle_order() {
        let server = VolumeServer::new(BufferPool::new(2), &loopback_config()).unwrap();
        assert!(matches!(server.start(), Err(Error::InvalidState(_))));
        assert!(server.stop().is_ok());

        server.open().unwrap();
        assert!(matches!(server.open(), Err(Error::InvalidState(_))));
        assert!(server.local_addr().is_some());

        server.start().unwrap();
        server.start().unwrap();
        assert!(server.is_running());

        let stopping = Instant::now();
        server.stop().unwrap();
        server.stop().unwrap();
        assert!(!server.is_running());
        assert!(stopping.elapsed() < Duration::from_secs(2));

        server.close().unwrap();
        assert!(server.local_addr().is_none());
        server.close().unwrap();
    }

    #[test]
    fn test_send_with_drops_on_exhausted_pool() {
        let server = VolumeServer::new(BufferPool::new(2), &loopback_config()).unwrap();
        let shape = Shape::new(ElementType::U8, 1, 2, 2, 2);

        assert!(server.send_with(shape, |_| {}).unwrap());
        assert!(server.send_with(shape, |_| {}).unwrap());
        assert!(!server.send_with(shape, |_| {}).unwrap());
        assert_eq!(server.health().frame_drops(), 1);
        assert_eq!(server.pending(), 2);

        server.close().unwrap();
        assert_eq!(server.pool().checked_out(), 0);
    }

    #[test]
    fn test_streams_queued_volumes_in_order() {
        let server = VolumeServer::new(BufferPool::new(4), &loopback_config()).unwrap();
        server.open().unwrap();
        server.start().unwrap();

        let shape = Shape::new(ElementType::U8, 1, 3, 1, 1);
        for index in 0..3 {
            let queued = server
                .send_with(shape, |volume| {
                    volume.stamp(7, index, index as f64);
                    volume.data_mut().fill(index as u8);
                })
                .unwrap();
            assert!(queued);
        }

        let mut client = std::net::TcpStream::connect(server.local_addr().unwrap()).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        for index in 0..3 {
            let mut header = [0u8; HEADER_LEN];
            client.read_exact(&mut header).unwrap();
            let header = FrameHeader::read(&mut &header[..]);
            assert_eq!(header.channel, 7);
            assert_eq!(header.time_index, index);
            assert_eq!(header.dims, [3, 1, 1]);

            let mut payload = vec![0u8; header.payload_len as usize];
            client.read_exact(&mut payload).unwrap();
            assert_eq!(payload, vec![index as u8; 3]);
        }

        let deadline = Instant::now() + Duration::from_secs(5);
        while server.health().frames() < 3 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(server.health().frames(), 3);

        server.close().unwrap();
        assert_eq!(server.pool().checked_out(), 0);
    }

    fn read_frame(client: &mut std::net::TcpStream) -> std::io::Result<FrameHeader> {
        let mut header = [0u8; HEADER_LEN];
        client.read_exact(&mut header)?;
        let header = FrameHeader::read(&mut &header[..]);
        let mut payload = vec![0u8; header.payload_len as usize];
        client.read_exact(&mut payload)?;
        Ok(header)
    }

    #[test]
    fn test_stop_unblocks_stalled_client_and_serves_next() {
        let server = VolumeServer::new(BufferPool::new(8), &loopback_config()).unwrap();
        server.open().unwrap();
        server.start().unwrap();
        let addr = server.local_addr().unwrap();

        // connected but never reading, so the socket buffers fill up
        let stalled = std::net::TcpStream::connect(addr).unwrap();
        let shape = Shape::new(ElementType::U8, 1, 256, 256, 128);
        for index in 0..8 {
            let queued = server
                .send_with(shape, |volume| volume.stamp(0, index, 0.0))
                .unwrap();
            assert!(queued);
        }

        let deadline = Instant::now() + Duration::from_secs(5);
        while server.pending() == 8 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        // let the writer settle on the frame the socket can not take
        std::thread::sleep(Duration::from_millis(200));
        let written = server.health().frames();
        assert!(written < 7);

        let stopping = Instant::now();
        server.stop().unwrap();
        assert!(stopping.elapsed() < Duration::from_secs(2));
        // the frame interrupted mid-write is accounted as a drop
        assert_eq!(server.health().frame_drops(), 1);
        drop(stalled);

        server.start().unwrap();
        let mut next = std::net::TcpStream::connect(addr).unwrap();
        next.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let first = read_frame(&mut next).unwrap();
        assert_eq!(first.time_index, written as i64 + 1);
        assert_eq!(first.dims, [256, 256, 128]);

        server.close().unwrap();
        assert_eq!(server.pool().checked_out(), 0);
    }
}
