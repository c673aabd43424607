//! Client side of the volume transport
//!
//! Frames read from the server are copied into buffers of the sink's pool
//! and pushed into the sink, typically a [`TimelineStore`](crate::timeline::TimelineStore).

use futures_util::StreamExt;
use log::{error, info, trace, warn};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::runtime::Runtime;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;

use super::codec::{VolumeCodec, WireFrame};
use super::health::{HealthMonitor, TransportHealth};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::volume::VolumeSink;

type Framed = FramedRead<TcpStream, VolumeCodec>;

/// Connection state between `open` and `close`
struct Connected {
    runtime: Runtime,
    /// Parked here while stopped; the receive task owns it while running
    framed: Option<Framed>,
    cancel: Option<CancellationToken>,
    receiver: Option<JoinHandle<Option<Framed>>>,
    monitor: Option<JoinHandle<()>>,
}

pub struct VolumeClient {
    sink: Arc<dyn VolumeSink>,
    addr: SocketAddr,
    codec: VolumeCodec,
    acquire_timeout: Duration,
    health_check_interval: Option<Duration>,
    health: Arc<TransportHealth>,
    lifecycle: Mutex<Option<Connected>>,
}

impl VolumeClient {
    pub fn new(sink: Arc<dyn VolumeSink>, config: &Config) -> Result<Self> {
        Ok(Self {
            sink,
            addr: config.socket_addr()?,
            codec: config.codec(),
            acquire_timeout: config.acquire_timeout(),
            health_check_interval: config.health_check_interval(),
            health: Arc::new(TransportHealth::new()),
            lifecycle: Mutex::new(None),
        })
    }

    fn lifecycle(&self) -> MutexGuard<'_, Option<Connected>> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Connect to the configured server address.
    pub fn open(&self) -> Result<()> {
        self.open_at(self.addr)
    }

    /// Connect to `addr`.
    ///
    /// Must not be called from within an async context.
    pub fn open_at(&self, addr: SocketAddr) -> Result<()> {
        let mut lifecycle = self.lifecycle();
        if lifecycle.is_some() {
            return Err(Error::InvalidState("client already open"));
        }

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("volcast-client")
            .enable_all()
            .build()?;
        let stream = runtime.block_on(TcpStream::connect(addr))?;
        stream.set_nodelay(true)?;

        info!("VolumeClient: connected to {}", addr);
        *lifecycle = Some(Connected {
            runtime,
            framed: Some(FramedRead::new(stream, self.codec.clone())),
            cancel: None,
            receiver: None,
            monitor: None,
        });
        Ok(())
    }

    /// Start reading frames into the sink. Idempotent.
    pub fn start(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle();
        let connected = lifecycle
            .as_mut()
            .ok_or(Error::InvalidState("client not open"))?;
        if connected.cancel.is_some() {
            return Ok(());
        }
        let framed = connected
            .framed
            .take()
            .ok_or(Error::InvalidState("connection closed"))?;

        let cancel = CancellationToken::new();
        let delivery = Delivery {
            sink: Arc::clone(&self.sink),
            acquire_timeout: self.acquire_timeout,
            health: Arc::clone(&self.health),
        };
        connected.receiver = Some(
            connected
                .runtime
                .spawn(delivery.receive(framed, cancel.clone())),
        );

        if let Some(interval) = self.health_check_interval {
            let monitor = HealthMonitor::new(Arc::clone(&self.health)).with_check_interval(interval);
            let cancel = cancel.clone();
            connected.monitor = Some(connected.runtime.spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = monitor.run() => {}
                }
            }));
        }

        connected.cancel = Some(cancel);
        info!("VolumeClient: started");
        Ok(())
    }

    /// Stop reading; the connection stays open for a later `start`. Idempotent.
    ///
    /// Must not be called from within an async context.
    pub fn stop(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle();
        let Some(connected) = lifecycle.as_mut() else {
            return Ok(());
        };
        let Some(cancel) = connected.cancel.take() else {
            return Ok(());
        };

        cancel.cancel();
        if let Some(receiver) = connected.receiver.take() {
            match connected.runtime.block_on(receiver) {
                Ok(framed) => connected.framed = framed,
                Err(e) => error!("VolumeClient: receive task failed: {}", e),
            }
        }
        if let Some(monitor) = connected.monitor.take() {
            if let Err(e) = connected.runtime.block_on(monitor) {
                error!("VolumeClient: health monitor failed: {}", e);
            }
        }
        info!("VolumeClient: stopped");
        Ok(())
    }

    /// Stop and drop the connection.
    pub fn close(&self) -> Result<()> {
        self.stop()?;
        if let Some(connected) = self.lifecycle().take() {
            drop(connected.framed);
            connected.runtime.shutdown_timeout(Duration::from_millis(100));
            info!("VolumeClient: closed");
        }
        Ok(())
    }

    /// Whether the receive task is still reading frames
    pub fn is_receiving(&self) -> bool {
        self.lifecycle()
            .as_ref()
            .and_then(|connected| connected.receiver.as_ref())
            .is_some_and(|receiver| !receiver.is_finished())
    }

    pub fn health(&self) -> &Arc<TransportHealth> {
        &self.health
    }
}

impl Drop for VolumeClient {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!("VolumeClient: close failed: {}", e);
        }
    }
}

/// Moves decoded frames into the sink
struct Delivery {
    sink: Arc<dyn VolumeSink>,
    acquire_timeout: Duration,
    health: Arc<TransportHealth>,
}

impl Delivery {
    /// Read until cancelled (handing the connection back) or the connection ends.
    async fn receive(self, mut framed: Framed, cancel: CancellationToken) -> Option<Framed> {
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return Some(framed),
                next = framed.next() => next,
            };

            match next {
                Some(Ok(frame)) => self.deliver(frame),
                Some(Err(Error::MalformedFrame(reason))) => {
                    self.health.record_malformed_frame();
                    warn!("VolumeClient: malformed frame, closing connection: {}", reason);
                    return None;
                }
                Some(Err(e)) => {
                    self.health.record_network_error();
                    warn!("VolumeClient: connection failed: {}", e);
                    return None;
                }
                None => {
                    info!("VolumeClient: server closed the connection");
                    return None;
                }
            }
        }
    }

    fn deliver(&self, frame: WireFrame) {
        let size = frame.payload.len();
        let channel = frame.header.channel;
        let time_index = frame.header.time_index;
        trace!(
            "VolumeClient: received channel {} time index {} ({} bytes)",
            channel, time_index, size
        );

        // pool acquire and the sink chain may block
        let delivered = tokio::task::block_in_place(|| -> Result<Result<()>> {
            let volume = frame.materialize(&self.sink.pool(), self.acquire_timeout)?;
            // once accepted the volume belongs to the sink, whatever it reports
            Ok(self.sink.accept(Arc::new(volume)))
        });

        match delivered {
            Ok(accepted) => {
                self.health.record_frame(size);
                if let Err(e) = accepted {
                    warn!(
                        "VolumeClient: sink reported an error for channel {} time index {}: {}",
                        channel, time_index, e
                    );
                }
            }
            Err(Error::PoolExhausted { timeout }) => {
                self.health.record_frame_drop();
                warn!(
                    "VolumeClient: no free buffer within {:?}, dropping channel {} time index {}",
                    timeout, channel, time_index
                );
            }
            Err(e) => {
                self.health.record_frame_drop();
                warn!(
                    "VolumeClient: cannot materialize channel {} time index {}: {}",
                    channel, time_index, e
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::VolumeServer;
    use crate::net::codec::FrameHeader;
    use crate::timeline::{MemoryHorizon, SlotState, TimelineStore};
    use crate::volume::{BufferPool, ElementType, QueueSink, Shape, SharedVolume};
    use bytes::BytesMut;
    use std::io::Write;
    use std::time::Instant;
    use tokio::sync::mpsc;

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    fn store_with_queue(
        horizon: MemoryHorizon,
    ) -> (Arc<TimelineStore>, mpsc::Receiver<SharedVolume>) {
        let (sink, rx) = QueueSink::new(BufferPool::new(64), 64);
        (Arc::new(TimelineStore::new(horizon, Arc::new(sink))), rx)
    }

    #[test]
    fn test_start_before_open() {
        let (store, _rx) = store_with_queue(MemoryHorizon::new(4, 8));
        let client = VolumeClient::new(store, &Config::default()).unwrap();
        assert!(matches!(client.start(), Err(Error::InvalidState(_))));
        assert!(client.stop().is_ok());
        assert!(client.close().is_ok());
    }

    #[test]
    fn test_loopback_into_timeline_store() {
        let mut config = Config::default();
        config.network.port = 0;
        config.pool.acquire_timeout_ms = 1000;

        let server = VolumeServer::new(BufferPool::new(4), &config).unwrap();
        server.open().unwrap();
        server.start().unwrap();
        config.network.port = server.local_addr().unwrap().port();

        let (store, mut rx) = store_with_queue(MemoryHorizon::new(10, 40));
        let client = VolumeClient::new(store.clone(), &config).unwrap();
        client.open().unwrap();
        client.start().unwrap();
        client.start().unwrap();

        let shape = Shape::new(ElementType::U8, 1, 4, 4, 4);
        for index in 0..10 {
            let queued = server
                .send_with(shape, |volume| {
                    volume.stamp(0, index, index as f64 * 0.1);
                    volume.data_mut().fill(index as u8);
                })
                .unwrap();
            assert!(queued);
        }

        assert!(wait_until(|| store.channel_len(0) == 10));
        assert_eq!(store.highest_time_index_seen(), 9);
        assert_eq!(store.slot_state(0, 9), Some(SlotState::Retained));

        // playing store forwards every live volume in order
        let mut forwarded = Vec::new();
        while let Ok(volume) = rx.try_recv() {
            assert!(volume.data().iter().all(|byte| *byte == volume.time_index as u8));
            forwarded.push(volume.time_index);
        }
        assert_eq!(forwarded, (0..10).collect::<Vec<_>>());
        assert!(wait_until(|| client.health().frames() == 10));

        client.stop().unwrap();
        client.stop().unwrap();
        client.close().unwrap();
        server.close().unwrap();
        assert_eq!(server.pool().checked_out(), 0);
    }

    #[test]
    fn test_malformed_frame_closes_connection() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let mut config = Config::default();
        config.network.port = listener.local_addr().unwrap().port();

        let (store, _rx) = store_with_queue(MemoryHorizon::new(4, 8));
        let client = VolumeClient::new(store.clone(), &config).unwrap();
        client.open().unwrap();
        let (mut peer, _) = listener.accept().unwrap();
        client.start().unwrap();

        // declares 2x2x2 u8 voxels but a 9-byte payload
        let header = FrameHeader {
            channel: 0,
            time_index: 0,
            timestamp: 0.0,
            dims: [2, 2, 2],
            payload_len: 9,
        };
        let mut wire = BytesMut::new();
        header.write(&mut wire);
        wire.extend_from_slice(&[0; 9]);
        peer.write_all(&wire).unwrap();

        assert!(wait_until(|| client.health().malformed_frames() == 1));
        assert!(wait_until(|| !client.is_receiving()));
        assert_eq!(store.channel_len(0), 0);
        assert_eq!(client.health().frames(), 0);

        client.stop().unwrap();
        assert!(matches!(client.start(), Err(Error::InvalidState(_))));
    }

    /// Stores every volume, then reports a failure like a broken downstream
    struct StoringButFailingSink {
        pool: BufferPool,
        stored: Mutex<Vec<SharedVolume>>,
    }

    impl VolumeSink for StoringButFailingSink {
        fn accept(&self, volume: SharedVolume) -> Result<()> {
            self.stored.lock().unwrap().push(volume);
            Err(Error::InvalidState("downstream gone"))
        }

        fn pool(&self) -> BufferPool {
            self.pool.clone()
        }
    }

    #[test]
    fn test_sink_error_after_accept_counts_as_received() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let mut config = Config::default();
        config.network.port = listener.local_addr().unwrap().port();

        let sink = Arc::new(StoringButFailingSink {
            pool: BufferPool::new(4),
            stored: Mutex::new(Vec::new()),
        });
        let client = VolumeClient::new(sink.clone(), &config).unwrap();
        client.open().unwrap();
        let (mut peer, _) = listener.accept().unwrap();
        client.start().unwrap();

        let header = FrameHeader {
            channel: 2,
            time_index: 5,
            timestamp: 0.5,
            dims: [2, 2, 2],
            payload_len: 8,
        };
        let mut wire = BytesMut::new();
        header.write(&mut wire);
        wire.extend_from_slice(&[1; 8]);
        peer.write_all(&wire).unwrap();

        assert!(wait_until(|| client.health().frames() == 1));
        assert_eq!(client.health().frame_drops(), 0);
        assert!(client.is_receiving());
        assert_eq!(sink.stored.lock().unwrap()[0].time_index, 5);

        client.close().unwrap();
    }
}
