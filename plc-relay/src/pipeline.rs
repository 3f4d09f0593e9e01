use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::capture::{CaptureSource, CapturedFrame, Delivery, FrameStream};
use crate::config::Settings;
use crate::error::PipelineError;
use crate::forwarder::{Connector, ForwardingSocket, UdpConnector};
use crate::limiter::RateLimiter;
use crate::stats::PacketStats;

/// The slice of [`Settings`] the capture pipeline needs.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub interface: String,
    pub filter: String,
    pub destination: SocketAddr,
    pub max_packet_size: usize,
    pub rate_limit: u32,
    pub socket_timeout: Duration,
    pub stats_interval: Duration,
}

impl From<&Settings> for PipelineSettings {
    fn from(settings: &Settings) -> Self {
        Self {
            interface: settings.interface.clone(),
            filter: settings.filter.clone(),
            destination: settings.destination,
            max_packet_size: settings.max_packet_size,
            rate_limit: settings.rate_limit,
            socket_timeout: settings.socket_timeout,
            stats_interval: settings.stats_interval,
        }
    }
}

/// Shared view of a pipeline that can be used from other threads: the
/// metrics listener reads through it and the signal handler stops through it.
#[derive(Clone)]
pub struct PipelineHandle {
    running: Arc<AtomicBool>,
    attached: Arc<AtomicBool>,
    stats: Arc<PacketStats>,
}

impl PipelineHandle {
    /// Ask the capture loop to halt at its next delivery boundary. Returns
    /// whether the pipeline was running. Idempotent.
    pub fn stop(&self) -> bool {
        self.running.swap(false, Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Whether the pipeline has ever attached to its capture source.
    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> &Arc<PacketStats> {
        &self.stats
    }
}

/// Per-packet admission pipeline: rate limit, decode, size guard, forward.
pub struct CapturePipeline<C: Connector = UdpConnector> {
    settings: PipelineSettings,
    limiter: RateLimiter,
    stats: Arc<PacketStats>,
    socket: ForwardingSocket<C>,
    running: Arc<AtomicBool>,
    attached: Arc<AtomicBool>,
    last_stats_log: Instant,
    finished: bool,
}

impl CapturePipeline<UdpConnector> {
    pub fn new(settings: PipelineSettings) -> Self {
        let connector = UdpConnector::for_destination(settings.destination, settings.socket_timeout);
        Self::with_connector(settings, connector)
    }
}

impl<C: Connector> CapturePipeline<C> {
    pub fn with_connector(settings: PipelineSettings, connector: C) -> Self {
        let now = Instant::now();
        Self {
            limiter: RateLimiter::new_at(settings.rate_limit, now),
            stats: Arc::new(PacketStats::default()),
            socket: ForwardingSocket::new(connector, settings.destination),
            running: Arc::new(AtomicBool::new(false)),
            attached: Arc::new(AtomicBool::new(false)),
            last_stats_log: now,
            finished: false,
            settings,
        }
    }

    pub fn handle(&self) -> PipelineHandle {
        PipelineHandle {
            running: self.running.clone(),
            attached: self.attached.clone(),
            stats: self.stats.clone(),
        }
    }

    pub fn stats(&self) -> &Arc<PacketStats> {
        &self.stats
    }

    /// Handle one captured frame. Never fails: every outcome is counted and
    /// the capture loop keeps going.
    pub fn process_packet(&mut self, frame: &CapturedFrame) {
        self.process_packet_at(frame, Instant::now());
    }

    pub fn process_packet_at(&mut self, frame: &CapturedFrame, now: Instant) {
        if let Err(e) = self.admit(frame, now) {
            self.stats.errors.fetch_add(1, Ordering::Relaxed);
            self.stats.record_packet_at(false, 0, now);
            match e {
                // The socket already logged the failure.
                PipelineError::Forward(e) => {
                    tracing::debug!(error = %e, "Packet dropped: forward failed")
                }
                e => tracing::error!(error = %e, "Error processing packet"),
            }
        }
        self.log_stats_periodically(now);
    }

    fn admit(&mut self, frame: &CapturedFrame, now: Instant) -> Result<(), PipelineError> {
        if !self.limiter.allow_at(now) {
            self.stats.rate_limited.fetch_add(1, Ordering::Relaxed);
            self.stats.record_packet_at(false, 0, now);
            tracing::debug!("Packet dropped due to rate limit");
            return Ok(());
        }

        let Some(payload) = frame.udp_payload() else {
            self.stats.record_packet_at(false, 0, now);
            tracing::debug!("Packet dropped: not UDP or no payload");
            return Ok(());
        };

        if payload.len() > self.settings.max_packet_size {
            self.stats.oversized.fetch_add(1, Ordering::Relaxed);
            self.stats.record_packet_at(false, 0, now);
            tracing::warn!(
                "Packet dropped: size {} exceeds limit {}",
                payload.len(),
                self.settings.max_packet_size
            );
            return Ok(());
        }

        self.socket.send(payload)?;
        self.stats.record_packet_at(true, payload.len(), now);

        if let Some((src, dst)) = frame.endpoints() {
            tracing::debug!(
                "Forwarded packet from {} to {}, size: {} bytes",
                src,
                dst,
                payload.len()
            );
        }
        Ok(())
    }

    fn log_stats_periodically(&mut self, now: Instant) {
        if now.saturating_duration_since(self.last_stats_log) >= self.settings.stats_interval {
            self.stats.log_stats();
            self.last_stats_log = now;
        }
    }

    /// Attach to `source` and relay frames until stopped or the source closes.
    ///
    /// Only attach-time failures (and failing to create the first socket) are
    /// returned; per-packet failures are absorbed by [`Self::process_packet`].
    pub fn start<S: CaptureSource>(&mut self, source: &S) -> Result<(), PipelineError> {
        tracing::info!(
            "Starting PLC relay on interface {}",
            self.settings.interface
        );
        tracing::info!("Filter: {}", self.settings.filter);
        tracing::info!("Forwarding to: {}", self.settings.destination);
        if !self.limiter.is_unlimited() {
            tracing::info!("Rate limit: {} pps", self.limiter.rate());
        }

        self.running.store(true, Ordering::SeqCst);
        self.finished = false;

        let mut stream = match self.attach(source) {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!(error = %e, "Capture error");
                self.stop();
                return Err(e);
            }
        };

        while self.running.load(Ordering::SeqCst) {
            match stream.next_delivery() {
                Delivery::Frame(frame) => self.process_packet(&frame),
                Delivery::Idle => self.log_stats_periodically(Instant::now()),
                Delivery::Closed => {
                    tracing::info!("Capture source closed");
                    break;
                }
            }
        }

        self.stop();
        Ok(())
    }

    fn attach<S: CaptureSource>(&mut self, source: &S) -> Result<S::Stream, PipelineError> {
        self.socket.ensure_live()?;
        let stream = source.attach(&self.settings.interface, &self.settings.filter)?;
        self.attached.store(true, Ordering::SeqCst);
        Ok(stream)
    }

    /// Halt capture, log final statistics and release the socket. Safe to call
    /// more than once; the teardown itself happens only once per run.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if self.finished {
            return;
        }
        self.finished = true;

        self.stats.log_stats();
        self.socket.close();
        tracing::info!("PLC relay stopped");
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::CaptureError;
    use crate::forwarder::tests::ScriptedConnector;
    use std::collections::VecDeque;
    use std::net::UdpSocket;
    use std::sync::Mutex;

    /// In-memory capture source that replays a fixed list of frames.
    #[derive(Default)]
    pub(crate) struct ReplaySource {
        pub frames: Mutex<Vec<CapturedFrame>>,
        pub fail_attach: bool,
        /// Keep reporting `Idle` once the frames run out instead of closing.
        pub endless: bool,
        pub attached_with: Mutex<Option<(String, String)>>,
    }

    pub(crate) struct ReplayStream {
        frames: VecDeque<CapturedFrame>,
        endless: bool,
    }

    impl ReplaySource {
        pub(crate) fn new(frames: Vec<CapturedFrame>) -> Self {
            Self {
                frames: Mutex::new(frames),
                ..Self::default()
            }
        }
    }

    impl CaptureSource for ReplaySource {
        type Stream = ReplayStream;

        fn attach(&self, interface: &str, filter: &str) -> Result<ReplayStream, CaptureError> {
            if self.fail_attach {
                return Err(CaptureError::DeviceNotFound(interface.to_string()));
            }
            *self.attached_with.lock().unwrap() = Some((interface.to_string(), filter.to_string()));
            let frames = std::mem::take(&mut *self.frames.lock().unwrap());
            Ok(ReplayStream {
                frames: frames.into(),
                endless: self.endless,
            })
        }
    }

    impl FrameStream for ReplayStream {
        fn next_delivery(&mut self) -> Delivery {
            match self.frames.pop_front() {
                Some(frame) => Delivery::Frame(frame),
                None if self.endless => Delivery::Idle,
                None => Delivery::Closed,
            }
        }
    }

    pub(crate) fn settings(destination: SocketAddr) -> PipelineSettings {
        PipelineSettings {
            interface: "eth0".into(),
            filter: "udp".into(),
            destination,
            max_packet_size: 65535,
            rate_limit: 0,
            socket_timeout: Duration::from_secs(1),
            stats_interval: Duration::from_secs(60),
        }
    }

    pub(crate) fn receiver() -> UdpSocket {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket
            .set_read_timeout(Some(Duration::from_millis(500)))
            .unwrap();
        socket
    }

    pub(crate) fn plc_frame(payload: &[u8]) -> CapturedFrame {
        CapturedFrame::udp(
            "10.0.0.5:2222".parse().unwrap(),
            "10.0.0.9:2222".parse().unwrap(),
            payload,
        )
    }

    #[test]
    fn test_forwards_payload_verbatim() {
        let rx = receiver();
        let mut pipeline = CapturePipeline::new(settings(rx.local_addr().unwrap()));

        pipeline.process_packet(&plc_frame(b"hello"));

        let mut buf = [0u8; 64];
        let (n, _) = rx.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");

        let s = pipeline.stats().snapshot();
        assert_eq!(s.forwarded, 1);
        assert_eq!(s.bytes_forwarded, 5);
        assert_eq!(s.processed, 1);
        // Exactly one datagram.
        assert!(rx.recv_from(&mut buf).is_err());
    }

    #[test]
    fn test_oversized_payload_dropped() {
        let rx = receiver();
        let mut config = settings(rx.local_addr().unwrap());
        config.max_packet_size = 10;
        let mut pipeline = CapturePipeline::new(config);

        pipeline.process_packet(&plc_frame(&[0xAB; 11]));

        let s = pipeline.stats().snapshot();
        assert_eq!(s.oversized, 1);
        assert_eq!(s.forwarded, 0);
        assert_eq!(s.processed, 1);
        assert_eq!(s.dropped, 1);
        let mut buf = [0u8; 64];
        assert!(rx.recv_from(&mut buf).is_err());
    }

    #[test]
    fn test_size_limit_boundary() {
        let connector = ScriptedConnector::default();
        let mut config = settings("127.0.0.1:9".parse().unwrap());
        config.max_packet_size = 64;
        let mut pipeline = CapturePipeline::with_connector(config, connector.clone());

        pipeline.process_packet(&plc_frame(&[1; 64]));
        pipeline.process_packet(&plc_frame(&[1; 65]));

        let s = pipeline.stats().snapshot();
        assert_eq!(s.forwarded, 1);
        assert_eq!(s.oversized, 1);
        assert_eq!(connector.ledger.lock().unwrap().sent.len(), 1);
    }

    #[test]
    fn test_rate_limit_back_to_back() {
        let connector = ScriptedConnector::default();
        let mut config = settings("127.0.0.1:9".parse().unwrap());
        config.rate_limit = 1;
        let mut pipeline = CapturePipeline::with_connector(config, connector.clone());

        let now = Instant::now();
        for _ in 0..5 {
            pipeline.process_packet_at(&plc_frame(b"x"), now);
        }

        let s = pipeline.stats().snapshot();
        assert_eq!(s.forwarded, 1);
        assert_eq!(s.rate_limited, 4);
        assert_eq!(s.dropped, 4);
        assert_eq!(s.processed, 5);
    }

    #[test]
    fn test_non_udp_frames_dropped_silently() {
        let connector = ScriptedConnector::default();
        let mut pipeline =
            CapturePipeline::with_connector(settings("127.0.0.1:9".parse().unwrap()), connector.clone());

        pipeline.process_packet(&CapturedFrame::default());
        pipeline.process_packet(&plc_frame(b""));
        let mut tcp = plc_frame(b"data");
        tcp.transport = Some(crate::capture::TransportLayer::Tcp {
            src_port: 1,
            dst_port: 2,
        });
        pipeline.process_packet(&tcp);

        let s = pipeline.stats().snapshot();
        assert_eq!(s.processed, 3);
        assert_eq!(s.dropped, 3);
        assert_eq!(s.rate_limited + s.oversized + s.errors, 0);
        assert!(connector.ledger.lock().unwrap().sent.is_empty());
    }

    #[test]
    fn test_failed_forward_counts_error_and_recovers() {
        let connector = ScriptedConnector::default();
        connector.failing_sockets.lock().unwrap().insert(1);
        let mut pipeline =
            CapturePipeline::with_connector(settings("127.0.0.1:9".parse().unwrap()), connector.clone());

        pipeline.process_packet(&plc_frame(b"first"));
        pipeline.process_packet(&plc_frame(b"second"));

        let s = pipeline.stats().snapshot();
        assert_eq!(s.errors, 1);
        assert_eq!(s.dropped, 1);
        assert_eq!(s.forwarded, 1);
        assert_eq!(s.processed, s.forwarded + s.dropped);

        let ledger = connector.ledger.lock().unwrap();
        assert_eq!(ledger.closed, vec![1]);
        assert_eq!(ledger.sent, vec![(2, b"second".to_vec())]);
    }

    /// Collects formatted log lines from a thread-local subscriber.
    #[derive(Clone, Default)]
    struct LogBuffer(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl LogBuffer {
        fn lines_at(&self, level: &str) -> usize {
            let text = String::from_utf8(self.0.lock().unwrap().clone()).unwrap();
            text.lines().filter(|l| l.contains(level)).count()
        }
    }

    #[test]
    fn test_exhausted_socket_drops_quietly() {
        let connector = ScriptedConnector::default();
        connector.failing_sockets.lock().unwrap().insert(1);
        let mut pipeline =
            CapturePipeline::with_connector(settings("127.0.0.1:9".parse().unwrap()), connector.clone());
        pipeline.socket.ensure_live().unwrap();
        *connector.refuse_connect.lock().unwrap() = true;

        let logs = LogBuffer::default();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_ansi(false)
            .with_writer({
                let logs = logs.clone();
                move || logs.clone()
            })
            .finish();
        tracing::subscriber::with_default(subscriber, || {
            for _ in 0..5 {
                pipeline.process_packet(&plc_frame(b"lost"));
            }
        });

        let s = pipeline.stats().snapshot();
        assert_eq!(s.errors, 5);
        assert_eq!(s.dropped, 5);
        // One line for the failed send, one for the failed recreation. The
        // drops that follow while no socket can be created stay at debug.
        assert_eq!(logs.lines_at("ERROR"), 2);
        assert_eq!(logs.lines_at("DEBUG"), 1 + 4 * 2);
    }

    #[test]
    fn test_periodic_stats_on_packet_arrival() {
        let connector = ScriptedConnector::default();
        let mut pipeline =
            CapturePipeline::with_connector(settings("127.0.0.1:9".parse().unwrap()), connector);
        let t0 = pipeline.last_stats_log;

        pipeline.process_packet_at(&plc_frame(b"a"), t0 + Duration::from_secs(30));
        assert_eq!(pipeline.last_stats_log, t0);

        let t1 = t0 + Duration::from_secs(61);
        pipeline.process_packet_at(&plc_frame(b"b"), t1);
        assert_eq!(pipeline.last_stats_log, t1);
    }

    #[test]
    fn test_start_relays_until_source_closes() {
        let rx = receiver();
        let mut pipeline = CapturePipeline::new(settings(rx.local_addr().unwrap()));
        let handle = pipeline.handle();
        assert!(!handle.is_attached());

        let source = ReplaySource::new(vec![
            plc_frame(b"one"),
            CapturedFrame::default(),
            plc_frame(b"two"),
        ]);
        pipeline.start(&source).unwrap();

        assert_eq!(
            *source.attached_with.lock().unwrap(),
            Some(("eth0".to_string(), "udp".to_string()))
        );
        let mut buf = [0u8; 64];
        let (n, _) = rx.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"one");
        let (n, _) = rx.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"two");

        assert!(handle.is_attached());
        assert!(!handle.is_running());
        assert_eq!(handle.stats().snapshot().forwarded, 2);
        assert_eq!(handle.stats().snapshot().dropped, 1);
    }

    #[test]
    fn test_stop_from_another_thread() {
        let connector = ScriptedConnector::default();
        let mut pipeline =
            CapturePipeline::with_connector(settings("127.0.0.1:9".parse().unwrap()), connector.clone());
        let handle = pipeline.handle();

        // The source never closes, so only the stop flag ends the loop.
        let source = ReplaySource {
            endless: true,
            ..ReplaySource::new(vec![plc_frame(b"a"); 3])
        };
        let stopper = std::thread::spawn(move || {
            while !handle.is_running() {
                std::thread::yield_now();
            }
            handle.stop()
        });
        pipeline.start(&source).unwrap();
        assert!(stopper.join().unwrap());

        assert!(!pipeline.handle().is_running());
        assert!(pipeline.stats().snapshot().processed <= 3);
        assert!(!pipeline.socket.is_live());
    }

    #[test]
    fn test_attach_failure_propagates() {
        let connector = ScriptedConnector::default();
        let mut pipeline =
            CapturePipeline::with_connector(settings("127.0.0.1:9".parse().unwrap()), connector.clone());
        let source = ReplaySource {
            fail_attach: true,
            ..ReplaySource::default()
        };

        let err = pipeline.start(&source).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Capture(CaptureError::DeviceNotFound(_))
        ));
        assert!(!pipeline.handle().is_running());
        assert!(!pipeline.handle().is_attached());
        assert_eq!(connector.ledger.lock().unwrap().closed, vec![1]);
    }

    #[test]
    fn test_stop_is_idempotent() {
        let connector = ScriptedConnector::default();
        let mut pipeline =
            CapturePipeline::with_connector(settings("127.0.0.1:9".parse().unwrap()), connector.clone());
        pipeline.process_packet(&plc_frame(b"a"));

        pipeline.stop();
        pipeline.stop();
        assert!(!pipeline.handle().stop());
        assert_eq!(connector.ledger.lock().unwrap().closed, vec![1]);
    }
}
