//! Boundary with the packet capture library.
//!
//! The pcap adapter decodes every frame once into a [`CapturedFrame`]; the
//! pipeline only ever looks at its optional layers, never at raw bytes.

use etherparse::{NetSlice, SlicedPacket, TransportSlice};
use pcap::{Active, Capture, Device};
use std::net::{IpAddr, SocketAddr};
use std::thread;
use std::time::Duration;

use crate::error::CaptureError;

/// Network layer of a captured frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkLayer {
    pub src: IpAddr,
    pub dst: IpAddr,
}

/// Transport layer of a captured frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportLayer {
    Udp { src_port: u16, dst_port: u16 },
    Tcp { src_port: u16, dst_port: u16 },
}

/// A captured frame with whichever layers could be decoded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedFrame {
    pub network: Option<NetworkLayer>,
    pub transport: Option<TransportLayer>,
    pub payload: Vec<u8>,
}

impl CapturedFrame {
    /// A fully decoded UDP datagram.
    pub fn udp(src: SocketAddr, dst: SocketAddr, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            network: Some(NetworkLayer {
                src: src.ip(),
                dst: dst.ip(),
            }),
            transport: Some(TransportLayer::Udp {
                src_port: src.port(),
                dst_port: dst.port(),
            }),
            payload: payload.into(),
        }
    }

    /// The payload, if this is an IP/UDP frame carrying at least one byte.
    pub fn udp_payload(&self) -> Option<&[u8]> {
        match (self.network, self.transport) {
            (Some(_), Some(TransportLayer::Udp { .. })) if !self.payload.is_empty() => {
                Some(&self.payload)
            }
            _ => None,
        }
    }

    /// Source and destination endpoints, when both layers are present.
    pub fn endpoints(&self) -> Option<(SocketAddr, SocketAddr)> {
        let net = self.network?;
        let (src_port, dst_port) = match self.transport? {
            TransportLayer::Udp { src_port, dst_port } => (src_port, dst_port),
            TransportLayer::Tcp { src_port, dst_port } => (src_port, dst_port),
        };
        Some((
            SocketAddr::new(net.src, src_port),
            SocketAddr::new(net.dst, dst_port),
        ))
    }
}

/// Decode an Ethernet frame. Anything etherparse cannot slice comes back as a
/// frame without layers.
pub fn decode_ethernet(data: &[u8]) -> CapturedFrame {
    let Ok(sliced) = SlicedPacket::from_ethernet(data) else {
        return CapturedFrame::default();
    };

    let network = match &sliced.net {
        Some(NetSlice::Ipv4(slice)) => {
            let header = slice.header();
            Some(NetworkLayer {
                src: IpAddr::V4(header.source_addr()),
                dst: IpAddr::V4(header.destination_addr()),
            })
        }
        Some(NetSlice::Ipv6(slice)) => {
            let header = slice.header();
            Some(NetworkLayer {
                src: IpAddr::V6(header.source_addr()),
                dst: IpAddr::V6(header.destination_addr()),
            })
        }
        _ => None,
    };

    let (transport, payload) = match &sliced.transport {
        Some(TransportSlice::Udp(udp)) => (
            Some(TransportLayer::Udp {
                src_port: udp.source_port(),
                dst_port: udp.destination_port(),
            }),
            udp.payload().to_vec(),
        ),
        Some(TransportSlice::Tcp(tcp)) => (
            Some(TransportLayer::Tcp {
                src_port: tcp.source_port(),
                dst_port: tcp.destination_port(),
            }),
            tcp.payload().to_vec(),
        ),
        _ => (None, Vec::new()),
    };

    CapturedFrame {
        network,
        transport,
        payload,
    }
}

/// What a single poll of a [`FrameStream`] produced.
#[derive(Debug)]
pub enum Delivery {
    Frame(CapturedFrame),
    /// Read timeout expired with nothing captured.
    Idle,
    /// The source has no more frames to deliver.
    Closed,
}

/// A stream of captured frames, polled one delivery at a time.
pub trait FrameStream {
    fn next_delivery(&mut self) -> Delivery;
}

/// Something that can attach to an interface with a filter expression.
pub trait CaptureSource {
    type Stream: FrameStream;

    fn attach(&self, interface: &str, filter: &str) -> Result<Self::Stream, CaptureError>;
}

/// libpcap-backed capture.
#[derive(Debug, Clone)]
pub struct PcapSource {
    pub promisc: bool,
    pub snaplen: i32,
    pub timeout_ms: i32,
}

impl Default for PcapSource {
    fn default() -> Self {
        Self {
            promisc: true,
            snaplen: 65535,
            timeout_ms: 1000,
        }
    }
}

impl CaptureSource for PcapSource {
    type Stream = PcapStream;

    fn attach(&self, interface: &str, filter: &str) -> Result<PcapStream, CaptureError> {
        let device = Device::list()?
            .into_iter()
            .find(|d| d.name == interface)
            .ok_or_else(|| CaptureError::DeviceNotFound(interface.to_string()))?;

        let mut cap = Capture::from_device(device)?
            .promisc(self.promisc)
            .snaplen(self.snaplen)
            .timeout(self.timeout_ms)
            .open()?;
        cap.filter(filter, true)?;

        tracing::info!(interface, filter, "Capturing on device");
        Ok(PcapStream {
            cap,
            errors: ReadErrors::default(),
        })
    }
}

/// Read errors in a row before the stream gives up.
const MAX_CONSECUTIVE_READ_ERRORS: u32 = 50;
const READ_ERROR_BACKOFF: Duration = Duration::from_millis(200);

/// Paces a stream through a run of read errors, such as an interface that
/// went down, and closes it once the run is too long.
#[derive(Debug)]
struct ReadErrors {
    consecutive: u32,
    limit: u32,
    backoff: Duration,
}

impl Default for ReadErrors {
    fn default() -> Self {
        Self {
            consecutive: 0,
            limit: MAX_CONSECUTIVE_READ_ERRORS,
            backoff: READ_ERROR_BACKOFF,
        }
    }
}

impl ReadErrors {
    fn reset(&mut self) {
        self.consecutive = 0;
    }

    fn on_error(&mut self, error: &pcap::Error) -> Delivery {
        self.consecutive += 1;
        if self.consecutive >= self.limit {
            tracing::error!(
                error = %error,
                consecutive = self.consecutive,
                "Giving up on packet capture"
            );
            return Delivery::Closed;
        }
        if self.consecutive == 1 {
            tracing::warn!(error = %error, "Packet capture error");
        } else {
            tracing::debug!(error = %error, consecutive = self.consecutive, "Packet capture error");
        }
        thread::sleep(self.backoff);
        Delivery::Idle
    }
}

pub struct PcapStream {
    cap: Capture<Active>,
    errors: ReadErrors,
}

impl FrameStream for PcapStream {
    fn next_delivery(&mut self) -> Delivery {
        match self.cap.next_packet() {
            Ok(packet) => {
                self.errors.reset();
                Delivery::Frame(decode_ethernet(packet.data))
            }
            Err(pcap::Error::TimeoutExpired) => {
                self.errors.reset();
                Delivery::Idle
            }
            Err(pcap::Error::NoMorePackets) => Delivery::Closed,
            Err(e) => self.errors.on_error(&e),
        }
    }
}
