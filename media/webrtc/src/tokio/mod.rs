//! Tokio IO companion
//!
//! [`TokioIoState`] owns the single UDP socket of a bundled peer connection
//! and drives its timers. It is used *alongside* the
//! [`PeerConnection`](crate::peer::PeerConnection), not as a wrapper around
//! it: the application keeps popping events and hands
//! [`SendData`](crate::peer::PeerConnectionEvent::SendData) events back to
//! [`send`](TokioIoState::send).
//!
//! ```no_run
//! # use quill_webrtc::{peer::{PeerConnection, PeerConnectionEvent, RtcConfig}, DtlsIdentity};
//! # use quill_webrtc::tokio::TokioIoState;
//! # async fn run() -> std::io::Result<()> {
//! let mut peer = PeerConnection::new(DtlsIdentity::generate().unwrap(), RtcConfig::default());
//!
//! let mut io = TokioIoState::bind_with_local_ips().await?;
//! io.register_host_addrs(&mut peer)?;
//!
//! loop {
//!     io.drive(&mut peer).await?;
//!
//!     while let Some(event) = peer.pop_event() {
//!         match event {
//!             PeerConnectionEvent::SendData { data, target, .. } => {
//!                 io.send(&data, target).await?;
//!             }
//!             _ => { /* application events */ }
//!         }
//!     }
//! }
//! # }
//! ```

use crate::peer::PeerConnection;
use ice::{Component, ReceivedPkt};
use std::{
    io,
    net::{IpAddr, SocketAddr},
    time::Instant,
};
use tokio::net::UdpSocket;

const RECV_BUFFER_SIZE: usize = 65535;

/// IO implementation to be used alongside a [`PeerConnection`]
pub struct TokioIoState {
    socket: UdpSocket,
    local_ips: Vec<IpAddr>,
    buf: Box<[u8; RECV_BUFFER_SIZE]>,
}

impl TokioIoState {
    /// Bind a UDP socket and use the given addresses for ICE host
    /// candidates
    pub async fn bind(local_ips: Vec<IpAddr>) -> io::Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;

        Ok(Self {
            socket,
            local_ips,
            buf: Box::new([0u8; RECV_BUFFER_SIZE]),
        })
    }

    /// Bind a UDP socket and discover the local addresses to use for ICE
    pub async fn bind_with_local_ips() -> io::Result<Self> {
        let ips = local_ip_address::list_afinet_netifas()
            .map_err(io::Error::other)?
            .into_iter()
            .map(|(_, addr)| addr)
            .collect();

        Self::bind(ips).await
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Register the socket's port on every local address as an ICE host
    /// address
    pub fn register_host_addrs(&self, peer: &mut PeerConnection) -> io::Result<()> {
        let port = self.socket.local_addr()?.port();

        for ip in &self.local_ips {
            peer.add_host_addr(SocketAddr::new(*ip, port));
        }

        Ok(())
    }

    /// Wait for the next timer or datagram and feed it to the connection
    ///
    /// Returns after one unit of progress; call in a loop and drain the
    /// connection's events after every return.
    pub async fn drive(&mut self, peer: &mut PeerConnection) -> io::Result<()> {
        let timeout = peer.timeout(Instant::now());

        let sleep = async move {
            match timeout {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            () = sleep => {
                peer.poll(Instant::now());
            }
            result = self.socket.recv_from(&mut self.buf[..]) => {
                let (len, source) = result?;
                let destination = self.socket.local_addr()?;

                peer.receive(
                    Instant::now(),
                    ReceivedPkt {
                        data: self.buf[..len].to_vec(),
                        source,
                        destination,
                        component: Component::Rtp,
                    },
                );
            }
        }

        Ok(())
    }

    /// Send one datagram, typically from a `SendData` event
    pub async fn send(&self, data: &[u8], target: SocketAddr) -> io::Result<()> {
        self.socket.send_to(data, target).await?;
        Ok(())
    }
}
