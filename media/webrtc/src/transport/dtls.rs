use crate::{DtlsIdentity, Mtu};
use openssl::{
    hash::MessageDigest,
    ssl::{ErrorCode, Ssl, SslStream, SslVerifyMode},
};
use srtp::{DtlsSrtpPolicies, SrtpError, SrtpFromSslError, SrtpSession};
use std::{
    collections::VecDeque,
    io::{self, Cursor, Read, Write},
    time::Duration,
};

#[derive(Debug, thiserror::Error)]
pub(crate) enum DtlsCreateError {
    #[error("Failed to create Ssl: {0}")]
    NewSsl(#[source] openssl::error::ErrorStack),
    #[error("Failed to set MTU: {0}")]
    SetMtu(#[source] openssl::error::ErrorStack),
    #[error("Failed to create SslStream: {0}")]
    NewSslStream(#[source] openssl::error::ErrorStack),
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum DtlsError {
    #[error("OpenSSL handshake error: {0}")]
    OpenSsl(#[from] openssl::ssl::Error),
    #[error("Failed to create SRTP policies from DTLS state: {0}")]
    SrtpFromSsl(#[from] SrtpFromSslError),
    #[error("Failed to create SRTP session: {0}")]
    CreateSrtp(#[from] SrtpError),
}

/// Role in the DTLS handshake, fixed when the answer's `a=setup` attribute
/// is known
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DtlsRole {
    /// `active`: initiates the handshake
    Client,
    /// `passive`: waits for the peer's first flight
    Server,
}

pub(crate) enum DtlsState {
    Handshaking,
    Connected {
        inbound: SrtpSession,
        outbound: SrtpSession,
    },
    Closed,
    Failed,
}

/// Driver of one DTLS session over the bundled transport
///
/// Wraps an openssl [`SslStream`] over in-memory queues. Handshake flights
/// and application data accumulate in the outbound queue until the owner
/// pops and sends them, which also means nothing leaves this struct before
/// ICE has found a path.
pub(crate) struct DtlsEndpoint {
    stream: SslStream<IoQueue>,
    role: DtlsRole,
    state: DtlsState,
}

impl DtlsEndpoint {
    /// Create the endpoint and, for the client role, produce the first
    /// handshake flight
    pub(crate) fn new(
        identity: &DtlsIdentity,
        role: DtlsRole,
        remote_fingerprints: Vec<(MessageDigest, Vec<u8>)>,
        mtu: Mtu,
    ) -> Result<Self, DtlsCreateError> {
        let mut ssl = Ssl::new(&identity.ctx).map_err(DtlsCreateError::NewSsl)?;

        ssl.set_mtu(
            mtu.for_dtls()
                .try_into()
                .expect("MTU must not be larger than u32::MAX"),
        )
        .map_err(DtlsCreateError::SetMtu)?;

        // Verify the peer certificate against the fingerprints from SDP; a
        // mismatch fails the handshake and with it the whole transport
        ssl.set_verify_callback(
            SslVerifyMode::PEER | SslVerifyMode::FAIL_IF_NO_PEER_CERT,
            move |_preverify_ok, x509_store| {
                let Some(certificate) = x509_store.current_cert() else {
                    return false;
                };

                for (digest, fingerprint) in &remote_fingerprints {
                    let Ok(peer_fingerprint) = certificate.digest(*digest) else {
                        continue;
                    };

                    if peer_fingerprint.as_ref() == fingerprint {
                        return true;
                    }
                }

                false
            },
        );

        let stream = SslStream::new(
            ssl,
            IoQueue {
                to_read: VecDeque::new(),
                out: VecDeque::new(),
            },
        )
        .map_err(DtlsCreateError::NewSslStream)?;

        let mut this = DtlsEndpoint {
            stream,
            role,
            state: DtlsState::Handshaking,
        };

        // Produces the initial flight for the client role
        this.handshake()
            .expect("First call to handshake must not fail");

        Ok(this)
    }

    pub(crate) fn role(&self) -> DtlsRole {
        self.role
    }

    pub(crate) fn state(&self) -> &DtlsState {
        &self.state
    }

    pub(crate) fn state_mut(&mut self) -> &mut DtlsState {
        &mut self.state
    }

    /// Returns the interval in which [`handshake`](Self::handshake) should
    /// be called to drive openssl's retransmission timers
    pub(crate) fn timeout(&self) -> Option<Duration> {
        match self.state {
            DtlsState::Handshaking => Some(Duration::from_millis(100)),
            DtlsState::Connected { .. } | DtlsState::Closed | DtlsState::Failed => None,
        }
    }

    /// Drive the handshake forward
    ///
    /// On completion, keying material is extracted and the SRTP contexts for
    /// both directions are created.
    pub(crate) fn handshake(&mut self) -> Result<(), DtlsError> {
        if !matches!(self.state, DtlsState::Handshaking) {
            return Ok(());
        }

        let result = match self.role {
            DtlsRole::Client => self.stream.connect(),
            DtlsRole::Server => self.stream.accept(),
        };

        if let Err(e) = result {
            if e.code() == ErrorCode::WANT_READ {
                return Ok(());
            } else {
                self.state = DtlsState::Failed;
                return Err(DtlsError::OpenSsl(e));
            }
        }

        let DtlsSrtpPolicies { inbound, outbound } =
            DtlsSrtpPolicies::from_ssl(self.stream.ssl())?;

        self.state = DtlsState::Connected {
            inbound: SrtpSession::new(vec![inbound])?,
            outbound: SrtpSession::new(vec![outbound])?,
        };

        Ok(())
    }

    /// Feed a received DTLS record
    ///
    /// Drives the handshake when it is still in progress and returns any
    /// decrypted application data (SCTP packets) otherwise.
    pub(crate) fn receive(&mut self, data: Vec<u8>) -> Result<Vec<Vec<u8>>, DtlsError> {
        self.stream.get_mut().to_read.push_back(Cursor::new(data));

        self.handshake()?;

        let mut application_data = vec![];

        if matches!(self.state, DtlsState::Connected { .. }) {
            let mut buf = vec![0u8; 8192];

            loop {
                match self.stream.ssl_read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => application_data.push(buf[..n].to_vec()),
                    Err(e) => {
                        match e.code() {
                            ErrorCode::WANT_READ => {}
                            ErrorCode::ZERO_RETURN => self.state = DtlsState::Closed,
                            _ => {
                                self.state = DtlsState::Failed;
                                return Err(DtlsError::OpenSsl(e));
                            }
                        }

                        break;
                    }
                }
            }
        }

        Ok(application_data)
    }

    /// Encrypt and queue application data (a SCTP packet)
    pub(crate) fn send_application_data(&mut self, data: &[u8]) -> Result<(), DtlsError> {
        debug_assert!(matches!(self.state, DtlsState::Connected { .. }));

        self.stream
            .ssl_write(data)
            .map_err(DtlsError::OpenSsl)
            .map(|_| ())
    }

    /// Pop the next outbound DTLS record
    pub(crate) fn pop_to_send(&mut self) -> Option<Vec<u8>> {
        self.stream.get_mut().out.pop_front()
    }
}

/// In-memory BIO of the [`SslStream`]
struct IoQueue {
    to_read: VecDeque<Cursor<Vec<u8>>>,
    out: VecDeque<Vec<u8>>,
}

impl Read for IoQueue {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let Some(to_read) = self.to_read.front_mut() else {
            return Err(io::ErrorKind::WouldBlock.into());
        };

        let result = to_read.read(buf)?;

        let position = usize::try_from(to_read.position()).expect("position must fit into usize");

        if position == to_read.get_ref().len() {
            self.to_read.pop_front();
        }

        Ok(result)
    }
}

impl Write for IoQueue {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.out.push_back(buf.to_vec());
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
