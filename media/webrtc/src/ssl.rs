use openssl::{
    asn1::{Asn1Time, Asn1Type},
    bn::{BigNum, MsbOption},
    error::ErrorStack,
    hash::MessageDigest,
    nid::Nid,
    pkey::{PKey, Private},
    rsa::Rsa,
    ssl::{SslAcceptor, SslContext, SslMethod, SslVersion},
    x509::{X509, X509Name},
};

/// DTLS identity of a peer connection
///
/// Wraps a [`SslContext`] with the guarantee that a certificate is set.
/// Every peer connection creates its own identity, certificates are not
/// shared between connections.
#[derive(Clone)]
pub struct DtlsIdentity {
    pub(crate) ctx: SslContext,
}

impl DtlsIdentity {
    /// Generate a fresh self-signed certificate and build a DTLS context
    /// around it
    pub fn generate() -> Result<Self, ErrorStack> {
        let (cert, pkey) = make_self_signed_cert()?;

        let mut ctx = SslAcceptor::mozilla_modern(SslMethod::dtls())?;
        ctx.set_tlsext_use_srtp(srtp::openssl::SRTP_PROFILE_NAMES)?;
        ctx.set_min_proto_version(Some(SslVersion::DTLS1_2))?;
        ctx.set_private_key(&pkey)?;
        ctx.set_certificate(&cert)?;
        ctx.check_private_key()?;

        Ok(Self {
            ctx: ctx.build().into_context(),
        })
    }

    /// SHA-256 digest of the certificate, as it appears in the SDP
    /// `a=fingerprint` attribute
    pub fn sha256_fingerprint(&self) -> Vec<u8> {
        self.ctx
            .certificate()
            .expect("DtlsIdentity always contains a certificate")
            .digest(MessageDigest::sha256())
            .expect("creating a digest of a certificate does not fail")
            .to_vec()
    }
}

fn make_self_signed_cert() -> Result<(X509, PKey<Private>), ErrorStack> {
    openssl::init();

    let rsa = Rsa::generate(2048)?;
    let pkey = PKey::from_rsa(rsa)?;

    let mut cert_builder = X509::builder()?;
    cert_builder.set_version(2)?;

    let serial_number = {
        let mut serial = BigNum::new()?;
        serial.rand(159, MsbOption::MAYBE_ZERO, false)?;
        serial.to_asn1_integer()?
    };
    cert_builder.set_serial_number(&serial_number)?;

    cert_builder.set_pubkey(&pkey)?;
    cert_builder.set_not_before(Asn1Time::days_from_now(0)?.as_ref())?;
    cert_builder.set_not_after(Asn1Time::days_from_now(30)?.as_ref())?;

    let mut x509_name = X509Name::builder()?;
    x509_name.append_entry_by_nid_with_type(Nid::COMMONNAME, "WebRTC", Asn1Type::UTF8STRING)?;
    let x509_name = x509_name.build();

    cert_builder.set_subject_name(&x509_name)?;
    cert_builder.set_issuer_name(&x509_name)?;

    cert_builder.sign(&pkey, MessageDigest::sha256())?;
    let cert = cert_builder.build();

    Ok((cert, pkey))
}
