use rustls::{CipherSuite, server::Acceptor};
use tokio::io::AsyncRead;
use tokio_rustls::LazyConfigAcceptor;

use crate::{error::ServerError, tee::TeeReader};

// Data extracted from a TLS ClientHello.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsHello {
    // Requested server name (SNI), if any.
    pub server_name: Option<String>,
    // Protocols offered via ALPN, in the client's order of preference.
    pub alpn: Vec<Vec<u8>>,
    pub cipher_suites: Vec<CipherSuite>,
}

// Read a TLS ClientHello from the reader without completing the handshake.
//
// A server-side handshake is started over a tee of the reader and abandoned as
// soon as the ClientHello has been parsed. Returns the hello along with every
// byte consumed from the reader, so that a real handshake can be run by
// replaying those bytes before the rest of the stream.
pub async fn peek_tls_hello<R>(reader: &mut R) -> Result<(TlsHello, Vec<u8>), ServerError>
where
    R: AsyncRead + Unpin,
{
    let mut tee = TeeReader::new(reader);
    let hello = {
        let start = LazyConfigAcceptor::new(Acceptor::default(), &mut tee)
            .await
            .map_err(ServerError::MissingClientHello)?;
        let client_hello = start.client_hello();
        TlsHello {
            server_name: client_hello.server_name().map(String::from),
            alpn: client_hello
                .alpn()
                .map(|protocols| protocols.map(<[u8]>::to_vec).collect())
                .unwrap_or_default(),
            cipher_suites: client_hello.cipher_suites().to_vec(),
        }
    };
    Ok((hello, tee.into_buffer()))
}
