//! The four listener/connection subsystems (C4–C7): shared accept-loop
//! plumbing (optional TLS termination, handshake, registry admission)
//! plus one module per agent population for the role-specific admission
//! rules, cohort selection and unsolicited-message handling §4.4–§4.7
//! describe.

pub mod load;
pub mod manager;
pub mod monitor;
pub mod stat;

use std::sync::Arc;

use tokio::io::split;
use tokio::net::TcpStream;

use crate::error::CoreResult;
use crate::session::{BoxedReader, BoxedWriter};

pub use load::LoadListener;
pub use manager::ManagerListener;
pub use monitor::MonitorListener;
pub use stat::StatListener;

/// Server-side TLS material for one listener, when the `tls` feature is
/// enabled (§6 "TLS"). Mutual authentication is optional at this layer;
/// the hello message's credential check is still the authoritative gate.
#[cfg(feature = "tls")]
#[derive(Clone)]
pub struct TlsAcceptor(pub Arc<tokio_rustls::TlsAcceptor>);

/// Splits a plain TCP stream into boxed reader/writer halves the session
/// layer is generic over.
pub fn split_plain(stream: TcpStream) -> (BoxedReader, BoxedWriter) {
    let (r, w) = split(stream);
    (Box::new(r), Box::new(w))
}

#[cfg(feature = "tls")]
pub async fn accept_tls(
    acceptor: &TlsAcceptor,
    stream: TcpStream,
) -> CoreResult<(BoxedReader, BoxedWriter)> {
    use crate::error::CoreError;
    let tls_stream = acceptor
        .0
        .accept(stream)
        .await
        .map_err(|e| CoreError::Protocol(format!("TLS handshake failed: {e}")))?;
    let (r, w) = split(tls_stream);
    Ok((Box::new(r) as BoxedReader, Box::new(w) as BoxedWriter))
}

/// The transport a listener hands each accepted connection off to, plain
/// or TLS-terminated (§6).
pub enum Transport {
    Plain,
    #[cfg(feature = "tls")]
    Tls(TlsAcceptor),
}

impl Transport {
    pub async fn split(&self, stream: TcpStream) -> CoreResult<(BoxedReader, BoxedWriter)> {
        match self {
            Transport::Plain => Ok(split_plain(stream)),
            #[cfg(feature = "tls")]
            Transport::Tls(acceptor) => accept_tls(acceptor, stream).await,
        }
    }
}
