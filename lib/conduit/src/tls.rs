//! Seam for the host-provided TLS stack. The toolkit drives the handshake
//! and moves record bytes; certificate checking is delegated to a caller
//! -supplied validation callback.

use lumen::shared::NetworkResult;
use mio::net::TcpStream;
use std::io;

/// Certificate validation callback: `(peer certificate, chain, policy
/// errors) -> accept`.
pub type CertValidator = Box<dyn Fn(&[u8], &[Vec<u8>], u32) -> bool + Send>;

/// One TLS session layered over a non-blocking socket. Implementations wrap
/// the socket and expose plaintext `read`/`write`; both fold `WouldBlock`
/// through untouched so the channel's readiness loop stays in charge.
pub trait TlsSession {
    fn socket(&self) -> &TcpStream;

    fn socket_mut(&mut self) -> &mut TcpStream;

    /// Drive the handshake one step. `Ok(false)` means it is still in
    /// flight and the caller should wait for socket readiness.
    fn handshake(&mut self) -> NetworkResult<bool>;

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Best-effort close notification.
    fn shutdown(&mut self);
}

/// Factory for client sessions, implemented by the host TLS stack.
pub trait TlsProvider {
    fn client_session(
        &self,
        socket: TcpStream,
        server_name: &str,
        validator: CertValidator,
    ) -> NetworkResult<Box<dyn TlsSession>>;
}
