//! A single client connection to a directory server over TCP (ldap://) or TLS (ldaps://).
//!
//! Requests are written whole; responses are framed from a `BytesMut` read buffer
//! using the BER length prefix. Every read is bounded by the response timeout and
//! any transport or framing failure marks the connection closed.

use crate::ber;
use crate::error::{LdapError, Result, ResultCode};
use crate::ldap_protocol::{
    AddRequest, Entry, ExtendedRequest, LdapResult, ModifyRequest, Request, Response, ResponseMessage,
    SaslBindRequest, SearchRequest, SimpleBindRequest,
};
use bytes::BytesMut;
use rustls::client::ClientConfig;
use rustls_pki_types::ServerName;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream as ClientTlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, trace, warn};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);
/// Largest response message accepted from a server.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 20 * 1024 * 1024;

/// Transport-level settings shared by every connection a server set opens.
#[derive(Clone, Debug)]
pub struct ConnectionOptions {
    pub connect_timeout: Duration,
    pub response_timeout: Duration,
    /// Client TLS configuration used for ldaps:// candidates.
    pub tls: Option<Arc<ClientConfig>>,
    /// Responses declaring a larger size are rejected and the connection is closed.
    pub max_message_size: usize,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            tls: None,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

/// Stream to the server: plain TCP or TLS.
pub enum ConnectionStream {
    Tcp(TcpStream),
    Tls(Box<ClientTlsStream<TcpStream>>),
}

impl AsyncRead for ConnectionStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match &mut *self {
            ConnectionStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            ConnectionStream::Tls(s) => Pin::new(&mut **s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ConnectionStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match &mut *self {
            ConnectionStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            ConnectionStream::Tls(s) => Pin::new(&mut **s).poll_write(cx, buf),
        }
    }
    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match &mut *self {
            ConnectionStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            ConnectionStream::Tls(s) => Pin::new(&mut **s).poll_flush(cx),
        }
    }
    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match &mut *self {
            ConnectionStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            ConnectionStream::Tls(s) => Pin::new(&mut **s).poll_shutdown(cx),
        }
    }
}

pub struct LdapConnection {
    stream: ConnectionStream,
    read_buf: BytesMut,
    next_message_id: i32,
    host: String,
    port: u16,
    created_at: Instant,
    response_timeout: Duration,
    max_message_size: usize,
    closed: bool,
    bound_dn: Option<String>,
}

impl std::fmt::Debug for LdapConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LdapConnection")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("tls", &matches!(self.stream, ConnectionStream::Tls(_)))
            .field("closed", &self.closed)
            .finish()
    }
}

impl LdapConnection {
    /// Open a transport connection; TLS is used when `options.tls` is set.
    pub async fn connect(host: &str, port: u16, options: &ConnectionOptions) -> Result<Self> {
        let addr = format!("{}:{}", host, port);
        let tcp = match tokio::time::timeout(options.connect_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(s)) => s,
            Ok(Err(e)) => {
                debug!("Connect to {} failed: {}", addr, e);
                return Err(LdapError::Io(e));
            }
            Err(_) => {
                return Err(LdapError::Timeout(format!(
                    "connect to {} exceeded {:?}",
                    addr, options.connect_timeout
                )))
            }
        };
        if let Err(e) = tcp.set_nodelay(true) {
            debug!("Unable to set TCP_NODELAY on {}: {}", addr, e);
        }
        let stream = match options.tls {
            Some(ref config) => {
                let connector = TlsConnector::from(config.clone());
                let server_name = ServerName::try_from(host.to_string())
                    .map_err(|_| LdapError::Tls(format!("Invalid hostname for TLS SNI: {}", host)))?;
                let tls = tokio::time::timeout(options.connect_timeout, connector.connect(server_name, tcp))
                    .await
                    .map_err(|_| LdapError::Timeout(format!("TLS handshake with {} timed out", addr)))?
                    .map_err(|e| LdapError::Tls(format!("TLS handshake with {} failed: {}", addr, e)))?;
                ConnectionStream::Tls(Box::new(tls))
            }
            None => ConnectionStream::Tcp(tcp),
        };
        debug!("Connected to {}", addr);
        Ok(Self {
            stream,
            read_buf: BytesMut::with_capacity(4096),
            next_message_id: 1,
            host: host.to_string(),
            port,
            created_at: Instant::now(),
            response_timeout: options.response_timeout,
            max_message_size: options.max_message_size,
            closed: false,
            bound_dn: None,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// DN of the last successful bind on this connection ("" for anonymous).
    pub fn bound_dn(&self) -> Option<&str> {
        self.bound_dn.as_deref()
    }

    pub fn set_response_timeout(&mut self, timeout: Duration) {
        self.response_timeout = timeout;
    }

    fn allocate_message_id(&mut self) -> i32 {
        let id = self.next_message_id;
        self.next_message_id = if id == i32::MAX { 1 } else { id + 1 };
        id
    }

    /// Validate, assign a message ID and write the request. Returns the ID.
    pub async fn send(&mut self, request: &Request) -> Result<i32> {
        if self.closed {
            return Err(LdapError::ConnectionClosed);
        }
        request.validate()?;
        let message_id = self.allocate_message_id();
        let bytes = request.encode_message(message_id);
        trace!("Sending message {} ({} bytes) to {}", message_id, bytes.len(), self.address());
        let timeout = self.response_timeout;
        let stream = &mut self.stream;
        let write = async {
            stream.write_all(&bytes).await?;
            stream.flush().await
        };
        match tokio::time::timeout(timeout, write).await {
            Ok(Ok(())) => Ok(message_id),
            Ok(Err(e)) => {
                self.closed = true;
                Err(LdapError::Io(e))
            }
            Err(_) => {
                self.closed = true;
                Err(LdapError::Timeout(format!("write to {} timed out", self.address())))
            }
        }
    }

    async fn read_frame(&mut self) -> Result<Vec<u8>> {
        let mut chunk = [0u8; 4096];
        loop {
            if let Some(total) = ber::frame_length(&self.read_buf, self.max_message_size)? {
                if self.read_buf.len() >= total {
                    return Ok(self.read_buf.split_to(total).to_vec());
                }
            }
            let n = self.stream.read(&mut chunk).await?;
            if n == 0 {
                return Err(LdapError::ConnectionClosed);
            }
            self.read_buf.extend_from_slice(&chunk[..n]);
        }
    }

    /// Read the next message from the server, bounded by the response timeout.
    pub async fn read_response(&mut self) -> Result<ResponseMessage> {
        if self.closed {
            return Err(LdapError::ConnectionClosed);
        }
        let frame = match tokio::time::timeout(self.response_timeout, self.read_frame()).await {
            Ok(Ok(f)) => f,
            Ok(Err(e)) => {
                self.closed = true;
                return Err(e);
            }
            Err(_) => {
                self.closed = true;
                return Err(LdapError::Timeout(format!(
                    "no response from {} within {:?}",
                    self.address(),
                    self.response_timeout
                )));
            }
        };
        let message = ResponseMessage::decode(&frame).map_err(|e| {
            self.closed = true;
            e
        })?;
        if message.is_notice_of_disconnection() {
            warn!("Server {} sent notice of disconnection", self.address());
            self.closed = true;
            return Err(LdapError::ConnectionClosed);
        }
        Ok(message)
    }

    async fn read_response_for(&mut self, message_id: i32) -> Result<ResponseMessage> {
        loop {
            let message = self.read_response().await?;
            if message.message_id == message_id {
                return Ok(message);
            }
            debug!(
                "Ignoring message {} from {} while waiting for {}",
                message.message_id,
                self.address(),
                message_id
            );
        }
    }

    /// Send a request that is answered by exactly one response message.
    pub async fn exchange(&mut self, request: &Request) -> Result<Response> {
        let id = self.send(request).await?;
        loop {
            let message = self.read_response_for(id).await?;
            if matches!(message.response, Response::Intermediate { .. }) {
                continue;
            }
            return Ok(message.response);
        }
    }

    pub async fn simple_bind(&mut self, request: &SimpleBindRequest) -> Result<LdapResult> {
        match self.exchange(&Request::SimpleBind(request.duplicate())).await? {
            Response::Bind { result, .. } => {
                let result = result.into_result()?;
                self.bound_dn = Some(request.dn.clone());
                Ok(result)
            }
            other => Err(unexpected_response("bind", &other)),
        }
    }

    /// One leg of a SASL bind. A saslBindInProgress result is returned as-is
    /// together with the server's challenge; other non-success codes are errors.
    pub async fn sasl_bind_step(&mut self, request: &SaslBindRequest) -> Result<(LdapResult, Option<Vec<u8>>)> {
        match self.exchange(&Request::SaslBind(request.duplicate())).await? {
            Response::Bind {
                result,
                server_sasl_credentials,
            } => {
                if result.code == ResultCode::SASL_BIND_IN_PROGRESS {
                    return Ok((result, server_sasl_credentials));
                }
                let result = result.into_result()?;
                self.bound_dn = Some(request.dn.clone());
                Ok((result, server_sasl_credentials))
            }
            other => Err(unexpected_response("SASL bind", &other)),
        }
    }

    /// Run a search and collect entries until SearchResultDone.
    pub async fn search(&mut self, request: &SearchRequest) -> Result<(Vec<Entry>, LdapResult)> {
        let id = self.send(&Request::Search(request.clone())).await?;
        let mut entries = Vec::new();
        loop {
            let message = self.read_response_for(id).await?;
            match message.response {
                Response::SearchEntry(e) => entries.push(e),
                Response::SearchReference(_) | Response::Intermediate { .. } => {}
                Response::SearchDone(result) => return Ok((entries, result)),
                other => return Err(unexpected_response("search", &other)),
            }
        }
    }

    /// Base-scope read. `Ok(None)` when the entry does not exist.
    pub async fn get_entry(&mut self, dn: &str, attributes: &[&str]) -> Result<Option<Entry>> {
        let (entries, result) = self.search(&SearchRequest::base_entry(dn, attributes)).await?;
        if result.code == ResultCode::NO_SUCH_OBJECT {
            return Ok(None);
        }
        result.into_result()?;
        Ok(entries.into_iter().next())
    }

    pub async fn add(&mut self, request: &AddRequest) -> Result<LdapResult> {
        match self.exchange(&Request::Add(request.duplicate())).await? {
            Response::Add(result) => result.into_result(),
            other => Err(unexpected_response("add", &other)),
        }
    }

    pub async fn modify(&mut self, request: &ModifyRequest) -> Result<LdapResult> {
        match self.exchange(&Request::Modify(request.duplicate())).await? {
            Response::Modify(result) => result.into_result(),
            other => Err(unexpected_response("modify", &other)),
        }
    }

    pub async fn extended(&mut self, request: &ExtendedRequest) -> Result<(LdapResult, Option<Vec<u8>>)> {
        match self.exchange(&Request::Extended(request.clone())).await? {
            Response::Extended { result, value, .. } => Ok((result.into_result()?, value)),
            other => Err(unexpected_response("extended", &other)),
        }
    }

    /// "Who am I?" extended operation; returns the authorization identity.
    pub async fn who_am_i(&mut self) -> Result<String> {
        let (_, value) = self.extended(&ExtendedRequest::who_am_i()).await?;
        Ok(value.map(|v| String::from_utf8_lossy(&v).into_owned()).unwrap_or_default())
    }

    /// Send an unbind (best effort) and shut the transport down.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        if let Err(e) = self.send(&Request::Unbind).await {
            debug!("Unbind to {} failed: {}", self.address(), e);
        }
        let _ = tokio::time::timeout(Duration::from_secs(1), self.stream.shutdown()).await;
        self.closed = true;
        debug!("Closed connection to {}", self.address());
    }
}

fn unexpected_response(what: &str, response: &Response) -> LdapError {
    LdapError::Protocol(format!("unexpected response to {} request: {:?}", what, response))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ldap_protocol::{Attribute, Modification, ModificationType};
    use crate::test_support::MockDirectoryServer;

    fn options() -> ConnectionOptions {
        ConnectionOptions {
            connect_timeout: Duration::from_secs(2),
            response_timeout: Duration::from_secs(2),
            ..ConnectionOptions::default()
        }
    }

    #[tokio::test]
    async fn test_bind_search_and_whoami() {
        let server = MockDirectoryServer::start("ds1").await;
        server.add_entry(Entry::with_attributes(
            "ou=People,dc=example,dc=com",
            vec![Attribute::new("objectClass", ["organizationalUnit"])],
        ));
        let mut conn = LdapConnection::connect(server.host(), server.port(), &options()).await.unwrap();
        conn.simple_bind(&SimpleBindRequest::new("cn=Manager", "secret")).await.unwrap();
        assert_eq!(conn.bound_dn(), Some("cn=Manager"));

        let entry = conn.get_entry("ou=People,dc=example,dc=com", &[]).await.unwrap().unwrap();
        assert!(entry.has_attribute_value("objectClass", b"organizationalUnit"));
        assert!(conn.get_entry("ou=Missing,dc=example,dc=com", &[]).await.unwrap().is_none());

        assert_eq!(conn.who_am_i().await.unwrap(), "dn:cn=Manager");
        conn.close().await;
        assert!(conn.is_closed());
        assert!(matches!(conn.who_am_i().await, Err(LdapError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_add_and_modify() {
        let server = MockDirectoryServer::start("ds1").await;
        let mut conn = LdapConnection::connect(server.host(), server.port(), &options()).await.unwrap();
        let add = AddRequest::new(
            "uid=jdoe,dc=example,dc=com",
            vec![Attribute::new("objectClass", ["person"]), Attribute::new("sn", ["Doe"])],
        );
        conn.add(&add).await.unwrap();
        assert!(server.has_entry("uid=jdoe,dc=example,dc=com"));

        let modify = ModifyRequest::new(
            "uid=jdoe,dc=example,dc=com",
            vec![Modification::with_values(ModificationType::Replace, "sn", ["Smith"])],
        );
        conn.modify(&modify).await.unwrap();

        let missing = ModifyRequest::new("uid=nobody,dc=example,dc=com", vec![]);
        let err = conn.modify(&missing).await.unwrap_err();
        assert_eq!(err.result_code(), Some(ResultCode::NO_SUCH_OBJECT));
        assert!(!conn.is_closed());
    }

    #[tokio::test]
    async fn test_invalid_request_is_not_sent() {
        let server = MockDirectoryServer::start("ds1").await;
        let mut conn = LdapConnection::connect(server.host(), server.port(), &options()).await.unwrap();
        let err = conn.add(&AddRequest::new("", Vec::new())).await.unwrap_err();
        assert!(matches!(err, LdapError::Parameter(_)));
        assert!(!conn.is_closed());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let server = MockDirectoryServer::start("gone").await;
        let port = server.port();
        server.shutdown().await;
        let err = LdapConnection::connect("127.0.0.1", port, &options()).await.unwrap_err();
        assert!(matches!(err, LdapError::Io(_) | LdapError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_server_shutdown_marks_connection_closed() {
        let server = MockDirectoryServer::start("ds1").await;
        let mut conn = LdapConnection::connect(server.host(), server.port(), &options()).await.unwrap();
        conn.who_am_i().await.unwrap();
        server.shutdown().await;
        assert!(conn.who_am_i().await.is_err());
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn test_response_timeout() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let hold = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(socket);
        });
        let mut opts = options();
        opts.response_timeout = Duration::from_millis(100);
        let mut conn = LdapConnection::connect("127.0.0.1", port, &opts).await.unwrap();
        assert!(matches!(conn.who_am_i().await, Err(LdapError::Timeout(_))));
        assert!(conn.is_closed());
        hold.abort();
    }

    #[tokio::test]
    async fn test_oversized_response_is_rejected() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let hold = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 256];
            let _ = socket.read(&mut buf).await;
            socket.write_all(&[0x30, 0x84, 0xFF, 0xFF, 0xFF, 0xFF]).await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });
        let mut opts = options();
        opts.max_message_size = 1024;
        let mut conn = LdapConnection::connect("127.0.0.1", port, &opts).await.unwrap();
        let err = conn.who_am_i().await.unwrap_err();
        assert!(matches!(
            err,
            LdapError::Decode(ber::DecodeError::MessageTooLarge { limit: 1024, .. })
        ));
        assert!(conn.is_closed());
        hold.abort();
    }
}
