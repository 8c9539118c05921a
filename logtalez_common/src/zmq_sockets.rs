use std::time::Duration;

use anyhow::{anyhow, Context as _, Result};

pub use zmq::Error;

use crate::curve::{CurveCert, CurveKey};

/// Raw multi-part message, one byte vector per frame.
pub type Frames = Vec<Vec<u8>>;

/// Handle for a ØMQ context, used to create sockets.
///
/// It is thread safe, and can be safely cloned and shared. Each clone
/// references the same underlying C context. Sockets keep the context
/// alive for as long as they exist, and `inproc://` endpoints are only
/// reachable from sockets of the same context.
#[derive(Clone, Default)]
pub struct Context(zmq::Context);

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let threads = self.0.get_io_threads().ok();
        f.debug_struct(stringify!(Context))
            .field("io_threads", &threads)
            .finish()
    }
}

impl Context {
    /// Create a new reference-counted context handle.
    pub fn new() -> Context {
        Self(zmq::Context::new())
    }

    /// Terminate the context, even while clones of it are still alive.
    ///
    /// Blocking operations on sockets of this context fail with `ETERM`, and
    /// the call blocks until every socket of the context has been closed.
    pub fn destroy(&mut self) -> Result<()> {
        self.0.destroy().context("Failed to destroy ZMQ context")
    }
}

/// Represents a socket.
///
/// The generic parameter `Kind` represents the type of ØMQ socket. It can be any of:
/// - [`Publisher`][markers::Publisher] = `PUB`
/// - [`Subscriber`][markers::Subscriber] = `SUB`
/// - [`Replier`][markers::Replier] = `REP`
///
/// The generic parameter `LinkState` is either [`Detached`][markers::Detached] or
/// [`Linked`][markers::Linked] to represent a socket that is bound or connected to
/// an endpoint or one that was not yet bound or connected. Security options
/// only take effect for connections made afterwards, so they are only
/// available on detached sockets.
pub struct Socket<Kind, LinkState> {
    inner: zmq::Socket,
    kind: Kind,
    link_state: LinkState,
}

pub type Publisher<LinkState = markers::Detached> = Socket<markers::Publisher, LinkState>;
pub type Subscriber<LinkState = markers::Detached> = Socket<markers::Subscriber, LinkState>;
pub type Replier<LinkState = markers::Detached> = Socket<markers::Replier, LinkState>;

impl<Kind, LinkState> std::fmt::Debug for Socket<Kind, LinkState>
where
    Kind: std::fmt::Debug,
    LinkState: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Socket")
            .field("kind", &self.kind)
            .field("link_state", &self.link_state)
            .finish()
    }
}

impl<Kind> Socket<Kind, markers::Detached>
where
    Kind: markers::SocketKind,
{
    /// Create a new socket.
    ///
    /// The socket holds its own reference to `ctx`, so dropping the
    /// caller's handle does not terminate the context while the socket lives.
    pub fn new(ctx: &Context) -> Result<Self> {
        ctx.0
            .socket(Kind::KIND)
            .map(|inner| Self {
                inner,
                kind: Kind::default(),
                link_state: markers::Detached,
            })
            .with_context(|| format!("Failed to create {:?} socket", Kind::default()))
    }
}

impl<Kind> Socket<Kind, markers::Detached>
where
    Kind: std::fmt::Debug,
{
    /// Connect a socket.
    pub fn connect(self, endpoint: &str) -> Result<Socket<Kind, markers::Linked>> {
        self.inner
            .connect(endpoint)
            .with_context(|| format!("Failed to connect to {endpoint}"))?;
        tracing::debug!(kind = ?self.kind, "Connected to {endpoint}");
        Ok(Socket {
            inner: self.inner,
            link_state: markers::Linked,
            kind: self.kind,
        })
    }

    /// Connect a socket to each of the given endpoints. At least one endpoint is required.
    pub fn connect_all<I>(self, endpoints: I) -> Result<Socket<Kind, markers::Linked>>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let mut endpoints = endpoints.into_iter();
        let first = endpoints
            .next()
            .ok_or_else(|| anyhow!("No endpoint to connect to"))?;
        let socket = self.connect(first.as_ref())?;
        for endpoint in endpoints {
            let endpoint = endpoint.as_ref();
            socket
                .inner
                .connect(endpoint)
                .with_context(|| format!("Failed to connect to {endpoint}"))?;
            tracing::debug!(kind = ?socket.kind, "Connected to {endpoint}");
        }
        Ok(socket)
    }

    /// Accept connections on a socket.
    pub fn bind(self, endpoint: &str) -> Result<Socket<Kind, markers::Linked>> {
        self.inner
            .bind(endpoint)
            .with_context(|| format!("Failed to bind to {endpoint}"))?;
        tracing::debug!(kind = ?self.kind, "Bound to {endpoint}");
        Ok(Socket {
            inner: self.inner,
            link_state: markers::Linked,
            kind: self.kind,
        })
    }

    /// Configure the socket as CURVE client of the server owning `server_key`.
    pub fn curve_client(self, cert: &CurveCert, server_key: &CurveKey) -> Result<Self> {
        let secret_key = cert
            .require_secret_key()
            .context("CURVE client needs a secret key")?;
        self.inner
            .set_curve_serverkey(server_key)
            .context("Failed to set CURVE server key")?;
        self.inner
            .set_curve_publickey(&cert.public_key)
            .context("Failed to set CURVE public key")?;
        self.inner
            .set_curve_secretkey(secret_key)
            .context("Failed to set CURVE secret key")?;
        Ok(self)
    }

    /// Configure the socket as CURVE server with the key pair of `cert`.
    pub fn curve_server(self, cert: &CurveCert) -> Result<Self> {
        let secret_key = cert
            .require_secret_key()
            .context("CURVE server needs a secret key")?;
        self.inner
            .set_curve_server(true)
            .context("Failed to enable CURVE server")?;
        self.inner
            .set_curve_publickey(&cert.public_key)
            .context("Failed to set CURVE public key")?;
        self.inner
            .set_curve_secretkey(secret_key)
            .context("Failed to set CURVE secret key")?;
        Ok(self)
    }

    /// Set the domain passed along in ZAP requests.
    pub fn set_zap_domain(self, domain: &str) -> Result<Self> {
        self.inner
            .set_zap_domain(domain)
            .with_context(|| format!("Failed to set ZAP domain {domain}"))?;
        Ok(self)
    }

    /// Set how long pending outgoing messages are kept after the socket is closed.
    pub fn set_linger(self, linger: Option<Duration>) -> Result<Self> {
        self.inner
            .set_linger(to_zmq_timeout(linger)?)
            .context("Failed to set linger period")?;
        Ok(self)
    }

    /// Limit how long a receive blocks. `None` blocks forever.
    pub fn set_receive_timeout(self, timeout: Option<Duration>) -> Result<Self> {
        self.inner
            .set_rcvtimeo(to_zmq_timeout(timeout)?)
            .context("Failed to set receive timeout")?;
        Ok(self)
    }
}

fn to_zmq_timeout(timeout: Option<Duration>) -> Result<i32> {
    match timeout {
        None => Ok(-1),
        Some(timeout) => timeout
            .as_millis()
            .try_into()
            .with_context(|| format!("Timeout {timeout:?} out of range")),
    }
}

impl Publisher<markers::Linked> {
    /// Publish a single frame. The topic is the frame's prefix.
    #[tracing::instrument(skip_all, fields(len = frame.as_ref().len()))]
    pub fn send_frame(&self, frame: impl AsRef<[u8]>) -> Result<()> {
        self.inner
            .send(frame.as_ref(), 0)
            .context("Failed to publish frame")
    }
}

impl<LinkState> Subscriber<LinkState> {
    /// Subscribe to the given topic.
    pub fn subscribe(&self, topic: impl AsRef<[u8]>) -> Result<()> {
        self.inner.set_subscribe(topic.as_ref()).with_context(|| {
            let topic = String::from_utf8_lossy(topic.as_ref());
            format!("Failed to subscribe to {topic}")
        })
    }

    /// Unsubscribe from the given topic.
    pub fn unsubscribe(&self, topic: impl AsRef<[u8]>) -> Result<()> {
        self.inner.set_unsubscribe(topic.as_ref()).with_context(|| {
            let topic = String::from_utf8_lossy(topic.as_ref());
            format!("Failed to unsubscribe from {topic}")
        })
    }
}

impl<Kind> Socket<Kind, markers::Linked>
where
    Kind: markers::SocketKind,
{
    /// Block until a complete multi-part message arrives or the receive timeout expires.
    pub fn receive_multipart(&self) -> Result<Frames> {
        self.inner
            .recv_multipart(0)
            .context("Failed to receive message")
    }

    /// Send all frames as one multi-part message.
    pub fn send_multipart<I, T>(&self, frames: I) -> Result<()>
    where
        I: IntoIterator<Item = T>,
        T: Into<zmq::Message>,
    {
        self.inner
            .send_multipart(frames, 0)
            .context("Failed to send message")
    }

    /// The endpoint the socket was last bound to, with wildcards resolved.
    pub fn last_endpoint(&self) -> Result<String> {
        self.inner
            .get_last_endpoint()
            .context("Failed to get last endpoint")?
            .map_err(|_| anyhow!("Invalid UTF-8"))
    }
}

pub mod markers {
    #[derive(Debug, Default, Clone, Copy)]
    pub struct Linked;

    #[derive(Debug, Default, Clone, Copy)]
    pub struct Detached;

    #[derive(Debug, Default, Clone, Copy)]
    pub struct Publisher;

    #[derive(Debug, Default, Clone, Copy)]
    pub struct Subscriber;

    #[derive(Debug, Default, Clone, Copy)]
    pub struct Replier;

    mod sealed {
        pub trait Seal {}

        impl Seal for super::Subscriber {}
        impl Seal for super::Publisher {}
        impl Seal for super::Replier {}
    }

    #[doc(hidden)]
    pub trait SocketKind: Default + std::fmt::Debug + sealed::Seal {
        const KIND: zmq::SocketType;
    }

    impl SocketKind for Publisher {
        const KIND: zmq::SocketType = zmq::SocketType::PUB;
    }

    impl SocketKind for Subscriber {
        const KIND: zmq::SocketType = zmq::SocketType::SUB;
    }

    impl SocketKind for Replier {
        const KIND: zmq::SocketType = zmq::SocketType::REP;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_all_requires_an_endpoint() {
        let ctx = Context::new();
        let socket = Subscriber::new(&ctx).unwrap();
        let err = socket.connect_all(Vec::<String>::new()).unwrap_err();
        assert!(err.to_string().contains("No endpoint"));
    }

    #[test]
    fn connect_error_names_endpoint() {
        let ctx = Context::new();
        let socket = Subscriber::new(&ctx).unwrap();
        let err = socket
            .connect_all(["inproc://fine", "bogus://nowhere"])
            .unwrap_err();
        assert!(err.to_string().contains("bogus://nowhere"));
    }

    #[test]
    fn curve_client_needs_secret_key() {
        let ctx = Context::new();
        let mut cert = CurveCert::generate().unwrap();
        cert.secret_key = None;
        let server = CurveCert::generate().unwrap();
        let err = Subscriber::new(&ctx)
            .unwrap()
            .curve_client(&cert, &server.public_key)
            .unwrap_err();
        assert!(format!("{err:#}").contains("secret key"));
    }

    #[test]
    fn receive_times_out() {
        let ctx = Context::new();
        let socket = Subscriber::new(&ctx)
            .unwrap()
            .set_receive_timeout(Some(Duration::from_millis(10)))
            .unwrap()
            .connect("inproc://nobody-publishes-here")
            .unwrap();
        socket.subscribe("").unwrap();
        let err = socket.receive_multipart().unwrap_err();
        assert!(crate::AnyhowZmq::is_zmq_timeout(&err));
    }

    #[test]
    fn last_endpoint_resolves_wildcard_port() {
        let ctx = Context::new();
        let socket = Publisher::new(&ctx)
            .unwrap()
            .bind("tcp://127.0.0.1:*")
            .unwrap();
        let endpoint = socket.last_endpoint().unwrap();
        assert!(endpoint.starts_with("tcp://127.0.0.1:"));
        assert!(!endpoint.ends_with('*'));
    }
}
