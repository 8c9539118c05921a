//! Tail log streams published over CURVE secured ØMQ PUB sockets.
//!
//! Publishers (e.g. rsyslog with `omczmq`) prefix each message with a
//! `<host>.<program>` topic. [`make_topic_list`] builds those prefixes,
//! [`make_endpoint_list`] splits a connection string, and [`LogTalez`]
//! subscribes to them and hands every received message to a channel.

use std::{
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Receiver, Sender},
        Arc,
    },
    thread::JoinHandle,
    time::Duration,
};

use anyhow::{Context as _, Result};
use logtalez_common::{
    curve::CurveCert,
    zmq_sockets::{self, markers::Linked, Subscriber},
    AnyhowZmq, LIST_SEPARATOR,
};

pub use logtalez_common::zmq_sockets::{Context, Frames};

/// How often the receive worker checks whether it should stop.
pub const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Builds `"<host>.<program>"` for every host and program, hosts outer.
///
/// Both arguments are comma separated. Entries are used verbatim: nothing is
/// trimmed, deduplicated or dropped.
pub fn make_topic_list(hosts: &str, programs: &str) -> Vec<String> {
    topic_product(hosts.split(LIST_SEPARATOR), programs.split(LIST_SEPARATOR))
}

/// Cartesian product of already split host and program lists.
pub fn topic_product<H, P>(hosts: H, programs: P) -> Vec<String>
where
    H: IntoIterator,
    H::Item: std::fmt::Display,
    P: IntoIterator,
    P::Item: std::fmt::Display,
    P::IntoIter: Clone,
{
    let programs = programs.into_iter();
    hosts
        .into_iter()
        .flat_map(|host| {
            programs
                .clone()
                .map(move |program| format!("{host}.{program}"))
        })
        .collect()
}

/// Splits a comma separated connection string into endpoints, in order.
pub fn make_endpoint_list(connections: &str) -> Vec<String> {
    connections
        .split(LIST_SEPARATOR)
        .map(ToOwned::to_owned)
        .collect()
}

/// A running subscription. Received messages arrive on [`LogTalez::tail_chan`].
#[derive(Debug)]
pub struct LogTalez {
    tail: Receiver<Frames>,
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<Result<()>>>,
}

impl LogTalez {
    /// Connect to every endpoint with CURVE and subscribe to every topic.
    ///
    /// `server_cert_path` only needs to provide the publisher's public key,
    /// `client_cert_path` must resolve to a certificate with a secret key.
    pub fn new<E, T>(
        endpoints: E,
        topics: T,
        server_cert_path: impl AsRef<Path>,
        client_cert_path: impl AsRef<Path>,
    ) -> Result<Self>
    where
        E: IntoIterator,
        E::Item: AsRef<str>,
        T: IntoIterator,
        T::Item: AsRef<[u8]>,
    {
        Self::with_context(
            &Context::new(),
            endpoints,
            topics,
            server_cert_path,
            client_cert_path,
        )
    }

    /// Like [`LogTalez::new`], but creates the socket in an existing context.
    #[tracing::instrument(name = "subscribe", skip_all)]
    pub fn with_context<E, T>(
        context: &Context,
        endpoints: E,
        topics: T,
        server_cert_path: impl AsRef<Path>,
        client_cert_path: impl AsRef<Path>,
    ) -> Result<Self>
    where
        E: IntoIterator,
        E::Item: AsRef<str>,
        T: IntoIterator,
        T::Item: AsRef<[u8]>,
    {
        let server_cert =
            CurveCert::load(server_cert_path).context("Failed to load server certificate")?;
        let client_cert =
            CurveCert::load(client_cert_path).context("Failed to load client certificate")?;

        let socket = Subscriber::new(context)?
            .curve_client(&client_cert, &server_cert.public_key)?
            .set_linger(Some(Duration::ZERO))?
            .set_receive_timeout(Some(POLL_INTERVAL))?;

        for topic in topics {
            let topic = topic.as_ref();
            socket.subscribe(topic)?;
            tracing::info!(topic = %String::from_utf8_lossy(topic), "Subscribed");
        }

        let socket = socket.connect_all(endpoints)?;

        let (sender, tail) = mpsc::channel();
        let stop = Arc::new(AtomicBool::new(false));
        let worker = std::thread::Builder::new()
            .name("logtalez-tail".to_owned())
            .spawn({
                let stop = stop.clone();
                move || receive_loop(&socket, &sender, &stop)
            })
            .context("Failed to spawn receive thread")?;

        Ok(Self {
            tail,
            stop,
            worker: Some(worker),
        })
    }

    /// Channel of received multi-part messages. It disconnects once the
    /// receive worker has stopped.
    pub fn tail_chan(&self) -> &Receiver<Frames> {
        &self.tail
    }

    /// Stop receiving and report whether the receive worker failed.
    pub fn shutdown(mut self) -> Result<()> {
        self.stop_worker()
    }

    fn stop_worker(&mut self) -> Result<()> {
        self.stop.store(true, Ordering::SeqCst);
        match self.worker.take() {
            None => Ok(()),
            Some(worker) => worker
                .join()
                .map_err(|e| anyhow::anyhow!("Receive thread panicked: {e:?}"))?
                .context("Receive thread failed"),
        }
    }
}

impl Drop for LogTalez {
    fn drop(&mut self) {
        if let Err(e) = self.stop_worker() {
            tracing::error!("Failed to stop subscription: {e:#}");
        }
    }
}

#[tracing::instrument(name = "tail", skip_all)]
fn receive_loop(
    socket: &zmq_sockets::Subscriber<Linked>,
    sender: &Sender<Frames>,
    stop: &AtomicBool,
) -> Result<()> {
    tracing::info!("Starting receive loop");
    while !stop.load(Ordering::SeqCst) {
        let frames = match socket.receive_multipart() {
            Ok(frames) => frames,
            Err(e) if e.is_zmq_timeout() => continue,
            Err(e) if e.is_zmq_termination() => {
                tracing::info!("Context terminated, stopping receive loop");
                break;
            }
            Err(e) => {
                tracing::error!("Failed to receive message: {e:#}");
                return Err(e);
            }
        };

        tracing::trace!(frames = frames.len(), "Received message");
        if sender.send(frames).is_err() {
            tracing::info!("Receiver dropped, stopping receive loop");
            break;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_list_is_host_major() {
        assert_eq!(
            make_topic_list("host1,host2", "program1,program2"),
            [
                "host1.program1",
                "host1.program2",
                "host2.program1",
                "host2.program2",
            ]
        );
    }

    #[test]
    fn topic_list_keeps_duplicates_and_empty_entries() {
        assert_eq!(make_topic_list("h,h", "p"), ["h.p", "h.p"]);
        assert_eq!(make_topic_list("h", ""), ["h."]);
        assert_eq!(make_topic_list("a,", "x"), ["a.x", ".x"]);
    }

    #[test]
    fn topic_product_of_slices() {
        assert_eq!(
            topic_product(["web"], &["nginx", "sshd"]),
            ["web.nginx", "web.sshd"]
        );
        assert!(topic_product(Vec::<String>::new(), ["p"]).is_empty());
    }

    #[test]
    fn endpoint_list_preserves_order() {
        assert_eq!(
            make_endpoint_list("tcp://incproc1,tcp://inproc2"),
            ["tcp://incproc1", "tcp://inproc2"]
        );
        assert_eq!(
            make_endpoint_list("tcp://b,tcp://a,tcp://b"),
            ["tcp://b", "tcp://a", "tcp://b"]
        );
        assert_eq!(make_endpoint_list(""), [""]);
    }
}
