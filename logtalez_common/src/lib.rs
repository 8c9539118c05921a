use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context as _;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod curve;
pub mod zap;
pub mod zmq_sockets;

pub const ENV_ENDPOINTS: &str = "LOGTALEZ_ENDPOINTS";
pub const ENV_HOSTS: &str = "LOGTALEZ_HOSTS";
pub const ENV_PROGRAMS: &str = "LOGTALEZ_PROGRAMS";
pub const ENV_SERVER_CERT: &str = "LOGTALEZ_SERVER_CERT";
pub const ENV_CLIENT_CERT: &str = "LOGTALEZ_CLIENT_CERT";

/// Separator used by every comma-delimited list on the command line.
pub const LIST_SEPARATOR: char = ',';

/// Global `tracing` setup. Logs go to stderr so stdout stays free for tailed lines.
pub struct TracingConfiguration(());

impl TracingConfiguration {
    pub fn new(json: bool) -> anyhow::Result<Self> {
        let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;

        let registry = tracing_subscriber::registry().with(filter);
        let result = if json {
            registry
                .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
                .try_init()
        } else {
            registry
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .try_init()
        };
        result.context("Failed to install tracing subscriber")?;

        Ok(TracingConfiguration(()))
    }
}

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

pub fn shutdown_requested() -> bool {
    SHUTDOWN.load(Ordering::SeqCst)
}

pub fn request_shutdown() {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

/// Sets the shutdown flag on SIGINT and SIGTERM.
pub fn install_signal_handler() -> anyhow::Result<()> {
    ctrlc::set_handler(|| {
        tracing::info!("Received termination signal, shutting down");
        request_shutdown();
    })
    .context("Failed to install signal handler")
}

pub trait AnyhowZmq {
    /// The ØMQ context was terminated while the operation was pending.
    fn is_zmq_termination(&self) -> bool;
    /// A send or receive timeout expired.
    fn is_zmq_timeout(&self) -> bool;
}

impl AnyhowZmq for anyhow::Error {
    fn is_zmq_termination(&self) -> bool {
        self.chain()
            .any(|e| e.downcast_ref::<zmq::Error>() == Some(&zmq::Error::ETERM))
    }

    fn is_zmq_timeout(&self) -> bool {
        self.chain()
            .any(|e| e.downcast_ref::<zmq::Error>() == Some(&zmq::Error::EAGAIN))
    }
}

pub fn termination_is_ok(e: anyhow::Error) -> anyhow::Result<()> {
    if e.is_zmq_termination() {
        Ok(())
    } else {
        Err(e)
    }
}

pub fn timeout_is_ok(e: anyhow::Error) -> anyhow::Result<()> {
    if e.is_zmq_timeout() {
        Ok(())
    } else {
        Err(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn termination_is_detected_through_context() {
        let e = anyhow::Error::new(zmq::Error::ETERM).context("Failed to receive message");
        assert!(e.is_zmq_termination());
        assert!(!e.is_zmq_timeout());
        assert!(termination_is_ok(e).is_ok());
    }

    #[test]
    fn timeout_is_detected_through_context() {
        let e = anyhow::Error::new(zmq::Error::EAGAIN).context("Failed to receive message");
        assert!(e.is_zmq_timeout());
        assert!(timeout_is_ok(e).is_ok());
    }

    #[test]
    fn other_errors_are_kept() {
        let e = anyhow::Error::new(zmq::Error::EINVAL).context("Failed to connect");
        assert!(termination_is_ok(e).is_err());
        assert!(timeout_is_ok(anyhow::anyhow!("plain")).is_err());
    }
}
