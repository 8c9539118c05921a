//! ZAP (ZeroMQ Authentication Protocol, RFC 27) handler for CURVE servers.
//!
//! libzmq asks the handler bound to [`ZAP_ENDPOINT`] whether a peer may
//! complete its handshake. The handler only sees sockets of its own context.

use std::{
    collections::HashSet,
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::JoinHandle,
    time::Duration,
};

use anyhow::{Context as _, Result};

use crate::{
    curve::{self, CurveKey},
    termination_is_ok, timeout_is_ok,
    zmq_sockets::{markers::Linked, Context, Frames, Replier},
    AnyhowZmq,
};

pub const ZAP_ENDPOINT: &str = "inproc://zeromq.zap.01";
const ZAP_VERSION: &[u8] = b"1.0";
const CURVE_MECHANISM: &[u8] = b"CURVE";
const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub enum ZapPolicy {
    /// Accept every CURVE client. The connection is still encrypted.
    AllowAny,
    /// Accept only CURVE clients with one of these public keys.
    Curve(HashSet<CurveKey>),
}

impl ZapPolicy {
    /// Allow the public keys of all certificates found in `dir`.
    pub fn curve_from_dir(dir: impl AsRef<Path>) -> Result<Self> {
        curve::load_public_keys(dir).map(Self::Curve)
    }

    fn allows(&self, mechanism: &[u8], credentials: &[Vec<u8>]) -> Option<CurveKey> {
        if mechanism != CURVE_MECHANISM {
            return None;
        }
        let key = CurveKey::try_from(credentials.first()?.as_slice()).ok()?;
        match self {
            ZapPolicy::AllowAny => Some(key),
            ZapPolicy::Curve(keys) => keys.contains(&key).then_some(key),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
struct ZapReply {
    status_code: &'static str,
    status_text: &'static str,
    user_id: String,
}

impl ZapReply {
    fn frames(self, request_id: Vec<u8>) -> Frames {
        vec![
            ZAP_VERSION.to_vec(),
            request_id,
            self.status_code.as_bytes().to_vec(),
            self.status_text.as_bytes().to_vec(),
            self.user_id.into_bytes(),
            Vec::new(),
        ]
    }
}

/// Decide on a single request. Returns the request id to echo and the reply.
fn handle_request(policy: &ZapPolicy, mut request: Frames) -> (Vec<u8>, ZapReply) {
    if request.len() < 6 || request[0] != ZAP_VERSION {
        tracing::warn!(frames = request.len(), "Malformed ZAP request");
        let request_id = if request.len() > 1 {
            std::mem::take(&mut request[1])
        } else {
            Vec::new()
        };
        let reply = ZapReply {
            status_code: "500",
            status_text: "Malformed request",
            user_id: String::new(),
        };
        return (request_id, reply);
    }

    let request_id = std::mem::take(&mut request[1]);
    let credentials = request.split_off(6);
    let mechanism = &request[5];
    let address = String::from_utf8_lossy(&request[3]).into_owned();
    let domain = String::from_utf8_lossy(&request[2]).into_owned();

    let reply = match policy.allows(mechanism, &credentials) {
        Some(key) => {
            let user_id = curve::encode_key(&key);
            tracing::info!(%address, %domain, client = %user_id, "Allowed client");
            ZapReply {
                status_code: "200",
                status_text: "OK",
                user_id,
            }
        }
        None => {
            let mechanism = String::from_utf8_lossy(mechanism);
            tracing::warn!(%address, %domain, %mechanism, "Denied client");
            ZapReply {
                status_code: "400",
                status_text: "Unknown client",
                user_id: String::new(),
            }
        }
    };
    (request_id, reply)
}

/// Serves ZAP requests on a background thread until dropped.
#[derive(Debug)]
pub struct ZapAuthenticator {
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<Result<()>>>,
}

impl ZapAuthenticator {
    /// Bind the handler in `context`. Must happen before CURVE servers of that
    /// context accept connections.
    pub fn start(context: &Context, policy: ZapPolicy) -> Result<Self> {
        let handler = Replier::new(context)?
            .set_linger(Some(Duration::ZERO))?
            .set_receive_timeout(Some(POLL_INTERVAL))?
            .bind(ZAP_ENDPOINT)
            .context("Failed to start ZAP handler")?;

        let stop = Arc::new(AtomicBool::new(false));
        let worker = std::thread::Builder::new()
            .name("zap-handler".to_owned())
            .spawn({
                let stop = stop.clone();
                move || run(&handler, &policy, &stop)
            })
            .context("Failed to spawn ZAP handler thread")?;

        Ok(Self {
            stop,
            worker: Some(worker),
        })
    }
}

impl Drop for ZapAuthenticator {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            match worker.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!("ZAP handler failed: {e:#}"),
                Err(e) => tracing::error!("ZAP handler panicked: {e:?}"),
            }
        }
    }
}

#[tracing::instrument(name = "zap handler", skip_all)]
fn run(handler: &Replier<Linked>, policy: &ZapPolicy, stop: &AtomicBool) -> Result<()> {
    tracing::info!("Starting ZAP handler");
    while !stop.load(Ordering::SeqCst) {
        let request = match handler.receive_multipart() {
            Ok(request) => request,
            Err(e) if e.is_zmq_termination() => break,
            Err(e) => {
                timeout_is_ok(e)?;
                continue;
            }
        };
        let (request_id, reply) = handle_request(policy, request);
        handler
            .send_multipart(reply.frames(request_id))
            .or_else(termination_is_ok)?;
    }
    tracing::info!("Stopped ZAP handler");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(mechanism: &str, credentials: Vec<Vec<u8>>) -> Frames {
        let mut frames = vec![
            b"1.0".to_vec(),
            b"7".to_vec(),
            b"global".to_vec(),
            b"127.0.0.1".to_vec(),
            Vec::new(),
            mechanism.as_bytes().to_vec(),
        ];
        frames.extend(credentials);
        frames
    }

    #[test]
    fn allows_known_key() {
        let key = [3u8; 32];
        let policy = ZapPolicy::Curve(HashSet::from([key]));
        let (id, reply) = handle_request(&policy, request("CURVE", vec![key.to_vec()]));
        assert_eq!(id, b"7");
        assert_eq!(reply.status_code, "200");
        assert_eq!(reply.user_id, curve::encode_key(&key));
    }

    #[test]
    fn denies_unknown_key() {
        let policy = ZapPolicy::Curve(HashSet::from([[3u8; 32]]));
        let (_, reply) = handle_request(&policy, request("CURVE", vec![vec![4u8; 32]]));
        assert_eq!(reply.status_code, "400");
        assert!(reply.user_id.is_empty());
    }

    #[test]
    fn denies_other_mechanisms() {
        let (_, reply) = handle_request(&ZapPolicy::AllowAny, request("NULL", Vec::new()));
        assert_eq!(reply.status_code, "400");
    }

    #[test]
    fn allow_any_accepts_curve() {
        let (_, reply) =
            handle_request(&ZapPolicy::AllowAny, request("CURVE", vec![vec![9u8; 32]]));
        assert_eq!(reply.status_code, "200");
    }

    #[test]
    fn malformed_request_is_rejected() {
        let (id, reply) = handle_request(&ZapPolicy::AllowAny, vec![b"0.9".to_vec(), b"1".to_vec()]);
        assert_eq!(id, b"1");
        assert_eq!(reply.status_code, "500");
    }

    #[test]
    fn reply_has_six_frames() {
        let (id, reply) =
            handle_request(&ZapPolicy::AllowAny, request("CURVE", vec![vec![9u8; 32]]));
        let frames = reply.frames(id);
        assert_eq!(frames.len(), 6);
        assert_eq!(frames[0], b"1.0");
        assert_eq!(frames[2], b"200");
    }

    #[test]
    fn authenticator_stops_when_context_is_destroyed() {
        let mut ctx = Context::new();
        let auth = ZapAuthenticator::start(&ctx, ZapPolicy::AllowAny).unwrap();
        ctx.destroy().unwrap();
        drop(auth);
    }

    #[test]
    fn authenticator_starts_and_stops() {
        let ctx = Context::new();
        let auth = ZapAuthenticator::start(&ctx, ZapPolicy::AllowAny).unwrap();
        drop(auth);
    }
}
