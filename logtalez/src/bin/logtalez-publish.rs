use std::{
    io::BufRead as _,
    path::PathBuf,
    sync::mpsc::{self, Receiver, RecvTimeoutError},
    time::Duration,
};

use anyhow::{Context as _, Result};
use clap::Parser;
use logtalez_common::{
    curve::CurveCert,
    zap::{ZapAuthenticator, ZapPolicy},
    install_signal_handler, shutdown_requested,
    zmq_sockets::{Context, Publisher},
    TracingConfiguration, ENV_SERVER_CERT,
};

/// Publish stdin lines on a CURVE secured PUB socket, one message per line.
#[derive(Debug, Parser)]
#[command(version)]
struct Args {
    /// Endpoint to bind, e.g. tcp://*:24444
    #[arg(long)]
    bind: String,

    /// Certificate of this publisher, must contain the secret key
    #[arg(long, env = ENV_SERVER_CERT)]
    server_cert: PathBuf,

    /// Directory of client certificates allowed to subscribe
    #[arg(long, required_unless_present = "allow_any", conflicts_with = "allow_any")]
    auth_dir: Option<PathBuf>,

    /// Accept any client key
    #[arg(long)]
    allow_any: bool,

    /// Topic put in front of every line, usually <host>.<program>
    #[arg(long)]
    topic: String,

    /// Emit diagnostics as JSON on stderr
    #[arg(long)]
    json_logs: bool,
}

const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Read stdin on its own thread so the main loop can notice a shutdown
/// request while no input arrives.
fn spawn_stdin_reader() -> Result<Receiver<std::io::Result<String>>> {
    let (sender, lines) = mpsc::channel();
    std::thread::Builder::new()
        .name("stdin-reader".to_owned())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                if sender.send(line).is_err() {
                    break;
                }
            }
        })
        .context("Failed to spawn stdin reader")?;
    Ok(lines)
}

/// Hand each line to `publish` until input ends or a shutdown is requested.
fn forward_lines<F>(lines: &Receiver<std::io::Result<String>>, mut publish: F) -> Result<()>
where
    F: FnMut(String) -> Result<()>,
{
    while !shutdown_requested() {
        match lines.recv_timeout(POLL_INTERVAL) {
            Ok(line) => publish(line.context("Failed to read stdin")?)?,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => {
                tracing::info!("End of input");
                break;
            }
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    let _config = TracingConfiguration::new(args.json_logs)?;
    install_signal_handler()?;

    let cert = CurveCert::load(&args.server_cert).context("Failed to load server certificate")?;
    let policy = match &args.auth_dir {
        Some(dir) => ZapPolicy::curve_from_dir(dir)?,
        None => ZapPolicy::AllowAny,
    };

    let context = Context::new();
    let _auth = ZapAuthenticator::start(&context, policy)?;
    let publisher = Publisher::new(&context)?
        .curve_server(&cert)?
        .set_zap_domain("global")?
        .set_linger(Some(Duration::from_secs(1)))?
        .bind(&args.bind)?;
    tracing::info!(endpoint = %publisher.last_endpoint()?, key = %cert.public_text(), "Publishing");

    let lines = spawn_stdin_reader()?;
    forward_lines(&lines, |line| {
        publisher.send_frame(format!("{} {line}", args.topic))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forwards_until_input_ends() {
        let (sender, lines) = mpsc::channel();
        sender.send(Ok("first".to_owned())).unwrap();
        sender.send(Ok("second".to_owned())).unwrap();
        drop(sender);

        let mut published = Vec::new();
        forward_lines(&lines, |line| {
            published.push(line);
            Ok(())
        })
        .unwrap();
        assert_eq!(published, ["first", "second"]);
    }

    #[test]
    fn read_error_stops_forwarding() {
        let (sender, lines) = mpsc::channel();
        sender
            .send(Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "not utf-8")))
            .unwrap();
        sender.send(Ok("never".to_owned())).unwrap();

        let mut published = Vec::new();
        let err = forward_lines(&lines, |line| {
            published.push(line);
            Ok(())
        })
        .unwrap_err();
        assert!(format!("{err:#}").contains("Failed to read stdin"));
        assert!(published.is_empty());
    }
}
