use std::{
    io::{ErrorKind, Write as _},
    path::PathBuf,
    sync::mpsc::RecvTimeoutError,
};

use anyhow::{Context as _, Result};
use clap::Parser;
use logtalez::{make_endpoint_list, make_topic_list, Frames, LogTalez, POLL_INTERVAL};
use logtalez_common::{
    install_signal_handler, shutdown_requested, TracingConfiguration, ENV_CLIENT_CERT,
    ENV_ENDPOINTS, ENV_HOSTS, ENV_PROGRAMS, ENV_SERVER_CERT,
};

/// Tail logs published on CURVE secured ØMQ endpoints.
#[derive(Debug, Parser)]
#[command(version)]
struct Args {
    /// Comma separated list of endpoints, e.g. tcp://logs1:24444,tcp://logs2:24444
    #[arg(long, env = ENV_ENDPOINTS)]
    endpoints: String,

    /// Comma separated list of hosts to tail
    #[arg(long, env = ENV_HOSTS)]
    hosts: String,

    /// Comma separated list of programs to tail
    #[arg(long, env = ENV_PROGRAMS)]
    programs: String,

    /// Public certificate of the publisher
    #[arg(long, env = ENV_SERVER_CERT)]
    server_cert: PathBuf,

    /// Certificate of this client; `<path>_secret` is preferred if it exists
    #[arg(long, env = ENV_CLIENT_CERT)]
    client_cert: PathBuf,

    /// Drop the leading topic token from each message
    #[arg(long)]
    strip_topic: bool,

    /// Emit diagnostics as JSON on stderr
    #[arg(long)]
    json_logs: bool,
}

/// Render a message as one output line. Frames are joined with a space.
fn format_message(frames: &Frames, strip_topic: bool) -> String {
    let mut parts = frames.iter().map(|frame| String::from_utf8_lossy(frame));
    let mut line = match parts.next() {
        Some(first) if strip_topic => first
            .split_once(' ')
            .map(|(_, rest)| rest.to_owned())
            .unwrap_or_default(),
        Some(first) => first.into_owned(),
        None => String::new(),
    };
    for part in parts {
        if !line.is_empty() {
            line.push(' ');
        }
        line.push_str(&part);
    }
    line.truncate(line.trim_end_matches(['\r', '\n']).len());
    line
}

fn tail(lt: &LogTalez, strip_topic: bool) -> Result<()> {
    let stdout = std::io::stdout();
    while !shutdown_requested() {
        let frames = match lt.tail_chan().recv_timeout(POLL_INTERVAL) {
            Ok(frames) => frames,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => {
                tracing::warn!("Subscription ended");
                break;
            }
        };

        let mut out = stdout.lock();
        let written = writeln!(out, "{}", format_message(&frames, strip_topic))
            .and_then(|_| out.flush());
        match written {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::BrokenPipe => {
                tracing::info!("Output closed");
                break;
            }
            Err(e) => return Err(e).context("Failed to write message"),
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    let _config = TracingConfiguration::new(args.json_logs)?;
    install_signal_handler()?;

    let endpoints = make_endpoint_list(&args.endpoints);
    let topics = make_topic_list(&args.hosts, &args.programs);
    tracing::info!(?endpoints, ?topics, "Starting logtalez");

    let lt = LogTalez::new(&endpoints, &topics, &args.server_cert, &args.client_cert)
        .context("Failed to subscribe")?;

    let result = tail(&lt, args.strip_topic);
    lt.shutdown()?;
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frames(parts: &[&str]) -> Frames {
        parts.iter().map(|p| p.as_bytes().to_vec()).collect()
    }

    #[test]
    fn keeps_topic_by_default() {
        let msg = frames(&["web1.nginx GET /index.html\n"]);
        assert_eq!(format_message(&msg, false), "web1.nginx GET /index.html");
    }

    #[test]
    fn strips_topic_token() {
        let msg = frames(&["web1.nginx GET /index.html"]);
        assert_eq!(format_message(&msg, true), "GET /index.html");
    }

    #[test]
    fn joins_frames() {
        let msg = frames(&["web1.sshd", "session opened"]);
        assert_eq!(format_message(&msg, false), "web1.sshd session opened");
        assert_eq!(format_message(&msg, true), "session opened");
    }

    #[test]
    fn empty_message() {
        assert_eq!(format_message(&Vec::new(), true), "");
    }

    #[test]
    fn parses_arguments() {
        let args = Args::try_parse_from([
            "logtalez",
            "--endpoints",
            "tcp://a:1,tcp://b:2",
            "--hosts",
            "h",
            "--programs",
            "p",
            "--server-cert",
            "server",
            "--client-cert",
            "client",
            "--strip-topic",
        ])
        .unwrap();
        assert_eq!(make_endpoint_list(&args.endpoints).len(), 2);
        assert!(args.strip_topic);
        assert!(!args.json_logs);
    }
}
