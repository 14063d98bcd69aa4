use anyhow::{Context, Result};
use clap::Parser;
use conch::call::{CallController, CallSetup, NoticeSink};
use conch::cli::{Cli, ConsoleCommand};
use conch::media::{LoggingRenderSink, SyntheticCapture};
use conch::peer::webrtc::WebRtcPeerFactory;
use conch::signaling::{SignalingTransport, TransportState};
use conch::telemetry::logging;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

struct ConsoleNotices;

impl NoticeSink for ConsoleNotices {
    fn notify(&self, message: &str) {
        eprintln!("! {message}");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(&cli.logging.to_config()).context("failed to initialise logging")?;
    let config = cli.call_config().context("invalid call configuration")?;
    tracing::info!(
        target = "conch::main",
        url = %config.signaling_url,
        ice_servers = config.ice_servers.len(),
        video = config.capture.video.is_some(),
        "starting"
    );

    let transport = Arc::new(SignalingTransport::new(
        config.signaling_url.clone(),
        config.reconnect.clone(),
    ));
    let inbound = transport.messages();
    transport.connect();

    let (call, task) = CallController::spawn(
        CallSetup {
            signaling: transport.clone(),
            factory: Arc::new(WebRtcPeerFactory::new()),
            capture: Arc::new(SyntheticCapture::new()),
            local_view: Arc::new(LoggingRenderSink::new("local")),
            remote_view: Arc::new(LoggingRenderSink::new("remote")),
            notices: Arc::new(ConsoleNotices),
            ice_servers: config.ice_servers.clone(),
            constraints: config.capture.clone(),
        },
        inbound,
    );
    call.acquire_media()?;

    if cli.call {
        transport
            .state()
            .wait_for(|state| *state == TransportState::Open)
            .await
            .context("signaling transport stopped before connecting")?;
        call.start_call()?;
    }

    println!("{}", ConsoleCommand::USAGE);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut states = call.watch_state();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("failed to read stdin")? else { break };
                match ConsoleCommand::parse(&line) {
                    Some(ConsoleCommand::Call) => call.start_call()?,
                    Some(ConsoleCommand::HangUp) => call.hang_up()?,
                    Some(ConsoleCommand::Pause) => call.pause_preview()?,
                    Some(ConsoleCommand::Resume) => call.resume_preview()?,
                    Some(ConsoleCommand::Status) => {
                        let relay = *transport.state().borrow();
                        println!(
                            "call: {}  relay: {relay:?}  connection attempts: {}",
                            call.state().as_str(),
                            transport.connection_attempts()
                        );
                    }
                    Some(ConsoleCommand::Help) => println!("{}", ConsoleCommand::USAGE),
                    Some(ConsoleCommand::Quit) => break,
                    None if line.trim().is_empty() => {}
                    None => println!("unknown command; {}", ConsoleCommand::USAGE),
                }
            }
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                println!("call {}", states.borrow().as_str());
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    // The task may already be gone if it stopped on its own.
    let _ = call.shutdown();
    task.await.context("call task panicked")?;
    transport.shutdown();
    Ok(())
}
