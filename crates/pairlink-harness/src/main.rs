//! pairlink-sim - run one simulated pairing end to end.
//!
//! Pairs a session with the simulated web client, exchanges echo requests
//! over the chunked application channel, stops the session, and checks what
//! both sides observed. Exits non-zero on the first discrepancy.

use std::process::ExitCode;

use ciborium::Value;
use clap::Parser;
use pairlink_core::{DisconnectContext, DisconnectReason, Envelope, MessageType};
use pairlink_harness::{LogEntry, SimTransportConfig, World, scenario::world::demo_descriptor};
use pairlink_session::SessionConfig;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "pairlink-sim")]
#[command(about = "Deterministic end-to-end simulation of a Pairlink session")]
struct Args {
    /// RNG seed for the simulated environment
    #[arg(long, default_value = "0")]
    seed: u64,

    /// Data channel maximum message size (chunk size)
    #[arg(long, default_value = "16384")]
    max_message_size: usize,

    /// Number of echo requests the web client sends
    #[arg(long, default_value = "8")]
    requests: usize,

    /// Payload bytes per echo request
    #[arg(long, default_value = "65536")]
    payload_size: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level)),
        )
        .init();

    match run(&args) {
        Ok(()) => {
            info!(requests = args.requests, "simulation passed");
            ExitCode::SUCCESS
        },
        Err(e) => {
            error!(error = %e, "simulation failed");
            ExitCode::FAILURE
        },
    }
}

fn run(args: &Args) -> Result<(), String> {
    let transport =
        SimTransportConfig { max_message_size: args.max_message_size, ..Default::default() };
    let mut world = World::new(demo_descriptor(), SessionConfig::default(), transport, args.seed)
        .map_err(|e| format!("could not build session: {e}"))?;

    world
        .instance
        .start(vec![0x1d; 32], vec![0xa7; 32], Some("sim".into()))
        .map_err(|e| e.to_string())?;
    world.settle();
    world.network.establish();
    world.settle();
    if !world.is_connected() {
        return Err(format!("session did not connect, state {:?}", world.state()));
    }
    info!(connection_id = world.last_connection_id(), "paired");

    for i in 0..args.requests {
        let payload: Vec<u8> = (0..args.payload_size).map(|b| (b + i) as u8).collect();
        let request = Envelope::new(MessageType::Request, "echo").with_data(Value::Bytes(payload));
        world.network.peer_send(&request);
        world.settle();
    }

    let echoes = world
        .sent()
        .into_iter()
        .filter(|e| e.message_type == MessageType::Response && e.sub_type == "echo")
        .count();
    if echoes != args.requests {
        return Err(format!("expected {} echo responses, web client got {echoes}", args.requests));
    }

    let reason = DisconnectContext::by_us(DisconnectReason::SessionStopped);
    world.instance.stop(reason).map_err(|e| e.to_string())?;
    world.settle();

    if world.log.stopped() != vec![reason] {
        return Err(format!("unexpected stopped notifications {:?}", world.log.stopped()));
    }
    let acquired = world.log.count(|e| matches!(e, LogEntry::Acquired(_)));
    info!(echoes, acquired, state = %world.state_kind(), "session stopped");
    Ok(())
}
