//! Agent side of the loopback link, run on its own thread.
//!
//! Drains responses and publications so they show up in the log, and when
//! asked to, injects a control request at a fixed interval.

use bridge_core::communication::LoopbackAgent;
use crossbeam::channel::{never, select, tick, Receiver};
use std::io;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

const DRAIN_INTERVAL: Duration = Duration::from_millis(50);

pub fn spawn(
    agent: LoopbackAgent,
    inject_every: Option<Duration>,
    topic: String,
    shutdown: Receiver<()>,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("loopback-agent".to_string())
        .spawn(move || run(agent, inject_every, &topic, shutdown))
}

fn run(agent: LoopbackAgent, inject_every: Option<Duration>, topic: &str, shutdown: Receiver<()>) {
    let injections = inject_every.map(tick).unwrap_or_else(never);
    let drain = tick(DRAIN_INTERVAL);
    let mut control: i16 = 0;

    loop {
        select! {
            recv(shutdown) -> _ => break,
            recv(injections) -> _ => {
                match agent.call(topic, control) {
                    Ok(sequence) => debug!(sequence, control, "control request injected"),
                    Err(err) => {
                        warn!(error = %err, "node side of the loopback is gone");
                        break;
                    }
                }
                control = control.wrapping_add(1);
            }
            recv(drain) -> _ => {}
        }

        while let Some((sequence, state)) = agent.try_response() {
            info!(sequence, state, "control response");
        }
        while let Some(frame) = agent.try_publication() {
            info!(
                topic = %frame.topic,
                payload = frame.text().unwrap_or("<binary>"),
                "publication"
            );
        }
    }
    debug!("loopback agent stopped");
}
