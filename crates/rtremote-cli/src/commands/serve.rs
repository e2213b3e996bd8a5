//! `rtremote serve`: echo server

use anyhow::Context;
use rtremote::{Document, Endpoint, Environment, RemoteConfig, Stream, StreamListener, StreamState};
use std::sync::Arc;
use std::thread;

pub fn execute(config: RemoteConfig, listen: &str) -> anyhow::Result<()> {
    let endpoint: Endpoint = listen.parse()?;
    let env = Environment::new(config)?;

    env.set_request_handler(|stream: &Arc<Stream>, doc: &Document| -> rtremote::Result<()> {
        tracing::info!(message_type = ?doc.message_type(), key = ?doc.correlation_key(), "request");
        stream.send(&doc.response(doc.value().clone()))
    });

    let listener = StreamListener::bind(&env, &endpoint)?;
    println!("Listening on {}", listener.local_endpoint()?);

    // Requests are routed by whichever thread pumps the environment.
    let pump_env = Arc::clone(&env);
    let pump = thread::Builder::new()
        .name("rtremote-pump".to_string())
        .spawn(move || {
            let slice = std::time::Duration::from_millis(pump_env.config().pump_interval_ms);
            while pump_env.process_single_work_item(slice).is_ok() {}
        })
        .context("spawning pump thread")?;

    loop {
        let stream = match listener.accept() {
            Ok(stream) => stream,
            Err(rtremote::RemoteError::ShutdownInProgress) => break,
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                continue;
            }
        };
        tracing::info!(peer = ?stream.remote_endpoint(), "accepted");
        // The environment owns the stream from here until it closes.
        stream.set_state_changed_handler(|s: &Arc<Stream>, state: StreamState| -> rtremote::Result<()> {
            if state == StreamState::Closed {
                tracing::info!(peer = ?s.remote_endpoint(), "peer disconnected");
            }
            Ok(())
        });
    }

    env.shutdown();
    let _ = pump.join();
    Ok(())
}
