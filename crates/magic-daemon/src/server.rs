//! Control listener.
//!
//! Accepts TCP connections speaking the framed control protocol and
//! dispatches decoded commands to the engine: capabilities exchange and
//! watchdog housekeeping plus the resource-control verbs
//! (allocate / release / stats). Connections are handled by a fixed worker
//! pool fed through a bounded channel.

use std::io::Write;
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use magic_engine::Engine;
use magic_wire::codec::read_frame;
use magic_wire::dict::{self, Action};
use magic_wire::ops::{
    allocate_answer, capabilities_answer, failure_answer, stats_answer, success_answer,
    ResourceControlRequest,
};
use magic_wire::Message;
use tracing::{debug, info, warn};

/// Pending-connection backlog between the accept loop and the workers.
const CONNECTION_BACKLOG: usize = 64;

pub struct Server {
    name: String,
    engine: Arc<Engine>,
}

impl Server {
    pub fn new(name: String, engine: Arc<Engine>) -> Arc<Self> {
        Arc::new(Server { name, engine })
    }

    /// Run the accept loop until `stop` flips. Worker threads drain the
    /// backlog; each connection is served to completion by one worker.
    pub fn run(
        self: Arc<Self>,
        listener: TcpListener,
        workers: usize,
        stop: Arc<AtomicBool>,
    ) -> Result<()> {
        listener
            .set_nonblocking(true)
            .context("listener nonblocking")?;
        let (tx, rx): (Sender<TcpStream>, Receiver<TcpStream>) = bounded(CONNECTION_BACKLOG);

        let mut handles = Vec::with_capacity(workers);
        for worker in 0..workers.max(1) {
            let rx = rx.clone();
            let server = Arc::clone(&self);
            let handle = thread::Builder::new()
                .name(format!("magic-worker-{worker}"))
                .spawn(move || {
                    while let Ok(stream) = rx.recv() {
                        if let Err(e) = server.serve_connection(stream) {
                            debug!(error = %e, "connection ended with error");
                        }
                    }
                })
                .context("spawn worker")?;
            handles.push(handle);
        }

        info!(
            addr = %listener.local_addr().map(|a| a.to_string()).unwrap_or_default(),
            workers,
            "control listener running"
        );

        while !stop.load(Ordering::Relaxed) {
            match listener.accept() {
                Ok((stream, peer)) => {
                    debug!(%peer, "client connected");
                    match tx.try_send(stream) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => {
                            warn!(%peer, "connection backlog full, client dropped");
                        }
                        Err(TrySendError::Disconnected(_)) => break,
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(100));
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    thread::sleep(Duration::from_millis(100));
                }
            }
        }

        drop(tx);
        for handle in handles {
            let _ = handle.join();
        }
        info!("control listener stopped");
        Ok(())
    }

    fn serve_connection(&self, mut stream: TcpStream) -> Result<()> {
        stream
            .set_read_timeout(Some(Duration::from_secs(300)))
            .ok();
        loop {
            let Some(frame) = read_frame(&mut stream)? else {
                return Ok(());
            };
            let message = match Message::decode(&mut frame.freeze()) {
                Ok(message) => message,
                Err(e) => {
                    warn!(error = %e, "undecodable frame, closing connection");
                    return Ok(());
                }
            };
            if !message.header.is_request() {
                debug!(command = message.header.command, "ignoring stray answer");
                continue;
            }
            let answer = self.handle(&message);
            stream.write_all(&answer.encode())?;
        }
    }

    fn handle(&self, request: &Message) -> Message {
        match request.header.command {
            dict::CMD_CAPABILITIES_EXCHANGE => capabilities_answer(request, &self.name),
            dict::CMD_DEVICE_WATCHDOG => success_answer(request),
            dict::CMD_RESOURCE_CONTROL => self.handle_resource_control(request),
            other => {
                warn!(command = other, "unknown command");
                failure_answer(request, dict::RESULT_UNABLE_TO_COMPLY, "unknown command")
            }
        }
    }

    fn handle_resource_control(&self, request: &Message) -> Message {
        let parsed = match ResourceControlRequest::from_message(request) {
            Ok(parsed) => parsed,
            Err(e) => {
                return failure_answer(request, dict::RESULT_INVALID_AVP_VALUE, &e.to_string());
            }
        };

        match parsed.action {
            Action::Allocate => match self.engine.allocate(parsed.request) {
                Ok(grant) => allocate_answer(request, &grant),
                Err(e) => failure_answer(request, e.result_code(), &e.to_string()),
            },
            Action::Release => {
                let Some(session) = parsed.session else {
                    return failure_answer(
                        request,
                        dict::RESULT_INVALID_AVP_VALUE,
                        "release without session number",
                    );
                };
                match self.engine.release(session) {
                    Ok(()) => success_answer(request),
                    Err(e) => failure_answer(request, e.result_code(), &e.to_string()),
                }
            }
            Action::Stats => {
                let result = match parsed.session {
                    Some(session) => self.engine.stats(session),
                    None if parsed.request.client_id == "*" => Ok(self.engine.stats_all()),
                    None => self.engine.stats_client(&parsed.request.client_id),
                };
                match result {
                    Ok(counters) => stats_answer(request, &counters),
                    Err(e) => failure_answer(request, e.result_code(), &e.to_string()),
                }
            }
            Action::Modify => failure_answer(
                request,
                dict::RESULT_INVALID_AVP_VALUE,
                "modify is not supported",
            ),
        }
    }
}
