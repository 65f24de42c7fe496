/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Hosts an [`InMemoryBus`] hub for [`RemoteBus`](super::remote::RemoteBus) clients.
//!
//! Every accepted connection gets its own [`InMemoryBusSession`] and two threads:
//! 1. A request thread that reads frames from the connection and applies them to the session.
//! 2. A forwarder thread that pops events off the session's queue and writes them back as `Event`
//!    frames.
//!
//! When the client hangs up the session is dropped, which releases every subscription it held.

use std::{
    collections::HashMap,
    io,
    net::{Shutdown, SocketAddr, TcpListener, TcpStream},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use crate::types::crypto_primitives::VerifyingKey;

use super::{
    frames::{Frame, PROBLEM_INVALID_KEY, PROBLEM_UNEXPECTED_FRAME},
    in_memory::{InMemoryBus, InMemoryBusSession},
    stream::{read_frame, FrameWriter, StreamReadError},
    Bus, BusError, Filter,
};

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(20);
const FORWARD_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Open client connections, keyed by accept sequence number.
type Connections = Arc<Mutex<HashMap<u64, TcpStream>>>;

pub struct BusServer {
    local_addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    connections: Connections,
    acceptor: Option<JoinHandle<()>>,
}

impl BusServer {
    /// Start serving `bus` on `listener`. Returns once the accept thread is running.
    pub fn start(bus: InMemoryBus, listener: TcpListener) -> io::Result<BusServer> {
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        let shutdown = Arc::new(AtomicBool::new(false));
        let connections = Arc::new(Mutex::new(HashMap::new()));

        let acceptor = {
            let shutdown = shutdown.clone();
            let connections = connections.clone();
            thread::spawn(move || accept_loop(bus, listener, shutdown, connections))
        };

        log::debug!("bus server listening on {local_addr}");

        Ok(BusServer {
            local_addr,
            shutdown,
            connections,
            acceptor: Some(acceptor),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of clients currently connected.
    pub fn connection_count(&self) -> usize {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Stop accepting, hang up on every client, and wait for the accept thread to exit.
    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        for tcp_stream in self
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, tcp_stream)| tcp_stream)
        {
            let _ = tcp_stream.shutdown(Shutdown::Both);
        }
        if let Some(acceptor) = self.acceptor.take() {
            let _ = acceptor.join();
        }
    }
}

impl Drop for BusServer {
    fn drop(&mut self) {
        self.shutdown()
    }
}

fn accept_loop(
    bus: InMemoryBus,
    listener: TcpListener,
    shutdown: Arc<AtomicBool>,
    connections: Connections,
) {
    let mut next_connection_id: u64 = 0;
    while !shutdown.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((tcp_stream, peer_addr)) => {
                log::debug!("bus server accepted connection from {peer_addr}");
                next_connection_id += 1;
                if let Err(err) = serve(&bus, tcp_stream, next_connection_id, &connections) {
                    log::warn!("bus server could not serve {peer_addr}: {err}");
                }
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL_INTERVAL)
            }
            Err(err) => {
                log::warn!("bus server accept failed: {err}");
                thread::sleep(ACCEPT_POLL_INTERVAL)
            }
        }
    }
}

fn serve(
    bus: &InMemoryBus,
    tcp_stream: TcpStream,
    connection_id: u64,
    connections: &Connections,
) -> io::Result<()> {
    // Accepted sockets may inherit the listener's non-blocking mode.
    tcp_stream.set_nonblocking(false)?;
    tcp_stream.set_nodelay(true)?;
    connections
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(connection_id, tcp_stream.try_clone()?);

    let (writer, _) = FrameWriter::spawn(&tcp_stream)?;
    let session = bus.session();
    let connected = Arc::new(AtomicBool::new(true));

    {
        let queue = session.queue();
        let writer = writer.clone();
        let connected = connected.clone();
        thread::spawn(move || {
            while connected.load(Ordering::SeqCst) {
                match queue.pop(Some(FORWARD_POLL_INTERVAL)) {
                    Ok(event) => {
                        let frame = Frame::Event {
                            thread_id: event.thread_id,
                            payload: event.payload,
                        };
                        if writer.write(frame).is_err() {
                            break;
                        }
                    }
                    Err(BusError::Timeout) | Err(BusError::Cancelled) => continue,
                    Err(_) => break,
                }
            }
        });
    }

    let connections = connections.clone();
    thread::spawn(move || {
        request_loop(session, tcp_stream, writer);
        connected.store(false, Ordering::SeqCst);
        connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&connection_id);
    });

    Ok(())
}

fn request_loop(mut session: InMemoryBusSession, mut tcp_stream: TcpStream, writer: FrameWriter) {
    loop {
        let frame = match read_frame(&mut tcp_stream) {
            Ok(frame) => frame,
            Err(StreamReadError::Closed) => break,
            Err(err) => {
                log::debug!("bus server connection ended: {err:?}");
                break;
            }
        };

        let response = match frame {
            Frame::SubscribeRequest {
                request_id,
                thread_ids,
            } => {
                for thread_id in &thread_ids {
                    let _ = session.subscribe(thread_id);
                }
                Some(Frame::BindResponse {
                    request_id,
                    binding_ids: thread_ids,
                })
            }
            Frame::SubscribeByFilterRequest {
                request_id,
                sender_keys,
                recipient_keys,
                protocols,
            } => match (decode_keys(&sender_keys), decode_keys(&recipient_keys)) {
                (Some(sender_keys), Some(recipient_keys)) => {
                    let filter = Filter {
                        sender_keys,
                        recipient_keys,
                        protocols,
                    };
                    Some(match session.subscribe_by_filter(&filter) {
                        Ok((_, binding_ids)) => Frame::BindResponse {
                            request_id,
                            binding_ids,
                        },
                        Err(err) => Frame::ProblemReport {
                            request_id,
                            problem_code: PROBLEM_UNEXPECTED_FRAME.to_string(),
                            explain: err.to_string(),
                        },
                    })
                }
                _ => Some(Frame::ProblemReport {
                    request_id,
                    problem_code: PROBLEM_INVALID_KEY.to_string(),
                    explain: "filter contains a malformed verification key".to_string(),
                }),
            },
            Frame::UnsubscribeRequest { thread_ids } => {
                let _ = session.unsubscribe_many(&thread_ids);
                None
            }
            Frame::PublishRequest {
                request_id,
                thread_id,
                payload,
            } => {
                let recipients = session.publish(&thread_id, payload).unwrap_or(0);
                Some(Frame::PublishResponse {
                    request_id,
                    recipients: recipients as u64,
                })
            }
            other => Some(Frame::ProblemReport {
                request_id: other.request_id().unwrap_or(0),
                problem_code: PROBLEM_UNEXPECTED_FRAME.to_string(),
                explain: format!("{} is not a request", other.name()),
            }),
        };

        if let Some(response) = response {
            if writer.write(response).is_err() {
                break;
            }
        }
    }
    let _ = tcp_stream.shutdown(Shutdown::Both);
}

fn decode_keys(keys: &[[u8; 32]]) -> Option<Vec<VerifyingKey>> {
    keys.iter()
        .map(|bytes| VerifyingKey::from_bytes(bytes).ok())
        .collect()
}
