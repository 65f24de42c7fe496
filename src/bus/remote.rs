/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! A [`Bus`] that tunnels over a persistent TCP connection to a [`BusServer`](super::server::BusServer).
//!
//! Each [`RemoteBus`] owns one connection. A reader thread demultiplexes incoming frames: `Event` frames go
//! into the local event queue (so `next_event` and `abort` behave exactly as they do in memory), all
//! other frames are responses. Requests are issued one at a time by the owner of the `RemoteBus`, each
//! with a fresh request id, and bounded by the configured request timeout. A response whose id is not
//! that of the request in flight answers a request that already timed out, and is dropped.

use std::{
    collections::BTreeSet,
    net::{Shutdown, SocketAddr, TcpStream},
    sync::{
        mpsc::{self, Receiver, RecvTimeoutError},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use typed_builder::TypedBuilder;

use crate::types::crypto_primitives::VerifyingKey;

use super::{
    frames::Frame,
    queue::EventQueue,
    stream::{read_frame, FrameWriter, StreamReadError},
    AbortHandle, Bus, BusError, BusEvent, BusFactory, Filter,
};

/// Where to find the bus server and how long to wait for it.
#[derive(Clone, Debug, TypedBuilder)]
pub struct RemoteBusConfiguration {
    pub addr: SocketAddr,
    #[builder(default = Duration::from_secs(5))]
    pub connect_timeout: Duration,
    #[builder(default = Duration::from_secs(5))]
    pub request_timeout: Duration,
}

/// Opens one [`RemoteBus`] connection per subscriber.
#[derive(Clone, Debug)]
pub struct RemoteBusFactory {
    config: RemoteBusConfiguration,
}

impl RemoteBusFactory {
    pub fn new(config: RemoteBusConfiguration) -> Self {
        Self { config }
    }
}

impl BusFactory for RemoteBusFactory {
    type Bus = RemoteBus;

    fn open(&self) -> Result<Self::Bus, BusError> {
        RemoteBus::connect(&self.config)
    }
}

pub struct RemoteBus {
    tcp_stream: TcpStream,
    writer: FrameWriter,
    responses: Receiver<Frame>,
    queue: Arc<EventQueue>,
    request_timeout: Duration,
    last_request_id: u64,
    owned: BTreeSet<String>,
    _reader: JoinHandle<()>,
    _writer: JoinHandle<()>,
}

impl RemoteBus {
    pub fn connect(config: &RemoteBusConfiguration) -> Result<RemoteBus, BusError> {
        let tcp_stream = TcpStream::connect_timeout(&config.addr, config.connect_timeout)?;
        tcp_stream.set_nodelay(true)?;

        let (writer, writer_thread) = FrameWriter::spawn(&tcp_stream)?;
        let queue = EventQueue::new();
        let (to_owner, responses) = mpsc::channel();
        let reader = Self::reader(tcp_stream.try_clone()?, queue.clone(), to_owner);

        log::debug!("connected remote bus to {}", config.addr);

        Ok(RemoteBus {
            tcp_stream,
            writer,
            responses,
            queue,
            request_timeout: config.request_timeout,
            last_request_id: 0,
            owned: BTreeSet::new(),
            _reader: reader,
            _writer: writer_thread,
        })
    }

    // Continuously reads frames from tcp_stream. Events go to the queue, everything else to the owner.
    // When the connection ends the queue is closed, so blocked waiters see `Disconnected`.
    fn reader(
        mut tcp_stream: TcpStream,
        queue: Arc<EventQueue>,
        to_owner: mpsc::Sender<Frame>,
    ) -> JoinHandle<()> {
        thread::spawn(move || {
            loop {
                match read_frame(&mut tcp_stream) {
                    Ok(Frame::Event { thread_id, payload }) => {
                        queue.push(BusEvent { thread_id, payload })
                    }
                    Ok(frame) => {
                        if to_owner.send(frame).is_err() {
                            break;
                        }
                    }
                    Err(StreamReadError::Closed) => break,
                    Err(err) => {
                        log::debug!("remote bus reader stopped: {err:?}");
                        break;
                    }
                }
            }
            queue.close();
        })
    }

    /// Send the request built by `request` with a fresh request id, and wait for its response.
    fn request(&mut self, request: impl FnOnce(u64) -> Frame) -> Result<Frame, BusError> {
        self.last_request_id += 1;
        let request_id = self.last_request_id;
        self.writer
            .write(request(request_id))
            .map_err(|_| BusError::Disconnected)?;

        let deadline = Instant::now() + self.request_timeout;
        loop {
            let timeout = deadline.saturating_duration_since(Instant::now());
            match self.responses.recv_timeout(timeout) {
                Ok(frame) if frame.request_id() != Some(request_id) => {
                    log::debug!(
                        "remote bus dropping {} for stale request {:?}",
                        frame.name(),
                        frame.request_id()
                    );
                }
                Ok(Frame::ProblemReport {
                    problem_code,
                    explain,
                    ..
                }) => {
                    return Err(BusError::Rpc {
                        problem_code,
                        explain,
                    })
                }
                Ok(frame) => return Ok(frame),
                Err(RecvTimeoutError::Timeout) => return Err(BusError::Timeout),
                Err(RecvTimeoutError::Disconnected) => return Err(BusError::Disconnected),
            }
        }
    }
}

impl Bus for RemoteBus {
    fn subscribe(&mut self, thread_id: &str) -> Result<bool, BusError> {
        match self.request(|request_id| Frame::SubscribeRequest {
            request_id,
            thread_ids: vec![thread_id.to_string()],
        })? {
            Frame::BindResponse { .. } => {
                self.owned.insert(thread_id.to_string());
                Ok(true)
            }
            other => Err(BusError::UnexpectedFrame(other.name().to_string())),
        }
    }

    fn subscribe_by_filter(&mut self, filter: &Filter) -> Result<(bool, Vec<String>), BusError> {
        match self.request(|request_id| Frame::SubscribeByFilterRequest {
            request_id,
            sender_keys: key_bytes(&filter.sender_keys),
            recipient_keys: key_bytes(&filter.recipient_keys),
            protocols: filter.protocols.clone(),
        })? {
            Frame::BindResponse { binding_ids, .. } => {
                self.owned.extend(binding_ids.iter().cloned());
                Ok((!binding_ids.is_empty(), binding_ids))
            }
            other => Err(BusError::UnexpectedFrame(other.name().to_string())),
        }
    }

    fn unsubscribe(&mut self, thread_id: &str) -> Result<(), BusError> {
        self.unsubscribe_many(&[thread_id.to_string()])
    }

    fn unsubscribe_many(&mut self, thread_ids: &[String]) -> Result<(), BusError> {
        let owned: Vec<String> = thread_ids
            .iter()
            .filter(|thread_id| self.owned.remove(*thread_id))
            .cloned()
            .collect();
        if owned.is_empty() {
            return Ok(());
        }
        self.queue
            .discard(|event| owned.iter().any(|thread_id| *thread_id == event.thread_id));
        self.writer
            .write(Frame::UnsubscribeRequest { thread_ids: owned })
            .map_err(|_| BusError::Disconnected)
    }

    fn publish(&mut self, thread_id: &str, payload: Vec<u8>) -> Result<usize, BusError> {
        match self.request(|request_id| Frame::PublishRequest {
            request_id,
            thread_id: thread_id.to_string(),
            payload,
        })? {
            Frame::PublishResponse { recipients, .. } => Ok(recipients as usize),
            other => Err(BusError::UnexpectedFrame(other.name().to_string())),
        }
    }

    fn next_event(&mut self, timeout: Option<Duration>) -> Result<BusEvent, BusError> {
        self.queue.pop(timeout)
    }

    fn abort_handle(&self) -> AbortHandle {
        AbortHandle::new(self.queue.clone())
    }
}

impl Drop for RemoteBus {
    fn drop(&mut self) {
        // Ends the reader thread; the server releases this connection's subscriptions when it sees EOF.
        let _ = self.tcp_stream.shutdown(Shutdown::Both);
    }
}

fn key_bytes(keys: &[VerifyingKey]) -> Vec<[u8; 32]> {
    keys.iter().map(VerifyingKey::to_bytes).collect()
}
