/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Framed reads and writes of [`Frame`]s over a `TcpStream`.
//!
//! Writes happen in the background: [`FrameWriter`] hands frames to a writer thread through a channel. If
//! the writer encounters an I/O error it quietly dies, which makes every later
//! [`write`](FrameWriter::write) fail with [`StreamCorruptedError`]. Reads are blocking and done by
//! whichever thread owns the read half.

use std::{
    io::{self, ErrorKind, Read, Write},
    net::TcpStream,
    sync::mpsc,
    thread::{self, JoinHandle},
};

use borsh::{BorshDeserialize, BorshSerialize};

use super::frames::Frame;

/// Frames larger than this are rejected as corrupt.
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

#[derive(Clone)]
pub(crate) struct FrameWriter {
    to_writer: mpsc::Sender<Frame>,
}

#[derive(Debug)]
pub(crate) struct StreamCorruptedError;

#[derive(Debug)]
pub enum StreamReadError {
    Closed,
    Corrupted(String),
    Io(io::Error),
}

impl FrameWriter {
    /// Spawn the writer thread over a clone of `tcp_stream`.
    pub(crate) fn spawn(tcp_stream: &TcpStream) -> io::Result<(FrameWriter, JoinHandle<()>)> {
        let mut tcp_stream = tcp_stream.try_clone()?;
        let (to_writer, from_main) = mpsc::channel::<Frame>();

        let writer = thread::spawn(move || {
            while let Ok(frame) = from_main.recv() {
                if let Err(err) = write_frame(&mut tcp_stream, &frame) {
                    log::debug!("bus stream writer stopped: {err}");
                    // This makes the channel unusable, marking the stream as corrupt.
                    break;
                }
            }
        });

        Ok((FrameWriter { to_writer }, writer))
    }

    pub(crate) fn write(&self, frame: Frame) -> Result<(), StreamCorruptedError> {
        self.to_writer.send(frame).map_err(|_| StreamCorruptedError)
    }
}

pub fn write_frame(tcp_stream: &mut TcpStream, frame: &Frame) -> io::Result<()> {
    let bytes = frame.try_to_vec()?;
    let len = u32::try_from(bytes.len())
        .map_err(|_| io::Error::new(ErrorKind::InvalidInput, "frame too large"))?;
    tcp_stream.write_all(&len.to_le_bytes())?;
    tcp_stream.write_all(&bytes)?;
    tcp_stream.flush()
}

pub fn read_frame(tcp_stream: &mut TcpStream) -> Result<Frame, StreamReadError> {
    let mut len_buf = [0u8; 4];
    tcp_stream.read_exact(&mut len_buf).map_err(|err| match err.kind() {
        ErrorKind::UnexpectedEof | ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted => {
            StreamReadError::Closed
        }
        _ => StreamReadError::Io(err),
    })?;

    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(StreamReadError::Corrupted(format!(
            "frame of {len} bytes exceeds the limit"
        )));
    }

    let mut body = vec![0u8; len];
    tcp_stream
        .read_exact(&mut body)
        .map_err(StreamReadError::Io)?;
    Frame::try_from_slice(&body).map_err(|err| StreamReadError::Corrupted(err.to_string()))
}
