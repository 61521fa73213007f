// Copyright 2020 Joyent, Inc.

//! A [`Connection`](../rack/connection/trait.Connection.html) backed by a
//! plain `TcpStream`. It speaks no database protocol and is useful for
//! exercising a connection pool against any listening TCP service.

use std::io::{Error as IOError, ErrorKind};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::Duration;

use rack::connection::Connection;
use rack::connection_info::ConnectionInfo;

// Per-address limit for a single connect attempt
const CONNECT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug)]
pub struct TcpStreamConnection {
    stream: Option<TcpStream>,
    host: String,
    port: u16,
    // Latched by `is_valid`; cleared by a successful connect
    broken: bool,
}

impl TcpStreamConnection {
    /// A not yet connected stream to the host and port of `info`.
    pub fn new(info: &ConnectionInfo) -> Self {
        TcpStreamConnection {
            stream: None,
            host: info.host.clone(),
            port: info.port,
            broken: false,
        }
    }

    pub fn stream(&self) -> Option<&TcpStream> {
        self.stream.as_ref()
    }

    pub fn stream_mut(&mut self) -> Option<&mut TcpStream> {
        self.stream.as_mut()
    }
}

impl Connection for TcpStreamConnection {
    type Error = IOError;
    type Socket = TcpStream;

    fn connect(&mut self) -> Result<(), Self::Error> {
        let mut last_err = None;
        for addr in (self.host.as_str(), self.port).to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, CONNECT_ATTEMPT_TIMEOUT) {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    self.stream = Some(stream);
                    self.broken = false;
                    return Ok(());
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            IOError::new(ErrorKind::NotFound, "no addresses resolved")
        }))
    }

    fn close(&mut self) -> Result<(), Self::Error> {
        if let Some(stream) = self.stream.take() {
            match stream.shutdown(Shutdown::Both) {
                Err(ref e) if e.kind() == ErrorKind::NotConnected => (),
                other => other?,
            }
        }
        Ok(())
    }

    // A pending socket error or an orderly shutdown by the peer latches the
    // connection as broken.
    fn is_valid(&mut self) -> bool {
        let stream = match &self.stream {
            Some(stream) => stream,
            None => return false,
        };
        let healthy = match stream.take_error() {
            Ok(None) => peer_open(stream),
            _ => false,
        };
        if !healthy {
            self.broken = true;
        }
        healthy
    }

    fn has_broken(&self) -> bool {
        self.broken || self.stream.is_none()
    }

    fn socket(&self) -> Option<&TcpStream> {
        self.stream.as_ref()
    }
}

// Peek without blocking. Zero bytes means the peer closed its side.
fn peer_open(stream: &TcpStream) -> bool {
    if stream.set_nonblocking(true).is_err() {
        return false;
    }
    let mut buf = [0u8; 1];
    let open = match stream.peek(&mut buf) {
        Ok(0) => false,
        Ok(_) => true,
        Err(ref e) => e.kind() == ErrorKind::WouldBlock,
    };
    stream.set_nonblocking(false).is_ok() && open
}
