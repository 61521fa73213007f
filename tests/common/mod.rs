// Copyright 2020 Joyent, Inc.

#![allow(dead_code)]

use std::io::{Error as IOError, ErrorKind};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use slog::{o, Drain, Logger};

use rack::connection::Connection;
use rack::connection_info::ConnectionInfo;
use rack::oid_map::Oid;

pub fn test_log() -> Logger {
    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    Logger::root(
        Mutex::new(slog_term::FullFormat::new(plain).build()).fuse(),
        o!("build-id" => "0.1.0"),
    )
}

pub fn test_info() -> ConnectionInfo {
    ConnectionInfo::new("127.0.0.1", 55555)
        .user("rack")
        .password("secret")
        .database("test")
}

// Shared state of a pretend database server. Tests use it to make connects
// fail or to break individual connections handed out by a pool.
#[derive(Clone, Debug, Default)]
pub struct DummyServer {
    fail_connect: Arc<AtomicBool>,
    connects: Arc<AtomicUsize>,
    closes: Arc<AtomicUsize>,
    connections: Arc<Mutex<Vec<Arc<AtomicBool>>>>,
    catalog: Arc<Mutex<Vec<(String, Oid)>>>,
}

impl DummyServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_type(self, name: &str, oid: u32) -> Self {
        self.catalog
            .lock()
            .unwrap()
            .push((name.to_string(), Oid::from(oid)));
        self
    }

    pub fn connection(&self) -> DummyConnection {
        let broken = Arc::new(AtomicBool::new(false));
        self.connections.lock().unwrap().push(broken.clone());
        DummyConnection {
            server: self.clone(),
            broken,
            socket: None,
        }
    }

    pub fn creator(&self) -> impl FnMut(&ConnectionInfo) -> DummyConnection {
        let server = self.clone();
        move |_info: &ConnectionInfo| server.connection()
    }

    pub fn set_fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    // Break the nth connection created against this server
    pub fn break_connection(&self, n: usize) {
        self.connections.lock().unwrap()[n].store(true, Ordering::SeqCst);
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub struct DummyConnection {
    server: DummyServer,
    broken: Arc<AtomicBool>,
    socket: Option<usize>,
}

impl DummyConnection {
    pub fn set_broken(&self, broken: bool) {
        self.broken.store(broken, Ordering::SeqCst);
    }

    pub fn fail(&self, reason: &str) -> IOError {
        IOError::new(ErrorKind::Other, reason.to_string())
    }
}

impl Connection for DummyConnection {
    type Error = IOError;
    type Socket = usize;

    fn connect(&mut self) -> Result<(), Self::Error> {
        if self.server.fail_connect.load(Ordering::SeqCst) {
            return Err(IOError::new(
                ErrorKind::ConnectionRefused,
                "connection refused",
            ));
        }
        let n = self.server.connects.fetch_add(1, Ordering::SeqCst);
        self.broken.store(false, Ordering::SeqCst);
        self.socket = Some(n + 3);
        Ok(())
    }

    fn close(&mut self) -> Result<(), Self::Error> {
        if self.socket.take().is_some() {
            self.server.closes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn is_valid(&mut self) -> bool {
        self.socket.is_some() && !self.broken.load(Ordering::SeqCst)
    }

    fn has_broken(&self) -> bool {
        self.broken.load(Ordering::SeqCst)
    }

    fn socket(&self) -> Option<&usize> {
        self.socket.as_ref()
    }

    fn type_catalog(
        &mut self,
        names: &[String],
    ) -> Result<Vec<(String, Oid)>, Self::Error> {
        let catalog = self.server.catalog.lock().unwrap();
        Ok(catalog
            .iter()
            .filter(|(name, _)| names.contains(name))
            .cloned()
            .collect())
    }
}
