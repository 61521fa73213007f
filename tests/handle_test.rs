// Copyright 2020 Joyent, Inc.

mod common;

use std::thread;
use std::time::Duration;

use slog::{o, Logger};

use rack::error::Error;
use rack::handle::{ConnectionHandle, HandleState};
use rack::io_context::IoContext;
use rack::oid_map::{OidMapBuilder, TypeSize};

use common::{DummyConnection, DummyServer};

fn quiet_log() -> Logger {
    Logger::root(slog::Discard, o!())
}

fn establish(server: &DummyServer) -> ConnectionHandle<DummyConnection> {
    ConnectionHandle::establish(
        server.connection(),
        IoContext::new("handle-test"),
        OidMapBuilder::new(),
        Duration::from_millis(100),
        &quiet_log(),
    )
    .unwrap()
}

#[test]
fn new_handle_is_good() {
    let server = DummyServer::new();
    let handle = establish(&server);

    assert!(handle.connection_good());
    assert!(!handle.connection_bad());
    assert_eq!(handle.state(), HandleState::Good);
    assert!(handle.get_error_context().is_empty());
    assert!(handle.get_socket().is_ok());
    assert_eq!(handle.get_io_context().unwrap().name(), "handle-test");
    assert!(handle.get_timer().unwrap().deadline().is_none());
    assert_eq!(server.connects(), 1);
}

#[test]
fn establish_fails_when_server_refuses() {
    let server = DummyServer::new();
    server.set_fail_connect(true);

    let result = ConnectionHandle::establish(
        server.connection(),
        IoContext::new("handle-test"),
        OidMapBuilder::new(),
        Duration::from_millis(100),
        &quiet_log(),
    );
    match result {
        Err(Error::ConnectFailure(_)) => (),
        Err(e) => panic!("expected ConnectFailure, got {:?}", e),
        Ok(_) => panic!("handle established against a refusing server"),
    }
}

#[test]
fn establish_closes_connection_on_unresolved_type() {
    let server = DummyServer::new();
    let mut oid_map = OidMapBuilder::new();
    oid_map.register_type("ltree", TypeSize::Dynamic);

    let result = ConnectionHandle::establish(
        server.connection(),
        IoContext::new("handle-test"),
        oid_map,
        Duration::from_millis(100),
        &quiet_log(),
    );
    assert!(result.is_err());
    assert_eq!(server.connects(), 1);
    assert_eq!(server.closes(), 1);
}

#[test]
fn execute_records_driver_errors() {
    let server = DummyServer::new();
    let mut handle = establish(&server);

    let value = handle.execute(|_conn| Ok(7)).unwrap();
    assert_eq!(value, 7);

    // A failed query leaves an intact connection usable
    let result: Result<(), Error> =
        handle.execute(|conn| Err(conn.fail("syntax error")));
    match result {
        Err(Error::Driver(msg)) => assert_eq!(msg, "syntax error"),
        other => panic!("expected Driver error, got {:?}", other),
    }
    assert!(handle.connection_good());
    assert_eq!(handle.error_message(), "driver error: syntax error");
    assert_eq!(handle.get_error_context().code(), 11);

    // A failure that broke the connection marks the handle bad
    let result: Result<(), Error> = handle.execute(|conn| {
        conn.set_broken(true);
        Err(conn.fail("connection reset by peer"))
    });
    assert!(result.is_err());
    assert_eq!(handle.state(), HandleState::Bad);
    assert!(handle.connection_bad());

    match handle.execute(|_conn| Ok(())) {
        Err(Error::ConnectionBad(_)) => (),
        other => panic!("expected ConnectionBad, got {:?}", other),
    }
}

#[test]
fn expired_timer_marks_handle_bad() {
    let server = DummyServer::new();
    let mut handle = establish(&server);

    handle
        .get_timer_mut()
        .unwrap()
        .expires_after(Duration::from_millis(10));
    thread::sleep(Duration::from_millis(20));

    match handle.execute(|_conn| Ok(())) {
        Err(Error::Timeout) => (),
        other => panic!("expected Timeout, got {:?}", other),
    }
    assert!(handle.connection_bad());
    assert_eq!(handle.get_error_context().code(), Error::Timeout.code());
}

#[test]
fn slow_operation_times_out() {
    let server = DummyServer::new();
    let mut handle = establish(&server);

    handle
        .get_timer_mut()
        .unwrap()
        .expires_after(Duration::from_millis(20));

    let result = handle.execute(|_conn| {
        thread::sleep(Duration::from_millis(50));
        Ok(())
    });
    match result {
        Err(Error::Timeout) => (),
        other => panic!("expected Timeout, got {:?}", other),
    }
    assert_eq!(handle.state(), HandleState::Bad);
}

#[test]
fn reconnect_restores_bad_handle() {
    let server = DummyServer::new();
    let mut handle = establish(&server);

    handle
        .get_timer_mut()
        .unwrap()
        .expires_after(Duration::from_secs(60));
    handle.mark_bad("server closed the connection unexpectedly");
    assert!(handle.connection_bad());
    assert_eq!(
        handle.error_message(),
        "server closed the connection unexpectedly"
    );

    handle.reconnect().unwrap();
    assert!(handle.connection_good());
    assert!(handle.get_error_context().is_empty());
    assert!(handle.get_timer().unwrap().deadline().is_none());
    assert_eq!(server.connects(), 2);
}

#[test]
fn failed_reconnect_leaves_handle_bad() {
    let server = DummyServer::new();
    let mut handle = establish(&server);

    server.set_fail_connect(true);
    match handle.reconnect() {
        Err(Error::ConnectFailure(_)) => (),
        other => panic!("expected ConnectFailure, got {:?}", other),
    }
    assert!(handle.connection_bad());
    assert_eq!(handle.get_error_context().code(), 10);
}

#[test]
fn close_connection_releases_handle() {
    let server = DummyServer::new();
    let mut handle = establish(&server);

    handle.close_connection().unwrap();
    assert!(handle.connection_bad());
    assert_eq!(server.closes(), 1);

    assert!(matches!(handle.get_native_handle(), Err(Error::HandleReleased)));
    assert!(matches!(handle.get_socket(), Err(Error::HandleReleased)));
    assert!(matches!(handle.get_io_context(), Err(Error::HandleReleased)));
    assert!(matches!(handle.get_oid_map(), Err(Error::HandleReleased)));
    assert!(matches!(
        handle.execute(|_conn| Ok(())),
        Err(Error::HandleReleased)
    ));
    assert!(matches!(handle.close_connection(), Err(Error::HandleReleased)));
}

#[test]
fn validate_probes_connection() {
    let server = DummyServer::new();
    let mut handle = establish(&server);
    assert!(handle.validate());

    server.break_connection(0);
    assert!(!handle.validate());
    assert_eq!(handle.state(), HandleState::Bad);
    assert_eq!(handle.error_message(), "connection failed validation");
}

#[test]
fn rebind_returns_previous_context() {
    let server = DummyServer::new();
    let mut handle = establish(&server);
    let original = handle.get_io_context().unwrap().clone();
    let other_context = IoContext::new("other");

    let previous = handle.rebind_io_context(other_context.clone());
    assert!(previous.same_context(&original));
    assert!(handle.get_io_context().unwrap().same_context(&other_context));
}

#[test]
fn into_native_gives_up_connection() {
    let server = DummyServer::new();
    let handle = establish(&server);

    let native = handle.into_native().unwrap();
    assert!(!rack::connection::Connection::has_broken(&native));
    assert_eq!(server.closes(), 0);
}

#[test]
fn dropping_handle_closes_connection() {
    let server = DummyServer::new();
    let handle = establish(&server);
    drop(handle);
    assert_eq!(server.closes(), 1);

    // An already released handle is not closed twice
    let mut handle = establish(&server);
    handle.close_connection().unwrap();
    drop(handle);
    assert_eq!(server.closes(), 2);
}
