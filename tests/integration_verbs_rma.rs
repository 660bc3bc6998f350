//! One-sided operations: remote-handle lookup, write and read paths,
//! completion messages, and registration lifetime rules.

use std::sync::Arc;
use unifabric::fabric::loopback::LoopbackFabric;
use unifabric::{
    ConnAttribute, Connection, DeviceSpec, Endpoint, Event, EventKind, Flags, Library, Status,
    Transport, VerbsTransport,
};

fn verbs_library() -> Library {
    Library::init_with_transports(
        &[DeviceSpec::new("ib0", "verbs")],
        vec![Arc::new(VerbsTransport::with_fabric(LoopbackFabric::new())) as Arc<dyn Transport>],
    )
    .expect("library init")
}

fn await_event(target: &Endpoint, other: Option<&Endpoint>) -> Event {
    for _ in 0..100_000 {
        match target.get_event() {
            Ok(event) => return event,
            Err(Status::Again) => {}
            Err(status) => panic!("get_event failed: {}", status),
        }
        if let Some(other) = other {
            match other.get_event() {
                Ok(event) => {
                    panic!("unexpected {} event on {}", event.kind().name(), other.name())
                }
                Err(_) => {}
            }
        }
    }
    panic!("timed out waiting for an event on {}", target.name());
}

fn establish(server: &Endpoint, client: &Endpoint) -> (Connection, Connection) {
    client
        .connect(server.name(), b"", ConnAttribute::ReliableOrdered, 0, None)
        .expect("connect");
    let request = await_event(server, Some(client));
    let server_conn = server.accept(&request).expect("accept");
    server.return_event(request).unwrap();
    let accepted = await_event(client, Some(server));
    let client_conn = accepted.connection().unwrap();
    client.return_event(accepted).unwrap();
    (server_conn, client_conn)
}

/// Scenario: B registers a page, A writes 4096 bytes through the
/// remote-handle exchange, and A's application sees a successful Send
/// event. The first operation on an uncached handle must wait for the
/// peer's reply, which proves the request/reply path runs.
#[test]
fn rma_write_with_remote_lookup() {
    let library = verbs_library();
    let server = library.create_endpoint(None).unwrap();
    let client = library.create_endpoint(None).unwrap();
    let (_server_conn, client_conn) = establish(&server, &client);

    let mut target = vec![0u8; 4096];
    let server_handle = unsafe { server.rma_register(target.as_mut_ptr(), 4096) }.unwrap();

    let mut source = vec![0u8; 4096];
    for (index, byte) in source.iter_mut().enumerate() {
        *byte = (index % 251) as u8;
    }
    let client_handle = unsafe { client.rma_register(source.as_mut_ptr(), 4096) }.unwrap();

    client_conn
        .rma(None, client_handle, 0, server_handle, 0, 4096, 0xC0FFEE, Flags::WRITE)
        .expect("rma write");

    // The handle is not cached yet: without the peer answering the
    // remote-handle request, nothing completes.
    for _ in 0..50 {
        assert!(matches!(client.get_event(), Err(Status::Again)));
    }
    assert!(target.iter().all(|&b| b == 0));

    // One server tick answers the lookup; the deferred write then runs.
    let done = await_event(&client, Some(&server));
    assert!(matches!(done.kind(), EventKind::Send { .. }));
    assert_eq!(done.context(), Some(0xC0FFEE));
    assert_eq!(done.status(), Status::Success);
    client.return_event(done).unwrap();
    assert_eq!(target, source);

    // The cache is warm now: a second write completes without the server
    // taking any ticks at all.
    source[0] = 0xEE;
    client_conn
        .rma(None, client_handle, 0, server_handle, 0, 4096, 2, Flags::WRITE)
        .expect("second rma write");
    let done = await_event(&client, None);
    assert_eq!(done.status(), Status::Success);
    client.return_event(done).unwrap();
    assert_eq!(target[0], 0xEE);
}

#[test]
fn rma_read_pulls_remote_bytes() {
    let library = verbs_library();
    let server = library.create_endpoint(None).unwrap();
    let client = library.create_endpoint(None).unwrap();
    let (_server_conn, client_conn) = establish(&server, &client);

    let mut remote = b"remote page contents".to_vec();
    remote.resize(256, 0x5A);
    let server_handle = unsafe { server.rma_register(remote.as_mut_ptr(), 256) }.unwrap();

    let mut local = vec![0u8; 256];
    let client_handle = unsafe { client.rma_register(local.as_mut_ptr(), 256) }.unwrap();

    client_conn
        .rma(None, client_handle, 0, server_handle, 0, 256, 1, Flags::empty())
        .expect("rma read");
    let done = await_event(&client, Some(&server));
    assert_eq!(done.status(), Status::Success);
    client.return_event(done).unwrap();
    assert_eq!(local, remote);
}

/// An RMA with a completion message notifies the peer through an ordinary
/// Recv event once the transfer lands.
#[test]
fn rma_completion_message_reaches_the_peer() {
    let library = verbs_library();
    let server = library.create_endpoint(None).unwrap();
    let client = library.create_endpoint(None).unwrap();
    let (_server_conn, client_conn) = establish(&server, &client);

    let mut target = vec![0u8; 128];
    let server_handle = unsafe { server.rma_register(target.as_mut_ptr(), 128) }.unwrap();
    let mut source = vec![7u8; 128];
    let client_handle = unsafe { client.rma_register(source.as_mut_ptr(), 128) }.unwrap();

    client_conn
        .rma(
            Some(b"page is up"),
            client_handle,
            0,
            server_handle,
            0,
            128,
            11,
            Flags::WRITE,
        )
        .expect("rma with message");

    let done = await_event(&client, Some(&server));
    assert_eq!(done.status(), Status::Success);
    client.return_event(done).unwrap();

    let notice = await_event(&server, Some(&client));
    assert!(matches!(notice.kind(), EventKind::Recv { .. }));
    assert_eq!(notice.data(), b"page is up");
    server.return_event(notice).unwrap();
    assert_eq!(target, source);
}

/// Blocking RMA drains inline like a blocking send.
#[test]
fn blocking_rma_completes_synchronously() {
    let library = verbs_library();
    let server = library.create_endpoint(None).unwrap();
    let client = library.create_endpoint(None).unwrap();
    let (_server_conn, client_conn) = establish(&server, &client);

    let mut target = vec![0u8; 64];
    let server_handle = unsafe { server.rma_register(target.as_mut_ptr(), 64) }.unwrap();
    let mut source = vec![3u8; 64];
    let client_handle = unsafe { client.rma_register(source.as_mut_ptr(), 64) }.unwrap();

    // Warm the cache first so the blocking drain needs no server ticks.
    client_conn
        .rma(None, client_handle, 0, server_handle, 0, 64, 0, Flags::WRITE)
        .unwrap();
    let warm = await_event(&client, Some(&server));
    client.return_event(warm).unwrap();

    source.fill(9);
    client_conn
        .rma(None, client_handle, 0, server_handle, 0, 64, 1, Flags::WRITE | Flags::BLOCKING)
        .expect("blocking rma");
    assert_eq!(target, source);
    assert!(matches!(client.get_event(), Err(Status::Again)));
}

/// Deregistration honors in-flight references and invalidates handles.
#[test]
fn deregister_rules() {
    let library = verbs_library();
    let server = library.create_endpoint(None).unwrap();
    let client = library.create_endpoint(None).unwrap();
    let (_server_conn, client_conn) = establish(&server, &client);

    let mut local = vec![0u8; 64];
    let local_handle = unsafe { client.rma_register(local.as_mut_ptr(), 64) }.unwrap();

    // Unknown remote handle: the operation is parked against the lookup,
    // which keeps the local region busy.
    client_conn
        .rma(None, local_handle, 0, 0xDEAD, 0, 64, 0, Flags::WRITE)
        .expect("rma parks on the lookup");
    assert_eq!(client.rma_deregister(local_handle).unwrap_err(), Status::InvalidArgument);

    // The peer answers with a null key and the operation fails remotely,
    // releasing the region.
    let failed = await_event(&client, Some(&server));
    assert!(matches!(failed.kind(), EventKind::Send { .. }));
    assert_eq!(failed.status(), Status::RemoteError);
    client.return_event(failed).unwrap();

    client.rma_deregister(local_handle).expect("deregister after completion");
    assert_eq!(client.rma_deregister(local_handle).unwrap_err(), Status::InvalidArgument);

    // Operations on dead handles fail synchronously.
    assert_eq!(
        client_conn.rma(None, local_handle, 0, 1, 0, 64, 0, Flags::WRITE).unwrap_err(),
        Status::InvalidArgument
    );

    // Bounds are checked against the registration.
    let mut other = vec![0u8; 32];
    let other_handle = unsafe { client.rma_register(other.as_mut_ptr(), 32) }.unwrap();
    assert_eq!(
        client_conn.rma(None, other_handle, 16, 1, 0, 32, 0, Flags::WRITE).unwrap_err(),
        Status::InvalidArgument
    );
}
