//! Loopback round trip over the fabric-backed transport: two endpoints on
//! one device, reliable-ordered connection, short messages both ways.

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

/// Wait for an event on `target`, ticking `other` so the handshake can
/// make progress on both sides. `other` must have no pending events.
fn await_event(target: &Endpoint, other: &Endpoint) -> Event {
    for _ in 0..100_000 {
        match target.get_event() {
            Ok(event) => return event,
            Err(Status::Again) => {}
            Err(status) => panic!("get_event failed: {}", status),
        }
        match other.get_event() {
            Ok(event) => panic!("unexpected {} event on {}", event.kind().name(), other.name()),
            Err(Status::Again) => {}
            Err(status) => panic!("get_event failed: {}", status),
        }
    }
    panic!("timed out waiting for an event on {}", target.name());
}

/// Wait for an event on `target` alone.
fn await_local_event(target: &Endpoint) -> Event {
    for _ in 0..100_000 {
        match target.get_event() {
            Ok(event) => return event,
            Err(Status::Again) => {}
            Err(status) => panic!("get_event failed: {}", status),
        }
    }
    panic!("timed out waiting for an event on {}", target.name());
}

/// Run the four-way handshake and return both connection handles.
fn establish(
    server: &Endpoint,
    client: &Endpoint,
    payload: &[u8],
    context: u64,
) -> (Connection, Connection) {
    client
        .connect(server.name(), payload, ConnAttribute::ReliableOrdered, context, None)
        .expect("connect");

    let request = await_event(server, client);
    assert!(matches!(request.kind(), EventKind::ConnectRequest { .. }));
    assert_eq!(request.data(), payload);
    assert_eq!(request.request_attribute(), Some(ConnAttribute::ReliableOrdered));
    let server_conn = server.accept(&request).expect("accept");
    server.return_event(request).expect("return request");

    let accepted = await_event(client, server);
    assert!(matches!(accepted.kind(), EventKind::ConnectAccepted { .. }));
    assert_eq!(accepted.context(), Some(context));
    let client_conn = accepted.connection().expect("accepted carries the connection");
    client.return_event(accepted).expect("return accepted");

    (server_conn, client_conn)
}

#[test]
fn loopback_send_hello() {
    let library = verbs_library();
    let server = library.create_endpoint(None).unwrap();
    let client = library.create_endpoint(None).unwrap();

    let (_server_conn, client_conn) = establish(&server, &client, b"", 7);

    client_conn.send(b"hello", 0xAA, Flags::empty()).expect("send");

    // The peer observes the five payload bytes.
    let recv = await_local_event(&server);
    assert!(matches!(recv.kind(), EventKind::Recv { .. }));
    assert_eq!(recv.data(), b"hello");
    assert!(recv.connection().is_some());
    server.return_event(recv).expect("return recv");

    // The issuer observes its completion with its context.
    let sent = await_local_event(&client);
    assert!(matches!(sent.kind(), EventKind::Send { .. }));
    assert_eq!(sent.context(), Some(0xAA));
    assert_eq!(sent.status(), Status::Success);
    client.return_event(sent).expect("return send");
}

#[test]
fn reliable_ordered_sends_complete_in_submission_order() {
    let library = verbs_library();
    let server = library.create_endpoint(None).unwrap();
    let client = library.create_endpoint(None).unwrap();
    let (_server_conn, client_conn) = establish(&server, &client, b"", 1);

    for context in 0u64..10 {
        let payload = vec![context as u8; 4 + context as usize];
        client_conn.send(&payload, context, Flags::empty()).expect("send");
    }

    // Completions surface in submission order on the issuer...
    for context in 0u64..10 {
        let sent = await_local_event(&client);
        assert!(matches!(sent.kind(), EventKind::Send { .. }));
        assert_eq!(sent.context(), Some(context));
        client.return_event(sent).unwrap();
    }
    // ...and arrivals in the same order on the peer.
    for context in 0u64..10 {
        let recv = await_local_event(&server);
        assert_eq!(recv.data(), vec![context as u8; 4 + context as usize]);
        server.return_event(recv).unwrap();
    }
}

#[test]
fn gathered_segments_arrive_contiguous() {
    let library = verbs_library();
    let server = library.create_endpoint(None).unwrap();
    let client = library.create_endpoint(None).unwrap();
    let (_server_conn, client_conn) = establish(&server, &client, b"", 1);

    client_conn.sendv(&[b"head|", b"body|", b"tail"], 5, Flags::empty()).expect("sendv");
    let recv = await_local_event(&server);
    assert_eq!(recv.data(), b"head|body|tail");
    server.return_event(recv).unwrap();
}

#[test]
fn blocking_send_drains_its_own_completion() {
    let library = verbs_library();
    let server = library.create_endpoint(None).unwrap();
    let client = library.create_endpoint(None).unwrap();
    let (_server_conn, client_conn) = establish(&server, &client, b"", 1);

    client_conn.send(b"inline", 0x77, Flags::BLOCKING).expect("blocking send");

    // The completion was consumed inline; only the peer-side Recv remains.
    assert!(matches!(client.get_event(), Err(Status::Again)));
    let recv = await_local_event(&server);
    assert_eq!(recv.data(), b"inline");
    server.return_event(recv).unwrap();
}

#[test]
fn armed_os_handle_fires_on_event_delivery() {
    let library = verbs_library();
    let server = library.create_endpoint(None).unwrap();
    let client = library.create_endpoint(None).unwrap();
    let (_server_conn, client_conn) = establish(&server, &client, b"", 1);

    let fd = match client.os_handle() {
        Some(fd) => fd,
        None => return, // eventfd unavailable on this platform
    };
    client.arm_os_handle().expect("arm");

    client_conn.send(b"ping", 1, Flags::empty()).expect("send");
    let sent = await_local_event(&client);
    client.return_event(sent).unwrap();

    // Delivering the event signaled the armed handle exactly once.
    let mut value = [0u8; 8];
    let read = unsafe { libc::read(fd, value.as_mut_ptr() as *mut libc::c_void, 8) };
    assert_eq!(read, 8);
    let read = unsafe { libc::read(fd, value.as_mut_ptr() as *mut libc::c_void, 8) };
    assert!(read < 0, "one-shot wakeup fired twice");
}

#[test]
fn oversized_sends_fail_synchronously() {
    let library = verbs_library();
    let server = library.create_endpoint(None).unwrap();
    let client = library.create_endpoint(None).unwrap();
    let (_server_conn, client_conn) = establish(&server, &client, b"", 1);

    let too_big = vec![0u8; client_conn.max_send_size() as usize + 1];
    assert_eq!(
        client_conn.send(&too_big, 0, Flags::empty()).unwrap_err(),
        Status::MessageTooLarge
    );
}
