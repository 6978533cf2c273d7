use eddy::{Channel, EventLoop};

use std::cell::{Cell, RefCell};
use std::io::{Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::rc::Rc;
use std::time::{Duration, Instant};

fn nonblocking_pair() -> (UnixStream, UnixStream) {
    let (a, b) = UnixStream::pair().expect("Failed to create socket pair");
    a.set_nonblocking(true)
        .expect("Failed to set non-blocking mode");
    b.set_nonblocking(true)
        .expect("Failed to set non-blocking mode");
    (a, b)
}

#[test]
fn read_callback_sees_data_and_receive_time() {
    let event_loop = EventLoop::new();
    let handle = event_loop.handle();

    let (reader, mut writer) = nonblocking_pair();
    let reader = Rc::new(reader);

    let started = Instant::now();
    let received = Rc::new(RefCell::new(Vec::new()));

    let channel = Channel::new(&event_loop, reader.as_raw_fd());
    {
        let reader = reader.clone();
        let received = received.clone();
        let h = handle.clone();
        channel.set_read_callback(move |receive_time| {
            assert!(receive_time >= started, "receive time predates the poll");
            let mut buf = [0u8; 64];
            let n = (&*reader).read(&mut buf).expect("Failed to read");
            received.borrow_mut().extend_from_slice(&buf[..n]);
            h.quit();
        });
    }
    channel.enable_reading();

    writer.write_all(b"ready").expect("Failed to write");
    event_loop.run();

    assert_eq!(received.borrow().as_slice(), b"ready");

    channel.disable_all();
    channel.remove();
}

#[test]
fn registry_tracks_registration_and_removal() {
    let event_loop = EventLoop::new();
    let (sock, _other) = nonblocking_pair();

    let channel = Channel::new(&event_loop, sock.as_raw_fd());
    assert!(!event_loop.has_channel(&channel));

    channel.enable_reading();
    assert!(event_loop.has_channel(&channel));

    channel.disable_all();
    assert!(
        event_loop.has_channel(&channel),
        "empty interest keeps the channel known until removal"
    );

    channel.remove();
    assert!(!event_loop.has_channel(&channel));
}

#[test]
fn write_interest_can_be_dropped_from_inside_the_callback() {
    let event_loop = EventLoop::new();
    let handle = event_loop.handle();

    let (sock, _other) = nonblocking_pair();
    let fired = Rc::new(Cell::new(0u32));

    let channel = Channel::new(&event_loop, sock.as_raw_fd());
    {
        let fired = fired.clone();
        let weak = Rc::downgrade(&channel);
        channel.set_write_callback(move || {
            fired.set(fired.get() + 1);
            let channel = weak.upgrade().expect("Channel is alive during dispatch");
            channel.disable_writing();
        });
    }
    channel.enable_writing();

    // A fresh socket is writable at once; leave time for spurious repeats
    // to show up before quitting.
    let h = handle.clone();
    event_loop.run_after(Duration::from_millis(50), move || h.quit());
    event_loop.run();

    assert_eq!(fired.get(), 1, "writability must stop after disable_writing");

    channel.disable_all();
    channel.remove();
}

#[test]
fn tied_channel_goes_silent_once_its_owner_is_dropped() {
    let event_loop = EventLoop::new();
    let handle = event_loop.handle();

    let (reader, mut writer) = nonblocking_pair();
    let fired = Rc::new(Cell::new(false));

    let channel = Channel::new(&event_loop, reader.as_raw_fd());
    {
        let fired = fired.clone();
        channel.set_read_callback(move |_| fired.set(true));
    }

    let owner = std::sync::Arc::new(());
    channel.tie(&owner);
    channel.enable_reading();
    drop(owner);

    writer.write_all(b"x").expect("Failed to write");

    let h = handle.clone();
    event_loop.run_after(Duration::from_millis(30), move || h.quit());
    event_loop.run();

    assert!(!fired.get(), "released owner must suppress every dispatch");

    channel.disable_all();
    channel.remove();
}

#[test]
fn channel_can_remove_itself_from_its_own_read_callback() {
    let event_loop = EventLoop::new();
    let handle = event_loop.handle();

    let (reader, mut writer) = nonblocking_pair();
    let reader = Rc::new(reader);
    let fired = Rc::new(Cell::new(0u32));

    let channel = Channel::new(&event_loop, reader.as_raw_fd());
    {
        let reader = reader.clone();
        let fired = fired.clone();
        let weak = Rc::downgrade(&channel);
        let h = handle.clone();
        channel.set_read_callback(move |_| {
            fired.set(fired.get() + 1);
            let mut buf = [0u8; 8];
            let _ = (&*reader).read(&mut buf);

            let channel = weak.upgrade().expect("Channel is alive during dispatch");
            channel.disable_all();
            channel.remove();
            h.quit();
        });
    }
    channel.enable_reading();

    writer.write_all(b"x").expect("Failed to write");
    event_loop.run();

    assert_eq!(fired.get(), 1);
    assert!(!event_loop.has_channel(&channel));
    // The channel outlived its own removal; dropping it here must not trip
    // the dispatch assertion.
    drop(channel);
}

#[test]
fn listener_channel_accepts_a_connection() {
    use eddy::net::Socket;

    let event_loop = EventLoop::new();
    let handle = event_loop.handle();

    let any: std::net::SocketAddr = "127.0.0.1:0".parse().expect("Failed to parse address");
    let listener = Rc::new(Socket::tcp(&any));
    listener
        .set_reuse_addr(true)
        .expect("Failed to set SO_REUSEADDR");
    listener.bind(&any);
    listener.listen();
    let addr = listener.local_addr().expect("Failed to read bound address");

    let accepted = Rc::new(Cell::new(false));

    let channel = Channel::new(&event_loop, listener.fd());
    {
        let listener = listener.clone();
        let accepted = accepted.clone();
        let h = handle.clone();
        channel.set_read_callback(move |_| {
            let (peer, peer_addr) = listener.accept().expect("Failed to accept");
            assert!(!peer.is_self_connect());
            assert_eq!(
                peer.peer_addr().expect("Failed to read peer address"),
                peer_addr
            );
            accepted.set(true);
            h.quit();
        });
    }
    channel.enable_reading();

    let client = std::thread::spawn(move || {
        std::net::TcpStream::connect(addr).expect("Failed to connect")
    });

    event_loop.run();
    let _client = client.join().expect("Client thread panicked");

    assert!(accepted.get());

    channel.disable_all();
    channel.remove();
}
