use commio::utils::Timer;
use commio::{
    Comm, CommBuf, CommConfig, CommError, CommHeader, DispatchHandlerRef, Event,
    SharedHandlerFactory,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;

//====================================================================================
//            helpers
//====================================================================================

/// Dispatch handler that records every event for later inspection.
#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<Event>>,
}

impl Recorder {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
    fn handler(self: &Arc<Self>) -> DispatchHandlerRef {
        let me = Arc::clone(self);
        Arc::new(move |ev: Event| me.events.lock().unwrap().push(ev))
    }
    fn count<F: Fn(&Event) -> bool>(&self, pred: F) -> usize {
        self.events.lock().unwrap().iter().filter(|e| pred(e)).count()
    }
    /// Poll until `pred` matches at least one recorded event or the deadline hits.
    fn wait_for<F: Fn(&Event) -> bool>(&self, millis: u64, pred: F) -> bool {
        let timer = Timer::new_millis(millis);
        while !timer.expired() {
            if self.count(&pred) > 0 {
                return true;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        false
    }
}

fn small_comm() -> Comm {
    Comm::with_config(CommConfig {
        reactor_count: 2,
        ..Default::default()
    })
    .unwrap()
}

fn is_established(ev: &Event) -> bool {
    matches!(ev, Event::Established { .. })
}
fn is_disconnect(ev: &Event) -> bool {
    matches!(ev, Event::Disconnect { .. })
}

//====================================================================================
//            tests
//====================================================================================

#[test]
pub fn test_connect_and_accept_deliver_established() {
    let comm = small_comm();
    let server = Recorder::new();
    let client = Recorder::new();
    let addr = comm
        .listen_with_handler("127.0.0.1:0".parse().unwrap(), server.handler())
        .unwrap();
    comm.connect(addr, client.handler()).unwrap();
    assert!(client.wait_for(2000, is_established), "client side established");
    assert!(server.wait_for(2000, is_established), "server side established");
}

#[test]
pub fn test_request_response_roundtrip() {
    let comm = Arc::new(small_comm());
    let addr = {
        // Weak, or the handler would keep its own engine alive.
        let weak = Arc::downgrade(&comm);
        // echo server: every request is answered with its own payload reversed.
        let echo: DispatchHandlerRef = Arc::new(move |ev: Event| {
            if let Event::Message {
                addr,
                header,
                payload,
                ..
            } = ev
            {
                let Some(comm) = weak.upgrade() else { return };
                let mut echoed = payload.clone();
                echoed.reverse();
                let buf = CommBuf::response_for(&header, echoed);
                comm.send_response(addr, buf).unwrap();
            }
        });
        comm.listen(
            "127.0.0.1:0".parse().unwrap(),
            Arc::new(SharedHandlerFactory(echo)),
        )
        .unwrap()
    };
    let client = Recorder::new();
    comm.connect(addr, client.handler()).unwrap();
    assert!(client.wait_for(2000, is_established));

    let responses = Recorder::new();
    let buf = CommBuf::new(CommHeader::new_request(42, 7), b"roundtrip".to_vec());
    let id = comm
        .send_request(addr, Duration::from_secs(5), buf, responses.handler())
        .unwrap();
    assert_ne!(id, 0);
    assert!(responses.wait_for(2000, |ev| matches!(ev, Event::Message { .. })));
    let events = responses.events.lock().unwrap();
    match &events[0] {
        Event::Message {
            header, payload, ..
        } => {
            assert_eq!(header.id, id);
            assert_eq!(header.command, 42);
            assert!(!header.is_request());
            assert_eq!(payload, b"pirtdnuor");
        }
        other => panic!("unexpected event: {:?}", other),
    }
}

#[test]
pub fn test_request_timeout_fires_exactly_once() {
    let comm = small_comm();
    // server accepts but never answers.
    let server = Recorder::new();
    let addr = comm
        .listen_with_handler("127.0.0.1:0".parse().unwrap(), server.handler())
        .unwrap();
    let client = Recorder::new();
    comm.connect(addr, client.handler()).unwrap();
    assert!(client.wait_for(2000, is_established));

    let responses = Recorder::new();
    let buf = CommBuf::new(CommHeader::new_request(1, 0), b"no answer".to_vec());
    let id = comm
        .send_request(addr, Duration::from_millis(100), buf, responses.handler())
        .unwrap();
    assert!(responses.wait_for(
        2000,
        |ev| matches!(ev, Event::Error { error: CommError::RequestTimeout { id: t }, .. } if *t == id)
    ));
    // nothing further may arrive for this id.
    std::thread::sleep(Duration::from_millis(300));
    assert_eq!(responses.events.lock().unwrap().len(), 1);
}

#[test]
pub fn test_datagram_delivery() {
    let comm = small_comm();
    let receiver = Recorder::new();
    let recv_addr = comm
        .create_datagram_receive_socket("127.0.0.1:0".parse().unwrap(), receiver.handler())
        .unwrap();
    let sender = Recorder::new();
    let send_addr = comm
        .create_datagram_receive_socket("127.0.0.1:0".parse().unwrap(), sender.handler())
        .unwrap();

    let buf = CommBuf::new(CommHeader::new_request(9, 0), b"ten bytes!".to_vec());
    comm.send_datagram(recv_addr, send_addr, buf).unwrap();
    assert!(receiver.wait_for(2000, |ev| matches!(
        ev,
        Event::Message { payload, .. } if payload == b"ten bytes!"
    )));
    let events = receiver.events.lock().unwrap();
    match &events[0] {
        Event::Message { addr, header, .. } => {
            assert_eq!(*addr, send_addr);
            assert_eq!(header.command, 9);
        }
        other => panic!("unexpected event: {:?}", other),
    }
}

#[test]
pub fn test_second_connect_to_same_address_rejected() {
    let comm = small_comm();
    let server = Recorder::new();
    let addr = comm
        .listen_with_handler("127.0.0.1:0".parse().unwrap(), server.handler())
        .unwrap();
    let client = Recorder::new();
    comm.connect(addr, client.handler()).unwrap();
    match comm.connect(addr, client.handler()) {
        Err(CommError::AlreadyConnected(a)) => assert_eq!(a, addr),
        other => panic!("expected AlreadyConnected, got {:?}", other.err()),
    }
}

#[test]
pub fn test_close_socket_is_quiet_and_cancels_requests() {
    let comm = small_comm();
    let server = Recorder::new();
    let addr = comm
        .listen_with_handler("127.0.0.1:0".parse().unwrap(), server.handler())
        .unwrap();
    let client = Recorder::new();
    comm.connect(addr, client.handler()).unwrap();
    assert!(client.wait_for(2000, is_established));

    let responses = Recorder::new();
    let buf = CommBuf::new(CommHeader::new_request(5, 0), b"pending".to_vec());
    let id = comm
        .send_request(addr, Duration::from_secs(30), buf, responses.handler())
        .unwrap();
    comm.close_socket(addr).unwrap();

    // the pending request is cancelled...
    assert!(responses.wait_for(
        2000,
        |ev| matches!(ev, Event::Error { error: CommError::Cancelled { id: c }, .. } if *c == id)
    ));
    // ...but the application-initiated close produces no terminal event.
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(client.count(is_disconnect), 0);
    // and the address is free for a new connection.
    let timer = Timer::new_millis(2000);
    loop {
        match comm.connect(addr, client.handler()) {
            Ok(()) => break,
            Err(CommError::AlreadyConnected(_)) if !timer.expired() => {
                std::thread::sleep(Duration::from_millis(1));
            }
            Err(err) => panic!("reconnect failed: {}", err),
        }
    }
}

#[test]
pub fn test_failed_connect_delivers_terminal_and_frees_address() {
    let comm = small_comm();
    // bind and immediately release a port, so nothing is listening on it.
    let dead = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };
    let client = Recorder::new();
    match comm.connect(dead, client.handler()) {
        Ok(()) => {}
        // the refusal can also surface from the connect call itself.
        Err(CommError::ConnectError { .. }) => return,
        Err(err) => panic!("connect failed: {}", err),
    }
    assert!(client.wait_for(
        2000,
        |ev| matches!(ev, Event::Disconnect { error: CommError::ConnectError { .. }, .. })
    ));
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(client.count(is_disconnect), 1);
    // the dead handler left the registry; a retry must not see AlreadyConnected.
    let timer = Timer::new_millis(2000);
    loop {
        match comm.connect(dead, client.handler()) {
            Ok(()) | Err(CommError::ConnectError { .. }) => break,
            Err(CommError::AlreadyConnected(_)) if !timer.expired() => {
                std::thread::sleep(Duration::from_millis(1));
            }
            Err(err) => panic!("reconnect failed: {}", err),
        }
    }
}

#[test]
pub fn test_request_to_unreachable_address_gets_timeout_error() {
    let comm = small_comm();
    let dead = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };
    let client = Recorder::new();
    match comm.connect(dead, client.handler()) {
        Ok(()) => {}
        Err(CommError::ConnectError { .. }) => return,
        Err(err) => panic!("connect failed: {}", err),
    }
    let responses = Recorder::new();
    let buf = CommBuf::new(CommHeader::new_request(3, 0), b"void".to_vec());
    let id = match comm.send_request(dead, Duration::from_millis(100), buf, responses.handler()) {
        Ok(id) => id,
        // the connect failure may already have torn the connection down.
        Err(CommError::NotConnected(_)) => return,
        Err(err) => panic!("send_request failed: {}", err),
    };
    // the caller asked for a deadline, so the connect failure surfaces as a
    // timeout error on the response handler, exactly once.
    assert!(responses.wait_for(
        2000,
        |ev| matches!(ev, Event::Error { error: CommError::RequestTimeout { id: t }, .. } if *t == id)
    ));
    std::thread::sleep(Duration::from_millis(300));
    assert_eq!(responses.events.lock().unwrap().len(), 1);
}

#[test]
pub fn test_close_churn_leaves_other_connections_alone() {
    let comm = small_comm();
    let server = Recorder::new();
    let addr = comm
        .listen_with_handler("127.0.0.1:0".parse().unwrap(), server.handler())
        .unwrap();
    let churn_server = Recorder::new();
    let churn_addr = comm
        .listen_with_handler("127.0.0.1:0".parse().unwrap(), churn_server.handler())
        .unwrap();

    let steady = Recorder::new();
    comm.connect(addr, steady.handler()).unwrap();
    assert!(steady.wait_for(2000, is_established));

    // one thread recycles poll tokens through connect/close cycles while the
    // main thread keeps traffic flowing on an unrelated connection; readiness
    // for the closed sockets must never reach the healthy one.
    std::thread::scope(|s| {
        s.spawn(|| {
            for _ in 0..30 {
                let h = Recorder::new();
                let timer = Timer::new_millis(2000);
                loop {
                    match comm.connect(churn_addr, h.handler()) {
                        Ok(()) => break,
                        Err(CommError::AlreadyConnected(_)) if !timer.expired() => {
                            std::thread::sleep(Duration::from_millis(1));
                        }
                        Err(err) => panic!("churn connect failed: {}", err),
                    }
                }
                assert!(h.wait_for(2000, is_established));
                comm.close_socket(churn_addr).unwrap();
            }
        });
        for i in 0..30u32 {
            let buf = CommBuf::new(CommHeader::new_request(i, 0), b"steady".to_vec());
            comm.send_message(addr, buf).unwrap();
        }
    });

    let timer = Timer::new_millis(2000);
    let is_message = |ev: &Event| matches!(ev, Event::Message { .. });
    while server.count(is_message) < 30 && !timer.expired() {
        std::thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(server.count(is_message), 30);
    assert_eq!(steady.count(is_disconnect), 0);
}

#[test]
pub fn test_peer_close_delivers_one_disconnect() {
    let server_comm = small_comm();
    let server = Recorder::new();
    let addr = server_comm
        .listen_with_handler("127.0.0.1:0".parse().unwrap(), server.handler())
        .unwrap();

    let mut client_comm = small_comm();
    let client = Recorder::new();
    client_comm.connect(addr, client.handler()).unwrap();
    assert!(server.wait_for(2000, is_established));

    // whole client engine goes away; server must see exactly one Disconnect.
    client_comm.destroy();
    assert!(server.wait_for(2000, is_disconnect));
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(server.count(is_disconnect), 1);
}

#[test]
pub fn test_close_races_inbound_traffic() {
    let server_comm = Arc::new(small_comm());
    let addr = {
        let weak = Arc::downgrade(&server_comm);
        // on establish, flood the new connection so close on the other side
        // races against in-flight dispatch.
        let flood: DispatchHandlerRef = Arc::new(move |ev: Event| {
            if let Event::Established { addr } = ev {
                let Some(comm) = weak.upgrade() else { return };
                for i in 0..200u32 {
                    let buf = CommBuf::new(CommHeader::new_request(i, 0), vec![0xabu8; 512]);
                    if comm.send_message(addr, buf).is_err() {
                        break;
                    }
                }
            }
        });
        server_comm
            .listen(
                "127.0.0.1:0".parse().unwrap(),
                Arc::new(SharedHandlerFactory(flood)),
            )
            .unwrap()
    };

    let client_comm = small_comm();
    for _ in 0..20 {
        let client = Recorder::new();
        client_comm.connect(addr, client.handler()).unwrap();
        assert!(client.wait_for(2000, is_established));
        // close while messages are still streaming in.
        client_comm.close_socket(addr).unwrap();
        // the quiet close must not produce a terminal event.
        assert_eq!(client.count(is_disconnect), 0);
    }
    client_comm.wait_for_empty();
}

#[test]
pub fn test_timer_dispatch() {
    let comm = small_comm();
    let ticks = Recorder::new();
    comm.set_timer(Duration::from_millis(50), Some(ticks.handler()))
        .unwrap();
    assert!(ticks.wait_for(2000, |ev| matches!(ev, Event::Timer)));
}

#[test]
pub fn test_proxy_translation() {
    let comm = small_comm();
    let server = Recorder::new();
    let addr = comm
        .listen_with_handler("127.0.0.1:0".parse().unwrap(), server.handler())
        .unwrap();
    let client = Recorder::new();
    comm.connect(addr, client.handler()).unwrap();
    assert!(client.wait_for(2000, is_established));

    comm.add_proxy("rangeserver", addr).unwrap();
    assert_eq!(comm.translate_proxy("rangeserver").unwrap(), addr);
    assert!(matches!(
        comm.translate_proxy("nonesuch"),
        Err(CommError::InvalidProxy(_))
    ));
    comm.remove_proxy("rangeserver");
    assert!(comm.translate_proxy("rangeserver").is_err());
}

#[test]
pub fn test_destroy_is_idempotent() {
    let mut comm = small_comm();
    let server = Recorder::new();
    comm.listen_with_handler("127.0.0.1:0".parse().unwrap(), server.handler())
        .unwrap();
    comm.destroy();
    comm.destroy();
    assert!(matches!(
        comm.connect("127.0.0.1:1".parse().unwrap(), server.handler()),
        Err(CommError::Shutdown)
    ));
}
