/// Request/response exchange over a real control channel
use lxce::action::{ActionList, OutstandingRequest};
use lxce::capp::AppState;
use lxce::cspace::SpaceServer;
use lxce::ipc::ControlChannel;
use lxce::protocol::{Reply, Request, Response, SeqAllocator, SEQNO_WRAP};
use std::thread;
use std::time::Duration;

/// Runs a space server on the child end until `count` datagrams were handled
///
/// The channel is handed back so the peer does not see it closed early.
fn serve_n(
    channel: ControlChannel,
    count: usize,
) -> thread::JoinHandle<(SpaceServer, ControlChannel)> {
    thread::spawn(move || {
        let mut server = SpaceServer::new("s1");
        let mut buffer = vec![0u8; 1024];
        for _ in 0..count {
            let len = match channel.recv(&mut buffer).unwrap() {
                Some(len) => len,
                None => continue,
            };
            let raw = String::from_utf8_lossy(&buffer[..len]).into_owned();
            if let Some(response) = server.handle_packet(&raw) {
                channel.send(response.encode().as_bytes()).unwrap();
            }
        }
        (server, channel)
    })
}

#[test]
fn test_create_over_channel() {
    let (parent, child) = ControlChannel::pair().unwrap();
    let server = serve_n(child, 1);

    parent.send(b"create 1 myapp:v1:/pkgs/myapp").unwrap();

    let mut buffer = vec![0u8; 1024];
    let len = parent.recv(&mut buffer).unwrap().unwrap();
    let response = Response::decode(&String::from_utf8_lossy(&buffer[..len])).unwrap();
    assert_eq!(response.seqno, 1);
    assert!(matches!(response.reply, Reply::Uuid(_)));

    let (server, _channel) = server.join().unwrap();
    assert_eq!(server.apps().unwrap().count(AppState::Pending), 1);
}

#[test]
fn test_unknown_command_gets_no_reply() {
    let (parent, child) = ControlChannel::pair().unwrap();
    parent
        .set_recv_timeout(Duration::from_millis(200))
        .unwrap();
    let server = serve_n(child, 1);

    parent.send(b"bogus 7 x").unwrap();

    let mut buffer = vec![0u8; 1024];
    assert!(parent.recv(&mut buffer).unwrap().is_none());
    let (server, _channel) = server.join().unwrap();
    assert!(server.apps().is_none());
}

#[test]
fn test_responses_complete_matching_requests() {
    let (parent, child) = ControlChannel::pair().unwrap();
    let server = serve_n(child, 3);

    let mut seq = SeqAllocator::new();
    let mut actions = ActionList::new();
    let requests = [
        "a:v1:/capps/pkgs/a_v1",
        "b:v1:/capps/pkgs/b_v1",
        "c:v2:/capps/pkgs/c_v2",
    ];
    for (token, params) in requests.iter().enumerate() {
        let seqno = actions.next_seqno(&mut seq);
        let raw = format!("create {} {}", seqno, params);
        let request = Request::decode(&raw).unwrap();
        parent.send(request.encode().as_bytes()).unwrap();
        actions.insert(OutstandingRequest::new(
            seqno,
            request.command.name(),
            request.command.params(),
            token as u64,
        ));
    }

    let mut buffer = vec![0u8; 1024];
    for _ in 0..requests.len() {
        let len = parent.recv(&mut buffer).unwrap().unwrap();
        let response = Response::decode(&String::from_utf8_lossy(&buffer[..len])).unwrap();
        assert!(actions.complete(&response));
    }

    assert_eq!(actions.waiting(), 0);
    let finished = actions.drain_finished();
    let mut tokens: Vec<u64> = finished.iter().map(|f| f.token).collect();
    tokens.sort();
    assert_eq!(tokens, vec![0, 1, 2]);

    let (server, _channel) = server.join().unwrap();
    assert_eq!(server.apps().unwrap().count(AppState::Pending), 3);
}

#[test]
fn test_seqno_wrap_sequence() {
    let mut seq = SeqAllocator::starting_at(SEQNO_WRAP);
    let seqnos: Vec<i32> = (0..3).map(|_| seq.next_seqno()).collect();
    assert_eq!(seqnos, vec![SEQNO_WRAP, 0, 1]);
}
