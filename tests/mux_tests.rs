//! Terminal multiplexer behaviors: serial fan-out and the framed
//! guest-agent pty channel.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use vmpod::agent::{encode_frame, read_frame};
use vmpod::events::event_bus;
use vmpod::{ClientHooks, PseudoTtys, TtyContext, TtyIo};

// =============================================================================
// Helpers
// =============================================================================

/// Hooks recording every deregistration.
#[derive(Default)]
struct CountingHooks {
    deregs: AtomicUsize,
}

impl ClientHooks for CountingHooks {
    fn client_dereg(&self, _tag: &str) {
        self.deregs.fetch_add(1, Ordering::SeqCst);
    }
}

/// Polls until `check` passes or the deadline hits.
async fn eventually<F: Fn() -> bool>(what: &str, check: F) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never reached: {what}");
}

/// Async variant of [`eventually`].
async fn eventually_async<F, Fut>(what: &str, check: F)
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never reached: {what}");
}

// =============================================================================
// Serial TTY Context
// =============================================================================

#[tokio::test]
async fn dead_subscriber_is_removed_and_stream_continues() {
    let hooks = Arc::new(CountingHooks::default());
    let (vm_side, mut vm_peer) = duplex(512);
    let (vm_read, vm_write) = tokio::io::split(vm_side);
    let tc = TtyContext::new(
        "serial0",
        Box::new(vm_read),
        Box::new(vm_write),
        false,
        hooks.clone() as Arc<dyn ClientHooks>,
    );

    // Live subscriber: keep its read end to consume the fan-out.
    let (live_host, mut live_peer) = duplex(512);
    let (_, live_write) = tokio::io::split(live_host);
    tc.attach(1, TtyIo::output_only(Box::new(live_write)))
        .await
        .unwrap();

    // Dead subscriber: its read end is dropped, so writes fail.
    let (dead_host, dead_peer) = duplex(512);
    drop(dead_peer);
    let (_, dead_write) = tokio::io::split(dead_host);
    let (cb_tx, mut cb_rx) = mpsc::unbounded_channel();
    tc.attach(
        2,
        TtyIo {
            stdin: None,
            stdout: Some(Box::new(dead_write)),
            client_tag: Some("dead-client".to_string()),
            callback: Some(cb_tx),
        },
    )
    .await
    .unwrap();

    // Hypervisor emits 100 bytes.
    let payload: Vec<u8> = (0u8..100).collect();
    vm_peer.write_all(&payload).await.unwrap();
    vm_peer.flush().await.unwrap();

    // The live subscriber receives all 100 bytes, uninterrupted.
    let mut received = vec![0u8; 100];
    live_peer.read_exact(&mut received).await.unwrap();
    assert_eq!(received, payload);

    // The dead one was removed, deregistered once, callback fired once.
    assert_eq!(tc.subscriber_count().await, 1);
    assert_eq!(hooks.deregs.load(Ordering::SeqCst), 1);
    assert!(cb_rx.recv().await.is_some());
    assert!(cb_rx.try_recv().is_err());
}

#[tokio::test]
async fn subscriber_input_reaches_hypervisor() {
    let (vm_side, mut vm_peer) = duplex(512);
    let (vm_read, vm_write) = tokio::io::split(vm_side);
    let tc = TtyContext::new(
        "serial0",
        Box::new(vm_read),
        Box::new(vm_write),
        false,
        Arc::new(CountingHooks::default()) as Arc<dyn ClientHooks>,
    );

    let (stdin_host, mut stdin_peer) = duplex(64);
    let (stdin_read, _) = tokio::io::split(stdin_host);
    tc.attach(
        1,
        TtyIo {
            stdin: Some(Box::new(stdin_read)),
            stdout: None,
            client_tag: None,
            callback: None,
        },
    )
    .await
    .unwrap();

    stdin_peer.write_all(b"ls\n").await.unwrap();
    let mut typed = vec![0u8; 3];
    vm_peer.read_exact(&mut typed).await.unwrap();
    assert_eq!(&typed, b"ls\n");
}

#[tokio::test]
async fn exit_char_detaches_without_closing_stream() {
    let hooks = Arc::new(CountingHooks::default());
    let (vm_side, mut vm_peer) = duplex(512);
    let (vm_read, vm_write) = tokio::io::split(vm_side);
    let tc = TtyContext::new(
        "serial0",
        Box::new(vm_read),
        Box::new(vm_write),
        false,
        hooks.clone() as Arc<dyn ClientHooks>,
    );

    let (stdin_host, mut stdin_peer) = duplex(64);
    let (stdin_read, _) = tokio::io::split(stdin_host);
    tc.attach(
        7,
        TtyIo {
            stdin: Some(Box::new(stdin_read)),
            stdout: None,
            client_tag: Some("term-1".to_string()),
            callback: None,
        },
    )
    .await
    .unwrap();

    // Ctrl-] detaches the subscriber.
    stdin_peer.write_all(&[0x1d]).await.unwrap();
    eventually("subscriber detached", || {
        hooks.deregs.load(Ordering::SeqCst) == 1
    })
    .await;
    assert_eq!(tc.subscriber_count().await, 0);

    // The hypervisor stream itself is untouched: another subscriber
    // still sees output.
    let (live_host, mut live_peer) = duplex(64);
    let (_, live_write) = tokio::io::split(live_host);
    tc.attach(8, TtyIo::output_only(Box::new(live_write)))
        .await
        .unwrap();
    vm_peer.write_all(b"hi").await.unwrap();
    let mut out = vec![0u8; 2];
    live_peer.read_exact(&mut out).await.unwrap();
    assert_eq!(&out, b"hi");
}

// =============================================================================
// Guest-Agent Pty Channel
// =============================================================================

fn start_ptys(hooks: Arc<dyn ClientHooks>) -> (Arc<PseudoTtys>, tokio::io::DuplexStream) {
    let ptys = PseudoTtys::new(hooks);
    let (host_io, agent_io) = duplex(4096);
    let (reader, writer) = tokio::io::split(host_io);
    let (bus, _bus_rx) = event_bus();
    ptys.start(reader, writer, bus);
    (ptys, agent_io)
}

#[tokio::test]
async fn frames_fan_out_to_session_subscribers() {
    let (ptys, mut agent) = start_ptys(Arc::new(CountingHooks::default()));

    let (sink_a, mut peer_a) = duplex(256);
    let (_, write_a) = tokio::io::split(sink_a);
    ptys.connect(0, 5, TtyIo::output_only(Box::new(write_a)), false)
        .await;
    let (sink_b, mut peer_b) = duplex(256);
    let (_, write_b) = tokio::io::split(sink_b);
    ptys.connect(0, 5, TtyIo::output_only(Box::new(write_b)), false)
        .await;

    agent
        .write_all(&encode_frame(5, b"hello pty"))
        .await
        .unwrap();

    let mut out = vec![0u8; 9];
    peer_a.read_exact(&mut out).await.unwrap();
    assert_eq!(&out, b"hello pty");
    peer_b.read_exact(&mut out).await.unwrap();
    assert_eq!(&out, b"hello pty");
}

#[tokio::test]
async fn zero_length_frame_closes_session() {
    let hooks = Arc::new(CountingHooks::default());
    let (ptys, mut agent) = start_ptys(hooks.clone() as Arc<dyn ClientHooks>);

    let (sink_a, _peer_a) = duplex(256);
    let (_, write_a) = tokio::io::split(sink_a);
    ptys.connect(
        0,
        9,
        TtyIo {
            stdin: None,
            stdout: Some(Box::new(write_a)),
            client_tag: Some("a".to_string()),
            callback: None,
        },
        false,
    )
    .await;
    let (sink_b, _peer_b) = duplex(256);
    let (_, write_b) = tokio::io::split(sink_b);
    ptys.connect(
        0,
        9,
        TtyIo {
            stdin: None,
            stdout: Some(Box::new(write_b)),
            client_tag: Some("b".to_string()),
            callback: None,
        },
        false,
    )
    .await;
    assert_eq!(ptys.attachment_count(9).await, 2);

    agent.write_all(&encode_frame(9, b"")).await.unwrap();

    eventually_async("session closed", || {
        let ptys = ptys.clone();
        async move { ptys.session_count().await == 0 }
    })
    .await;
    assert_eq!(hooks.deregs.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn detaching_last_subscriber_tells_agent_to_close() {
    let (ptys, agent) = start_ptys(Arc::new(CountingHooks::default()));

    let (sink, _peer) = duplex(256);
    let (_, write_half) = tokio::io::split(sink);
    ptys.connect(
        0,
        3,
        TtyIo {
            stdin: None,
            stdout: Some(Box::new(write_half)),
            client_tag: Some("only".to_string()),
            callback: None,
        },
        false,
    )
    .await;

    ptys.detach(3, Some("only")).await;
    assert_eq!(ptys.session_count().await, 0);

    // The agent receives the zero-payload close frame for the session.
    let (mut agent_read, _agent_write) = tokio::io::split(agent);
    let frame = read_frame(&mut agent_read).await.unwrap();
    assert_eq!(frame.tag, 3);
    assert!(frame.payload.is_empty());
}

#[tokio::test]
async fn persistent_session_survives_detach() {
    let (ptys, _agent) = start_ptys(Arc::new(CountingHooks::default()));

    let (sink, _peer) = duplex(256);
    let (_, write_half) = tokio::io::split(sink);
    ptys.connect(
        0,
        11,
        TtyIo {
            stdin: None,
            stdout: Some(Box::new(write_half)),
            client_tag: Some("watcher".to_string()),
            callback: None,
        },
        true,
    )
    .await;

    ptys.detach(11, Some("watcher")).await;
    // The session object persists even with no subscribers.
    assert_eq!(ptys.session_count().await, 1);
    assert_eq!(ptys.attachment_count(11).await, 0);
}
