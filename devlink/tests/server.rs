//! Server manager scenarios: hot-plug, stop, dispatch, and backpressure.
#![cfg(unix)]
#![allow(clippy::unwrap_used)]

use std::collections::HashMap;
use std::io::Read;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use devlink::proto::{ChunkPayload, ComponentType, Frame, MsgKind, MsgStatus, RequestType};
use devlink::{
    Backoff, BaseDirResolver, ChunkPipeline, Client, Component, ComponentRegistry, Conn,
    DeviceSet, DumpChunk, Event, Handle, Interest, IoMode, Multiplexer, OpenParams,
    PipelineOptions, PollMux, PushError, ServerHandle, ServerManager, ServerOptions, ServerState,
    StaticDevices, Transport, TransportKind, TransportRegistry, UnixTransport, codec,
};

const POLL: Duration = Duration::from_millis(20);
const REQUEST_TIMEOUT: Duration = Duration::from_millis(300);

/// Ordered record of teardown steps across collaborators.
type Timeline = Arc<Mutex<Vec<&'static str>>>;

fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(5));
    }
}

/// Unix transport that counts endpoint closes per device.
#[derive(Debug)]
struct Counting {
    inner: UnixTransport,
    devices: Mutex<HashMap<i64, u16>>,
    closes: Mutex<HashMap<u16, usize>>,
    timeline: Timeline,
}

impl Counting {
    fn new(dir: &Path, timeline: Timeline) -> Self {
        Self {
            inner: UnixTransport::new(dir),
            devices: Mutex::new(HashMap::new()),
            closes: Mutex::new(HashMap::new()),
            timeline,
        }
    }

    fn closes(&self, device: u16) -> usize {
        self.closes.lock().unwrap().get(&device).copied().unwrap_or(0)
    }
}

impl Transport for Counting {
    fn kind(&self) -> TransportKind {
        TransportKind::Unix
    }

    fn open_server(&self, params: &OpenParams) -> devlink::Result<Handle> {
        let h = self.inner.open_server(params)?;
        self.devices
            .lock()
            .unwrap()
            .insert(h.raw_id().unwrap(), params.device().unwrap());
        Ok(h)
    }

    fn open_client(&self, params: &OpenParams) -> devlink::Result<Handle> {
        self.inner.open_client(params)
    }

    fn accept(&self, server: &Handle) -> devlink::Result<Handle> {
        self.inner.accept(server)
    }

    fn connect(&self, client: Handle, params: &OpenParams) -> devlink::Result<Handle> {
        self.inner.connect(client, params)
    }

    fn read(&self, session: &Handle, mode: IoMode) -> devlink::Result<Vec<u8>> {
        self.inner.read(session, mode)
    }

    fn wait_readable(&self, session: &Handle, timeout: Duration) -> devlink::Result<bool> {
        self.inner.wait_readable(session, timeout)
    }

    fn write(&self, session: &Handle, frame: &[u8]) -> devlink::Result<()> {
        self.inner.write(session, frame)
    }

    fn close_server(&self, server: &mut Handle) -> devlink::Result<()> {
        if let Some(id) = server.raw_id()
            && let Some(device) = self.devices.lock().unwrap().remove(&id)
        {
            *self.closes.lock().unwrap().entry(device).or_default() += 1;
            self.timeline.lock().unwrap().push("close");
        }
        self.inner.close_server(server)
    }

    fn close_client(&self, client: &mut Handle) -> devlink::Result<()> {
        self.inner.close_client(client)
    }

    fn close_session(&self, session: &mut Handle) -> devlink::Result<()> {
        self.inner.close_session(session)
    }
}

/// Answers detect requests and counts lifecycle calls.
#[derive(Debug, Default)]
struct Echo {
    handled: AtomicUsize,
    inits: AtomicUsize,
    uninits: AtomicUsize,
    timeline: Timeline,
}

impl Component for Echo {
    fn component_type(&self) -> ComponentType {
        ComponentType::Detect
    }

    fn process(&self, conn: &mut Conn, frame: &Frame) -> devlink::Result<()> {
        self.handled.fetch_add(1, Ordering::SeqCst);
        codec::send_buffer(conn, frame.header.req_type, MsgStatus::NoError, b"test-agent")
    }

    fn init(&self) -> devlink::Result<()> {
        self.inits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn uninit(&self) {
        self.uninits.fetch_add(1, Ordering::SeqCst);
        self.timeline.lock().unwrap().push("uninit");
    }
}

/// Poll multiplexer that records when it is destroyed.
#[derive(Debug)]
struct Recording {
    inner: PollMux,
    timeline: Timeline,
}

impl Multiplexer for Recording {
    fn add(&mut self, handle: &Handle, interest: Interest) -> devlink::Result<()> {
        self.inner.add(handle, interest)
    }

    fn del(&mut self, handle: &Handle, interest: Interest) -> devlink::Result<()> {
        self.inner.del(handle, interest)
    }

    fn wait(
        &mut self,
        events: &mut Vec<Event>,
        capacity: usize,
        timeout: Duration,
    ) -> devlink::Result<usize> {
        self.inner.wait(events, capacity, timeout)
    }

    fn destroy(&mut self) {
        self.timeline.lock().unwrap().push("destroy");
        self.inner.destroy();
    }

    fn capacity(&self) -> usize {
        self.inner.capacity()
    }
}

fn options() -> ServerOptions {
    let mut o = ServerOptions::default();
    o.service = "it".to_owned();
    o.poll_interval = POLL;
    o.workers = 2;
    o.request_timeout = REQUEST_TIMEOUT;
    o
}

struct Harness {
    server: ServerHandle,
    _dir: tempfile::TempDir,
    socket_dir: std::path::PathBuf,
    transports: Arc<TransportRegistry>,
    counting: Arc<Counting>,
    devices: DeviceSet,
    echo: Arc<Echo>,
    timeline: Timeline,
}

fn start(devices: &[u16], extra: Option<Arc<dyn Component>>) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let socket_dir = dir.path().to_path_buf();
    let timeline = Timeline::default();
    let counting = Arc::new(Counting::new(&socket_dir, Arc::clone(&timeline)));
    let transports = Arc::new(TransportRegistry::new());
    transports.register(counting.clone()).unwrap();

    let components = Arc::new(ComponentRegistry::new());
    let echo = Arc::new(Echo {
        timeline: Arc::clone(&timeline),
        ..Echo::default()
    });
    components.register(echo.clone()).unwrap();
    if let Some(c) = extra {
        components.register(c).unwrap();
    }

    let set = DeviceSet::new(devices.iter().copied());
    let server = ServerManager::new(Arc::clone(&transports), components)
        .transport(TransportKind::Unix)
        .multiplexer(Box::new(Recording {
            inner: PollMux::with_capacity(16),
            timeline: Arc::clone(&timeline),
        }))
        .devices(Box::new(set.clone()))
        .options(options())
        .start()
        .unwrap();
    Harness {
        server,
        _dir: dir,
        socket_dir,
        transports,
        counting,
        devices: set,
        echo,
        timeline,
    }
}

impl Harness {
    fn client(&self, device: u16) -> Client {
        Client::new(
            Arc::clone(&self.transports),
            TransportKind::Unix,
            OpenParams::for_device("it", device),
        )
    }

    fn socket(&self, device: u16) -> std::path::PathBuf {
        self.socket_dir.join(format!("it-{device}.sock"))
    }
}

#[test]
fn accepted_connections_are_dispatched() {
    let h = start(&[0, 1], None);
    wait_until("endpoints", || h.server.listening_devices() == vec![0, 1]);
    assert_eq!(h.server.state(), ServerState::Running);

    for device in [0, 1, 0] {
        assert_eq!(h.client(device).detect().unwrap(), "test-agent");
    }
    wait_until("dispatch", || h.echo.handled.load(Ordering::SeqCst) == 3);
}

#[test]
fn unknown_request_closes_connection() {
    let h = start(&[0], None);
    wait_until("endpoint", || h.server.listening_devices() == vec![0]);

    let conn = Conn::connect(&h.transports, TransportKind::Unix, &OpenParams::for_device("it", 0))
        .unwrap();
    let exec = Frame::data(RequestType::ExecCommand.code(), 0, Vec::new()).unwrap();
    codec::send_frame(&conn, &exec).unwrap();
    assert!(matches!(
        conn.read_bytes(IoMode::Blocking),
        Err(devlink::Error::Closed)
    ));
    // The loop survives and keeps serving.
    assert_eq!(h.client(0).detect().unwrap(), "test-agent");
}

#[test]
fn removed_device_is_closed_exactly_once() {
    let h = start(&[0, 1], None);
    wait_until("endpoints", || h.server.listening_devices() == vec![0, 1]);
    assert!(h.socket(1).exists());

    h.devices.disable(1);
    wait_until("removal", || h.server.listening_devices() == vec![0]);
    // Let several more poll iterations pass.
    thread::sleep(POLL * 10);
    assert_eq!(h.counting.closes(1), 1);
    assert_eq!(h.counting.closes(0), 0);
    assert!(!h.socket(1).exists());
    assert!(h.client(1).detect().is_err());
    assert_eq!(h.client(0).detect().unwrap(), "test-agent");

    // Re-plugging brings it back.
    h.devices.enable(1);
    wait_until("re-plug", || h.server.listening_devices() == vec![0, 1]);
    assert_eq!(h.client(1).detect().unwrap(), "test-agent");
}

#[test]
fn stop_tears_everything_down_once() {
    let mut h = start(&[0, 1], None);
    wait_until("endpoints", || h.server.listening_devices() == vec![0, 1]);

    let started = Instant::now();
    h.server.stop().unwrap();
    assert!(started.elapsed() < POLL * 10 + Duration::from_millis(500));
    assert_eq!(h.server.state(), ServerState::Stopped);
    assert!(h.server.listening_devices().is_empty());
    assert_eq!(h.counting.closes(0), 1);
    assert_eq!(h.counting.closes(1), 1);
    assert!(!h.socket(0).exists());

    // No endpoint is created after stop.
    h.devices.enable(2);
    thread::sleep(POLL * 5);
    assert!(!h.socket(2).exists());

    h.server.stop().unwrap();
    drop(h.server);
    assert_eq!(h.echo.uninits.load(Ordering::SeqCst), 1);
}

#[test]
fn stop_closes_endpoints_before_uninit_and_destroy() {
    let mut h = start(&[0, 1], None);
    wait_until("endpoints", || h.server.listening_devices() == vec![0, 1]);
    h.server.stop().unwrap();
    assert_eq!(
        *h.timeline.lock().unwrap(),
        vec!["close", "close", "uninit", "destroy"]
    );
}

#[test]
fn idle_connections_do_not_starve_workers() {
    let h = start(&[0], None);
    wait_until("endpoint", || h.server.listening_devices() == vec![0]);

    // One silent peer per worker.
    let mut idle: Vec<_> = (0..2)
        .map(|_| UnixStream::connect(h.socket(0)).unwrap())
        .collect();
    assert_eq!(h.client(0).detect().unwrap(), "test-agent");

    for stream in &mut idle {
        stream
            .set_read_timeout(Some(REQUEST_TIMEOUT * 10))
            .unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(stream.read(&mut buf).unwrap(), 0);
    }
}

#[test]
fn failed_launch_uninitializes_components() {
    let dir = tempfile::tempdir().unwrap();
    let transports = Arc::new(TransportRegistry::new());
    transports
        .register(Arc::new(UnixTransport::new(dir.path())))
        .unwrap();
    let components = Arc::new(ComponentRegistry::new());
    let echo = Arc::new(Echo::default());
    components.register(echo.clone()).unwrap();

    let mut opts = options();
    opts.workers = 0;
    let res = ServerManager::new(transports, components)
        .transport(TransportKind::Unix)
        .multiplexer(Box::new(PollMux::with_capacity(4)))
        .devices(Box::new(StaticDevices::new([0])))
        .options(opts)
        .start();
    assert!(matches!(res, Err(devlink::Error::NotReady(_))));
    assert_eq!(echo.inits.load(Ordering::SeqCst), 1);
    assert_eq!(echo.uninits.load(Ordering::SeqCst), 1);
}

/// Pushes every chunk of a dump stream into a pipeline.
#[derive(Debug)]
struct DumpSink {
    pipeline: Arc<ChunkPipeline>,
    cache_full: Arc<AtomicUsize>,
}

impl Component for DumpSink {
    fn component_type(&self) -> ComponentType {
        ComponentType::Dump
    }

    fn process(&self, conn: &mut Conn, frame: &Frame) -> devlink::Result<()> {
        let mut frame = frame.clone();
        loop {
            if frame.header.kind == MsgKind::Ctrl {
                return Ok(());
            }
            let req = frame.header.req_type;
            let status = match self.pipeline.push(DumpChunk::new(frame)) {
                Ok(()) => MsgStatus::NoError,
                Err(e @ PushError::Full(_)) => {
                    self.cache_full.fetch_add(1, Ordering::SeqCst);
                    e.status()
                }
                Err(e) => e.status(),
            };
            codec::send_response(conn, req, status)?;
            frame = codec::recv_frame(conn, IoMode::NonBlocking)?;
        }
    }
}

#[test]
fn full_queue_makes_sender_retry_until_drained() {
    let out = tempfile::tempdir().unwrap();
    let mut opts = PipelineOptions::default();
    opts.capacity = 1;
    opts.base_dir = out.path().to_path_buf();
    opts.resolver = Arc::new(BaseDirResolver::default());
    let pipeline = Arc::new(ChunkPipeline::start(opts).unwrap());

    let open = Arc::new(AtomicBool::new(false));
    let gate = Arc::clone(&open);
    let consumed = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&consumed);
    pipeline.set_sink(Arc::new(move |bytes: &[u8]| {
        while !gate.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(1));
        }
        ChunkPayload::decode(bytes)?;
        seen.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }));

    let cache_full = Arc::new(AtomicUsize::new(0));
    let dump: Arc<dyn Component> = Arc::new(DumpSink {
        pipeline: Arc::clone(&pipeline),
        cache_full: Arc::clone(&cache_full),
    });
    let h = start(&[0], Some(dump));
    wait_until("endpoint", || h.server.listening_devices() == vec![0]);

    let chunks: Vec<_> = (0..5u64)
        .map(|i| ChunkPayload::new("core.bin", i * 4, vec![i as u8; 4], i == 4))
        .collect();
    let client = h.client(0).with_backoff(Backoff::new(1000, 5));

    thread::scope(|s| {
        let sender = s.spawn(|| client.send_dump(RequestType::Dump, chunks.into_iter().map(Ok)));
        wait_until("cache-full", || cache_full.load(Ordering::SeqCst) > 0);
        open.store(true, Ordering::SeqCst);
        assert_eq!(sender.join().unwrap().unwrap(), 5);
    });

    assert!(pipeline.shutdown());
    assert_eq!(consumed.load(Ordering::SeqCst), 5);
    assert!(cache_full.load(Ordering::SeqCst) >= 1);
}

#[test]
fn unregistered_transport_kind_is_neutral() {
    let transports = TransportRegistry::new();
    let params = OpenParams::for_device("it", 0);
    let mut server = transports.open_server(TransportKind::Vsock, &params);
    assert!(server.is_invalid());
    assert!(transports.accept(&server).is_invalid());
    let client = transports.open_client(TransportKind::Vsock, &params);
    let mut session = transports.connect(client, &params);
    assert!(session.is_invalid());
    transports.close_session(&mut session).unwrap();
    transports.close_server(&mut server).unwrap();
}
