//! Peer RPC runtime.
//!
//! One persistent TCP connection per peer. A single reader thread owns the
//! receive side: it reads frames, completes in-flight requests by id and
//! hands everything else to the caller-provided request sink. Writes are
//! serialized by a per-connection writer mutex. Silence on the wire makes
//! the reader send PINGs; too many unanswered periods tear the connection
//! down and fail every in-flight request.

use std::collections::HashMap;
use std::io;
use std::io::Write;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use parking_lot::{Condvar, Mutex};
use crate::codec::{CodecError, DataCoder, FrameReader, DC_SIZE};
use crate::lock_order;
use crate::proto::{ConnectionSpeed, Opcode, ReplyHeader, RequestHeader, ZfsError, ZfsResult};

/// Quiet period after which the reader sends a PING.
pub const HEARTBEAT_PERIOD: Duration = Duration::from_secs(15);
/// Consecutive quiet periods before the connection is declared dead.
pub const HEARTBEAT_MISSES: u32 = 3;
/// Default deadline of one request.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// TCP port the daemon listens on.
pub const DEFAULT_PORT: u16 = 12323;

enum SlotState {
    Waiting,
    Done(Vec<u8>),
    Failed(ZfsError),
}

struct ReplySlot {
    state: Mutex<SlotState>,
    cond: Condvar,
}

impl ReplySlot {
    fn new() -> Arc<ReplySlot> {
        Arc::new(ReplySlot {
            state: Mutex::new(SlotState::Waiting),
            cond: Condvar::new(),
        })
    }

    fn complete(&self, frame: Vec<u8>) {
        *self.state.lock() = SlotState::Done(frame);
        self.cond.notify_one();
    }

    fn fail(&self, err: ZfsError) {
        *self.state.lock() = SlotState::Failed(err);
        self.cond.notify_one();
    }
}

/// Peer identity learned during authentication.
#[derive(Debug, Default, Clone)]
pub struct PeerIdentity {
    pub name: Option<String>,
    pub node_id: Option<u32>,
    pub speed: ConnectionSpeed,
}

/// A successful reply; `reader()` yields a cursor positioned after the
/// reply envelope.
#[derive(Debug)]
pub struct Reply {
    frame: Vec<u8>,
}

impl Reply {
    pub fn reader(&self) -> Result<FrameReader<'_>, CodecError> {
        let mut r = FrameReader::new(&self.frame)?;
        ReplyHeader::decode(&mut r)?;
        Ok(r)
    }
}

/// One live peer connection.
pub struct PeerConn {
    writer: Mutex<TcpStream>,
    next_request_id: AtomicU32,
    in_flight: Mutex<HashMap<u32, Arc<ReplySlot>>>,
    alive: AtomicBool,
    stage1_done: AtomicBool,
    authed: AtomicBool,
    identity: Mutex<PeerIdentity>,
}

impl PeerConn {
    pub fn new(stream: TcpStream) -> io::Result<Arc<PeerConn>> {
        stream.set_nodelay(true)?;
        Ok(Arc::new(PeerConn {
            writer: Mutex::new(stream),
            next_request_id: AtomicU32::new(rand::random::<u32>()),
            in_flight: Mutex::new(HashMap::new()),
            alive: AtomicBool::new(true),
            stage1_done: AtomicBool::new(false),
            authed: AtomicBool::new(false),
            identity: Mutex::new(PeerIdentity::default()),
        }))
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// True once both auth stages completed.
    pub fn is_authed(&self) -> bool {
        self.authed.load(Ordering::Acquire)
    }

    pub fn stage1_done(&self) -> bool {
        self.stage1_done.load(Ordering::Acquire)
    }

    pub fn set_stage1(&self, name: &str, node_id: u32) {
        let mut identity = self.identity.lock();
        identity.name = Some(name.to_owned());
        identity.node_id = Some(node_id);
        self.stage1_done.store(true, Ordering::Release);
    }

    pub fn set_stage2(&self, speed: ConnectionSpeed) {
        self.identity.lock().speed = speed;
        self.authed.store(true, Ordering::Release);
    }

    pub fn identity(&self) -> PeerIdentity {
        self.identity.lock().clone()
    }

    fn next_id(&self) -> u32 {
        self.next_request_id.fetch_add(1, Ordering::Relaxed)
    }

    fn write_frame(&self, frame: &[u8]) -> ZfsResult<()> {
        if !self.is_alive() {
            return Err(ZfsError::ConnectionLost);
        }
        let mut stream = self.writer.lock();
        stream.write_all(frame).map_err(|err| {
            warn!("peer write failed: {err}");
            ZfsError::ConnectionLost
        })
    }

    /// Issue a request and wait for the reply with the default deadline.
    pub fn call(
        &self,
        opcode: Opcode,
        from_sid: u32,
        encode_args: impl FnOnce(&mut DataCoder) -> Result<(), CodecError>,
    ) -> ZfsResult<Reply> {
        self.call_with_timeout(opcode, from_sid, encode_args, REQUEST_TIMEOUT)
    }

    /// Issue a request and wait for the reply. On expiry the in-flight
    /// entry is removed and any late reply is dropped by the reader.
    pub fn call_with_timeout(
        &self,
        opcode: Opcode,
        from_sid: u32,
        encode_args: impl FnOnce(&mut DataCoder) -> Result<(), CodecError>,
        timeout: Duration,
    ) -> ZfsResult<Reply> {
        // Blocking on a peer reply must never happen under object locks.
        lock_order::assert_unlocked();

        let request_id = self.next_id();
        let mut dc = DataCoder::new();
        dc.start_encoding();
        RequestHeader {
            request_id,
            opcode: opcode.into(),
            from_sid,
        }
        .encode(&mut dc)?;
        encode_args(&mut dc)?;

        let slot = ReplySlot::new();
        self.in_flight.lock().insert(request_id, slot.clone());

        if let Err(err) = self.write_frame(dc.finish_encoding()) {
            self.in_flight.lock().remove(&request_id);
            return Err(err);
        }

        let mut state = slot.state.lock();
        let deadline = std::time::Instant::now() + timeout;
        loop {
            match &*state {
                SlotState::Done(_) => break,
                SlotState::Failed(err) => return Err(*err),
                SlotState::Waiting => {}
            }
            if self.cond_timed_out(&slot, &mut state, deadline) {
                drop(state);
                self.in_flight.lock().remove(&request_id);
                return Err(ZfsError::Timeout);
            }
        }
        let SlotState::Done(frame) = std::mem::replace(&mut *state, SlotState::Waiting) else {
            unreachable!("slot checked above");
        };
        drop(state);

        let mut r = FrameReader::new(&frame).map_err(|_| ZfsError::InvalidReply)?;
        let header = ReplyHeader::decode(&mut r).map_err(|_| ZfsError::InvalidReply)?;
        ZfsError::from_wire(header.error)?;
        Ok(Reply { frame })
    }

    fn cond_timed_out(
        &self,
        slot: &ReplySlot,
        state: &mut parking_lot::MutexGuard<'_, SlotState>,
        deadline: std::time::Instant,
    ) -> bool {
        slot.cond.wait_until(state, deadline).timed_out()
    }

    /// Send an already-encoded frame.
    pub fn send_frame(&self, frame: &[u8]) -> ZfsResult<()> {
        self.write_frame(frame)
    }

    /// Send a reply frame for `request_id`.
    pub fn send_reply(
        &self,
        request_id: u32,
        error: i32,
        encode_result: impl FnOnce(&mut DataCoder) -> Result<(), CodecError>,
    ) -> ZfsResult<()> {
        let mut dc = DataCoder::new();
        dc.start_encoding();
        ReplyHeader { request_id, error }.encode(&mut dc)?;
        if error == 0 {
            encode_result(&mut dc)?;
        }
        self.write_frame(dc.finish_encoding())
    }

    /// Send a request without waiting for a reply (FORGET).
    pub fn send_oneway(
        &self,
        opcode: Opcode,
        from_sid: u32,
        encode_args: impl FnOnce(&mut DataCoder) -> Result<(), CodecError>,
    ) -> ZfsResult<()> {
        let mut dc = DataCoder::new();
        dc.start_encoding();
        RequestHeader {
            request_id: self.next_id(),
            opcode: opcode.into(),
            from_sid,
        }
        .encode(&mut dc)?;
        encode_args(&mut dc)?;
        self.write_frame(dc.finish_encoding())
    }

    /// Fail every in-flight request and mark the connection dead.
    pub fn teardown(&self, err: ZfsError) {
        if !self.alive.swap(false, Ordering::AcqRel) {
            return;
        }
        info!("peer connection torn down: {err}");
        let slots: Vec<Arc<ReplySlot>> = self.in_flight.lock().drain().map(|(_, s)| s).collect();
        for slot in slots {
            slot.fail(err);
        }
        let stream = self.writer.lock();
        let _ = stream.shutdown(std::net::Shutdown::Both);
    }

    /// Complete (or drop) an incoming frame that correlates to an
    /// in-flight request. Returns whether the frame was consumed.
    fn demux_reply(&self, frame: &[u8]) -> bool {
        if frame.len() < 8 {
            return false;
        }
        let request_id = u32::from_le_bytes(frame[4..8].try_into().expect("length checked"));
        match self.in_flight.lock().remove(&request_id) {
            Some(slot) => {
                slot.complete(frame.to_vec());
                true
            }
            None => false,
        }
    }
}

impl std::fmt::Debug for PeerConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConn")
            .field("alive", &self.is_alive())
            .field("authed", &self.is_authed())
            .field("in_flight", &self.in_flight.lock().len())
            .finish()
    }
}

enum ReadOutcome {
    Frame(Vec<u8>),
    Quiet,
    Closed,
}

/// Read one frame, treating a receive-timeout at a frame boundary as a
/// quiet period. A timeout in the middle of a frame only counts against
/// the same miss budget; the partial frame is preserved.
fn read_frame_with_heartbeat(stream: &mut TcpStream, misses_left: u32) -> io::Result<ReadOutcome> {
    use std::io::Read;

    let mut header = [0u8; 4];
    let mut filled = 0usize;
    let mut stalls = 0u32;
    while filled < 4 {
        match stream.read(&mut header[filled..]) {
            Ok(0) => {
                return if filled == 0 {
                    Ok(ReadOutcome::Closed)
                } else {
                    Err(io::ErrorKind::UnexpectedEof.into())
                };
            }
            Ok(n) => filled += n,
            Err(err) if is_timeout(&err) => {
                if filled == 0 {
                    return Ok(ReadOutcome::Quiet);
                }
                stalls += 1;
                if stalls > misses_left {
                    return Err(err);
                }
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
    let len = u32::from_le_bytes(header) as usize;
    if !(4..=DC_SIZE).contains(&len) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("invalid frame length {len}"),
        ));
    }
    let mut frame = vec![0u8; len];
    frame[..4].copy_from_slice(&header);
    let mut filled = 4usize;
    while filled < len {
        match stream.read(&mut frame[filled..]) {
            Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(n) => filled += n,
            Err(err) if is_timeout(&err) => {
                stalls += 1;
                if stalls > misses_left {
                    return Err(err);
                }
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
    Ok(ReadOutcome::Frame(frame))
}

fn is_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

/// Run the receive side of `conn` until it dies. Frames that do not
/// correlate to an in-flight request are handed to `on_request`.
pub fn reader_loop(
    conn: Arc<PeerConn>,
    this_sid: u32,
    on_request: impl Fn(Arc<PeerConn>, Vec<u8>),
) {
    let mut stream = match conn.writer.lock().try_clone() {
        Ok(stream) => stream,
        Err(err) => {
            warn!("cannot clone peer stream: {err}");
            conn.teardown(ZfsError::ConnectionLost);
            return;
        }
    };
    if let Err(err) = stream.set_read_timeout(Some(HEARTBEAT_PERIOD)) {
        warn!("cannot set read timeout: {err}");
        conn.teardown(ZfsError::ConnectionLost);
        return;
    }

    let mut misses = 0u32;
    while conn.is_alive() {
        match read_frame_with_heartbeat(&mut stream, HEARTBEAT_MISSES.saturating_sub(misses)) {
            Ok(ReadOutcome::Frame(frame)) => {
                misses = 0;
                if !conn.demux_reply(&frame) {
                    on_request(conn.clone(), frame);
                }
            }
            Ok(ReadOutcome::Quiet) => {
                misses += 1;
                if misses >= HEARTBEAT_MISSES {
                    warn!("peer silent for {misses} heartbeat periods");
                    conn.teardown(ZfsError::ConnectionLost);
                    break;
                }
                debug!("sending heartbeat ping");
                // The reply self-cleans in demux; nobody waits on it.
                let request_id = conn.next_id();
                conn.in_flight
                    .lock()
                    .insert(request_id, ReplySlot::new());
                let mut dc = DataCoder::new();
                dc.start_encoding();
                let header = RequestHeader {
                    request_id,
                    opcode: Opcode::Ping.into(),
                    from_sid: this_sid,
                };
                if header.encode(&mut dc).is_err()
                    || conn.write_frame(dc.finish_encoding()).is_err()
                {
                    conn.teardown(ZfsError::ConnectionLost);
                    break;
                }
            }
            Ok(ReadOutcome::Closed) => {
                info!("peer closed the connection");
                conn.teardown(ZfsError::ConnectionLost);
                break;
            }
            Err(err) => {
                if conn.is_alive() {
                    warn!("peer read failed: {err}");
                }
                conn.teardown(ZfsError::ConnectionLost);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    /// Serve `handler` for each incoming frame on one accepted connection.
    fn frame_server(
        listener: TcpListener,
        handler: impl Fn(&[u8]) -> Option<Vec<u8>> + Send + 'static,
    ) -> std::thread::JoinHandle<()> {
        std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            while let Ok(Some(frame)) = crate::codec::read_frame(&mut stream) {
                if let Some(reply) = handler(&frame) {
                    stream.write_all(&reply).unwrap();
                }
            }
        })
    }

    fn echo_reply(frame: &[u8], error: i32, result: u32) -> Vec<u8> {
        let mut r = FrameReader::new(frame).unwrap();
        let header = RequestHeader::decode(&mut r).unwrap();
        let mut dc = DataCoder::new();
        dc.start_encoding();
        ReplyHeader {
            request_id: header.request_id,
            error,
        }
        .encode(&mut dc)
        .unwrap();
        if error == 0 {
            dc.encode_u32(result).unwrap();
        }
        dc.finish_encoding().to_vec()
    }

    fn connect(listener: &TcpListener) -> Arc<PeerConn> {
        let stream = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        PeerConn::new(stream).unwrap()
    }

    #[test]
    fn call_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let server = frame_server(listener.try_clone().unwrap(), |frame| {
            Some(echo_reply(frame, 0, 42))
        });
        let conn = connect(&listener);
        let conn2 = conn.clone();
        let reader = std::thread::spawn(move || reader_loop(conn2, 1, |_, _| {}));

        let reply = conn.call(Opcode::Null, 1, |_| Ok(())).unwrap();
        let mut r = reply.reader().unwrap();
        assert_eq!(r.read_u32().unwrap(), 42);

        conn.teardown(ZfsError::Exiting);
        reader.join().unwrap();
        drop(listener);
        server.join().unwrap();
    }

    #[test]
    fn error_replies_map_to_zfs_errors() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let server = frame_server(listener.try_clone().unwrap(), |frame| {
            Some(echo_reply(frame, libc::ENOENT, 0))
        });
        let conn = connect(&listener);
        let conn2 = conn.clone();
        let reader = std::thread::spawn(move || reader_loop(conn2, 1, |_, _| {}));

        let err = conn.call(Opcode::Lookup, 1, |_| Ok(())).unwrap_err();
        assert_eq!(err, ZfsError::NoEnt);

        conn.teardown(ZfsError::Exiting);
        reader.join().unwrap();
        drop(listener);
        server.join().unwrap();
    }

    #[test]
    fn replies_correlate_out_of_order() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        // Batch two requests, then answer them in reverse order.
        let server = {
            let listener = listener.try_clone().unwrap();
            std::thread::spawn(move || {
                let (mut stream, _) = listener.accept().unwrap();
                let first = crate::codec::read_frame(&mut stream).unwrap().unwrap();
                let second = crate::codec::read_frame(&mut stream).unwrap().unwrap();
                let tag = |frame: &[u8]| {
                    let mut r = FrameReader::new(frame).unwrap();
                    let _ = RequestHeader::decode(&mut r).unwrap();
                    r.read_u32().unwrap()
                };
                stream.write_all(&echo_reply(&second, 0, tag(&second))).unwrap();
                stream.write_all(&echo_reply(&first, 0, tag(&first))).unwrap();
            })
        };
        let conn = connect(&listener);
        let conn2 = conn.clone();
        let reader = std::thread::spawn(move || reader_loop(conn2, 1, |_, _| {}));

        let c1 = conn.clone();
        let t1 = std::thread::spawn(move || {
            let reply = c1.call(Opcode::Null, 1, |dc| dc.encode_u32(111)).unwrap();
            reply.reader().unwrap().read_u32().unwrap()
        });
        // Make the first request land first.
        std::thread::sleep(Duration::from_millis(50));
        let c2 = conn.clone();
        let t2 = std::thread::spawn(move || {
            let reply = c2.call(Opcode::Null, 1, |dc| dc.encode_u32(222)).unwrap();
            reply.reader().unwrap().read_u32().unwrap()
        });

        assert_eq!(t1.join().unwrap(), 111);
        assert_eq!(t2.join().unwrap(), 222);

        conn.teardown(ZfsError::Exiting);
        reader.join().unwrap();
        server.join().unwrap();
    }

    #[test]
    fn request_timeout_removes_in_flight() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let server = frame_server(listener.try_clone().unwrap(), |_| None);
        let conn = connect(&listener);
        let conn2 = conn.clone();
        let reader = std::thread::spawn(move || reader_loop(conn2, 1, |_, _| {}));

        let err = conn
            .call_with_timeout(Opcode::Null, 1, |_| Ok(()), Duration::from_millis(50))
            .unwrap_err();
        assert_eq!(err, ZfsError::Timeout);
        assert!(conn.in_flight.lock().is_empty());

        conn.teardown(ZfsError::Exiting);
        reader.join().unwrap();
        drop(listener);
        server.join().unwrap();
    }

    #[test]
    fn peer_close_fails_in_flight() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let server = {
            let listener = listener.try_clone().unwrap();
            std::thread::spawn(move || {
                let (stream, _) = listener.accept().unwrap();
                // Read one frame then slam the connection shut.
                let mut stream2 = stream.try_clone().unwrap();
                let _ = crate::codec::read_frame(&mut stream2);
                drop(stream);
            })
        };
        let conn = connect(&listener);
        let conn2 = conn.clone();
        let reader = std::thread::spawn(move || reader_loop(conn2, 1, |_, _| {}));

        let err = conn.call(Opcode::Null, 1, |_| Ok(())).unwrap_err();
        assert_eq!(err, ZfsError::ConnectionLost);
        assert!(!conn.is_alive());

        reader.join().unwrap();
        server.join().unwrap();
    }

    #[test]
    fn unknown_ids_become_requests() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let (tx, rx) = std::sync::mpsc::channel();
        let server = {
            let listener = listener.try_clone().unwrap();
            std::thread::spawn(move || {
                let (mut stream, _) = listener.accept().unwrap();
                // Push an unsolicited request frame at the client.
                let mut dc = DataCoder::new();
                dc.start_encoding();
                RequestHeader {
                    request_id: 7,
                    opcode: Opcode::Ping.into(),
                    from_sid: 2,
                }
                .encode(&mut dc)
                .unwrap();
                stream.write_all(dc.finish_encoding()).unwrap();
                // Hold the connection open until the client saw it.
                std::thread::sleep(Duration::from_millis(200));
            })
        };
        let conn = connect(&listener);
        let conn2 = conn.clone();
        let reader = std::thread::spawn(move || {
            reader_loop(conn2, 1, move |_, frame| {
                tx.send(frame).unwrap();
            })
        });

        let frame = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let mut r = FrameReader::new(&frame).unwrap();
        let header = RequestHeader::decode(&mut r).unwrap();
        assert_eq!(header.opcode().unwrap(), Opcode::Ping);
        assert_eq!(header.from_sid, 2);

        conn.teardown(ZfsError::Exiting);
        reader.join().unwrap();
        server.join().unwrap();
    }
}
