//! The single-connection state machine. One `Connection` owns one socket,
//! one receive ring and a FIFO of pre-encoded INSERT requests, and is driven
//! entirely by the embedder calling `poll(now, budget)` from one thread.
//! Every operation makes bounded progress and never blocks: would-block on
//! both directions with nothing parseable in the ring simply returns control.

use crate::block::Block;
use crate::config::ClientOptions;
use crate::logging;
use crate::logging::Logger;
use crate::net::encode;
use crate::net::parse::{HelloParse, HelloState, PacketEvent, PacketState, ServerInfo};
use crate::net::protocol;
use crate::net::result::Result;
use crate::net::ring::ByteRing;
use crate::net::socket::{ConnectStart, NonBlockingSocket, RecvOutcome, SendOutcome};
use std::cmp::min;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

// Per-iteration cap on a single send or recv, to keep poll fair across many
// connections and stop one fat block from starving the parser.
const MAX_IO_CHUNK: usize = 64 * 1024;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum State {
    Disconnected,
    Connecting,
    HandshakingSendHello,
    HandshakingRecvHello,
    HandshakingSendAddendum,
    Ready,
    RequestSendQuery,
    RequestWaitForData,
    RequestSendBlock,
    RequestSendEnd,
    RequestWaitForEOS,
}

/// Where an in-flight request stands in the INSERT exchange.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum RequestPhase {
    SendingQuery,
    SendingQueryTerminator,
    WaitingForData,
    SendingBlock,
    SendingEnd,
    WaitingForEOS,
}

/// Which of the four request buffers the TX cursor points into.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum TxSegment {
    Query,
    QueryTerminator,
    DataBlock,
    End,
}

impl TxSegment {
    #[inline]
    fn select(self, request: &Request) -> &[u8] {
        match self {
            TxSegment::Query => &request.query_bytes,
            TxSegment::QueryTerminator => &request.query_terminator_bytes,
            TxSegment::DataBlock => &request.data_bytes,
            TxSegment::End => &request.end_bytes,
        }
    }
}

/// One queued INSERT, fully serialized at enqueue time.
struct Request {
    query_bytes: Vec<u8>,
    query_terminator_bytes: Vec<u8>,
    data_bytes: Vec<u8>,
    end_bytes: Vec<u8>,
    total_bytes: usize,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum EnqueueResult {
    Queued,
    /// Rejected by a backpressure cap.
    Dropped,
    /// The breaker is tripped.
    Disabled,
    NotConnected,
}

/// Counters for one `poll` call.
#[derive(Debug, Default, Copy, Clone)]
pub struct PollResult {
    pub progressed: bool,
    pub connected: bool,
    pub bytes_sent: usize,
    pub bytes_recv: usize,
    pub requests_completed: usize,
    pub requests_failed: usize,
}

/// A non-blocking ClickHouse connection pipelining INSERT requests.
pub struct Connection {
    options: ClientOptions,

    state: State,
    socket: NonBlockingSocket,
    inbox: ByteRing,

    packet_state: PacketState,
    hello_state: HelloState,
    server_info: ServerInfo,

    hello_bytes: Vec<u8>,
    hello_offset: usize,
    addendum_bytes: Vec<u8>,
    addendum_offset: usize,

    requests: VecDeque<Request>,
    inflight_bytes: usize,

    disabled_until: Option<Instant>,
    connect_started_at: Instant,
    last_progress_at: Instant,

    phase: Option<RequestPhase>,
    tx_segment: Option<TxSegment>,
    tx_offset: usize,

    log: Logger,
}

impl Connection {
    /// Builds a connection from validated options. Does not touch the
    /// network; `start_connect` begins the handshake.
    pub fn new<'a, L: Into<Option<&'a Logger>>>(options: ClientOptions, log: L) -> Connection {
        let conn_log = match log.into() {
            Some(log) => log.new(logging::o!()),
            _ => Logger::root(logging::Discard, logging::o!()),
        };

        let ring_bytes = options.inbox_ring_bytes.max(1);
        let now = Instant::now();

        Connection {
            options,
            state: State::Disconnected,
            socket: NonBlockingSocket::new(),
            inbox: ByteRing::new(ring_bytes),
            packet_state: PacketState::new(),
            hello_state: HelloState::new(),
            server_info: ServerInfo::default(),
            hello_bytes: Vec::new(),
            hello_offset: 0,
            addendum_bytes: Vec::new(),
            addendum_offset: 0,
            requests: VecDeque::new(),
            inflight_bytes: 0,
            disabled_until: None,
            connect_started_at: now,
            last_progress_at: now,
            phase: None,
            tx_segment: None,
            tx_offset: 0,
            log: conn_log,
        }
    }

    /// Begins a non-blocking connect. A still-tripped breaker makes this a
    /// silent no-op; an expired one is cleared first.
    pub fn start_connect(&mut self) -> Result<()> {
        let now = Instant::now();
        self.clear_disabled_if_expired(now);
        if self.disabled_until.is_some() {
            return Ok(());
        }

        self.close();
        self.connect_started_at = now;
        self.hello_bytes = encode::encode_hello(
            &self.options.database,
            &self.options.user,
            &self.options.password,
        )?;
        self.hello_offset = 0;

        logging::debug!(self.log, "connecting";
                        "host" => %self.options.host,
                        "port" => self.options.port);

        match self
            .socket
            .start_connect(&self.options.host, self.options.port)?
        {
            ConnectStart::Connected => self.state = State::HandshakingSendHello,
            ConnectStart::Started => self.state = State::Connecting,
        }

        self.last_progress_at = now;
        Ok(())
    }

    /// Releases the socket and resets all per-connection parse state. Queued
    /// requests are kept; a later `start_connect` resumes them.
    pub fn close(&mut self) {
        logging::debug!(self.log, "closing connection";
                        "queued_requests" => self.requests.len(),
                        "inflight_bytes" => self.inflight_bytes,
                        "inbox_size" => self.inbox.len());

        self.socket.close();
        self.inbox.clear();
        self.packet_state.reset();
        self.hello_state.reset();
        self.server_info = ServerInfo::default();
        self.state = State::Disconnected;
        self.hello_offset = 0;
        self.addendum_offset = 0;
        self.phase = None;
        self.tx_segment = None;
        self.tx_offset = 0;
    }

    /// True once the handshake finished, in steady state or mid-request.
    pub fn connected(&self) -> bool {
        match self.state {
            State::Ready
            | State::RequestSendQuery
            | State::RequestWaitForData
            | State::RequestSendBlock
            | State::RequestSendEnd
            | State::RequestWaitForEOS => true,
            _ => false,
        }
    }

    /// True while the breaker holds the connection down.
    pub fn disabled(&self) -> bool {
        match self.disabled_until {
            Some(until) => Instant::now() < until,
            None => false,
        }
    }

    #[inline]
    pub fn inflight_requests(&self) -> usize {
        self.requests.len()
    }

    #[inline]
    pub fn inflight_bytes(&self) -> usize {
        self.inflight_bytes
    }

    /// Serializes an INSERT of `block` into `table` and queues it behind any
    /// in-flight requests. Never blocks and never fails the connection; the
    /// result says whether the request was accepted.
    pub fn enqueue_insert(&mut self, table: &str, block: &Block, query_id: &str) -> EnqueueResult {
        let now = Instant::now();
        self.clear_disabled_if_expired(now);
        if self.disabled_until.is_some() {
            return EnqueueResult::Disabled;
        }
        if !self.connected() {
            return EnqueueResult::NotConnected;
        }
        if self.requests.len() >= self.options.max_inflight_requests {
            return EnqueueResult::Dropped;
        }

        let query_text = encode::insert_query_text(table, block);
        let empty = Block::new();
        let revision = self.server_info.revision;

        let encoded = encode::encode_query(&query_text, query_id, revision).and_then(|query| {
            Ok(Request {
                query_bytes: query,
                query_terminator_bytes: encode::encode_data(&empty, revision)?,
                data_bytes: encode::encode_data(block, revision)?,
                end_bytes: encode::encode_data(&empty, revision)?,
                total_bytes: 0,
            })
        });

        let mut request = match encoded {
            Ok(request) => request,
            Err(e) => {
                logging::error!(self.log, "failed to encode insert";
                                "table" => %table,
                                "error" => %e);
                return EnqueueResult::Dropped;
            }
        };
        request.total_bytes = request.query_bytes.len()
            + request.query_terminator_bytes.len()
            + request.data_bytes.len()
            + request.end_bytes.len();

        if self.inflight_bytes + request.total_bytes > self.options.max_inflight_bytes {
            return EnqueueResult::Dropped;
        }

        logging::trace!(self.log, "insert enqueued";
                        "table" => %table,
                        "request_bytes" => request.total_bytes,
                        "queued_requests" => self.requests.len() + 1);

        self.inflight_bytes += request.total_bytes;
        self.requests.push_back(request);
        if self.state == State::Ready {
            self.begin_next_request_if_needed(now);
        }
        EnqueueResult::Queued
    }

    /// Runs alternating I/O attempts and state transitions until the budget
    /// is spent or an iteration makes no progress. Any error tripping out of
    /// the pipeline becomes a breaker trip here, with every queued request
    /// counted as failed.
    pub fn poll(&mut self, now: Instant, budget: Duration) -> PollResult {
        self.clear_disabled_if_expired(now);

        let mut result = PollResult::default();
        result.connected = self.connected();

        if self.disabled_until.is_some() {
            return result;
        }
        if budget == Duration::from_secs(0) {
            return result;
        }

        let deadline = now + budget;

        loop {
            if Instant::now() >= deadline {
                break;
            }

            if self.stalled(now) {
                let dropped = self.requests.len();
                self.trip_breaker(now, "stall timeout");
                result.requests_failed += dropped;
                result.progressed = true;
                break;
            }

            let step = self
                .advance_io(now, &mut result)
                .and_then(|io_progress| {
                    self.advance_state(now, &mut result)
                        .map(|state_progress| io_progress || state_progress)
                });

            match step {
                Ok(true) => result.progressed = true,
                Ok(false) => break,
                Err(e) => {
                    let dropped = self.requests.len();
                    self.trip_breaker(now, &e.to_string());
                    result.requests_failed += dropped;
                    result.progressed = true;
                    break;
                }
            }
        }

        result.connected = self.connected();
        result
    }

    fn stalled(&self, now: Instant) -> bool {
        if self.options.stall_timeout == Duration::from_secs(0) {
            return false;
        }
        match self.state {
            State::Disconnected | State::Connecting | State::Ready => false,
            _ => now.saturating_duration_since(self.last_progress_at) > self.options.stall_timeout,
        }
    }

    fn clear_disabled_if_expired(&mut self, now: Instant) {
        if let Some(until) = self.disabled_until {
            if now >= until {
                self.disabled_until = None;
            }
        }
    }

    /// Drops the socket and every queued request, then disables the
    /// connection for the cooldown period.
    fn trip_breaker(&mut self, now: Instant, reason: &str) {
        logging::warn!(self.log, "breaker tripped";
                       "reason" => %reason,
                       "dropped_requests" => self.requests.len(),
                       "dropped_bytes" => self.inflight_bytes);

        self.socket.close();
        self.inbox.clear();
        self.packet_state.reset();
        self.hello_state.reset();
        self.server_info = ServerInfo::default();

        self.requests.clear();
        self.inflight_bytes = 0;
        self.phase = None;
        self.tx_segment = None;
        self.tx_offset = 0;
        self.state = State::Disconnected;

        self.disabled_until = Some(now + self.options.cooldown);
    }

    fn begin_next_request_if_needed(&mut self, now: Instant) -> bool {
        if self.state != State::Ready || self.requests.is_empty() {
            return false;
        }

        logging::debug!(self.log, "request started";
                        "queued_requests" => self.requests.len());

        self.last_progress_at = now;
        self.phase = Some(RequestPhase::SendingQuery);
        self.tx_segment = Some(TxSegment::Query);
        self.tx_offset = 0;
        self.state = State::RequestSendQuery;
        true
    }

    /// One bounded send attempt for the current TX segment and one bounded
    /// recv attempt into the ring.
    fn advance_io(&mut self, now: Instant, out: &mut PollResult) -> Result<bool> {
        if !self.socket.is_open() {
            return Ok(false);
        }

        let mut progressed = false;

        if let (Some(segment), Some(request)) = (self.tx_segment, self.requests.front()) {
            let buf = segment.select(request);
            if self.tx_offset < buf.len() {
                let to_send = min(buf.len() - self.tx_offset, MAX_IO_CHUNK);
                let outcome = self
                    .socket
                    .send_some(&buf[self.tx_offset..self.tx_offset + to_send])?;
                if let SendOutcome::Sent(sent) = outcome {
                    if sent > 0 {
                        self.tx_offset += sent;
                        out.bytes_sent += sent;
                        self.last_progress_at = now;
                        progressed = true;
                    }
                }
            }
        }

        // No recv while a non-blocking connect is still in flight; a full
        // ring is backpressure, not an error.
        if self.state != State::Connecting && self.inbox.available() > 0 {
            let span = self.inbox.write_span();
            let to_recv = min(span.len(), MAX_IO_CHUNK);
            match self.socket.recv_some(&mut span[..to_recv])? {
                RecvOutcome::Received(received) => {
                    self.inbox.commit_write(received);
                    out.bytes_recv += received;
                    self.last_progress_at = now;
                    progressed = true;
                }
                RecvOutcome::WouldBlock => {}
                RecvOutcome::Closed => {
                    let dropped = self.requests.len();
                    self.trip_breaker(now, "connection closed by peer");
                    out.requests_failed += dropped;
                    progressed = true;
                }
            }
        }

        Ok(progressed)
    }

    fn advance_state(&mut self, now: Instant, out: &mut PollResult) -> Result<bool> {
        match self.state {
            State::Disconnected => Ok(false),

            State::Connecting => {
                if self.options.connect_timeout != Duration::from_secs(0)
                    && now.saturating_duration_since(self.connect_started_at)
                        > self.options.connect_timeout
                {
                    let dropped = self.requests.len();
                    self.trip_breaker(now, "connect timeout");
                    out.requests_failed += dropped;
                    return Ok(true);
                }
                if self.socket.poll_connected()? {
                    logging::debug!(self.log, "tcp connect completed");
                    self.last_progress_at = now;
                    self.state = State::HandshakingSendHello;
                    return Ok(true);
                }
                Ok(false)
            }

            State::HandshakingSendHello => {
                if !self.socket.is_open() {
                    return Ok(false);
                }
                let mut progressed = false;
                if self.hello_offset < self.hello_bytes.len() {
                    let outcome = self.socket.send_some(&self.hello_bytes[self.hello_offset..])?;
                    if let SendOutcome::Sent(sent) = outcome {
                        if sent > 0 {
                            self.hello_offset += sent;
                            out.bytes_sent += sent;
                            self.last_progress_at = now;
                            progressed = true;
                        }
                    }
                    if self.hello_offset < self.hello_bytes.len() {
                        return Ok(progressed);
                    }
                }
                self.state = State::HandshakingRecvHello;
                Ok(true)
            }

            State::HandshakingRecvHello => {
                match self
                    .hello_state
                    .advance(&mut self.inbox, &mut self.server_info)?
                {
                    HelloParse::NeedMore => Ok(false),
                    HelloParse::Exception(message) => {
                        let dropped = self.requests.len();
                        self.trip_breaker(now, &message);
                        out.requests_failed += dropped;
                        Ok(true)
                    }
                    HelloParse::Done => {
                        logging::debug!(self.log, "handshake complete";
                                        "server" => %self.server_info.name,
                                        "display_name" => %self.server_info.display_name,
                                        "revision" => self.server_info.revision);

                        self.last_progress_at = now;
                        if self.server_info.revision >= protocol::MIN_REVISION_WITH_ADDENDUM {
                            // A single empty string closes the handshake.
                            self.addendum_bytes = vec![0];
                            self.addendum_offset = 0;
                            self.state = State::HandshakingSendAddendum;
                        } else {
                            self.state = State::Ready;
                            self.begin_next_request_if_needed(now);
                        }
                        Ok(true)
                    }
                }
            }

            State::HandshakingSendAddendum => {
                if self.addendum_offset < self.addendum_bytes.len() {
                    let outcome = self
                        .socket
                        .send_some(&self.addendum_bytes[self.addendum_offset..])?;
                    let mut progressed = false;
                    if let SendOutcome::Sent(sent) = outcome {
                        if sent > 0 {
                            self.addendum_offset += sent;
                            out.bytes_sent += sent;
                            self.last_progress_at = now;
                            progressed = true;
                        }
                    }
                    if self.addendum_offset < self.addendum_bytes.len() {
                        return Ok(progressed);
                    }
                }
                self.state = State::Ready;
                self.begin_next_request_if_needed(now);
                Ok(true)
            }

            State::Ready => Ok(self.begin_next_request_if_needed(now)),

            State::RequestSendQuery | State::RequestSendBlock | State::RequestSendEnd => {
                Ok(self.advance_send_phases(now))
            }

            State::RequestWaitForData | State::RequestWaitForEOS => {
                self.advance_wait_phases(now, out)
            }
        }
    }

    /// Moves to the next phase once the current TX segment is fully pushed.
    fn advance_send_phases(&mut self, now: Instant) -> bool {
        let phase = match self.phase {
            Some(phase) => phase,
            None => {
                self.state = State::Ready;
                return false;
            }
        };
        let request = match self.requests.front() {
            Some(request) => request,
            None => {
                self.state = State::Ready;
                return false;
            }
        };
        match self.tx_segment {
            Some(segment) if self.tx_offset >= segment.select(request).len() => {}
            _ => return false,
        }

        match phase {
            RequestPhase::SendingQuery => {
                self.phase = Some(RequestPhase::SendingQueryTerminator);
                self.tx_segment = Some(TxSegment::QueryTerminator);
                self.tx_offset = 0;
                self.state = State::RequestSendQuery;
            }
            RequestPhase::SendingQueryTerminator => {
                self.phase = Some(RequestPhase::WaitingForData);
                self.tx_segment = None;
                self.tx_offset = 0;
                self.state = State::RequestWaitForData;
            }
            RequestPhase::SendingBlock => {
                self.phase = Some(RequestPhase::SendingEnd);
                self.tx_segment = Some(TxSegment::End);
                self.tx_offset = 0;
                self.state = State::RequestSendEnd;
            }
            RequestPhase::SendingEnd => {
                self.phase = Some(RequestPhase::WaitingForEOS);
                self.tx_segment = None;
                self.tx_offset = 0;
                self.state = State::RequestWaitForEOS;
            }
            RequestPhase::WaitingForData | RequestPhase::WaitingForEOS => return false,
        }

        self.last_progress_at = now;
        true
    }

    /// Drains parsed packets from the ring. Packets unrelated to request
    /// completion count as progress but never advance the pipeline.
    fn advance_wait_phases(&mut self, now: Instant, out: &mut PollResult) -> Result<bool> {
        if self.phase.is_none() || self.requests.is_empty() {
            self.state = State::Ready;
            return Ok(false);
        }

        let mut progressed = false;
        loop {
            let event = match self
                .packet_state
                .advance(&mut self.inbox, self.server_info.revision)?
            {
                Some(event) => event,
                None => break,
            };
            progressed = true;
            self.last_progress_at = now;

            logging::trace!(self.log, "server packet"; "event" => ?event);

            match self.phase {
                Some(RequestPhase::WaitingForData) => match event {
                    PacketEvent::Data => {
                        self.phase = Some(RequestPhase::SendingBlock);
                        self.tx_segment = Some(TxSegment::DataBlock);
                        self.tx_offset = 0;
                        self.state = State::RequestSendBlock;
                        break;
                    }
                    PacketEvent::Exception(message) => {
                        // The schema for this INSERT never arrived; nothing
                        // queued behind it can proceed either.
                        let dropped = self.requests.len();
                        self.trip_breaker(now, &message);
                        out.requests_failed += dropped;
                        break;
                    }
                    _ => {}
                },
                Some(RequestPhase::WaitingForEOS) => match event {
                    PacketEvent::EndOfStream => {
                        logging::debug!(self.log, "request completed");
                        out.requests_completed += 1;
                        self.finish_current_request(now);
                        break;
                    }
                    PacketEvent::Exception(message) => {
                        logging::debug!(self.log, "request failed";
                                        "error" => %message);
                        out.requests_failed += 1;
                        self.finish_current_request(now);
                        break;
                    }
                    _ => {}
                },
                _ => break,
            }
        }

        Ok(progressed)
    }

    /// Pops the front request and either idles or starts the next one.
    fn finish_current_request(&mut self, now: Instant) {
        if let Some(request) = self.requests.pop_front() {
            self.inflight_bytes -= request.total_bytes;
        }

        self.phase = None;
        self.tx_segment = None;
        self.tx_offset = 0;
        self.state = State::Ready;
        self.begin_next_request_if_needed(now);
    }
}
