//! Resumable parsers over the receive ring. Every parser is a small state
//! value with an `advance` method that consumes whatever bytes are available
//! and reports whether the unit it is decoding completed. Returning "not yet"
//! is not an error; the caller re-enters with the same state once more bytes
//! arrive, and decoding resumes at the exact byte boundary it stopped at.

use crate::net::protocol;
use crate::net::result::{Error, Result};
use crate::net::ring::ByteRing;
use crate::net::wire::MAX_VARINT_BYTES;
use byteorder::{ByteOrder, LittleEndian};
use std::cmp::min;
use std::convert::TryFrom;
use std::mem;

/// Incremental decoder for an unsigned little-endian base-128 varint.
#[derive(Debug, Default)]
pub struct VarintState {
    value: u64,
    shift: u32,
    count: u8,
}

impl VarintState {
    #[inline]
    pub fn new() -> VarintState {
        VarintState::default()
    }

    #[inline]
    pub fn reset(&mut self) {
        self.value = 0;
        self.shift = 0;
        self.count = 0;
    }

    /// Consumes one byte at a time; returns the value once a byte without the
    /// continuation bit arrives. Rejects varints longer than ten bytes.
    pub fn advance(&mut self, ring: &mut ByteRing) -> Result<Option<u64>> {
        while let Some(byte) = ring.read_byte() {
            self.value |= u64::from(byte & 0x7F) << self.shift;
            self.shift += 7;
            self.count += 1;

            if byte & 0x80 == 0 {
                let value = self.value;
                self.reset();
                return Ok(Some(value));
            }
            if usize::from(self.count) >= MAX_VARINT_BYTES {
                return Err(Error::Protocol("invalid varint".to_string()));
            }
        }
        Ok(None)
    }
}

/// Incremental decoder for a length-prefixed string. In skip mode the bytes
/// are discarded; otherwise they accumulate for `take_string`.
#[derive(Debug)]
pub struct StringState {
    len_state: VarintState,
    remaining: u64,
    has_len: bool,
    skip: bool,
    value: Vec<u8>,
}

impl StringState {
    #[inline]
    pub fn new(skip: bool) -> StringState {
        StringState {
            len_state: VarintState::new(),
            remaining: 0,
            has_len: false,
            skip,
            value: Vec::new(),
        }
    }

    #[inline]
    pub fn reset(&mut self, skip: bool) {
        self.len_state.reset();
        self.remaining = 0;
        self.has_len = false;
        self.skip = skip;
        self.value.clear();
    }

    pub fn advance(&mut self, ring: &mut ByteRing) -> Result<bool> {
        if !self.has_len {
            let len = match self.len_state.advance(ring)? {
                Some(len) => len,
                None => return Ok(false),
            };
            if !self.skip {
                let len = usize::try_from(len)
                    .map_err(|_| Error::Protocol("string too long".to_string()))?;
                self.value.reserve(min(len, 1 << 20));
            }
            self.remaining = len;
            self.has_len = true;
        }

        while self.remaining > 0 {
            let n;
            {
                let span = ring.read_span();
                if span.is_empty() {
                    return Ok(false);
                }
                n = min(span.len() as u64, self.remaining) as usize;
                if !self.skip {
                    self.value.extend_from_slice(&span[..n]);
                }
            }
            ring.consume_read(n);
            self.remaining -= n as u64;
        }

        Ok(true)
    }

    /// The captured bytes, lossily decoded. Only meaningful after `advance`
    /// returned true in capture mode.
    #[inline]
    pub fn take_string(&mut self) -> String {
        String::from_utf8_lossy(&mem::replace(&mut self.value, Vec::new())).into_owned()
    }
}

/// Incremental skip of a known number of raw bytes.
#[derive(Debug, Default)]
pub struct SkipBytesState {
    remaining: u64,
}

impl SkipBytesState {
    #[inline]
    pub fn reset(&mut self, len: u64) {
        self.remaining = len;
    }

    pub fn advance(&mut self, ring: &mut ByteRing) -> bool {
        while self.remaining > 0 {
            let span_len = ring.read_span().len();
            if span_len == 0 {
                return false;
            }
            let n = min(span_len as u64, self.remaining) as usize;
            ring.consume_read(n);
            self.remaining -= n as u64;
        }
        true
    }
}

/// How to traverse one column's body without decoding its values.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SkipPlan {
    /// A fixed number of bytes per row.
    Fixed(u64),
    /// One length-prefixed string per row.
    String,
}

/// Derives the skip plan from a textual column type. Types without a known
/// wire representation yield `None`; the caller reports them as unsupported.
pub fn column_skip_plan(type_name: &str) -> Option<SkipPlan> {
    match type_name {
        "UInt8" | "Int8" | "Enum8" => return Some(SkipPlan::Fixed(1)),
        "UInt16" | "Int16" | "Enum16" | "Date" => return Some(SkipPlan::Fixed(2)),
        "UInt32" | "Int32" | "Float32" | "IPv4" | "Date32" | "DateTime" => {
            return Some(SkipPlan::Fixed(4))
        }
        "UInt64" | "Int64" | "Float64" => return Some(SkipPlan::Fixed(8)),
        "UUID" | "IPv6" => return Some(SkipPlan::Fixed(16)),
        "String" => return Some(SkipPlan::String),
        _ => {}
    }

    // Parameterised types: DateTime('Europe/Moscow'), DateTime64(6, 'UTC'),
    // Decimal32(4), FixedString(16) and friends.
    if type_name.starts_with("DateTime64(") {
        return Some(SkipPlan::Fixed(8));
    }
    if type_name.starts_with("DateTime(") {
        return Some(SkipPlan::Fixed(4));
    }
    if type_name.starts_with("Decimal32(") {
        return Some(SkipPlan::Fixed(4));
    }
    if type_name.starts_with("Decimal64(") {
        return Some(SkipPlan::Fixed(8));
    }
    if type_name.starts_with("Decimal128(") {
        return Some(SkipPlan::Fixed(16));
    }
    if let Some(rest) = type_name.strip_prefix("FixedString(") {
        let close = rest.find(')')?;
        return rest[..close].trim().parse::<u64>().ok().map(SkipPlan::Fixed);
    }

    None
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum BlockSkipStep {
    BlockInfoNum1,
    BlockInfoOverflow,
    BlockInfoNum2,
    BlockInfoBucketNum,
    BlockInfoNum0,
    NumColumns,
    NumRows,
    ColumnName,
    ColumnType,
    CustomFormatLen,
    CustomFormatBody,
    ColumnData,
    Done,
}

/// Traverses a server-sent block without materialising columns: block info,
/// column/row counts, per-column metadata, then the column bodies according
/// to the skip plans built from the type names.
#[derive(Debug)]
pub struct BlockSkipState {
    step: BlockSkipStep,
    varint: VarintState,
    str_state: StringState,
    row_str: StringState,
    skip: SkipBytesState,

    num_columns: u64,
    num_rows: u64,
    col_index: u64,
    custom_len: u8,

    plans: Vec<SkipPlan>,
    data_plan_index: usize,
    row_index: u64,
}

impl BlockSkipState {
    pub fn new() -> BlockSkipState {
        BlockSkipState {
            step: BlockSkipStep::NumColumns,
            varint: VarintState::new(),
            str_state: StringState::new(true),
            row_str: StringState::new(true),
            skip: SkipBytesState::default(),
            num_columns: 0,
            num_rows: 0,
            col_index: 0,
            custom_len: 0,
            plans: Vec::new(),
            data_plan_index: 0,
            row_index: 0,
        }
    }

    pub fn reset_for_new_block(&mut self, has_block_info: bool) {
        self.step = if has_block_info {
            BlockSkipStep::BlockInfoNum1
        } else {
            BlockSkipStep::NumColumns
        };
        self.varint.reset();
        self.str_state.reset(true);
        self.row_str.reset(true);
        self.skip.reset(0);
        self.num_columns = 0;
        self.num_rows = 0;
        self.col_index = 0;
        self.custom_len = 0;
        self.plans.clear();
        self.data_plan_index = 0;
        self.row_index = 0;
    }

    pub fn advance(&mut self, ring: &mut ByteRing, server_revision: u64) -> Result<bool> {
        let has_custom_serialization =
            server_revision >= protocol::MIN_REVISION_WITH_CUSTOM_SERIALIZATION;

        loop {
            match self.step {
                BlockSkipStep::BlockInfoNum1 => {
                    if self.varint.advance(ring)?.is_none() {
                        return Ok(false);
                    }
                    self.step = BlockSkipStep::BlockInfoOverflow;
                }
                BlockSkipStep::BlockInfoOverflow => {
                    if ring.read_byte().is_none() {
                        return Ok(false);
                    }
                    self.step = BlockSkipStep::BlockInfoNum2;
                }
                BlockSkipStep::BlockInfoNum2 => {
                    if self.varint.advance(ring)?.is_none() {
                        return Ok(false);
                    }
                    self.step = BlockSkipStep::BlockInfoBucketNum;
                }
                BlockSkipStep::BlockInfoBucketNum => {
                    if ring.len() < 4 {
                        return Ok(false);
                    }
                    let mut buf = [0u8; 4];
                    ring.read(&mut buf);
                    self.step = BlockSkipStep::BlockInfoNum0;
                }
                BlockSkipStep::BlockInfoNum0 => {
                    if self.varint.advance(ring)?.is_none() {
                        return Ok(false);
                    }
                    self.step = BlockSkipStep::NumColumns;
                }
                BlockSkipStep::NumColumns => {
                    self.num_columns = match self.varint.advance(ring)? {
                        Some(value) => value,
                        None => return Ok(false),
                    };
                    self.plans.clear();
                    self.step = BlockSkipStep::NumRows;
                }
                BlockSkipStep::NumRows => {
                    self.num_rows = match self.varint.advance(ring)? {
                        Some(value) => value,
                        None => return Ok(false),
                    };
                    self.col_index = 0;
                    self.str_state.reset(true);
                    self.step = if self.num_columns == 0 {
                        BlockSkipStep::Done
                    } else {
                        BlockSkipStep::ColumnName
                    };
                }
                BlockSkipStep::ColumnName => {
                    if !self.str_state.advance(ring)? {
                        return Ok(false);
                    }
                    self.str_state.reset(false);
                    self.step = BlockSkipStep::ColumnType;
                }
                BlockSkipStep::ColumnType => {
                    if !self.str_state.advance(ring)? {
                        return Ok(false);
                    }
                    let type_name = self.str_state.take_string();
                    self.str_state.reset(true);

                    let plan = column_skip_plan(&type_name).ok_or_else(|| {
                        Error::Unimplemented(format!(
                            "unsupported column type in server block: {}",
                            type_name
                        ))
                    })?;
                    self.plans.push(plan);

                    if has_custom_serialization {
                        self.step = BlockSkipStep::CustomFormatLen;
                    } else {
                        self.advance_column();
                    }
                }
                BlockSkipStep::CustomFormatLen => {
                    self.custom_len = match ring.read_byte() {
                        Some(byte) => byte,
                        None => return Ok(false),
                    };
                    if self.custom_len > 0 {
                        self.skip.reset(u64::from(self.custom_len));
                        self.step = BlockSkipStep::CustomFormatBody;
                    } else {
                        self.advance_column();
                    }
                }
                BlockSkipStep::CustomFormatBody => {
                    if !self.skip.advance(ring) {
                        return Ok(false);
                    }
                    self.custom_len = 0;
                    self.advance_column();
                }
                BlockSkipStep::ColumnData => {
                    if self.num_rows == 0 || self.plans.is_empty() {
                        self.step = BlockSkipStep::Done;
                        continue;
                    }
                    while self.data_plan_index < self.plans.len() {
                        match self.plans[self.data_plan_index] {
                            SkipPlan::Fixed(bytes_per_row) => {
                                if self.skip.remaining == 0 {
                                    let bytes =
                                        self.num_rows.checked_mul(bytes_per_row).ok_or_else(
                                            || Error::Protocol("column data too large".to_string()),
                                        )?;
                                    self.skip.reset(bytes);
                                }
                                if !self.skip.advance(ring) {
                                    return Ok(false);
                                }
                            }
                            SkipPlan::String => {
                                while self.row_index < self.num_rows {
                                    if !self.row_str.advance(ring)? {
                                        return Ok(false);
                                    }
                                    self.row_str.reset(true);
                                    self.row_index += 1;
                                }
                                self.row_index = 0;
                            }
                        }
                        self.data_plan_index += 1;
                    }
                    self.step = BlockSkipStep::Done;
                }
                BlockSkipStep::Done => return Ok(true),
            }
        }
    }

    /// Moves on to the next column's metadata, or to the data section once
    /// all columns have been described.
    #[inline]
    fn advance_column(&mut self) {
        self.col_index += 1;
        self.step = if self.col_index >= self.num_columns {
            BlockSkipStep::ColumnData
        } else {
            BlockSkipStep::ColumnName
        };
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum ExceptionStep {
    Code,
    Name,
    DisplayText,
    StackTrace,
    HasNested,
    Done,
}

/// Parses a server exception packet. Nested exceptions are traversed fully
/// but only the outermost display text is kept.
#[derive(Debug)]
pub struct ExceptionState {
    step: ExceptionStep,
    str_state: StringState,
    pub code: i32,
    pub display_text: String,
}

impl ExceptionState {
    pub fn new() -> ExceptionState {
        ExceptionState {
            step: ExceptionStep::Code,
            str_state: StringState::new(true),
            code: 0,
            display_text: String::new(),
        }
    }

    pub fn reset(&mut self) {
        self.step = ExceptionStep::Code;
        self.str_state.reset(true);
        self.code = 0;
        self.display_text.clear();
    }

    pub fn advance(&mut self, ring: &mut ByteRing) -> Result<bool> {
        loop {
            match self.step {
                ExceptionStep::Code => {
                    if ring.len() < 4 {
                        return Ok(false);
                    }
                    let mut buf = [0u8; 4];
                    ring.read(&mut buf);
                    self.code = LittleEndian::read_i32(&buf);
                    self.str_state.reset(true);
                    self.step = ExceptionStep::Name;
                }
                ExceptionStep::Name => {
                    if !self.str_state.advance(ring)? {
                        return Ok(false);
                    }
                    self.str_state.reset(false);
                    self.step = ExceptionStep::DisplayText;
                }
                ExceptionStep::DisplayText => {
                    if !self.str_state.advance(ring)? {
                        return Ok(false);
                    }
                    if self.display_text.is_empty() {
                        self.display_text = self.str_state.take_string();
                    }
                    self.str_state.reset(true);
                    self.step = ExceptionStep::StackTrace;
                }
                ExceptionStep::StackTrace => {
                    if !self.str_state.advance(ring)? {
                        return Ok(false);
                    }
                    self.str_state.reset(true);
                    self.step = ExceptionStep::HasNested;
                }
                ExceptionStep::HasNested => {
                    let has_nested = match ring.read_byte() {
                        Some(byte) => byte != 0,
                        None => return Ok(false),
                    };
                    self.step = if has_nested {
                        ExceptionStep::Code
                    } else {
                        ExceptionStep::Done
                    };
                }
                ExceptionStep::Done => return Ok(true),
            }
        }
    }
}

/// Identity of the server as reported in its Hello reply.
#[derive(Debug, Clone, Default)]
pub struct ServerInfo {
    pub name: String,
    pub timezone: String,
    pub display_name: String,
    pub version_major: u64,
    pub version_minor: u64,
    pub version_patch: u64,
    pub revision: u64,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum HelloStep {
    PacketType,
    Name,
    VersionMajor,
    VersionMinor,
    Revision,
    Timezone,
    DisplayName,
    VersionPatch,
    Exception,
    Done,
}

#[derive(Debug)]
pub enum HelloParse {
    NeedMore,
    Done,
    Exception(String),
}

/// Parses the server's reply to the client Hello. Optional trailing fields
/// are gated on the revision the server just reported.
#[derive(Debug)]
pub struct HelloState {
    step: HelloStep,
    varint: VarintState,
    str_state: StringState,
    exception: ExceptionState,
}

impl HelloState {
    pub fn new() -> HelloState {
        HelloState {
            step: HelloStep::PacketType,
            varint: VarintState::new(),
            str_state: StringState::new(true),
            exception: ExceptionState::new(),
        }
    }

    pub fn reset(&mut self) {
        self.step = HelloStep::PacketType;
        self.varint.reset();
        self.str_state.reset(true);
        self.exception.reset();
    }

    pub fn advance(&mut self, ring: &mut ByteRing, out: &mut ServerInfo) -> Result<HelloParse> {
        loop {
            match self.step {
                HelloStep::PacketType => {
                    let packet_type = match self.varint.advance(ring)? {
                        Some(value) => value,
                        None => return Ok(HelloParse::NeedMore),
                    };
                    if packet_type == u64::from(protocol::ServerCode::Hello) {
                        self.str_state.reset(false);
                        self.step = HelloStep::Name;
                    } else if packet_type == u64::from(protocol::ServerCode::Exception) {
                        self.exception.reset();
                        self.step = HelloStep::Exception;
                    } else {
                        return Err(Error::Protocol(
                            "unexpected packet during handshake".to_string(),
                        ));
                    }
                }
                HelloStep::Exception => {
                    if !self.exception.advance(ring)? {
                        return Ok(HelloParse::NeedMore);
                    }
                    let message = if self.exception.display_text.is_empty() {
                        "server exception".to_string()
                    } else {
                        mem::replace(&mut self.exception.display_text, String::new())
                    };
                    self.reset();
                    return Ok(HelloParse::Exception(message));
                }
                HelloStep::Name => {
                    if !self.str_state.advance(ring)? {
                        return Ok(HelloParse::NeedMore);
                    }
                    out.name = self.str_state.take_string();
                    self.str_state.reset(true);
                    self.step = HelloStep::VersionMajor;
                }
                HelloStep::VersionMajor => {
                    out.version_major = match self.varint.advance(ring)? {
                        Some(value) => value,
                        None => return Ok(HelloParse::NeedMore),
                    };
                    self.step = HelloStep::VersionMinor;
                }
                HelloStep::VersionMinor => {
                    out.version_minor = match self.varint.advance(ring)? {
                        Some(value) => value,
                        None => return Ok(HelloParse::NeedMore),
                    };
                    self.step = HelloStep::Revision;
                }
                HelloStep::Revision => {
                    out.revision = match self.varint.advance(ring)? {
                        Some(value) => value,
                        None => return Ok(HelloParse::NeedMore),
                    };
                    if out.revision >= protocol::MIN_REVISION_WITH_SERVER_TIMEZONE {
                        self.str_state.reset(false);
                        self.step = HelloStep::Timezone;
                    } else if out.revision >= protocol::MIN_REVISION_WITH_SERVER_DISPLAY_NAME {
                        self.str_state.reset(false);
                        self.step = HelloStep::DisplayName;
                    } else if out.revision >= protocol::MIN_REVISION_WITH_VERSION_PATCH {
                        self.step = HelloStep::VersionPatch;
                    } else {
                        self.step = HelloStep::Done;
                    }
                }
                HelloStep::Timezone => {
                    if !self.str_state.advance(ring)? {
                        return Ok(HelloParse::NeedMore);
                    }
                    out.timezone = self.str_state.take_string();
                    self.str_state.reset(true);
                    if out.revision >= protocol::MIN_REVISION_WITH_SERVER_DISPLAY_NAME {
                        self.str_state.reset(false);
                        self.step = HelloStep::DisplayName;
                    } else if out.revision >= protocol::MIN_REVISION_WITH_VERSION_PATCH {
                        self.step = HelloStep::VersionPatch;
                    } else {
                        self.step = HelloStep::Done;
                    }
                }
                HelloStep::DisplayName => {
                    if !self.str_state.advance(ring)? {
                        return Ok(HelloParse::NeedMore);
                    }
                    out.display_name = self.str_state.take_string();
                    self.str_state.reset(true);
                    self.step = if out.revision >= protocol::MIN_REVISION_WITH_VERSION_PATCH {
                        HelloStep::VersionPatch
                    } else {
                        HelloStep::Done
                    };
                }
                HelloStep::VersionPatch => {
                    out.version_patch = match self.varint.advance(ring)? {
                        Some(value) => value,
                        None => return Ok(HelloParse::NeedMore),
                    };
                    self.step = HelloStep::Done;
                }
                HelloStep::Done => {
                    self.reset();
                    return Ok(HelloParse::Done);
                }
            }
        }
    }
}

/// A fully parsed server packet, reduced to what the request pipeline needs
/// to know about it.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum PacketEvent {
    Data,
    EndOfStream,
    Exception(String),
    Other,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum PacketKind {
    PacketType,
    Progress,
    Data,
    Exception,
    Log,
    ProfileInfo,
    TableColumns,
    ProfileEvents,
}

/// The top-level packet dispatcher. Reads the leading code varint and hands
/// off to the per-packet sub-state; after emitting an event it resets itself
/// so one `poll` can drain several packets from the ring.
#[derive(Debug)]
pub struct PacketState {
    kind: PacketKind,
    varint: VarintState,
    string: StringState,
    block: BlockSkipState,
    exception: ExceptionState,
    step: u8,
    progress_step: u8,
    profile_step: u8,
}

impl PacketState {
    pub fn new() -> PacketState {
        PacketState {
            kind: PacketKind::PacketType,
            varint: VarintState::new(),
            string: StringState::new(true),
            block: BlockSkipState::new(),
            exception: ExceptionState::new(),
            step: 0,
            progress_step: 0,
            profile_step: 0,
        }
    }

    pub fn reset(&mut self) {
        self.kind = PacketKind::PacketType;
        self.varint.reset();
        self.string.reset(true);
        self.block.reset_for_new_block(false);
        self.exception.reset();
        self.step = 0;
        self.progress_step = 0;
        self.profile_step = 0;
    }

    pub fn advance(
        &mut self,
        ring: &mut ByteRing,
        server_revision: u64,
    ) -> Result<Option<PacketEvent>> {
        let has_block_info = server_revision >= protocol::MIN_REVISION_WITH_BLOCK_INFO;

        loop {
            match self.kind {
                PacketKind::PacketType => {
                    let packet_type = match self.varint.advance(ring)? {
                        Some(value) => value,
                        None => return Ok(None),
                    };
                    match protocol::ServerCode::from_u64(packet_type) {
                        Some(protocol::ServerCode::Data) => {
                            self.kind = PacketKind::Data;
                            self.step = 0;
                            self.string.reset(true);
                            self.block.reset_for_new_block(has_block_info);
                        }
                        Some(protocol::ServerCode::Progress) => {
                            self.kind = PacketKind::Progress;
                            self.progress_step = 0;
                        }
                        Some(protocol::ServerCode::Exception) => {
                            self.kind = PacketKind::Exception;
                            self.exception.reset();
                        }
                        Some(protocol::ServerCode::EndOfStream) => {
                            self.reset();
                            return Ok(Some(PacketEvent::EndOfStream));
                        }
                        Some(protocol::ServerCode::Log) => {
                            self.kind = PacketKind::Log;
                            self.step = 0;
                            self.string.reset(true);
                            self.block.reset_for_new_block(has_block_info);
                        }
                        Some(protocol::ServerCode::ProfileInfo) => {
                            self.kind = PacketKind::ProfileInfo;
                            self.profile_step = 0;
                        }
                        Some(protocol::ServerCode::TableColumns) => {
                            self.kind = PacketKind::TableColumns;
                            self.step = 0;
                            self.string.reset(true);
                        }
                        Some(protocol::ServerCode::ProfileEvents) => {
                            self.kind = PacketKind::ProfileEvents;
                            self.step = 0;
                            self.string.reset(true);
                            self.block.reset_for_new_block(has_block_info);
                        }
                        Some(protocol::ServerCode::Hello) | Some(protocol::ServerCode::Pong) => {
                            // Should not appear mid-stream, but tolerated.
                            self.reset();
                            return Ok(Some(PacketEvent::Other));
                        }
                        _ => {
                            return Err(Error::Unimplemented(format!(
                                "unimplemented server packet {}",
                                packet_type
                            )));
                        }
                    }
                }
                PacketKind::Data => {
                    if self.step == 0 {
                        if server_revision >= protocol::MIN_REVISION_WITH_TEMPORARY_TABLES {
                            if !self.string.advance(ring)? {
                                return Ok(None);
                            }
                        }
                        self.step = 1;
                    }
                    if !self.block.advance(ring, server_revision)? {
                        return Ok(None);
                    }
                    self.reset();
                    return Ok(Some(PacketEvent::Data));
                }
                PacketKind::Progress => {
                    // rows, bytes and total_rows are always present at the
                    // revision this client advertises; the written_* pair is
                    // gated on the server revision.
                    if self.progress_step == 0 {
                        if self.varint.advance(ring)?.is_none() {
                            return Ok(None);
                        }
                        self.progress_step = 1;
                    }
                    if self.progress_step == 1 {
                        if self.varint.advance(ring)?.is_none() {
                            return Ok(None);
                        }
                        self.progress_step = 2;
                    }
                    if self.progress_step == 2 {
                        if self.varint.advance(ring)?.is_none() {
                            return Ok(None);
                        }
                        self.progress_step = 3;
                    }
                    if server_revision >= protocol::MIN_REVISION_WITH_CLIENT_WRITE_INFO {
                        if self.progress_step == 3 {
                            if self.varint.advance(ring)?.is_none() {
                                return Ok(None);
                            }
                            self.progress_step = 4;
                        }
                        if self.progress_step == 4 {
                            if self.varint.advance(ring)?.is_none() {
                                return Ok(None);
                            }
                        }
                    }
                    self.reset();
                    return Ok(Some(PacketEvent::Other));
                }
                PacketKind::Exception => {
                    if !self.exception.advance(ring)? {
                        return Ok(None);
                    }
                    let message = if self.exception.display_text.is_empty() {
                        "server exception".to_string()
                    } else {
                        mem::replace(&mut self.exception.display_text, String::new())
                    };
                    self.reset();
                    return Ok(Some(PacketEvent::Exception(message)));
                }
                PacketKind::Log => {
                    if self.step == 0 {
                        if !self.string.advance(ring)? {
                            return Ok(None);
                        }
                        self.step = 1;
                    }
                    if !self.block.advance(ring, server_revision)? {
                        return Ok(None);
                    }
                    self.reset();
                    return Ok(Some(PacketEvent::Other));
                }
                PacketKind::ProfileInfo => {
                    // rows, blocks, bytes, applied_limit, rows_before_limit,
                    // calculated_rows_before_limit.
                    if self.profile_step == 0 {
                        if self.varint.advance(ring)?.is_none() {
                            return Ok(None);
                        }
                        self.profile_step = 1;
                    }
                    if self.profile_step == 1 {
                        if self.varint.advance(ring)?.is_none() {
                            return Ok(None);
                        }
                        self.profile_step = 2;
                    }
                    if self.profile_step == 2 {
                        if self.varint.advance(ring)?.is_none() {
                            return Ok(None);
                        }
                        self.profile_step = 3;
                    }
                    if self.profile_step == 3 {
                        if ring.read_byte().is_none() {
                            return Ok(None);
                        }
                        self.profile_step = 4;
                    }
                    if self.profile_step == 4 {
                        if self.varint.advance(ring)?.is_none() {
                            return Ok(None);
                        }
                        self.profile_step = 5;
                    }
                    if self.profile_step == 5 {
                        if ring.read_byte().is_none() {
                            return Ok(None);
                        }
                    }
                    self.reset();
                    return Ok(Some(PacketEvent::Other));
                }
                PacketKind::TableColumns => {
                    if self.step == 0 {
                        if !self.string.advance(ring)? {
                            return Ok(None);
                        }
                        self.string.reset(true);
                        self.step = 1;
                    }
                    if !self.string.advance(ring)? {
                        return Ok(None);
                    }
                    self.reset();
                    return Ok(Some(PacketEvent::Other));
                }
                PacketKind::ProfileEvents => {
                    if self.step == 0 {
                        if !self.string.advance(ring)? {
                            return Ok(None);
                        }
                        self.step = 1;
                    }
                    if !self.block.advance(ring, server_revision)? {
                        return Ok(None);
                    }
                    self.reset();
                    return Ok(Some(PacketEvent::Other));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::wire::{write_string, write_varint64};
    use byteorder::WriteBytesExt;

    const REVISION: u64 = protocol::MIN_REVISION_WITH_PARAMETERS;

    fn varint(value: u64) -> Vec<u8> {
        let mut out = Vec::new();
        write_varint64(&mut out, value).unwrap();
        out
    }

    fn string(value: &str) -> Vec<u8> {
        let mut out = Vec::new();
        write_string(&mut out, value.as_bytes()).unwrap();
        out
    }

    fn block_header(num_columns: u64, num_rows: u64) -> Vec<u8> {
        let mut out = Vec::new();
        // Block info: field 1 + overflow flag, field 2 + bucket number, end.
        write_varint64(&mut out, 1).unwrap();
        out.write_u8(0).unwrap();
        write_varint64(&mut out, 2).unwrap();
        out.write_i32::<LittleEndian>(-1).unwrap();
        write_varint64(&mut out, 0).unwrap();
        write_varint64(&mut out, num_columns).unwrap();
        write_varint64(&mut out, num_rows).unwrap();
        out
    }

    fn column_meta(name: &str, type_name: &str) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&string(name));
        out.extend_from_slice(&string(type_name));
        out.write_u8(0).unwrap();
        out
    }

    fn exception_packet(code: i32, display_text: &str, nested: Option<&str>) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&varint(protocol::ServerCode::Exception.into()));
        out.write_i32::<LittleEndian>(code).unwrap();
        out.extend_from_slice(&string("DB::Exception"));
        out.extend_from_slice(&string(display_text));
        out.extend_from_slice(&string(""));
        match nested {
            Some(inner) => {
                out.write_u8(1).unwrap();
                out.write_i32::<LittleEndian>(code + 1).unwrap();
                out.extend_from_slice(&string("DB::Exception"));
                out.extend_from_slice(&string(inner));
                out.extend_from_slice(&string(""));
                out.write_u8(0).unwrap();
            }
            None => out.write_u8(0).unwrap(),
        }
        out
    }

    fn feed_all(bytes: &[u8]) -> ByteRing {
        let mut ring = ByteRing::new(bytes.len().max(1));
        assert_eq!(ring.write(bytes), bytes.len());
        ring
    }

    /// Runs the dispatcher over `bytes`, feeding `chunk` bytes at a time, and
    /// collects every emitted event.
    fn dispatch_chunked(bytes: &[u8], chunk: usize) -> Vec<PacketEvent> {
        let mut ring = ByteRing::new(bytes.len().max(1));
        let mut state = PacketState::new();
        let mut events = Vec::new();
        let mut offset = 0;

        while offset < bytes.len() || !ring.is_empty() {
            if offset < bytes.len() {
                let n = chunk.min(bytes.len() - offset);
                offset += ring.write(&bytes[offset..offset + n]);
            }
            while let Some(event) = state.advance(&mut ring, REVISION).unwrap() {
                events.push(event);
            }
        }
        events
    }

    #[test]
    fn test_varint_single_bytes() {
        let mut ring = ByteRing::new(8);
        let mut state = VarintState::new();

        for (i, byte) in [0xE5u8, 0x8E, 0x26].iter().enumerate() {
            ring.write(&[*byte]);
            let result = state.advance(&mut ring).unwrap();
            if i < 2 {
                assert_eq!(result, None);
            } else {
                assert_eq!(result, Some(624_485));
            }
        }
    }

    #[test]
    fn test_varint_roundtrip() {
        let values = [
            0u64,
            1,
            127,
            128,
            300,
            624_485,
            u64::from(u32::max_value()),
            u64::max_value(),
        ];
        for &value in &values {
            let bytes = varint(value);
            let mut ring = feed_all(&bytes);
            let mut state = VarintState::new();
            assert_eq!(state.advance(&mut ring).unwrap(), Some(value));
            assert!(ring.is_empty());
        }
    }

    #[test]
    fn test_varint_overlong_rejected() {
        let mut ring = feed_all(&[0xFF; 10]);
        let mut state = VarintState::new();
        match state.advance(&mut ring) {
            Err(Error::Protocol(msg)) => assert_eq!(msg, "invalid varint"),
            other => panic!("Unexpected result {:?}", other),
        }
    }

    #[test]
    fn test_string_capture_and_skip() {
        let bytes = string("hello");

        let mut ring = feed_all(&bytes);
        let mut state = StringState::new(false);
        assert!(state.advance(&mut ring).unwrap());
        assert_eq!(state.take_string(), "hello");

        let mut ring = feed_all(&bytes);
        let mut state = StringState::new(true);
        assert!(state.advance(&mut ring).unwrap());
        assert!(ring.is_empty());
    }

    #[test]
    fn test_string_resumes_across_boundaries() {
        let bytes = string("boundary");
        let mut ring = ByteRing::new(16);
        let mut state = StringState::new(false);

        for &byte in &bytes[..bytes.len() - 1] {
            ring.write(&[byte]);
            assert!(!state.advance(&mut ring).unwrap());
        }
        ring.write(&bytes[bytes.len() - 1..]);
        assert!(state.advance(&mut ring).unwrap());
        assert_eq!(state.take_string(), "boundary");
    }

    #[test]
    fn test_skip_plans() {
        assert_eq!(column_skip_plan("UInt8"), Some(SkipPlan::Fixed(1)));
        assert_eq!(column_skip_plan("Int8"), Some(SkipPlan::Fixed(1)));
        assert_eq!(column_skip_plan("Enum8"), Some(SkipPlan::Fixed(1)));
        assert_eq!(column_skip_plan("UInt16"), Some(SkipPlan::Fixed(2)));
        assert_eq!(column_skip_plan("Enum16"), Some(SkipPlan::Fixed(2)));
        assert_eq!(column_skip_plan("Date"), Some(SkipPlan::Fixed(2)));
        assert_eq!(column_skip_plan("UInt32"), Some(SkipPlan::Fixed(4)));
        assert_eq!(column_skip_plan("Float32"), Some(SkipPlan::Fixed(4)));
        assert_eq!(column_skip_plan("IPv4"), Some(SkipPlan::Fixed(4)));
        assert_eq!(column_skip_plan("Date32"), Some(SkipPlan::Fixed(4)));
        assert_eq!(column_skip_plan("DateTime"), Some(SkipPlan::Fixed(4)));
        assert_eq!(
            column_skip_plan("DateTime('Europe/Moscow')"),
            Some(SkipPlan::Fixed(4))
        );
        assert_eq!(column_skip_plan("UInt64"), Some(SkipPlan::Fixed(8)));
        assert_eq!(column_skip_plan("Float64"), Some(SkipPlan::Fixed(8)));
        assert_eq!(
            column_skip_plan("DateTime64(6, 'UTC')"),
            Some(SkipPlan::Fixed(8))
        );
        assert_eq!(column_skip_plan("UUID"), Some(SkipPlan::Fixed(16)));
        assert_eq!(column_skip_plan("IPv6"), Some(SkipPlan::Fixed(16)));
        assert_eq!(column_skip_plan("Decimal32(4)"), Some(SkipPlan::Fixed(4)));
        assert_eq!(column_skip_plan("Decimal64(8)"), Some(SkipPlan::Fixed(8)));
        assert_eq!(
            column_skip_plan("Decimal128(10)"),
            Some(SkipPlan::Fixed(16))
        );
        assert_eq!(
            column_skip_plan("FixedString(7)"),
            Some(SkipPlan::Fixed(7))
        );
        assert_eq!(column_skip_plan("String"), Some(SkipPlan::String));
        assert_eq!(column_skip_plan("Array(UInt8)"), None);
        assert_eq!(column_skip_plan("FixedString(x)"), None);
        assert_eq!(column_skip_plan("LowCardinality(String)"), None);
    }

    #[test]
    fn test_block_skip_fixed_columns() {
        let mut bytes = block_header(2, 3);
        bytes.extend_from_slice(&column_meta("id", "UInt64"));
        bytes.extend_from_slice(&column_meta("flag", "UInt8"));
        bytes.extend_from_slice(&[0u8; 24]); // id data
        bytes.extend_from_slice(&[0u8; 3]); // flag data

        let mut ring = feed_all(&bytes);
        let mut state = BlockSkipState::new();
        state.reset_for_new_block(true);
        assert!(state.advance(&mut ring, REVISION).unwrap());
        assert!(ring.is_empty());
    }

    #[test]
    fn test_block_skip_unknown_type() {
        let mut bytes = block_header(1, 1);
        bytes.extend_from_slice(&column_meta("arr", "Array(UInt8)"));

        let mut ring = feed_all(&bytes);
        let mut state = BlockSkipState::new();
        state.reset_for_new_block(true);
        match state.advance(&mut ring, REVISION) {
            Err(Error::Unimplemented(msg)) => assert!(msg.contains("Array(UInt8)")),
            other => panic!("Unexpected result {:?}", other),
        }
    }

    #[test]
    fn test_exception_nested_keeps_outer_text() {
        let bytes = exception_packet(60, "outer", Some("inner"));
        let mut ring = feed_all(&bytes[1..]); // strip the packet code
        let mut state = ExceptionState::new();
        assert!(state.advance(&mut ring).unwrap());
        assert_eq!(state.code, 61); // code of the innermost parsed frame
        assert_eq!(state.display_text, "outer");
        assert!(ring.is_empty());
    }

    #[test]
    fn test_hello_full_fields() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&varint(protocol::ServerCode::Hello.into()));
        bytes.extend_from_slice(&string("ClickHouse"));
        bytes.extend_from_slice(&varint(23));
        bytes.extend_from_slice(&varint(8));
        bytes.extend_from_slice(&varint(REVISION));
        bytes.extend_from_slice(&string("UTC"));
        bytes.extend_from_slice(&string("prod-1"));
        bytes.extend_from_slice(&varint(2));

        let mut info = ServerInfo::default();
        let mut state = HelloState::new();

        // One byte at a time; the parser must resume at every boundary.
        let mut ring = ByteRing::new(bytes.len());
        for &byte in &bytes[..bytes.len() - 1] {
            ring.write(&[byte]);
            match state.advance(&mut ring, &mut info).unwrap() {
                HelloParse::NeedMore => {}
                other => panic!("Unexpected result {:?}", other),
            }
        }
        ring.write(&bytes[bytes.len() - 1..]);
        match state.advance(&mut ring, &mut info).unwrap() {
            HelloParse::Done => {}
            other => panic!("Unexpected result {:?}", other),
        }

        assert_eq!(info.name, "ClickHouse");
        assert_eq!(info.version_major, 23);
        assert_eq!(info.version_minor, 8);
        assert_eq!(info.version_patch, 2);
        assert_eq!(info.revision, REVISION);
        assert_eq!(info.timezone, "UTC");
        assert_eq!(info.display_name, "prod-1");
    }

    #[test]
    fn test_hello_old_revision_skips_gated_fields() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&varint(protocol::ServerCode::Hello.into()));
        bytes.extend_from_slice(&string("ClickHouse"));
        bytes.extend_from_slice(&varint(1));
        bytes.extend_from_slice(&varint(1));
        bytes.extend_from_slice(&varint(50000));

        let mut ring = feed_all(&bytes);
        let mut info = ServerInfo::default();
        let mut state = HelloState::new();
        match state.advance(&mut ring, &mut info).unwrap() {
            HelloParse::Done => {}
            other => panic!("Unexpected result {:?}", other),
        }
        assert_eq!(info.revision, 50000);
        assert!(info.timezone.is_empty());
        assert!(info.display_name.is_empty());
    }

    #[test]
    fn test_hello_rejects_unexpected_packet() {
        let bytes = varint(protocol::ServerCode::Progress.into());
        let mut ring = feed_all(&bytes);
        let mut info = ServerInfo::default();
        let mut state = HelloState::new();
        match state.advance(&mut ring, &mut info) {
            Err(Error::Protocol(msg)) => assert_eq!(msg, "unexpected packet during handshake"),
            other => panic!("Unexpected result {:?}", other),
        }
    }

    #[test]
    fn test_hello_exception_reply() {
        let bytes = exception_packet(516, "Authentication failed", None);
        let mut ring = feed_all(&bytes);
        let mut info = ServerInfo::default();
        let mut state = HelloState::new();
        match state.advance(&mut ring, &mut info).unwrap() {
            HelloParse::Exception(msg) => assert_eq!(msg, "Authentication failed"),
            other => panic!("Unexpected result {:?}", other),
        }
    }

    fn data_packet_with_string_column(rows: &[&str]) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&varint(protocol::ServerCode::Data.into()));
        bytes.extend_from_slice(&string("")); // temporary table name
        bytes.extend_from_slice(&block_header(1, rows.len() as u64));
        bytes.extend_from_slice(&column_meta("s", "String"));
        for row in rows {
            bytes.extend_from_slice(&string(row));
        }
        bytes
    }

    #[test]
    fn test_dispatcher_data_then_eos() {
        let mut bytes = data_packet_with_string_column(&["a", "bb", ""]);
        bytes.extend_from_slice(&varint(protocol::ServerCode::EndOfStream.into()));

        let mut ring = feed_all(&bytes);
        let mut state = PacketState::new();

        assert_eq!(
            state.advance(&mut ring, REVISION).unwrap(),
            Some(PacketEvent::Data)
        );
        assert_eq!(
            state.advance(&mut ring, REVISION).unwrap(),
            Some(PacketEvent::EndOfStream)
        );
        assert_eq!(ring.len(), 0);
    }

    #[test]
    fn test_dispatcher_chunk_invariance() {
        let mut bytes = Vec::new();
        // Progress packet.
        bytes.extend_from_slice(&varint(protocol::ServerCode::Progress.into()));
        for value in &[10u64, 1024, 100, 5, 512] {
            bytes.extend_from_slice(&varint(*value));
        }
        // Data packet with a mixed block.
        bytes.extend_from_slice(&varint(protocol::ServerCode::Data.into()));
        bytes.extend_from_slice(&string(""));
        bytes.extend_from_slice(&block_header(2, 2));
        bytes.extend_from_slice(&column_meta("id", "UInt64"));
        bytes.extend_from_slice(&column_meta("name", "String"));
        bytes.extend_from_slice(&[0u8; 16]);
        bytes.extend_from_slice(&string("x"));
        bytes.extend_from_slice(&string("yz"));
        // ProfileInfo packet.
        bytes.extend_from_slice(&varint(protocol::ServerCode::ProfileInfo.into()));
        bytes.extend_from_slice(&varint(2));
        bytes.extend_from_slice(&varint(1));
        bytes.extend_from_slice(&varint(128));
        bytes.push(0);
        bytes.extend_from_slice(&varint(0));
        bytes.push(0);
        // TableColumns packet.
        bytes.extend_from_slice(&varint(protocol::ServerCode::TableColumns.into()));
        bytes.extend_from_slice(&string(""));
        bytes.extend_from_slice(&string("columns format version: 1"));
        // Log packet.
        bytes.extend_from_slice(&varint(protocol::ServerCode::Log.into()));
        bytes.extend_from_slice(&string(""));
        bytes.extend_from_slice(&block_header(1, 1));
        bytes.extend_from_slice(&column_meta("text", "String"));
        bytes.extend_from_slice(&string("log line"));
        // ProfileEvents packet.
        bytes.extend_from_slice(&varint(protocol::ServerCode::ProfileEvents.into()));
        bytes.extend_from_slice(&string(""));
        bytes.extend_from_slice(&block_header(1, 2));
        bytes.extend_from_slice(&column_meta("value", "Int64"));
        bytes.extend_from_slice(&[0u8; 16]);
        // Pong, then EndOfStream.
        bytes.extend_from_slice(&varint(protocol::ServerCode::Pong.into()));
        bytes.extend_from_slice(&varint(protocol::ServerCode::EndOfStream.into()));

        let expected = vec![
            PacketEvent::Other,
            PacketEvent::Data,
            PacketEvent::Other,
            PacketEvent::Other,
            PacketEvent::Other,
            PacketEvent::Other,
            PacketEvent::Other,
            PacketEvent::EndOfStream,
        ];

        assert_eq!(dispatch_chunked(&bytes, bytes.len()), expected);
        assert_eq!(dispatch_chunked(&bytes, 2), expected);
        assert_eq!(dispatch_chunked(&bytes, 1), expected);
    }

    #[test]
    fn test_dispatcher_exception_event() {
        let bytes = exception_packet(60, "Table t doesn't exist", None);
        let mut ring = feed_all(&bytes);
        let mut state = PacketState::new();
        assert_eq!(
            state.advance(&mut ring, REVISION).unwrap(),
            Some(PacketEvent::Exception("Table t doesn't exist".to_string()))
        );
    }

    #[test]
    fn test_dispatcher_unimplemented_packet() {
        let bytes = varint(protocol::ServerCode::Totals.into());
        let mut ring = feed_all(&bytes);
        let mut state = PacketState::new();
        match state.advance(&mut ring, REVISION) {
            Err(Error::Unimplemented(msg)) => assert!(msg.contains("7")),
            other => panic!("Unexpected result {:?}", other),
        }
    }

    #[test]
    fn test_dispatcher_progress_without_write_info() {
        // A server below the client-write-info revision sends three counters.
        let revision = protocol::MIN_REVISION_WITH_BLOCK_INFO;
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&varint(protocol::ServerCode::Progress.into()));
        for value in &[7u64, 700, 70] {
            bytes.extend_from_slice(&varint(*value));
        }
        bytes.extend_from_slice(&varint(protocol::ServerCode::EndOfStream.into()));

        let mut ring = feed_all(&bytes);
        let mut state = PacketState::new();
        assert_eq!(
            state.advance(&mut ring, revision).unwrap(),
            Some(PacketEvent::Other)
        );
        assert_eq!(
            state.advance(&mut ring, revision).unwrap(),
            Some(PacketEvent::EndOfStream)
        );
        assert!(ring.is_empty());
    }
}
