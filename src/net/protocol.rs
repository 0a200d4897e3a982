//! Wire-level constants of the ClickHouse native protocol: packet codes,
//! query stages and the server-revision gates controlling optional fields.

/// Name this client advertises in its Hello packet.
pub const CLIENT_NAME: &str = "magnetar";

pub const CLIENT_VERSION_MAJOR: u64 = 0;
pub const CLIENT_VERSION_MINOR: u64 = 1;
pub const CLIENT_VERSION_PATCH: u64 = 0;

/// Types of packets sent by the client.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ClientCode {
    Hello = 0,
    Query = 1,
    Data = 2,
    Cancel = 3,
    Ping = 4,
}

impl From<ClientCode> for u64 {
    #[inline]
    fn from(code: ClientCode) -> Self {
        code as u64
    }
}

/// Types of packets received from the server.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ServerCode {
    Hello = 0,
    Data = 1,
    Exception = 2,
    Progress = 3,
    Pong = 4,
    EndOfStream = 5,
    ProfileInfo = 6,
    Totals = 7,
    Extremes = 8,
    TablesStatusResponse = 9,
    Log = 10,
    TableColumns = 11,
    PartUuids = 12,
    ReadTaskRequest = 13,
    ProfileEvents = 14,
}

impl ServerCode {
    pub fn from_u64(value: u64) -> Option<ServerCode> {
        Some(match value {
            0 => ServerCode::Hello,
            1 => ServerCode::Data,
            2 => ServerCode::Exception,
            3 => ServerCode::Progress,
            4 => ServerCode::Pong,
            5 => ServerCode::EndOfStream,
            6 => ServerCode::ProfileInfo,
            7 => ServerCode::Totals,
            8 => ServerCode::Extremes,
            9 => ServerCode::TablesStatusResponse,
            10 => ServerCode::Log,
            11 => ServerCode::TableColumns,
            12 => ServerCode::PartUuids,
            13 => ServerCode::ReadTaskRequest,
            14 => ServerCode::ProfileEvents,
            _ => return None,
        })
    }
}

impl From<ServerCode> for u64 {
    #[inline]
    fn from(code: ServerCode) -> Self {
        code as u64
    }
}

/// Query processing stage requested by the client.
pub const STAGE_COMPLETE: u64 = 2;

pub const COMPRESSION_DISABLE: u64 = 0;
pub const COMPRESSION_ENABLE: u64 = 1;

// Minimum server revisions enabling optional wire fields.
pub const MIN_REVISION_WITH_TEMPORARY_TABLES: u64 = 50264;
pub const MIN_REVISION_WITH_TOTAL_ROWS_IN_PROGRESS: u64 = 51554;
pub const MIN_REVISION_WITH_BLOCK_INFO: u64 = 51903;
pub const MIN_REVISION_WITH_CLIENT_INFO: u64 = 54032;
pub const MIN_REVISION_WITH_SERVER_TIMEZONE: u64 = 54058;
pub const MIN_REVISION_WITH_QUOTA_KEY_IN_CLIENT_INFO: u64 = 54060;
pub const MIN_REVISION_WITH_SERVER_DISPLAY_NAME: u64 = 54372;
pub const MIN_REVISION_WITH_VERSION_PATCH: u64 = 54401;
pub const MIN_REVISION_WITH_CLIENT_WRITE_INFO: u64 = 54420;
pub const MIN_REVISION_WITH_SETTINGS_SERIALIZED_AS_STRINGS: u64 = 54429;
pub const MIN_REVISION_WITH_INTERSERVER_SECRET: u64 = 54441;
pub const MIN_REVISION_WITH_OPENTELEMETRY: u64 = 54442;
pub const MIN_REVISION_WITH_DISTRIBUTED_DEPTH: u64 = 54448;
pub const MIN_REVISION_WITH_INITIAL_QUERY_START_TIME: u64 = 54449;
pub const MIN_REVISION_WITH_PARALLEL_REPLICAS: u64 = 54453;
pub const MIN_REVISION_WITH_CUSTOM_SERIALIZATION: u64 = 54454;
pub const MIN_REVISION_WITH_ADDENDUM: u64 = 54458;
pub const MIN_REVISION_WITH_PARAMETERS: u64 = 54459;

/// The highest protocol revision this client understands; advertised in the
/// Hello packet and in client info.
pub const CLIENT_PROTOCOL_REVISION: u64 = MIN_REVISION_WITH_PARAMETERS;
