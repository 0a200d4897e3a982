//! Builders for the three client packet kinds. Every encoder produces a
//! contiguous owned byte buffer; nothing here touches the socket.

use crate::block::Block;
use crate::net::protocol;
use crate::net::result::{Error, Result};
use crate::net::wire::{write_string, write_varint64};
use byteorder::{LittleEndian, WriteBytesExt};
use std::io::Write;

/// Query id sent when the caller does not provide one.
pub const DEFAULT_QUERY_ID: &str = "";

// Fixed client-info fields sent with every query.
const QUERY_KIND_INITIAL_QUERY: u8 = 1;
const IFACE_TYPE_TCP: u8 = 1;
const INITIAL_ADDRESS: &str = "[::ffff:127.0.0.1]:0";

/// Wraps an identifier in backticks, doubling any embedded backtick.
pub fn quote_identifier(input: &str) -> String {
    let mut output = String::with_capacity(input.len() + 2);
    output.push('`');
    for c in input.chars() {
        if c == '`' {
            output.push_str("``");
        } else {
            output.push(c);
        }
    }
    output.push('`');
    output
}

/// The INSERT statement for a block's columns, ready for the Query packet.
pub fn insert_query_text(table: &str, block: &Block) -> String {
    let mut fields = String::new();
    for (i, (name, _)) in block.columns().enumerate() {
        if i != 0 {
            fields.push(',');
        }
        fields.push_str(&quote_identifier(name));
    }
    format!("INSERT INTO {} ( {} ) VALUES", table, fields)
}

pub fn encode_hello(database: &str, user: &str, password: &str) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    write_varint64(&mut out, protocol::ClientCode::Hello.into())?;
    write_string(&mut out, protocol::CLIENT_NAME.as_bytes())?;
    write_varint64(&mut out, protocol::CLIENT_VERSION_MAJOR)?;
    write_varint64(&mut out, protocol::CLIENT_VERSION_MINOR)?;
    write_varint64(&mut out, protocol::CLIENT_PROTOCOL_REVISION)?;
    write_string(&mut out, database.as_bytes())?;
    write_string(&mut out, user.as_bytes())?;
    write_string(&mut out, password.as_bytes())?;
    Ok(out)
}

pub fn encode_query(query_text: &str, query_id: &str, server_revision: u64) -> Result<Vec<u8>> {
    let mut out = Vec::new();

    write_varint64(&mut out, protocol::ClientCode::Query.into())?;
    write_string(&mut out, query_id.as_bytes())?;

    if server_revision >= protocol::MIN_REVISION_WITH_CLIENT_INFO {
        out.write_u8(QUERY_KIND_INITIAL_QUERY)?;
        write_string(&mut out, b"")?; // initial user
        write_string(&mut out, b"")?; // initial query id
        write_string(&mut out, INITIAL_ADDRESS.as_bytes())?;
        if server_revision >= protocol::MIN_REVISION_WITH_INITIAL_QUERY_START_TIME {
            out.write_i64::<LittleEndian>(0)?;
        }
        out.write_u8(IFACE_TYPE_TCP)?;

        write_string(&mut out, b"")?; // os user
        write_string(&mut out, b"")?; // client hostname
        write_string(&mut out, protocol::CLIENT_NAME.as_bytes())?;
        write_varint64(&mut out, protocol::CLIENT_VERSION_MAJOR)?;
        write_varint64(&mut out, protocol::CLIENT_VERSION_MINOR)?;
        write_varint64(&mut out, protocol::CLIENT_PROTOCOL_REVISION)?;

        if server_revision >= protocol::MIN_REVISION_WITH_QUOTA_KEY_IN_CLIENT_INFO {
            write_string(&mut out, b"")?;
        }
        if server_revision >= protocol::MIN_REVISION_WITH_DISTRIBUTED_DEPTH {
            write_varint64(&mut out, 0)?;
        }
        if server_revision >= protocol::MIN_REVISION_WITH_VERSION_PATCH {
            write_varint64(&mut out, protocol::CLIENT_VERSION_PATCH)?;
        }
        if server_revision >= protocol::MIN_REVISION_WITH_OPENTELEMETRY {
            out.write_u8(0)?;
        }
        if server_revision >= protocol::MIN_REVISION_WITH_PARALLEL_REPLICAS {
            write_varint64(&mut out, 0)?;
            write_varint64(&mut out, 0)?;
            write_varint64(&mut out, 0)?;
        }
    }

    // Per-query settings (none). Older servers expect settings in a binary
    // format this client does not produce.
    if server_revision < protocol::MIN_REVISION_WITH_SETTINGS_SERIALIZED_AS_STRINGS {
        return Err(Error::Unimplemented(
            "server revision too old: settings must be serialized as strings".to_string(),
        ));
    }
    write_string(&mut out, b"")?;

    if server_revision >= protocol::MIN_REVISION_WITH_INTERSERVER_SECRET {
        write_string(&mut out, b"")?;
    }

    write_varint64(&mut out, protocol::STAGE_COMPLETE)?;
    write_varint64(&mut out, protocol::COMPRESSION_DISABLE)?;
    write_string(&mut out, query_text.as_bytes())?;

    if server_revision >= protocol::MIN_REVISION_WITH_PARAMETERS {
        write_string(&mut out, b"")?;
    }

    Ok(out)
}

pub fn encode_data(block: &Block, server_revision: u64) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    write_varint64(&mut out, protocol::ClientCode::Data.into())?;
    if server_revision >= protocol::MIN_REVISION_WITH_TEMPORARY_TABLES {
        write_string(&mut out, b"")?;
    }
    write_block(block, &mut out, server_revision)?;
    Ok(out)
}

fn write_block<W: Write>(block: &Block, out: &mut W, server_revision: u64) -> Result<()> {
    if server_revision >= protocol::MIN_REVISION_WITH_BLOCK_INFO {
        write_varint64(out, 1)?;
        out.write_u8(block.info().is_overflows)?;
        write_varint64(out, 2)?;
        out.write_i32::<LittleEndian>(block.info().bucket_num)?;
        write_varint64(out, 0)?;
    }

    write_varint64(out, block.column_count() as u64)?;
    write_varint64(out, block.row_count() as u64)?;

    for (name, column) in block.columns() {
        write_string(out, name.as_bytes())?;
        write_string(out, column.type_name().as_bytes())?;

        if server_revision >= protocol::MIN_REVISION_WITH_CUSTOM_SERIALIZATION {
            out.write_u8(0)?;
        }

        if block.row_count() > 0 {
            column.save(out)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{ColumnString, ColumnUInt64};
    use crate::net::parse::{PacketEvent, PacketState};
    use crate::net::ring::ByteRing;

    const REVISION: u64 = protocol::CLIENT_PROTOCOL_REVISION;

    #[test]
    fn test_quote_identifier() {
        assert_eq!(quote_identifier("id"), "`id`");
        assert_eq!(quote_identifier("we`ird"), "`we``ird`");
        assert_eq!(quote_identifier(""), "``");
    }

    #[test]
    fn test_insert_query_text() {
        let mut block = Block::new();
        block.append_column("id", ColumnUInt64::new());
        block.append_column("name", ColumnString::new());
        assert_eq!(
            insert_query_text("db.t", &block),
            "INSERT INTO db.t ( `id`,`name` ) VALUES"
        );
    }

    #[test]
    fn test_hello_layout() {
        let bytes = encode_hello("default", "default", "secret").unwrap();

        let mut expected = Vec::new();
        expected.push(protocol::ClientCode::Hello as u8);
        crate::net::wire::write_string(&mut expected, protocol::CLIENT_NAME.as_bytes()).unwrap();
        expected.push(protocol::CLIENT_VERSION_MAJOR as u8);
        expected.push(protocol::CLIENT_VERSION_MINOR as u8);
        crate::net::wire::write_varint64(&mut expected, protocol::CLIENT_PROTOCOL_REVISION)
            .unwrap();
        crate::net::wire::write_string(&mut expected, b"default").unwrap();
        crate::net::wire::write_string(&mut expected, b"default").unwrap();
        crate::net::wire::write_string(&mut expected, b"secret").unwrap();

        assert_eq!(bytes, expected);
    }

    #[test]
    fn test_query_rejects_old_servers() {
        match encode_query("SELECT 1", "", 54400) {
            Err(Error::Unimplemented(_)) => {}
            other => panic!("Unexpected result {:?}", other),
        }
    }

    #[test]
    fn test_query_starts_with_code_and_id() {
        let bytes = encode_query("SELECT 1", "q-1", REVISION).unwrap();
        assert_eq!(bytes[0], protocol::ClientCode::Query as u8);
        assert_eq!(bytes[1], 3);
        assert_eq!(&bytes[2..5], b"q-1");
        // The query text is embedded as a length-prefixed string.
        let needle = b"SELECT 1";
        assert!(bytes.windows(needle.len()).any(|w| w == &needle[..]));
        // Trailing parameters string for a parameters-capable server.
        assert_eq!(*bytes.last().unwrap(), 0);
    }

    #[test]
    fn test_query_gates_shrink_older_encodings() {
        let newest = encode_query("SELECT 1", "", REVISION).unwrap();
        let older = encode_query(
            "SELECT 1",
            "",
            protocol::MIN_REVISION_WITH_SETTINGS_SERIALIZED_AS_STRINGS,
        )
        .unwrap();
        assert!(older.len() < newest.len());
    }

    #[test]
    fn test_empty_data_packet_round_trips_through_skip_parser() {
        let empty = Block::new();
        let bytes = encode_data(&empty, REVISION).unwrap();
        assert_eq!(bytes[0], protocol::ClientCode::Data as u8);

        // The server-side parser reads the same layout, so the skip parser
        // must traverse an encoded block exactly. Replace the leading client
        // code with the server Data code and feed the dispatcher.
        let mut ring = ByteRing::new(bytes.len());
        ring.write(&[protocol::ServerCode::Data as u8]);
        ring.write(&bytes[1..]);

        let mut state = PacketState::new();
        assert_eq!(
            state.advance(&mut ring, REVISION).unwrap(),
            Some(PacketEvent::Data)
        );
        assert!(ring.is_empty());
    }

    #[test]
    fn test_data_packet_with_rows_round_trips_through_skip_parser() {
        let mut id = ColumnUInt64::new();
        id.append(1);
        id.append(2);
        let mut name = ColumnString::new();
        name.append("one");
        name.append("two");

        let mut block = Block::new();
        block.append_column("id", id);
        block.append_column("name", name);

        let bytes = encode_data(&block, REVISION).unwrap();

        let mut ring = ByteRing::new(bytes.len());
        ring.write(&[protocol::ServerCode::Data as u8]);
        ring.write(&bytes[1..]);

        let mut state = PacketState::new();
        assert_eq!(
            state.advance(&mut ring, REVISION).unwrap(),
            Some(PacketEvent::Data)
        );
        assert!(ring.is_empty());
    }

    #[test]
    fn test_data_packet_without_custom_serialization_marker() {
        let empty = Block::new();
        let new = encode_data(&empty, REVISION).unwrap();
        let old = encode_data(&empty, protocol::MIN_REVISION_WITH_CUSTOM_SERIALIZATION - 1)
            .unwrap();
        // Zero columns, so the marker byte never appears either way.
        assert_eq!(new, old);

        let mut block = Block::new();
        block.append_column("id", ColumnUInt64::new());
        let new = encode_data(&block, REVISION).unwrap();
        let old =
            encode_data(&block, protocol::MIN_REVISION_WITH_CUSTOM_SERIALIZATION - 1).unwrap();
        assert_eq!(new.len(), old.len() + 1);
    }
}
