//! End-to-end exercise of the client against a scripted TCP server.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;

use arrow_array::{ArrayRef, Int64Array, RecordBatch as ArrowRecordBatch, StringArray};
use arrow_ipc::writer::StreamWriter;
use arrow_schema::{DataType, Field as ArrowField, Schema as ArrowSchema};
use bytes::Bytes;
use cubesql_client::{ClientBuilder, CubeError, LogicalType};
use cubesql_common::protocol::Message;

fn read_message(stream: &mut TcpStream) -> Message {
    let mut length_buf = [0u8; 4];
    stream.read_exact(&mut length_buf).unwrap();
    let length = u32::from_be_bytes(length_buf) as usize;
    let mut payload = vec![0u8; length];
    stream.read_exact(&mut payload).unwrap();
    Message::decode(&payload).unwrap()
}

fn write_message(stream: &mut TcpStream, message: &Message) {
    stream.write_all(&message.encode()).unwrap();
}

fn result_payload() -> Bytes {
    let schema = Arc::new(ArrowSchema::new(vec![
        ArrowField::new("city", DataType::Utf8, false),
        ArrowField::new("population", DataType::Int64, true),
    ]));
    let batch = ArrowRecordBatch::try_new(
        Arc::clone(&schema),
        vec![
            Arc::new(StringArray::from(vec!["berlin", "amsterdam"])) as ArrayRef,
            Arc::new(Int64Array::from(vec![Some(3_600_000), None])),
        ],
    )
    .unwrap();

    let mut buf = Vec::new();
    {
        let mut writer = StreamWriter::try_new(&mut buf, &schema).unwrap();
        writer.write(&batch).unwrap();
        writer.finish().unwrap();
    }
    Bytes::from(buf)
}

/// Accepts one connection and walks it through handshake, auth, one
/// successful query, and one failing query.
fn spawn_server(listener: TcpListener) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();

        match read_message(&mut stream) {
            Message::HandshakeRequest { version } => assert_eq!(version, 1),
            other => panic!("expected handshake, got {other:?}"),
        }
        write_message(
            &mut stream,
            &Message::HandshakeResponse {
                version: 1,
                server_version: "1.0.0".into(),
            },
        );

        match read_message(&mut stream) {
            Message::AuthRequest { token, database } => {
                assert_eq!(token, "secret");
                assert_eq!(database.as_deref(), Some("analytics"));
            }
            other => panic!("expected auth, got {other:?}"),
        }
        write_message(
            &mut stream,
            &Message::AuthResponse {
                success: true,
                session_id: "sess-42".into(),
            },
        );

        match read_message(&mut stream) {
            Message::QueryRequest { sql } => assert_eq!(sql, "SELECT city, population FROM cities"),
            other => panic!("expected query, got {other:?}"),
        }
        // A standalone schema frame first, which the client skips.
        write_message(
            &mut stream,
            &Message::QueryResponseSchema {
                ipc: result_payload(),
            },
        );
        write_message(
            &mut stream,
            &Message::QueryResponseBatch {
                ipc: result_payload(),
            },
        );
        write_message(&mut stream, &Message::QueryComplete { rows_affected: -1 });

        match read_message(&mut stream) {
            Message::QueryRequest { sql } => assert_eq!(sql, "SELEC oops"),
            other => panic!("expected query, got {other:?}"),
        }
        write_message(
            &mut stream,
            &Message::Error {
                code: "42601".into(),
                message: "syntax".into(),
            },
        );
    })
}

#[test]
fn query_roundtrip_over_tcp() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = spawn_server(listener);

    let mut client = ClientBuilder::new("127.0.0.1", port)
        .token("secret")
        .database("analytics")
        .connect()
        .unwrap();
    assert_eq!(client.server_version(), Some("1.0.0"));
    assert_eq!(client.session_id(), Some("sess-42"));

    let mut result = client.query("SELECT city, population FROM cities").unwrap();
    assert_eq!(result.rows_affected(), -1);

    let schema = result.schema().unwrap().clone();
    assert_eq!(schema.len(), 2);
    assert_eq!(schema.field(0).name, "city");
    assert_eq!(schema.field(0).logical_type, LogicalType::Utf8);
    assert_eq!(schema.field(1).logical_type, LogicalType::Int64);

    let batch = result.next_batch().unwrap().unwrap();
    assert_eq!(batch.num_rows(), 2);
    assert_eq!(batch.column(0).str_at(0), Some("berlin"));
    assert_eq!(batch.column(0).str_at(1), Some("amsterdam"));
    assert_eq!(batch.column(1).i64_at(0), Some(3_600_000));
    assert_eq!(batch.column(1).i64_at(1), None);
    assert!(result.next_batch().unwrap().is_none());

    let err = client.query("SELEC oops").unwrap_err();
    assert_eq!(err, CubeError::Unknown("[42601]: syntax".into()));

    client.close();
    server.join().unwrap();
}
