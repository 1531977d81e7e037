//! Connection-class frames and their wire encoding.
//!
//! Only the frames a connection lifecycle cares about get their own variant;
//! everything else (channel methods, content, unknown classes) decodes to
//! [`ConnectionFrame::Other`]. Framing itself is delegated to `amq-protocol`.

use amq_protocol::frame::{gen_frame, parse_frame, AMQPFrame, GenError, WriteContext};
use amq_protocol::protocol::connection::{self, AMQPMethod as ConnectionMethod};
use amq_protocol::protocol::AMQPClass;
use amq_protocol::types::{AMQPValue, FieldTable};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Cursor;

/// Protocol header a client sends first: `AMQP 0-9-1`.
pub const PROTOCOL_HEADER: &[u8; 8] = b"AMQP\x00\x00\x09\x01";

/// Reply code for a normal, requested close.
pub const REPLY_SUCCESS: u16 = 200;

/// Channel/frame/heartbeat limits exchanged in `tune`/`tune-ok`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TuneParams {
    pub channel_max: u16,
    pub frame_max: u32,
    pub heartbeat: u16,
}

/// A decoded frame, from either side of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionFrame {
    ProtocolHeader,
    Start {
        version_major: u8,
        version_minor: u8,
        server_properties: BTreeMap<String, String>,
        mechanisms: String,
        locales: String,
    },
    StartOk {
        client_properties: BTreeMap<String, String>,
        mechanism: String,
        response: String,
        locale: String,
    },
    Tune(TuneParams),
    TuneOk(TuneParams),
    Open {
        virtual_host: String,
    },
    OpenOk,
    Close {
        reply_code: u16,
        reply_text: String,
        class_id: u16,
        method_id: u16,
    },
    CloseOk,
    Blocked {
        reason: String,
    },
    Unblocked,
    Heartbeat,
    /// Anything outside the connection class.
    Other {
        channel: u16,
        description: String,
    },
}

impl ConnectionFrame {
    /// Short name used in logs and protocol error messages.
    pub fn name(&self) -> &'static str {
        match self {
            ConnectionFrame::ProtocolHeader => "protocol-header",
            ConnectionFrame::Start { .. } => "connection.start",
            ConnectionFrame::StartOk { .. } => "connection.start-ok",
            ConnectionFrame::Tune(_) => "connection.tune",
            ConnectionFrame::TuneOk(_) => "connection.tune-ok",
            ConnectionFrame::Open { .. } => "connection.open",
            ConnectionFrame::OpenOk => "connection.open-ok",
            ConnectionFrame::Close { .. } => "connection.close",
            ConnectionFrame::CloseOk => "connection.close-ok",
            ConnectionFrame::Blocked { .. } => "connection.blocked",
            ConnectionFrame::Unblocked => "connection.unblocked",
            ConnectionFrame::Heartbeat => "heartbeat",
            ConnectionFrame::Other { .. } => "other",
        }
    }

    /// Normal-shutdown close request.
    pub fn normal_close() -> Self {
        ConnectionFrame::Close {
            reply_code: REPLY_SUCCESS,
            reply_text: "Normal shutdown".to_string(),
            class_id: 0,
            method_id: 0,
        }
    }
}

/// Encode one frame for the wire.
pub fn encode(frame: &ConnectionFrame) -> Result<Vec<u8>, String> {
    if let ConnectionFrame::ProtocolHeader = frame {
        return Ok(PROTOCOL_HEADER.to_vec());
    }

    let amqp = to_amqp(frame)?;
    let mut buffer = vec![0u8; 256];
    loop {
        let result = gen_frame(&amqp)(WriteContext::from(Cursor::new(buffer.as_mut_slice())));
        match result {
            Ok(context) => {
                let (_, position) = context.into_inner();
                buffer.truncate(position as usize);
                return Ok(buffer);
            }
            Err(GenError::BufferTooSmall(missing)) => {
                let len = buffer.len();
                buffer.resize(len + missing, 0);
            }
            Err(e) => return Err(format!("Failed to encode {}: {:?}", frame.name(), e)),
        }
    }
}

/// Decode the first frame in `buffer`.
///
/// Returns `Ok(None)` when more bytes are needed, otherwise the frame and
/// the number of bytes it occupied.
pub fn decode(buffer: &[u8]) -> Result<Option<(ConnectionFrame, usize)>, String> {
    if buffer.starts_with(b"AMQP") || (buffer.len() < 4 && b"AMQP".starts_with(buffer) && !buffer.is_empty()) {
        if buffer.len() < PROTOCOL_HEADER.len() {
            return Ok(None);
        }
        return Ok(Some((ConnectionFrame::ProtocolHeader, PROTOCOL_HEADER.len())));
    }

    match parse_frame(buffer) {
        Ok((rest, frame)) => Ok(Some((from_amqp(frame), buffer.len() - rest.len()))),
        Err(e) if e.is_incomplete() => Ok(None),
        Err(e) => Err(format!("Parse error for frame: {:?}", e)),
    }
}

fn method(class: ConnectionMethod) -> AMQPFrame {
    AMQPFrame::Method(0, AMQPClass::Connection(class))
}

fn to_amqp(frame: &ConnectionFrame) -> Result<AMQPFrame, String> {
    let amqp = match frame {
        ConnectionFrame::Start {
            version_major,
            version_minor,
            server_properties,
            mechanisms,
            locales,
        } => method(ConnectionMethod::Start(connection::Start {
            version_major: *version_major,
            version_minor: *version_minor,
            server_properties: to_field_table(server_properties),
            mechanisms: mechanisms.clone().into(),
            locales: locales.clone().into(),
        })),
        ConnectionFrame::StartOk {
            client_properties,
            mechanism,
            response,
            locale,
        } => {
            let mut properties = to_field_table(client_properties);
            properties.insert(
                String::from("capabilities").into(),
                AMQPValue::FieldTable(client_capabilities()),
            );
            method(ConnectionMethod::StartOk(connection::StartOk {
                client_properties: properties,
                mechanism: mechanism.clone().into(),
                response: response.clone().into(),
                locale: locale.clone().into(),
            }))
        }
        ConnectionFrame::Tune(tune) => method(ConnectionMethod::Tune(connection::Tune {
            channel_max: tune.channel_max,
            frame_max: tune.frame_max,
            heartbeat: tune.heartbeat,
        })),
        ConnectionFrame::TuneOk(tune) => method(ConnectionMethod::TuneOk(connection::TuneOk {
            channel_max: tune.channel_max,
            frame_max: tune.frame_max,
            heartbeat: tune.heartbeat,
        })),
        ConnectionFrame::Open { virtual_host } => method(ConnectionMethod::Open(connection::Open {
            virtual_host: virtual_host.clone().into(),
        })),
        ConnectionFrame::OpenOk => method(ConnectionMethod::OpenOk(connection::OpenOk {})),
        ConnectionFrame::Close {
            reply_code,
            reply_text,
            class_id,
            method_id,
        } => method(ConnectionMethod::Close(connection::Close {
            reply_code: *reply_code,
            reply_text: reply_text.clone().into(),
            class_id: *class_id,
            method_id: *method_id,
        })),
        ConnectionFrame::CloseOk => method(ConnectionMethod::CloseOk(connection::CloseOk {})),
        ConnectionFrame::Blocked { reason } => method(ConnectionMethod::Blocked(connection::Blocked {
            reason: reason.clone().into(),
        })),
        ConnectionFrame::Unblocked => method(ConnectionMethod::Unblocked(connection::Unblocked {})),
        ConnectionFrame::Heartbeat => AMQPFrame::Heartbeat(0),
        ConnectionFrame::ProtocolHeader | ConnectionFrame::Other { .. } => {
            return Err(format!("{} frames cannot be encoded", frame.name()));
        }
    };
    Ok(amqp)
}

fn from_amqp(frame: AMQPFrame) -> ConnectionFrame {
    match frame {
        AMQPFrame::Heartbeat(_) => ConnectionFrame::Heartbeat,
        AMQPFrame::Method(channel, AMQPClass::Connection(method)) => match method {
            ConnectionMethod::Start(start) => ConnectionFrame::Start {
                version_major: start.version_major,
                version_minor: start.version_minor,
                server_properties: from_field_table(&start.server_properties),
                mechanisms: long_string(&start.mechanisms),
                locales: long_string(&start.locales),
            },
            ConnectionMethod::StartOk(start_ok) => ConnectionFrame::StartOk {
                client_properties: from_field_table(&start_ok.client_properties),
                mechanism: start_ok.mechanism.as_str().to_string(),
                response: long_string(&start_ok.response),
                locale: start_ok.locale.as_str().to_string(),
            },
            ConnectionMethod::Tune(tune) => ConnectionFrame::Tune(TuneParams {
                channel_max: tune.channel_max,
                frame_max: tune.frame_max,
                heartbeat: tune.heartbeat,
            }),
            ConnectionMethod::TuneOk(tune) => ConnectionFrame::TuneOk(TuneParams {
                channel_max: tune.channel_max,
                frame_max: tune.frame_max,
                heartbeat: tune.heartbeat,
            }),
            ConnectionMethod::Open(open) => ConnectionFrame::Open {
                virtual_host: open.virtual_host.as_str().to_string(),
            },
            ConnectionMethod::OpenOk(_) => ConnectionFrame::OpenOk,
            ConnectionMethod::Close(close) => ConnectionFrame::Close {
                reply_code: close.reply_code,
                reply_text: close.reply_text.as_str().to_string(),
                class_id: close.class_id,
                method_id: close.method_id,
            },
            ConnectionMethod::CloseOk(_) => ConnectionFrame::CloseOk,
            ConnectionMethod::Blocked(blocked) => ConnectionFrame::Blocked {
                reason: blocked.reason.as_str().to_string(),
            },
            ConnectionMethod::Unblocked(_) => ConnectionFrame::Unblocked,
            other => ConnectionFrame::Other {
                channel,
                description: format!("{:?}", other),
            },
        },
        AMQPFrame::Method(channel, class) => ConnectionFrame::Other {
            channel,
            description: truncate(format!("{:?}", class)),
        },
        other => ConnectionFrame::Other {
            channel: 0,
            description: truncate(format!("{:?}", other)),
        },
    }
}

/// Capabilities a client must announce for the broker to send
/// `connection.blocked` / `connection.unblocked`.
fn client_capabilities() -> FieldTable {
    let mut capabilities = FieldTable::default();
    for capability in ["connection.blocked", "authentication_failure_close"] {
        capabilities.insert(String::from(capability).into(), AMQPValue::Boolean(true));
    }
    capabilities
}

fn to_field_table(properties: &BTreeMap<String, String>) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in properties {
        table.insert(key.clone().into(), AMQPValue::LongString(value.clone().into()));
    }
    table
}

fn from_field_table(table: &FieldTable) -> BTreeMap<String, String> {
    table
        .inner()
        .iter()
        .map(|(key, value)| (key.as_str().to_string(), value_to_string(value)))
        .collect()
}

fn value_to_string(value: &AMQPValue) -> String {
    match value {
        AMQPValue::LongString(s) => long_string(s),
        AMQPValue::ShortString(s) => s.as_str().to_string(),
        AMQPValue::Boolean(b) => b.to_string(),
        AMQPValue::FieldTable(table) => {
            let entries: Vec<String> = from_field_table(table)
                .into_iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect();
            format!("{{{}}}", entries.join(","))
        }
        other => format!("{:?}", other),
    }
}

fn long_string(value: &amq_protocol::types::LongString) -> String {
    String::from_utf8_lossy(value.as_bytes()).into_owned()
}

fn truncate(mut description: String) -> String {
    const MAX: usize = 120;
    if description.len() > MAX {
        let mut cut = MAX;
        while !description.is_char_boundary(cut) {
            cut -= 1;
        }
        description.truncate(cut);
        description.push_str("...");
    }
    description
}
