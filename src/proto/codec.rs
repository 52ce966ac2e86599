//! Byte-level codec for the NetworkTables wire protocol.
//!
//! Messages carry no frame delimiter: each is self-describing through its
//! type byte and length-prefixed fields. Decoding is therefore attempted
//! against whatever bytes are buffered; a short buffer yields "need more"
//! without consuming anything.
//!
//! The negotiated protocol revision is shared with the owning connection
//! through an [`AtomicU16`] so the handshake can downgrade a live stream.

use std::sync::atomic::AtomicU16;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Buf;
use bytes::BufMut;
use bytes::BytesMut;
use tokio_util::codec::Decoder;
use tokio_util::codec::Encoder;
use tracing::debug;

use super::Message;
use super::MessageType;
use super::SequenceNumber;
use super::Value;
use super::ValueType;
use crate::constants::CLEAR_ALL_MAGIC;
use crate::constants::PROTO_REV_3_0;
use crate::ProtocolError;

/// Resolves the established type of an entry by wire id. Needed to decode
/// legacy EntryUpdate messages, which carry no type tag.
pub type EntryTypeLookup = Arc<dyn Fn(u16) -> Option<ValueType> + Send + Sync>;

const WIRE_BOOLEAN: u8 = 0x00;
const WIRE_DOUBLE: u8 = 0x01;
const WIRE_STRING: u8 = 0x02;
const WIRE_RAW: u8 = 0x03;
const WIRE_BOOLEAN_ARRAY: u8 = 0x10;
const WIRE_DOUBLE_ARRAY: u8 = 0x11;
const WIRE_STRING_ARRAY: u8 = 0x12;
const WIRE_RPC: u8 = 0x20;

pub(crate) fn wire_type_tag(
    value_type: ValueType,
    proto_rev: u16,
) -> Result<u8, ProtocolError> {
    let tag = match value_type {
        ValueType::Boolean => WIRE_BOOLEAN,
        ValueType::Double => WIRE_DOUBLE,
        ValueType::String => WIRE_STRING,
        ValueType::BooleanArray => WIRE_BOOLEAN_ARRAY,
        ValueType::DoubleArray => WIRE_DOUBLE_ARRAY,
        ValueType::StringArray => WIRE_STRING_ARRAY,
        ValueType::Raw if proto_rev >= PROTO_REV_3_0 => WIRE_RAW,
        ValueType::Rpc if proto_rev >= PROTO_REV_3_0 => WIRE_RPC,
        _ => {
            return Err(ProtocolError::UnsupportedValue {
                value_type,
                proto_rev,
            })
        }
    };
    Ok(tag)
}

pub(crate) fn value_type_from_tag(
    tag: u8,
    proto_rev: u16,
) -> Result<ValueType, ProtocolError> {
    let value_type = match tag {
        WIRE_BOOLEAN => ValueType::Boolean,
        WIRE_DOUBLE => ValueType::Double,
        WIRE_STRING => ValueType::String,
        WIRE_BOOLEAN_ARRAY => ValueType::BooleanArray,
        WIRE_DOUBLE_ARRAY => ValueType::DoubleArray,
        WIRE_STRING_ARRAY => ValueType::StringArray,
        WIRE_RAW if proto_rev >= PROTO_REV_3_0 => ValueType::Raw,
        WIRE_RPC if proto_rev >= PROTO_REV_3_0 => ValueType::Rpc,
        _ => return Err(ProtocolError::UnknownValueType(tag)),
    };
    Ok(value_type)
}

// -----------------------------------------------------------------------------
// ULEB128

pub(crate) fn write_uleb128(
    dst: &mut BytesMut,
    mut value: u64,
) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        dst.put_u8(byte);
        if value == 0 {
            break;
        }
    }
}

/// Outcome of a read against a partial buffer.
#[derive(Debug)]
pub(crate) enum ReadError {
    /// Not enough bytes buffered yet
    Incomplete,
    Protocol(ProtocolError),
}

impl From<ProtocolError> for ReadError {
    fn from(e: ProtocolError) -> Self {
        ReadError::Protocol(e)
    }
}

type ReadResult<T> = Result<T, ReadError>;

/// Cursor over buffered bytes. Nothing is consumed from the source buffer
/// until a whole message decodes.
pub(crate) struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
    proto_rev: u16,
}

impl<'a> WireReader<'a> {
    pub(crate) fn new(
        buf: &'a [u8],
        proto_rev: u16,
    ) -> Self {
        Self {
            buf,
            pos: 0,
            proto_rev,
        }
    }

    pub(crate) fn position(&self) -> usize {
        self.pos
    }

    fn take(
        &mut self,
        len: usize,
    ) -> ReadResult<&'a [u8]> {
        let end = self.pos.checked_add(len).ok_or(ProtocolError::LengthOverflow)?;
        if end > self.buf.len() {
            return Err(ReadError::Incomplete);
        }
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn read_u8(&mut self) -> ReadResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn read_u16(&mut self) -> ReadResult<u16> {
        let mut b = self.take(2)?;
        Ok(b.get_u16())
    }

    fn read_u32(&mut self) -> ReadResult<u32> {
        let mut b = self.take(4)?;
        Ok(b.get_u32())
    }

    fn read_f64(&mut self) -> ReadResult<f64> {
        let mut b = self.take(8)?;
        Ok(b.get_f64())
    }

    fn read_uleb128(&mut self) -> ReadResult<u64> {
        let mut result: u64 = 0;
        let mut shift = 0u32;
        loop {
            let byte = self.read_u8()?;
            if shift >= 64 {
                return Err(ProtocolError::LengthOverflow.into());
            }
            result |= u64::from(byte & 0x7F) << shift;
            shift += 7;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
        }
    }

    fn read_len(&mut self) -> ReadResult<usize> {
        let len = self.read_uleb128()?;
        usize::try_from(len).map_err(|_| ProtocolError::LengthOverflow.into())
    }

    fn read_string(&mut self) -> ReadResult<String> {
        let len = if self.proto_rev < PROTO_REV_3_0 {
            self.read_u16()? as usize
        } else {
            self.read_len()?
        };
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| ProtocolError::InvalidUtf8.into())
    }

    fn read_raw(&mut self) -> ReadResult<Vec<u8>> {
        let len = self.read_len()?;
        Ok(self.take(len)?.to_vec())
    }

    fn read_type(&mut self) -> ReadResult<ValueType> {
        let tag = self.read_u8()?;
        Ok(value_type_from_tag(tag, self.proto_rev)?)
    }

    fn read_value(
        &mut self,
        value_type: ValueType,
    ) -> ReadResult<Value> {
        let value = match value_type {
            ValueType::Boolean => Value::Boolean(self.read_u8()? != 0),
            ValueType::Double => Value::Double(self.read_f64()?),
            ValueType::String => Value::String(self.read_string()?),
            ValueType::Raw => Value::Raw(self.read_raw()?),
            ValueType::Rpc => Value::Rpc(self.read_raw()?),
            ValueType::BooleanArray => {
                let count = self.read_u8()? as usize;
                let mut items = Vec::with_capacity(count);
                for _ in 0..count {
                    items.push(self.read_u8()? != 0);
                }
                Value::BooleanArray(items)
            }
            ValueType::DoubleArray => {
                let count = self.read_u8()? as usize;
                let mut items = Vec::with_capacity(count);
                for _ in 0..count {
                    items.push(self.read_f64()?);
                }
                Value::DoubleArray(items)
            }
            ValueType::StringArray => {
                let count = self.read_u8()? as usize;
                let mut items = Vec::with_capacity(count);
                for _ in 0..count {
                    items.push(self.read_string()?);
                }
                Value::StringArray(items)
            }
            ValueType::Unassigned => {
                return Err(ProtocolError::UnknownValueType(0xFF).into());
            }
        };
        Ok(value)
    }

    /// Decode one message starting at the cursor.
    pub(crate) fn read_message(
        &mut self,
        type_lookup: Option<&EntryTypeLookup>,
    ) -> ReadResult<Message> {
        let code = self.read_u8()?;
        let kind = MessageType::from_code(code).ok_or(ProtocolError::UnknownMessageType(code))?;
        if kind.requires_rev3() && self.proto_rev < PROTO_REV_3_0 {
            return Err(ProtocolError::UnsupportedMessage {
                msg_type: code,
                proto_rev: self.proto_rev,
            }
            .into());
        }

        let msg = match kind {
            MessageType::KeepAlive => Message::KeepAlive,
            MessageType::ClientHello => {
                let proto_rev = self.read_u16()?;
                // identity presence follows the revision the peer asked for
                let identity = if proto_rev >= PROTO_REV_3_0 {
                    self.read_string()?
                } else {
                    String::new()
                };
                Message::ClientHello {
                    proto_rev,
                    identity,
                }
            }
            MessageType::ProtoUnsup => Message::ProtoUnsup {
                proto_rev: self.read_u16()?,
            },
            MessageType::ServerHelloDone => Message::ServerHelloDone,
            MessageType::ServerHello => {
                let flags = self.read_u8()?;
                let identity = self.read_string()?;
                Message::ServerHello { flags, identity }
            }
            MessageType::ClientHelloDone => Message::ClientHelloDone,
            MessageType::EntryAssign => {
                let name = self.read_string()?;
                let value_type = self.read_type()?;
                let id = self.read_u16()?;
                let seq_num = SequenceNumber::new(self.read_u16()?);
                let flags = if self.proto_rev >= PROTO_REV_3_0 {
                    self.read_u8()?
                } else {
                    0
                };
                let value = Arc::new(self.read_value(value_type)?);
                Message::EntryAssign {
                    name,
                    id,
                    seq_num,
                    value,
                    flags,
                }
            }
            MessageType::EntryUpdate => {
                let id = self.read_u16()?;
                let seq_num = SequenceNumber::new(self.read_u16()?);
                let value_type = if self.proto_rev >= PROTO_REV_3_0 {
                    self.read_type()?
                } else {
                    type_lookup
                        .and_then(|lookup| lookup(id))
                        .ok_or(ProtocolError::UnknownEntryId(id))?
                };
                let value = Arc::new(self.read_value(value_type)?);
                Message::EntryUpdate { id, seq_num, value }
            }
            MessageType::FlagsUpdate => {
                let id = self.read_u16()?;
                let flags = self.read_u8()?;
                Message::FlagsUpdate { id, flags }
            }
            MessageType::EntryDelete => Message::EntryDelete {
                id: self.read_u16()?,
            },
            MessageType::ClearEntries => {
                let magic = self.read_u32()?;
                if magic != CLEAR_ALL_MAGIC {
                    return Err(ProtocolError::BadClearMagic(magic).into());
                }
                Message::ClearEntries
            }
            MessageType::ExecuteRpc => {
                let id = self.read_u16()?;
                let call_uid = self.read_u16()?;
                let params = self.read_raw()?;
                Message::ExecuteRpc {
                    id,
                    call_uid,
                    params,
                }
            }
            MessageType::RpcResponse => {
                let id = self.read_u16()?;
                let call_uid = self.read_u16()?;
                let result = self.read_raw()?;
                Message::RpcResponse {
                    id,
                    call_uid,
                    result,
                }
            }
        };
        Ok(msg)
    }
}

// -----------------------------------------------------------------------------
// Encoding

fn write_string(
    dst: &mut BytesMut,
    s: &str,
    proto_rev: u16,
) {
    if proto_rev < PROTO_REV_3_0 {
        let mut len = s.len().min(u16::MAX as usize);
        while !s.is_char_boundary(len) {
            len -= 1;
        }
        dst.put_u16(len as u16);
        dst.put_slice(&s.as_bytes()[..len]);
    } else {
        write_uleb128(dst, s.len() as u64);
        dst.put_slice(s.as_bytes());
    }
}

fn write_raw(
    dst: &mut BytesMut,
    raw: &[u8],
) {
    write_uleb128(dst, raw.len() as u64);
    dst.put_slice(raw);
}

fn write_value(
    dst: &mut BytesMut,
    value: &Value,
    proto_rev: u16,
) {
    match value {
        Value::Boolean(v) => dst.put_u8(u8::from(*v)),
        Value::Double(v) => dst.put_f64(*v),
        Value::String(v) => write_string(dst, v, proto_rev),
        Value::Raw(v) | Value::Rpc(v) => write_raw(dst, v),
        Value::BooleanArray(items) => {
            let count = items.len().min(u8::MAX as usize);
            dst.put_u8(count as u8);
            for v in &items[..count] {
                dst.put_u8(u8::from(*v));
            }
        }
        Value::DoubleArray(items) => {
            let count = items.len().min(u8::MAX as usize);
            dst.put_u8(count as u8);
            for v in &items[..count] {
                dst.put_f64(*v);
            }
        }
        Value::StringArray(items) => {
            let count = items.len().min(u8::MAX as usize);
            dst.put_u8(count as u8);
            for v in &items[..count] {
                write_string(dst, v, proto_rev);
            }
        }
    }
}

/// Encode `msg` for `proto_rev`. Returns `Ok(false)` when the message does
/// not exist in that revision and was skipped.
pub(crate) fn write_message(
    dst: &mut BytesMut,
    msg: &Message,
    proto_rev: u16,
) -> Result<bool, ProtocolError> {
    let kind = msg.message_type();
    if kind.requires_rev3() && proto_rev < PROTO_REV_3_0 {
        return Ok(false);
    }

    match msg {
        Message::KeepAlive | Message::ServerHelloDone | Message::ClientHelloDone => {
            dst.put_u8(kind.code());
        }
        Message::ClientHello {
            proto_rev: requested,
            identity,
        } => {
            dst.put_u8(kind.code());
            dst.put_u16(*requested);
            if *requested >= PROTO_REV_3_0 {
                write_string(dst, identity, proto_rev);
            }
        }
        Message::ProtoUnsup { proto_rev: offered } => {
            dst.put_u8(kind.code());
            dst.put_u16(*offered);
        }
        Message::ServerHello { flags, identity } => {
            dst.put_u8(kind.code());
            dst.put_u8(*flags);
            write_string(dst, identity, proto_rev);
        }
        Message::EntryAssign {
            name,
            id,
            seq_num,
            value,
            flags,
        } => {
            let tag = wire_type_tag(value.value_type(), proto_rev)?;
            dst.put_u8(kind.code());
            write_string(dst, name, proto_rev);
            dst.put_u8(tag);
            dst.put_u16(*id);
            dst.put_u16(seq_num.value());
            if proto_rev >= PROTO_REV_3_0 {
                dst.put_u8(*flags);
            }
            write_value(dst, value, proto_rev);
        }
        Message::EntryUpdate { id, seq_num, value } => {
            let tag = wire_type_tag(value.value_type(), proto_rev)?;
            dst.put_u8(kind.code());
            dst.put_u16(*id);
            dst.put_u16(seq_num.value());
            if proto_rev >= PROTO_REV_3_0 {
                dst.put_u8(tag);
            }
            write_value(dst, value, proto_rev);
        }
        Message::FlagsUpdate { id, flags } => {
            dst.put_u8(kind.code());
            dst.put_u16(*id);
            dst.put_u8(*flags);
        }
        Message::EntryDelete { id } => {
            dst.put_u8(kind.code());
            dst.put_u16(*id);
        }
        Message::ClearEntries => {
            dst.put_u8(kind.code());
            dst.put_u32(CLEAR_ALL_MAGIC);
        }
        Message::ExecuteRpc {
            id,
            call_uid,
            params: payload,
        }
        | Message::RpcResponse {
            id,
            call_uid,
            result: payload,
        } => {
            dst.put_u8(kind.code());
            dst.put_u16(*id);
            dst.put_u16(*call_uid);
            write_raw(dst, payload);
        }
    }
    Ok(true)
}

// -----------------------------------------------------------------------------
// tokio-util codec

/// Framed codec for one connection.
#[derive(Clone)]
pub struct MessageCodec {
    proto_rev: Arc<AtomicU16>,
    type_lookup: Option<EntryTypeLookup>,
}

impl MessageCodec {
    pub fn new(
        proto_rev: Arc<AtomicU16>,
        type_lookup: Option<EntryTypeLookup>,
    ) -> Self {
        Self {
            proto_rev,
            type_lookup,
        }
    }

    fn rev(&self) -> u16 {
        self.proto_rev.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for MessageCodec {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("MessageCodec")
            .field("proto_rev", &self.rev())
            .finish_non_exhaustive()
    }
}

impl Decoder for MessageCodec {
    type Item = Arc<Message>;
    type Error = ProtocolError;

    fn decode(
        &mut self,
        src: &mut BytesMut,
    ) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }
        let mut reader = WireReader::new(&src[..], self.rev());
        match reader.read_message(self.type_lookup.as_ref()) {
            Ok(msg) => {
                let consumed = reader.position();
                src.advance(consumed);
                Ok(Some(Arc::new(msg)))
            }
            Err(ReadError::Incomplete) => Ok(None),
            Err(ReadError::Protocol(e)) => Err(e),
        }
    }
}

impl Encoder<Arc<Message>> for MessageCodec {
    type Error = ProtocolError;

    fn encode(
        &mut self,
        msg: Arc<Message>,
        dst: &mut BytesMut,
    ) -> Result<(), Self::Error> {
        let rev = self.rev();
        let mark = dst.len();
        match write_message(dst, &msg, rev) {
            Ok(true) => Ok(()),
            Ok(false) => {
                debug!(
                    msg_type = msg.message_type().as_str(),
                    proto_rev = rev,
                    "skipping message not supported by peer revision"
                );
                Ok(())
            }
            Err(e) => {
                dst.truncate(mark);
                debug!(error = %e, "dropping unencodable message");
                Ok(())
            }
        }
    }
}
