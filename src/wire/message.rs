//! Frame message types for the LTX wire protocol.
//!
//! Each [`Message`] variant corresponds to one array-framed wire message:
//! the first array element is a fixint type code, the rest are
//! type-specific positional fields.

use bytes::BytesMut;

use super::value::{Value, encode, encode_array_header};

/// Message type codes, in wire order.
pub const TYPE_PING: u64 = 0;
pub const TYPE_PONG: u64 = 1;
pub const TYPE_ENV: u64 = 2;
pub const TYPE_EXEC: u64 = 3;
pub const TYPE_LOG: u64 = 4;
pub const TYPE_RESULT: u64 = 5;
pub const TYPE_GET_FILE: u64 = 6;
pub const TYPE_SET_FILE: u64 = 7;
pub const TYPE_DATA: u64 = 8;
pub const TYPE_KILL: u64 = 9;
pub const TYPE_VERSION: u64 = 10;

/// Maximum slot id. 127 is reserved and never a valid slot.
pub const MAX_SLOT_ID: u32 = 126;
pub const SLOT_COUNT: usize = 127;

/// A fully decoded LTX frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// `[0]` — in.
    Ping,
    /// `[1, timestamp]` — out.
    Pong { timestamp: u64 },
    /// `[2, slot_or_nil, key, value]` — in. `slot` is `None` for the
    /// executor's own environment.
    Env {
        slot: Option<u32>,
        key: String,
        value: String,
    },
    /// `[3, slot, path, argv...]` — in, 3..14 elements (argv tail ≤ 12).
    Exec {
        slot: u32,
        path: String,
        argv: Vec<String>,
    },
    /// `[4, slot_or_nil, timestamp, text]` — out.
    Log {
        slot: Option<u32>,
        timestamp: u64,
        text: String,
    },
    /// `[5, slot, timestamp, si_code, si_status]` — out.
    Result {
        slot: u32,
        timestamp: u64,
        si_code: u64,
        si_status: u64,
    },
    /// `[6, path]` — in.
    GetFile { path: String },
    /// `[7, path, blob]` — in.
    SetFile { path: String, blob: Vec<u8> },
    /// `[8, blob]` — out. On the GetFile response this carries the full
    /// payload; the SetFile echo instead declares a length with an empty
    /// placeholder blob (content streamed separately, see `executor::files`).
    Data { blob: Vec<u8> },
    /// `[9, slot]` — in.
    Kill { slot: u32 },
    /// `[10]` — in.
    Version,
}

/// CLD_EXITED / CLD_KILLED si_code values used in Result frames.
pub const CLD_EXITED: u64 = 1;
pub const CLD_KILLED: u64 = 2;
pub const CLD_DUMPED: u64 = 3;

impl Message {
    pub fn type_code(&self) -> u64 {
        match self {
            Message::Ping => TYPE_PING,
            Message::Pong { .. } => TYPE_PONG,
            Message::Env { .. } => TYPE_ENV,
            Message::Exec { .. } => TYPE_EXEC,
            Message::Log { .. } => TYPE_LOG,
            Message::Result { .. } => TYPE_RESULT,
            Message::GetFile { .. } => TYPE_GET_FILE,
            Message::SetFile { .. } => TYPE_SET_FILE,
            Message::Data { .. } => TYPE_DATA,
            Message::Kill { .. } => TYPE_KILL,
            Message::Version => TYPE_VERSION,
        }
    }

    /// Encode this message as a full array frame onto `out`.
    pub fn encode(&self, out: &mut BytesMut) {
        match self {
            Message::Ping => self.encode_header(1, out),
            Message::Pong { timestamp } => {
                self.encode_header(2, out);
                encode(&Value::Uint(*timestamp), out);
            }
            Message::Env { slot, key, value } => {
                self.encode_header(4, out);
                encode(&slot_value(*slot), out);
                encode(&Value::Str(key.clone()), out);
                encode(&Value::Str(value.clone()), out);
            }
            Message::Exec { slot, path, argv } => {
                self.encode_header(3 + argv.len(), out);
                encode(&Value::Uint(*slot as u64), out);
                encode(&Value::Str(path.clone()), out);
                for a in argv {
                    encode(&Value::Str(a.clone()), out);
                }
            }
            Message::Log { slot, timestamp, text } => {
                self.encode_header(4, out);
                encode(&slot_value(*slot), out);
                encode(&Value::Uint(*timestamp), out);
                encode(&Value::Str(text.clone()), out);
            }
            Message::Result {
                slot,
                timestamp,
                si_code,
                si_status,
            } => {
                self.encode_header(5, out);
                encode(&Value::Uint(*slot as u64), out);
                encode(&Value::Uint(*timestamp), out);
                encode(&Value::Uint(*si_code), out);
                encode(&Value::Uint(*si_status), out);
            }
            Message::GetFile { path } => {
                self.encode_header(2, out);
                encode(&Value::Str(path.clone()), out);
            }
            Message::SetFile { path, blob } => {
                self.encode_header(3, out);
                encode(&Value::Str(path.clone()), out);
                encode(&Value::Bin(blob.clone()), out);
            }
            Message::Data { blob } => {
                self.encode_header(2, out);
                encode(&Value::Bin(blob.clone()), out);
            }
            Message::Kill { slot } => {
                self.encode_header(2, out);
                encode(&Value::Uint(*slot as u64), out);
            }
            Message::Version => self.encode_header(1, out),
        }
    }

    fn encode_header(&self, arity: usize, out: &mut BytesMut) {
        encode_array_header(arity, out);
        encode(&Value::Uint(self.type_code()), out);
    }
}

fn slot_value(slot: Option<u32>) -> Value {
    match slot {
        Some(s) => Value::Uint(s as u64),
        None => Value::Nil,
    }
}

/// Errors building a [`Message`] out of decoded array elements. All are
/// protocol violations — fatal in the caller.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MessageError {
    #[error("unknown message type {0}")]
    UnknownType(u64),
    #[error("wrong arity for type {type_code}: got {got}, expected {expected}")]
    WrongArity {
        type_code: u64,
        got: usize,
        expected: &'static str,
    },
    #[error("field {index} has wrong value kind for type {type_code}")]
    WrongKind { type_code: u64, index: usize },
    #[error("slot id {0} out of range (must be 0..=126)")]
    SlotOutOfRange(u64),
    #[error("exec argv has {0} tail arguments, maximum is 12")]
    TooManyArgs(usize),
}

/// Build a [`Message`] from a decoded top-level array value.
///
/// `items[0]` must already have been confirmed to be the type fixint by
/// the caller (the framer peeks it before deciding how many more values
/// to wait for); this function re-validates arity and field kinds so it
/// can be unit-tested independently of the framer.
pub fn from_array(items: &[Value]) -> Result<Message, MessageError> {
    let type_code = items
        .first()
        .and_then(Value::as_uint)
        .ok_or(MessageError::WrongKind {
            type_code: u64::MAX,
            index: 0,
        })?;

    let arity_err = |expected: &'static str| MessageError::WrongArity {
        type_code,
        got: items.len(),
        expected,
    };
    let kind_err = |index: usize| MessageError::WrongKind { type_code, index };
    let slot_id = |v: &Value, index: usize| -> Result<u32, MessageError> {
        let raw = v.as_uint().ok_or_else(|| kind_err(index))?;
        if raw > MAX_SLOT_ID as u64 {
            return Err(MessageError::SlotOutOfRange(raw));
        }
        Ok(raw as u32)
    };
    let str_at = |index: usize| -> Result<String, MessageError> {
        items
            .get(index)
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or_else(|| kind_err(index))
    };

    match type_code {
        TYPE_PING => {
            if items.len() != 1 {
                return Err(arity_err("1"));
            }
            Ok(Message::Ping)
        }
        TYPE_ENV => {
            if items.len() != 4 {
                return Err(arity_err("4"));
            }
            let slot = match &items[1] {
                Value::Nil => None,
                v => Some(slot_id(v, 1)?),
            };
            Ok(Message::Env {
                slot,
                key: str_at(2)?,
                value: str_at(3)?,
            })
        }
        TYPE_EXEC => {
            if items.len() < 3 || items.len() > 14 {
                return Err(arity_err("3..14"));
            }
            let slot = slot_id(&items[1], 1)?;
            let path = str_at(2)?;
            let mut argv = Vec::with_capacity(items.len() - 3);
            for (offset, v) in items[3..].iter().enumerate() {
                let s = v.as_str().ok_or_else(|| kind_err(3 + offset))?;
                argv.push(s.to_owned());
            }
            if argv.len() > 12 {
                return Err(MessageError::TooManyArgs(argv.len()));
            }
            Ok(Message::Exec { slot, path, argv })
        }
        TYPE_GET_FILE => {
            if items.len() != 2 {
                return Err(arity_err("2"));
            }
            Ok(Message::GetFile { path: str_at(1)? })
        }
        TYPE_SET_FILE => {
            if items.len() != 3 {
                return Err(arity_err("3"));
            }
            let path = str_at(1)?;
            let blob = items.get(2).and_then(Value::as_bin).ok_or_else(|| kind_err(2))?;
            Ok(Message::SetFile {
                path,
                blob: blob.to_vec(),
            })
        }
        TYPE_KILL => {
            if items.len() != 2 {
                return Err(arity_err("2"));
            }
            Ok(Message::Kill {
                slot: slot_id(&items[1], 1)?,
            })
        }
        TYPE_VERSION => {
            if items.len() != 1 {
                return Err(arity_err("1"));
            }
            Ok(Message::Version)
        }
        // Pong/Log/Result/Data are outbound-only; the controller never
        // sends them. Receiving one is a protocol violation.
        TYPE_PONG | TYPE_LOG | TYPE_RESULT | TYPE_DATA => Err(MessageError::UnknownType(type_code)),
        other => Err(MessageError::UnknownType(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::value::decode;

    fn encode_msg(m: &Message) -> BytesMut {
        let mut buf = BytesMut::new();
        m.encode(&mut buf);
        buf
    }

    fn decode_array(buf: &[u8]) -> Vec<Value> {
        match decode(buf) {
            crate::wire::value::Decoded::Complete(Value::Array(items), n) => {
                assert_eq!(n, buf.len());
                items
            }
            _ => panic!("expected a complete array"),
        }
    }

    #[test]
    fn ping_bytes_are_exact() {
        let buf = encode_msg(&Message::Ping);
        assert_eq!(buf.as_ref(), &[0x91, 0x00]);
    }

    #[test]
    fn version_bytes_are_exact() {
        let buf = encode_msg(&Message::Version);
        assert_eq!(buf.as_ref(), &[0x91, 0x0a]);
    }

    #[test]
    fn pong_roundtrip_fields() {
        let msg = Message::Pong { timestamp: 12345 };
        let buf = encode_msg(&msg);
        let items = decode_array(&buf);
        assert_eq!(items[0].as_uint(), Some(TYPE_PONG));
        assert_eq!(items[1].as_uint(), Some(12345));
    }

    #[test]
    fn kill_bytes_are_exact() {
        // Kill is `92 09 <slot>`.
        let buf = encode_msg(&Message::Kill { slot: 0 });
        assert_eq!(buf.as_ref(), &[0x92, 0x09, 0x00]);
    }

    #[test]
    fn env_global_uses_nil_slot() {
        let msg = Message::Env {
            slot: None,
            key: "K".into(),
            value: "V".into(),
        };
        let buf = encode_msg(&msg);
        let items = decode_array(&buf);
        assert!(items[1].is_nil());
        let rebuilt = from_array(&items).unwrap();
        assert_eq!(rebuilt, msg);
    }

    #[test]
    fn env_per_slot_roundtrip() {
        let msg = Message::Env {
            slot: Some(5),
            key: "PATH".into(),
            value: "/bin".into(),
        };
        let buf = encode_msg(&msg);
        let items = decode_array(&buf);
        let rebuilt = from_array(&items).unwrap();
        assert_eq!(rebuilt, msg);
    }

    #[test]
    fn exec_roundtrip_with_argv() {
        let msg = Message::Exec {
            slot: 1,
            path: "/bin/sh".into(),
            argv: vec!["-c".into(), "echo hi".into()],
        };
        let buf = encode_msg(&msg);
        let items = decode_array(&buf);
        let rebuilt = from_array(&items).unwrap();
        assert_eq!(rebuilt, msg);
    }

    #[test]
    fn exec_rejects_too_many_args() {
        let items: Vec<Value> = std::iter::once(Value::Uint(TYPE_EXEC))
            .chain(std::iter::once(Value::Uint(0)))
            .chain(std::iter::once(Value::Str("/bin/true".into())))
            .chain((0..13).map(|i| Value::Str(format!("a{i}"))))
            .collect();
        assert_eq!(from_array(&items), Err(MessageError::TooManyArgs(13)));
    }

    #[test]
    fn exec_rejects_bad_arity() {
        let items = vec![Value::Uint(TYPE_EXEC), Value::Uint(0)];
        assert!(matches!(
            from_array(&items),
            Err(MessageError::WrongArity { .. })
        ));
    }

    #[test]
    fn slot_out_of_range_rejected() {
        let items = vec![Value::Uint(TYPE_KILL), Value::Uint(127)];
        assert_eq!(from_array(&items), Err(MessageError::SlotOutOfRange(127)));
    }

    #[test]
    fn unknown_type_rejected() {
        let items = vec![Value::Uint(200)];
        assert_eq!(from_array(&items), Err(MessageError::UnknownType(200)));
    }

    #[test]
    fn outbound_only_type_rejected_as_input() {
        let items = vec![Value::Uint(TYPE_PONG), Value::Uint(0)];
        assert_eq!(from_array(&items), Err(MessageError::UnknownType(TYPE_PONG)));
    }

    #[test]
    fn get_file_roundtrip() {
        let msg = Message::GetFile {
            path: "/tmp/x".into(),
        };
        let buf = encode_msg(&msg);
        let items = decode_array(&buf);
        assert_eq!(from_array(&items).unwrap(), msg);
    }

    #[test]
    fn set_file_bytes_are_exact() {
        // SetFile `/tmp/x` = "ABC".
        let msg = Message::SetFile {
            path: "/tmp/x".into(),
            blob: b"ABC".to_vec(),
        };
        let buf = encode_msg(&msg);
        assert_eq!(
            buf.as_ref(),
            &[0x93, 0x07, 0xa4, 0x2f, 0x74, 0x6d, 0x70, 0x2f, 0x78, 0xc4, 0x03, 0x41, 0x42, 0x43]
        );
    }

    #[test]
    fn data_bytes_are_exact() {
        // GetFile response is `92 08 c4 03 41 42 43`.
        let msg = Message::Data {
            blob: b"ABC".to_vec(),
        };
        let buf = encode_msg(&msg);
        assert_eq!(buf.as_ref(), &[0x92, 0x08, 0xc4, 0x03, 0x41, 0x42, 0x43]);
    }
}
