//! Wire framing.
//!
//! A frame is two consecutive MessagePack values: the registered type name as a string, then the
//! payload. There is no length prefix; frame boundaries come from MessagePack's own encoding.
use std::{any::Any, io::Cursor};

use bytes::{Buf, Bytes, BytesMut};
use rmp::Marker;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::trace;

use crate::{error::WireError, registry::TypeDescriptor};

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;
const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Deepest nesting of arrays and maps accepted from the peer, the same limit rmpv decodes to.
const MAX_DEPTH: usize = 1024;

/// Encodes one frame for `value` into `buf`.
///
/// The name and payload are serialized into the buffer before anything touches the stream, so a
/// payload that fails to serialize never leaves a dangling name on the wire.
pub(crate) fn encode_frame(
    name: &str,
    descriptor: &dyn TypeDescriptor,
    value: &dyn Any,
    buf: &mut Vec<u8>,
) -> Result<(), WireError> {
    rmp_serde::encode::write(buf, name)?;
    descriptor.encode(value, buf)
}

/// Decodes a type name from one complete MessagePack value.
pub(crate) fn decode_name(bytes: &[u8]) -> Result<String, WireError> {
    match rmpv::decode::read_value(&mut Cursor::new(bytes))? {
        rmpv::Value::String(s) => s
            .into_str()
            .ok_or_else(|| WireError::UnexpectedValue("type name is not valid UTF-8".into())),
        other => Err(WireError::UnexpectedValue(format!(
            "expected a type name, got {}",
            other
        ))),
    }
}

/// Progress through the value at the front of the read buffer.
///
/// The buffer only grows at the back until the value is split off, so the scan resumes where the
/// previous read left it. `pos` may point past the buffered bytes when a string or binary body
/// is still arriving.
#[derive(Debug)]
struct Scan {
    pos: usize,
    /// Items still expected at each open nesting level, outermost first.
    pending: Vec<u64>,
}

impl Scan {
    fn new() -> Self {
        Self {
            pos: 0,
            pending: vec![1],
        }
    }

    /// Advances over every item header that is fully buffered.
    ///
    /// Returns the length of the value once all of its bytes are in `buf`.
    fn advance(&mut self, buf: &[u8]) -> Result<Option<usize>, WireError> {
        loop {
            while self.pending.last() == Some(&0) {
                self.pending.pop();
            }
            if self.pending.is_empty() {
                return Ok((self.pos <= buf.len()).then_some(self.pos));
            }
            let start = self.pos;
            let Some(item) = header(&buf[buf.len().min(start)..], start)? else {
                return Ok(None);
            };
            self.pos = start
                .checked_add(item.len)
                .ok_or_else(|| malformed(start, "length overflows"))?;
            if let Some(remaining) = self.pending.last_mut() {
                *remaining -= 1;
            }
            if item.children > 0 {
                if self.pending.len() > MAX_DEPTH {
                    return Err(malformed(start, "nesting too deep"));
                }
                self.pending.push(item.children);
            }
        }
    }
}

/// One MessagePack item header: its full length, excluding any child items, and the number of
/// child items that follow it.
struct Item {
    len: usize,
    children: u64,
}

/// Parses the item header at the start of `bytes`, or returns `None` if it is not all there.
fn header(bytes: &[u8], offset: usize) -> Result<Option<Item>, WireError> {
    let Some(&first) = bytes.first() else {
        return Ok(None);
    };
    // (width of the length field, fixed bytes after it, child items)
    let (width, body, children) = match Marker::from_u8(first) {
        Marker::FixPos(_) | Marker::FixNeg(_) | Marker::Null | Marker::True | Marker::False => {
            (0, 0, 0)
        }
        Marker::Reserved => return Err(malformed(offset, "reserved marker byte 0xc1")),
        Marker::U8 | Marker::I8 => (0, 1, 0),
        Marker::U16 | Marker::I16 => (0, 2, 0),
        Marker::U32 | Marker::I32 | Marker::F32 => (0, 4, 0),
        Marker::U64 | Marker::I64 | Marker::F64 => (0, 8, 0),
        Marker::FixStr(n) => (0, usize::from(n), 0),
        Marker::FixArray(n) => (0, 0, u64::from(n)),
        Marker::FixMap(n) => (0, 0, 2 * u64::from(n)),
        Marker::FixExt1 => (0, 2, 0),
        Marker::FixExt2 => (0, 3, 0),
        Marker::FixExt4 => (0, 5, 0),
        Marker::FixExt8 => (0, 9, 0),
        Marker::FixExt16 => (0, 17, 0),
        Marker::Str8 | Marker::Bin8 => (1, 0, 0),
        Marker::Str16 | Marker::Bin16 => (2, 0, 0),
        Marker::Str32 | Marker::Bin32 => (4, 0, 0),
        // The ext type byte follows the length.
        Marker::Ext8 => (1, 1, 0),
        Marker::Ext16 => (2, 1, 0),
        Marker::Ext32 => (4, 1, 0),
        Marker::Array16 => (2, 0, 0),
        Marker::Array32 => (4, 0, 0),
        Marker::Map16 => (2, 0, 0),
        Marker::Map32 => (4, 0, 0),
    };
    if width == 0 {
        return Ok(Some(Item {
            len: 1 + body,
            children,
        }));
    }

    let Some(field) = bytes.get(1..1 + width) else {
        return Ok(None);
    };
    let count = field.iter().fold(0u64, |n, &b| (n << 8) | u64::from(b));
    let item = match Marker::from_u8(first) {
        Marker::Array16 | Marker::Array32 => Item {
            len: 1 + width,
            children: count,
        },
        Marker::Map16 | Marker::Map32 => Item {
            len: 1 + width,
            children: 2 * count,
        },
        _ => {
            let data = usize::try_from(count)
                .map_err(|_| malformed(offset, "length does not fit in memory"))?;
            Item {
                len: (1 + width + body)
                    .checked_add(data)
                    .ok_or_else(|| malformed(offset, "length overflows"))?,
                children: 0,
            }
        }
    };
    Ok(Some(item))
}

fn malformed(offset: usize, reason: &'static str) -> WireError {
    WireError::Malformed { offset, reason }
}

/// Reads complete MessagePack values from an async stream.
///
/// Partial reads are buffered internally; callers always get whole values. Reading is cancel
/// safe: dropping a pending [`ValueReader::read_value`] future loses no bytes.
pub(crate) struct ValueReader<R> {
    inner: R,
    buf: BytesMut,
    scan: Scan,
}

impl<R: AsyncRead + Unpin> ValueReader<R> {
    /// Creates a reader over `inner`.
    pub(crate) fn new(inner: R) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            scan: Scan::new(),
        }
    }

    /// Reads the raw bytes of the next complete value.
    ///
    /// Returns `WireError::ConnectionClosed` at a clean end of stream, and
    /// `WireError::Truncated` if the stream ends part way through a value. A reserved marker
    /// byte or nesting deeper than rmpv accepts yields `WireError::Malformed` after discarding
    /// the buffered bytes up to and including the offending header.
    pub(crate) async fn read_value(&mut self) -> Result<Bytes, WireError> {
        loop {
            if let Some(value) = self.split_value()? {
                return Ok(value);
            }

            // A long string or binary body announces its size up front.
            let wanted = self.scan.pos.saturating_sub(self.buf.len());
            self.buf.reserve(wanted.clamp(READ_CHUNK_SIZE, 64 * READ_CHUNK_SIZE));
            let read = self.inner.read_buf(&mut self.buf).await?;
            if read == 0 {
                self.scan = Scan::new();
                if self.buf.is_empty() {
                    return Err(WireError::ConnectionClosed);
                }
                let buffered = self.buf.len();
                self.buf.clear();
                return Err(WireError::Truncated { buffered });
            }
        }
    }

    /// Reads and discards the next complete value.
    pub(crate) async fn skip_value(&mut self) -> Result<(), WireError> {
        let skipped = self.read_value().await?;
        trace!("skipped {} bytes", skipped.len());
        Ok(())
    }

    /// Splits one complete value off the front of the buffer, if there is one.
    fn split_value(&mut self) -> Result<Option<Bytes>, WireError> {
        match self.scan.advance(&self.buf) {
            Ok(Some(len)) => {
                self.scan = Scan::new();
                Ok(Some(self.buf.split_to(len).freeze()))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                // The offending header is always buffered.
                if let WireError::Malformed { offset, .. } = e {
                    self.buf.advance((offset + 1).min(self.buf.len()));
                }
                self.scan = Scan::new();
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registry;
    use serde::{Deserialize, Serialize};
    use tokio::io::AsyncWriteExt;

    #[derive(Serialize, Deserialize, Default, Debug, PartialEq)]
    struct Point {
        x: i64,
        y: i64,
    }

    lazy_static::lazy_static! {
        static ref REGISTRY: Registry = {
            let mut registry = Registry::new();
            registry.register::<String>("greeting").unwrap();
            registry.register::<Point>("point").unwrap();
            registry
        };
    }

    fn frame<T: Any>(name: &str, value: &T) -> Vec<u8> {
        let descriptor = REGISTRY.resolve_by_name(name).unwrap();
        let mut buf = Vec::new();
        encode_frame(name, descriptor, value, &mut buf).unwrap();
        buf
    }

    fn decode_point(bytes: &[u8]) -> Point {
        let descriptor = REGISTRY.resolve_by_name("point").unwrap();
        let mut instance = descriptor.new_instance();
        descriptor.decode_into(bytes, instance.as_mut()).unwrap();
        *instance.downcast::<Point>().unwrap()
    }

    #[tokio::test]
    async fn test_frames_back_to_back() {
        let mut wire = frame("greeting", &String::from("hello"));
        wire.extend(frame("point", &Point { x: 1, y: 2 }));

        let mut reader = ValueReader::new(&wire[..]);
        assert_eq!(decode_name(&reader.read_value().await.unwrap()).unwrap(), "greeting");
        let payload = reader.read_value().await.unwrap();
        assert_eq!(rmp_serde::from_slice::<String>(&payload).unwrap(), "hello");
        assert_eq!(decode_name(&reader.read_value().await.unwrap()).unwrap(), "point");
        assert_eq!(decode_point(&reader.read_value().await.unwrap()), Point { x: 1, y: 2 });
        assert!(matches!(
            reader.read_value().await,
            Err(WireError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_partial_writes_are_reassembled() {
        let wire = frame("point", &Point { x: -7, y: 300 });
        let (mut tx, rx) = tokio::io::duplex(64);
        let writer = tokio::spawn(async move {
            for byte in wire {
                tx.write_all(&[byte]).await.unwrap();
                tokio::task::yield_now().await;
            }
        });

        let mut reader = ValueReader::new(rx);
        assert_eq!(decode_name(&reader.read_value().await.unwrap()).unwrap(), "point");
        assert_eq!(decode_point(&reader.read_value().await.unwrap()), Point { x: -7, y: 300 });
        writer.await.unwrap();
        assert!(matches!(
            reader.read_value().await,
            Err(WireError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_truncated_value() {
        let wire = frame("greeting", &String::from("hello"));
        let mut reader = ValueReader::new(&wire[..wire.len() - 2]);
        reader.read_value().await.unwrap();
        let err = reader.read_value().await.unwrap_err();
        assert!(matches!(err, WireError::Truncated { buffered: 4 }));
        assert!(err.is_closed());
    }

    #[tokio::test]
    async fn test_nested_value_split_whole() {
        let value = rmpv::Value::Map(vec![
            (
                rmpv::Value::from("list"),
                rmpv::Value::Array(vec![1.into(), "two".into(), rmpv::Value::Nil]),
            ),
            (rmpv::Value::from("bin"), rmpv::Value::Binary(vec![0; 300])),
            (rmpv::Value::from(3.5f64), rmpv::Value::Ext(7, vec![1, 2, 3])),
        ]);
        let mut wire = Vec::new();
        rmpv::encode::write_value(&mut wire, &value).unwrap();
        let len = wire.len();
        rmpv::encode::write_value(&mut wire, &rmpv::Value::from(-1)).unwrap();

        let mut reader = ValueReader::new(&wire[..]);
        let first = reader.read_value().await.unwrap();
        assert_eq!(first.len(), len);
        assert_eq!(rmpv::decode::read_value(&mut &first[..]).unwrap(), value);
        let second = reader.read_value().await.unwrap();
        assert_eq!(&second[..], &[0xff]);
    }

    #[tokio::test]
    async fn test_large_value_in_small_reads() {
        let text = "x".repeat(4 * 1024 * 1024);
        let wire = frame("greeting", &text);
        let (mut tx, rx) = tokio::io::duplex(1024);
        let writer = tokio::spawn(async move { tx.write_all(&wire).await.unwrap() });

        let mut reader = ValueReader::new(rx);
        reader.read_value().await.unwrap();
        let payload = reader.read_value().await.unwrap();
        assert_eq!(rmp_serde::from_slice::<String>(&payload).unwrap(), text);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_reserved_byte_is_malformed() {
        let mut wire = vec![0xc1];
        wire.extend(frame("greeting", &String::from("after")));

        let mut reader = ValueReader::new(&wire[..]);
        assert!(matches!(
            reader.read_value().await,
            Err(WireError::Malformed { offset: 0, .. })
        ));
        assert_eq!(decode_name(&reader.read_value().await.unwrap()).unwrap(), "greeting");
    }

    #[tokio::test]
    async fn test_deep_nesting_is_malformed() {
        // One-element arrays, each holding the next.
        let mut wire = vec![0x91; MAX_DEPTH + 1];
        wire.push(0xc0);
        let mut reader = ValueReader::new(&wire[..]);
        assert!(matches!(
            reader.read_value().await,
            Err(WireError::Malformed { .. })
        ));
    }

    #[test]
    fn test_name_must_be_a_string() {
        let mut buf = Vec::new();
        rmp::encode::write_sint(&mut buf, 42).unwrap();
        assert!(matches!(
            decode_name(&buf),
            Err(WireError::UnexpectedValue(_))
        ));
    }

    #[test]
    fn test_encode_rejects_wrong_type() {
        let descriptor = REGISTRY.resolve_by_name("point").unwrap();
        let mut buf = Vec::new();
        let err = encode_frame("point", descriptor, &String::from("not a point"), &mut buf);
        assert!(matches!(err, Err(WireError::UnexpectedValue(_))));
    }
}
