//! Command and reply encoding
//!
//! Commands only ever need [`encode_command`]; [`encode_frame`] writes
//! arbitrary replies and is what the in-process test servers answer with.

use bytes::{BufMut, BytesMut};

use super::Frame;

/// Append the wire form of `frame` to `buf`.
pub fn encode_frame(frame: &Frame, buf: &mut BytesMut) {
    match frame {
        Frame::Simple(text) => put_line(buf, b'+', text),
        Frame::Error(text) => put_line(buf, b'-', text),
        Frame::Integer(n) => put_line(buf, b':', n.to_string().as_bytes()),
        Frame::Bulk(Some(payload)) => put_bulk(buf, payload),
        Frame::Bulk(None) => buf.put_slice(b"$-1\r\n"),
        Frame::Array(Some(items)) => {
            put_line(buf, b'*', items.len().to_string().as_bytes());
            items.iter().for_each(|item| encode_frame(item, buf));
        }
        Frame::Array(None) => buf.put_slice(b"*-1\r\n"),
        Frame::Null => buf.put_slice(b"_\r\n"),
    }
}

/// Append `args` as an array of bulk strings, the only shape servers accept
/// commands in. Arguments are copied verbatim so binary keys are safe.
pub fn encode_command<A: AsRef<[u8]>>(args: &[A], buf: &mut BytesMut) {
    put_line(buf, b'*', args.len().to_string().as_bytes());
    for arg in args {
        put_bulk(buf, arg.as_ref());
    }
}

fn put_line(buf: &mut BytesMut, tag: u8, body: &[u8]) {
    buf.reserve(body.len() + 3);
    buf.put_u8(tag);
    buf.put_slice(body);
    buf.put_slice(b"\r\n");
}

fn put_bulk(buf: &mut BytesMut, payload: &[u8]) {
    put_line(buf, b'$', payload.len().to_string().as_bytes());
    buf.put_slice(payload);
    buf.put_slice(b"\r\n");
}
