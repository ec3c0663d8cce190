// Length-prefixed framing for byte streams.
//
// Wire format: `[u32 big-endian length][length bytes]`. The framing layer is
// payload-agnostic; `codec.rs` turns envelopes into the bytes carried here.
//
// `read_frame` distinguishes a clean close at a frame boundary (`Ok(None)`)
// from a stream that dies mid-frame (`UnexpectedEof`), so callers can tell a
// peer hanging up from a truncated message.
//
// `MAX_FRAME_SIZE` bounds the allocation a hostile length prefix can force.
// Full state syncs are the largest frames in practice.

use std::io::{self, ErrorKind, Read, Write};

/// Largest accepted frame body (8 MB).
pub const MAX_FRAME_SIZE: u32 = 8 * 1024 * 1024;

/// Write one frame and flush.
pub fn write_frame<W: Write>(writer: &mut W, body: &[u8]) -> io::Result<()> {
    let len = u32::try_from(body.len())
        .ok()
        .filter(|len| *len <= MAX_FRAME_SIZE)
        .ok_or_else(|| {
            io::Error::new(
                ErrorKind::InvalidInput,
                format!(
                    "frame of {} bytes exceeds limit of {MAX_FRAME_SIZE}",
                    body.len()
                ),
            )
        })?;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(body)?;
    writer.flush()
}

/// Read one frame. Returns `Ok(None)` when the stream ends cleanly before
/// the first byte of a length prefix.
pub fn read_frame<R: Read>(reader: &mut R) -> io::Result<Option<Vec<u8>>> {
    let mut prefix = [0u8; 4];
    let mut filled = 0;
    while filled < prefix.len() {
        match reader.read(&mut prefix[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => {
                return Err(io::Error::new(
                    ErrorKind::UnexpectedEof,
                    "stream closed inside a length prefix",
                ));
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }

    let len = u32::from_be_bytes(prefix);
    if len > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            ErrorKind::InvalidData,
            format!("frame length {len} exceeds limit of {MAX_FRAME_SIZE}"),
        ));
    }
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body)?;
    Ok(Some(body))
}
