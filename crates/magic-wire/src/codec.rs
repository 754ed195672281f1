//! Stream framing: read whole frames off a blocking byte stream.

use std::io::{self, Read};

use bytes::BytesMut;

use crate::message::{HEADER_LEN, MAX_FRAME_LEN};

/// Read exactly one frame from `stream`.
///
/// Returns `Ok(None)` on clean EOF at a frame boundary. A short read inside
/// a frame is an error — the peer died mid-message.
pub fn read_frame<R: Read>(stream: &mut R) -> io::Result<Option<BytesMut>> {
    let mut header = [0u8; HEADER_LEN];
    let mut filled = 0;
    while filled < HEADER_LEN {
        let n = stream.read(&mut header[filled..])?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed inside frame header",
            ));
        }
        filled += n;
    }

    let declared =
        ((header[1] as usize) << 16) | ((header[2] as usize) << 8) | header[3] as usize;
    if declared < HEADER_LEN || declared > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("bad frame length {declared}"),
        ));
    }

    let mut frame = BytesMut::with_capacity(declared);
    frame.extend_from_slice(&header);
    frame.resize(declared, 0);
    stream.read_exact(&mut frame[HEADER_LEN..])?;
    Ok(Some(frame))
}

/// Extract complete frames from an accumulating buffer (non-blocking I/O
/// variant). Returns `None` until a whole frame is buffered.
pub fn split_frame(buf: &mut BytesMut) -> Option<BytesMut> {
    if buf.len() < HEADER_LEN {
        return None;
    }
    let declared = ((buf[1] as usize) << 16) | ((buf[2] as usize) << 8) | buf[3] as usize;
    if declared < HEADER_LEN || declared > MAX_FRAME_LEN {
        // Unrecoverable framing error: surface the bad frame and let the
        // caller fail decoding it.
        let garbage = buf.split();
        return Some(garbage);
    }
    if buf.len() < declared {
        return None;
    }
    Some(buf.split_to(declared))
}
