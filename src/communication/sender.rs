use crate::error::FrameError;
use serde::Serialize;
use std::io::Write;

/**
 * Writes one length-delimited frame: a big-endian u32 byte count followed by
 * the bincode encoding of the message. The writer is flushed.
 *
 * # Arguments
 *
 * `stream` - Where the frame is written.
 *
 * `message` - Message to encode.
 *
 * `max_frame_size` - Largest payload allowed, in bytes.
 */
pub fn write_frame<W: Write, T: Serialize>(
    stream: &mut W,
    message: &T,
    max_frame_size: usize,
) -> Result<(), FrameError> {
    let payload = bincode::serialize(message)?;

    if payload.len() > max_frame_size || payload.len() > u32::MAX as usize {
        return Err(FrameError::TooLarge {
            len: payload.len(),
            max: max_frame_size,
        });
    }

    //Header and payload are sent as a single write
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&payload);

    stream.write_all(&frame)?;
    stream.flush()?;

    Ok(())
}
