use crate::error::FrameError;
use serde::de::DeserializeOwned;
use std::io::Read;

/**
 * Reads one length-delimited frame written by `sender::write_frame` and
 * decodes it. Blocks until the whole frame arrived, the stream ended or the
 * stream's read timeout expired.
 *
 * # Arguments
 *
 * `stream` - Where the frame is read from.
 *
 * `max_frame_size` - Largest payload accepted, in bytes. Larger headers are
 * rejected before anything else is read.
 */
pub fn read_frame<R: Read, T: DeserializeOwned>(
    stream: &mut R,
    max_frame_size: usize,
) -> Result<T, FrameError> {
    let mut header = [0u8; 4];
    stream.read_exact(&mut header)?;

    let len = u32::from_be_bytes(header) as usize;
    if len > max_frame_size {
        return Err(FrameError::TooLarge {
            len,
            max: max_frame_size,
        });
    }

    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload)?;

    Ok(bincode::deserialize(&payload)?)
}
