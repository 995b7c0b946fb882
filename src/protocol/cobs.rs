//! Link-level byte stuffing used on the hub characteristics.
//!
//! The hub uses a COBS variant: the delimiter is `0x02` instead of `0x00`,
//! every byte `<= 0x02` is escaped into the preceding code word, blocks are
//! capped at 84 bytes, and the encoded buffer is XORed with `0x03` so no
//! control characters reach the wire. A frame ends with the delimiter and may
//! start with a `0x01` priority byte.

use crate::error::FrameError;

/// Marks the end of a frame on the wire
pub const DELIMITER: u8 = 0x02;

/// Optional first byte of high priority frames
pub const PRIORITY_PREFIX: u8 = 0x01;

/// Code word meaning "block without delimiter"
const NO_DELIMITER: u8 = 0xFF;

/// Offset added to every code word
const CODE_OFFSET: u8 = DELIMITER;

/// Maximum block size including the code word
const MAX_BLOCK_SIZE: usize = 84;

/// XOR mask applied after encoding
const XOR_MASK: u8 = 0x03;

/// Encode `data` so that no byte `<= 0x02` remains
pub fn encode(data: &[u8]) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(data.len() + data.len() / MAX_BLOCK_SIZE + 2);

    let mut code_index = buffer.len();
    buffer.push(NO_DELIMITER);
    let mut block: usize = 1;

    for &byte in data {
        if byte > DELIMITER {
            buffer.push(byte);
            block += 1;
        }

        if byte <= DELIMITER || block > MAX_BLOCK_SIZE {
            if byte <= DELIMITER {
                let delimiter_base = byte as usize * MAX_BLOCK_SIZE;
                let block_offset = block + CODE_OFFSET as usize;
                buffer[code_index] = (delimiter_base + block_offset) as u8;
            }
            code_index = buffer.len();
            buffer.push(NO_DELIMITER);
            block = 1;
        }
    }

    buffer[code_index] = (block + CODE_OFFSET as usize) as u8;
    buffer
}

/// Split a code word into the escaped value and the block length
fn unescape(code: u8) -> Result<(Option<u8>, usize), FrameError> {
    if code == NO_DELIMITER {
        return Ok((None, MAX_BLOCK_SIZE + 1));
    }
    let raw = code
        .checked_sub(CODE_OFFSET)
        .ok_or_else(|| FrameError::MalformedFrame(format!("invalid code word {code:#04x}")))?
        as usize;
    let mut value = raw / MAX_BLOCK_SIZE;
    let mut block = raw % MAX_BLOCK_SIZE;
    if block == 0 {
        block = MAX_BLOCK_SIZE;
        value = value
            .checked_sub(1)
            .ok_or_else(|| FrameError::MalformedFrame(format!("invalid code word {code:#04x}")))?;
    }
    Ok((Some(value as u8), block))
}

/// Decode a buffer produced by [`encode`]
pub fn decode(data: &[u8]) -> Result<Vec<u8>, FrameError> {
    let (&first, rest) = data
        .split_first()
        .ok_or_else(|| FrameError::MalformedFrame("empty COBS block".to_string()))?;

    let mut buffer = Vec::with_capacity(data.len());
    let (mut value, mut block) = unescape(first)?;

    for &byte in rest {
        block -= 1;
        if block > 0 {
            buffer.push(byte);
            continue;
        }
        if let Some(value) = value {
            buffer.push(value);
        }
        (value, block) = unescape(byte)?;
    }

    Ok(buffer)
}

/// Encode, mask and terminate `data` for transmission
pub fn pack(data: &[u8]) -> Vec<u8> {
    let mut buffer = encode(data);
    for byte in buffer.iter_mut() {
        *byte ^= XOR_MASK;
    }
    buffer.push(DELIMITER);
    buffer
}

/// Reverse [`pack`]. Accepts the frame with or without its trailing
/// delimiter and strips a leading priority byte.
pub fn unpack(frame: &[u8]) -> Result<Vec<u8>, FrameError> {
    let mut body = frame;
    if let Some((&PRIORITY_PREFIX, rest)) = body.split_first() {
        body = rest;
    }
    if let Some((&DELIMITER, rest)) = body.split_last() {
        body = rest;
    }
    let unmasked: Vec<u8> = body.iter().map(|b| b ^ XOR_MASK).collect();
    decode(&unmasked)
}
