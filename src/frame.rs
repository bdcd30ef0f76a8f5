use crate::bundle::Bundle;
use crate::cursor::ChainCursor;
use crate::descriptor::{DescriptorTable, LengthStyle};
use anyhow::bail;

/// A message decoded from one packet body (or a completed fragment chain).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedMessage {
    pub id: u8,
    /// correlation id, present iff the message's descriptor says one precedes the payload
    pub reply_id: Option<u32>,
    pub payload: Vec<u8>,
}

/// Serialize one message into the bundle: message id, length field per the descriptor's
///  style, then the body (correlation id, if any, followed by the payload).
///
/// A `Variable` length field whose body is too big for its width gets the escape encoding:
///  the field is set to all ones, the true length is written as a u32 *in place of the first
///  four body bytes*, and those four displaced bytes are appended after the rest of the body.
///  This keeps the worst-case overhead at the field width itself while leaving short
///  messages cheap.
///
/// A `Tail` message seals its body, since nothing can follow it within the same packet.
pub fn encode_message(
    bundle: &mut Bundle,
    id: u8,
    length_style: LengthStyle,
    reply_id: Option<u32>,
    payload: &[u8],
) -> anyhow::Result<()> {
    let body_len = payload.len() + if reply_id.is_some() { 4 } else { 0 };

    match length_style {
        LengthStyle::Fixed(expected) => {
            if body_len != expected {
                bail!("message {:#04x}: fixed length {} but body is {} bytes", id, expected, body_len);
            }
            bundle.put_u8(id);
            put_body(bundle, reply_id, payload);
        }
        LengthStyle::Variable(width) => {
            let max_plain = length_style.max_plain_len()
                .expect("variable style has a plain maximum");

            if body_len <= max_plain {
                bundle.put_u8(id);
                put_len_field(bundle, width, body_len as u64);
                put_body(bundle, reply_id, payload);
            }
            else {
                if body_len > u32::MAX as usize {
                    bail!("message {:#04x}: body of {} bytes exceeds the escape encoding's limit", id, body_len);
                }
                // escape: sentinel field, true length displacing the first four body bytes,
                //  which move to the end of the message
                bundle.put_u8(id);
                put_len_field(bundle, width, u64::MAX);
                bundle.put_u32(body_len as u32);

                match reply_id {
                    Some(reply_id) => {
                        // the displaced head is exactly the correlation id
                        bundle.put_slice(payload);
                        bundle.put_u32(reply_id);
                    }
                    None => {
                        bundle.put_slice(&payload[4..]);
                        bundle.put_slice(&payload[..4]);
                    }
                }
            }
        }
        LengthStyle::Tail => {
            bundle.put_u8(id);
            put_body(bundle, reply_id, payload);
            bundle.seal_body();
        }
    }
    Ok(())
}

/// exact number of bytes `encode_message` will emit for these parameters
pub fn encoded_len(length_style: LengthStyle, has_reply_id: bool, payload_len: usize) -> usize {
    let body_len = payload_len + if has_reply_id { 4 } else { 0 };
    let escape_overhead = match length_style.max_plain_len() {
        Some(max_plain) if body_len > max_plain => 4,
        _ => 0,
    };
    1 + length_style.field_len() + body_len + escape_overhead
}

fn put_body(bundle: &mut Bundle, reply_id: Option<u32>, payload: &[u8]) {
    if let Some(reply_id) = reply_id {
        bundle.put_u32(reply_id);
    }
    bundle.put_slice(payload);
}

fn put_len_field(bundle: &mut Bundle, width: u8, value: u64) {
    let bytes = value.to_be_bytes();
    bundle.put_slice(&bytes[8 - width as usize..]);
}

/// Decode the next message the cursor points at, resolving its descriptor from the table.
pub fn decode_next<B: AsRef<[u8]>>(
    cursor: &mut ChainCursor<B>,
    table: &DescriptorTable,
) -> anyhow::Result<DecodedMessage> {
    let id = cursor.try_get_u8()?;
    let Some(descriptor) = table.get(id) else {
        bail!("unknown message id {:#04x}", id);
    };

    let body = match descriptor.length_style {
        LengthStyle::Fixed(len) => cursor.read_vec(len)?,
        LengthStyle::Variable(width) => {
            let mut field = [0u8; 8];
            cursor.read_exact(&mut field[8 - width as usize..])?;
            let field = u64::from_be_bytes(field);

            let all_ones = (1u64 << (8 * width as u64)) - 1;
            if field == all_ones {
                // escaped: the true length follows, and the four body bytes it displaced
                //  trail the message
                let true_len = cursor.try_get_u32()? as usize;
                if true_len < 4 {
                    bail!("message {}: escaped length {} is shorter than the displaced head", descriptor.name, true_len);
                }
                let middle = cursor.read_vec(true_len - 4)?;
                let mut head = [0u8; 4];
                cursor.read_exact(&mut head)?;

                let mut body = Vec::with_capacity(true_len);
                body.extend_from_slice(&head);
                body.extend_from_slice(&middle);
                body
            }
            else {
                cursor.read_vec(field as usize)?
            }
        }
        LengthStyle::Tail => cursor.read_vec(cursor.remaining())?,
    };

    if descriptor.carries_reply_id {
        if body.len() < 4 {
            bail!("message {}: body too short for a correlation id", descriptor.name);
        }
        let reply_id = u32::from_be_bytes([body[0], body[1], body[2], body[3]]);
        Ok(DecodedMessage {
            id,
            reply_id: Some(reply_id),
            payload: body[4..].to_vec(),
        })
    }
    else {
        Ok(DecodedMessage { id, reply_id: None, payload: body })
    }
}
