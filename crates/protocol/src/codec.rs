//! Field codec for handshake messages.
//!
//! A message is an ordered list of opaque byte fields joined by a fixed
//! 10-byte all-zero [`DELIMITER`]. Decoding splits on every occurrence of the
//! delimiter, so empty fields survive a round trip.
//!
//! The format is not length-prefixed. A field that itself contains the
//! delimiter is mis-split on decode. Peers depend on this exact layout (it is
//! also the layout of every signed payload), so it is kept as is; use
//! [`contains_delimiter`] to refuse such fields before encoding.

/// Separator placed between fields.
pub const DELIMITER: [u8; 10] = [0u8; 10];

/// Joins `fields` with [`DELIMITER`].
pub fn encode<T: AsRef<[u8]>>(fields: &[T]) -> Vec<u8> {
    let body: usize = fields.iter().map(|f| f.as_ref().len()).sum();
    let mut output =
        Vec::with_capacity(body + DELIMITER.len() * fields.len().saturating_sub(1));

    for (i, field) in fields.iter().enumerate() {
        if i > 0 {
            output.extend_from_slice(&DELIMITER);
        }
        output.extend_from_slice(field.as_ref());
    }

    output
}

/// Splits `data` on every occurrence of [`DELIMITER`].
///
/// Matches are consumed left to right without overlap. An empty input decodes
/// to a single empty field.
pub fn decode(data: &[u8]) -> Vec<Vec<u8>> {
    let mut fields = Vec::new();
    let mut start = 0;
    let mut i = 0;

    while i + DELIMITER.len() <= data.len() {
        if data[i..i + DELIMITER.len()] == DELIMITER {
            fields.push(data[start..i].to_vec());
            i += DELIMITER.len();
            start = i;
        } else {
            i += 1;
        }
    }
    fields.push(data[start..].to_vec());

    fields
}

/// Returns true if `field` would be mis-split by [`decode`].
pub fn contains_delimiter(field: &[u8]) -> bool {
    field.windows(DELIMITER.len()).any(|w| w == DELIMITER)
}
