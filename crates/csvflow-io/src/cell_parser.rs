//! Quote-aware splitting of one delimited line into named cells.

use csvflow_core::{Cell, ConvertError};

/// Field separator.
pub const DELIMITER: char = ',';

/// Quote character. A quoted span may contain delimiters and is kept
/// verbatim, quotes included.
pub const QUOTE: char = '"';

/// Split `text` on every delimiter that is not inside a quoted span.
///
/// Empty fields are kept, including a trailing one.
pub fn split_line(text: &str) -> Vec<&str> {
    let mut fields = Vec::new();
    let mut start = 0;
    let mut quoted = false;
    for (i, c) in text.char_indices() {
        match c {
            QUOTE => quoted = !quoted,
            DELIMITER if !quoted => {
                fields.push(&text[start..i]);
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }
    fields.push(&text[start..]);
    fields
}

/// Parse the header line into the field names every data line is matched
/// against by position.
pub fn parse_header(text: &str) -> Vec<String> {
    split_line(text).into_iter().map(str::to_owned).collect()
}

/// Parse one data line into cells named after `header`.
///
/// Fails with [`ConvertError::Parse`] when the field count differs from the
/// header's.
pub fn parse_line(text: &str, header: &[String]) -> Result<Vec<Cell>, ConvertError> {
    let fields = split_line(text);
    if fields.len() != header.len() {
        return Err(ConvertError::Parse {
            expected: header.len(),
            found: fields.len(),
        });
    }
    Ok(header
        .iter()
        .zip(fields)
        .map(|(name, value)| Cell::new(name.as_str(), value))
        .collect())
}
