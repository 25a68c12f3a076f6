//! Wire encodings for RSC paths and server function ids.
//!
//! RSC paths travel inside URL paths under the RSC prefix:
//!
//! ```text
//! ""             -> "_.txt"
//! "about"        -> "about.txt"
//! "/blog/post/"  -> "_/blog/post/_.txt"
//! ```
//!
//! Function ids (`<module>#<export>`) are carried as RSC paths with the `F/`
//! prefix:
//!
//! ```text
//! "/src/actions.ts#save" -> "F/_/src/actions.ts/save"
//! ```

use crate::error::{Result, RscError};
use percent_encoding::percent_decode_str;

/// Mandatory suffix of every encoded RSC path.
pub const RSC_PATH_SUFFIX: &str = ".txt";

/// Marker that protects leading/trailing characters from URL normalization.
pub const HIDDEN_MARKER: char = '_';

/// Prefix distinguishing function invocations from component paths.
pub const FUNC_PREFIX: &str = "F/";

fn needs_marker(c: char) -> bool {
    c == HIDDEN_MARKER || c == '/'
}

/// Encode a logical RSC path into its URL form.
///
/// Satisfies `decode_rsc_path(&encode_rsc_path(p)) == Ok(p)` for every `p`.
pub fn encode_rsc_path(rsc_path: &str) -> String {
    let mut encoded = String::with_capacity(rsc_path.len() + RSC_PATH_SUFFIX.len() + 2);
    match rsc_path.chars().next() {
        None => encoded.push(HIDDEN_MARKER),
        Some(first) if needs_marker(first) => encoded.push(HIDDEN_MARKER),
        Some(_) => {}
    }
    encoded.push_str(rsc_path);
    if rsc_path.chars().last().is_some_and(needs_marker) {
        encoded.push(HIDDEN_MARKER);
    }
    encoded.push_str(RSC_PATH_SUFFIX);
    encoded
}

/// Decode the URL form of an RSC path.
///
/// # Errors
///
/// Returns [`RscError::InvalidEncoding`] if the suffix is missing.
pub fn decode_rsc_path(encoded: &str) -> Result<String> {
    let Some(stripped) = encoded.strip_suffix(RSC_PATH_SUFFIX) else {
        return Err(RscError::InvalidEncoding(format!(
            "rsc path must end with {RSC_PATH_SUFFIX}: {encoded}"
        )));
    };
    let stripped = stripped.strip_prefix(HIDDEN_MARKER).unwrap_or(stripped);
    let stripped = stripped.strip_suffix(HIDDEN_MARKER).unwrap_or(stripped);
    Ok(stripped.to_string())
}

/// Encode a `<module>#<export>` function id.
///
/// # Errors
///
/// Returns [`RscError::InvalidEncoding`] when the id has no `#` or the export
/// name contains `/` (decoding splits at the last `/`).
pub fn encode_func_id(func_id: &str) -> Result<String> {
    let Some((module, export)) = func_id.rsplit_once('#') else {
        return Err(RscError::InvalidEncoding(format!(
            "function id must look like <module>#<export>: {func_id}"
        )));
    };
    if export.contains('/') {
        return Err(RscError::InvalidEncoding(format!(
            "export name must not contain '/': {export}"
        )));
    }

    let mut encoded = String::from(FUNC_PREFIX);
    if module.chars().next().is_some_and(needs_marker) {
        encoded.push(HIDDEN_MARKER);
    }
    encoded.push_str(module);
    if module.chars().last().is_some_and(needs_marker) {
        encoded.push(HIDDEN_MARKER);
    }
    encoded.push('/');
    encoded.push_str(export);
    Ok(encoded)
}

/// Decode a function id from a decoded RSC path.
///
/// Returns `None` when the path is not a function id. Splits at the last `/`
/// since module paths contain slashes themselves; without one the module is
/// empty (`F/save` -> `#save`).
pub fn decode_func_id(encoded: &str) -> Option<String> {
    let rest = encoded.strip_prefix(FUNC_PREFIX)?;
    let (module, export) = rest.rsplit_once('/').unwrap_or(("", rest));
    let module = module.strip_prefix(HIDDEN_MARKER).unwrap_or(module);
    let module = module.strip_suffix(HIDDEN_MARKER).unwrap_or(module);
    Some(format!("{module}#{export}"))
}

/// Characters whose escapes [`decode_uri`] leaves encoded.
const URI_RESERVED: &[u8] = b";/?:@&=+$,#";

/// Percent-decode a URL path the way `decodeURI` does.
///
/// Escapes of reserved characters (`%2F`, `%3F`, `%23`, ...) stay encoded, so
/// an encoded slash never becomes a path separator.
///
/// # Errors
///
/// Returns [`RscError::InvalidEncoding`] if the decoded bytes are not UTF-8.
pub fn decode_uri(encoded: &str) -> Result<String> {
    let bytes = encoded.as_bytes();
    let mut decoded = String::with_capacity(encoded.len());
    let mut start = 0;
    let mut i = 0;

    while i < bytes.len() {
        let reserved = bytes[i] == b'%'
            && i + 2 < bytes.len()
            && std::str::from_utf8(&bytes[i + 1..i + 3])
                .ok()
                .and_then(|hex| u8::from_str_radix(hex, 16).ok())
                .is_some_and(|b| URI_RESERVED.contains(&b));
        if reserved {
            decoded.push_str(&decode_segment(&encoded[start..i])?);
            decoded.push_str(&encoded[i..i + 3]);
            i += 3;
            start = i;
        } else {
            i += 1;
        }
    }
    decoded.push_str(&decode_segment(&encoded[start..])?);
    Ok(decoded)
}

fn decode_segment(segment: &str) -> Result<String> {
    percent_decode_str(segment)
        .decode_utf8()
        .map(|s| s.into_owned())
        .map_err(|e| RscError::InvalidEncoding(format!("rsc path is not valid UTF-8: {e}")))
}
