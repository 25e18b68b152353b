//! Content checks applied to every origin response before it is stored.

use crate::error::ProtocolViolation;
use crate::origin::OriginResponse;

/// Validate a response meant to carry tile bytes.
///
/// Checks, in order:
/// 1. Status is 2xx
/// 2. `Content-Type` is an `image/*` type (a missing header fails too)
/// 3. A declared `Content-Length` matches the bytes read
/// 4. The payload starts with a known image signature
pub fn validate_response(response: &OriginResponse) -> Result<(), ProtocolViolation> {
    if !response.status.is_success() {
        return Err(ProtocolViolation::HttpStatus(response.status.as_u16()));
    }

    let content_type = response.content_type().unwrap_or_default();
    if !is_image_type(content_type) {
        return Err(ProtocolViolation::ContentType(content_type.to_string()));
    }

    let actual = response.body.len() as u64;
    if let Some(expected) = response.content_length() {
        if expected != actual {
            return Err(ProtocolViolation::ContentLength { expected, actual });
        }
    }

    image::guess_format(&response.body).map_err(|_| ProtocolViolation::UnknownImageFormat)?;

    Ok(())
}

fn is_image_type(content_type: &str) -> bool {
    content_type
        .trim()
        .get(..6)
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case("image/"))
}
