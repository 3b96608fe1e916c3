//! Error taxonomy shared by the downloader and uploader coordinators (spec §7).

use thiserror::Error;

/// Terminal error kinds a unit or aggregate stream can carry.
///
/// Cloneable so the same error can be recorded on a [`crate::record::Record`]
/// (§3 `error`) and also moved into the terminal stream event.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransferError {
    #[error("canceled by user")]
    CanceledByUser,

    #[error("descriptor did not yield a valid URL")]
    InvalidUrl,

    #[error("destination is not a local file URL")]
    InvalidFileUrl,

    #[error("no data in local store: {0}")]
    NoDataInLocal(String),

    #[error("server error: {0}")]
    ServerError(u16),

    #[error("server error {status}: {body}")]
    ServerErrorHtml { status: u16, body: String },

    #[error("encoding error: {0}")]
    EncodingError(String),

    #[error("decoding error: {0}")]
    DecodingError(String),

    #[error("upload exceeds maximum payload size")]
    OverLimitedFileSize,

    #[error("{0}")]
    FailureReason(String),

    #[error("transport error: {0}")]
    Transport(String),
}

pub type TransferResult<T> = Result<T, TransferError>;

/// HTML-error-page heuristic from §6: `<("[^"]*"|'[^']*'|[^'">])*>`.
///
/// Out of scope to implement generally (it belongs to the external REST
/// helper per §1), but the core uploader/downloader need it too for the
/// `ServerErrorHtml` variant, so it lives here rather than being duplicated.
pub(crate) fn looks_like_html(body: &str) -> bool {
    // A small hand-rolled matcher for the exact heuristic in §6 rather than
    // pulling in a regex dependency for one pattern.
    let bytes = body.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'<' {
            let mut j = i + 1;
            loop {
                if j >= bytes.len() {
                    break;
                }
                match bytes[j] {
                    b'>' => return true,
                    b'"' => {
                        j += 1;
                        while j < bytes.len() && bytes[j] != b'"' {
                            j += 1;
                        }
                        if j >= bytes.len() {
                            break;
                        }
                        j += 1;
                    }
                    b'\'' => {
                        j += 1;
                        while j < bytes.len() && bytes[j] != b'\'' {
                            j += 1;
                        }
                        if j >= bytes.len() {
                            break;
                        }
                        j += 1;
                    }
                    _ => j += 1,
                }
            }
        }
        i += 1;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_html_error_pages() {
        assert!(looks_like_html("<html><body>oops</body></html>"));
        assert!(looks_like_html(r#"<div class="error">not found</div>"#));
        assert!(!looks_like_html("{\"error\": \"not found\"}"));
        assert!(!looks_like_html("plain text error"));
    }
}
