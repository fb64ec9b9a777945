//! Classifies errors that mean "the peer went away".
//!
//! A reset or closed socket is the normal end of a connection, not a fault,
//! so it is logged quietly. The check walks the whole `source()` chain since
//! the I/O error is usually wrapped by a codec or runtime error.

use std::error::Error as StdError;
use std::io::ErrorKind;

/// Returns true if `err`, or any error in its source chain, is a disconnection.
pub fn is_disconnection(err: &(dyn StdError + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            if is_disconnection_kind(io.kind()) {
                return true;
            }
        }
        current = e.source();
    }
    false
}

fn is_disconnection_kind(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof
            | ErrorKind::NotConnected
    )
}
