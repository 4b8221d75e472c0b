//! Splits a bundle script into pieces small enough to send one at a time.

use std::io::BufRead;

use tokio::sync::mpsc;
use tracing::debug;

use crate::error::Result;

/// Bytes gathered before a piece is handed to the database.
pub const SCRIPT_PIECE_BYTES: usize = 1 << 20;

/// Pieces read ahead of the one being applied.
const READ_AHEAD: usize = 4;

/// Groups whole statements into pieces of at least `limit` bytes.
///
/// A statement ends at a line ending in `;` outside a quoted literal. Quotes
/// are tracked by parity, which holds for scripts written by this crate:
/// embedded quotes are always doubled and backslashes never escape a quote.
pub struct ScriptPieces<R> {
    reader: R,
    limit: usize,
    in_quote: bool,
    done: bool,
}

impl<R: BufRead> ScriptPieces<R> {
    pub fn new(reader: R, limit: usize) -> Self {
        Self {
            reader,
            limit,
            in_quote: false,
            done: false,
        }
    }
}

impl<R: BufRead> Iterator for ScriptPieces<R> {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let mut piece = String::new();
        loop {
            let start = piece.len();
            match self.reader.read_line(&mut piece) {
                Ok(0) => {
                    self.done = true;
                    return (!piece.trim().is_empty()).then_some(Ok(piece));
                }
                Ok(_) => {
                    let line = &piece[start..];
                    if line.matches('\'').count() % 2 == 1 {
                        self.in_quote = !self.in_quote;
                    }
                    if !self.in_quote && line.trim_end().ends_with(';') && piece.len() >= self.limit {
                        return Some(Ok(piece));
                    }
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e.into()));
                }
            }
        }
    }
}

/// Read `reader` on a blocking thread and deliver its pieces in order.
pub fn stream_script(reader: Box<dyn BufRead + Send>) -> mpsc::Receiver<Result<String>> {
    let (tx, rx) = mpsc::channel(READ_AHEAD);
    tokio::task::spawn_blocking(move || {
        let mut sent = 0usize;
        for piece in ScriptPieces::new(reader, SCRIPT_PIECE_BYTES) {
            let failed = piece.is_err();
            if tx.blocking_send(piece).is_err() || failed {
                break;
            }
            sent += 1;
        }
        debug!("Script reader finished after {} pieces", sent);
    });
    rx
}
