//! Serve the protocol over a pair of byte streams, one request per line.
//!
//! Used by `initiative serve` with stdin/stdout. Logging never goes to the
//! output stream.

use crate::protocol::{Request, Response, dispatch};
use crate::store::Store;
use eyre::{Context, Result};
use std::io::{BufRead, Write};

/// Answer requests from `input` until EOF or `Shutdown`. Returns the number
/// of requests handled.
pub fn serve<R: BufRead, W: Write>(store: &mut Store, input: R, mut output: W) -> Result<usize> {
    let mut handled = 0;

    for line in input.lines() {
        let line = line.context("Failed to read request")?;
        if line.trim().is_empty() {
            continue;
        }

        let (response, stop) = match serde_json::from_str::<Request>(&line) {
            Ok(request) => {
                let stop = matches!(request, Request::Shutdown);
                (dispatch(store, request), stop)
            }
            Err(e) => {
                log::warn!("Malformed request: {}", e);
                (Response::error(format!("Invalid request: {}", e)), false)
            }
        };
        handled += 1;

        serde_json::to_writer(&mut output, &response)?;
        output.write_all(b"\n")?;
        output.flush().context("Failed to write response")?;

        if stop {
            log::info!("Shutdown requested over stdio");
            break;
        }
    }

    Ok(handled)
}
