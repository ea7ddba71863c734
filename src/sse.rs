//! Upstream SSE transcoding: bytes in, normalized `data:` frames out.
//!
//! The pipeline is a chain of lazy stream adapters, so nothing is read from
//! the upstream body until the outbound response asks for the next frame.

use bytes::Bytes;
use futures::{Stream, TryStreamExt};
use std::error::Error;
use std::io;
use tokio_util::codec::FramedRead;
use tokio_util::io::StreamReader;

use crate::protocol::NormalizedEvent;

mod lines;
mod normalize;

pub use lines::LineCodec;
pub use normalize::{normalize_line, parse_payload};

/// One unit of outbound SSE output.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Event(NormalizedEvent),
    Raw(String),
}

impl Frame {
    pub fn into_bytes(self) -> io::Result<Bytes> {
        match self {
            Frame::Event(event) => {
                let json = serde_json::to_string(&event).map_err(io::Error::other)?;
                Ok(Bytes::from(format!("data: {json}\n\n")))
            }
            Frame::Raw(mut line) => {
                line.push('\n');
                Ok(Bytes::from(line))
            }
        }
    }
}

/// Reassembles `body` into lines, normalizes each one and re-encodes it.
///
/// A read error from `body` ends the returned stream with that error; frames
/// already yielded stay yielded.
pub fn transcode<S, E>(body: S) -> impl Stream<Item = io::Result<Bytes>> + Send + 'static
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Into<Box<dyn Error + Send + Sync>> + 'static,
{
    let reader = StreamReader::new(Box::pin(body.map_err(io::Error::other)));

    FramedRead::new(reader, LineCodec::new()).try_filter_map(|line| async move {
        normalize_line(&line).map(Frame::into_bytes).transpose()
    })
}
