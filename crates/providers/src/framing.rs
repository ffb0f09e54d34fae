use std::collections::VecDeque;
use std::fmt::Display;
use std::pin::Pin;

use core_types::{ChunkStream, GatewayError};
use futures::{Stream, StreamExt};

/// Buffers transport reads and hands out complete `\n`-terminated lines.
#[derive(Debug, Default)]
pub(crate) struct LineFramer {
    buffer: Vec<u8>,
}

impl LineFramer {
    pub(crate) fn push(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        self.buffer.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|byte| *byte == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
            line.pop();
            strip_cr(&mut line);
            lines.push(line);
        }
        lines
    }

    /// Flushes an unterminated final line.
    pub(crate) fn finish(&mut self) -> Option<Vec<u8>> {
        if self.buffer.is_empty() {
            return None;
        }
        let mut line = std::mem::take(&mut self.buffer);
        strip_cr(&mut line);
        Some(line)
    }
}

fn strip_cr(line: &mut Vec<u8>) {
    if line.last() == Some(&b'\r') {
        line.pop();
    }
}

/// What a single decoded line contributes to the chunk stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Frame {
    Chunk(String),
    Skip,
    /// End of the stream, with any text carried by the final line.
    Done(String),
}

struct DecodeState<S, F> {
    body: Pin<Box<S>>,
    framer: LineFramer,
    pending: VecDeque<Vec<u8>>,
    exhausted: bool,
    finished: bool,
    decode: F,
}

/// Turns a byte stream into a chunk stream, decoding one complete line at a
/// time. Empty chunks are dropped; the first error ends the stream.
pub(crate) fn decode_lines<S, B, E, F>(body: S, decode: F) -> ChunkStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send,
    E: Display + Send,
    F: FnMut(&str) -> Result<Frame, GatewayError> + Send + 'static,
{
    let state = DecodeState {
        body: Box::pin(body),
        framer: LineFramer::default(),
        pending: VecDeque::new(),
        exhausted: false,
        finished: false,
        decode,
    };

    Box::pin(futures::stream::unfold(state, |mut state| async move {
        loop {
            if state.finished {
                return None;
            }

            if let Some(raw) = state.pending.pop_front() {
                let line = match String::from_utf8(raw) {
                    Ok(line) => line,
                    Err(err) => {
                        state.finished = true;
                        let err = GatewayError::InvalidResponse(format!(
                            "stream line is not valid utf-8: {err}"
                        ));
                        return Some((Err(err), state));
                    }
                };
                match (state.decode)(&line) {
                    Ok(Frame::Chunk(text)) if !text.is_empty() => return Some((Ok(text), state)),
                    Ok(Frame::Chunk(_)) | Ok(Frame::Skip) => continue,
                    Ok(Frame::Done(text)) => {
                        state.finished = true;
                        if text.is_empty() {
                            return None;
                        }
                        return Some((Ok(text), state));
                    }
                    Err(err) => {
                        state.finished = true;
                        return Some((Err(err), state));
                    }
                }
            }

            if state.exhausted {
                return None;
            }

            match state.body.next().await {
                Some(Ok(bytes)) => {
                    let lines = state.framer.push(bytes.as_ref());
                    state.pending.extend(lines);
                }
                Some(Err(err)) => {
                    state.finished = true;
                    return Some((Err(GatewayError::Transport(err.to_string())), state));
                }
                None => {
                    state.exhausted = true;
                    if let Some(line) = state.framer.finish() {
                        state.pending.push_back(line);
                    }
                }
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    fn passthrough(line: &str) -> Result<Frame, GatewayError> {
        match line {
            "" => Ok(Frame::Skip),
            "END" => Ok(Frame::Done(String::new())),
            "BAD" => Err(GatewayError::InvalidResponse("bad".to_string())),
            other => Ok(Frame::Chunk(other.to_string())),
        }
    }

    fn body(parts: &[&[u8]]) -> impl Stream<Item = Result<Vec<u8>, std::io::Error>> + Send + use<> {
        futures::stream::iter(
            parts
                .iter()
                .map(|part| Ok(part.to_vec()))
                .collect::<Vec<_>>(),
        )
    }

    #[test]
    fn framer_joins_partial_reads_and_strips_cr() {
        let mut framer = LineFramer::default();
        assert!(framer.push(b"{\"a\":").is_empty());
        let lines = framer.push(b"1}\r\n{\"b\"");
        assert_eq!(lines, vec![b"{\"a\":1}".to_vec()]);
        assert!(framer.push(b":2}").is_empty());
        assert_eq!(framer.finish(), Some(b"{\"b\":2}".to_vec()));
        assert_eq!(framer.finish(), None);
    }

    #[tokio::test]
    async fn reassembles_lines_split_across_reads() {
        let stream = decode_lines(body(&[b"hel", b"lo\nwor", b"ld\n\n", b"tail"]), passthrough);
        let chunks: Vec<String> = stream.try_collect().await.expect("chunks");
        assert_eq!(chunks, vec!["hello", "world", "tail"]);
    }

    #[tokio::test]
    async fn multibyte_characters_survive_a_split_read() {
        let text = "héllo\n".as_bytes();
        let (head, rest) = text.split_at(2);
        let stream = decode_lines(body(&[head, rest]), passthrough);
        let chunks: Vec<String> = stream.try_collect().await.expect("chunks");
        assert_eq!(chunks, vec!["héllo"]);
    }

    #[tokio::test]
    async fn done_frame_stops_reading() {
        let stream = decode_lines(body(&[b"one\nEND\nnever\n"]), passthrough);
        let chunks: Vec<String> = stream.try_collect().await.expect("chunks");
        assert_eq!(chunks, vec!["one"]);
    }

    #[tokio::test]
    async fn first_error_ends_the_stream() {
        let items: Vec<_> = decode_lines(body(&[b"one\nBAD\ntwo\n"]), passthrough)
            .collect()
            .await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0], Ok("one".to_string()));
        assert!(matches!(items[1], Err(GatewayError::InvalidResponse(_))));
    }

    #[tokio::test]
    async fn transport_errors_surface_as_transport() {
        let failing = futures::stream::iter(vec![
            Ok(b"one\n".to_vec()),
            Err(std::io::Error::other("reset")),
        ]);
        let items: Vec<_> = decode_lines(failing, passthrough).collect().await;
        assert_eq!(items[0], Ok("one".to_string()));
        assert!(matches!(items[1], Err(GatewayError::Transport(_))));
    }
}
