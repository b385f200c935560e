//! Newline framing for the engine's stdout byte stream.

/// Reassembles complete lines from arbitrary-sized chunks.
///
/// One framer belongs to one engine process; a restarted engine gets a new
/// framer so a partial line left by the previous instance is never prefixed to
/// the next instance's output.
#[derive(Debug, Default)]
pub struct LineFramer {
    pending: Vec<u8>,
}

impl LineFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk and collect every line it completes, in order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        let mut rest = chunk;
        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            let (head, tail) = rest.split_at(pos);
            self.pending.extend_from_slice(head);
            lines.push(take_line(&mut self.pending));
            rest = &tail[1..];
        }
        self.pending.extend_from_slice(rest);
        lines
    }

    /// Flush a trailing partial line once the stream has ended.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        Some(take_line(&mut self.pending))
    }

    pub fn buffered_len(&self) -> usize {
        self.pending.len()
    }
}

fn take_line(buf: &mut Vec<u8>) -> String {
    if buf.last() == Some(&b'\r') {
        buf.pop();
    }
    let line = String::from_utf8_lossy(buf).into_owned();
    buf.clear();
    line
}
