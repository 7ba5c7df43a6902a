//! Outbound chunking — a pure transducer over streamed text.
//!
//! Messaging channels dislike multi-kilobyte messages, so streamed text is
//! buffered and cut into chunks once a soft threshold is passed. Cuts prefer
//! paragraph breaks over line breaks over spaces, with a hard cap as the
//! last resort. A suffix following an unmatched `[` is held back so a marker
//! that is still streaming is never split across two outbound messages.

/// Holdback horizon: a `[` further back than this is treated as plain text.
/// Markers are short; an unbounded holdback would stall the stream on any
/// stray bracket.
const MARKER_HOLDBACK_BYTES: usize = 256;

#[derive(Debug)]
pub struct Chunker {
    soft: usize,
    hard: usize,
    buf: String,
}

impl Chunker {
    pub fn new(soft: usize, hard: usize) -> Self {
        Self {
            soft: soft.max(1),
            hard: hard.max(soft.max(1)),
            buf: String::new(),
        }
    }

    /// Feed a streamed delta; returns zero or more completed chunks.
    pub fn push(&mut self, delta: &str) -> Vec<String> {
        self.buf.push_str(delta);
        let mut chunks = Vec::new();
        while self.buf.len() >= self.soft {
            match self.find_cut() {
                Some(cut) => {
                    let chunk: String = self.buf.drain(..cut).collect();
                    let chunk = chunk.trim_end_matches('\n').to_string();
                    if !chunk.is_empty() {
                        chunks.push(chunk);
                    }
                }
                None => break, // wait for a better boundary
            }
        }
        chunks
    }

    /// Flush whatever remains at end of stream.
    pub fn finish(mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buf);
        let rest = rest.trim_end().to_string();
        if rest.is_empty() { None } else { Some(rest) }
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    fn find_cut(&self) -> Option<usize> {
        let window_end = floor_char_boundary(&self.buf, self.hard.min(self.buf.len()));
        let window = &self.buf[..window_end];

        let mut cut = window
            .rfind("\n\n")
            .map(|i| i + 2)
            .or_else(|| window.rfind('\n').map(|i| i + 1))
            .or_else(|| window.rfind(' ').map(|i| i + 1))
            .unwrap_or(0);

        if cut == 0 {
            if self.buf.len() >= self.hard {
                cut = window_end; // hard cap, no boundary available
            } else {
                return None;
            }
        }

        // Hold back a potentially half-streamed marker.
        if let Some(open) = unmatched_open_bracket(&self.buf[..cut]) {
            if cut - open <= MARKER_HOLDBACK_BYTES {
                if open == 0 {
                    // The entire pending text is a marker prefix; only a hard
                    // overflow forces it out.
                    return if self.buf.len() >= self.hard + MARKER_HOLDBACK_BYTES {
                        Some(window_end)
                    } else {
                        None
                    };
                }
                cut = open;
            }
        }

        Some(cut)
    }
}

/// Index of the rightmost `[` with no `]` after it, if any.
fn unmatched_open_bracket(text: &str) -> Option<usize> {
    let open = text.rfind('[')?;
    if text[open..].contains(']') { None } else { Some(open) }
}

fn floor_char_boundary(text: &str, mut index: usize) -> usize {
    index = index.min(text.len());
    while index > 0 && !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_stays_buffered_until_finish() {
        let mut chunker = Chunker::new(100, 120);
        assert!(chunker.push("hello ").is_empty());
        assert!(chunker.push("world").is_empty());
        assert_eq!(chunker.finish().as_deref(), Some("hello world"));
    }

    #[test]
    fn prefers_paragraph_break() {
        let mut chunker = Chunker::new(20, 200);
        let chunks = chunker.push("first paragraph.\n\nsecond one that keeps going for a while");
        assert_eq!(chunks[0], "first paragraph.");
    }

    #[test]
    fn falls_back_to_line_then_space() {
        let mut chunker = Chunker::new(20, 200);
        let chunks = chunker.push("a line without paragraph\nmore text after the break here");
        assert_eq!(chunks[0], "a line without paragraph");

        let mut chunker = Chunker::new(20, 200);
        let chunks = chunker.push("just words separated by spaces only going on and on");
        assert!(chunks[0].len() <= 200);
        assert!(!chunks[0].contains('\n'));
    }

    #[test]
    fn hard_cap_cuts_unbreakable_text() {
        let mut chunker = Chunker::new(10, 16);
        let chunks = chunker.push(&"x".repeat(40));
        assert!(!chunks.is_empty());
        assert!(chunks.iter().all(|c| c.len() <= 16));
    }

    #[test]
    fn unmatched_bracket_is_held_back() {
        let mut chunker = Chunker::new(20, 400);
        let chunks = chunker.push("some reply text here [CRON_ADD: partial");
        // The marker prefix must not appear in any emitted chunk.
        assert!(chunks.iter().all(|c| !c.contains('[')));

        // Once the bracket closes, the rest flows normally.
        let more = chunker.push(" | * * * * * | hi]\nnext paragraph of the reply continues here");
        let all: String = chunks.into_iter().chain(more).collect::<Vec<_>>().join("");
        let tail = chunker.finish().unwrap_or_default();
        assert!(format!("{all}{tail}").contains("[CRON_ADD: partial | * * * * * | hi]"));
    }

    #[test]
    fn closed_bracket_is_not_held_back() {
        let mut chunker = Chunker::new(20, 400);
        let chunks = chunker.push("done [SEND_FILE: report.pdf] and some trailing text flows on");
        assert!(chunks.iter().any(|c| c.contains("[SEND_FILE: report.pdf]")));
    }

    #[test]
    fn multibyte_text_never_splits_a_char() {
        let mut chunker = Chunker::new(8, 10);
        let chunks = chunker.push(&"é".repeat(40));
        for chunk in chunks {
            assert!(chunk.is_char_boundary(chunk.len()));
        }
    }
}
