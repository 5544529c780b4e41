//! # Stream Filters
//!
//! Stateful string→string transducers applied to every generation chunk
//! before it reaches a client. Filters compose into a pipeline; each one may
//! buffer across chunk boundaries and must flush whatever it holds when the
//! stream ends.

/// A stateful chunk transformer.
pub trait ChunkFilter: Send {
    /// Transform one chunk; may emit less or more than it received.
    fn apply(&mut self, chunk: &str) -> String;

    /// Emit any buffered remainder at end of stream.
    fn flush(&mut self) -> String {
        String::new()
    }
}

/// Removes `<think>…</think>` spans, buffering across chunk boundaries.
/// A partial open tag at a chunk edge is held back until it either completes
/// into a tag or turns out to be ordinary text. Discarded characters are
/// counted so tokens/sec can include reasoning output.
pub struct ThinkTagFilter {
    /// Inside an unclosed think span.
    in_think: bool,
    /// Undecided tail that might be the start of a tag.
    pending: String,
    discarded_chars: usize,
}

const THINK_OPEN: &str = "<think>";
const THINK_CLOSE: &str = "</think>";

impl ThinkTagFilter {
    pub fn new() -> Self {
        Self {
            in_think: false,
            pending: String::new(),
            discarded_chars: 0,
        }
    }

    pub fn discarded_chars(&self) -> usize {
        self.discarded_chars
    }

    /// Longest suffix of `text` that is a proper prefix of `tag`.
    fn partial_tag_suffix(text: &str, tag: &str) -> usize {
        let max = tag.len().saturating_sub(1).min(text.len());
        for len in (1..=max).rev() {
            if text.is_char_boundary(text.len() - len) && tag.starts_with(&text[text.len() - len..])
            {
                return len;
            }
        }
        0
    }
}

impl Default for ThinkTagFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkFilter for ThinkTagFilter {
    fn apply(&mut self, chunk: &str) -> String {
        let mut text = std::mem::take(&mut self.pending);
        text.push_str(chunk);
        let mut output = String::new();

        loop {
            if self.in_think {
                match text.find(THINK_CLOSE) {
                    Some(pos) => {
                        self.discarded_chars += pos;
                        text = text[pos + THINK_CLOSE.len()..].to_string();
                        self.in_think = false;
                    }
                    None => {
                        // Everything except a possible partial close tag is
                        // discarded thinking content.
                        let hold = Self::partial_tag_suffix(&text, THINK_CLOSE);
                        self.discarded_chars += text.len() - hold;
                        self.pending = text[text.len() - hold..].to_string();
                        return output;
                    }
                }
            } else {
                match text.find(THINK_OPEN) {
                    Some(pos) => {
                        output.push_str(&text[..pos]);
                        text = text[pos + THINK_OPEN.len()..].to_string();
                        self.in_think = true;
                    }
                    None => {
                        let hold = Self::partial_tag_suffix(&text, THINK_OPEN);
                        output.push_str(&text[..text.len() - hold]);
                        self.pending = text[text.len() - hold..].to_string();
                        return output;
                    }
                }
            }
        }
    }

    fn flush(&mut self) -> String {
        let pending = std::mem::take(&mut self.pending);
        if self.in_think {
            // Unbalanced open tag: the span never closed, count it all.
            self.discarded_chars += pending.len();
            String::new()
        } else {
            pending
        }
    }
}

/// Adds a missing space between a lowercase letter and an immediately
/// following bracket or backtick, a common artifact of some sampling stacks.
/// Stateful across chunks: remembers the last emitted character.
pub struct SpacingFixer {
    last_char: Option<char>,
}

impl SpacingFixer {
    pub fn new() -> Self {
        Self { last_char: None }
    }
}

impl Default for SpacingFixer {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkFilter for SpacingFixer {
    fn apply(&mut self, chunk: &str) -> String {
        let mut output = String::with_capacity(chunk.len());
        for c in chunk.chars() {
            if matches!(c, '[' | '`') {
                if let Some(prev) = self.last_char {
                    if prev.is_ascii_lowercase() {
                        output.push(' ');
                    }
                }
            }
            output.push(c);
            self.last_char = Some(c);
        }
        output
    }
}

/// Drops whole LLM-generated status lines of the shape `*Something...*`
/// while the worker's own status indicator is still showing. The suppressor
/// buffers a line at a time so the pattern can be judged complete.
pub struct StatusLineSuppressor {
    active: bool,
    line_buffer: String,
}

impl StatusLineSuppressor {
    pub fn new(active: bool) -> Self {
        Self {
            active,
            line_buffer: String::new(),
        }
    }

    fn is_status_line(line: &str) -> bool {
        let trimmed = line.trim();
        trimmed.len() > 5
            && trimmed.starts_with('*')
            && trimmed.ends_with("...*")
            && !trimmed[1..trimmed.len() - 4].contains('*')
    }

    /// Whether the held partial line could still complete into a status
    /// line: short, and starting with `*` after leading whitespace.
    fn could_be_status(&self) -> bool {
        let held = self.line_buffer.trim_start();
        held.is_empty() || (held.starts_with('*') && self.line_buffer.len() <= 120)
    }

    fn drain_line(&mut self, line: String) -> String {
        if self.active && Self::is_status_line(&line) {
            String::new()
        } else {
            if !line.trim().is_empty() {
                // First real content line: stop suppressing.
                self.active = false;
            }
            line
        }
    }
}

impl ChunkFilter for StatusLineSuppressor {
    fn apply(&mut self, chunk: &str) -> String {
        if !self.active {
            return chunk.to_string();
        }

        let mut output = String::new();
        for c in chunk.chars() {
            if !self.active {
                output.push(c);
                continue;
            }
            self.line_buffer.push(c);
            if c == '\n' {
                let line = std::mem::take(&mut self.line_buffer);
                output.push_str(&self.drain_line(line));
            } else if !self.could_be_status() {
                // The held text can no longer become a status line; stop
                // suppressing so content is not delayed waiting for a
                // newline that may never come.
                self.active = false;
                output.push_str(&std::mem::take(&mut self.line_buffer));
            }
        }
        output
    }

    fn flush(&mut self) -> String {
        let line = std::mem::take(&mut self.line_buffer);
        if line.is_empty() {
            return String::new();
        }
        self.drain_line(line)
    }
}

/// Ordered filter pipeline: each chunk flows through every filter; at end of
/// stream the flush of each filter is pushed through the remainder of the
/// chain.
pub struct FilterPipeline {
    filters: Vec<Box<dyn ChunkFilter>>,
}

impl FilterPipeline {
    pub fn new(filters: Vec<Box<dyn ChunkFilter>>) -> Self {
        Self { filters }
    }

    /// Standard generation pipeline: think stripping, spacing repair, and
    /// optional status-line suppression.
    pub fn standard(suppress_status_lines: bool) -> (Self, ThinkStats) {
        let think = ThinkTagFilter::new();
        let stats = ThinkStats::default();
        let mut filters: Vec<Box<dyn ChunkFilter>> = vec![
            Box::new(CountingThinkFilter {
                inner: think,
                stats: stats.clone(),
            }),
            Box::new(SpacingFixer::new()),
        ];
        if suppress_status_lines {
            filters.push(Box::new(StatusLineSuppressor::new(true)));
        }
        (Self::new(filters), stats)
    }

    pub fn apply(&mut self, chunk: &str) -> String {
        let mut text = chunk.to_string();
        for filter in self.filters.iter_mut() {
            if text.is_empty() {
                // Still feed empties forward? Nothing to transform.
                break;
            }
            text = filter.apply(&text);
        }
        text
    }

    /// Flush every filter, feeding each remainder through the filters after
    /// it in the chain.
    pub fn flush(&mut self) -> String {
        let mut output = String::new();
        for i in 0..self.filters.len() {
            let mut text = self.filters[i].flush();
            for filter in self.filters.iter_mut().skip(i + 1) {
                if text.is_empty() {
                    break;
                }
                text = filter.apply(&text);
            }
            output.push_str(&text);
        }
        output
    }
}

/// Shared counter for characters discarded inside think spans.
#[derive(Debug, Clone, Default)]
pub struct ThinkStats {
    discarded: std::sync::Arc<std::sync::atomic::AtomicUsize>,
}

impl ThinkStats {
    pub fn discarded_chars(&self) -> usize {
        self.discarded.load(std::sync::atomic::Ordering::Relaxed)
    }
}

struct CountingThinkFilter {
    inner: ThinkTagFilter,
    stats: ThinkStats,
}

impl CountingThinkFilter {
    fn publish(&self) {
        self.stats.discarded.store(
            self.inner.discarded_chars(),
            std::sync::atomic::Ordering::Relaxed,
        );
    }
}

impl ChunkFilter for CountingThinkFilter {
    fn apply(&mut self, chunk: &str) -> String {
        let out = self.inner.apply(chunk);
        self.publish();
        out
    }

    fn flush(&mut self) -> String {
        let out = self.inner.flush();
        self.publish();
        out
    }
}
