//! Rolling per-worker log of conversion output.
//!
//! Every conversion worker slot owns one page. Output captured from the
//! external command is appended with terminal semantics so progress meters
//! written with `\r` or `\b` stay readable.

use std::collections::{BTreeSet, VecDeque};

use parking_lot::Mutex;

#[derive(Debug, Default)]
struct LogPage {
    lines: VecDeque<String>,
    current: String,
}

impl LogPage {
    fn append(&mut self, text: &str, max_lines: usize) {
        for c in text.chars() {
            match c {
                '\n' => {
                    self.lines.push_back(std::mem::take(&mut self.current));
                    while self.lines.len() > max_lines {
                        self.lines.pop_front();
                    }
                }
                '\r' => self.current.clear(),
                '\u{8}' => {
                    self.current.pop();
                }
                _ => self.current.push(c),
            }
        }
    }

    fn text(&self) -> String {
        let mut out = String::new();
        for line in &self.lines {
            out.push_str(line);
            out.push('\n');
        }
        out.push_str(&self.current);
        out
    }
}

#[derive(Debug, Default)]
struct LogInner {
    pages: Vec<LogPage>,
    dirty: BTreeSet<usize>,
}

/// Log pages indexed by worker slot.
#[derive(Debug)]
pub struct ConversionLog {
    inner: Mutex<LogInner>,
    max_lines: usize,
    enabled: bool,
}

impl ConversionLog {
    /// Create a log keeping at most `max_lines` complete lines per page.
    #[must_use]
    pub fn new(max_lines: usize, enabled: bool) -> Self {
        Self {
            inner: Mutex::new(LogInner::default()),
            max_lines: max_lines.max(1),
            enabled,
        }
    }

    /// Whether output is retained.
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Append raw output to the page of `slot`.
    pub fn append(&self, slot: usize, text: &str) {
        if !self.enabled {
            return;
        }
        let mut inner = self.inner.lock();
        if inner.pages.len() <= slot {
            inner.pages.resize_with(slot + 1, LogPage::default);
        }
        inner.pages[slot].append(text, self.max_lines);
        inner.dirty.insert(slot);
    }

    /// Slots that received output since the last call.
    pub fn take_dirty(&self) -> Vec<usize> {
        std::mem::take(&mut self.inner.lock().dirty).into_iter().collect()
    }

    /// Current text of the page of `slot`.
    #[must_use]
    pub fn page(&self, slot: usize) -> String {
        self.inner
            .lock()
            .pages
            .get(slot)
            .map(LogPage::text)
            .unwrap_or_default()
    }

    /// Number of pages created so far.
    #[must_use]
    pub fn page_count(&self) -> usize {
        self.inner.lock().pages.len()
    }

    /// Clear every page.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        for page in &mut inner.pages {
            *page = LogPage::default();
        }
        inner.dirty.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lines_are_kept_per_slot() {
        let log = ConversionLog::new(10, true);
        log.append(1, "encoding\n");
        log.append(0, "slot zero");
        assert_eq!(log.page(1), "encoding\n");
        assert_eq!(log.page(0), "slot zero");
        assert_eq!(log.page_count(), 2);
        assert_eq!(log.page(5), "");
        assert_eq!(log.take_dirty(), vec![0, 1]);
        assert!(log.take_dirty().is_empty());
    }

    #[test]
    fn test_carriage_return_rewrites_line() {
        let log = ConversionLog::new(10, true);
        log.append(0, "10%\r20%\r30%\ndone");
        assert_eq!(log.page(0), "30%\ndone");
    }

    #[test]
    fn test_backspace_deletes_previous_char() {
        let log = ConversionLog::new(10, true);
        log.append(0, "abc\u{8}\u{8}x");
        assert_eq!(log.page(0), "ax");
    }

    #[test]
    fn test_page_rolls_over() {
        let log = ConversionLog::new(2, true);
        log.append(0, "one\ntwo\nthree\n");
        assert_eq!(log.page(0), "two\nthree\n");
    }

    #[test]
    fn test_disabled_log_keeps_nothing() {
        let log = ConversionLog::new(10, false);
        log.append(0, "ignored\n");
        assert_eq!(log.page_count(), 0);
    }

    #[test]
    fn test_clear() {
        let log = ConversionLog::new(10, true);
        log.append(0, "x\n");
        log.clear();
        assert_eq!(log.page(0), "");
    }
}
