//! Cooked-mode pseudoterminal: a line editor with history and signal keys.
//! Keystrokes arrive as raw bytes from the UI; committed lines are queued
//! for the guest, and everything echoed back to the UI is published as
//! terminal events.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

const BELL: &[u8] = b"\x07";

/// Editable line content plus a cursor in `[0, len]`. Operations report
/// whether they changed anything so the terminal can ring a bell on no-op.
#[derive(Debug, Default)]
pub struct LineBuffer {
    content: Vec<char>,
    cursor: usize,
}

impl LineBuffer {
    pub fn new() -> LineBuffer {
        LineBuffer::default()
    }

    pub fn len(&self) -> usize {
        self.content.len()
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn text(&self) -> String {
        self.content.iter().collect()
    }

    pub fn insert(&mut self, c: char) {
        self.content.insert(self.cursor, c);
        self.cursor += 1;
    }

    pub fn backspace(&mut self) -> bool {
        if self.cursor == 0 {
            return false;
        }
        self.cursor -= 1;
        self.content.remove(self.cursor);
        true
    }

    pub fn delete(&mut self) -> bool {
        if self.cursor >= self.content.len() {
            return false;
        }
        self.content.remove(self.cursor);
        true
    }

    pub fn move_left(&mut self) -> bool {
        if self.cursor == 0 {
            return false;
        }
        self.cursor -= 1;
        true
    }

    pub fn move_right(&mut self) -> bool {
        if self.cursor >= self.content.len() {
            return false;
        }
        self.cursor += 1;
        true
    }

    /// Move to column 0. Returns the distance moved.
    pub fn move_to_start(&mut self) -> usize {
        let moved = self.cursor;
        self.cursor = 0;
        moved
    }

    /// Move past the last character. Returns the distance moved.
    pub fn move_to_end(&mut self) -> usize {
        let moved = self.content.len() - self.cursor;
        self.cursor = self.content.len();
        moved
    }

    /// Skip spaces, then non-spaces, leftwards. Returns the distance moved.
    pub fn move_word_left(&mut self) -> usize {
        let start = self.cursor;
        while self.cursor > 0 && self.content[self.cursor - 1] == ' ' {
            self.cursor -= 1;
        }
        while self.cursor > 0 && self.content[self.cursor - 1] != ' ' {
            self.cursor -= 1;
        }
        start - self.cursor
    }

    /// Skip spaces, then non-spaces, rightwards. Returns the distance moved.
    pub fn move_word_right(&mut self) -> usize {
        let start = self.cursor;
        while self.cursor < self.content.len() && self.content[self.cursor] == ' ' {
            self.cursor += 1;
        }
        while self.cursor < self.content.len() && self.content[self.cursor] != ' ' {
            self.cursor += 1;
        }
        self.cursor - start
    }

    pub fn is_cursor_at_end(&self) -> bool {
        self.cursor == self.content.len()
    }

    /// Replace the whole line, cursor at the end.
    pub fn set(&mut self, text: &str) {
        self.content = text.chars().collect();
        self.cursor = self.content.len();
    }

    pub fn clear(&mut self) {
        self.content.clear();
        self.cursor = 0;
    }
}

/// Previous lines plus the current draft; the index walks the stack in
/// response to up/down arrows.
#[derive(Debug, Default)]
struct History {
    entries: Vec<String>,
    draft: String,
    index: usize,
}

impl History {
    fn new() -> History {
        History::default()
    }

    fn previous(&mut self, current: &str) -> Option<String> {
        if self.index == 0 {
            return None;
        }
        if self.index == self.entries.len() {
            self.draft = current.to_string();
        }
        self.index -= 1;
        Some(self.entries[self.index].clone())
    }

    fn next(&mut self) -> Option<String> {
        if self.index >= self.entries.len() {
            return None;
        }
        self.index += 1;
        if self.index == self.entries.len() {
            Some(self.draft.clone())
        } else {
            Some(self.entries[self.index].clone())
        }
    }

    /// Record a committed line, deduplicating the immediately preceding
    /// entry, and rewind the walk.
    fn commit(&mut self, line: &str) {
        if !line.is_empty() && self.entries.last().map(|s| s.as_str()) != Some(line) {
            self.entries.push(line.to_string());
        }
        self.index = self.entries.len();
        self.draft.clear();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalMode {
    /// The guest is running and not waiting for input.
    Busy,
    /// The guest is waiting for a line.
    Idle,
    /// The guest has finished; any keystroke fires an "any key" event and
    /// is discarded.
    Free,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalEvent {
    /// Bytes to render on the attached UI.
    Output(Vec<u8>),
    NameChange(String),
    ModeChange(TerminalMode),
    /// ^C was pressed.
    Interrupt,
    /// A key was pressed while the terminal was free.
    AnyKey,
}

#[derive(Debug, Clone)]
pub struct PseudoterminalOptions {
    pub history: bool,
}

impl Default for PseudoterminalOptions {
    fn default() -> PseudoterminalOptions {
        PseudoterminalOptions { history: true }
    }
}

struct PtyState {
    mode: TerminalMode,
    line: LineBuffer,
    history: Option<History>,
    // Committed lines not yet consumed by the guest; each ends in '\n'.
    lines: VecDeque<String>,
    pending_read: Option<oneshot::Sender<String>>,
    consumer: Option<mpsc::UnboundedSender<TerminalEvent>>,
    buffered: Vec<TerminalEvent>,
    // Incomplete escape sequence carried across input chunks.
    esc_pending: Vec<u8>,
    // Incomplete utf-8 sequence carried across input chunks.
    utf8_pending: Vec<u8>,
    name: String,
}

pub struct Pseudoterminal {
    state: Mutex<PtyState>,
}

impl Pseudoterminal {
    pub fn new(options: PseudoterminalOptions) -> Arc<Pseudoterminal> {
        Arc::new(Pseudoterminal {
            state: Mutex::new(PtyState {
                mode: TerminalMode::Busy,
                line: LineBuffer::new(),
                history: options.history.then(History::new),
                lines: VecDeque::new(),
                pending_read: None,
                consumer: None,
                buffered: Vec::new(),
                esc_pending: Vec::new(),
                utf8_pending: Vec::new(),
                name: String::new(),
            }),
        })
    }

    /// Attach the consumer. Events buffered before attachment (output,
    /// name changes) are flushed in order.
    pub fn attach(&self) -> mpsc::UnboundedReceiver<TerminalEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock();
        for event in state.buffered.drain(..) {
            let _ = tx.send(event);
        }
        state.consumer = Some(tx);
        rx
    }

    pub fn mode(&self) -> TerminalMode {
        self.state.lock().mode
    }

    pub fn set_mode(&self, mode: TerminalMode) {
        let mut state = self.state.lock();
        if state.mode != mode {
            state.mode = mode;
            emit(&mut state, TerminalEvent::ModeChange(mode));
        }
    }

    pub fn name(&self) -> String {
        self.state.lock().name.clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        let mut state = self.state.lock();
        let name = name.into();
        state.name = name.clone();
        emit(&mut state, TerminalEvent::NameChange(name));
    }

    /// Guest-side output (e.g. the program's stdout) to render.
    pub fn write(&self, bytes: &[u8]) {
        let mut state = self.state.lock();
        emit(&mut state, TerminalEvent::Output(bytes.to_vec()));
    }

    /// Total bytes of committed lines not yet read.
    pub fn bytes_pending(&self) -> u64 {
        self.state
            .lock()
            .lines
            .iter()
            .map(|l| l.len() as u64)
            .sum()
    }

    /// Await the next committed line (always `\n`-terminated).
    ///
    /// At most one readline may be outstanding; a second concurrent call
    /// is a host programming error and panics.
    pub async fn readline(&self) -> String {
        let rx = {
            let mut state = self.state.lock();
            if let Some(line) = state.lines.pop_front() {
                return line;
            }
            assert!(
                state.pending_read.is_none(),
                "readline already pending on pseudoterminal"
            );
            let (tx, rx) = oneshot::channel();
            state.pending_read = Some(tx);
            rx
        };
        rx.await.unwrap_or_default()
    }

    /// Feed keystrokes from the UI through the key map.
    pub fn input(&self, bytes: &[u8]) {
        let mut state = self.state.lock();

        if state.mode == TerminalMode::Free {
            if !bytes.is_empty() {
                emit(&mut state, TerminalEvent::AnyKey);
            }
            return;
        }

        let mut pending = std::mem::take(&mut state.esc_pending);
        pending.extend_from_slice(bytes);
        let mut echo: Vec<u8> = Vec::new();
        let mut i = 0;

        while i < pending.len() {
            let b = pending[i];
            if b == 0x1b {
                match parse_escape(&pending[i..]) {
                    EscapeParse::Complete(key, used) => {
                        self.apply_key(&mut state, key, &mut echo);
                        i += used;
                    }
                    EscapeParse::Incomplete => {
                        state.esc_pending = pending[i..].to_vec();
                        break;
                    }
                    EscapeParse::Unknown(used) => {
                        echo.extend_from_slice(BELL);
                        i += used;
                    }
                }
                continue;
            }
            let key = match b {
                0x03 => Key::Interrupt,
                0x01 => Key::LineStart,
                0x05 => Key::LineEnd,
                0x02 => Key::Left,
                0x06 => Key::Right,
                0x08 | 0x7f => Key::Backspace,
                b'\r' => Key::Commit,
                b'\n' => {
                    i += 1;
                    continue;
                }
                b if is_control_byte(b) => {
                    // Unmapped control byte; swallow it.
                    i += 1;
                    continue;
                }
                _ => {
                    // Printable input, possibly multi-byte utf-8.
                    let mut run = std::mem::take(&mut state.utf8_pending);
                    while i < pending.len() && !is_control_byte(pending[i]) {
                        run.push(pending[i]);
                        i += 1;
                    }
                    match String::from_utf8(run) {
                        Ok(text) => {
                            for c in text.chars() {
                                self.apply_key(&mut state, Key::Insert(c), &mut echo);
                            }
                        }
                        Err(err) => {
                            let incomplete = err.utf8_error().error_len().is_none();
                            let valid = err.utf8_error().valid_up_to();
                            let run = err.into_bytes();
                            if incomplete {
                                let text = String::from_utf8_lossy(&run[..valid]).into_owned();
                                for c in text.chars() {
                                    self.apply_key(&mut state, Key::Insert(c), &mut echo);
                                }
                                state.utf8_pending = run[valid..].to_vec();
                            } else {
                                let text = String::from_utf8_lossy(&run).into_owned();
                                for c in text.chars() {
                                    self.apply_key(&mut state, Key::Insert(c), &mut echo);
                                }
                            }
                        }
                    }
                    continue;
                }
            };
            self.apply_key(&mut state, key, &mut echo);
            i += 1;
        }

        if !echo.is_empty() {
            emit(&mut state, TerminalEvent::Output(echo));
        }
    }

    fn apply_key(&self, state: &mut PtyState, key: Key, echo: &mut Vec<u8>) {
        match key {
            Key::Insert(c) => {
                let at_end = state.line.is_cursor_at_end();
                state.line.insert(c);
                if !at_end {
                    echo.extend_from_slice(b"\x1b[@");
                }
                let mut buf = [0u8; 4];
                echo.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            }
            Key::Backspace => {
                if state.line.backspace() {
                    echo.extend_from_slice(b"\x1b[D\x1b[P");
                } else {
                    echo.extend_from_slice(BELL);
                }
            }
            Key::Delete => {
                if state.line.delete() {
                    echo.extend_from_slice(b"\x1b[P");
                } else {
                    echo.extend_from_slice(BELL);
                }
            }
            Key::Left => {
                if state.line.move_left() {
                    echo.extend_from_slice(b"\x1b[D");
                } else {
                    echo.extend_from_slice(BELL);
                }
            }
            Key::Right => {
                if state.line.move_right() {
                    echo.extend_from_slice(b"\x1b[C");
                } else {
                    echo.extend_from_slice(BELL);
                }
            }
            Key::WordLeft => {
                let moved = state.line.move_word_left();
                if moved == 0 {
                    echo.extend_from_slice(BELL);
                }
                for _ in 0..moved {
                    echo.extend_from_slice(b"\x1b[D");
                }
            }
            Key::WordRight => {
                let moved = state.line.move_word_right();
                if moved == 0 {
                    echo.extend_from_slice(BELL);
                }
                for _ in 0..moved {
                    echo.extend_from_slice(b"\x1b[C");
                }
            }
            Key::LineStart => {
                let moved = state.line.move_to_start();
                if moved == 0 {
                    echo.extend_from_slice(BELL);
                }
                for _ in 0..moved {
                    echo.extend_from_slice(b"\x1b[D");
                }
            }
            Key::LineEnd => {
                let moved = state.line.move_to_end();
                if moved == 0 {
                    echo.extend_from_slice(BELL);
                }
                for _ in 0..moved {
                    echo.extend_from_slice(b"\x1b[C");
                }
            }
            Key::HistoryPrevious => {
                let current = state.line.text();
                let replacement = state
                    .history
                    .as_mut()
                    .and_then(|h| h.previous(&current));
                match replacement {
                    Some(text) => replace_line(state, &text, echo),
                    None => echo.extend_from_slice(BELL),
                }
            }
            Key::HistoryNext => {
                let replacement = state.history.as_mut().and_then(|h| h.next());
                match replacement {
                    Some(text) => replace_line(state, &text, echo),
                    None => echo.extend_from_slice(BELL),
                }
            }
            Key::Commit => {
                echo.extend_from_slice(b"\r\n");
                let text = state.line.text();
                if let Some(history) = state.history.as_mut() {
                    history.commit(&text);
                }
                state.line.clear();
                deliver_line(state, format!("{text}\n"));
            }
            Key::Interrupt => {
                echo.extend_from_slice(b"^C\r\n");
                state.line.clear();
                state.lines.clear();
                emit(state, TerminalEvent::Interrupt);
                if let Some(tx) = state.pending_read.take() {
                    let _ = tx.send("\n".to_string());
                }
            }
        }
    }
}

fn emit(state: &mut PtyState, event: TerminalEvent) {
    match &state.consumer {
        Some(tx) => {
            let _ = tx.send(event);
        }
        None => state.buffered.push(event),
    }
}

fn deliver_line(state: &mut PtyState, line: String) {
    if let Some(tx) = state.pending_read.take() {
        let _ = tx.send(line);
    } else {
        state.lines.push_back(line);
    }
}

fn replace_line(state: &mut PtyState, text: &str, echo: &mut Vec<u8>) {
    for _ in 0..state.line.cursor() {
        echo.extend_from_slice(b"\x1b[D");
    }
    echo.extend_from_slice(b"\x1b[K");
    state.line.set(text);
    echo.extend_from_slice(text.as_bytes());
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Key {
    Insert(char),
    Backspace,
    Delete,
    Left,
    Right,
    WordLeft,
    WordRight,
    LineStart,
    LineEnd,
    HistoryPrevious,
    HistoryNext,
    Commit,
    Interrupt,
}

enum EscapeParse {
    /// A recognised sequence and the number of bytes it consumed.
    Complete(Key, usize),
    /// The chunk ended mid-sequence; wait for more bytes.
    Incomplete,
    /// A complete but unrecognised sequence of the given length.
    Unknown(usize),
}

fn parse_escape(bytes: &[u8]) -> EscapeParse {
    debug_assert_eq!(bytes[0], 0x1b);
    match bytes.get(1) {
        None => EscapeParse::Incomplete,
        Some(b'f') => EscapeParse::Complete(Key::WordRight, 2),
        Some(b'b') => EscapeParse::Complete(Key::WordLeft, 2),
        Some(b'[') => {
            // CSI: parameter bytes, then a final byte in 0x40..=0x7e.
            let mut i = 2;
            while let Some(&b) = bytes.get(i) {
                if (0x40..=0x7e).contains(&b) {
                    let key = match &bytes[2..=i] {
                        b"A" => Some(Key::HistoryPrevious),
                        b"B" => Some(Key::HistoryNext),
                        b"C" => Some(Key::Right),
                        b"D" => Some(Key::Left),
                        b"H" => Some(Key::LineStart),
                        b"F" => Some(Key::LineEnd),
                        b"3~" => Some(Key::Delete),
                        b"1;5C" => Some(Key::WordRight),
                        b"1;5D" => Some(Key::WordLeft),
                        _ => None,
                    };
                    return match key {
                        Some(key) => EscapeParse::Complete(key, i + 1),
                        None => EscapeParse::Unknown(i + 1),
                    };
                }
                i += 1;
            }
            EscapeParse::Incomplete
        }
        Some(_) => EscapeParse::Unknown(2),
    }
}

fn is_control_byte(b: u8) -> bool {
    b < 0x20 || b == 0x7f
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn line_buffer_insert_and_move() {
        let mut line = LineBuffer::new();
        line.insert('h');
        line.insert('i');
        assert!(line.move_left());
        line.insert('!');
        assert_eq!(line.text(), "h!i");
        assert_eq!(line.cursor(), 2);
        assert!(line.move_right());
        assert!(!line.move_right());
    }

    #[test]
    fn line_buffer_word_moves() {
        let mut line = LineBuffer::new();
        line.set("one  two three");
        assert_eq!(line.move_word_left(), 5); // back over "three"
        assert_eq!(line.move_word_left(), 5); // over "  two"
        assert_eq!(line.move_word_left(), 3); // over "one"
        assert_eq!(line.move_word_left(), 0);
        assert_eq!(line.move_word_right(), 3);
        assert_eq!(line.move_word_right(), 5);
    }

    #[test]
    fn line_buffer_backspace_delete() {
        let mut line = LineBuffer::new();
        line.set("abc");
        assert!(line.backspace());
        assert_eq!(line.text(), "ab");
        line.move_to_start();
        assert!(!line.backspace());
        assert!(line.delete());
        assert_eq!(line.text(), "b");
    }

    #[test]
    fn history_walk_and_dedupe() {
        let mut history = History::new();
        history.commit("ls");
        history.commit("ls");
        history.commit("pwd");
        assert_eq!(history.entries, vec!["ls", "pwd"]);

        assert_eq!(history.previous("draft"), Some("pwd".to_string()));
        assert_eq!(history.previous(""), Some("ls".to_string()));
        assert_eq!(history.previous(""), None);
        assert_eq!(history.next(), Some("pwd".to_string()));
        assert_eq!(history.next(), Some("draft".to_string()));
        assert_eq!(history.next(), None);
    }

    #[tokio::test]
    async fn cursor_left_inserts_between() {
        let pty = Pseudoterminal::new(PseudoterminalOptions::default());
        pty.input(b"hi\x1b[D!\r");
        assert_eq!(pty.readline().await, "h!i\n");
    }

    #[tokio::test]
    async fn queued_line_resolves_immediately() {
        let pty = Pseudoterminal::new(PseudoterminalOptions::default());
        pty.input(b"first\r");
        pty.input(b"second\r");
        assert_eq!(pty.readline().await, "first\n");
        assert_eq!(pty.readline().await, "second\n");
    }

    #[tokio::test]
    async fn pending_readline_resolves_on_commit() {
        let pty = Pseudoterminal::new(PseudoterminalOptions::default());
        let reader = {
            let pty = pty.clone();
            tokio::spawn(async move { pty.readline().await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        pty.input(b"late\r");
        assert_eq!(reader.await.unwrap(), "late\n");
    }

    #[tokio::test]
    async fn interrupt_clears_and_resolves() {
        let pty = Pseudoterminal::new(PseudoterminalOptions::default());
        let mut events = pty.attach();
        pty.input(b"queued\r");
        let reader = {
            let pty = pty.clone();
            tokio::spawn(async move {
                let first = pty.readline().await;
                let second = pty.readline().await;
                (first, second)
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        pty.input(b"partial"); // never committed
        pty.input(&[0x03]);
        let (first, second) = reader.await.unwrap();
        assert_eq!(first, "queued\n");
        assert_eq!(second, "\n");

        let mut saw_interrupt = false;
        while let Ok(event) = events.try_recv() {
            if event == TerminalEvent::Interrupt {
                saw_interrupt = true;
            }
        }
        assert!(saw_interrupt);
    }

    #[test]
    fn output_buffers_until_attach() {
        let pty = Pseudoterminal::new(PseudoterminalOptions::default());
        pty.write(b"early");
        pty.set_name("guest");
        let mut events = pty.attach();
        assert_eq!(
            events.try_recv().unwrap(),
            TerminalEvent::Output(b"early".to_vec())
        );
        assert_eq!(
            events.try_recv().unwrap(),
            TerminalEvent::NameChange("guest".to_string())
        );
    }

    #[test]
    fn free_mode_fires_any_key() {
        let pty = Pseudoterminal::new(PseudoterminalOptions::default());
        let mut events = pty.attach();
        pty.set_mode(TerminalMode::Free);
        pty.input(b"x");
        assert_eq!(
            events.try_recv().unwrap(),
            TerminalEvent::ModeChange(TerminalMode::Free)
        );
        assert_eq!(events.try_recv().unwrap(), TerminalEvent::AnyKey);
        assert_eq!(pty.bytes_pending(), 0);
    }

    #[tokio::test]
    async fn history_arrows_recall_lines() {
        let pty = Pseudoterminal::new(PseudoterminalOptions::default());
        pty.input(b"alpha\r");
        assert_eq!(pty.readline().await, "alpha\n");
        pty.input(b"\x1b[A\r");
        assert_eq!(pty.readline().await, "alpha\n");
    }

    #[test]
    fn split_escape_sequence_across_chunks() {
        let pty = Pseudoterminal::new(PseudoterminalOptions::default());
        let mut events = pty.attach();
        pty.input(b"ab");
        pty.input(b"\x1b");
        pty.input(b"[");
        pty.input(b"D");
        // Drain echoes; the split ESC [ D must act as one cursor-left.
        let mut echoed: Vec<u8> = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let TerminalEvent::Output(bytes) = event {
                echoed.extend_from_slice(&bytes);
            }
        }
        assert_eq!(echoed, b"ab\x1b[D");
    }
}
