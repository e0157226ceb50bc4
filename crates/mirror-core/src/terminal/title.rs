//! Streaming OSC title extraction.
//!
//! The spawned shell announces its working directory and active command
//! through standard window-title sequences (`ESC ] 0 ; text BEL` or the
//! two-byte `ESC \` terminator). The parser below picks those out of the
//! raw PTY stream without disturbing it; `decode_mirror_title` then
//! recognizes the ones produced by our own shell integration.

/// Marker the shell integration puts in front of every title it emits.
pub const TITLE_MARKER: &str = "alices-mirror";

const MAX_TITLE_LEN: usize = 8192;

#[derive(Clone, Copy, PartialEq, Eq)]
enum State {
    Text,
    Esc,
    Osc,
    Param,
    Title,
    TitleEsc,
}

/// Incremental parser for OSC 0/2 title sequences. Partial sequences
/// survive across `feed` calls; anything malformed falls back to plain
/// text without emitting.
pub struct OscTitleParser {
    state: State,
    param: u32,
    capture: bool,
    buf: Vec<u8>,
}

impl Default for OscTitleParser {
    fn default() -> Self {
        Self::new()
    }
}

impl OscTitleParser {
    pub fn new() -> Self {
        Self {
            state: State::Text,
            param: 0,
            capture: false,
            buf: Vec::new(),
        }
    }

    /// Feed a chunk of PTY output; returns every title completed within
    /// it. Only parameters 0 and 2 are captured, and the capture buffer
    /// is capped at 8 KiB — excess bytes are dropped until the
    /// terminator arrives.
    pub fn feed(&mut self, data: &[u8]) -> Vec<String> {
        let mut titles = Vec::new();
        for &b in data {
            match self.state {
                State::Text => {
                    if b == 0x1b {
                        self.state = State::Esc;
                    }
                }
                State::Esc => {
                    if b == b']' {
                        self.state = State::Osc;
                        self.param = 0;
                        self.capture = false;
                        self.buf.clear();
                    } else if b == 0x1b {
                        self.state = State::Esc;
                    } else {
                        self.state = State::Text;
                    }
                }
                State::Osc => {
                    if b.is_ascii_digit() {
                        self.param = u32::from(b - b'0');
                        self.state = State::Param;
                    } else if b == b';' {
                        self.begin_title();
                    } else {
                        self.state = State::Text;
                    }
                }
                State::Param => {
                    if b.is_ascii_digit() {
                        self.param = self.param.saturating_mul(10) + u32::from(b - b'0');
                    } else if b == b';' {
                        self.begin_title();
                    } else {
                        self.state = State::Text;
                    }
                }
                State::Title => {
                    if b == 0x07 {
                        self.finish_title(&mut titles);
                    } else if b == 0x1b {
                        self.state = State::TitleEsc;
                    } else if self.capture && self.buf.len() < MAX_TITLE_LEN {
                        self.buf.push(b);
                    }
                }
                State::TitleEsc => {
                    if b == b'\\' {
                        self.finish_title(&mut titles);
                    } else {
                        if self.capture && self.buf.len() < MAX_TITLE_LEN {
                            self.buf.push(0x1b);
                            if self.buf.len() < MAX_TITLE_LEN {
                                self.buf.push(b);
                            }
                        }
                        self.state = State::Title;
                    }
                }
            }
        }
        titles
    }

    fn begin_title(&mut self) {
        self.capture = self.param == 0 || self.param == 2;
        self.buf.clear();
        self.state = State::Title;
    }

    fn finish_title(&mut self, titles: &mut Vec<String>) {
        if self.capture && !self.buf.is_empty() {
            titles.push(String::from_utf8_lossy(&self.buf).into_owned());
        }
        self.buf.clear();
        self.state = State::Text;
    }
}

/// Split a `<prefix>|<cwd>|<proc>` title emitted by the shell
/// integration. Returns `None` for titles that are not ours: wrong
/// prefix, missing pipes, or both halves empty.
pub fn decode_mirror_title(title: &str) -> Option<(String, String)> {
    let first = title.find('|')?;
    if first == 0 || !title[..first].starts_with(TITLE_MARKER) {
        return None;
    }
    let rest = &title[first + 1..];
    let second = rest.find('|')?;
    let cwd = rest[..second].trim();
    let proc = rest[second + 1..].trim();
    if cwd.is_empty() && proc.is_empty() {
        return None;
    }
    Some((cwd.to_string(), proc.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_all(parser: &mut OscTitleParser, data: &[u8]) -> Vec<String> {
        parser.feed(data)
    }

    #[test]
    fn bel_terminated_title() {
        let mut p = OscTitleParser::new();
        let titles = feed_all(&mut p, b"before\x1b]0;my title\x07after");
        assert_eq!(titles, vec!["my title"]);
    }

    #[test]
    fn st_terminated_title() {
        let mut p = OscTitleParser::new();
        let titles = feed_all(&mut p, b"\x1b]2;other title\x1b\\tail");
        assert_eq!(titles, vec!["other title"]);
    }

    #[test]
    fn non_captured_param_is_skipped() {
        let mut p = OscTitleParser::new();
        let titles = feed_all(&mut p, b"\x1b]9;notification text\x07\x1b]0;real\x07");
        assert_eq!(titles, vec!["real"]);
    }

    #[test]
    fn multi_digit_param() {
        let mut p = OscTitleParser::new();
        // OSC 133 is a shell-integration sequence, not a title.
        let titles = feed_all(&mut p, b"\x1b]133;A\x07\x1b]2;kept\x07");
        assert_eq!(titles, vec!["kept"]);
    }

    #[test]
    fn empty_title_not_emitted() {
        let mut p = OscTitleParser::new();
        assert!(feed_all(&mut p, b"\x1b]0;\x07").is_empty());
    }

    #[test]
    fn malformed_sequence_resets_to_text() {
        let mut p = OscTitleParser::new();
        assert!(feed_all(&mut p, b"\x1b]x;broken\x07").is_empty());
        assert_eq!(feed_all(&mut p, b"\x1b]0;ok\x07"), vec!["ok"]);
    }

    #[test]
    fn esc_inside_title_is_preserved() {
        let mut p = OscTitleParser::new();
        let titles = feed_all(&mut p, b"\x1b]0;a\x1bZb\x07");
        assert_eq!(titles, vec!["a\u{1b}Zb"]);
    }

    #[test]
    fn chunking_does_not_change_output() {
        let input: &[u8] = b"text\x1b]0;first\x07mid\x1b]2;second\x1b\\\x1b]7;skip\x07end";
        let mut whole = OscTitleParser::new();
        let expected = whole.feed(input);
        assert_eq!(expected, vec!["first", "second"]);

        for chunk_size in 1..=5 {
            let mut p = OscTitleParser::new();
            let mut got = Vec::new();
            for chunk in input.chunks(chunk_size) {
                got.extend(p.feed(chunk));
            }
            assert_eq!(got, expected, "chunk size {chunk_size}");
        }
    }

    #[test]
    fn capture_is_capped_at_8k() {
        let mut p = OscTitleParser::new();
        let mut input = b"\x1b]0;".to_vec();
        input.extend(std::iter::repeat(b'x').take(MAX_TITLE_LEN + 100));
        input.push(0x07);
        let titles = p.feed(&input);
        assert_eq!(titles.len(), 1);
        assert_eq!(titles[0].len(), MAX_TITLE_LEN);
    }

    #[test]
    fn decode_valid_title() {
        let decoded = decode_mirror_title("alices-mirror|~/src|vim");
        assert_eq!(decoded, Some(("~/src".to_string(), "vim".to_string())));
    }

    #[test]
    fn decode_share_mode_prefix() {
        let decoded = decode_mirror_title("alices-mirror(shared:8080)|/tmp|bash");
        assert_eq!(decoded, Some(("/tmp".to_string(), "bash".to_string())));
    }

    #[test]
    fn decode_trims_halves() {
        let decoded = decode_mirror_title("alices-mirror| /home/u | cargo ");
        assert_eq!(decoded, Some(("/home/u".to_string(), "cargo".to_string())));
    }

    #[test]
    fn decode_rejects_foreign_titles() {
        assert!(decode_mirror_title("vim|~/src|x").is_none());
        assert!(decode_mirror_title("no pipes here").is_none());
        assert!(decode_mirror_title("alices-mirror|only-one-pipe").is_none());
        assert!(decode_mirror_title("|starts-with-pipe|x").is_none());
        assert!(decode_mirror_title("alices-mirror| | ").is_none());
    }

    #[test]
    fn decode_allows_one_empty_half() {
        assert_eq!(
            decode_mirror_title("alices-mirror|~|"),
            Some(("~".to_string(), String::new()))
        );
        assert_eq!(
            decode_mirror_title("alices-mirror||bash"),
            Some((String::new(), "bash".to_string()))
        );
    }
}
