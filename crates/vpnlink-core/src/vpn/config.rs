//! Configuration dialect reader: line tokenizer, inline `<block>` capture
//! and the option multimap consumed by [`ConfigParser::convert_profile`].
//!
//! Leading `--` on option names is accepted, so this is valid:
//!
//! ```text
//! --<ca>
//! ...
//! </ca>
//! ```

use crate::vpn::types::{VpnError, VpnErrorKind, INLINE_TAG};
use std::io::{BufRead, Lines};

/// Option names rewritten while reading.
const OPTION_ALIASES: &[(&str, &str)] = &[("server-poll-timeout", "timeout-connect")];

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Tokenizer
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineState {
    Initial,
    Unquoted,
    DoubleQuoted,
    SingleQuoted,
    Done,
}

fn is_space(c: char) -> bool {
    c.is_whitespace() || c == '\0'
}

fn bad_backslash() -> VpnError {
    VpnError::parse("Options warning: Bad backslash ('\\') usage")
}

/// Split one config line into tokens, shell style.
///
/// `;` and `#` start a comment unless followed by `?`. Backslash escapes
/// work everywhere except inside single quotes; a dangling backslash at
/// the end of the line is rejected. An unterminated quote drops its token.
pub fn parse_line(line: &str) -> Result<Vec<String>, VpnError> {
    let mut params = Vec::new();
    if line.is_empty() {
        return Ok(params);
    }

    let chars: Vec<char> = line.chars().collect();
    let mut state = LineState::Initial;
    let mut backslash = false;
    let mut current = String::new();

    // One extra iteration with a virtual NUL closes the last token.
    for pos in 0..=chars.len() {
        let input = chars.get(pos).copied().unwrap_or('\0');
        let mut out: Option<char> = None;

        if !backslash && input == '\\' && state != LineState::SingleQuoted {
            backslash = true;
        } else {
            if backslash && pos == chars.len() {
                return Err(bad_backslash());
            }
            match state {
                LineState::Initial => {
                    if !is_space(input) {
                        if (input == ';' || input == '#') && chars.get(pos + 1) != Some(&'?') {
                            break;
                        }
                        if !backslash && input == '"' {
                            state = LineState::DoubleQuoted;
                        } else if !backslash && input == '\'' {
                            state = LineState::SingleQuoted;
                        } else {
                            out = Some(input);
                            state = LineState::Unquoted;
                        }
                    }
                }
                LineState::Unquoted => {
                    if !backslash && is_space(input) {
                        state = LineState::Done;
                    } else {
                        out = Some(input);
                    }
                }
                LineState::DoubleQuoted => {
                    if !backslash && input == '"' {
                        state = LineState::Done;
                    } else {
                        out = Some(input);
                    }
                }
                LineState::SingleQuoted => {
                    if input == '\'' {
                        state = LineState::Done;
                    } else {
                        out = Some(input);
                    }
                }
                LineState::Done => {}
            }

            if state == LineState::Done {
                state = LineState::Initial;
                params.push(std::mem::take(&mut current));
                out = None;
            }

            if backslash {
                if let Some(c) = out {
                    if !(c == '\\' || c == '"' || is_space(c)) {
                        return Err(bad_backslash());
                    }
                }
            }
            backslash = false;
        }

        if let Some(c) = out.filter(|&c| c != '\0') {
            current.push(c);
        }
    }

    Ok(params)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Option multimap
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One tokenized line: the option name followed by its arguments.
pub type OptionLine = Vec<String>;

/// Option name → every line that used it, in file order.
///
/// Keys keep the order of their first appearance so leftover options are
/// written back deterministically.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OptionMap {
    entries: Vec<(String, Vec<OptionLine>)>,
}

impl OptionMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a line under its option name (`line[0]`).
    pub fn push(&mut self, line: OptionLine) {
        let Some(name) = line.first().cloned() else {
            return;
        };
        match self.entries.iter_mut().find(|(k, _)| *k == name) {
            Some((_, lines)) => lines.push(line),
            None => self.entries.push((name, vec![line])),
        }
    }

    /// Put back a whole group under `name`, replacing any existing one.
    pub fn insert(&mut self, name: impl Into<String>, lines: Vec<OptionLine>) {
        let name = name.into();
        self.remove(&name);
        self.entries.push((name, lines));
    }

    pub fn get(&self, name: &str) -> Option<&[OptionLine]> {
        self.entries
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_slice())
    }

    pub fn remove(&mut self, name: &str) -> Option<Vec<OptionLine>> {
        let idx = self.entries.iter().position(|(k, _)| k == name)?;
        Some(self.entries.remove(idx).1)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[OptionLine])> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Parser
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Single-use parser: feed text with [`parse_config`](Self::parse_config),
/// then call `convert_profile` once.
#[derive(Debug, Default)]
pub struct ConfigParser {
    pub(crate) options: OptionMap,
    pub(crate) auth_user_pass_file: Option<String>,
    pub(crate) warnings: Vec<String>,
}

impl ConfigParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read all lines from `reader` into the option map.
    pub fn parse_config<R: BufRead>(&mut self, reader: R) -> Result<(), VpnError> {
        let mut lines = reader.lines();
        let mut first = true;

        while let Some(line) = lines.next() {
            let mut line = line.map_err(read_error)?;
            if first {
                line = check_file_header(line)?;
                first = false;
            }

            let mut args = parse_line(&line)?;
            if args.is_empty() {
                continue;
            }
            if let Some(stripped) = args[0].strip_prefix("--") {
                args[0] = stripped.to_string();
            }

            read_inline_block(&mut args, &mut lines)?;

            if let Some((_, to)) = OPTION_ALIASES.iter().find(|(from, _)| *from == args[0]) {
                args[0] = (*to).to_string();
            }
            self.options.push(args);
        }
        Ok(())
    }

    /// Convenience wrapper over [`parse_config`](Self::parse_config) for in-memory text.
    pub fn parse_str(&mut self, text: &str) -> Result<(), VpnError> {
        self.parse_config(text.as_bytes())
    }

    pub fn options(&self) -> &OptionMap {
        &self.options
    }

    /// External credentials file named by `auth-user-pass <file>`, if any.
    pub fn auth_user_pass_file(&self) -> Option<&str> {
        self.auth_user_pass_file.as_deref()
    }

    /// Non-fatal findings (route normalisation and the like).
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub(crate) fn warn(&mut self, msg: String) {
        log::warn!("{}", msg);
        self.warnings.push(msg);
    }

    /// Remove `option` and return its last line, validating arity.
    pub(crate) fn get_option(
        &mut self,
        option: &str,
        min_args: usize,
        max_args: usize,
    ) -> Result<Option<OptionLine>, VpnError> {
        Ok(self
            .get_all_option(option, min_args, max_args)?
            .and_then(|mut all| all.pop()))
    }

    /// Remove `option` and return every line, validating arity of each.
    pub(crate) fn get_all_option(
        &mut self,
        option: &str,
        min_args: usize,
        max_args: usize,
    ) -> Result<Option<Vec<OptionLine>>, VpnError> {
        let Some(lines) = self.options.get(option) else {
            return Ok(None);
        };
        for line in lines {
            let nargs = line.len().saturating_sub(1);
            if nargs < min_args || nargs > max_args {
                return Err(VpnError::parse(format!(
                    "Option {} has {} parameters, expected between {} and {}",
                    option, nargs, min_args, max_args
                )));
            }
        }
        Ok(self.options.remove(option))
    }
}

fn read_error(e: std::io::Error) -> VpnError {
    VpnError::new(VpnErrorKind::Io, format!("Could not read config: {}", e))
}

fn check_file_header(line: String) -> Result<String, VpnError> {
    if line.starts_with("PK\u{3}\u{4}") || line.starts_with("PK\u{7}\u{8}") {
        return Err(VpnError::parse(
            "Input looks like a ZIP Archive. Import is only possible for OpenVPN config files (.ovpn/.conf)",
        ));
    }
    Ok(match line.strip_prefix('\u{feff}') {
        Some(rest) => rest.to_string(),
        None => line,
    })
}

/// If `args[0]` is `<name>`, swallow lines up to `</name>` and collapse
/// the block into `[name, INLINE_TAG + content]`.
fn read_inline_block<B: BufRead>(args: &mut OptionLine, lines: &mut Lines<B>) -> Result<(), VpnError> {
    let arg0 = args[0].trim();
    let Some(name) = arg0
        .strip_prefix('<')
        .and_then(|s| s.strip_suffix('>'))
        .map(str::to_string)
    else {
        return Ok(());
    };

    let end_tag = format!("</{}>", name);
    let mut content = String::from(INLINE_TAG);
    loop {
        let line = match lines.next() {
            Some(line) => line.map_err(read_error)?,
            None => {
                return Err(VpnError::parse(format!(
                    "No endtag </{n}> for starttag <{n}> found",
                    n = name
                )))
            }
        };
        if line.trim() == end_tag {
            break;
        }
        content.push_str(&line);
        content.push('\n');
    }
    if content.ends_with('\n') {
        content.pop();
    }

    *args = vec![name, content];
    Ok(())
}
