use std::{
    env,
    ffi::OsString,
    path::{Path, PathBuf},
};

/// Find the nearest character boundary at or before the given byte index.
pub fn floor_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

/// Strip ANSI escape sequences from text for robust pattern matching.
/// Cursor-forward (`CSI n C`) becomes `n` spaces since TUIs use it in place of blanks.
pub fn strip_ansi(text: &str) -> String {
    let mut result = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\x1b' {
            match chars.peek() {
                Some('[') => {
                    chars.next();
                    let mut params = String::new();
                    while let Some(&nc) = chars.peek() {
                        chars.next();
                        if nc.is_ascii_alphabetic() || nc == '@' || nc == '`' {
                            if nc == 'C' {
                                let n = params.parse::<usize>().unwrap_or(1).min(256);
                                result.extend(std::iter::repeat(' ').take(n));
                            }
                            break;
                        }
                        params.push(nc);
                    }
                }
                Some(']') => {
                    chars.next();
                    while let Some(nc) = chars.next() {
                        if nc == '\x07' {
                            break;
                        }
                        if nc == '\x1b' && chars.peek() == Some(&'\\') {
                            chars.next();
                            break;
                        }
                    }
                }
                Some('(' | ')' | '*' | '+') => {
                    chars.next();
                    chars.next();
                }
                Some(c) if *c >= '0' && *c <= '~' => {
                    chars.next();
                }
                _ => {}
            }
        } else if c == '\r' {
            // Carriage returns without a newline redraw the same line.
            if chars.peek() != Some(&'\n') {
                result.push('\n');
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn canonicalize_display(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Resolve a program name the way a shell would: paths are checked directly,
/// bare names are searched on `PATH`.
pub fn resolve_command_path(command: &str) -> Option<PathBuf> {
    if command.is_empty() {
        return None;
    }
    if command.contains('/') || command.starts_with('.') {
        let path = Path::new(command);
        return path.is_file().then(|| canonicalize_display(path));
    }

    let path_env = env::var_os("PATH")
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| OsString::from("/usr/local/bin:/usr/bin:/bin:/opt/homebrew/bin"));

    env::split_paths(&path_env)
        .map(|dir| dir.join(command))
        .find(|candidate| candidate.is_file())
        .map(|candidate| canonicalize_display(&candidate))
}

/// Quote one argument for a POSIX shell command line.
pub fn shell_quote(arg: &str) -> String {
    shlex::try_quote(arg)
        .map(|quoted| quoted.into_owned())
        .unwrap_or_else(|_| format!("'{}'", arg.replace('\0', "").replace('\'', r"'\''")))
}

/// Keep the last `max` non-empty lines of `text`.
pub fn last_nonempty_lines(text: &str, max: usize) -> Vec<String> {
    let mut lines: Vec<String> = text
        .lines()
        .map(str::trim_end)
        .filter(|line| !line.trim().is_empty())
        .map(ToOwned::to_owned)
        .collect();
    if lines.len() > max {
        lines.drain(..lines.len() - max);
    }
    lines
}
