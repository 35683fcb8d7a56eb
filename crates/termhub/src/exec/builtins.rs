//! Built-in file operations.
//!
//! A few common file commands are recognized and executed as plain argument
//! vectors after every path they touch has been checked against the session
//! root. Anything using shell syntax beyond plain words and a single output
//! redirection is left to the shell.

use std::path::{Component, Path, PathBuf};

use crate::error::{Error, Result};
use crate::isolation::ExecProgram;

/// Word-level token of a command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Token {
    Word(String),
    /// `>` or `>>`.
    Redirect { append: bool },
}

/// Characters that give a command line shell semantics we do not model.
fn is_shell_meta(c: char) -> bool {
    matches!(
        c,
        '|' | '&' | ';' | '<' | '(' | ')' | '$' | '`' | '\\' | '*' | '?' | '[' | ']' | '{' | '}'
            | '!' | '#' | '\n' | '\r'
    )
}

/// Split a command line into words, honoring quotes.
///
/// Returns `None` for unbalanced quotes or any unquoted shell metacharacter
/// other than `>`/`>>`.
pub(crate) fn tokenize(command: &str) -> Option<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut word = String::new();
    let mut in_word = false;
    let mut chars = command.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_word = true;
                loop {
                    match chars.next()? {
                        '\'' => break,
                        c => word.push(c),
                    }
                }
            }
            '"' => {
                in_word = true;
                loop {
                    match chars.next()? {
                        '"' => break,
                        '$' | '`' | '\\' => return None,
                        c => word.push(c),
                    }
                }
            }
            '>' => {
                if in_word {
                    tokens.push(Token::Word(std::mem::take(&mut word)));
                    in_word = false;
                }
                let append = chars.next_if_eq(&'>').is_some();
                if chars.peek() == Some(&'>') {
                    return None;
                }
                tokens.push(Token::Redirect { append });
            }
            c if c.is_whitespace() => {
                if in_word {
                    tokens.push(Token::Word(std::mem::take(&mut word)));
                    in_word = false;
                }
            }
            c if is_shell_meta(c) => return None,
            c => {
                in_word = true;
                word.push(c);
            }
        }
    }
    if in_word {
        tokens.push(Token::Word(word));
    }
    Some(tokens)
}

/// A recognized built-in with its raw (unresolved) path arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Builtin {
    List { flags: Vec<String>, paths: Vec<String> },
    Read { flags: Vec<String>, paths: Vec<String> },
    Write { text: String, path: String, append: bool },
    Touch { flags: Vec<String>, paths: Vec<String> },
    MakeDir { flags: Vec<String>, paths: Vec<String> },
    Remove { flags: Vec<String>, paths: Vec<String> },
    Search { pattern: String, paths: Vec<String> },
    ChangeDir { path: Option<String> },
    PrintDir,
}

fn is_flag(word: &str) -> bool {
    word.len() > 1
        && word.starts_with('-')
        && word[1..].chars().all(|c| c.is_ascii_alphanumeric())
}

/// Split words into short flags and operands; `--` ends the flags.
fn split_flags(words: &[String]) -> (Vec<String>, Vec<String>) {
    let mut flags = Vec::new();
    let mut operands = Vec::new();
    let mut flags_done = false;
    for word in words {
        if !flags_done && word == "--" {
            flags_done = true;
        } else if !flags_done && is_flag(word) {
            flags.push(word.clone());
        } else {
            operands.push(word.clone());
        }
    }
    (flags, operands)
}

/// Recognize a built-in. `None` means the command goes to the shell.
pub(crate) fn parse(command: &str) -> Option<Builtin> {
    let tokens = tokenize(command.trim())?;
    let (program, rest) = tokens.split_first()?;
    let Token::Word(program) = program else {
        return None;
    };

    if program == "echo" {
        return parse_echo(rest);
    }

    // Only echo may redirect.
    let words: Vec<String> = rest
        .iter()
        .map(|t| match t {
            Token::Word(w) => Some(w.clone()),
            Token::Redirect { .. } => None,
        })
        .collect::<Option<_>>()?;
    let (flags, operands) = split_flags(&words);

    let builtin = match program.as_str() {
        "ls" => Builtin::List {
            flags,
            paths: operands,
        },
        "cat" | "more" | "less" if !operands.is_empty() => Builtin::Read {
            flags,
            paths: operands,
        },
        "touch" if !operands.is_empty() => Builtin::Touch {
            flags,
            paths: operands,
        },
        "mkdir" if !operands.is_empty() => Builtin::MakeDir {
            flags,
            paths: operands,
        },
        "rm" if !operands.is_empty() => Builtin::Remove {
            flags,
            paths: operands,
        },
        "search" if !operands.is_empty() && flags.is_empty() => {
            let mut operands = operands.into_iter();
            let pattern = operands.next()?;
            Builtin::Search {
                pattern,
                paths: operands.collect(),
            }
        }
        "cd" if flags.is_empty() && operands.len() <= 1 => Builtin::ChangeDir {
            path: operands.into_iter().next(),
        },
        "pwd" if operands.is_empty() => Builtin::PrintDir,
        _ => return None,
    };
    Some(builtin)
}

fn parse_echo(rest: &[Token]) -> Option<Builtin> {
    let redirect = rest
        .iter()
        .position(|t| matches!(t, Token::Redirect { .. }))?;
    let (text, target) = rest.split_at(redirect);
    let [Token::Redirect { append }, Token::Word(path)] = target else {
        return None;
    };

    let words: Vec<&str> = text
        .iter()
        .map(|t| match t {
            Token::Word(w) => Some(w.as_str()),
            Token::Redirect { .. } => None,
        })
        .collect::<Option<_>>()?;
    if words.first().is_some_and(|w| is_flag(w)) {
        return None;
    }

    Some(Builtin::Write {
        text: words.join(" "),
        path: path.clone(),
        append: *append,
    })
}

impl Builtin {
    /// Raw path arguments that must stay inside the session root.
    pub(crate) fn path_args(&self) -> Vec<&str> {
        match self {
            Builtin::List { paths, .. }
            | Builtin::Read { paths, .. }
            | Builtin::Touch { paths, .. }
            | Builtin::MakeDir { paths, .. }
            | Builtin::Remove { paths, .. }
            | Builtin::Search { paths, .. } => paths.iter().map(String::as_str).collect(),
            Builtin::Write { path, .. } => vec![path.as_str()],
            Builtin::ChangeDir { path } => vec![path.as_deref().unwrap_or("~")],
            Builtin::PrintDir => Vec::new(),
        }
    }

    /// Argument vector for the operation, given the resolved paths (in the
    /// order of [`path_args`](Self::path_args)) and the working directory.
    pub(crate) fn program(&self, resolved: &[PathBuf], cwd: &Path) -> Option<ExecProgram> {
        let paths: Vec<String> = resolved.iter().map(|p| p.display().to_string()).collect();
        let with_default = |paths: Vec<String>| {
            if paths.is_empty() {
                vec![cwd.display().to_string()]
            } else {
                paths
            }
        };
        let command = |name: &str, flags: &[String], paths: Vec<String>| {
            let mut argv = vec![name.to_string()];
            argv.extend(flags.iter().cloned());
            argv.push("--".to_string());
            argv.extend(paths);
            argv
        };

        let argv = match self {
            Builtin::List { flags, .. } => command("ls", flags, with_default(paths)),
            Builtin::Read { flags, .. } => command("cat", flags, paths),
            Builtin::Touch { flags, .. } => command("touch", flags, paths),
            Builtin::MakeDir { flags, .. } => command("mkdir", flags, paths),
            Builtin::Remove { flags, .. } => command("rm", flags, paths),
            Builtin::Search { pattern, .. } => {
                let mut argv = vec![
                    "grep".to_string(),
                    "-rn".to_string(),
                    "--".to_string(),
                    pattern.clone(),
                ];
                argv.extend(with_default(paths));
                argv
            }
            Builtin::Write { text, append, .. } => {
                let script = if *append {
                    r#"printf '%s\n' "$1" >> "$2""#
                } else {
                    r#"printf '%s\n' "$1" > "$2""#
                };
                vec![
                    "/bin/sh".to_string(),
                    "-c".to_string(),
                    script.to_string(),
                    "termhub-write".to_string(),
                    text.clone(),
                    paths.first()?.clone(),
                ]
            }
            Builtin::ChangeDir { .. } => {
                vec!["test".to_string(), "-d".to_string(), paths.first()?.clone()]
            }
            Builtin::PrintDir => return None,
        };
        Some(ExecProgram::Argv(argv))
    }
}

/// Lexically resolve `arg` against the session root and working directory.
///
/// `~` and `~/x` name the root. Fails with `AccessDenied` when the result is
/// outside the root.
pub(crate) fn resolve_lexical(root: &Path, cwd: &Path, arg: &str) -> Result<PathBuf> {
    let joined = if arg == "~" {
        root.to_path_buf()
    } else if let Some(rest) = arg.strip_prefix("~/") {
        root.join(rest)
    } else if arg.starts_with('/') {
        PathBuf::from(arg)
    } else {
        cwd.join(arg)
    };

    let normalized = normalize(&joined);
    if !normalized.starts_with(root) {
        return Err(Error::AccessDenied(arg.to_string()));
    }
    Ok(normalized)
}

/// Remove `.` and `..` components without touching the filesystem.
pub(crate) fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Working directory as shown to clients: `~` or `~/relative`.
pub(crate) fn display_dir(root: &Path, cwd: &Path) -> String {
    match cwd.strip_prefix(root) {
        Ok(rel) if rel.as_os_str().is_empty() => "~".to_string(),
        Ok(rel) => format!("~/{}", rel.display()),
        Err(_) => cwd.display().to_string(),
    }
}
