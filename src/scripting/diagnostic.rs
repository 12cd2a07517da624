/// `scripting/diagnostic.rs` — readable reports for Lua errors
///
/// Lua messages carry `chunk:line:` prefixes and mlua appends a
/// `stack traceback:` section. The diagnostic splits those apart and adds
/// the offending source line with a caret underline when the file is readable.
use std::{
    fmt, fs,
    path::{Path, PathBuf},
};

use serde::Serialize;

#[derive(Debug, Clone, Default, Serialize)]
pub struct ScriptDiagnostic {
    pub message: String,
    pub file: Option<String>,
    pub line: Option<u32>,
    pub source_line: Option<String>,
    pub underline: Option<String>,
    pub traceback: Option<String>,
}

impl ScriptDiagnostic {
    pub fn from_lua_error(err: &mlua::Error) -> Self {
        Self::build(err, &[])
    }

    /// Like `from_lua_error`, but restores `script` where Lua shortened the
    /// chunk name to `...tail`.
    pub fn for_script(err: &mlua::Error, script: &Path) -> Self {
        Self::build(err, &[script.to_path_buf()])
    }

    /// Like `for_script`, picking whichever of `scripts` the shortened
    /// chunk name belongs to.
    pub fn for_scripts(err: &mlua::Error, scripts: &[PathBuf]) -> Self {
        Self::build(err, scripts)
    }

    fn build(err: &mlua::Error, scripts: &[PathBuf]) -> Self {
        let (raw, traceback) = flatten(err);
        let (text, trailing) = match raw.split_once("\nstack traceback:") {
            Some((head, tail)) => (head.to_string(), Some(format!("stack traceback:{tail}"))),
            None => (raw, None),
        };

        let mut diag = match locate(&text) {
            Some((file, line, message)) => Self {
                message,
                file: Some(file),
                line: Some(line),
                ..Self::default()
            },
            None => Self {
                message: text,
                ..Self::default()
            },
        };
        diag.traceback = traceback.or(trailing);
        let restored = diag
            .file
            .as_deref()
            .and_then(|file| file.strip_prefix("..."))
            .and_then(|tail| {
                scripts
                    .iter()
                    .map(|script| script.display().to_string())
                    .find(|full| full.ends_with(tail))
            });
        if let Some(full) = restored {
            diag.file = Some(full);
        }
        diag.attach_source();
        diag
    }

    fn attach_source(&mut self) {
        let (Some(file), Some(line)) = (&self.file, self.line) else {
            return;
        };
        let Ok(source) = fs::read_to_string(file) else {
            return;
        };
        let Some(text) = source.lines().nth(line.saturating_sub(1) as usize) else {
            return;
        };
        self.underline = Some(underline(text));
        self.source_line = Some(text.to_string());
    }
}

impl fmt::Display for ScriptDiagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.file, self.line) {
            (Some(file), Some(line)) => writeln!(f, "{file}:{line}: {}", self.message)?,
            _ => writeln!(f, "{}", self.message)?,
        }
        if let (Some(src), Some(marks)) = (&self.source_line, &self.underline) {
            writeln!(f, "{src}")?;
            writeln!(f, "{marks}")?;
        }
        if let Some(tb) = &self.traceback {
            writeln!(f, "{tb}")?;
        }
        Ok(())
    }
}

/// Innermost message plus the callback traceback, if any.
fn flatten(err: &mlua::Error) -> (String, Option<String>) {
    match err {
        mlua::Error::SyntaxError { message, .. } => (message.clone(), None),
        mlua::Error::RuntimeError(message) => (message.clone(), None),
        mlua::Error::CallbackError { traceback, cause } => {
            let (message, inner) = flatten(cause);
            (message, inner.or_else(|| Some(traceback.clone())))
        }
        other => (other.to_string(), None),
    }
}

/// Split `chunk:line: message` into its parts.
///
/// The chunk may be a plain path or Lua's `[string "..."]` form.
fn locate(text: &str) -> Option<(String, u32, String)> {
    let first = text.lines().next()?;
    for (idx, _) in first.match_indices(':') {
        let rest = &first[idx + 1..];
        let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
        if digits.is_empty() || !rest[digits.len()..].starts_with(':') {
            continue;
        }
        let line = digits.parse().ok()?;
        let file = clean_chunk_name(&first[..idx]);
        let mut message = rest[digits.len() + 1..].trim_start().to_string();
        if let Some((_, more)) = text.split_once('\n') {
            message.push('\n');
            message.push_str(more);
        }
        return Some((file, line, message));
    }
    None
}

fn clean_chunk_name(chunk: &str) -> String {
    let chunk = chunk.trim();
    if let Some(inner) = chunk.strip_prefix("[string \"").and_then(|c| c.strip_suffix("\"]")) {
        return inner.to_string();
    }
    chunk.trim_start_matches(['@', '=']).to_string()
}

/// Carets under the non-blank span of `line`, keeping tabs aligned.
fn underline(line: &str) -> String {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    let indent: String = line
        .chars()
        .take_while(|c| c.is_whitespace())
        .map(|c| if c == '\t' { '\t' } else { ' ' })
        .collect();
    format!("{indent}{}", "^".repeat(trimmed.chars().count()))
}
