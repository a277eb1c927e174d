//! Structure templates and placeholder substitution.
//!
//! Placeholders are `$name` or `${name}` where `name` is an ASCII
//! identifier; `$$` stands for a literal `$`. Every placeholder must have a
//! value. Substitution is a single pass: text inserted for a placeholder is
//! never scanned again, so a body may contain `$` freely.
//!
//! No escaping is applied to inserted values. Callers own the trust
//! boundary for author-supplied text.

use std::path::{Path, PathBuf};

use serde_json::Value as JsonValue;
use tracing::debug;

use texflow_core::{defaults, Arguments, CompilerConfig, Error, Result, Task};

/// A structure file selected for one task.
#[derive(Debug, Clone, PartialEq)]
pub struct Structure {
    pub path: PathBuf,
    /// Global arguments after bibliography resolution.
    pub args: Arguments,
}

/// Rendered source for one task.
#[derive(Debug, Clone)]
pub struct Rendered {
    pub structure: PathBuf,
    pub source: String,
}

/// Pick the structure file for `template`.
///
/// When `args` asks for a bibliography and a `-biber` sibling of the
/// structure exists, the sibling is used and the trigger key is dropped
/// from the returned arguments. Otherwise the arguments are unchanged.
pub async fn resolve_structure(
    config: &CompilerConfig,
    template: &str,
    args: &Arguments,
) -> Result<Structure> {
    let settings = config.template(template)?;
    let mut args = args.clone();
    let mut structure = settings.structure.clone();

    if args.get(defaults::BIBLIOGRAPHY_KEY).is_some_and(is_truthy) {
        let variant = structure.replace(
            defaults::STRUCTURE_SUFFIX,
            defaults::BIBLIOGRAPHY_STRUCTURE_SUFFIX,
        );
        if variant != structure && is_file(&config.structure_dir.join(&variant)).await {
            debug!(template, structure = %variant, "Using bibliography structure");
            structure = variant;
            args.remove(defaults::BIBLIOGRAPHY_KEY);
        }
    }

    Ok(Structure {
        path: config.structure_dir.join(structure),
        args,
    })
}

/// Values for one render: `documentclass` and `body`, then the global
/// arguments, then the overlay arguments. Later entries win.
pub fn substitution_map(
    template: &str,
    body: &str,
    args: &Arguments,
    part_args: &Arguments,
) -> Arguments {
    let mut values = Arguments::new();
    values.insert("documentclass".into(), JsonValue::String(template.into()));
    values.insert("body".into(), JsonValue::String(body.into()));
    for (key, value) in args.iter().chain(part_args.iter()) {
        values.insert(key.clone(), value.clone());
    }
    values
}

/// Render a task's source document.
pub async fn render(config: &CompilerConfig, task: &Task) -> Result<Rendered> {
    let structure = resolve_structure(config, &task.template, &task.args).await?;
    let text = tokio::fs::read_to_string(&structure.path)
        .await
        .map_err(|e| {
            Error::Template(format!(
                "cannot read structure {}: {}",
                structure.path.display(),
                e
            ))
        })?;

    let values = substitution_map(&task.template, &task.body, &structure.args, &task.part_args);
    let source = substitute(&text, &values)?;

    debug!(
        subsystem = "compile",
        task_id = %task.task_id,
        structure = %structure.path.display(),
        source_len = source.len(),
        "Rendered source"
    );

    Ok(Rendered {
        structure: structure.path,
        source,
    })
}

/// Replace every placeholder in `text` with its value.
pub fn substitute(text: &str, values: &Arguments) -> Result<String> {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let offset = text.len() - rest.len() + pos;
        let after = &rest[pos + 1..];

        if let Some(tail) = after.strip_prefix('$') {
            out.push('$');
            rest = tail;
            continue;
        }

        let (name, tail) = match after.strip_prefix('{') {
            Some(braced) => match braced.find('}') {
                Some(end) if identifier_len(&braced[..end]) == end && end > 0 => {
                    (&braced[..end], &braced[end + 1..])
                }
                _ => return Err(invalid_placeholder(text, offset)),
            },
            None => match identifier_len(after) {
                0 => return Err(invalid_placeholder(text, offset)),
                len => (&after[..len], &after[len..]),
            },
        };

        let value = values
            .get(name)
            .ok_or_else(|| Error::Template(format!("no value for placeholder ${}", name)))?;
        push_value(&mut out, value);
        rest = tail;
    }

    out.push_str(rest);
    Ok(out)
}

/// Length of the ASCII identifier at the start of `s`.
fn identifier_len(s: &str) -> usize {
    let mut len = 0;
    for (i, c) in s.char_indices() {
        let ok = if i == 0 {
            c.is_ascii_alphabetic() || c == '_'
        } else {
            c.is_ascii_alphanumeric() || c == '_'
        };
        if !ok {
            break;
        }
        len = i + c.len_utf8();
    }
    len
}

fn invalid_placeholder(text: &str, offset: usize) -> Error {
    let before = &text[..offset];
    let line = before.matches('\n').count() + 1;
    let col = offset - before.rfind('\n').map_or(0, |i| i + 1) + 1;
    Error::Template(format!(
        "invalid placeholder at line {}, col {}",
        line, col
    ))
}

/// Strings are inserted verbatim, null as nothing, anything else as JSON.
fn push_value(out: &mut String, value: &JsonValue) {
    match value {
        JsonValue::String(s) => out.push_str(s),
        JsonValue::Null => {}
        other => out.push_str(&other.to_string()),
    }
}

fn is_truthy(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => false,
        JsonValue::Bool(b) => *b,
        JsonValue::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        JsonValue::String(s) => !s.is_empty(),
        JsonValue::Array(a) => !a.is_empty(),
        JsonValue::Object(o) => !o.is_empty(),
    }
}

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_file())
        .unwrap_or(false)
}
