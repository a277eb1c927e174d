//! The external compile command.
//!
//! `compile_cmd` is split once into an argument vector with shell-like
//! quoting; `{filepath}` and `{outdir}` are substituted inside each argument.
//! The compiler is executed directly, without a shell.

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use tokio::process::Command;
use tracing::debug;

use texflow_core::{defaults, Error, Result};

/// Parsed compile command template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileCommand {
    argv: Vec<String>,
}

/// What the compiler left behind. Its exit status is informational only;
/// the artifact file is the success signal.
#[derive(Debug)]
pub struct CompileOutput {
    pub status: ExitStatus,
    pub stderr: String,
    pub duration: Duration,
}

impl CompileCommand {
    pub fn parse(template: &str) -> Result<Self> {
        let argv = split_args(template)?;
        if argv.is_empty() {
            return Err(Error::Config("no compile command provided".into()));
        }
        Ok(Self { argv })
    }

    /// Concrete arguments for one source file.
    pub fn argv(&self, filepath: &Path, outdir: &Path) -> Vec<String> {
        let filepath = filepath.to_string_lossy();
        let outdir = outdir.to_string_lossy();
        self.argv
            .iter()
            .map(|arg| {
                arg.replace(defaults::FILEPATH_PLACEHOLDER, &filepath)
                    .replace(defaults::OUTDIR_PLACEHOLDER, &outdir)
            })
            .collect()
    }

    /// Run the compiler in `outdir`, killing it when `timeout` elapses.
    pub async fn run(&self, filepath: &Path, outdir: &Path, timeout: Duration) -> Result<CompileOutput> {
        let argv = self.argv(filepath, outdir);
        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..])
            .current_dir(outdir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let start = Instant::now();
        let output = tokio::time::timeout(timeout, cmd.output())
            .await
            .map_err(|_| Error::CompileTimeout(timeout))?
            .map_err(|e| Error::Compile(format!("failed to execute {}: {}", argv[0], e)))?;

        let duration = start.elapsed();
        debug!(
            subsystem = "compile",
            program = %argv[0],
            status = %output.status,
            duration_ms = duration.as_millis() as u64,
            "Compiler exited"
        );

        Ok(CompileOutput {
            status: output.status,
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            duration,
        })
    }
}

/// Split a command line into words.
///
/// Whitespace separates words. Single quotes are literal; double quotes
/// allow `\"` and `\\`; a backslash outside quotes escapes the next
/// character.
pub fn split_args(line: &str) -> Result<Vec<String>> {
    let mut words = Vec::new();
    let mut word = String::new();
    let mut in_word = false;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            c if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut word));
                    in_word = false;
                }
            }
            '\'' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(c) => word.push(c),
                        None => return Err(unterminated(line)),
                    }
                }
            }
            '"' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(c @ ('"' | '\\')) => word.push(c),
                            Some(c) => {
                                word.push('\\');
                                word.push(c);
                            }
                            None => return Err(unterminated(line)),
                        },
                        Some(c) => word.push(c),
                        None => return Err(unterminated(line)),
                    }
                }
            }
            '\\' => {
                in_word = true;
                if let Some(c) = chars.next() {
                    word.push(c);
                }
            }
            c => {
                in_word = true;
                word.push(c);
            }
        }
    }

    if in_word {
        words.push(word);
    }
    Ok(words)
}

fn unterminated(line: &str) -> Error {
    Error::Config(format!("unterminated quote in compile command: {}", line))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_plain_words() {
        assert_eq!(
            split_args("xelatex -interaction=nonstopmode  {filepath}").unwrap(),
            vec!["xelatex", "-interaction=nonstopmode", "{filepath}"]
        );
    }

    #[test]
    fn test_split_quotes() {
        assert_eq!(
            split_args(r#"latexmk -outdir="{outdir}" 'a b' "say \"hi\"" c\ d"#).unwrap(),
            vec!["latexmk", "-outdir={outdir}", "a b", "say \"hi\"", "c d"]
        );
        assert_eq!(split_args("x ''").unwrap(), vec!["x", ""]);
    }

    #[test]
    fn test_split_unterminated() {
        assert!(matches!(split_args("latexmk 'oops"), Err(Error::Config(_))));
    }

    #[test]
    fn test_empty_command_rejected() {
        assert!(CompileCommand::parse("   ").is_err());
    }

    #[test]
    fn test_placeholders_substituted_per_argument() {
        let cmd = CompileCommand::parse("xelatex -output-directory={outdir} {filepath}").unwrap();
        let argv = cmd.argv(Path::new("/tmp/t1/t1.tex"), Path::new("/tmp/t1"));
        assert_eq!(
            argv,
            vec!["xelatex", "-output-directory=/tmp/t1", "/tmp/t1/t1.tex"]
        );
    }

    #[test]
    fn test_substituted_values_stay_single_arguments() {
        let cmd = CompileCommand::parse("echo {filepath}").unwrap();
        let argv = cmd.argv(Path::new("/tmp/a b; rm -rf x/doc.tex"), Path::new("/tmp"));
        assert_eq!(argv.len(), 2);
        assert_eq!(argv[1], "/tmp/a b; rm -rf x/doc.tex");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_in_outdir() {
        let dir = tempfile::tempdir().unwrap();
        let cmd = CompileCommand::parse("touch made.pdf").unwrap();
        let output = cmd
            .run(&dir.path().join("x.tex"), dir.path(), Duration::from_secs(10))
            .await
            .unwrap();
        assert!(output.status.success());
        assert!(dir.path().join("made.pdf").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let cmd = CompileCommand::parse("sleep 5").unwrap();
        let err = cmd
            .run(&dir.path().join("x.tex"), dir.path(), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CompileTimeout(d) if d == Duration::from_millis(100)));
    }

    #[tokio::test]
    async fn test_run_missing_program() {
        let dir = tempfile::tempdir().unwrap();
        let cmd = CompileCommand::parse("texflow-no-such-compiler {filepath}").unwrap();
        let err = cmd
            .run(&dir.path().join("x.tex"), dir.path(), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Compile(_)));
    }
}
