//! Typed command templates.
//!
//! A [`CommandTemplate`] is a list of argument tokens, some of which are placeholders that
//! are only known once a worker is being launched (its resource id, its partition members,
//! its per-worker files). Rendering never goes through a shell, so no quoting is needed for
//! direct commands. When a tool has to be driven with one invocation per item and an input
//! block on stdin (ctffind), a [`ScriptTemplate`] writes a per-worker shell script instead,
//! with every value shell-quoted.
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::process::Command;

use super::error::TemplateError;
use super::partition::Partition;
use super::resources::ResourceKind;

/// Everything a template may reference about the worker being launched
#[derive(Debug, Clone, Copy)]
pub struct WorkerContext<'a> {
    pub index: usize,
    pub resource_id: usize,
    pub kind: ResourceKind,
    pub partition: &'a Partition,
}

impl WorkerContext<'_> {
    /// Per-worker name stem, e.g. `gpu1`
    pub fn worker_name(&self) -> String {
        format!("{}{}", self.kind.label(), self.resource_id)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ArgToken {
    Literal(String),
    /// The GPU or CPU id the worker is bound to
    ResourceId,
    WorkerIndex,
    /// Expands to one argument per partition member
    Members,
    /// A file named after the worker, e.g. `dir/gpu0.star`
    WorkerFile { dir: PathBuf, suffix: String },
}

/// A rendered, ready to spawn command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl RenderedCommand {
    pub fn new(program: &str, args: Vec<String>) -> Self {
        Self {
            program: program.to_string(),
            args,
        }
    }

    pub fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd
    }

    /// Shell-quoted command line for logs
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .map(shell_quote)
            .collect::<Vec<String>>()
            .join(" ")
    }
}

/// Builder for an external program invocation
#[derive(Debug, Clone, PartialEq)]
pub struct CommandTemplate {
    program: String,
    tokens: Vec<ArgToken>,
}

impl CommandTemplate {
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
            tokens: Vec::new(),
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn arg(mut self, value: impl Into<String>) -> Self {
        self.tokens.push(ArgToken::Literal(value.into()));
        self
    }

    /// A flag followed by its value, e.g. `--apix 1.06`
    pub fn flag(self, name: &str, value: impl Display) -> Self {
        self.arg(name).arg(value.to_string())
    }

    /// A flag with a value only when the value is present
    pub fn opt_flag<T: Display>(self, name: &str, value: Option<T>) -> Self {
        match value {
            Some(v) => self.flag(name, v),
            None => self,
        }
    }

    /// A bare switch only when `enabled`
    pub fn switch_if(self, name: &str, enabled: bool) -> Self {
        if enabled {
            self.arg(name)
        } else {
            self
        }
    }

    pub fn resource_id(mut self) -> Self {
        self.tokens.push(ArgToken::ResourceId);
        self
    }

    pub fn worker_index(mut self) -> Self {
        self.tokens.push(ArgToken::WorkerIndex);
        self
    }

    pub fn members(mut self) -> Self {
        self.tokens.push(ArgToken::Members);
        self
    }

    pub fn worker_file(mut self, dir: &Path, suffix: &str) -> Self {
        self.tokens.push(ArgToken::WorkerFile {
            dir: dir.to_path_buf(),
            suffix: suffix.to_string(),
        });
        self
    }

    pub fn tokens(&self) -> &[ArgToken] {
        &self.tokens
    }

    /// Substitute the worker's values into the template
    pub fn render(&self, ctx: &WorkerContext) -> Result<RenderedCommand, TemplateError> {
        let mut args = Vec::with_capacity(self.tokens.len() + ctx.partition.len());
        for token in &self.tokens {
            match token {
                ArgToken::Literal(value) => args.push(value.clone()),
                ArgToken::ResourceId => args.push(ctx.resource_id.to_string()),
                ArgToken::WorkerIndex => args.push(ctx.index.to_string()),
                ArgToken::Members => {
                    if ctx.partition.is_empty() {
                        return Err(TemplateError::EmptyPartition {
                            program: self.program.clone(),
                            worker: ctx.index,
                        });
                    }
                    args.extend(
                        ctx.partition
                            .items
                            .iter()
                            .map(|item| item.path().to_string_lossy().into_owned()),
                    );
                }
                ArgToken::WorkerFile { dir, suffix } => {
                    let name = format!("{}{suffix}", ctx.worker_name());
                    args.push(dir.join(name).to_string_lossy().into_owned());
                }
            }
        }
        Ok(RenderedCommand::new(&self.program, args))
    }
}

/// One line of the stdin block fed to each per-item invocation
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptLine {
    Literal(String),
    /// Path of the current item
    ItemPath,
    /// Stem of the current item with a suffix appended, e.g. `mic_001.ctf`
    ItemStem { suffix: String },
}

/// A per-worker shell script that runs `program` once per partition member,
/// feeding it an input block and redirecting its output to a per-item log
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptTemplate {
    program: String,
    lines: Vec<ScriptLine>,
    log_suffix: String,
}

impl ScriptTemplate {
    pub fn new(program: &str, log_suffix: &str) -> Self {
        Self {
            program: program.to_string(),
            lines: Vec::new(),
            log_suffix: log_suffix.to_string(),
        }
    }

    pub fn line(mut self, value: impl Display) -> Self {
        self.lines.push(ScriptLine::Literal(value.to_string()));
        self
    }

    pub fn item_path(mut self) -> Self {
        self.lines.push(ScriptLine::ItemPath);
        self
    }

    pub fn item_stem(mut self, suffix: &str) -> Self {
        self.lines.push(ScriptLine::ItemStem {
            suffix: suffix.to_string(),
        });
        self
    }

    /// Produce the script text for the worker
    pub fn render_script(&self, ctx: &WorkerContext) -> Result<String, TemplateError> {
        if ctx.partition.is_empty() {
            return Err(TemplateError::EmptyPartition {
                program: self.program.clone(),
                worker: ctx.index,
            });
        }
        let mut script = String::from("#!/bin/sh\n");
        for item in &ctx.partition.items {
            let stem = item.stem();
            let log = format!("{stem}{}", self.log_suffix);
            script.push_str(&format!(
                "{} > {} 2>&1 << 'CRYOFLOW_EOF'\n",
                shell_quote(&self.program),
                shell_quote(&log)
            ));
            for line in &self.lines {
                let value = match line {
                    ScriptLine::Literal(value) => value.clone(),
                    ScriptLine::ItemPath => item.path().to_string_lossy().into_owned(),
                    ScriptLine::ItemStem { suffix } => format!("{stem}{suffix}"),
                };
                script.push_str(&value);
                script.push('\n');
            }
            script.push_str("CRYOFLOW_EOF\n");
        }
        Ok(script)
    }

    /// Write the worker's script into `dir` and return the command that runs it
    pub fn write_script(
        &self,
        ctx: &WorkerContext,
        dir: &Path,
        stage: &str,
    ) -> Result<RenderedCommand, TemplateError> {
        use std::os::unix::fs::PermissionsExt;

        let script = self.render_script(ctx)?;
        let path = dir.join(format!("{stage}_{}.sh", ctx.worker_name()));
        std::fs::write(&path, script)?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))?;
        Ok(RenderedCommand::new(
            "sh",
            vec![path.to_string_lossy().into_owned()],
        ))
    }
}

/// Quote a value for a POSIX shell. Plain words are left as they are.
pub fn shell_quote(value: &str) -> String {
    let plain = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c));
    if plain {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', r"'\''"))
    }
}
