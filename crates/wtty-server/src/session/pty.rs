//! Local command on a pseudo-terminal, via portable-pty.

use super::{SessionFactory, Slave, SpawnParams};
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use std::collections::HashMap;
use std::io::{Read, Write};
use tracing::{debug, info, warn};
use wtty_core::{WttyError, WttyResult};

const DEFAULT_COLS: u16 = 80;
const DEFAULT_ROWS: u16 = 24;

/// What to run for every session.
#[derive(Debug, Clone)]
pub struct CommandOptions {
    pub command: String,
    pub args: Vec<String>,
    /// Append `arg` query parameters from the client to `args`.
    pub permit_arguments: bool,
}

/// Spawns `command args...` on a fresh PTY per session.
pub struct CommandFactory {
    options: CommandOptions,
}

impl CommandFactory {
    pub fn new(options: CommandOptions) -> WttyResult<Self> {
        if options.command.trim().is_empty() {
            return Err(WttyError::Config("empty command".into()));
        }
        Ok(Self { options })
    }

    fn argv(&self, params: &SpawnParams) -> Vec<String> {
        let mut argv = Vec::with_capacity(self.options.args.len() + 1);
        argv.push(self.options.command.clone());
        argv.extend(self.options.args.iter().cloned());
        if self.options.permit_arguments {
            if let Some(extra) = params.query.get("arg") {
                argv.extend(extra.iter().cloned());
            }
        }
        argv
    }
}

impl SessionFactory for CommandFactory {
    fn name(&self) -> &str {
        &self.options.command
    }

    fn spawn(&self, params: SpawnParams) -> WttyResult<Box<dyn Slave>> {
        let pair = native_pty_system()
            .openpty(PtySize {
                rows: DEFAULT_ROWS,
                cols: DEFAULT_COLS,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| WttyError::Session(format!("failed to open PTY: {e}")))?;

        let argv = self.argv(&params);
        let mut cmd = CommandBuilder::from_argv(argv.iter().map(Into::into).collect());
        if let Ok(cwd) = std::env::current_dir() {
            cmd.cwd(cwd);
        }
        cmd.env("TERM", "xterm-256color");
        for (name, value) in header_env(params.headers.as_ref()) {
            cmd.env(name, value);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| WttyError::Session(format!("failed to spawn `{}`: {e}", argv.join(" "))))?;
        drop(pair.slave);

        let pid = child.process_id();
        info!(command = %argv.join(" "), pid, "command started");

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| WttyError::Session(format!("failed to clone PTY reader: {e}")))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| WttyError::Session(format!("failed to take PTY writer: {e}")))?;

        Ok(Box::new(PtySlave {
            master: pair.master,
            reader: Some(reader),
            writer: Some(writer),
            child,
            argv,
        }))
    }
}

/// `X-Forwarded-For` becomes `HTTP_X_FORWARDED_FOR`; repeated values are
/// comma-joined.
fn header_env(headers: Option<&HashMap<String, Vec<String>>>) -> Vec<(String, String)> {
    let Some(headers) = headers else {
        return Vec::new();
    };
    let mut env: Vec<_> = headers
        .iter()
        .map(|(name, values)| {
            (
                format!("HTTP_{}", name.to_ascii_uppercase().replace('-', "_")),
                values.join(","),
            )
        })
        .collect();
    env.sort();
    env
}

struct PtySlave {
    master: Box<dyn MasterPty + Send>,
    reader: Option<Box<dyn Read + Send>>,
    writer: Option<Box<dyn Write + Send>>,
    child: Box<dyn Child + Send + Sync>,
    argv: Vec<String>,
}

impl Slave for PtySlave {
    fn take_reader(&mut self) -> WttyResult<Box<dyn Read + Send>> {
        self.reader
            .take()
            .ok_or_else(|| WttyError::Session("PTY reader already taken".into()))
    }

    fn take_writer(&mut self) -> WttyResult<Box<dyn Write + Send>> {
        self.writer
            .take()
            .ok_or_else(|| WttyError::Session("PTY writer already taken".into()))
    }

    fn resize(&mut self, cols: u16, rows: u16) -> WttyResult<()> {
        self.master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| WttyError::Session(format!("PTY resize failed: {e}")))?;
        debug!(cols, rows, "PTY resized");
        Ok(())
    }

    fn title_variables(&self) -> HashMap<String, String> {
        let mut vars = HashMap::new();
        if let Some(pid) = self.child.process_id() {
            vars.insert("pid".to_string(), pid.to_string());
        }
        vars.insert("argv".to_string(), self.argv.join(" "));
        vars
    }

    fn close(&mut self) -> WttyResult<()> {
        if let Ok(Some(status)) = self.child.try_wait() {
            debug!(code = status.exit_code(), "command already exited");
            return Ok(());
        }
        self.child
            .kill()
            .map_err(|e| WttyError::Session(format!("kill failed: {e}")))?;
        match self.child.wait() {
            Ok(status) => info!(code = status.exit_code(), "command exited"),
            Err(e) => warn!(error = %e, "failed to reap command"),
        }
        Ok(())
    }
}
