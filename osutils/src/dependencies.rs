use std::{
    borrow::Cow,
    ffi::{OsStr, OsString},
    io,
    os::unix::process::ExitStatusExt,
    path::PathBuf,
    process::{Command as StdCommand, ExitStatus, Output},
};

use log::trace;
use strum_macros::IntoStaticStr;

use blkplan_api::error::{BlkplanError, BlkplanResultExt, CommandFailureError};

#[derive(Debug, thiserror::Error)]
pub enum DependencyError {
    #[error("Failed to find dependency '{dependency}': {source}")]
    NotFound {
        dependency: Dependency,
        #[source]
        source: which::Error,
    },

    #[error("Failed to execute dependency '{dependency}': {inner}")]
    CouldNotExecute {
        dependency: Dependency,
        #[source]
        inner: io::Error,
    },

    #[error("Dependency '{dependency}' finished unsuccessfully: {explanation}\nCmdline: {rendered_command}\n{output}")]
    ExecutionFailed {
        dependency: Dependency,
        rendered_command: String,
        code: Option<i32>,
        signal: Option<i32>,
        stdout: String,
        stderr: String,
        explanation: String,
        output: String,
    },
}

impl From<DependencyError> for BlkplanError {
    #[track_caller]
    fn from(value: DependencyError) -> Self {
        let kind = match &value {
            DependencyError::NotFound { dependency, .. } => CommandFailureError::MissingBinary {
                binary: dependency.name().into(),
            },
            DependencyError::CouldNotExecute { dependency, .. } => {
                CommandFailureError::CommandFailed {
                    command: dependency.name().into(),
                }
            }
            DependencyError::ExecutionFailed {
                rendered_command, ..
            } => CommandFailureError::CommandFailed {
                command: rendered_command.clone(),
            },
        };
        BlkplanError::with_source(kind, value.into())
    }
}

pub trait DependencyResultExt<T> {
    /// Attach a context message to the error.
    fn message(self, context: impl Into<Cow<'static, str>>) -> Result<T, BlkplanError>;
}

impl<T> DependencyResultExt<T> for Result<T, Box<DependencyError>> {
    #[track_caller]
    fn message(self, context: impl Into<Cow<'static, str>>) -> Result<T, BlkplanError> {
        let result: Result<T, BlkplanError> = self.map_err(|e| (*e).into());
        result.message(context)
    }
}

/// Enum of runtime and test dependencies used in the code base.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum Dependency {
    Blkid,
    Btrfs,
    Cryptsetup,
    E2label,
    Fatlabel,
    Lsblk,
    Lvcreate,
    Lvremove,
    Lvrename,
    Lvs,
    Mdadm,
    #[strum(serialize = "mkfs.btrfs")]
    MkfsBtrfs,
    #[strum(serialize = "mkfs.ext2")]
    MkfsExt2,
    #[strum(serialize = "mkfs.ext3")]
    MkfsExt3,
    #[strum(serialize = "mkfs.ext4")]
    MkfsExt4,
    #[strum(serialize = "mkfs.ntfs")]
    MkfsNtfs,
    #[strum(serialize = "mkfs.vfat")]
    MkfsVfat,
    #[strum(serialize = "mkfs.xfs")]
    MkfsXfs,
    Mkswap,
    Mount,
    Parted,
    Pvcreate,
    Pvremove,
    Pvs,
    Sfdisk,
    Swaplabel,
    Umount,
    Vgcreate,
    Vgextend,
    Vgreduce,
    Vgremove,
    Vgrename,
    Vgs,
    Wipefs,
    #[strum(serialize = "xfs_admin")]
    XfsAdmin,
    // Test dependencies
    #[cfg(test)]
    DoesNotExist,
    #[cfg(test)]
    Echo,
    #[cfg(test)]
    False,
}

impl std::fmt::Display for Dependency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.into())
    }
}

impl Dependency {
    /// Gets the name of the dependency
    ///
    /// For example, Dependency::Mdadm => "mdadm"
    pub fn name(&self) -> &'static str {
        self.into()
    }

    /// Checks if the dependency is present in the system
    pub fn exists(&self) -> bool {
        self.path().is_ok()
    }

    /// Gets the path of the dependency
    pub fn path(&self) -> Result<PathBuf, Box<DependencyError>> {
        which::which(self.name()).map_err(|source| {
            Box::new(DependencyError::NotFound {
                dependency: *self,
                source,
            })
        })
    }

    /// Converts the dependency to a new Command instance
    /// (Note this does not create a std::process::Command instance)
    pub fn cmd(&self) -> Command {
        Command {
            dependency: *self,
            args: vec![],
            envs: vec![],
        }
    }
}

/// A structured invocation of an external tool. Commands are plain data until
/// a `CommandRunner` executes them, no shell is involved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    dependency: Dependency,
    args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
}

impl Command {
    pub fn arg<S: AsRef<OsStr>>(&mut self, arg: S) -> &mut Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn with_arg<S: AsRef<OsStr>>(mut self, arg: S) -> Self {
        self.arg(arg);
        self
    }

    pub fn args<I, S>(&mut self, args: I) -> &mut Command
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        for arg in args {
            self.arg(arg.as_ref());
        }
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args(args);
        self
    }

    pub fn env<K, V>(&mut self, key: K, val: V) -> &mut Command
    where
        K: AsRef<OsStr>,
        V: AsRef<OsStr>,
    {
        self.envs
            .push((key.as_ref().to_os_string(), val.as_ref().to_os_string()));
        self
    }

    pub fn dependency(&self) -> Dependency {
        self.dependency
    }

    pub fn get_args(&self) -> &[OsString] {
        &self.args
    }

    /// Renders the command line for logs and error reports.
    pub fn render(&self) -> String {
        if self.args.is_empty() {
            self.dependency.to_string()
        } else {
            format!(
                "{} {}",
                self.dependency,
                self.args
                    .iter()
                    .map(|arg| arg.to_string_lossy())
                    .map(|arg| if arg.contains(' ') {
                        format!("'{arg}'")
                    } else {
                        arg.into()
                    })
                    .collect::<Vec<_>>()
                    .join(" "),
            )
        }
    }

    /// Runs the command on this system.
    pub fn output(&self) -> Result<CommandOutput, Box<DependencyError>> {
        let mut cmd = StdCommand::new(self.dependency.path()?);
        cmd.args(&self.args);
        cmd.envs(self.envs.clone());
        let rendered_command = self.render();
        trace!("Executing '{rendered_command}'");
        let output = cmd
            .output()
            .map_err(|inner| DependencyError::CouldNotExecute {
                dependency: self.dependency,
                inner,
            })?;
        let output = CommandOutput {
            rendered_command: rendered_command.clone(),
            dependency: self.dependency,
            inner: output,
        };
        trace!(
            "Executed '{rendered_command}': {}. Report:\n{}",
            output.explain_exit(),
            output.output_report(),
        );
        Ok(output)
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.render())
    }
}

#[derive(Debug)]
pub struct CommandOutput {
    rendered_command: String,
    dependency: Dependency,
    inner: Output,
}

impl CommandOutput {
    /// Builds the output of a finished command, e.g. for a runner that does
    /// not execute anything.
    pub fn new(
        command: &Command,
        code: i32,
        stdout: impl Into<Vec<u8>>,
        stderr: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            rendered_command: command.render(),
            dependency: command.dependency,
            inner: Output {
                status: ExitStatus::from_raw(code << 8),
                stdout: stdout.into(),
                stderr: stderr.into(),
            },
        }
    }

    /// Checks if the process exited successfully
    pub fn success(&self) -> bool {
        self.inner.status.success()
    }

    /// Gets the exit code of the process, if it exited normally
    pub fn code(&self) -> Option<i32> {
        self.inner.status.code()
    }

    /// Gets the signal that terminated the process, if it was terminated by a signal
    fn signal(&self) -> Option<i32> {
        self.inner.status.signal()
    }

    /// Gets stderr
    pub fn error_output(&self) -> String {
        String::from_utf8_lossy(&self.inner.stderr).into()
    }

    /// Gets stdout
    pub fn output(&self) -> String {
        String::from_utf8_lossy(&self.inner.stdout).into()
    }

    /// Gets all available output, useful for reporting or debugging
    pub fn output_report(&self) -> String {
        let stdout = self.output();
        let stderr = self.error_output();

        let mut res = String::with_capacity(stdout.len() + stderr.len() + 20);

        if !stdout.is_empty() {
            res += &format!("stdout:\n{stdout}\n");
        }

        if !stderr.is_empty() {
            if !res.is_empty() {
                res += "\n";
            }
            res += &format!("stderr:\n{stderr}\n");
        }

        res
    }

    /// Checks if the process exited successfully, otherwise produces an error
    pub fn check(&self) -> Result<(), Box<DependencyError>> {
        if self.success() {
            return Ok(());
        }

        Err(Box::new(DependencyError::ExecutionFailed {
            dependency: self.dependency,
            rendered_command: self.rendered_command.clone(),
            code: self.code(),
            signal: self.signal(),
            stdout: self.output(),
            stderr: self.error_output(),
            explanation: self.explain_exit(),
            output: match self.output_report() {
                s if !s.is_empty() => s,
                _ => "(no output collected)".into(),
            },
        }))
    }

    /// Checks if the process exited successfully and returns the output,
    /// otherwise produces an error with the output
    pub fn check_output(&self) -> Result<String, Box<DependencyError>> {
        self.check()?;
        Ok(self.output())
    }

    /// Produces a string explaining the exit status of the process
    fn explain_exit(&self) -> String {
        if let Some(code) = self.code() {
            format!("exited with status: {code}")
        } else if let Some(signal) = self.signal() {
            format!("terminated by signal: {signal}")
        } else {
            "exited with unknown status".into()
        }
    }
}

/// Executes commands. The commit engine and the live system facts only talk to
/// the system through a runner.
pub trait CommandRunner {
    /// Runs the command and returns its output regardless of the exit status.
    fn output(&self, command: &Command) -> Result<CommandOutput, Box<DependencyError>>;

    /// Checks if the binary of the dependency can be found.
    fn exists(&self, dependency: Dependency) -> bool;

    fn run_and_check(&self, command: &Command) -> Result<(), Box<DependencyError>> {
        self.output(command)?.check()
    }

    fn output_and_check(&self, command: &Command) -> Result<String, Box<DependencyError>> {
        self.output(command)?.check_output()
    }
}

/// Runs commands on the local system, resolving binaries through `$PATH`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn output(&self, command: &Command) -> Result<CommandOutput, Box<DependencyError>> {
        command.output()
    }

    fn exists(&self, dependency: Dependency) -> bool {
        dependency.exists()
    }
}

#[cfg(test)]
mod tests {
    use blkplan_api::error::ErrorKind;

    use super::*;

    #[test]
    fn test_command() {
        let runner = SystemRunner;
        runner
            .run_and_check(&Dependency::Echo.cmd().with_arg("Hello, world"))
            .unwrap();
        let output = runner
            .output_and_check(&Dependency::Echo.cmd().with_arg("Hello, world"))
            .unwrap();
        assert_eq!(output, "Hello, world\n");

        let rendered = Dependency::Echo.cmd().with_arg("Hello, world").render();
        assert_eq!(rendered, "echo 'Hello, world'");
    }

    #[test]
    fn test_arg_and_args() {
        let arg = Dependency::Echo.cmd().with_arg("Hello, world").output();
        let args = Dependency::Echo.cmd().with_args(["Hello,", "world"]).output();

        let arg_output = arg.unwrap().output();
        let args_output = args.unwrap().output();
        assert_eq!(arg_output, args_output);
        assert_eq!(arg_output, "Hello, world\n");
    }

    #[test]
    fn test_dependency_names() {
        assert_eq!(Dependency::Mdadm.name(), "mdadm");
        assert_eq!(Dependency::MkfsExt4.name(), "mkfs.ext4");
        assert_eq!(Dependency::XfsAdmin.name(), "xfs_admin");
    }

    #[test]
    fn test_nonexistent_dep() {
        let output = Dependency::DoesNotExist.cmd().output().unwrap_err();
        assert!(matches!(*output, DependencyError::NotFound { .. }));
        assert_eq!(
            output.to_string(),
            "Failed to find dependency 'doesnotexist': cannot find binary path"
        );

        let error: BlkplanError = (*output).into();
        assert_eq!(
            error.kind(),
            &ErrorKind::CommandFailure(CommandFailureError::MissingBinary {
                binary: "doesnotexist".into()
            })
        );
    }

    #[test]
    fn test_commandoutput() {
        // This command should succeed
        let output = Dependency::Echo.cmd().with_arg("Hello, world").output().unwrap();
        assert!(output.success());
        assert_eq!(output.code(), Some(0));
        assert_eq!(output.signal(), None);
        assert_eq!(output.error_output(), "");
        assert_eq!(output.output(), "Hello, world\n");
        assert_eq!(output.output_report(), "stdout:\nHello, world\n\n");
        assert!(matches!(output.check(), Ok(())));
        assert!(matches!(output.check_output(), Ok(s) if s == "Hello, world\n"));
        assert_eq!(output.explain_exit(), "exited with status: 0");

        // This command should fail
        let output = Dependency::False.cmd().output().unwrap();
        assert!(!output.success());
        assert_eq!(output.code(), Some(1));
        assert_eq!(output.output_report(), "");
        assert!(matches!(
            *output.check().unwrap_err(),
            DependencyError::ExecutionFailed { .. }
        ));
        assert_eq!(output.explain_exit(), "exited with status: 1");
    }

    #[test]
    fn test_constructed_output() {
        let command = Dependency::Mdadm.cmd().with_args(["--stop", "/dev/md0"]);
        let output = CommandOutput::new(&command, 1, "", "mdadm: Cannot get exclusive access");
        assert_eq!(output.code(), Some(1));
        let error: BlkplanError = (*output.check().unwrap_err()).into();
        assert_eq!(
            error.kind(),
            &ErrorKind::CommandFailure(CommandFailureError::CommandFailed {
                command: "mdadm --stop /dev/md0".into()
            })
        );
    }
}
