//! Launcher script rendering.
//!
//! Pure functions: nothing here touches the filesystem. The supervisor
//! writes the rendered text to `<instance>_run.sh` (or `.ps1`) and executes
//! it.
//!
//! Four templates per family, selected by two questions:
//!
//! | pid file | working dir | behaviour                                    |
//! |----------|-------------|----------------------------------------------|
//! | yes      | yes         | `cd dir`, write own pid, exec command        |
//! | yes      | no          | write own pid, exec command                  |
//! | no       | yes         | `cd dir`, exec command (caller records pid)  |
//! | no       | no          | exec command (caller records pid)            |
//!
//! A script without a pid file is the blocking variant: the caller waits on
//! it and records the pid of the child it spawned.

use std::path::Path;

use crate::constants::SCRIPT_SUFFIX;

/// Shell dialect of launcher scripts. Chosen once per node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScriptFamily {
    /// POSIX `sh`.
    Posix,
    /// Windows PowerShell.
    PowerShell,
}

impl ScriptFamily {
    pub fn extension(self) -> &'static str {
        match self {
            Self::Posix => "sh",
            Self::PowerShell => "ps1",
        }
    }

    /// `<instance>_run.<ext>`
    pub fn file_name(self, instance_id: &str) -> String {
        format!("{}{}.{}", instance_id, SCRIPT_SUFFIX, self.extension())
    }

    /// argv that executes a script of this family.
    pub fn interpreter(self, script: &Path) -> Vec<String> {
        let script = script.to_string_lossy().into_owned();
        match self {
            Self::Posix => vec!["sh".to_string(), script],
            Self::PowerShell => vec!["PowerShell".to_string(), "-File".to_string(), script],
        }
    }
}

/// Inputs of one launcher script.
#[derive(Debug, Clone, Copy)]
pub struct ScriptSpec<'a> {
    pub command: &'a str,
    pub args: &'a [String],
    pub working_dir: Option<&'a Path>,
    /// Where the script writes its own pid. `None` renders the blocking variant.
    pub pid_file: Option<&'a Path>,
    /// Network namespace to exec in. Ignored by PowerShell.
    pub namespace: Option<&'a str>,
}

impl ScriptSpec<'_> {
    pub fn is_blocking(&self) -> bool {
        self.pid_file.is_none()
    }
}

/// Renders the launcher script for `spec` in `family`.
pub fn render(family: ScriptFamily, spec: &ScriptSpec<'_>) -> String {
    match family {
        ScriptFamily::Posix => render_posix(spec),
        ScriptFamily::PowerShell => render_powershell(spec),
    }
}

// =============================================================================
// POSIX
// =============================================================================

fn render_posix(spec: &ScriptSpec<'_>) -> String {
    let mut script = String::from("#!/bin/sh\n");

    if let Some(dir) = spec.working_dir {
        script.push_str(&format!("cd {} || exit 1\n", sh_quote(&dir.to_string_lossy())));
    }
    if let Some(pid_file) = spec.pid_file {
        script.push_str(&format!("echo $$ > {}\n", sh_quote(&pid_file.to_string_lossy())));
    }

    let mut line = String::from("exec");
    if let Some(ns) = spec.namespace {
        line.push_str(&format!(" ip netns exec {}", sh_quote(ns)));
    }
    line.push(' ');
    line.push_str(&sh_quote(spec.command));
    for arg in spec.args {
        line.push(' ');
        line.push_str(&sh_quote(arg));
    }
    script.push_str(&line);
    script.push('\n');
    script
}

/// Single-quotes `s` unless it is made only of shell-safe characters.
pub fn sh_quote(s: &str) -> String {
    let safe = !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | ':' | '=' | ',' | '+' | '@'));
    if safe {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', r"'\''"))
    }
}

// =============================================================================
// PowerShell
// =============================================================================

fn render_powershell(spec: &ScriptSpec<'_>) -> String {
    let mut script = String::new();

    if let Some(dir) = spec.working_dir {
        script.push_str(&format!("Set-Location -Path {}\n", ps_quote(&dir.to_string_lossy())));
    }

    match spec.pid_file {
        Some(pid_file) => {
            let mut start = format!("$p = Start-Process -FilePath {}", ps_quote(spec.command));
            if !spec.args.is_empty() {
                let list: Vec<String> = spec.args.iter().map(|a| ps_quote(a)).collect();
                start.push_str(&format!(" -ArgumentList {}", list.join(",")));
            }
            start.push_str(" -NoNewWindow -PassThru\n");
            script.push_str(&start);
            script.push_str(&format!(
                "$p.Id | Out-File -FilePath {} -Encoding ascii -NoNewline\n",
                ps_quote(&pid_file.to_string_lossy())
            ));
            script.push_str("$p.WaitForExit()\nexit $p.ExitCode\n");
        }
        None => {
            let mut line = format!("& {}", ps_quote(spec.command));
            for arg in spec.args {
                line.push(' ');
                line.push_str(&ps_quote(arg));
            }
            script.push_str(&line);
            script.push_str("\nexit $LASTEXITCODE\n");
        }
    }
    script
}

fn ps_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_posix_detached_with_dir() {
        let args = vec!["100".to_string()];
        let dir = PathBuf::from("/srv/apps/d/web");
        let pid = PathBuf::from("/srv/apps/d/web/i1.pid");
        let spec = ScriptSpec {
            command: "sleep",
            args: &args,
            working_dir: Some(&dir),
            pid_file: Some(&pid),
            namespace: Some("ns-1"),
        };
        let script = render(ScriptFamily::Posix, &spec);
        assert_eq!(
            script,
            "#!/bin/sh\ncd /srv/apps/d/web || exit 1\necho $$ > /srv/apps/d/web/i1.pid\nexec ip netns exec ns-1 sleep 100\n"
        );
    }

    #[test]
    fn test_posix_blocking_has_no_pid_line() {
        let spec = ScriptSpec {
            command: "true",
            args: &[],
            working_dir: None,
            pid_file: None,
            namespace: None,
        };
        assert!(spec.is_blocking());
        let script = render(ScriptFamily::Posix, &spec);
        assert!(!script.contains("$$"));
        assert!(!script.contains("cd "));
        assert!(script.ends_with("exec true\n"));
    }

    #[test]
    fn test_posix_quotes_arguments() {
        let args = vec!["hello world".to_string(), "it's".to_string()];
        let spec = ScriptSpec {
            command: "echo",
            args: &args,
            working_dir: None,
            pid_file: None,
            namespace: None,
        };
        let script = render(ScriptFamily::Posix, &spec);
        assert!(script.contains("exec echo 'hello world' 'it'\\''s'"), "got: {}", script);
    }

    #[test]
    fn test_powershell_detached_writes_pid() {
        let args = vec!["-n".to_string(), "3".to_string()];
        let pid = PathBuf::from(r"C:\fos\i1.pid");
        let spec = ScriptSpec {
            command: "ping",
            args: &args,
            working_dir: None,
            pid_file: Some(&pid),
            namespace: Some("ignored"),
        };
        let script = render(ScriptFamily::PowerShell, &spec);
        assert!(script.contains("Start-Process -FilePath 'ping' -ArgumentList '-n','3'"));
        assert!(script.contains(r"Out-File -FilePath 'C:\fos\i1.pid'"));
        assert!(!script.contains("ignored"));
    }

    #[test]
    fn test_file_names() {
        assert_eq!(ScriptFamily::Posix.file_name("i1"), "i1_run.sh");
        assert_eq!(ScriptFamily::PowerShell.file_name("i1"), "i1_run.ps1");
    }
}
