//! Engines backed by external helper executables.
//!
//! The spoofer helper is run once per call: `init [--driver <path>]`,
//! `apply` (one JSON request on stdin) and `cleanup`. A non-zero exit is a
//! failure and its stderr is the reason.
//!
//! The activation helper is started in `serve` mode once per handle and
//! answers newline-delimited JSON requests on its stdio until it is told to
//! release.

use std::{
    ffi::{OsStr, OsString},
    io::{self, BufRead, BufReader, Write},
    path::{Path, PathBuf},
    process::{Child, ChildStdin, ChildStdout, Command, Stdio},
    thread,
    time::{Duration, Instant},
};

use rotary_db::models::Identity;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{ActivationHandle, ActivationReply, ActivationService, EngineError, SpoofingService};

const REAP_TIMEOUT: Duration = Duration::from_secs(1);

fn spawn_error(program: &Path, op: &'static str, e: io::Error) -> EngineError {
    match e.kind() {
        io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied => {
            EngineError::call(op, format!("cannot run {}: {e}", program.display()))
        }
        _ => EngineError::Io(e),
    }
}

#[derive(Debug, Serialize)]
#[serde(tag = "step", rename_all = "snake_case")]
enum ApplyRequest<'a> {
    Identity {
        identity: &'a Identity,
    },
    Smbios {
        identity: &'a Identity,
    },
    Disk {
        serial: &'a str,
        model: &'a str,
        revision: &'a str,
    },
    CleanDiskVolume {
        enabled: bool,
    },
    Cpuid {
        cpuid_0: &'a str,
        cpuid_1: &'a str,
    },
    RandomizeMac,
    VmSpoof {
        enabled: bool,
    },
}

/// [`SpoofingService`] that shells out to a helper executable.
#[derive(Debug, Clone)]
pub struct HelperSpoofer {
    program: PathBuf,
    args: Vec<OsString>,
    driver: Option<PathBuf>,
}

impl HelperSpoofer {
    pub fn new(program: impl Into<PathBuf>, driver: Option<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            driver,
        }
    }

    /// Arguments placed before the subcommand, e.g. a script for an
    /// interpreter.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    fn run(
        &self,
        op: &'static str,
        args: &[&OsStr],
        input: Option<&[u8]>,
    ) -> Result<(), EngineError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .args(args)
            .stdin(if input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| spawn_error(&self.program, op, e))?;

        // The child is always waited on, even when it stopped reading early.
        let written = match (input, child.stdin.take()) {
            (Some(input), Some(mut stdin)) => stdin.write_all(input),
            _ => Ok(()),
        };

        let output = child.wait_with_output()?;
        if output.status.success() {
            written?;
            debug!(op, "spoofer helper succeeded");
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let reason = match stderr.trim() {
            "" => format!("helper exited with {}", output.status),
            message => message.to_string(),
        };
        Err(EngineError::call(op, reason))
    }

    fn apply(&self, op: &'static str, request: &ApplyRequest<'_>) -> Result<(), EngineError> {
        let body =
            serde_json::to_vec(request).map_err(|e| EngineError::Protocol(e.to_string()))?;
        self.run(op, &[OsStr::new("apply")], Some(&body))
    }
}

impl SpoofingService for HelperSpoofer {
    fn init(&self) -> Result<(), EngineError> {
        match &self.driver {
            Some(driver) => self.run(
                "init",
                &[OsStr::new("init"), OsStr::new("--driver"), driver.as_os_str()],
                None,
            ),
            None => self.run("init", &[OsStr::new("init")], None),
        }
    }

    fn set_smbios(&self, identity: &Identity) -> Result<(), EngineError> {
        self.apply("set_smbios", &ApplyRequest::Smbios { identity })
    }

    fn set_disk(&self, serial: &str, model: &str, revision: &str) -> Result<(), EngineError> {
        self.apply(
            "set_disk",
            &ApplyRequest::Disk {
                serial,
                model,
                revision,
            },
        )
    }

    fn clean_disk_volume(&self, enabled: bool) -> Result<(), EngineError> {
        self.apply("clean_disk_volume", &ApplyRequest::CleanDiskVolume { enabled })
    }

    fn set_cpuid(&self, cpuid_0: &str, cpuid_1: &str) -> Result<(), EngineError> {
        self.apply("set_cpuid", &ApplyRequest::Cpuid { cpuid_0, cpuid_1 })
    }

    fn randomize_mac(&self) -> Result<(), EngineError> {
        self.apply("randomize_mac", &ApplyRequest::RandomizeMac)
    }

    fn enable_vm_spoof(&self, enabled: bool) -> Result<(), EngineError> {
        self.apply("enable_vm_spoof", &ApplyRequest::VmSpoof { enabled })
    }

    fn cleanup(&self) {
        if let Err(e) = self.run("cleanup", &[OsStr::new("cleanup")], None) {
            warn!(error = %e, "spoofer cleanup failed");
        }
    }

    /// The helper applies the whole fingerprint in one request.
    fn apply_identity(&self, identity: &Identity) -> Result<(), EngineError> {
        self.apply("apply_identity", &ApplyRequest::Identity { identity })
    }
}

#[derive(Debug, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Request<'a> {
    Activate {
        license_code: &'a str,
        additional_code: &'a str,
    },
    Version,
    MachineCode,
    CursorPosition,
    Release,
}

#[derive(Debug, Default, Deserialize)]
struct Reply {
    ok: bool,
    #[serde(default)]
    status: Option<i32>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    x: Option<i32>,
    #[serde(default)]
    y: Option<i32>,
    #[serde(default)]
    error: Option<String>,
}

/// [`ActivationService`] that starts one helper process per handle.
#[derive(Debug, Clone)]
pub struct HelperActivation {
    program: PathBuf,
    args: Vec<OsString>,
}

impl HelperActivation {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: vec!["serve".into()],
        }
    }

    /// Replace the default `serve` argument list.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

impl ActivationService for HelperActivation {
    fn create_handle(&self) -> Result<Box<dyn ActivationHandle>, EngineError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| spawn_error(&self.program, "create_handle", e))?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(EngineError::Protocol("helper stdio was not captured".into()));
        };

        debug!(pid = child.id(), "started activation helper");
        Ok(Box::new(HelperHandle {
            child: Some(child),
            stdin: Some(stdin),
            stdout: BufReader::new(stdout),
        }))
    }
}

struct HelperHandle {
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    stdout: BufReader<ChildStdout>,
}

impl HelperHandle {
    fn call(&mut self, op: &'static str, request: &Request<'_>) -> Result<Reply, EngineError> {
        let line =
            serde_json::to_string(request).map_err(|e| EngineError::Protocol(e.to_string()))?;
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| EngineError::Unavailable("helper input is closed".into()))?;
        writeln!(stdin, "{line}")?;
        stdin.flush()?;

        let mut reply = String::new();
        if self.stdout.read_line(&mut reply)? == 0 {
            return Err(EngineError::Unavailable(format!(
                "helper exited before answering {op}"
            )));
        }

        let reply: Reply = serde_json::from_str(reply.trim())
            .map_err(|e| EngineError::Protocol(format!("bad {op} reply: {e}")))?;
        if !reply.ok {
            let reason = reply.error.unwrap_or_else(|| "unknown error".into());
            return Err(EngineError::call(op, reason));
        }
        Ok(reply)
    }

    fn value(&mut self, op: &'static str, request: &Request<'_>) -> Result<String, EngineError> {
        self.call(op, request)?
            .value
            .ok_or_else(|| EngineError::Protocol(format!("{op} reply has no value")))
    }

    fn reap(&mut self) {
        self.stdin.take();
        let Some(mut child) = self.child.take() else {
            return;
        };

        let deadline = Instant::now() + REAP_TIMEOUT;
        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    debug!(%status, "activation helper exited");
                    return;
                }
                Ok(None) if Instant::now() < deadline => thread::sleep(Duration::from_millis(10)),
                Ok(None) | Err(_) => break,
            }
        }

        warn!(pid = child.id(), "activation helper did not exit, killing it");
        let _ = child.kill();
        let _ = child.wait();
    }
}

impl ActivationHandle for HelperHandle {
    fn activate(
        &mut self,
        license_code: &str,
        additional_code: &str,
    ) -> Result<ActivationReply, EngineError> {
        let reply = self.call(
            "activate",
            &Request::Activate {
                license_code,
                additional_code,
            },
        )?;
        let status = reply
            .status
            .ok_or_else(|| EngineError::Protocol("activate reply has no status".into()))?;

        Ok(ActivationReply {
            status,
            message: reply.message.unwrap_or_default(),
        })
    }

    fn version(&mut self) -> Result<String, EngineError> {
        self.value("version", &Request::Version)
    }

    fn machine_code(&mut self) -> Result<String, EngineError> {
        self.value("machine_code", &Request::MachineCode)
    }

    fn cursor_position(&mut self) -> Result<(i32, i32), EngineError> {
        let reply = self.call("cursor_position", &Request::CursorPosition)?;
        match (reply.x, reply.y) {
            (Some(x), Some(y)) => Ok((x, y)),
            _ => Err(EngineError::Protocol(
                "cursor_position reply has no coordinates".into(),
            )),
        }
    }

    fn release(mut self: Box<Self>) {
        if let Err(e) = self.call("release", &Request::Release) {
            debug!(error = %e, "release request failed");
        }
        self.reap();
    }
}

impl Drop for HelperHandle {
    fn drop(&mut self) {
        self.reap();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_lines() {
        let activate = Request::Activate {
            license_code: "LIC",
            additional_code: "",
        };

        assert_eq!(
            serde_json::to_string(&activate).unwrap(),
            r#"{"op":"activate","license_code":"LIC","additional_code":""}"#
        );
        assert_eq!(
            serde_json::to_string(&Request::MachineCode).unwrap(),
            r#"{"op":"machine_code"}"#
        );
    }

    #[test]
    fn test_apply_request_is_tagged_by_step() {
        let json = serde_json::to_value(ApplyRequest::Cpuid {
            cpuid_0: "AAAA",
            cpuid_1: "BBBB",
        })
        .unwrap();

        assert_eq!(json["step"], "cpuid");
        assert_eq!(json["cpuid_0"], "AAAA");

        let identity = Identity::generate();
        let json = serde_json::to_value(ApplyRequest::Identity {
            identity: &identity,
        })
        .unwrap();
        assert_eq!(json["step"], "identity");
        assert_eq!(json["identity"]["virtual_machine_code"], identity.virtual_code);
    }

    #[test]
    fn test_reply_parsing() {
        let reply: Reply = serde_json::from_str(r#"{"ok":true,"x":3,"y":-4}"#).unwrap();
        assert!(reply.ok);
        assert_eq!((reply.x, reply.y), (Some(3), Some(-4)));
        assert!(reply.value.is_none());

        let reply: Reply = serde_json::from_str(r#"{"ok":false,"error":"busy"}"#).unwrap();
        assert!(!reply.ok);
        assert_eq!(reply.error.as_deref(), Some("busy"));
    }

    #[test]
    fn test_missing_program_is_a_call_error() {
        let service = HelperActivation::new("/nonexistent/rotary-activator");
        let err = service.create_handle().err().unwrap();

        assert!(matches!(err, EngineError::Call { op: "create_handle", .. }));
        assert!(!err.is_transient());
    }

    #[cfg(unix)]
    mod process {
        use std::fs;

        use super::*;

        const ACTIVATOR: &str = r#"
while read -r line; do
  case "$line" in
    *'"op":"activate"'*) echo '{"ok":true,"status":1,"message":"activated"}' ;;
    *'"op":"version"'*) echo '{"ok":true,"value":"5.0.1"}' ;;
    *'"op":"machine_code"'*) echo '{"ok":true,"value":"ABCDEF0123456789"}' ;;
    *'"op":"cursor_position"'*) echo '{"ok":true,"x":12,"y":34}' ;;
    *'"op":"release"'*) echo '{"ok":true}'; exit 0 ;;
    *) echo '{"ok":false,"error":"unknown op"}' ;;
  esac
done
"#;

        fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
            let path = dir.join(name);
            fs::write(&path, body).unwrap();
            path
        }

        #[test]
        fn test_activation_helper_session() {
            let dir = tempfile::tempdir().unwrap();
            let path = script(dir.path(), "activator.sh", ACTIVATOR);
            let service = HelperActivation::new("/bin/sh")
                .with_args([path.as_os_str(), OsStr::new("serve")]);

            let mut handle = service.create_handle().unwrap();
            let reply = handle.activate("LIC", "").unwrap();
            assert!(reply.is_success());
            assert_eq!(reply.message, "activated");
            assert_eq!(handle.version().unwrap(), "5.0.1");
            assert_eq!(handle.machine_code().unwrap(), "ABCDEF0123456789");
            assert_eq!(handle.cursor_position().unwrap(), (12, 34));
            handle.release();
        }

        #[test]
        fn test_spoofer_helper_receives_identity_on_stdin() {
            let dir = tempfile::tempdir().unwrap();
            let log = dir.path().join("applied.json");
            let body = format!(
                "case \"$1\" in\n  apply) cat > '{}' ;;\nesac\nexit 0\n",
                log.display()
            );
            let path = script(dir.path(), "spoofer.sh", &body);
            let spoofer = HelperSpoofer::new("/bin/sh", None).with_args([path.as_os_str()]);

            let identity = Identity::generate();
            spoofer.init().unwrap();
            spoofer.apply_identity(&identity).unwrap();

            let applied: serde_json::Value =
                serde_json::from_str(&fs::read_to_string(&log).unwrap()).unwrap();
            assert_eq!(applied["step"], "identity");
            assert_eq!(applied["identity"]["serial_number"], identity.serial_number);
        }

        #[test]
        fn test_spoofer_failure_carries_stderr() {
            let dir = tempfile::tempdir().unwrap();
            let path = script(dir.path(), "broken.sh", "echo 'driver not loaded' >&2\nexit 3\n");
            let spoofer = HelperSpoofer::new("/bin/sh", Some(PathBuf::from("driver.sys")))
                .with_args([path.as_os_str()]);

            let err = spoofer.init().unwrap_err();
            assert_eq!(err.to_string(), "init failed: driver not loaded");
        }

        #[test]
        fn test_spoofer_that_ignores_stdin_is_still_waited_on() {
            let dir = tempfile::tempdir().unwrap();
            let path = script(dir.path(), "deaf.sh", "exit 4\n");
            let spoofer = HelperSpoofer::new("/bin/sh", None).with_args([path.as_os_str()]);

            // Larger than a pipe buffer, so the write hits a closed pipe.
            let input = vec![b'x'; 1 << 20];
            let err = spoofer
                .run("apply", &[OsStr::new("apply")], Some(&input))
                .unwrap_err();

            assert!(matches!(err, EngineError::Call { op: "apply", .. }), "{err:?}");
            assert!(err.to_string().contains("exit status: 4"), "{err}");
        }
    }
}
