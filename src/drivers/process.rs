//! External tool discovery and process helpers.
//!
//! Tool availability is detected once per process and passed explicitly into
//! the driver registry.

use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};

use once_cell::sync::OnceCell;
use tracing::{debug, info};

use crate::error::{Error, Result};

static SHARED_PROBE: OnceCell<ToolProbe> = OnceCell::new();

/// A MuPDF release number (major, minor).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct MuPdfVersion(pub u32, pub u32);

impl MuPdfVersion {
    /// `mutool -v` only exists from 1.7 on; older builds are assumed 1.6.
    pub const ASSUMED: MuPdfVersion = MuPdfVersion(1, 6);

    /// Parse the `mutool version X.Y[.Z]` banner.
    pub fn parse_banner(banner: &str) -> Option<Self> {
        let version = banner.trim().strip_prefix("mutool version ")?;
        let mut parts = version.split(|c: char| !c.is_ascii_digit());
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
        Some(Self(major, minor))
    }
}

/// Command lines for the MuPDF tools.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MuPdfTools {
    pub version: MuPdfVersion,
    /// `mutool` (page listing).
    pub mutool: PathBuf,
    /// Render command: `mutool draw`, or a standalone `mudraw`.
    pub draw: Vec<String>,
    /// Arguments that make the draw command print a trace instead of
    /// rendering.
    pub trace_args: Vec<String>,
}

impl MuPdfTools {
    /// Pick render and trace arguments for a MuPDF version.
    ///
    /// `mudraw` is only consulted for versions older than 1.8.
    pub fn for_version(
        version: MuPdfVersion,
        mutool: PathBuf,
        mudraw: Option<PathBuf>,
    ) -> Option<Self> {
        let mutool_str = mutool.to_string_lossy().into_owned();
        if version >= MuPdfVersion(1, 8) {
            return Some(Self {
                version,
                mutool,
                draw: vec![mutool_str, "draw".into()],
                trace_args: vec!["-F".into(), "trace".into()],
            });
        }
        let mudraw = mudraw?;
        let trace_args = if version >= MuPdfVersion(1, 7) {
            vec!["-F".into(), "trace".into()]
        } else {
            vec!["-x".into()]
        };
        Some(Self {
            version,
            mutool,
            draw: vec![mudraw.to_string_lossy().into_owned()],
            trace_args,
        })
    }
}

/// Result of probing the system for external archive tools.
#[derive(Debug, Clone, Default)]
pub struct ToolProbe {
    mupdf: Option<MuPdfTools>,
}

impl ToolProbe {
    /// No external tools.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn with_mupdf(tools: MuPdfTools) -> Self {
        Self { mupdf: Some(tools) }
    }

    /// Probe once per process and reuse the result.
    pub fn shared() -> &'static ToolProbe {
        SHARED_PROBE.get_or_init(ToolProbe::detect)
    }

    /// Look for the tools on `PATH`.
    pub fn detect() -> Self {
        let mupdf = detect_mupdf();
        match &mupdf {
            Some(tools) => {
                info!(version = ?tools.version, "Using MuPDF");
                debug!(mutool = ?tools.mutool, draw = ?tools.draw, trace = ?tools.trace_args, "MuPDF commands");
            }
            None => info!("MuPDF not available"),
        }
        Self { mupdf }
    }

    pub fn mupdf(&self) -> Option<&MuPdfTools> {
        self.mupdf.as_ref()
    }
}

fn detect_mupdf() -> Option<MuPdfTools> {
    let mutool = match which::which("mutool") {
        Ok(path) => path,
        Err(_) => {
            debug!("mutool executable not found");
            return None;
        }
    };

    // The version banner goes to stderr.
    let version = Command::new(&mutool)
        .arg("-v")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output()
        .ok()
        .and_then(|out| MuPdfVersion::parse_banner(&String::from_utf8_lossy(&out.stderr)))
        .unwrap_or(MuPdfVersion::ASSUMED);

    let mudraw = if version < MuPdfVersion(1, 8) {
        let found = which::which("mudraw").ok();
        if found.is_none() {
            debug!("mudraw executable not found");
        }
        found
    } else {
        None
    };

    MuPdfTools::for_version(version, mutool, mudraw)
}

/// Run `args[0]` with the remaining arguments and capture stdout.
///
/// A non-zero exit status is reported as [`Error::DriverProcess`].
pub fn run_captured(args: &[String], cwd: Option<&Path>) -> Result<Output> {
    let (program, rest) = args.split_first().ok_or_else(|| Error::DriverProcess {
        program: String::new(),
        reason: "empty command line".into(),
    })?;

    debug!(command = %args.join(" "), "Spawning external tool");
    let mut command = Command::new(program);
    command
        .args(rest)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(cwd) = cwd {
        command.current_dir(cwd);
    }

    let output = command.output().map_err(|e| Error::DriverProcess {
        program: program.clone(),
        reason: e.to_string(),
    })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::DriverProcess {
            program: program.clone(),
            reason: format!("{}: {}", output.status, stderr.trim()),
        });
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_banner() {
        assert_eq!(
            MuPdfVersion::parse_banner("mutool version 1.23.10\n"),
            Some(MuPdfVersion(1, 23))
        );
        assert_eq!(
            MuPdfVersion::parse_banner("mutool version 1.9a"),
            Some(MuPdfVersion(1, 9))
        );
        assert_eq!(MuPdfVersion::parse_banner("usage: mutool <command>"), None);
    }

    #[test]
    fn test_modern_mutool_draws_itself() {
        let tools =
            MuPdfTools::for_version(MuPdfVersion(1, 18), "/usr/bin/mutool".into(), None).unwrap();
        assert_eq!(tools.draw, vec!["/usr/bin/mutool", "draw"]);
        assert_eq!(tools.trace_args, vec!["-F", "trace"]);
    }

    #[test]
    fn test_old_mupdf_needs_mudraw() {
        assert!(MuPdfTools::for_version(MuPdfVersion(1, 6), "mutool".into(), None).is_none());

        let tools =
            MuPdfTools::for_version(MuPdfVersion(1, 6), "mutool".into(), Some("mudraw".into()))
                .unwrap();
        assert_eq!(tools.draw, vec!["mudraw"]);
        assert_eq!(tools.trace_args, vec!["-x"]);

        let tools =
            MuPdfTools::for_version(MuPdfVersion(1, 7), "mutool".into(), Some("mudraw".into()))
                .unwrap();
        assert_eq!(tools.trace_args, vec!["-F", "trace"]);
    }

    #[test]
    fn test_run_captured_empty_command() {
        assert!(matches!(
            run_captured(&[], None),
            Err(Error::DriverProcess { .. })
        ));
    }

    #[test]
    fn test_run_captured_missing_program() {
        let args = vec!["idxd-definitely-not-a-real-tool".to_string()];
        assert!(matches!(
            run_captured(&args, None),
            Err(Error::DriverProcess { .. })
        ));
    }
}
