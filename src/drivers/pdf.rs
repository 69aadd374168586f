//! PDF pages as archive members, rendered with MuPDF.
//!
//! Each page is listed as `N.png`. Rendering spawns one process per page, so
//! concurrent extraction is welcome.

use std::fs;
use std::io::{BufRead, BufReader};
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, warn};

use super::process::{run_captured, MuPdfTools};
use super::registry::{has_extension, DriverFactory};
use super::{partial_path, ArchiveDriver, ArchiveKind, ArchiveOptions};
use crate::error::{Error, Result};

/// Default DPI for rendering.
pub const RENDER_DPI_DEFAULT: u32 = 72 * 4;

/// Maximum DPI for rendering.
pub const RENDER_DPI_MAX: u32 = 72 * 10;

const PDF_MAGIC: &[u8] = b"%PDF";

static FILL_IMAGE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"^\s*<fill_image\b.*\bmatrix="(?P<matrix>[^"]+)".*\bwidth="(?P<width>\d+)".*\bheight="(?P<height>\d+)".*/>\s*$"#,
    )
    .expect("fill_image pattern is valid")
});

pub struct PdfFactory {
    tools: MuPdfTools,
}

impl PdfFactory {
    pub fn new(tools: MuPdfTools) -> Self {
        Self { tools }
    }
}

impl DriverFactory for PdfFactory {
    fn name(&self) -> &'static str {
        "pdf"
    }

    fn probe(&self, path: &Path, header: &[u8]) -> bool {
        header.starts_with(PDF_MAGIC) || (header.is_empty() && has_extension(path, &["pdf"]))
    }

    fn open(&self, path: &Path, _options: &ArchiveOptions) -> Result<Box<dyn ArchiveDriver>> {
        Ok(Box::new(PdfDriver {
            path: path.to_path_buf(),
            tools: self.tools.clone(),
        }))
    }
}

pub struct PdfDriver {
    path: PathBuf,
    tools: MuPdfTools,
}

impl PdfDriver {
    fn path_arg(&self) -> String {
        self.path.to_string_lossy().into_owned()
    }

    /// Find the DPI that renders the largest embedded image at its native
    /// resolution.
    fn optimal_dpi(&self, page: u32) -> Result<u32> {
        let mut args = self.tools.draw.clone();
        args.extend(self.tools.trace_args.iter().cloned());
        args.extend(["--".to_string(), self.path_arg(), page.to_string()]);
        let output = run_captured(&args, None)?;
        Ok(dpi_from_trace(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// Page member name for a page number.
pub fn page_name(page: u32) -> String {
    format!("{page}.png")
}

/// Page number encoded in a member name.
pub fn page_number(name: &str) -> Option<u32> {
    name.strip_suffix(".png")?.parse().ok()
}

/// Parse one line of `mutool show FILE pages`.
pub fn parse_page_line(line: &str) -> Option<u32> {
    let rest = line.strip_prefix("page ")?;
    rest.split_whitespace().next()?.parse().ok()
}

/// Pick a render DPI from a MuPDF trace.
pub fn dpi_from_trace(trace: &str) -> u32 {
    let mut max_size = 0u32;
    let mut max_dpi = RENDER_DPI_DEFAULT;

    for caps in trace.lines().filter_map(|line| FILL_IMAGE.captures(line)) {
        let matrix: Vec<f64> = caps["matrix"]
            .split_whitespace()
            .filter_map(|v| v.parse().ok())
            .collect();
        if matrix.len() < 4 {
            continue;
        }
        let (Ok(width), Ok(height)) = (caps["width"].parse::<u32>(), caps["height"].parse::<u32>())
        else {
            continue;
        };

        for (size, a, b) in [(width, matrix[0], matrix[1]), (height, matrix[2], matrix[3])] {
            if size < max_size {
                continue;
            }
            let render_size = (a * a + b * b).sqrt();
            if render_size <= f64::EPSILON {
                continue;
            }
            let dpi = (f64::from(size) * 72.0 / render_size) as u32;
            max_size = size;
            max_dpi = dpi.min(RENDER_DPI_MAX);
        }
    }
    max_dpi
}

impl ArchiveDriver for PdfDriver {
    fn kind(&self) -> ArchiveKind {
        ArchiveKind::Pdf
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn is_solid(&self) -> bool {
        false
    }

    fn supports_concurrent_extraction(&self) -> bool {
        true
    }

    fn list(&mut self, visit: &mut dyn FnMut(String) -> ControlFlow<()>) -> Result<()> {
        let mutool = self.tools.mutool.to_string_lossy().into_owned();
        let mut child = Command::new(&self.tools.mutool)
            .args(["show", "--"])
            .arg(&self.path)
            .arg("pages")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| Error::DriverProcess {
                program: mutool.clone(),
                reason: e.to_string(),
            })?;

        let mut interrupted = false;
        if let Some(stdout) = child.stdout.take() {
            for line in BufReader::new(stdout).lines() {
                let line = line?;
                let Some(page) = parse_page_line(&line) else {
                    continue;
                };
                if visit(page_name(page)).is_break() {
                    interrupted = true;
                    break;
                }
            }
        }

        if interrupted {
            let _ = child.kill();
        }
        let status = child.wait()?;
        if !interrupted && !status.success() {
            return Err(Error::DriverProcess {
                program: mutool,
                reason: status.to_string(),
            });
        }
        Ok(())
    }

    fn extract_one(&mut self, name: &str, destination: &Path) -> Result<()> {
        let page = page_number(name).ok_or_else(|| Error::UnknownMember(name.to_owned()))?;
        let dpi = self.optimal_dpi(page).unwrap_or_else(|e| {
            warn!(name, error = %e, "Failed to trace page, using default DPI");
            RENDER_DPI_DEFAULT
        });
        debug!(name, dpi, "Rendering PDF page");

        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::entry(name, e))?;
        }
        let partial = partial_path(destination);
        let mut args = self.tools.draw.clone();
        args.extend([
            "-r".to_string(),
            dpi.to_string(),
            "-o".to_string(),
            partial.to_string_lossy().into_owned(),
            "--".to_string(),
            self.path_arg(),
            page.to_string(),
        ]);
        let rendered = run_captured(&args, None)
            .and_then(|_| fs::rename(&partial, destination).map_err(|e| Error::entry(name, e)));
        if rendered.is_err() {
            let _ = fs::remove_file(&partial);
        }
        rendered
    }

    fn reopen(&self) -> Result<Box<dyn ArchiveDriver>> {
        Ok(Box::new(PdfDriver {
            path: self.path.clone(),
            tools: self.tools.clone(),
        }))
    }
}
