use std::borrow::Cow;
use std::fs;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

pub mod error;
pub mod gcode;
pub mod header;
pub mod mesh;
pub mod modulate;
pub mod policy;
pub mod state;

pub use error::{Error, Result};
pub use gcode::{Classifier, LineKind, MotionRecord, ToolPathLine};
pub use header::HeaderInfo;
pub use mesh::{Mesh, MeshError, SurfaceSampler};
pub use modulate::{split_move, Segment, SplitMove};
pub use policy::{ConfigError, InclusionPolicy};
pub use state::{Disposition, MoveRequest, PrinterState};

use gcode::Positioning;
use modulate::fmt_num;

// This way we can switch between f32 and f64 easily. f64 because extrusion has to add back up
// exactly after a split, and endpoints have to come back out exactly as they went in.
pub use f64 as Mm;
pub use u32 as TriangleIndex;

#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct Point {
    pub x: Mm,
    pub y: Mm,
    pub z: Mm,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RewriteStats {
    pub line_count: u64,
    pub motion_count: u64,
    pub modulated_moves: u64,
    pub segments: u64,
    // sample points off the model, left at the nominal Z
    pub sample_misses: u64,
    pub clamped_samples: u64,
    pub z_restores: u64,
    // not valid UTF-8; tracked, written back untouched
    pub lossy_lines: u64,
}

/// Rewrites one line at a time, in order. Owns the only mutable state of a run.
pub struct Rewriter<'r, S: SurfaceSampler + ?Sized> {
    sampler: &'r S,
    policy: &'r InclusionPolicy,
    classifier: Classifier,
    state: PrinterState,
    // True while the nozzle is parked at a modulated Z instead of the Z the gcode thinks it's at.
    displaced: bool,
    stats: RewriteStats,
}

impl<'r, S: SurfaceSampler + ?Sized> Rewriter<'r, S> {
    pub fn new(sampler: &'r S, policy: &'r InclusionPolicy) -> Result<Self> {
        policy.validate()?;
        Ok(Rewriter {
            sampler,
            policy,
            classifier: Classifier::new(),
            state: PrinterState::default(),
            displaced: false,
            stats: RewriteStats::default(),
        })
    }

    pub fn state(&self) -> &PrinterState {
        &self.state
    }

    /// Takes one raw line, with its terminator if it has one. Passed-through lines are written
    /// back byte for byte; generated lines reuse the input's terminator.
    pub fn process_line<W: Write>(&mut self, raw: &[u8], out: &mut W) -> io::Result<()> {
        self.stats.line_count += 1;
        let (body, eol) = split_eol(raw);
        let newline: &[u8] = if eol.is_empty() { b"\n" } else { eol };
        // Bytes that aren't UTF-8 (usually a Latin-1 comment) still get tracked, but a line we can
        // only read lossily is never replaced.
        let text = String::from_utf8_lossy(body);
        let lossless = matches!(text, Cow::Borrowed(_));
        if !lossless {
            self.stats.lossy_lines += 1;
        }
        let classified = self.classifier.classify(&text);
        let z_before = self.state.loc.z;
        let positioning_before = self.state.positioning;

        match self.state.observe(&classified, self.policy) {
            Disposition::Modulate(request) if lossless => {
                self.stats.motion_count += 1;
                let split = split_move(&request, self.sampler, self.policy);
                self.stats.modulated_moves += 1;
                self.stats.segments += split.segments.len() as u64;
                self.stats.sample_misses += split.misses as u64;
                self.stats.clamped_samples += split.clamped as u64;
                for new_line in split.to_gcode_lines() {
                    out.write_all(new_line.as_bytes())?;
                    out.write_all(newline)?;
                }
                self.displaced = split.segments.last().is_some_and(|segment| segment.z != split.nominal_z);
            }
            _ => {
                match &classified.kind {
                    LineKind::Motion(record) | LineKind::Arc(record) => {
                        self.stats.motion_count += 1;
                        if self.displaced {
                            let absolute_z = record.z.is_some() && positioning_before == Positioning::Absolute;
                            let moves_off_displaced_z = (record.has_xy() && record.z.is_none()) || (record.z.is_some() && !absolute_z);
                            if absolute_z {
                                self.displaced = false;
                            } else if moves_off_displaced_z && self.policy.restore_z {
                                write!(out, "G1 Z{}", fmt_num(z_before))?;
                                out.write_all(newline)?;
                                self.stats.z_restores += 1;
                                self.displaced = false;
                            }
                        }
                    }
                    LineKind::SetPosition(record) if record.z.is_some() => self.displaced = false,
                    _ => {}
                }
                out.write_all(raw)?;
            }
        }
        Ok(())
    }

    pub fn finish(self) -> RewriteStats {
        self.stats
    }
}

// "\n" and "\r\n" terminators both stay with the line.
fn split_eol(raw: &[u8]) -> (&[u8], &[u8]) {
    let body_len = match raw.strip_suffix(b"\n") {
        Some(rest) => rest.strip_suffix(b"\r").unwrap_or(rest).len(),
        None => raw.len(),
    };
    raw.split_at(body_len)
}

/// Runs a whole G-code stream through a [`Rewriter`]. On error some output may already have been
/// written to `out`; callers that care buffer it (see [`process_files`]).
pub fn rewrite<R, S, W>(mut reader: R, sampler: &S, policy: &InclusionPolicy, out: &mut W) -> Result<RewriteStats>
where
    R: BufRead,
    S: SurfaceSampler + ?Sized,
    W: Write,
{
    let mut rewriter = Rewriter::new(sampler, policy)?;
    let mut line = Vec::new();
    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line)? == 0 {
            break;
        }
        rewriter.process_line(&line, out)?;
    }
    Ok(rewriter.finish())
}

/// Rewrites a complete in-memory G-code file, e.g. everything read from stdin. Nothing is returned
/// unless the whole input was rewritten.
pub fn rewrite_bytes<S: SurfaceSampler + ?Sized>(input: &[u8], sampler: &S, policy: &InclusionPolicy) -> Result<(Vec<u8>, RewriteStats)> {
    if header::looks_binary(input) {
        return Err(Error::UnsupportedFormat(PathBuf::from("<stdin>")));
    }
    let mut output = Vec::with_capacity(input.len() + input.len() / 4);
    let stats = rewrite(input, sampler, policy, &mut output)?;
    Ok((output, stats))
}

/// Refuses binary G-code up front, so nothing downstream ever sees it.
pub fn open_gcode(path: &Path) -> Result<io::BufReader<fs::File>> {
    if header::is_binary_gcode(path)? {
        return Err(Error::UnsupportedFormat(path.to_owned()));
    }
    Ok(io::BufReader::with_capacity(64 * 1024, fs::File::open(path)?))
}

/// Lines of a text G-code file for scanning, decoded lossily so a stray non-UTF-8 byte can't stop
/// the scan.
pub fn file_lines(path: &Path) -> Result<impl Iterator<Item = io::Result<String>>> {
    let reader = open_gcode(path)?;
    Ok(reader.split(b'\n').map(|line| line.map(|bytes| String::from_utf8_lossy(&bytes).into_owned())))
}

pub fn load_mesh(stl_path: &Path) -> Result<Mesh> {
    if !stl_path.is_file() {
        return Err(Error::MissingGeometry(stl_path.to_owned()));
    }
    log::info!("reading mesh {}...", stl_path.display());
    let before_read_mesh = Instant::now();
    let mesh = Mesh::from_stl_path(stl_path)?;
    log::info!(
        "done reading mesh - triangles: {} degenerate: {} elapsed: {:.2?}",
        mesh.triangle_count(),
        mesh.degenerate_count(),
        before_read_mesh.elapsed()
    );
    Ok(mesh)
}

// output_path can be the same as input_path, so we don't touch output_path until we're sure we
// have complete output
pub fn process_files(input_path: &Path, output_path: &Path, mesh: &Mesh, policy: &InclusionPolicy) -> Result<RewriteStats> {
    let reader = open_gcode(input_path)?;
    let mut tmp_name = output_path.file_name().map(|name| name.to_os_string()).unwrap_or_default();
    tmp_name.push(".tmp");
    let tmp_output_path = output_path.with_file_name(tmp_name);

    let before_generate_output = Instant::now();
    let result = write_output(reader, &tmp_output_path, mesh, policy);
    let stats = match result {
        Ok(stats) => stats,
        Err(e) => {
            // best effort; the original error is the one worth reporting
            let _ = fs::remove_file(&tmp_output_path);
            return Err(e);
        }
    };
    fs::rename(&tmp_output_path, output_path)?;
    log::info!("done generating output - elapsed: {:.2?}", before_generate_output.elapsed());
    log_stats(&stats);
    Ok(stats)
}

fn write_output<R: BufRead>(reader: R, tmp_output_path: &Path, mesh: &Mesh, policy: &InclusionPolicy) -> Result<RewriteStats> {
    let mut buf_writer = io::BufWriter::with_capacity(8 * 1024, fs::File::create(tmp_output_path)?);
    let stats = rewrite(reader, mesh, policy, &mut buf_writer)?;
    buf_writer.flush()?;
    Ok(stats)
}

pub fn log_stats(stats: &RewriteStats) {
    log::info!("line_count: {} motion_count: {} lossy_lines: {}", stats.line_count, stats.motion_count, stats.lossy_lines);
    log::info!(
        "modulated_moves: {} segments: {} sample_misses: {} clamped_samples: {} z_restores: {}",
        stats.modulated_moves,
        stats.segments,
        stats.sample_misses,
        stats.clamped_samples,
        stats.z_restores
    );
}
