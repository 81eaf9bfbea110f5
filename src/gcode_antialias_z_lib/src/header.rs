//! One-pass scans over a whole G-code file, run before the rewrite itself: is it even text, what
//! nozzle and layer height was it sliced for, and which model does it print.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use ordered_float::OrderedFloat;
use regex::Regex;

use crate::Mm;

const BINARY_SNIFF_LEN: usize = 1024;
// Prusa binary G-code magic.
const BGCODE_MAGIC: &[u8] = b"GCDE";

/// Binary G-code starts with a magic number, and text G-code never has NUL bytes.
pub fn looks_binary(head: &[u8]) -> bool {
    let head = &head[..head.len().min(BINARY_SNIFF_LEN)];
    head.starts_with(BGCODE_MAGIC) || head.contains(&0)
}

pub fn is_binary_gcode(path: &Path) -> io::Result<bool> {
    let is_bgcode = path.extension().and_then(|ext| ext.to_str()).is_some_and(|ext| ext.eq_ignore_ascii_case("bgcode"));
    if is_bgcode {
        return Ok(true);
    }
    let mut head = Vec::with_capacity(BINARY_SNIFF_LEN);
    fs::File::open(path)?.take(BINARY_SNIFF_LEN as u64).read_to_end(&mut head)?;
    Ok(looks_binary(&head))
}

/// What the slicer wrote about itself.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct HeaderInfo {
    /// First value of `; nozzle_diameter = ...`.
    pub nozzle_diameter: Option<Mm>,
    /// First `M486 A<name>` object label.
    pub model_filename: Option<String>,
    /// Most common `;HEIGHT:` value, or most common `;Z:` step if there are none.
    pub layer_height: Option<Mm>,
}

impl HeaderInfo {
    pub fn scan_lines<I, S>(lines: I) -> io::Result<HeaderInfo>
    where
        I: IntoIterator<Item = io::Result<S>>,
        S: AsRef<str>,
    {
        let nozzle = Regex::new(r"^;\s*nozzle_diameter\s*=\s*(?<value>[-0-9.]+)").expect("static regex");
        let m486 = Regex::new(r"^M486\s+A(?<name>[^;]*?)\s*(?:;.*)?$").expect("static regex");
        let height = Regex::new(r"^;HEIGHT:\s*(?<value>[-0-9.]+)\s*$").expect("static regex");
        let layer_z = Regex::new(r"^;Z:\s*(?<value>[-0-9.]+)\s*$").expect("static regex");

        let mut info = HeaderInfo::default();
        let mut heights: BTreeMap<OrderedFloat<Mm>, usize> = BTreeMap::new();
        let mut z_steps: BTreeMap<OrderedFloat<Mm>, usize> = BTreeMap::new();
        let mut last_z: Option<Mm> = None;

        for line in lines {
            let line = line?;
            let line = line.as_ref().trim();
            if info.nozzle_diameter.is_none() {
                if let Some(captures) = nozzle.captures(line) {
                    info.nozzle_diameter = captures["value"].parse().ok().filter(|d: &Mm| *d > 0.0);
                    continue;
                }
            }
            if info.model_filename.is_none() {
                if let Some(captures) = m486.captures(line) {
                    let name = captures["name"].trim();
                    if !name.is_empty() {
                        info.model_filename = Some(name.to_string());
                    }
                    continue;
                }
            }
            if let Some(value) = height.captures(line).and_then(|c| c["value"].parse::<Mm>().ok()) {
                if value > 0.0 {
                    *heights.entry(OrderedFloat(value)).or_default() += 1;
                }
                continue;
            }
            if let Some(z) = layer_z.captures(line).and_then(|c| c["value"].parse::<Mm>().ok()) {
                if let Some(prev) = last_z {
                    // round off float noise from subtracting decimal strings
                    let step = (z - prev) * 1e6;
                    if step > 0.0 {
                        *z_steps.entry(OrderedFloat(step.round() / 1e6)).or_default() += 1;
                    }
                }
                last_z = Some(z);
            }
        }

        info.layer_height = most_common(&heights).or_else(|| most_common(&z_steps));
        Ok(info)
    }
}

// Ties go to the smaller value.
fn most_common(counts: &BTreeMap<OrderedFloat<Mm>, usize>) -> Option<Mm> {
    let mut best: Option<(Mm, usize)> = None;
    for (value, &count) in counts {
        if best.map_or(true, |(_, best_count)| count > best_count) {
            best = Some((value.into_inner(), count));
        }
    }
    best.map(|(value, _)| value)
}

/// Where to look for the model a G-code file was sliced from: an `M486` object label next to the
/// G-code, then the G-code's own name with an `.stl` extension. The first candidate that exists
/// wins; if none do, the last one is returned so the caller can report it.
pub fn locate_stl(gcode_path: &Path, model_filename: Option<&str>) -> PathBuf {
    let dir = gcode_path.parent().unwrap_or_else(|| Path::new(""));
    let mut candidates: Vec<PathBuf> = vec![];
    if let Some(name) = model_filename {
        candidates.push(dir.join(name));
        if Path::new(name).extension().is_none() {
            candidates.push(dir.join(name).with_extension("stl"));
        }
    }
    candidates.push(gcode_path.with_extension("stl"));
    let fallback = candidates.last().cloned().unwrap_or_else(|| gcode_path.with_extension("stl"));
    candidates.into_iter().find(|candidate| candidate.is_file()).unwrap_or(fallback)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan(lines: &[&str]) -> HeaderInfo {
        HeaderInfo::scan_lines(lines.iter().map(|l| Ok::<_, io::Error>(*l))).unwrap()
    }

    #[test]
    fn model_filename_from_m486() {
        let info = scan(&["G90", "M486 Amidedgehinge-s-a0.stl", "; other"]);
        assert_eq!(info.model_filename.as_deref(), Some("midedgehinge-s-a0.stl"));
    }

    #[test]
    fn m486_without_label_is_ignored() {
        let info = scan(&["M486 T2", "M486 S0", "M486 Apart.stl ; label"]);
        assert_eq!(info.model_filename.as_deref(), Some("part.stl"));
    }

    #[test]
    fn layer_height_prefers_height_comments() {
        let info = scan(&[
            ";LAYER_CHANGE", ";Z:0.2", ";HEIGHT:0.2",
            ";LAYER_CHANGE", ";Z:0.45", ";HEIGHT:0.25",
            ";LAYER_CHANGE", ";Z:0.7", ";HEIGHT:0.25",
        ]);
        assert_eq!(info.layer_height, Some(0.25));
    }

    #[test]
    fn layer_height_from_z_steps() {
        let info = scan(&[";Z:0.3", ";Z:0.5", ";Z:0.7", ";Z:0.9", ";Z:1.2"]);
        assert_eq!(info.layer_height, Some(0.2));
    }

    #[test]
    fn nozzle_diameter() {
        let info = scan(&["G1 X0", "; nozzle_diameter = 0.6,0.4", "; nozzle_diameter = 0.25"]);
        assert_eq!(info.nozzle_diameter, Some(0.6));
        assert_eq!(scan(&["; nothing here"]), HeaderInfo::default());
    }

    #[test]
    fn binary_sniffing() {
        assert!(looks_binary(b"GCDE\x01\x00\x00\x00"));
        assert!(looks_binary(b"\x00\x01\x02"));
        assert!(!looks_binary(b"; generated by PrusaSlicer\nG90\nM83\n"));
        assert!(!looks_binary(b""));
    }

    #[test]
    fn bgcode_extension_is_binary() {
        let path = std::env::temp_dir().join(format!("antialias_header_{}.bgcode", std::process::id()));
        fs::write(&path, b"\x00\x01\x02").unwrap();
        assert!(is_binary_gcode(&path).unwrap());
        fs::remove_file(&path).unwrap();

        let path = path.with_extension("gcode");
        fs::write(&path, b"G90\nM83\n").unwrap();
        assert!(!is_binary_gcode(&path).unwrap());
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn stl_next_to_gcode() {
        let dir = std::env::temp_dir().join(format!("antialias_locate_{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let gcode = dir.join("part_0.2mm.gcode");
        assert_eq!(locate_stl(&gcode, None), dir.join("part_0.2mm.stl"));

        fs::write(dir.join("hinge.stl"), b"solid x\nendsolid\n").unwrap();
        assert_eq!(locate_stl(&gcode, Some("hinge.stl")), dir.join("hinge.stl"));
        assert_eq!(locate_stl(&gcode, Some("hinge")), dir.join("hinge.stl"));
        assert_eq!(locate_stl(&gcode, Some("missing.stl")), dir.join("part_0.2mm.stl"));
        fs::remove_dir_all(&dir).unwrap();
    }
}
