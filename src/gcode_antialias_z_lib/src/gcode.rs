//! Classification of single G-code lines.
//!
//! Every line becomes exactly one [`ToolPathLine`], which keeps the original text so lines that
//! don't get modulated can be written back out untouched.

use regex::Regex;

use crate::Mm;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Positioning {
    Absolute,
    Relative,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtrusionMode {
    Absolute,
    Relative,
}

/// The X/Y/Z/E/F words of a G0/G1/G92 line. Absent words mean "unchanged".
#[derive(Debug, Default, Clone, PartialEq)]
pub struct MotionRecord<'a> {
    pub x: Option<Mm>,
    pub y: Option<Mm>,
    pub z: Option<Mm>,
    pub e: Option<Mm>,
    pub f: Option<Mm>,
    // ;onwards, including the ;
    pub comment: Option<&'a str>,
}

impl MotionRecord<'_> {
    pub fn has_xy(&self) -> bool {
        self.x.is_some() || self.y.is_some()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LineKind<'a> {
    /// G0 / G1
    Motion(MotionRecord<'a>),
    /// G2 / G3. Only where it ends up matters to us; I/J/R are ignored.
    Arc(MotionRecord<'a>),
    /// G92
    SetPosition(MotionRecord<'a>),
    /// G28 / G29 / G30 - the head goes somewhere the file doesn't say
    Homing,
    /// `;Z:` - nominal Z of the layer that starts here
    LayerZ(Mm),
    /// `;HEIGHT:` - thickness of the current layer
    LayerHeight(Mm),
    /// `;TYPE:`
    RegionType(&'a str),
    /// G90 / G91
    Positioning(Positioning),
    /// M82 / M83
    ExtrusionMode(ExtrusionMode),
    Other,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolPathLine<'a> {
    pub raw: &'a str,
    pub kind: LineKind<'a>,
}

pub struct Classifier {
    motion: Regex,
    arc: Regex,
    set_position: Regex,
    homing: Regex,
    word: Regex,
    positioning: Regex,
    extrusion_mode: Regex,
    layer_z: Regex,
    layer_height: Regex,
    region_type: Regex,
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Classifier {
    pub fn new() -> Classifier {
        let re = |pattern: &str| Regex::new(pattern).expect("static regex");
        Classifier {
            // strip off the G0/G1 and the comment
            motion: re(r"^G0*[01](?<words>[ \t][^;]*)?(?<comment>;.*)?$"),
            arc: re(r"^G0*[23](?<words>[ \t][^;]*)?(?<comment>;.*)?$"),
            set_position: re(r"^G92(?<words>[ \t][^;]*)?(?<comment>;.*)?$"),
            homing: re(r"^G(?:28|29|30)(?:[^0-9].*)?$"),
            word: re(r"(?<letter>[A-Za-z])(?<value>[^A-Za-z \t]*)"),
            positioning: re(r"^G9(?<mode>[01])(?:[^0-9a-zA-Z].*)?$"),
            extrusion_mode: re(r"^M8(?<mode>[23])(?:[^0-9a-zA-Z].*)?$"),
            layer_z: re(r"^;Z:(?<value>.*)$"),
            layer_height: re(r"^;HEIGHT:(?<value>.*)$"),
            region_type: re(r"^;TYPE:(?<label>.*)$"),
        }
    }

    pub fn classify<'a>(&self, raw: &'a str) -> ToolPathLine<'a> {
        ToolPathLine { raw, kind: self.kind_of(raw.trim()) }
    }

    fn kind_of<'a>(&self, line: &'a str) -> LineKind<'a> {
        if line.starts_with(';') {
            return self.marker_kind(line);
        }
        if let Some(captures) = self.motion.captures(line) {
            let words = captures.name("words").map_or("", |m| m.as_str());
            let comment = captures.name("comment").map(|m| m.as_str());
            // A motion line we can't fully read is left alone rather than half-understood.
            return match self.parse_words(words, comment, false) {
                Some(record) => LineKind::Motion(record),
                None => LineKind::Other,
            };
        }
        if let Some(captures) = self.arc.captures(line) {
            let words = captures.name("words").map_or("", |m| m.as_str());
            let comment = captures.name("comment").map(|m| m.as_str());
            return match self.parse_words(words, comment, false) {
                Some(record) => LineKind::Arc(record),
                None => LineKind::Other,
            };
        }
        if self.homing.is_match(line) {
            return LineKind::Homing;
        }
        if let Some(captures) = self.set_position.captures(line) {
            let words = captures.name("words").map_or("", |m| m.as_str());
            let comment = captures.name("comment").map(|m| m.as_str());
            return match self.parse_words(words, comment, true) {
                Some(record) => LineKind::SetPosition(record),
                None => LineKind::Other,
            };
        }
        if let Some(captures) = self.positioning.captures(line) {
            return LineKind::Positioning(match &captures["mode"] {
                "0" => Positioning::Absolute,
                _ => Positioning::Relative,
            });
        }
        if let Some(captures) = self.extrusion_mode.captures(line) {
            return LineKind::ExtrusionMode(match &captures["mode"] {
                "2" => ExtrusionMode::Absolute,
                _ => ExtrusionMode::Relative,
            });
        }
        LineKind::Other
    }

    fn marker_kind<'a>(&self, line: &'a str) -> LineKind<'a> {
        if let Some(captures) = self.layer_z.captures(line) {
            return parse_mm(captures["value"].trim()).map_or(LineKind::Other, LineKind::LayerZ);
        }
        if let Some(captures) = self.layer_height.captures(line) {
            return parse_mm(captures["value"].trim()).map_or(LineKind::Other, LineKind::LayerHeight);
        }
        if let Some(label) = self.region_type.captures(line).and_then(|c| c.name("label")) {
            return LineKind::RegionType(label.as_str().trim_end());
        }
        LineKind::Other
    }

    // G92 allows a bare axis letter, meaning zero.
    fn parse_words<'a>(&self, words: &str, comment: Option<&'a str>, bare_is_zero: bool) -> Option<MotionRecord<'a>> {
        let mut record = MotionRecord { comment, ..Default::default() };
        for captures in self.word.captures_iter(words) {
            let slot = match &captures["letter"] {
                "X" => &mut record.x,
                "Y" => &mut record.y,
                "Z" => &mut record.z,
                "E" => &mut record.e,
                "F" => &mut record.f,
                _ => continue,
            };
            let value = &captures["value"];
            *slot = if value.is_empty() && bare_is_zero { Some(0.0) } else { Some(parse_mm(value)?) };
        }
        Some(record)
    }
}

fn parse_mm(s: &str) -> Option<Mm> {
    s.parse::<Mm>().ok().filter(|v| v.is_finite())
}
