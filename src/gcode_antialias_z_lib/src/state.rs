use crate::gcode::{ExtrusionMode, LineKind, MotionRecord, Positioning, ToolPathLine};
use crate::policy::InclusionPolicy;
use crate::{Mm, Point};

/// Everything about the printer that later lines depend on. Only ever advanced in line order, by
/// [`PrinterState::observe`].
#[derive(Debug, Clone, PartialEq)]
pub struct PrinterState {
    // initially assumed 0,0,0 (ignoring homing which is assumed)
    pub loc: Point,
    // False after homing or probing, until an absolute X and Y say where the head is again.
    pub position_known: bool,
    // Where the extruder is in absolute terms. In relative mode this is the running sum.
    pub e: Mm,
    pub positioning: Positioning,
    pub extrusion_mode: ExtrusionMode,
    // from the most recent ;Z: marker
    pub layer_z: Option<Mm>,
    // from the most recent ;HEIGHT: marker in the current layer
    pub layer_height: Option<Mm>,
    // from the most recent ;TYPE: marker
    pub region: Option<String>,
    pub layers_seen: u32,
}

impl Default for PrinterState {
    fn default() -> Self {
        // Same power-on defaults as Marlin.
        PrinterState {
            loc: Point::default(),
            position_known: true,
            e: 0.0,
            positioning: Positioning::Absolute,
            extrusion_mode: ExtrusionMode::Absolute,
            layer_z: None,
            layer_height: None,
            region: None,
            layers_seen: 0,
        }
    }
}

/// A planar extruding move that passed every inclusion check, with what the segmenter needs to
/// know about it.
#[derive(Debug, Clone, PartialEq)]
pub struct MoveRequest<'a> {
    pub from: Point,
    pub to: Point,
    /// Extrusion for the whole move, > 0.
    pub delta_e: Mm,
    /// Accumulator before and after the move.
    pub start_e: Mm,
    pub end_e: Mm,
    pub extrusion_mode: ExtrusionMode,
    /// The flat Z the layer was sliced at.
    pub nominal_z: Mm,
    /// Layer thickness if the slicer said so.
    pub layer_height: Option<Mm>,
    pub f: Option<Mm>,
    pub comment: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Disposition<'a> {
    /// Write the line back out as-is.
    PassThrough,
    /// Replace the line with a split, Z-modulated version of this move.
    Modulate(MoveRequest<'a>),
}

impl PrinterState {
    /// Before the second layer marker everything belongs to the first layer.
    pub fn is_first_layer(&self) -> bool {
        self.layers_seen < 2
    }

    /// Applies one line to the state, and says whether the line is a move to modulate. The state
    /// ends up the same either way; a split move lands exactly where the original would have.
    pub fn observe<'a>(&mut self, line: &ToolPathLine<'a>, policy: &InclusionPolicy) -> Disposition<'a> {
        match &line.kind {
            LineKind::LayerZ(z) => {
                self.layer_z = Some(*z);
                self.layer_height = None;
                self.layers_seen += 1;
            }
            LineKind::LayerHeight(h) => self.layer_height = Some(*h),
            LineKind::RegionType(label) => self.region = Some(label.to_string()),
            LineKind::Positioning(mode) => {
                // G90/G91 switch E along with XYZ, overriding any earlier M82/M83.
                self.positioning = *mode;
                self.extrusion_mode = match mode {
                    Positioning::Absolute => ExtrusionMode::Absolute,
                    Positioning::Relative => ExtrusionMode::Relative,
                };
            }
            LineKind::ExtrusionMode(mode) => self.extrusion_mode = *mode,
            LineKind::SetPosition(record) => {
                self.loc.x = record.x.unwrap_or(self.loc.x);
                self.loc.y = record.y.unwrap_or(self.loc.y);
                self.loc.z = record.z.unwrap_or(self.loc.z);
                self.e = record.e.unwrap_or(self.e);
                if record.x.is_some() && record.y.is_some() {
                    self.position_known = true;
                }
            }
            // Arcs move the head (and extrude) like any other move, they just never get split.
            LineKind::Arc(record) => self.apply_motion(record),
            LineKind::Homing => self.position_known = false,
            LineKind::Motion(record) => {
                let request = self.qualify(record, policy);
                self.apply_motion(record);
                if let Some(request) = request {
                    return Disposition::Modulate(request);
                }
            }
            LineKind::Other => {}
        }
        Disposition::PassThrough
    }

    fn target_of(&self, record: &MotionRecord) -> Point {
        match self.positioning {
            Positioning::Absolute => Point {
                x: record.x.unwrap_or(self.loc.x),
                y: record.y.unwrap_or(self.loc.y),
                z: record.z.unwrap_or(self.loc.z),
            },
            Positioning::Relative => Point {
                x: self.loc.x + record.x.unwrap_or(0.0),
                y: self.loc.y + record.y.unwrap_or(0.0),
                z: self.loc.z + record.z.unwrap_or(0.0),
            },
        }
    }

    fn delta_e_of(&self, record: &MotionRecord) -> Mm {
        match (record.e, self.extrusion_mode) {
            (None, _) => 0.0,
            (Some(e), ExtrusionMode::Absolute) => e - self.e,
            (Some(e), ExtrusionMode::Relative) => e,
        }
    }

    fn apply_motion(&mut self, record: &MotionRecord) {
        self.e = match (record.e, self.extrusion_mode) {
            (None, _) => self.e,
            // the written total as-is, no accumulated float error
            (Some(e), ExtrusionMode::Absolute) => e,
            (Some(e), ExtrusionMode::Relative) => self.e + e,
        };
        self.loc = self.target_of(record);
        if self.positioning == Positioning::Absolute && record.x.is_some() && record.y.is_some() {
            self.position_known = true;
        }
    }

    fn qualify<'a>(&self, record: &MotionRecord<'a>, policy: &InclusionPolicy) -> Option<MoveRequest<'a>> {
        // Pure Z moves, retracts and feed-rate changes aren't candidates, nor is anything we'd have
        // to reinterpret (relative XYZ, or a move that already picks its own Z).
        if !record.has_xy() || record.z.is_some() || self.positioning != Positioning::Absolute || !self.position_known {
            return None;
        }
        let delta_e = self.delta_e_of(record);
        if !(delta_e > 0.0) {
            return None;
        }
        let to = self.target_of(record);
        if to.x == self.loc.x && to.y == self.loc.y {
            return None;
        }
        if !self.region.as_deref().is_some_and(|region| policy.is_eligible(region)) {
            return None;
        }
        if self.is_first_layer() && !policy.modulate_first_layer {
            return None;
        }
        let nominal_z = self.layer_z.unwrap_or(self.loc.z);
        if !(nominal_z > 0.0) {
            return None;
        }
        let end_e = match (record.e, self.extrusion_mode) {
            (Some(e), ExtrusionMode::Absolute) => e,
            _ => self.e + delta_e,
        };
        Some(MoveRequest {
            from: self.loc,
            to,
            delta_e,
            start_e: self.e,
            end_e,
            extrusion_mode: self.extrusion_mode,
            nominal_z,
            layer_height: self.layer_height,
            f: record.f,
            comment: record.comment,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gcode::Classifier;

    fn feed(state: &mut PrinterState, policy: &InclusionPolicy, lines: &[&str]) -> Vec<bool> {
        let classifier = Classifier::new();
        lines
            .iter()
            .map(|line| matches!(state.observe(&classifier.classify(line), policy), Disposition::Modulate(_)))
            .collect()
    }

    fn policy_with_first_layer() -> InclusionPolicy {
        InclusionPolicy { modulate_first_layer: true, ..Default::default() }
    }

    const PREAMBLE: &[&str] = &[";LAYER_CHANGE", ";Z:0.45", ";HEIGHT:0.25", "G90", "M83", ";TYPE:External perimeter", "G1 X0 Y0 Z0.45 F1200"];

    #[test]
    fn tracks_layer_and_region() {
        let mut state = PrinterState::default();
        feed(&mut state, &policy_with_first_layer(), PREAMBLE);
        assert_eq!(state.layer_z, Some(0.45));
        assert_eq!(state.layer_height, Some(0.25));
        assert_eq!(state.region.as_deref(), Some("External perimeter"));
        assert_eq!(state.extrusion_mode, ExtrusionMode::Relative);
        assert_eq!(state.loc, Point { x: 0.0, y: 0.0, z: 0.45 });
        assert!(state.is_first_layer());
    }

    #[test]
    fn qualifies_extruding_xy_move() {
        let mut state = PrinterState::default();
        let policy = policy_with_first_layer();
        feed(&mut state, &policy, PREAMBLE);
        let classifier = Classifier::new();
        let disposition = state.observe(&classifier.classify("G1 X10 Y0 E1.0 F1200"), &policy);
        let Disposition::Modulate(request) = disposition else {
            panic!("expected modulation");
        };
        assert_eq!(request.from, Point { x: 0.0, y: 0.0, z: 0.45 });
        assert_eq!(request.to, Point { x: 10.0, y: 0.0, z: 0.45 });
        assert_eq!(request.delta_e, 1.0);
        assert_eq!(request.nominal_z, 0.45);
        assert_eq!(request.layer_height, Some(0.25));
        assert_eq!(request.f, Some(1200.0));
        // state moved on exactly as for the unsplit move
        assert_eq!(state.loc, Point { x: 10.0, y: 0.0, z: 0.45 });
        assert_eq!(state.e, 1.0);
    }

    #[test]
    fn non_qualifying_moves() {
        let mut state = PrinterState::default();
        let policy = policy_with_first_layer();
        feed(&mut state, &policy, PREAMBLE);
        let modulated = feed(
            &mut state,
            &policy,
            &[
                "G1 X20 Y0 F7800",         // travel
                "G1 E-0.8 F2100",          // retract
                "G1 E0.8",                 // unretract, no XY
                "G1 X20 Y0 E0.5",          // no planar displacement
                "G1 X25 Y0 Z0.6 E0.5",     // picks its own Z
                "G1 X30 Y0 E-0.1",         // negative
                ";TYPE:Support material",
                "G1 X40 Y0 E1.0",          // region not eligible
            ],
        );
        assert!(modulated.iter().all(|m| !m));
        assert_eq!(state.loc, Point { x: 40.0, y: 0.0, z: 0.6 });
    }

    #[test]
    fn first_layer_is_decided_by_marker_count() {
        let mut state = PrinterState::default();
        let policy = InclusionPolicy::default();
        let mut lines = PREAMBLE.to_vec();
        lines.push("G1 X10 Y0 E1.0");
        lines.extend([";LAYER_CHANGE", ";Z:0.7", ";HEIGHT:0.25", "G1 X0 Y0 E1.0"]);
        let modulated = feed(&mut state, &policy, &lines);
        assert_eq!(modulated, vec![false, false, false, false, false, false, false, false, false, false, false, true]);
    }

    #[test]
    fn absolute_extrusion_and_g92() {
        let mut state = PrinterState::default();
        let policy = policy_with_first_layer();
        let classifier = Classifier::new();
        feed(&mut state, &policy, &[";Z:0.2", "G90", "M82", "G92 E0", ";TYPE:Perimeter", "G1 X5 Y5 F3000", "G1 X6 Y5 E2.5"]);
        assert_eq!(state.e, 2.5);
        let Disposition::Modulate(request) = state.observe(&classifier.classify("G1 X7 Y5 E3.0"), &policy) else {
            panic!("expected modulation");
        };
        assert_eq!(request.start_e, 2.5);
        assert_eq!(request.end_e, 3.0);
        assert_eq!(request.delta_e, 0.5);
        assert_eq!(request.extrusion_mode, ExtrusionMode::Absolute);
        feed(&mut state, &policy, &["G92 E0"]);
        assert_eq!(state.e, 0.0);
    }

    #[test]
    fn relative_positioning_is_tracked_but_not_modulated() {
        let mut state = PrinterState::default();
        let policy = policy_with_first_layer();
        let modulated = feed(&mut state, &policy, &[";Z:0.2", ";TYPE:Perimeter", "G90", "G1 X5 Y5", "G91", "G1 X1 Y-1 E0.2", "G90"]);
        assert!(modulated.iter().all(|m| !m));
        assert_eq!(state.loc, Point { x: 6.0, y: 4.0, z: 0.0 });
        assert_eq!(state.extrusion_mode, ExtrusionMode::Absolute);
    }

    #[test]
    fn arcs_move_the_start_of_the_next_move() {
        let mut state = PrinterState::default();
        let policy = policy_with_first_layer();
        let classifier = Classifier::new();
        let modulated = feed(
            &mut state,
            &policy,
            &[";Z:0.5", "G90", "M82", "G92 E0", ";TYPE:External perimeter", "G1 X0 Y0 F1200", "G1 X10 Y0 E1.0", "G2 X10 Y10 I0 J5 E3.0"],
        );
        assert_eq!(modulated.last(), Some(&false));
        assert_eq!(state.loc, Point { x: 10.0, y: 10.0, z: 0.0 });
        assert_eq!(state.e, 3.0);

        let Disposition::Modulate(request) = state.observe(&classifier.classify("G1 X0 Y10 E4.0"), &policy) else {
            panic!("expected modulation");
        };
        assert_eq!(request.from, Point { x: 10.0, y: 10.0, z: 0.0 });
        assert_eq!(request.start_e, 3.0);
        assert_eq!(request.delta_e, 1.0);
    }

    #[test]
    fn relative_arc_offsets_the_position() {
        let mut state = PrinterState::default();
        feed(&mut state, &policy_with_first_layer(), &["G90", "M83", "G1 X5 Y5", "G91", "G3 X2 Y-1 R3 E0.4", "G90"]);
        assert_eq!(state.loc, Point { x: 7.0, y: 4.0, z: 0.0 });
        assert_eq!(state.e, 0.4);
    }

    #[test]
    fn homing_loses_the_position_until_an_absolute_xy_move() {
        let mut state = PrinterState::default();
        let policy = policy_with_first_layer();
        let modulated = feed(
            &mut state,
            &policy,
            &[
                ";Z:0.3",
                "G90",
                "M83",
                ";TYPE:Perimeter",
                "G1 X5 Y5",
                "G28 X Y",
                "G1 X10 E0.5",     // start unknown
                "G1 X20 Y5",       // travel to a known spot
                "G1 X30 Y5 E0.5",
            ],
        );
        assert_eq!(modulated, vec![false, false, false, false, false, false, false, false, true]);

        feed(&mut state, &policy, &["G29", "G92 X0 Y0"]);
        assert!(state.position_known);
    }

    #[test]
    fn layer_height_resets_per_layer() {
        let mut state = PrinterState::default();
        feed(&mut state, &InclusionPolicy::default(), &[";Z:0.2", ";HEIGHT:0.2", ";Z:0.4"]);
        assert_eq!(state.layer_height, None);
        assert_eq!(state.layers_seen, 2);
        assert!(!state.is_first_layer());
    }
}
