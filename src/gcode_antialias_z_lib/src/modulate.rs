//! Splitting a qualifying move into sub-segments that follow the model surface.
//!
//! The move from A to B is cut into `ceil(|B - A| / step)` pieces, every piece `step` long except
//! the last, which takes whatever is left. Each piece ends at a point whose Z is the nominal layer
//! Z plus the clamped distance to the surface right above or below that point. Extrusion is shared
//! out by planar length, so the total never changes; the extra length due to the Z excursion is
//! ignored (it's tiny next to the clamp). It's the running total that gets rounded, not each share,
//! so rounding error can't pile up on the last segment.

use std::fmt::Write as fmt_Write;

use crate::gcode::ExtrusionMode;
use crate::mesh::SurfaceSampler;
use crate::policy::InclusionPolicy;
use crate::state::MoveRequest;
use crate::Mm;

// Moves shorter than this aren't worth splitting; a sub-segment this short would be at the limit of
// what 3-decimal gcode can even express.
pub const GCODE_RESOLUTION: Mm = 0.0125;

const XY_DECIMALS: i32 = 3;
const Z_DECIMALS: i32 = 3;
const E_DECIMALS: i32 = 5;

/// One emitted G1.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment<'a> {
    pub x: Mm,
    pub y: Mm,
    pub z: Mm,
    /// The E word to write: a delta in relative mode, a running total in absolute mode.
    pub e: Mm,
    /// This segment's share of the move's extrusion, regardless of mode.
    pub delta_e: Mm,
    pub f: Option<Mm>,
    pub comment: Option<&'a str>,
    // The original target. X/Y/E are written exactly as parsed rather than rounded.
    is_endpoint: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SplitMove<'a> {
    pub segments: Vec<Segment<'a>>,
    pub nominal_z: Mm,
    /// Max |dz| for this move.
    pub limit: Mm,
    absolute_e: bool,
    /// Sample points that were off the model.
    pub misses: usize,
    /// Sample points whose offset had to be clamped.
    pub clamped: usize,
}

impl MoveRequest<'_> {
    /// Largest allowed |dz|. Uses the layer thickness when the slicer reported one, but never
    /// more than the nominal Z, so the nozzle can't be pushed to or below the previous layer's
    /// bottom.
    pub fn clamp_limit(&self, policy: &InclusionPolicy) -> Mm {
        let thickness = self.layer_height.or(policy.fallback_layer_height).unwrap_or(self.nominal_z);
        (thickness.min(self.nominal_z) * policy.max_dz_fraction).max(0.0)
    }
}

pub fn split_move<'a, S: SurfaceSampler + ?Sized>(request: &MoveRequest<'a>, sampler: &S, policy: &InclusionPolicy) -> SplitMove<'a> {
    let from = request.from;
    let to = request.to;
    let dx = to.x - from.x;
    let dy = to.y - from.y;
    let length = dx.hypot(dy);
    let segment_count = if length < GCODE_RESOLUTION {
        1
    } else {
        // the epsilon keeps an exact multiple of step from growing a zero-length tail
        ((length / policy.step - 1e-9).ceil() as usize).max(1)
    };
    let h = request.nominal_z;
    let limit = request.clamp_limit(policy);

    let mut split = SplitMove {
        segments: Vec::with_capacity(segment_count),
        nominal_z: h,
        limit,
        absolute_e: request.extrusion_mode == ExtrusionMode::Absolute,
        misses: 0,
        clamped: 0,
    };
    // rounded running total of E through the previous point
    let mut emitted_e: Mm = 0.0;
    for i in 1..=segment_count {
        let is_endpoint = i == segment_count;
        let (x, y) = if is_endpoint {
            // B as written, not re-derived from t = 1
            (to.x, to.y)
        } else {
            let t = policy.step * i as Mm / length;
            (from.x + dx * t, from.y + dy * t)
        };

        let dz = match sampler.height_at(x, y) {
            Some(surface_z) => {
                let raw = surface_z - h;
                if raw.abs() > limit {
                    split.clamped += 1;
                }
                raw.clamp(-limit, limit)
            }
            None => {
                // off the model (skirt, brim, ...): stay on the nominal plane
                split.misses += 1;
                0.0
            }
        };

        let cumulative_e = if is_endpoint {
            // so the shares add back up to exactly delta_e
            request.delta_e
        } else {
            let cumulative_length = (x - from.x).hypot(y - from.y);
            round_to(request.delta_e * cumulative_length / length, E_DECIMALS)
        };
        let delta_e = cumulative_e - emitted_e;
        emitted_e = cumulative_e;

        let e = match request.extrusion_mode {
            ExtrusionMode::Relative => delta_e,
            ExtrusionMode::Absolute if is_endpoint => request.end_e,
            ExtrusionMode::Absolute => request.start_e + cumulative_e,
        };

        split.segments.push(Segment {
            x,
            y,
            z: h + dz,
            e,
            delta_e,
            f: if i == 1 { request.f } else { None },
            comment: if i == 1 { request.comment } else { None },
            is_endpoint,
        });
    }
    split
}

impl SplitMove<'_> {
    /// The replacement G1 lines, in order.
    pub fn to_gcode_lines(&self) -> Vec<String> {
        self.segments.iter().map(|segment| self.format_segment(segment)).collect()
    }

    fn format_segment(&self, segment: &Segment) -> String {
        let (x, y) = if segment.is_endpoint {
            (segment.x, segment.y)
        } else {
            (round_to(segment.x, XY_DECIMALS), round_to(segment.y, XY_DECIMALS))
        };
        // An absolute E target is the original total as written; anything else was computed.
        let e = if segment.is_endpoint && self.absolute_e { segment.e } else { round_to(segment.e, E_DECIMALS) };
        let z = quantize_z(segment.z, self.nominal_z, self.limit);
        let mut line = String::new();
        write!(line, "G1 X{} Y{} Z{} E{}", fmt_num(x), fmt_num(y), fmt_num(z), fmt_num(e)).expect("write to String");
        if let Some(f) = segment.f {
            write!(line, " F{}", fmt_num(f)).expect("write to String");
        }
        if let Some(comment) = segment.comment {
            write!(line, " {}", comment).expect("write to String");
        }
        line
    }
}

pub(crate) fn round_to(value: Mm, decimals: i32) -> Mm {
    let scale = (10.0 as Mm).powi(decimals);
    (value * scale).round() / scale
}

// Rounded to Z_DECIMALS, but never rounded past the clamp limit. With a limit under half a quantum
// there may be no such value, and then the nominal Z is written as-is.
fn quantize_z(z: Mm, nominal_z: Mm, limit: Mm) -> Mm {
    let quantum = (10.0 as Mm).powi(-Z_DECIMALS);
    let within_limit = |candidate: Mm| (candidate - nominal_z).abs() <= limit + 1e-9;
    let rounded = round_to(z, Z_DECIMALS);
    if within_limit(rounded) {
        return rounded;
    }
    let stepped_back = round_to(rounded - quantum * (rounded - nominal_z).signum(), Z_DECIMALS);
    if within_limit(stepped_back) {
        return stepped_back;
    }
    nominal_z
}

/// Shortest representation that reads back as the same value, without a "-0".
pub(crate) fn fmt_num(value: Mm) -> String {
    if value == 0.0 {
        return "0".to_string();
    }
    format!("{}", value)
}
