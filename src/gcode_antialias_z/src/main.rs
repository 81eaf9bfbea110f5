use gcode_antialias_z_lib as gaz;
use gaz::header::{self, HeaderInfo};
use gaz::policy::{DEFAULT_MAX_DZ_FRACTION, DEFAULT_STEP};
use gaz::{InclusionPolicy, Mm};

use anyhow::Context;
use clap::Parser;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::thread;

const STACK_SIZE: usize = 16 * 1024 * 1024;

/// Nudges the Z of wall moves in sliced G-code toward the model surface, so shallow slopes don't
/// show layer stair-steps.
#[derive(Parser, Debug)]
#[command(name = "gcode_antialias_z")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Text G-code to rewrite. Read from stdin (and written to stdout) when omitted.
    #[arg(value_name = "INPUT")]
    input: Option<PathBuf>,

    /// The STL the G-code was sliced from. Found next to INPUT when omitted.
    #[arg(long, value_name = "PATH")]
    stl: Option<PathBuf>,

    /// Where to write the result (default: INPUT, rewritten in place)
    #[arg(short, long, value_name = "OUTPUT")]
    output: Option<PathBuf>,

    /// Nozzle diameter in mm, used as the resampling step (default: from the G-code header)
    #[arg(long, value_name = "MM")]
    nozzle: Option<Mm>,

    /// Resampling step in mm, overrides --nozzle
    #[arg(long, value_name = "MM")]
    step: Option<Mm>,

    /// Max Z offset as a fraction of the layer height
    #[arg(long, value_name = "F", default_value_t = DEFAULT_MAX_DZ_FRACTION)]
    max_dz_frac: Mm,

    /// ;TYPE: label to modulate, repeatable (default: the perimeter types)
    #[arg(long = "types", value_name = "LABEL")]
    types: Vec<String>,

    /// Also modulate solid and internal infill
    #[arg(long)]
    include_infill: bool,

    /// Also modulate the first layer
    #[arg(long)]
    first_layer: bool,

    /// Layer height in mm for layers without a ;HEIGHT: marker (default: inferred)
    #[arg(long, value_name = "MM")]
    layer_height: Option<Mm>,

    /// Don't move back to the nominal layer Z before unmodulated moves
    #[arg(long)]
    no_restore_z: bool,
}

impl Cli {
    fn policy(&self, header: &HeaderInfo) -> gaz::Result<InclusionPolicy> {
        let mut policy = InclusionPolicy::default();
        if !self.types.is_empty() {
            policy.eligible_regions = self.types.iter().cloned().collect();
        }
        if self.include_infill {
            policy = policy.with_infill();
        }
        policy.modulate_first_layer = self.first_layer;
        policy.max_dz_fraction = self.max_dz_frac;
        policy.step = self.step.or(self.nozzle).or(header.nozzle_diameter).unwrap_or(DEFAULT_STEP);
        policy.fallback_layer_height = self.layer_height.or(header.layer_height);
        policy.restore_z = !self.no_restore_z;
        policy.validate()?;
        log::info!(
            "step: {} max_dz_frac: {} fallback layer height: {:?} first layer: {} restore z: {}",
            policy.step,
            policy.max_dz_fraction,
            policy.fallback_layer_height,
            policy.modulate_first_layer,
            policy.restore_z
        );
        log::debug!("eligible regions: {:?}", policy.eligible_regions);
        Ok(policy)
    }
}

fn rewrite_file(cli: &Cli, input: &Path) -> anyhow::Result<()> {
    // also refuses binary input, before anything is read for real
    let header = HeaderInfo::scan_lines(gaz::file_lines(input)?).with_context(|| format!("reading {}", input.display()))?;
    log::debug!("header: {:?}", header);
    let stl_path = cli.stl.clone().unwrap_or_else(|| header::locate_stl(input, header.model_filename.as_deref()));
    let policy = cli.policy(&header)?;
    let mesh = gaz::load_mesh(&stl_path)?;

    // output can be the same as input; process_files doesn't overwrite until it has complete output
    let output = cli.output.clone().unwrap_or_else(|| input.to_owned());
    gaz::process_files(input, &output, &mesh, &policy)?;
    log::info!("wrote {}", output.display());
    Ok(())
}

fn rewrite_stdin(cli: &Cli) -> anyhow::Result<()> {
    let stl_path = cli.stl.as_deref().ok_or(gaz::Error::StlPathRequired)?;
    let mut input = Vec::new();
    io::stdin().lock().read_to_end(&mut input).context("reading stdin")?;
    if header::looks_binary(&input) {
        return Err(gaz::Error::UnsupportedFormat(PathBuf::from("<stdin>")).into());
    }
    let header = HeaderInfo::scan_lines(input.split(|&b| b == b'\n').map(|line| Ok::<_, io::Error>(String::from_utf8_lossy(line))))?;
    let policy = cli.policy(&header)?;
    let mesh = gaz::load_mesh(stl_path)?;

    // nothing goes out until the whole input has been rewritten
    let (output, stats) = gaz::rewrite_bytes(&input, &mesh, &policy)?;
    gaz::log_stats(&stats);
    match &cli.output {
        Some(path) => std::fs::write(path, &output).with_context(|| format!("writing {}", path.display()))?,
        None => {
            let mut stdout = io::stdout().lock();
            stdout.write_all(&output).context("writing stdout")?;
            stdout.flush().context("writing stdout")?;
        }
    }
    Ok(())
}

fn run(cli: Cli) -> ExitCode {
    let result = match &cli.input {
        Some(input) => rewrite_file(&cli, input),
        None => rewrite_stdin(&cli),
    };
    let Err(err) = result else {
        return ExitCode::SUCCESS;
    };
    match err.downcast_ref::<gaz::Error>() {
        Some(gaz::Error::MissingGeometry(path)) => {
            eprintln!("ERROR: STL file not found.\n{}", path.display());
            ExitCode::from(2)
        }
        Some(gaz::Error::StlPathRequired | gaz::Error::UnsupportedFormat(_) | gaz::Error::Config(_)) => {
            eprintln!("ERROR: {:#}", err);
            ExitCode::from(2)
        }
        _ => {
            eprintln!("ERROR: {:#}", err);
            ExitCode::FAILURE
        }
    }
}

fn main() -> ExitCode {
    // stdout may be carrying G-code, so logs go to stderr
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    log::info!("gcode_antialias_z starting");

    // The kd-tree recurses and can blow a default-sized stack on big meshes. Only the thread doing
    // the work needs more, so it gets its own thread; switching before we have any data means
    // nothing has to be Send or Sync.
    let primary = thread::Builder::new().stack_size(STACK_SIZE).spawn(move || run(cli)).expect("thread spawn failed");
    primary.join().expect("primary thread join (from main) failed")
}
