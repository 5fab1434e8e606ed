use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Instant;

use glam::DVec2;
use tracing::debug;

use super::{
    AffineSolve, PrimitiveError, PrimitiveResult, RegistrationPrimitive, WindowMatch,
    WindowRequest,
};
use crate::affine::{AffineMatrix, PointPair};
use crate::config::PrimitiveConfig;

/// Runs the external `swim` matcher and `mir` solver.
///
/// `swim` reads one window per stdin line and prints one result line per
/// window. `mir` reads `sx sy mx my` lines terminated by `R` and prints the
/// fitted affine on a line starting with `AI`.
///
/// Both programs work in the reference-to-moving direction. Guesses are
/// inverted before they reach `swim` and `mir` results are inverted before
/// they are returned.
#[derive(Debug, Clone)]
pub struct SwimMirPrimitive {
    swim: PathBuf,
    mir: PathBuf,
    clobber_fixed_noise: Option<u32>,
    /// Degrees.
    initial_rotation: f64,
}

impl SwimMirPrimitive {
    pub fn new(swim: impl Into<PathBuf>, mir: impl Into<PathBuf>) -> Self {
        Self {
            swim: swim.into(),
            mir: mir.into(),
            clobber_fixed_noise: None,
            initial_rotation: 0.0,
        }
    }

    pub fn from_config(config: &PrimitiveConfig) -> Self {
        Self {
            clobber_fixed_noise: config.clobber_fixed_noise,
            initial_rotation: config.initial_rotation,
            ..Self::new(&config.swim, &config.mir)
        }
    }

    fn swim_line(&self, request: &WindowRequest) -> PrimitiveResult<String> {
        let inverse = request
            .guess
            .invert()
            .ok_or_else(|| PrimitiveError::Degenerate("singular guess affine".into()))?;
        // Adding zero drops negative zeros from the printed matrix.
        let [[a00, a01, _], [a10, a11, _]] = inverse.0.map(|row| row.map(|v| v + 0.0));

        let [w, h] = request.size;
        let mut args = vec![format!("{w}x{h}")];
        if let Some(px) = self.clobber_fixed_noise {
            args.push(format!("-f{px}"));
        }
        args.extend([
            "-i".to_string(),
            request.iterations.to_string(),
            "-w".to_string(),
            request.whitening.to_string(),
        ]);

        // Grid windows are addressed relative to the image center.
        let mut stationary = request.stationary;
        let mut moving = request.moving;
        if let Some([ox, oy]) = request.grid_offset {
            let offset = DVec2::new(ox as f64, oy as f64);
            stationary -= offset;
            moving -= offset;
            args.extend([
                "-x".to_string(),
                ox.to_string(),
                "-y".to_string(),
                oy.to_string(),
            ]);
        }

        args.push(request.reference_image.display().to_string());
        args.push(format!("{:.0} {:.0}", stationary.x, stationary.y));
        args.push(request.moving_image.display().to_string());
        args.push(format!("{:.6} {:.6}", moving.x, moving.y));
        if self.initial_rotation != 0.0 {
            args.push(format!("{:.6}", self.initial_rotation.to_radians().sin()));
        }
        args.push(format!("{a00:.6} {a01:.6} {a10:.6} {a11:.6}"));
        Ok(args.join(" "))
    }
}

impl RegistrationPrimitive for SwimMirPrimitive {
    fn match_windows(&self, requests: &[WindowRequest]) -> PrimitiveResult<Vec<WindowMatch>> {
        let Some(first) = requests.first() else {
            return Ok(Vec::new());
        };
        let script = requests
            .iter()
            .map(|request| self.swim_line(request))
            .collect::<PrimitiveResult<Vec<_>>>()?
            .join("\n");
        let size_arg = format!("{}x{}", first.size[0], first.size[1]);

        let (stdout, _stderr) = run_command(&self.swim, &[size_arg], &script)?;
        let lines: Vec<&str> = stdout.lines().filter(|l| !l.trim().is_empty()).collect();
        if lines.is_empty() {
            return Err(PrimitiveError::Degenerate("swim produced no output".into()));
        }
        if lines.len() != requests.len() {
            return Err(PrimitiveError::Malformed {
                program: self.swim.display().to_string(),
                detail: format!(
                    "expected {} result lines, got {}",
                    requests.len(),
                    lines.len()
                ),
            });
        }

        lines
            .iter()
            .zip(requests)
            .map(|(line, request)| {
                parse_swim_line(line, request.grid_offset).ok_or_else(|| {
                    PrimitiveError::Malformed {
                        program: self.swim.display().to_string(),
                        detail: format!("unparseable line: {line}"),
                    }
                })
            })
            .collect()
    }

    fn solve_affine(&self, pairs: &[PointPair]) -> PrimitiveResult<AffineSolve> {
        if pairs.len() < 3 {
            return Err(PrimitiveError::Degenerate(format!(
                "{} correspondences, need 3",
                pairs.len()
            )));
        }
        let mut script = String::new();
        for pair in pairs {
            script.push_str(&format!(
                "{} {} {} {}\n",
                pair.stationary.x, pair.stationary.y, pair.moving.x, pair.moving.y
            ));
        }
        script.push_str("R\n");

        let (stdout, _stderr) = run_command(&self.mir, &[], &script)?;
        let forward = parse_mir_output(&stdout)
            .ok_or_else(|| PrimitiveError::Degenerate("mir output has no AI line".into()))?;
        let affine = forward
            .invert()
            .ok_or_else(|| PrimitiveError::Degenerate("mir returned a singular affine".into()))?;
        Ok(AffineSolve {
            affine,
            raw: stdout,
        })
    }
}

/// Parses one `swim` result line.
///
/// Tokens after stripping parentheses: `snr:` at 0, stationary point at 2-3,
/// matched point at 5-6, displacement at 8-9. Points are shifted back by the
/// grid offset when one was used.
pub fn parse_swim_line(line: &str, grid_offset: Option<[i32; 2]>) -> Option<WindowMatch> {
    let cleaned = line.replace(['(', ')'], " ");
    let toks: Vec<&str> = cleaned.split_whitespace().collect();
    if toks.len() < 10 {
        return None;
    }
    let num = |i: usize| toks[i].parse::<f64>().ok();

    let mut snr_chars = toks[0].chars();
    snr_chars.next_back();
    let snr = snr_chars.as_str().parse::<f64>().ok()?;
    let offset = grid_offset
        .map(|[x, y]| DVec2::new(x as f64, y as f64))
        .unwrap_or(DVec2::ZERO);

    Some(WindowMatch {
        stationary: DVec2::new(num(2)?, num(3)?) + offset,
        matched: DVec2::new(num(5)?, num(6)?) + offset,
        displacement: DVec2::new(num(8)?, num(9)?),
        snr,
        raw: line.trim().to_string(),
    })
}

/// Extracts the affine from the `AI a c e b d f` line of `mir` output, as
/// printed: stationary to moving.
pub fn parse_mir_output(stdout: &str) -> Option<AffineMatrix> {
    stdout.lines().find_map(|line| {
        let toks: Vec<&str> = line.split_whitespace().collect();
        if toks.len() < 7 || toks[0] != "AI" {
            return None;
        }
        let v: Vec<f64> = toks[1..7]
            .iter()
            .map(|t| t.parse::<f64>())
            .collect::<Result<_, _>>()
            .ok()?;
        Some(AffineMatrix([[v[0], v[1], v[2]], [v[3], v[4], v[5]]]))
    })
}

fn run_command(program: &Path, args: &[String], input: &str) -> PrimitiveResult<(String, String)> {
    let started = Instant::now();
    let program_name = program.display().to_string();

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| PrimitiveError::Spawn {
            program: program_name.clone(),
            source,
        })?;

    // stdin is fed from its own thread while stdout and stderr drain.
    let stdin = child.stdin.take();
    let output = std::thread::scope(|scope| {
        if let Some(mut stdin) = stdin {
            let program_name = &program_name;
            scope.spawn(move || {
                if let Err(err) = stdin.write_all(input.as_bytes()) {
                    debug!(program = %program_name, error = %err, "stdin closed early");
                }
            });
        }
        child.wait_with_output()
    })
    .map_err(|source| PrimitiveError::Spawn {
        program: program_name.clone(),
        source,
    })?;
    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    debug!(
        program = %program_name,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "external command finished"
    );

    if !output.status.success() {
        return Err(PrimitiveError::Exit {
            program: program_name,
            status: output.status.code(),
            stderr,
        });
    }
    Ok((stdout, stderr))
}
