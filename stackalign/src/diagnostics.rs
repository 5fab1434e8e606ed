//! Per-section result records and plain-text bias diagnostics.
//!
//! Layout under the output directory:
//!
//! ```text
//! <output>/<scale>/<section name>/results.json
//! <output>/<scale>/bias_data/{snr,bias_x,bias_y,...,afm,c_afm}_1.dat
//! ```

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::debug;

use crate::affine::AffineComponents;
use crate::cumulative::ChainLink;
use crate::stack::AlignResults;

#[derive(Debug, thiserror::Error)]
pub enum DiagnosticsError {
    #[error("Failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to serialize results")]
    Json(#[from] serde_json::Error),
}

pub type DiagnosticsResult<T> = Result<T, DiagnosticsError>;

pub const BIAS_DIR: &str = "bias_data";
pub const RESULTS_FILE: &str = "results.json";

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> DiagnosticsError + '_ {
    move |source| DiagnosticsError::Io {
        path: path.to_path_buf(),
        source,
    }
}

pub fn scale_dir(output: &Path, scale: u32) -> PathBuf {
    output.join(scale.to_string())
}

#[derive(Serialize)]
struct SectionRecord<'a> {
    index: usize,
    name: &'a str,
    scale: u32,
    #[serde(flatten)]
    results: &'a AlignResults,
}

/// Writes `results.json` for one section and returns its path.
pub fn write_section_results(
    output: &Path,
    scale: u32,
    index: usize,
    name: &str,
    results: &AlignResults,
) -> DiagnosticsResult<PathBuf> {
    let dir = scale_dir(output, scale).join(name);
    std::fs::create_dir_all(&dir).map_err(io_err(&dir))?;
    let path = dir.join(RESULTS_FILE);

    let record = SectionRecord {
        index,
        name,
        scale,
        results,
    };
    let text = serde_json::to_string_pretty(&record)?;
    std::fs::write(&path, text).map_err(io_err(&path))?;
    Ok(path)
}

/// Formats like C's `%.6g`.
pub fn format_g(value: f64) -> String {
    const PRECISION: i32 = 6;
    if value == 0.0 || !value.is_finite() {
        return if value == 0.0 {
            "0".into()
        } else {
            value.to_string()
        };
    }

    let sci = format!("{:.*e}", (PRECISION - 1) as usize, value);
    let (mantissa, exponent) = sci.split_once('e').unwrap_or((&sci, "0"));
    let exponent: i32 = exponent.parse().unwrap_or(0);

    if exponent < -4 || exponent >= PRECISION {
        let mantissa = strip_zeros(mantissa);
        let sign = if exponent < 0 { '-' } else { '+' };
        format!("{mantissa}e{sign}{:02}", exponent.abs())
    } else {
        let decimals = (PRECISION - 1 - exponent).max(0) as usize;
        strip_zeros(&format!("{value:.decimals$}")).to_string()
    }
}

fn strip_zeros(text: &str) -> &str {
    if text.contains('.') {
        text.trim_end_matches('0').trim_end_matches('.')
    } else {
        text
    }
}

fn write_lines<I>(path: &Path, lines: I) -> DiagnosticsResult<()>
where
    I: IntoIterator<Item = String>,
{
    let file = File::create(path).map_err(io_err(path))?;
    let mut writer = BufWriter::new(file);
    for line in lines {
        writeln!(writer, "{line}").map_err(io_err(path))?;
    }
    writer.flush().map_err(io_err(path))
}

fn affine_line(index: usize, values: [f64; 6]) -> String {
    let cols: Vec<String> = values.iter().map(|v| format_g(*v)).collect();
    format!("{index} {}", cols.join(" "))
}

/// Writes the bias diagnostics for one run.
///
/// `before` is the chain as fitted, `after` the chain once drift was removed,
/// `snr` the mean SNR per section in chain order.
pub fn write_bias_data(
    output: &Path,
    scale: u32,
    before: &[ChainLink],
    after: &[ChainLink],
    snr: &[f64],
) -> DiagnosticsResult<PathBuf> {
    let dir = scale_dir(output, scale).join(BIAS_DIR);
    std::fs::create_dir_all(&dir).map_err(io_err(&dir))?;

    let components: Vec<(usize, AffineComponents)> = before
        .iter()
        .map(|l| (l.index, l.cumulative.decompose()))
        .collect();
    let scalar = |name: &str, pick: fn(&AffineComponents) -> f64| {
        write_lines(
            &dir.join(format!("{name}_1.dat")),
            components
                .iter()
                .map(|(i, c)| format!("{i} {}", format_g(pick(c)))),
        )
    };

    write_lines(
        &dir.join("snr_1.dat"),
        before
            .iter()
            .zip(snr)
            .map(|(l, s)| format!("{} {}", l.index, format_g(*s))),
    )?;
    scalar("bias_x", |c| c.tx)?;
    scalar("bias_y", |c| c.ty)?;
    scalar("bias_rot", |c| c.rotation)?;
    scalar("bias_scale_x", |c| c.scale_x)?;
    scalar("bias_scale_y", |c| c.scale_y)?;
    scalar("bias_skew_x", |c| c.skew_x)?;
    scalar("bias_det", |c| c.determinant)?;

    write_lines(
        &dir.join("afm_1.dat"),
        after
            .iter()
            .map(|l| affine_line(l.index, l.pairwise.to_flat())),
    )?;
    write_lines(
        &dir.join("c_afm_1.dat"),
        after
            .iter()
            .map(|l| affine_line(l.index, l.cumulative.to_flat())),
    )?;

    debug!(dir = %dir.display(), sections = before.len(), "bias data written");
    Ok(dir)
}
