//! Wire format between the driver and out-of-process workers.
//!
//! A worker receives one [`AlignTask`] as JSON on stdin and prints one
//! [`TaskResult`] as JSON on stdout, fenced by [`JSON_DELIMITER`] lines so that
//! stray output from the registration kernels never corrupts the result.

use serde::{Deserialize, Serialize};

use crate::primitive::{PrimitiveResult, RegistrationPrimitive};
use crate::recipe::{Recipe, SnrReport};
use crate::settings::TaskSettings;

pub const JSON_DELIMITER: &str = "---JSON-DELIMITER---";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlignTask {
    pub index: usize,
    pub settings: TaskSettings,
}

impl AlignTask {
    pub fn new(settings: TaskSettings) -> Self {
        Self {
            index: settings.index,
            settings,
        }
    }
}

/// Raw task output. The affine stays untyped until the driver validates it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub index: usize,
    pub affine: Vec<Vec<f64>>,
    #[serde(default)]
    pub snr: Vec<f64>,
    #[serde(default)]
    pub snr_report: SnrReport,
    #[serde(default)]
    pub tokens: Vec<String>,
    pub complete: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Missing result delimiters in worker output")]
    MissingDelimiter,
    #[error("Invalid result JSON")]
    Json(#[from] serde_json::Error),
}

pub fn encode_result(result: &TaskResult) -> Result<String, serde_json::Error> {
    let json = serde_json::to_string(result)?;
    Ok(format!("{JSON_DELIMITER}\n{json}\n{JSON_DELIMITER}\n"))
}

/// Extracts the result between the first pair of delimiters in `stdout`.
pub fn decode_result(stdout: &str) -> Result<TaskResult, ProtocolError> {
    let mut parts = stdout.split(JSON_DELIMITER);
    let _preamble = parts.next();
    let body = parts.next().ok_or(ProtocolError::MissingDelimiter)?;
    if parts.next().is_none() {
        return Err(ProtocolError::MissingDelimiter);
    }
    Ok(serde_json::from_str(body.trim())?)
}

/// Runs the recipe for one task.
pub fn execute_task(
    task: &AlignTask,
    primitive: &dyn RegistrationPrimitive,
) -> PrimitiveResult<TaskResult> {
    let outcome = Recipe::new(&task.settings).execute(primitive)?;
    Ok(TaskResult {
        index: task.index,
        affine: outcome.affine.to_rows(),
        snr: outcome.snr,
        snr_report: outcome.report,
        tokens: outcome.tokens,
        complete: outcome.complete,
    })
}
