//! One alignment pass over a stack at a single scale level.
//!
//! The driver is the only owner of the stack and the result cache. It builds a
//! frozen [`TaskSettings`] snapshot for every section that needs work, hands
//! the batch to the [`TaskQueue`], then folds the collected pairwise affines
//! into the cumulative chain and optionally removes drift.


use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::affine::AffineMatrix;
use crate::bias::{self, BiasReport};
use crate::cache::{CacheKey, ResultCache};
use crate::config::AlignOptions;
use crate::cumulative::{compose_chain, ChainLink};
use crate::diagnostics::{self, DiagnosticsError};
use crate::stack::{AlignResults, Stack, StackError};
use crate::settings::TaskSettings;
use crate::task::{AlignTask, TaskResult};
use crate::task_queue::{CancelToken, ProgressSink, TaskQueue, TaskRunner, TaskStatus};

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error(transparent)]
    Stack(#[from] StackError),
    #[error("Stack has no included sections")]
    NoIncludedSections,
    #[error(transparent)]
    Diagnostics(#[from] DiagnosticsError),
}

pub type DriverResult<T> = Result<T, DriverError>;

/// A section that ended the run without a usable result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectionFailure {
    pub index: usize,
    pub name: String,
    pub message: String,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AlignReport {
    pub scale: u32,
    pub dispatched: usize,
    pub cache_hits: usize,
    /// Excluded sections inside the requested range.
    pub skipped: usize,
    pub succeeded: Vec<usize>,
    pub failed: Vec<SectionFailure>,
    pub cancelled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bias: Option<BiasReport>,
}

impl AlignReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && !self.cancelled
    }
}

pub struct AlignmentDriver<R>
where
    R: TaskRunner<Input = AlignTask, Output = TaskResult>,
{
    queue: TaskQueue<R>,
    cache: ResultCache,
    output_dir: Option<PathBuf>,
}

impl<R> AlignmentDriver<R>
where
    R: TaskRunner<Input = AlignTask, Output = TaskResult>,
{
    pub fn new(queue: TaskQueue<R>, cache: ResultCache) -> Self {
        Self {
            queue,
            cache,
            output_dir: None,
        }
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }

    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    pub fn cache_mut(&mut self) -> &mut ResultCache {
        &mut self.cache
    }

    pub fn queue(&self) -> &TaskQueue<R> {
        &self.queue
    }

    /// Aligns every included section in `options.range` at `options.scale` and
    /// rebuilds the cumulative chain for the whole level.
    ///
    /// Per-section failures do not fail the run; they are listed in the report
    /// and the affected sections keep their previous results.
    pub async fn align(
        &mut self,
        stack: &mut Stack,
        options: &AlignOptions,
        cancel: &CancelToken,
        progress: &dyn ProgressSink,
    ) -> DriverResult<AlignReport> {
        let scale = options.scale;
        stack.ensure_scale(scale)?;
        stack.validate()?;
        let anchor = stack.anchor().ok_or(DriverError::NoIncludedSections)?;
        let coarser = stack.coarser_scale(scale);

        let mut report = AlignReport {
            scale,
            ..Default::default()
        };
        let mut snapshots: BTreeMap<usize, TaskSettings> = BTreeMap::new();

        for index in (0..stack.len()).filter(|&i| options.contains(i)) {
            if !stack.sections[index].include {
                debug!(index, "excluded, skipping");
                report.skipped += 1;
                continue;
            }

            if index == anchor {
                store_results(
                    stack,
                    index,
                    scale,
                    AlignResults {
                        tokens: vec!["anchor".into()],
                        ..Default::default()
                    },
                );
                report.succeeded.push(index);
                continue;
            }

            let settings = snapshot(stack, index, scale, coarser)?;
            if !options.ignore_cache {
                let fingerprint = settings.fingerprint();
                if let Some(pairwise) = self.cache.get(&fingerprint) {
                    debug!(index, %fingerprint, "cache hit");
                    let mut results = stack
                        .results(index, scale)
                        .filter(|r| r.fingerprint.as_ref() == Some(&fingerprint))
                        .cloned()
                        .unwrap_or_else(|| AlignResults {
                            tokens: vec!["cached".into()],
                            ..Default::default()
                        });
                    results.pairwise = pairwise;
                    results.fingerprint = Some(fingerprint);
                    store_results(stack, index, scale, results);
                    report.cache_hits += 1;
                    report.succeeded.push(index);
                    continue;
                }
            }
            snapshots.insert(index, settings);
        }

        let tasks: Vec<(usize, AlignTask)> = snapshots
            .values()
            .map(|settings| (settings.index, AlignTask::new(settings.clone())))
            .collect();
        report.dispatched = tasks.len();
        info!(
            scale,
            dispatched = report.dispatched,
            cache_hits = report.cache_hits,
            skipped = report.skipped,
            "dispatching alignment tasks"
        );

        if !tasks.is_empty() {
            let batch = self.queue.run(tasks, cancel, progress).await;
            report.cancelled = batch.cancelled;

            for record in batch.records {
                let index = record.index;
                let name = stack.sections[index].name.clone();
                let failure = |message: String| SectionFailure {
                    index,
                    name: name.clone(),
                    message,
                    stdout: String::new(),
                    stderr: String::new(),
                    exit_code: None,
                };

                match (record.status, record.output, record.failure) {
                    (TaskStatus::Completed, Some(result), _) => {
                        let Some(settings) = snapshots.get(&index) else {
                            continue;
                        };
                        match self.accept(stack, settings, result) {
                            Ok(()) => report.succeeded.push(index),
                            Err(message) => report.failed.push(failure(message)),
                        }
                    }
                    (TaskStatus::TaskError, _, Some(task_failure)) => {
                        report.failed.push(SectionFailure {
                            stdout: task_failure.stdout,
                            stderr: task_failure.stderr,
                            exit_code: task_failure.exit_code,
                            ..failure(task_failure.message)
                        });
                    }
                    (TaskStatus::Queued, _, _) => {
                        debug!(index, "not run before cancellation");
                    }
                    (status, _, _) => {
                        report.failed.push(failure(format!("task ended as {status}")));
                    }
                }
            }
        }
        report.succeeded.sort_unstable();

        let mut links = chain_links(stack, scale, anchor);
        compose_chain(&mut links);
        let composed = links.clone();

        if stack.bias.null_bias {
            report.bias = bias::detrend(&mut links, &stack.bias);
        }
        write_cumulative(stack, scale, &links);

        if let Some(output) = &self.output_dir {
            self.write_outputs(output, stack, scale, &report, &composed, &links)?;
        }

        if report.is_success() {
            info!(
                scale,
                succeeded = report.succeeded.len(),
                dispatched = report.dispatched,
                cache_hits = report.cache_hits,
                "alignment finished"
            );
        } else {
            for failed in &report.failed {
                warn!(
                    index = failed.index,
                    name = %failed.name,
                    exit_code = ?failed.exit_code,
                    "{}",
                    failed.message
                );
            }
            warn!(
                scale,
                succeeded = report.succeeded.len(),
                failed = report.failed.len(),
                cancelled = report.cancelled,
                "alignment finished with failures"
            );
        }

        Ok(report)
    }

    /// Validates and stores one task result; returns the reason on rejection.
    fn accept(
        &mut self,
        stack: &mut Stack,
        settings: &TaskSettings,
        result: TaskResult,
    ) -> Result<(), String> {
        let index = settings.index;
        if !result.complete {
            let reason = result.tokens.join("; ");
            warn!(index, %reason, "alignment incomplete, keeping previous results");
            return Err(format!("Alignment incomplete: {reason}"));
        }

        let pairwise = match AffineMatrix::try_from(result.affine) {
            Ok(affine) => affine,
            Err(err) => {
                warn!(index, %err, "rejecting task result, keeping previous results");
                return Err(err.to_string());
            }
        };

        if let Err(err) = self.cache.put(settings, pairwise) {
            warn!(index, %err, "failed to cache result");
        }

        let previous_cumulative = stack
            .results(index, settings.scale)
            .map(|r| r.cumulative)
            .unwrap_or_default();
        store_results(
            stack,
            index,
            settings.scale,
            AlignResults {
                pairwise,
                cumulative: previous_cumulative,
                snr: result.snr,
                snr_report: result.snr_report,
                tokens: result.tokens,
                fingerprint: Some(settings.fingerprint()),
            },
        );
        Ok(())
    }

    fn write_outputs(
        &self,
        output: &std::path::Path,
        stack: &Stack,
        scale: u32,
        report: &AlignReport,
        composed: &[ChainLink],
        detrended: &[ChainLink],
    ) -> DriverResult<()> {
        for &index in &report.succeeded {
            if let Some(results) = stack.results(index, scale) {
                diagnostics::write_section_results(
                    output,
                    scale,
                    index,
                    &stack.sections[index].name,
                    results,
                )?;
            }
        }

        if report.bias.is_some() {
            let snr: Vec<f64> = (0..stack.len())
                .map(|i| stack.results(i, scale).map_or(0.0, |r| r.snr_report.mean))
                .collect();
            diagnostics::write_bias_data(output, scale, composed, detrended, &snr)?;
        }
        Ok(())
    }
}

/// Frozen settings for aligning `index` at `scale`.
///
/// When the next coarser level already has a result for the section, the task
/// refines it: its pairwise affine seeds the recipe with the translation
/// scaled to this level.
pub fn snapshot(
    stack: &Stack,
    index: usize,
    scale: u32,
    coarser: Option<u32>,
) -> DriverResult<TaskSettings> {
    let section = &stack.sections[index];
    let level = section
        .level(scale)
        .ok_or(StackError::UnknownScale(scale))?;
    let reference_index = stack.reference_index(index);
    let reference_image = reference_index
        .and_then(|r| stack.sections[r].level(scale))
        .map(|l| l.image.clone());

    let coarse = coarser.and_then(|c| stack.results(index, c).map(|r| (c, r.pairwise)));
    let (is_refinement, initial_affine) = match coarse {
        Some((coarse_scale, pairwise)) => {
            let factor = coarse_scale as f64 / scale as f64;
            (
                true,
                pairwise.with_translation(pairwise.translation_part() * factor),
            )
        }
        None => (false, AffineMatrix::identity()),
    };

    Ok(TaskSettings {
        index,
        scale,
        name: section.name.clone(),
        image: level.image.clone(),
        reference_image,
        reference_index,
        image_size: level.image_size,
        level: level.settings.clone(),
        is_refinement,
        initial_affine,
    })
}

fn store_results(stack: &mut Stack, index: usize, scale: u32, results: AlignResults) {
    if let Some(level) = stack.sections[index].level_mut(scale) {
        level.results = Some(results);
    }
}

/// Chain over the whole level, with current pairwise results.
fn chain_links(stack: &Stack, scale: u32, anchor: usize) -> Vec<ChainLink> {
    (0..stack.len())
        .map(|index| {
            let include = stack.sections[index].include;
            let pairwise = match stack.results(index, scale) {
                _ if index == anchor => AffineMatrix::identity(),
                Some(results) => results.pairwise,
                None => {
                    if include {
                        warn!(index, scale, "no pairwise result, chaining with identity");
                    }
                    AffineMatrix::identity()
                }
            };
            ChainLink::new(index, stack.reference_index(index), include, pairwise)
        })
        .collect()
}

/// Writes cumulative affines back. Excluded sections always get a record so
/// they can be placed; included sections without results stay without.
fn write_cumulative(stack: &mut Stack, scale: u32, links: &[ChainLink]) {
    for link in links {
        let Some(level) = stack.sections[link.index].level_mut(scale) else {
            continue;
        };
        match &mut level.results {
            Some(results) => {
                results.cumulative = link.cumulative;
                if !link.include {
                    results.pairwise = link.pairwise;
                }
            }
            None if !link.include => {
                level.results = Some(AlignResults {
                    pairwise: link.pairwise,
                    cumulative: link.cumulative,
                    tokens: vec!["excluded".into()],
                    ..Default::default()
                });
            }
            None => {}
        }
    }
}
