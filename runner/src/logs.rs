//! Interpretation of the append-only progress and metric logs written by training scripts.
//!
//! A script only appends whitespace separated rows to files in its output directory:
//!
//! * `progress.log`: `epoch phase iteration iterations_per_epoch unix_timestamp`
//! * `metric_<name>.log`: `epoch value`
//! * `metric_classwise_<name>.log`: `epoch class value`
//!
//! Everything here is pure; reading the files is the job of the platforms.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::warn;

/// map of log name (file stem) -> raw log text
pub type LogMap = BTreeMap<String, String>;

/// (epoch, value) pairs in file order
pub type Series = Vec<(u64, f64)>;

pub const PROGRESS_LOG: &str = "progress";
pub const METRIC_PREFIX: &str = "metric_";
pub const CLASSWISE_PREFIX: &str = "metric_classwise_";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LogError {
    #[error("line {line}: expected at least {expected} columns, found {found}")]
    MissingColumns {
        line: usize,
        expected: usize,
        found: usize,
    },
    #[error("line {line}: `{token}` is not a number")]
    NotANumber { line: usize, token: String },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub epoch: Option<u64>,
    pub phase: Option<String>,
    pub iteration: Option<u64>,
    pub iterations_per_epoch: Option<u64>,
    /// timestamp of the newest progress row
    pub updated_at: Option<f64>,
    /// seconds, unset until two epochs were observed
    pub epoch_duration: Option<f64>,
    pub epoch_remaining: Option<f64>,
    /// only known if the total number of epochs is known
    pub total_remaining: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub scalars: BTreeMap<String, Series>,
    /// metric name -> class label -> series
    pub classwise: BTreeMap<String, BTreeMap<String, Series>>,
}

impl Metrics {
    pub fn is_empty(&self) -> bool {
        self.scalars.is_empty() && self.classwise.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Interpretation {
    pub progress: Option<Progress>,
    pub metrics: Metrics,
    /// names of the logs that were interpreted (successfully or not)
    pub consumed: Vec<String>,
    pub diagnostics: Vec<(String, LogError)>,
}

impl Interpretation {
    /// the logs that are left to be displayed raw
    pub fn remaining(&self, logs: &LogMap) -> LogMap {
        logs.iter()
            .filter(|(name, _)| !self.consumed.contains(name))
            .map(|(name, text)| (name.clone(), text.clone()))
            .collect()
    }
}

enum LogKind<'a> {
    Progress,
    Classwise(&'a str),
    Scalar(&'a str),
}

fn classify(name: &str) -> Option<LogKind<'_>> {
    if name == PROGRESS_LOG {
        Some(LogKind::Progress)
    } else if let Some(metric) = name.strip_prefix(CLASSWISE_PREFIX) {
        (!metric.is_empty()).then_some(LogKind::Classwise(metric))
    } else if let Some(metric) = name.strip_prefix(METRIC_PREFIX) {
        (!metric.is_empty()).then_some(LogKind::Scalar(metric))
    } else {
        None
    }
}

/// Interpret every known log in `logs`, failures are isolated per log
pub fn interpret(logs: &LogMap, total_epochs: Option<u64>) -> Interpretation {
    let mut interpretation = Interpretation::default();

    for (name, text) in logs.iter() {
        let Some(kind) = classify(name) else {
            continue;
        };
        interpretation.consumed.push(name.clone());

        let result = match kind {
            LogKind::Progress => parse_progress(text, total_epochs).map(|progress| {
                interpretation.progress = progress;
            }),
            LogKind::Scalar(metric) => parse_scalar(text).map(|series| {
                if !series.is_empty() {
                    interpretation
                        .metrics
                        .scalars
                        .insert(metric.to_owned(), series);
                }
            }),
            LogKind::Classwise(metric) => parse_classwise(text).map(|classes| {
                if !classes.is_empty() {
                    interpretation
                        .metrics
                        .classwise
                        .insert(metric.to_owned(), classes);
                }
            }),
        };

        if let Err(error) = result {
            warn!(log = %name, error = %error, "Failed to interpret log");
            interpretation.diagnostics.push((name.clone(), error));
        }
    }

    interpretation
}

/// non-empty rows with their 1-based line number, a non-numeric first row is treated as header
fn rows(text: &str) -> impl Iterator<Item = (usize, Vec<&str>)> {
    let mut first = true;

    text.lines()
        .enumerate()
        .map(|(index, line)| (index + 1, line.split_whitespace().collect::<Vec<_>>()))
        .filter(|(_, columns)| !columns.is_empty())
        .filter(move |(_, columns)| {
            let is_header = first && columns[0].parse::<f64>().is_err();
            first = false;

            !is_header
        })
}

fn columns<'a>(line: usize, columns: &'a [&'a str], expected: usize) -> Result<&'a [&'a str], LogError> {
    if columns.len() < expected {
        Err(LogError::MissingColumns {
            line,
            expected,
            found: columns.len(),
        })
    } else {
        Ok(columns)
    }
}

fn number<T: std::str::FromStr>(line: usize, token: &str) -> Result<T, LogError> {
    token.parse().map_err(|_| LogError::NotANumber {
        line,
        token: token.to_owned(),
    })
}

/// Parse a progress log, `Ok(None)` if it doesn't contain a single row yet
pub fn parse_progress(text: &str, total_epochs: Option<u64>) -> Result<Option<Progress>, LogError> {
    // epoch -> earliest timestamp seen for it
    let mut epoch_starts: BTreeMap<u64, f64> = BTreeMap::new();
    let mut progress: Option<Progress> = None;

    for (line, row) in rows(text) {
        let row = columns(line, &row, 5)?;
        let epoch: u64 = number(line, row[0])?;
        let iteration: u64 = number(line, row[2])?;
        let iterations_per_epoch: u64 = number(line, row[3])?;
        let timestamp: f64 = number(line, row[4])?;

        epoch_starts
            .entry(epoch)
            .and_modify(|start| *start = start.min(timestamp))
            .or_insert(timestamp);

        progress = Some(Progress {
            epoch: Some(epoch),
            phase: Some(row[1].to_owned()),
            iteration: Some(iteration),
            iterations_per_epoch: Some(iterations_per_epoch),
            updated_at: Some(timestamp),
            ..Progress::default()
        });
    }

    let Some(mut progress) = progress else {
        return Ok(None);
    };

    if epoch_starts.len() >= 2 {
        let starts: Vec<f64> = epoch_starts.values().copied().collect();
        let duration = starts.windows(2).map(|pair| pair[1] - pair[0]).sum::<f64>()
            / (starts.len() - 1) as f64;

        // both are set by the loop above whenever a row exists
        let epoch = progress.epoch.unwrap_or_default();
        let current_start = epoch_starts.get(&epoch).copied().unwrap_or_default();
        let elapsed = progress.updated_at.unwrap_or(current_start) - current_start;
        let epoch_remaining = (duration - elapsed).max(0.0);

        progress.epoch_duration = Some(duration);
        progress.epoch_remaining = Some(epoch_remaining);
        progress.total_remaining = total_epochs.map(|total| {
            let epochs_after = total.saturating_sub(epoch + 1) as f64;

            (epoch_remaining + duration * epochs_after).max(0.0)
        });
    }

    Ok(Some(progress))
}

pub fn parse_scalar(text: &str) -> Result<Series, LogError> {
    rows(text)
        .map(|(line, row)| {
            let row = columns(line, &row, 2)?;

            Ok((number(line, row[0])?, number(line, row[1])?))
        })
        .collect()
}

pub fn parse_classwise(text: &str) -> Result<BTreeMap<String, Series>, LogError> {
    let mut classes: BTreeMap<String, Series> = BTreeMap::new();

    for (line, row) in rows(text) {
        let row = columns(line, &row, 3)?;
        let epoch = number(line, row[0])?;
        let value = number(line, row[2])?;

        classes
            .entry(row[1].to_owned())
            .or_default()
            .push((epoch, value));
    }

    Ok(classes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn logs(entries: &[(&str, &str)]) -> LogMap {
        entries
            .iter()
            .map(|(name, text)| (name.to_string(), text.to_string()))
            .collect()
    }

    #[test]
    fn progress_current_fields_and_epoch_duration() {
        let text = "0 train 0 10 1000.0\n0 train 5 10 1005.0\n1 train 0 10 1010.0\n";
        let progress = parse_progress(text, None).unwrap().unwrap();

        assert_eq!(progress.epoch, Some(1));
        assert_eq!(progress.iteration, Some(0));
        assert_eq!(progress.iterations_per_epoch, Some(10));
        assert_eq!(progress.phase.as_deref(), Some("train"));
        assert!((progress.epoch_duration.unwrap() - 10.0).abs() < 1e-9);
        assert!((progress.epoch_remaining.unwrap() - 10.0).abs() < 1e-9);
        assert_eq!(progress.total_remaining, None);
    }

    #[test]
    fn single_epoch_leaves_estimates_unset() {
        let progress = parse_progress("0\ttrn\t3\t20\t50.5\n", Some(4))
            .unwrap()
            .unwrap();

        assert_eq!(progress.epoch, Some(0));
        assert_eq!(progress.epoch_duration, None);
        assert_eq!(progress.epoch_remaining, None);
        assert_eq!(progress.total_remaining, None);
    }

    #[test]
    fn remaining_time_is_never_negative() {
        // epoch 2 already took longer than the mean of the previous ones
        let text = "0 trn 0 2 0\n1 trn 0 2 10\n2 trn 0 2 20\n2 val 1 2 45\n";
        let progress = parse_progress(text, Some(4)).unwrap().unwrap();

        assert!((progress.epoch_duration.unwrap() - 10.0).abs() < 1e-9);
        assert_eq!(progress.epoch_remaining, Some(0.0));
        assert_eq!(progress.total_remaining, Some(10.0));
        assert_eq!(progress.phase.as_deref(), Some("val"));
    }

    #[test]
    fn header_row_is_stripped() {
        let series = parse_scalar("epoch value\n0 0.5\n1 0.25\n").unwrap();
        assert_eq!(series, vec![(0, 0.5), (1, 0.25)]);
    }

    #[test]
    fn empty_logs_set_nothing() {
        let interpretation = interpret(
            &logs(&[("progress", ""), ("metric_loss", "\n\n"), ("out", "hello")]),
            None,
        );

        assert_eq!(interpretation.progress, None);
        assert!(interpretation.metrics.is_empty());
        assert!(interpretation.diagnostics.is_empty());
        assert_eq!(interpretation.consumed, vec!["metric_loss", "progress"]);
    }

    #[test]
    fn classwise_metrics_are_grouped_by_class() {
        let interpretation = interpret(
            &logs(&[(
                "metric_classwise_accuracy",
                "0 cat 0.5\n0 dog 0.25\n1 cat 0.75\n",
            )]),
            None,
        );
        let accuracy = &interpretation.metrics.classwise["accuracy"];

        assert_eq!(accuracy["cat"], vec![(0, 0.5), (1, 0.75)]);
        assert_eq!(accuracy["dog"], vec![(0, 0.25)]);
        assert!(interpretation.metrics.scalars.is_empty());
    }

    #[test]
    fn broken_log_does_not_affect_the_others() {
        let raw = logs(&[
            ("metric_loss", "0 0.9\n1 oops\n"),
            ("metric_iou", "0 0.1\n1 0.2\n"),
            ("progress", "0 trn 1 4 12.0\n"),
            ("err", "Traceback"),
        ]);
        let interpretation = interpret(&raw, None);

        assert_eq!(interpretation.diagnostics.len(), 1);
        assert_eq!(interpretation.diagnostics[0].0, "metric_loss");
        assert!(matches!(
            interpretation.diagnostics[0].1,
            LogError::NotANumber { line: 2, .. }
        ));
        assert_eq!(interpretation.metrics.scalars["iou"], vec![(0, 0.1), (1, 0.2)]);
        assert_eq!(interpretation.progress.as_ref().unwrap().iteration, Some(1));
        assert_eq!(
            interpretation.remaining(&raw).keys().collect::<Vec<_>>(),
            vec!["err"]
        );
    }

    #[test]
    fn short_rows_are_reported() {
        assert_eq!(
            parse_progress("0 trn 1\n", None),
            Err(LogError::MissingColumns {
                line: 1,
                expected: 5,
                found: 3
            })
        );
    }
}
