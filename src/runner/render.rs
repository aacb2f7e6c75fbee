//! Canonical run log: warnings, then one block per device.
//!
//! ```text
//! WARNING: device 10.0.0.9 unreachable, excluded from run
//! IP_CAMERA=10.0.0.5:85 LOGIN=admin PASSWORD=x
//! screenshot: True
//! screenshot_success_rate: 99.50%
//! elapsed_secs: 12.40
//! finished_at: 2024-05-01 12:00:00
//!
//! IP_CAMERA=10.0.0.6 ...
//! ```

use chrono::NaiveDateTime;
use indexmap::IndexMap;
use serde::Serialize;

use crate::capture::RECEIPT_FORMAT;
use crate::runner::types::DeviceResult;

pub const WARNING_PREFIX: &str = "WARNING:";
pub const NO_DEVICES: &str = "no devices configured";
pub const NO_REACHABLE_DEVICE: &str = "WARNING: no device reachable, run cancelled";

const ELAPSED_KEY: &str = "elapsed_secs";
const FINISHED_KEY: &str = "finished_at";

/// One device block, ending with its blank separator line
pub fn render_device_block(result: &DeviceResult, timing: bool) -> String {
    let mut block = result.config.summary_line();
    block.push('\n');
    for (name, outcome) in &result.outcomes {
        block.push_str(&format!("{}: {}\n", name, single_line(&outcome.to_string())));
    }
    if timing {
        block.push_str(&format!("{}: {:.2}\n", ELAPSED_KEY, result.elapsed.as_secs_f64()));
        block.push_str(&format!(
            "{}: {}\n",
            FINISHED_KEY,
            result.finished_at.format(RECEIPT_FORMAT)
        ));
    }
    block.push('\n');
    block
}

/// Warnings followed by every device block, trailing whitespace trimmed
pub fn render_run_log(warnings: &[String], results: &[DeviceResult], timing: bool) -> String {
    let mut text = String::new();
    for warning in warnings {
        text.push_str(warning);
        text.push('\n');
    }
    for result in results {
        text.push_str(&render_device_block(result, timing));
    }
    text.trim_end().to_string()
}

fn single_line(value: &str) -> String {
    value.replace(['\r', '\n'], " ")
}

/// A device block read back from a run log
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ParsedBlock {
    pub config_line: String,
    pub params: IndexMap<String, String>,
    pub outcomes: IndexMap<String, String>,
    pub elapsed_secs: Option<f64>,
    pub finished_at: Option<NaiveDateTime>,
}

impl ParsedBlock {
    fn push_line(&mut self, line: &str) {
        let (name, value) = match line.split_once(':') {
            Some((name, value)) => (name.trim(), value.strip_prefix(' ').unwrap_or(value)),
            None => (line.trim(), ""),
        };
        match name {
            ELAPSED_KEY => self.elapsed_secs = value.trim().parse().ok(),
            FINISHED_KEY => {
                self.finished_at = NaiveDateTime::parse_from_str(value.trim(), RECEIPT_FORMAT).ok()
            }
            _ => {
                self.outcomes.insert(name.to_string(), value.to_string());
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ParsedRunLog {
    pub warnings: Vec<String>,
    pub blocks: Vec<ParsedBlock>,
}

/// Pass/fail counts keyed on each block's `screenshot` slot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub devices: usize,
    pub passed: usize,
    pub failed: usize,
}

impl ParsedRunLog {
    pub fn summary(&self) -> RunSummary {
        let mut summary = RunSummary {
            devices: self.blocks.len(),
            ..Default::default()
        };
        for block in &self.blocks {
            match block.outcomes.get("screenshot").map(String::as_str) {
                Some("True") => summary.passed += 1,
                Some(_) => summary.failed += 1,
                None => {}
            }
        }
        summary
    }
}

/// Parse a rendered run log back into warnings and device blocks
pub fn parse_run_log(text: &str) -> ParsedRunLog {
    let mut log = ParsedRunLog::default();
    let mut current: Option<ParsedBlock> = None;

    for line in text.lines() {
        if line.trim().is_empty() {
            if let Some(block) = current.take() {
                log.blocks.push(block);
            }
            continue;
        }
        match current.as_mut() {
            Some(block) => block.push_line(line),
            None if line.starts_with(WARNING_PREFIX) => log.warnings.push(line.to_string()),
            None => {
                current = Some(ParsedBlock {
                    config_line: line.to_string(),
                    params: parse_config_line(line),
                    ..Default::default()
                })
            }
        }
    }
    if let Some(block) = current {
        log.blocks.push(block);
    }
    log
}

/// `KEY=VALUE` pairs; a token without `=` continues the previous value.
fn parse_config_line(line: &str) -> IndexMap<String, String> {
    let mut params: IndexMap<String, String> = IndexMap::new();
    let mut last: Option<String> = None;
    for token in line.split(' ') {
        match token.split_once('=') {
            Some((key, value)) if !key.is_empty() => {
                params.insert(key.to_string(), value.to_string());
                last = Some(key.to_string());
            }
            _ => {
                if let Some(value) = last.as_ref().and_then(|k| params.get_mut(k)) {
                    value.push(' ');
                    value.push_str(token);
                }
            }
        }
    }
    params
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::parse_device_configs;
    use crate::suite::Outcome;
    use chrono::NaiveDate;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn finished() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, 1)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    }

    fn result(config: &str, outcomes: &[(&str, Outcome)]) -> DeviceResult {
        DeviceResult {
            config: parse_device_configs(config).remove(0),
            outcomes: outcomes
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
            elapsed: Duration::from_millis(12_400),
            finished_at: finished(),
        }
    }

    #[test]
    fn test_scenario_block() {
        let r = result(
            "IP_CAMERA=10.0.0.5:85\nLOGIN=admin\nPASSWORD=x",
            &[("screenshot", Outcome::Flag(false))],
        );
        assert_eq!(
            render_device_block(&r, false),
            "IP_CAMERA=10.0.0.5:85 LOGIN=admin PASSWORD=x\nscreenshot: False\n\n"
        );
        assert_eq!(
            render_run_log(&[], &[r], false),
            "IP_CAMERA=10.0.0.5:85 LOGIN=admin PASSWORD=x\nscreenshot: False"
        );
    }

    #[test]
    fn test_timing_lines() {
        let r = result("IP_CAMERA=10.0.0.5", &[("reset", Outcome::from("factory reset disabled"))]);
        assert_eq!(
            render_device_block(&r, true),
            "IP_CAMERA=10.0.0.5\nreset: factory reset disabled\nelapsed_secs: 12.40\nfinished_at: 2024-05-01 12:00:00\n\n"
        );
    }

    #[test]
    fn test_render_parse_round_trip() {
        let results = vec![
            result(
                "IP_CAMERA=10.0.0.5:85\nLOGIN=admin\nPASSWORD=x\nTEXT=Hello there",
                &[
                    ("screenshot", Outcome::Flag(true)),
                    ("screenshot_success_rate", Outcome::from("99.50%")),
                    ("screenshot_error_message", Outcome::from("")),
                    ("open_door", Outcome::from("api: 2/3, relay: 3/3, key: 1/3")),
                ],
            ),
            result(
                "IP_CAMERA=10.0.0.6",
                &[
                    ("screenshot", Outcome::Flag(false)),
                    ("reset", Outcome::from("Error: timed out after 5s")),
                    ("firmware", Outcome::from("unknown test")),
                ],
            ),
        ];
        let warnings = vec!["WARNING: device 10.0.0.9 unreachable, excluded from run".to_string()];

        for timing in [false, true] {
            let text = render_run_log(&warnings, &results, timing);
            let parsed = parse_run_log(&text);

            assert_eq!(parsed.warnings, warnings);
            assert_eq!(parsed.blocks.len(), results.len());
            for (block, original) in parsed.blocks.iter().zip(&results) {
                assert_eq!(block.config_line, original.config.summary_line());
                assert_eq!(block.params, original.config.params);
                let expected: IndexMap<String, String> = original
                    .outcomes
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_string()))
                    .collect();
                assert_eq!(block.outcomes, expected);
                if timing {
                    assert_eq!(block.finished_at, Some(finished()));
                    assert_eq!(block.elapsed_secs, Some(12.4));
                }
            }
            assert_eq!(
                parsed.summary(),
                RunSummary {
                    devices: 2,
                    passed: 1,
                    failed: 1
                }
            );
        }
    }

    #[test]
    fn test_multiline_outcome_is_flattened() {
        let r = result("IP_CAMERA=10.0.0.5", &[("reset", Outcome::from("Error: a\nb"))]);
        let parsed = parse_run_log(&render_run_log(&[], &[r], false));
        assert_eq!(parsed.blocks[0].outcomes["reset"], "Error: a b");
    }
}
