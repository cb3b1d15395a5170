//! INI parsing logic for converting `Ini` → `PipelineConfig`.
//!
//! This is the single place where INI key names are mapped to struct fields.
//!
//! ```ini
//! [pipeline]
//! timeout = 600
//! retry_initial_delay_ms = 100
//!
//! [lane.cpu_heavy]
//! max_concurrency = 2
//! max_queue_depth = 8
//!
//! [stage.parse]
//! processor = parse
//!
//! [stage.embed]
//! processor = embed
//! depends_on = parse
//! timeout = 30
//! max_retries = 3
//! ```
//!
//! Stage sections are read in file order, which becomes dispatch order.

use std::str::FromStr;
use std::time::Duration;

use ini::{Ini, Properties};
use tracing::debug;

use super::file::ConfigFileError;
use super::settings::{PipelineConfig, StageConfig};
use crate::executor::LaneKind;

const STAGE_PREFIX: &str = "stage.";
const LANE_PREFIX: &str = "lane.";

/// Parse an `Ini` object into a `PipelineConfig`.
///
/// Starts from `PipelineConfig::default()` and overlays any values found.
pub(super) fn parse_ini(ini: &Ini) -> Result<PipelineConfig, ConfigFileError> {
    let mut config = PipelineConfig::default();

    for (name, section) in ini.iter() {
        let Some(name) = name else {
            continue;
        };

        if name == "pipeline" {
            parse_pipeline_section(section, &mut config)?;
        } else if let Some(lane) = name.strip_prefix(LANE_PREFIX) {
            parse_lane_section(name, lane, section, &mut config)?;
        } else if let Some(stage) = name.strip_prefix(STAGE_PREFIX) {
            config.stages.push(parse_stage_section(name, stage, section)?);
        } else {
            return Err(ConfigFileError::UnknownSection(name.to_string()));
        }
    }

    debug!(stages = config.stages.len(), "Parsed pipeline configuration");
    Ok(config)
}

fn parse_pipeline_section(
    section: &Properties,
    config: &mut PipelineConfig,
) -> Result<(), ConfigFileError> {
    if let Some(v) = section.get("timeout") {
        let secs: u64 = parse_number("pipeline", "timeout", v)?;
        config.pipeline_timeout = (secs > 0).then(|| Duration::from_secs(secs));
    }
    if let Some(v) = section.get("retry_initial_delay_ms") {
        let ms: u64 = parse_number("pipeline", "retry_initial_delay_ms", v)?;
        config.retry.initial_delay = Duration::from_millis(ms);
    }
    if let Some(v) = section.get("retry_max_delay_ms") {
        let ms: u64 = parse_number("pipeline", "retry_max_delay_ms", v)?;
        config.retry.max_delay = Duration::from_millis(ms);
    }
    if let Some(v) = section.get("retry_multiplier") {
        let multiplier: f64 = parse_number("pipeline", "retry_multiplier", v)?;
        if !(multiplier >= 1.0 && multiplier.is_finite()) {
            return Err(invalid(
                "pipeline",
                "retry_multiplier",
                v,
                "must be a finite number >= 1.0",
            ));
        }
        config.retry.multiplier = multiplier;
    }
    if let Some(v) = section.get("inline_payload_limit") {
        config.inline_payload_limit = parse_number("pipeline", "inline_payload_limit", v)?;
    }
    Ok(())
}

fn parse_lane_section(
    section_name: &str,
    lane: &str,
    section: &Properties,
    config: &mut PipelineConfig,
) -> Result<(), ConfigFileError> {
    let kind = LaneKind::from_str(lane).map_err(|_| {
        invalid(
            section_name,
            "(section)",
            lane,
            "lane must be one of: io, cpu_light, cpu_heavy",
        )
    })?;

    let mut limits = config.resource_limits.lane(kind);
    if let Some(v) = section.get("max_concurrency") {
        let value: usize = parse_number(section_name, "max_concurrency", v)?;
        if value == 0 {
            return Err(invalid(
                section_name,
                "max_concurrency",
                v,
                "must be at least 1",
            ));
        }
        limits.max_concurrency = value;
    }
    if let Some(v) = section.get("max_queue_depth") {
        limits.max_queue_depth = parse_number(section_name, "max_queue_depth", v)?;
    }
    config.resource_limits.set_lane(kind, limits);
    Ok(())
}

fn parse_stage_section(
    section_name: &str,
    stage_name: &str,
    section: &Properties,
) -> Result<StageConfig, ConfigFileError> {
    let processor = section
        .get("processor")
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .ok_or_else(|| invalid(section_name, "processor", "", "is required"))?;

    let mut stage = StageConfig::new(stage_name.trim(), processor);

    if let Some(v) = section.get("depends_on") {
        stage.depends_on = split_list(v);
    }
    if let Some(v) = section.get("inputs") {
        stage.inputs = Some(split_list(v));
    }
    if let Some(v) = section.get("timeout") {
        let secs: f64 = parse_number(section_name, "timeout", v)?;
        if !(secs > 0.0 && secs.is_finite()) {
            return Err(invalid(
                section_name,
                "timeout",
                v,
                "must be a positive number of seconds",
            ));
        }
        stage.timeout = Duration::from_secs_f64(secs);
    }
    if let Some(v) = section.get("max_retries") {
        stage.max_retries = parse_number(section_name, "max_retries", v)?;
    }
    if let Some(v) = section.get("cost") {
        let cost: f64 = parse_number(section_name, "cost", v)?;
        if !(cost > 0.0 && cost.is_finite()) {
            return Err(invalid(section_name, "cost", v, "must be a positive number"));
        }
        stage.cost_hint = cost;
    }

    Ok(stage)
}

/// Splits a comma-separated list, dropping blanks.
fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_number<T: FromStr>(section: &str, key: &str, value: &str) -> Result<T, ConfigFileError> {
    value
        .trim()
        .parse()
        .map_err(|_| invalid(section, key, value, "must be a number"))
}

fn invalid(section: &str, key: &str, value: &str, reason: &str) -> ConfigFileError {
    ConfigFileError::InvalidValue {
        section: section.to_string(),
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> Result<PipelineConfig, ConfigFileError> {
        PipelineConfig::from_ini_str(text)
    }

    #[test]
    fn test_stage_order_follows_file() {
        let config = parse(
            "[stage.ocr]\nprocessor = ocr\n\n[stage.parse]\nprocessor = parse\n\n[stage.merge]\nprocessor = merge\ndepends_on = ocr, parse\n",
        )
        .unwrap();

        let names: Vec<_> = config.stages.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["ocr", "parse", "merge"]);
        assert_eq!(config.stages[2].depends_on, vec!["ocr", "parse"]);
    }

    #[test]
    fn test_stage_options() {
        let config = parse(
            "[stage.embed]\nprocessor = embed\ntimeout = 2.5\nmax_retries = 4\ncost = 3\ninputs = parse\n",
        )
        .unwrap();

        let stage = &config.stages[0];
        assert_eq!(stage.timeout, Duration::from_millis(2500));
        assert_eq!(stage.max_retries, 4);
        assert_eq!(stage.cost_hint, 3.0);
        assert_eq!(stage.inputs, Some(vec!["parse".to_string()]));
    }

    #[test]
    fn test_pipeline_section() {
        let config = parse(
            "[pipeline]\ntimeout = 90\nretry_initial_delay_ms = 10\nretry_max_delay_ms = 500\nretry_multiplier = 3\ninline_payload_limit = 1024\n",
        )
        .unwrap();

        assert_eq!(config.pipeline_timeout, Some(Duration::from_secs(90)));
        assert_eq!(config.retry.initial_delay, Duration::from_millis(10));
        assert_eq!(config.retry.max_delay, Duration::from_millis(500));
        assert_eq!(config.retry.multiplier, 3.0);
        assert_eq!(config.inline_payload_limit, 1024);
    }

    #[test]
    fn test_zero_pipeline_timeout_disables_limit() {
        let config = parse("[pipeline]\ntimeout = 0\n").unwrap();
        assert!(config.pipeline_timeout.is_none());
    }

    #[test]
    fn test_lane_section() {
        let config =
            parse("[lane.cpu_heavy]\nmax_concurrency = 2\nmax_queue_depth = 6\n").unwrap();
        assert_eq!(config.resource_limits.cpu_heavy.max_concurrency, 2);
        assert_eq!(config.resource_limits.cpu_heavy.max_queue_depth, 6);
    }

    #[test]
    fn test_unknown_lane_rejected() {
        let err = parse("[lane.gpu]\nmax_concurrency = 2\n").unwrap_err();
        assert!(matches!(err, ConfigFileError::InvalidValue { .. }));
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let err = parse("[lane.io]\nmax_concurrency = 0\n").unwrap_err();
        assert!(matches!(
            err,
            ConfigFileError::InvalidValue { ref key, .. } if key == "max_concurrency"
        ));
    }

    #[test]
    fn test_missing_processor_rejected() {
        let err = parse("[stage.parse]\ntimeout = 5\n").unwrap_err();
        assert!(matches!(
            err,
            ConfigFileError::InvalidValue { ref key, .. } if key == "processor"
        ));
    }

    #[test]
    fn test_bad_number_rejected() {
        let err = parse("[stage.parse]\nprocessor = parse\nmax_retries = lots\n").unwrap_err();
        assert!(matches!(err, ConfigFileError::InvalidValue { .. }));
    }

    #[test]
    fn test_unknown_section_rejected() {
        let err = parse("[cache]\nsize = 1\n").unwrap_err();
        assert!(matches!(err, ConfigFileError::UnknownSection(ref s) if s == "cache"));
    }

    #[test]
    fn test_split_list_drops_blanks() {
        assert_eq!(split_list("a, ,b,"), vec!["a", "b"]);
    }
}
