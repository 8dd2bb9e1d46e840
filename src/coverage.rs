//! Coverage report reading.
//!
//! The test command writes a Cobertura `coverage.xml` and an HTML report
//! directory. Neither is cached: every summary re-reads the files so a run
//! started elsewhere is picked up immediately.

use quick_xml::events::Event;
use serde::Serialize;
use std::path::Path;

use crate::config::QaConfig;

/// URL prefix the HTML report is served under.
pub const HTML_MOUNT: &str = "/htmlcov";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoverageSummary {
    pub available: bool,
    /// Line coverage in percent, rounded to two decimals.
    pub percent: Option<f64>,
    pub html_available: bool,
}

/// Result of `POST /qa/coverage/refresh` and of publishing after a streamed run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PublishReport {
    pub mounted: bool,
    pub index: Option<String>,
}

/// Extract the root `line-rate` attribute of a Cobertura report.
pub fn parse_line_rate(xml: &str) -> Option<f64> {
    let mut reader = quick_xml::Reader::from_str(xml);
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                if e.name().as_ref() != b"coverage" {
                    return None;
                }
                let attr = e.try_get_attribute("line-rate").ok()??;
                let value = attr.unescape_value().ok()?;
                return value.trim().parse::<f64>().ok().filter(|r| r.is_finite());
            }
            Ok(Event::Eof) | Err(_) => return None,
            _ => {}
        }
    }
}

/// Convert a 0..1 rate into a percentage with two decimals.
pub fn rate_to_percent(rate: f64) -> f64 {
    (rate * 100.0 * 100.0).round() / 100.0
}

/// Read the XML report; `None` when it is missing or malformed.
pub fn read_coverage_percent(path: &Path) -> Option<f64> {
    let xml = std::fs::read_to_string(path).ok()?;
    match parse_line_rate(&xml) {
        Some(rate) => Some(rate_to_percent(rate)),
        None => {
            tracing::debug!(path = %path.display(), "coverage report has no usable line-rate");
            None
        }
    }
}

pub fn html_report_available(config: &QaConfig) -> bool {
    config.coverage_html_path().join("index.html").is_file()
}

pub fn summarize(config: &QaConfig) -> CoverageSummary {
    let percent = read_coverage_percent(&config.coverage_xml_path());
    CoverageSummary {
        available: percent.is_some(),
        percent,
        html_available: html_report_available(config),
    }
}

/// Expose the HTML report if one exists.
///
/// The report directory is served straight from disk, so publishing only
/// has to confirm the index is present.
pub fn publish_html(config: &QaConfig) -> PublishReport {
    if html_report_available(config) {
        tracing::info!(
            dir = %config.coverage_html_path().display(),
            "coverage HTML available at {}/index.html",
            HTML_MOUNT
        );
        PublishReport {
            mounted: true,
            index: Some(format!("{}/index.html", HTML_MOUNT)),
        }
    } else {
        PublishReport {
            mounted: false,
            index: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const COBERTURA: &str = r#"<?xml version="1.0" ?>
<!DOCTYPE coverage SYSTEM "http://cobertura.sourceforge.net/xml/coverage-04.dtd">
<!-- Generated by coverage.py -->
<coverage version="7.4.0" timestamp="1700000000" lines-valid="120" lines-covered="103" line-rate="0.85833" branches-covered="0" branch-rate="0" complexity="0">
  <packages/>
</coverage>
"#;

    #[test]
    fn test_parse_cobertura_root() {
        let rate = parse_line_rate(COBERTURA).unwrap();
        assert!((rate - 0.85833).abs() < 1e-9);
        assert_eq!(rate_to_percent(rate), 85.83);
    }

    #[test]
    fn test_malformed_reports() {
        assert_eq!(parse_line_rate(""), None);
        assert_eq!(parse_line_rate("<report line-rate=\"0.5\"/>"), None);
        assert_eq!(parse_line_rate("<coverage/>"), None);
        assert_eq!(parse_line_rate("<coverage line-rate=\"abc\"></coverage>"), None);
        assert_eq!(parse_line_rate("<coverage line-rate=\"1\"/>"), Some(1.0));
    }

    #[test]
    fn test_rounding() {
        assert_eq!(rate_to_percent(0.0), 0.0);
        assert_eq!(rate_to_percent(1.0), 100.0);
        assert_eq!(rate_to_percent(0.12345), 12.35);
    }

    #[test]
    fn test_summarize_reads_from_disk() {
        let tmp = TempDir::new().unwrap();
        let config = QaConfig {
            project_root: tmp.path().to_path_buf(),
            ..QaConfig::default()
        };

        let summary = summarize(&config);
        assert!(!summary.available);
        assert_eq!(summary.percent, None);
        assert!(!summary.html_available);
        assert!(!publish_html(&config).mounted);

        std::fs::write(tmp.path().join("coverage.xml"), COBERTURA).unwrap();
        std::fs::create_dir_all(tmp.path().join("htmlcov")).unwrap();
        std::fs::write(tmp.path().join("htmlcov/index.html"), "<html></html>").unwrap();

        let summary = summarize(&config);
        assert!(summary.available);
        assert_eq!(summary.percent, Some(85.83));
        assert!(summary.html_available);

        let published = publish_html(&config);
        assert!(published.mounted);
        assert_eq!(published.index.as_deref(), Some("/htmlcov/index.html"));
    }
}
