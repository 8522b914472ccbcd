//! JUnit XML reading and writing
//!
//! Shard reports on disk use the JUnit XML dialect that CI systems ingest.
//! Only the subset the orchestrator itself produces is understood: one
//! `<testsuite>` with `<testcase>` children carrying optional `<failure>`
//! and `<skipped>` markers. Nothing in the dependency stack speaks XML, so
//! escaping and scanning live here.

use std::path::Path;
use std::time::Duration;

use crate::error::Error;
use crate::report::{TestCase, TestReport};

/// Serialize a report to JUnit XML
pub fn write_report(report: &TestReport) -> String {
    let mut out = String::with_capacity(1024);
    out.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    out.push_str(&format!(
        "<testsuite name=\"{}\" tests=\"{}\" failures=\"{}\" errors=\"{}\" time=\"{:.3}\">\n",
        escape(&report.name),
        report.tests,
        report.failures,
        report.errors,
        report.duration.as_secs_f64(),
    ));

    for case in &report.test_cases {
        out.push_str(&format!(
            "  <testcase name=\"{}\" classname=\"{}\" time=\"{:.3}\"",
            escape(&case.name),
            escape(&case.class_name),
            case.duration.as_secs_f64(),
        ));
        match (&case.failure_message, case.skipped) {
            (Some(message), _) => {
                out.push_str(">\n");
                out.push_str(&format!(
                    "    <failure message=\"{}\"></failure>\n",
                    escape(message)
                ));
                out.push_str("  </testcase>\n");
            }
            (None, true) => {
                out.push_str(">\n    <skipped/>\n  </testcase>\n");
            }
            (None, false) => out.push_str("/>\n"),
        }
    }

    out.push_str("</testsuite>\n");
    out
}

/// Write a report to `path` as JUnit XML
pub fn write_report_file(report: &TestReport, path: &Path) -> Result<(), Error> {
    std::fs::write(path, write_report(report))?;
    Ok(())
}

/// Parse a JUnit XML document into a report.
///
/// Tolerant of attribute order and self-closed vs. expanded elements;
/// everything outside the understood subset is ignored.
pub fn parse_report(input: &str) -> Result<TestReport, Error> {
    let mut report = TestReport::default();
    let mut saw_suite = false;
    let mut rest = input;

    while let Some(start) = rest.find('<') {
        rest = &rest[start + 1..];
        let end = rest
            .find('>')
            .ok_or_else(|| Error::report("unterminated tag in JUnit XML"))?;
        let tag = &rest[..end];
        rest = &rest[end + 1..];

        if tag.starts_with('?') || tag.starts_with('!') || tag.starts_with('/') {
            continue;
        }

        let tag_name = tag
            .split([' ', '\t', '\n', '/'])
            .next()
            .unwrap_or_default();

        match tag_name {
            "testsuite" => {
                saw_suite = true;
                report.name = attribute(tag, "name").unwrap_or_default();
                report.tests = numeric_attribute(tag, "tests");
                report.failures = numeric_attribute(tag, "failures");
                report.errors = numeric_attribute(tag, "errors");
                report.duration = duration_attribute(tag, "time");
            }
            "testcase" => {
                report.test_cases.push(TestCase {
                    name: attribute(tag, "name").unwrap_or_default(),
                    class_name: attribute(tag, "classname").unwrap_or_default(),
                    duration: duration_attribute(tag, "time"),
                    failure_message: None,
                    skipped: false,
                });
            }
            "failure" | "error" => {
                if let Some(case) = report.test_cases.last_mut() {
                    case.failure_message =
                        Some(attribute(tag, "message").unwrap_or_else(|| "failure".to_string()));
                }
            }
            "skipped" => {
                if let Some(case) = report.test_cases.last_mut() {
                    case.skipped = true;
                }
            }
            _ => {}
        }
    }

    if !saw_suite {
        return Err(Error::report("no <testsuite> element found"));
    }
    Ok(report)
}

fn attribute(tag: &str, name: &str) -> Option<String> {
    let needle = format!("{name}=\"");
    let start = tag.find(&needle)? + needle.len();
    let end = tag[start..].find('"')? + start;
    Some(unescape(&tag[start..end]))
}

fn numeric_attribute(tag: &str, name: &str) -> u32 {
    attribute(tag, name)
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

fn duration_attribute(tag: &str, name: &str) -> Duration {
    attribute(tag, name)
        .and_then(|v| v.parse::<f64>().ok())
        .map(Duration::from_secs_f64)
        .unwrap_or(Duration::ZERO)
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

fn unescape(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_report() -> TestReport {
        TestReport {
            name: "aws-ubuntu-containerd-1.30".to_string(),
            tests: 2,
            failures: 1,
            errors: 0,
            duration: Duration::from_secs_f64(12.5),
            test_cases: vec![
                TestCase {
                    name: "wait for control plane".to_string(),
                    class_name: "wait for control plane".to_string(),
                    duration: Duration::from_secs(8),
                    failure_message: None,
                    skipped: false,
                },
                TestCase {
                    name: "storage".to_string(),
                    class_name: "conformance".to_string(),
                    duration: Duration::from_secs(4),
                    failure_message: Some("pvc \"data\" never bound <pending>".to_string()),
                    skipped: false,
                },
                TestCase {
                    name: "load-balancer".to_string(),
                    class_name: "conformance".to_string(),
                    duration: Duration::ZERO,
                    failure_message: None,
                    skipped: true,
                },
            ],
        }
    }

    #[test]
    fn written_reports_parse_back_with_special_characters_intact() {
        let original = sample_report();
        let xml = write_report(&original);
        let parsed = parse_report(&xml).unwrap();

        assert_eq!(parsed.name, original.name);
        assert_eq!(parsed.tests, 2);
        assert_eq!(parsed.failures, 1);
        assert_eq!(parsed.test_cases.len(), 3);
        assert_eq!(
            parsed.test_cases[1].failure_message.as_deref(),
            Some("pvc \"data\" never bound <pending>")
        );
        assert!(parsed.test_cases[2].skipped);
    }

    #[test]
    fn parses_reports_from_other_writers() {
        // Attribute order and whitespace differ between producers
        let xml = r#"<?xml version="1.0"?>
<testsuite errors="0" failures="0" tests="1" time="3.2" name="shard-1">
    <testcase time="3.2" classname="e2e" name="dns resolution"></testcase>
</testsuite>"#;

        let parsed = parse_report(xml).unwrap();
        assert_eq!(parsed.name, "shard-1");
        assert_eq!(parsed.test_cases.len(), 1);
        assert_eq!(parsed.test_cases[0].class_name, "e2e");
    }

    #[test]
    fn document_without_testsuite_is_rejected() {
        assert!(parse_report("<notasuite/>").is_err());
        assert!(parse_report("").is_err());
    }

    #[test]
    fn file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junit.aws-ubuntu-containerd-1.30.xml");

        write_report_file(&sample_report(), &path).unwrap();
        let parsed = parse_report(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(parsed.test_cases.len(), 3);
    }
}
