use std::path::PathBuf;
use std::process::Output;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::AppError;

const TRIVY_IMAGE: &str = "aquasec/trivy";
const OSV_IMAGE: &str = "ghcr.io/google/osv-scanner:v1.9.2";

/// Raw report plus severity counts, both JSON text
#[derive(Debug, Clone)]
pub struct ScanOutput {
    pub report: String,
    pub summary: String,
}

#[async_trait]
pub trait Scanner: Send + Sync {
    /// Key under which this scanner's results are stored
    fn name(&self) -> &'static str;

    async fn scan(&self, registry_url: &str, repo: &str, tag: &str) -> Result<ScanOutput>;
}

pub fn scanner_by_name(name: &str, scratch_dir: PathBuf) -> Result<Arc<dyn Scanner>> {
    match name {
        "trivy" => Ok(Arc::new(TrivyScanner)),
        "osv" => Ok(Arc::new(OsvScanner { scratch_dir })),
        other => anyhow::bail!("Unknown scanner '{}' (expected trivy or osv)", other),
    }
}

/// Image reference reachable from a scanner container
pub fn image_ref(registry_url: &str, repo: &str, tag: &str) -> String {
    let host = registry_url
        .replacen("localhost", "host.docker.internal", 1)
        .replacen("127.0.0.1", "host.docker.internal", 1);
    let host = host
        .trim_start_matches("http://")
        .trim_start_matches("https://")
        .trim_end_matches('/');
    format!("{}/{}:{}", host, repo, tag)
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SeveritySummary {
    pub critical: u32,
    pub high: u32,
    pub medium: u32,
    pub low: u32,
    pub unknown: u32,
}

impl SeveritySummary {
    fn record(&mut self, severity: &str) {
        match severity.to_ascii_uppercase().as_str() {
            "CRITICAL" => self.critical += 1,
            "HIGH" => self.high += 1,
            "MEDIUM" | "MODERATE" => self.medium += 1,
            "LOW" => self.low += 1,
            _ => self.unknown += 1,
        }
    }

    fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[derive(Deserialize)]
struct TrivyReport {
    #[serde(rename = "Results", default)]
    results: Vec<TrivyResult>,
}

#[derive(Deserialize)]
struct TrivyResult {
    #[serde(rename = "Vulnerabilities", default)]
    vulnerabilities: Option<Vec<TrivyVulnerability>>,
}

#[derive(Deserialize)]
struct TrivyVulnerability {
    #[serde(rename = "Severity", default)]
    severity: String,
}

fn trivy_summary(report: &str) -> Result<SeveritySummary> {
    let report: TrivyReport = serde_json::from_str(report)?;
    let mut sum = SeveritySummary::default();
    for result in report.results {
        for vuln in result.vulnerabilities.unwrap_or_default() {
            sum.record(&vuln.severity);
        }
    }
    Ok(sum)
}

#[derive(Deserialize)]
struct OsvOutput {
    #[serde(default)]
    results: Vec<OsvResult>,
}

#[derive(Deserialize)]
struct OsvResult {
    #[serde(default)]
    packages: Vec<OsvPackage>,
}

#[derive(Deserialize)]
struct OsvPackage {
    #[serde(default)]
    vulnerabilities: Vec<OsvVulnerability>,
}

#[derive(Deserialize)]
struct OsvVulnerability {
    #[serde(default)]
    database_specific: Option<Map<String, Value>>,
}

fn osv_summary(report: &str) -> Result<SeveritySummary> {
    let out: OsvOutput = serde_json::from_str(report)?;
    let mut sum = SeveritySummary::default();
    for pkg in out.results.iter().flat_map(|r| &r.packages) {
        for vuln in &pkg.vulnerabilities {
            let severity = vuln
                .database_specific
                .as_ref()
                .and_then(|d| d.get("severity"))
                .and_then(Value::as_str)
                .unwrap_or("");
            sum.record(severity);
        }
    }
    Ok(sum)
}

fn scan_failed(scanner: &str, detail: String) -> anyhow::Error {
    AppError::Scan {
        scanner: scanner.to_string(),
        detail,
    }
    .into()
}

fn stderr_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).trim().to_string()
}

/// Runs `aquasec/trivy image` in a throwaway container
#[derive(Debug, Default)]
pub struct TrivyScanner;

#[async_trait]
impl Scanner for TrivyScanner {
    fn name(&self) -> &'static str {
        "trivy"
    }

    async fn scan(&self, registry_url: &str, repo: &str, tag: &str) -> Result<ScanOutput> {
        let image = image_ref(registry_url, repo, tag);
        info!("Scanning image {} with trivy", image);

        let output = Command::new("docker")
            .args(["run", "--rm", TRIVY_IMAGE, "image"])
            .args(["--format", "json", "--scanners", "vuln"])
            .args(["--insecure", "--no-progress"])
            .arg(&image)
            .output()
            .await
            .context("Failed to run docker")?;

        if !output.status.success() {
            return Err(scan_failed(
                "trivy",
                format!("exit status {}: {}", output.status, stderr_of(&output)),
            ));
        }

        let report = String::from_utf8_lossy(&output.stdout).into_owned();
        let summary = match trivy_summary(&report) {
            Ok(sum) => sum.to_json(),
            Err(e) => {
                warn!("Failed to parse trivy output for {}: {}", image, e);
                String::new()
            }
        };
        debug!("Trivy scan of {} done, {} bytes", image, report.len());

        Ok(ScanOutput { report, summary })
    }
}

/// Generates a CycloneDX SBOM with trivy and feeds it to osv-scanner
#[derive(Debug)]
pub struct OsvScanner {
    pub scratch_dir: PathBuf,
}

impl OsvScanner {
    async fn run(&self, image: &str, scratch: &str, sbom_name: &str) -> Result<ScanOutput> {
        let mount = format!("{}:/output", scratch);
        let container_sbom = format!("/output/{}", sbom_name);

        let sbom = Command::new("docker")
            .args(["run", "--rm", "-v", mount.as_str()])
            .args(["-v", "/var/run/docker.sock:/var/run/docker.sock"])
            .args([TRIVY_IMAGE, "image", "--format", "cyclonedx"])
            .args(["--output", container_sbom.as_str()])
            .args(["--scanners", "vuln", "--insecure", "--no-progress"])
            .arg(image)
            .output()
            .await
            .context("Failed to run docker")?;

        if !sbom.status.success() {
            return Err(scan_failed(
                "osv",
                format!("sbom generation failed: {}", stderr_of(&sbom)),
            ));
        }

        let output = Command::new("docker")
            .args(["run", "--rm", "-v", mount.as_str(), OSV_IMAGE])
            .args(["--sbom", container_sbom.as_str(), "--json"])
            .output()
            .await
            .context("Failed to run docker")?;

        // osv-scanner exits non-zero when it finds vulnerabilities
        if output.stdout.is_empty() {
            return Err(scan_failed(
                "osv",
                format!("empty output ({}): {}", output.status, stderr_of(&output)),
            ));
        }

        let report = String::from_utf8_lossy(&output.stdout).into_owned();
        let summary = match osv_summary(&report) {
            Ok(sum) => sum.to_json(),
            Err(e) => {
                warn!("Failed to parse osv-scanner output for {}: {}", image, e);
                String::new()
            }
        };

        Ok(ScanOutput { report, summary })
    }
}

#[async_trait]
impl Scanner for OsvScanner {
    fn name(&self) -> &'static str {
        "osv"
    }

    async fn scan(&self, registry_url: &str, repo: &str, tag: &str) -> Result<ScanOutput> {
        let image = image_ref(registry_url, repo, tag);
        info!("Scanning image {} with osv-scanner", image);

        tokio::fs::create_dir_all(&self.scratch_dir)
            .await
            .with_context(|| format!("Failed to create {:?}", self.scratch_dir))?;
        let scratch = tokio::fs::canonicalize(&self.scratch_dir).await?;

        let sbom_name = format!("sbom_{}_{}.json", repo.replace('/', "_"), tag);
        let result = self
            .run(&image, &scratch.to_string_lossy(), &sbom_name)
            .await;

        let sbom_path = scratch.join(&sbom_name);
        if let Err(e) = tokio::fs::remove_file(&sbom_path).await {
            debug!("Could not remove {:?}: {}", sbom_path, e);
        }

        result
    }
}

/// Insert `payload` under `scanner` in a report keyed by scanner name.
///
/// Reports written before results were keyed are treated as trivy output.
/// Payloads that are not JSON are stored as strings.
pub fn merge_scan_data(original: &str, scanner: &str, payload: &str) -> String {
    let mut data = parse_keyed(original);

    if !payload.is_empty() {
        let value = serde_json::from_str(payload)
            .unwrap_or_else(|_| Value::String(payload.to_string()));
        data.insert(scanner.to_string(), value);
    }

    Value::Object(data).to_string()
}

/// Whether a stored report holds results from a scanner other than `scanner`
pub fn has_other_results(report: &str, scanner: &str) -> bool {
    parse_keyed(report).keys().any(|k| k != scanner)
}

/// Error payload stored in place of a report when a scan fails
pub fn error_payload(err: &anyhow::Error) -> String {
    serde_json::json!({ "error": format!("{:#}", err) }).to_string()
}

fn parse_keyed(report: &str) -> Map<String, Value> {
    let mut data = Map::new();
    if report.is_empty() {
        return data;
    }

    match serde_json::from_str::<Value>(report) {
        Ok(Value::Object(map)) if map.contains_key("trivy") || map.contains_key("osv") => {
            data = map;
        }
        Ok(Value::Object(map)) if map.is_empty() => {}
        Ok(value) => {
            data.insert("trivy".to_string(), value);
        }
        Err(_) => {
            data.insert("trivy".to_string(), Value::String(report.to_string()));
        }
    }
    data
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_ref_rewrites_loopback() {
        assert_eq!(
            image_ref("http://localhost:5000", "team/app", "v1"),
            "host.docker.internal:5000/team/app:v1"
        );
        assert_eq!(
            image_ref("https://127.0.0.1:5000/", "app", "latest"),
            "host.docker.internal:5000/app:latest"
        );
        assert_eq!(
            image_ref("https://registry.example.com", "app", "1.2"),
            "registry.example.com/app:1.2"
        );
    }

    #[test]
    fn test_trivy_summary_counts_severities() {
        let report = r#"{"Results":[
            {"Target":"os","Vulnerabilities":[{"Severity":"CRITICAL"},{"Severity":"HIGH"},{"Severity":"HIGH"}]},
            {"Target":"app","Vulnerabilities":null},
            {"Target":"lib","Vulnerabilities":[{"Severity":"LOW"},{"Severity":"NEGLIGIBLE"}]}
        ]}"#;
        let sum = trivy_summary(report).unwrap();
        assert_eq!(
            sum,
            SeveritySummary {
                critical: 1,
                high: 2,
                medium: 0,
                low: 1,
                unknown: 1,
            }
        );
        assert_eq!(
            sum.to_json(),
            r#"{"Critical":1,"High":2,"Medium":0,"Low":1,"Unknown":1}"#
        );
    }

    #[test]
    fn test_osv_summary_reads_database_specific() {
        let report = r#"{"results":[{"packages":[
            {"package":{"name":"openssl"},"vulnerabilities":[
                {"id":"GHSA-1","database_specific":{"severity":"MODERATE"}},
                {"id":"GHSA-2","database_specific":{"severity":"critical"}},
                {"id":"OSV-3"}
            ]}
        ]}]}"#;
        let sum = osv_summary(report).unwrap();
        assert_eq!(sum.medium, 1);
        assert_eq!(sum.critical, 1);
        assert_eq!(sum.unknown, 1);
    }

    #[test]
    fn test_merge_into_empty_report() {
        let merged = merge_scan_data("", "trivy", r#"{"Results":[]}"#);
        assert_eq!(merged, r#"{"trivy":{"Results":[]}}"#);
    }

    #[test]
    fn test_merge_keeps_other_scanner() {
        let existing = r#"{"trivy":{"Results":[]}}"#;
        let merged = merge_scan_data(existing, "osv", r#"{"results":[]}"#);
        let value: Value = serde_json::from_str(&merged).unwrap();
        assert_eq!(value["trivy"], serde_json::json!({ "Results": [] }));
        assert_eq!(value["osv"], serde_json::json!({ "results": [] }));
    }

    #[test]
    fn test_merge_wraps_legacy_report() {
        let legacy = r#"{"Results":[{"Target":"os"}]}"#;
        let merged = merge_scan_data(legacy, "osv", r#"{"error":"boom"}"#);
        let value: Value = serde_json::from_str(&merged).unwrap();
        assert_eq!(value["trivy"]["Results"][0]["Target"], "os");
        assert_eq!(value["osv"]["error"], "boom");
    }

    #[test]
    fn test_merge_replaces_same_scanner() {
        let existing = r#"{"trivy":{"old":true}}"#;
        let merged = merge_scan_data(existing, "trivy", r#"{"new":true}"#);
        assert_eq!(merged, r#"{"trivy":{"new":true}}"#);
    }

    #[test]
    fn test_has_other_results() {
        assert!(!has_other_results("", "trivy"));
        assert!(!has_other_results("{}", "trivy"));
        assert!(!has_other_results(r#"{"trivy":{}}"#, "trivy"));
        assert!(has_other_results(r#"{"trivy":{}}"#, "osv"));
    }

    #[test]
    fn test_error_payload_is_json() {
        let err = anyhow::anyhow!("manifest \"unknown\"");
        let value: Value = serde_json::from_str(&error_payload(&err)).unwrap();
        assert_eq!(value["error"], "manifest \"unknown\"");
    }

    #[test]
    fn test_unknown_scanner_rejected() {
        assert!(scanner_by_name("clair", PathBuf::from("scan_temp")).is_err());
        assert_eq!(
            scanner_by_name("osv", PathBuf::from("scan_temp"))
                .unwrap()
                .name(),
            "osv"
        );
    }
}
