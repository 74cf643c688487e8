use once_cell::sync::Lazy;
use quick_xml::de::from_str;
use regex::Regex;

use super::Normalize;
use crate::{
    error::ParseError,
    models::{Severity, ToolExecutionResult, Vulnerability},
};

static CVE: Lazy<Regex> = Lazy::new(|| Regex::new(r"CVE-\d{4}-\d{4,}").expect("valid CVE regex"));

#[derive(Debug, serde::Deserialize)]
struct NmapRun {
    #[serde(rename = "host", default)]
    hosts: Vec<NmapHost>,
}

#[derive(Debug, serde::Deserialize)]
struct NmapHost {
    #[serde(default)]
    status: Option<NmapState>,
    #[serde(rename = "address", default)]
    addresses: Vec<NmapAddress>,
    #[serde(default)]
    hostnames: Option<NmapHostnames>,
    #[serde(default)]
    ports: Option<NmapPorts>,
    #[serde(default)]
    hostscript: Option<NmapScripts>,
}

#[derive(Debug, serde::Deserialize)]
struct NmapAddress {
    #[serde(rename = "@addr")]
    addr: String,
    #[serde(rename = "@addrtype", default)]
    addr_type: String,
}

#[derive(Debug, serde::Deserialize)]
struct NmapHostnames {
    #[serde(rename = "hostname", default)]
    hostnames: Vec<NmapHostname>,
}

#[derive(Debug, serde::Deserialize)]
struct NmapHostname {
    #[serde(rename = "@name")]
    name: String,
}

#[derive(Debug, serde::Deserialize)]
struct NmapPorts {
    #[serde(rename = "port", default)]
    ports: Vec<NmapPort>,
}

#[derive(Debug, serde::Deserialize)]
struct NmapPort {
    #[serde(rename = "@portid")]
    portid: u16,
    #[serde(rename = "@protocol")]
    protocol: String,
    state: NmapState,
    #[serde(default)]
    service: Option<NmapService>,
    #[serde(rename = "script", default)]
    scripts: Vec<NmapScript>,
}

#[derive(Debug, serde::Deserialize)]
struct NmapState {
    #[serde(rename = "@state")]
    state: String,
}

#[derive(Debug, serde::Deserialize)]
struct NmapService {
    #[serde(rename = "@name")]
    name: String,
    #[serde(rename = "@product", default)]
    product: Option<String>,
    #[serde(rename = "@version", default)]
    version: Option<String>,
}

#[derive(Debug, serde::Deserialize)]
struct NmapScripts {
    #[serde(rename = "script", default)]
    scripts: Vec<NmapScript>,
}

#[derive(Debug, serde::Deserialize)]
struct NmapScript {
    #[serde(rename = "@id")]
    id: String,
    #[serde(rename = "@output", default)]
    output: String,
}

/// Nmap XML (`-oX -`): discovered hosts, open ports, and NSE scripts reporting a vulnerable state.
pub struct NmapNormalizer;

impl Normalize for NmapNormalizer {
    fn parse(&self, raw: &ToolExecutionResult) -> Result<Vec<Vulnerability>, ParseError> {
        if !raw.stdout.contains("<nmaprun") {
            return Err(ParseError::Unexpected("no <nmaprun> element in output".into()));
        }
        let run: NmapRun = from_str(&raw.stdout)?;
        let mut findings = Vec::new();

        for host in run.hosts {
            let Some(ip) = host_address(&host.addresses) else {
                continue;
            };
            let hostname = host
                .hostnames
                .as_ref()
                .and_then(|h| h.hostnames.first().map(|e| e.name.clone()));
            let is_up = host.status.as_ref().map_or(true, |s| s.state == "up");

            let ports = host.ports.map(|p| p.ports).unwrap_or_default();
            if ports.is_empty() {
                if is_up {
                    let label = match &hostname {
                        Some(name) => format!("{ip} ({name})"),
                        None => ip.clone(),
                    };
                    findings.push(
                        Vulnerability::new(Severity::Info, "host-discovered", format!("Host up: {label}"))
                            .with_description("Host answered Nmap host discovery")
                            .with_location(ip.clone()),
                    );
                }
            }

            for port in ports {
                if port.state.state != "open" {
                    continue;
                }
                let location = format!("{ip}:{}", port.portid);
                findings.push(open_port_finding(&port, &location));
                findings.extend(
                    port.scripts
                        .iter()
                        .filter_map(|s| script_finding(s, &location)),
                );
            }

            if let Some(hostscript) = host.hostscript {
                findings.extend(
                    hostscript
                        .scripts
                        .iter()
                        .filter_map(|s| script_finding(s, &ip)),
                );
            }
        }

        Ok(findings)
    }
}

fn host_address(addresses: &[NmapAddress]) -> Option<String> {
    addresses
        .iter()
        .find(|a| a.addr_type == "ipv4" || a.addr_type == "ipv6")
        .or_else(|| addresses.first())
        .map(|a| a.addr.clone())
}

fn open_port_finding(port: &NmapPort, location: &str) -> Vulnerability {
    let service_name = port.service.as_ref().map(|s| s.name.as_str()).unwrap_or("");
    let mut label = service_name.to_string();
    if let Some(service) = &port.service {
        for part in [&service.product, &service.version].into_iter().flatten() {
            label.push(' ');
            label.push_str(part);
        }
    }
    let title = if label.trim().is_empty() {
        format!("Open port {}/{}", port.portid, port.protocol)
    } else {
        format!("Open port {}/{} ({})", port.portid, port.protocol, label.trim())
    };

    match risky_service(port.portid, service_name) {
        Some((severity, why, fix)) => Vulnerability::new(severity, "exposed-service", title)
            .with_description(why)
            .with_solution(fix)
            .with_location(location),
        None => Vulnerability::new(Severity::Info, "open-port", title)
            .with_description("Exposed service detected by Nmap")
            .with_location(location),
    }
}

fn risky_service(port: u16, service: &str) -> Option<(Severity, &'static str, &'static str)> {
    match (port, service) {
        (23, _) | (_, "telnet") => Some((
            Severity::High,
            "Telnet transmits credentials in cleartext",
            "Disable telnet and use SSH",
        )),
        (6379, _) | (_, "redis") | (27017, _) | (_, "mongodb") | (9200, _) => Some((
            Severity::High,
            "Datastore reachable from the network, often without authentication",
            "Bind the service to localhost or require authentication",
        )),
        (21, _) | (_, "ftp") => Some((
            Severity::Medium,
            "FTP transmits credentials in cleartext",
            "Replace FTP with SFTP or FTPS",
        )),
        (445, _) | (_, "microsoft-ds") | (3389, _) | (_, "ms-wbt-server") | (5900, _) | (_, "vnc") => Some((
            Severity::Medium,
            "Remote administration or file sharing service exposed",
            "Restrict access with a firewall or VPN",
        )),
        _ => None,
    }
}

fn script_finding(script: &NmapScript, location: &str) -> Option<Vulnerability> {
    let output = script.output.trim();
    let severity = if output.contains("LIKELY VULNERABLE") {
        Severity::Medium
    } else if output.contains("VULNERABLE") && !output.contains("NOT VULNERABLE") {
        Severity::High
    } else {
        return None;
    };
    let mut vuln = Vulnerability::new(severity, "nmap-script", format!("{} reports a vulnerability", script.id))
        .with_description(output)
        .with_location(location);
    if let Some(cve) = CVE.find(output) {
        vuln = vuln.with_reference(cve.as_str());
    }
    Some(vuln)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{normalizers::raw, tools::ToolKind};

    const SERVICE_SCAN: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE nmaprun>
<nmaprun scanner="nmap" args="nmap -sV -oX - 192.168.1.10" start="1700000000">
<scaninfo type="syn" protocol="tcp" numservices="1000" services="1-1000"/>
<verbose level="0"/>
<host starttime="1700000000" endtime="1700000010">
<status state="up" reason="syn-ack"/>
<address addr="192.168.1.10" addrtype="ipv4"/>
<address addr="AA:BB:CC:DD:EE:FF" addrtype="mac"/>
<hostnames><hostname name="demo.local" type="user"/></hostnames>
<ports>
<extraports state="closed" count="997"/>
<port protocol="tcp" portid="22"><state state="closed" reason="reset"/><service name="ssh"/></port>
<port protocol="tcp" portid="23"><state state="open" reason="syn-ack"/><service name="telnet"/></port>
<port protocol="tcp" portid="80"><state state="open" reason="syn-ack"/><service name="http" product="nginx" version="1.18.0"/>
<script id="http-vuln-cve2017-1001000" output="&#xa;  VULNERABLE:&#xa;  State: VULNERABLE&#xa;  IDs: CVE:CVE-2017-1001000"/>
</port>
</ports>
</host>
<runstats><finished time="1700000010"/><hosts up="1" down="0" total="1"/></runstats>
</nmaprun>"#;

    const PING_SCAN: &str = r#"<?xml version="1.0"?>
<nmaprun scanner="nmap" args="nmap -sn -oX - scanme.nmap.org">
<host><status state="up" reason="echo-reply"/><address addr="45.33.32.156" addrtype="ipv4"/><hostnames><hostname name="scanme.nmap.org" type="user"/></hostnames></host>
<runstats><finished time="1"/></runstats>
</nmaprun>"#;

    #[test]
    fn parse_nmap_xml_extracts_open_ports_and_scripts() {
        let findings = NmapNormalizer.normalize(&raw(ToolKind::Nmap, SERVICE_SCAN));
        assert_eq!(findings.len(), 3);

        let telnet = &findings[0];
        assert_eq!(telnet.severity, Severity::High);
        assert_eq!(telnet.kind, "exposed-service");
        assert_eq!(telnet.location.as_deref(), Some("192.168.1.10:23"));

        let http = &findings[1];
        assert_eq!(http.severity, Severity::Info);
        assert_eq!(http.title, "Open port 80/tcp (http nginx 1.18.0)");

        let script = &findings[2];
        assert_eq!(script.kind, "nmap-script");
        assert_eq!(script.severity, Severity::High);
        assert_eq!(script.reference.as_deref(), Some("CVE-2017-1001000"));
    }

    #[test]
    fn ping_scan_reports_discovered_hosts() {
        let findings = NmapNormalizer.normalize(&raw(ToolKind::Nmap, PING_SCAN));
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].kind, "host-discovered");
        assert_eq!(findings[0].title, "Host up: 45.33.32.156 (scanme.nmap.org)");
    }

    #[test]
    fn truncated_xml_degrades_to_no_findings() {
        let truncated = &SERVICE_SCAN[..SERVICE_SCAN.len() / 2];
        assert!(NmapNormalizer.parse(&raw(ToolKind::Nmap, truncated)).is_err());
        assert!(NmapNormalizer.normalize(&raw(ToolKind::Nmap, truncated)).is_empty());
    }

    #[test]
    fn plain_text_output_is_rejected() {
        let text = "Starting Nmap 7.94\nNmap done: 1 IP address (1 host up)";
        assert!(NmapNormalizer.normalize(&raw(ToolKind::Nmap, text)).is_empty());
    }
}
