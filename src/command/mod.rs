//! Shell command assembly for emulated attacker scans.
//!
//! Commands are plain `{placeholder}` templates; [`AttackerCommand`] expands a
//! scan over its target IPs and names the XML report each scan writes.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

const NMAP_FILE_ARGS: &str = "-oX";
const NIKTO_HOST_ARG: &str = "-h";
const NIKTO_OUTPUT_ARG: &str = "-output";
const MASSCAN_OUTPUT_ARG: &str = "-oX";

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Literal(String),
    Placeholder(String),
}

/// Command line with `{name}` placeholders
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CommandTemplate {
    source: String,
    segments: Vec<Segment>,
}

impl CommandTemplate {
    pub fn new(source: impl Into<String>) -> Result<Self> {
        let source = source.into();
        let segments = Self::parse(&source)?;
        Ok(Self { source, segments })
    }

    fn parse(source: &str) -> Result<Vec<Segment>> {
        let mut segments = Vec::new();
        let mut rest = source;
        while let Some(open) = rest.find('{') {
            if rest[..open].contains('}') {
                return Err(Error::configuration(format!("stray `}}` in command `{}`", source)));
            }
            if open > 0 {
                segments.push(Segment::Literal(rest[..open].to_string()));
            }
            let after = &rest[open + 1..];
            let close = after.find('}').ok_or_else(|| {
                Error::configuration(format!("unclosed placeholder in command `{}`", source))
            })?;
            let name = after[..close].trim();
            if name.is_empty() || name.contains('{') {
                return Err(Error::configuration(format!(
                    "malformed placeholder in command `{}`",
                    source
                )));
            }
            segments.push(Segment::Placeholder(name.to_string()));
            rest = &after[close + 1..];
        }
        if rest.contains('}') {
            return Err(Error::configuration(format!("stray `}}` in command `{}`", source)));
        }
        if !rest.is_empty() {
            segments.push(Segment::Literal(rest.to_string()));
        }
        Ok(segments)
    }

    pub fn placeholders(&self) -> Vec<&str> {
        self.segments
            .iter()
            .filter_map(|s| match s {
                Segment::Placeholder(name) => Some(name.as_str()),
                Segment::Literal(_) => None,
            })
            .collect()
    }

    /// Substitutes every placeholder; a placeholder without a value is an error
    pub fn render(&self, params: &BTreeMap<String, String>) -> Result<String> {
        let mut out = String::with_capacity(self.source.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Placeholder(name) => {
                    let value = params.get(name).ok_or_else(|| {
                        Error::configuration(format!("no value for placeholder `{}`", name))
                    })?;
                    out.push_str(value);
                }
            }
        }
        Ok(out)
    }
}

impl TryFrom<String> for CommandTemplate {
    type Error = Error;

    fn try_from(source: String) -> Result<Self> {
        Self::new(source)
    }
}

impl From<CommandTemplate> for String {
    fn from(template: CommandTemplate) -> Self {
        template.source
    }
}

impl fmt::Display for CommandTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanTool {
    Nmap,
    Nikto,
    Masscan,
}

/// One expanded command and the report file it writes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanCommand {
    pub command: String,
    pub file_name: String,
}

/// Attacker scan applied to one or more targets
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttackerCommand {
    pub id: u32,
    pub name: String,
    pub tool: ScanTool,
    pub cmd: CommandTemplate,
    pub ips: Vec<String>,
    /// Index of the targeted machine
    pub index: usize,
    /// Applies to a whole subnet rather than single hosts
    #[serde(default)]
    pub subnet: bool,
}

impl AttackerCommand {
    fn file_name(&self, ip: &str) -> String {
        if self.tool == ScanTool::Masscan && self.subnet {
            return format!("{}_{}.xml", self.id, self.index);
        }
        format!("{}_{}_{}.xml", self.id, self.index, ip.replace('/', "_"))
    }

    /// Renders the base command and expands it per target IP (the action's
    /// own IPs followed by `extra_ips`)
    pub fn expand(&self, params: &BTreeMap<String, String>, extra_ips: &[String]) -> Result<Vec<ScanCommand>> {
        let base = self.cmd.render(params)?;
        self.ips
            .iter()
            .chain(extra_ips)
            .map(|ip| {
                let file_name = self.file_name(ip);
                let command = match self.tool {
                    ScanTool::Nmap => format!("{} {} {} {}", base, NMAP_FILE_ARGS, file_name, ip),
                    ScanTool::Nikto => format!(
                        "{} {} {} {} {}",
                        base, NIKTO_HOST_ARG, ip, NIKTO_OUTPUT_ARG, file_name
                    ),
                    ScanTool::Masscan => format!("{} {} {} {}", base, MASSCAN_OUTPUT_ARG, file_name, ip),
                };
                Ok(ScanCommand { command, file_name })
            })
            .collect()
    }

    /// Whether any of `ips` is a target of this command
    pub fn ips_match(&self, ips: &[String]) -> bool {
        self.ips.iter().any(|ip| ips.contains(ip))
    }
}

impl fmt::Display for AttackerCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "id:{},name:{},ips:{:?},subnet:{},index:{}",
            self.id, self.name, self.ips, self.subnet, self.index
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn scan(tool: ScanTool, subnet: bool) -> AttackerCommand {
        AttackerCommand {
            id: 11,
            name: "scan".into(),
            tool,
            cmd: CommandTemplate::new("sudo nmap -sS {timing} --min-rate {rate}").unwrap(),
            ips: vec!["172.18.9.0/24".into()],
            index: 3,
            subnet,
        }
    }

    #[test]
    fn test_render() {
        let template = CommandTemplate::new("nmap {flags} -p {port}").unwrap();
        assert_eq!(template.placeholders(), vec!["flags", "port"]);
        let cmd = template.render(&params(&[("flags", "-sV"), ("port", "22")])).unwrap();
        assert_eq!(cmd, "nmap -sV -p 22");
    }

    #[test]
    fn test_template_errors() {
        assert!(CommandTemplate::new("nmap {flags").is_err());
        assert!(CommandTemplate::new("nmap {}").is_err());
        assert!(CommandTemplate::new("nmap flags}").is_err());
        let template = CommandTemplate::new("nmap {flags}").unwrap();
        assert_eq!(template.render(&params(&[])).unwrap_err().kind(), "configuration");
    }

    #[test]
    fn test_nmap_expansion_replaces_slashes() {
        let p = params(&[("timing", "-T5"), ("rate", "100000")]);
        let cmds = scan(ScanTool::Nmap, true).expand(&p, &["172.18.9.2".to_string()]).unwrap();
        assert_eq!(cmds.len(), 2);
        assert_eq!(cmds[0].file_name, "11_3_172.18.9.0_24.xml");
        assert_eq!(
            cmds[0].command,
            "sudo nmap -sS -T5 --min-rate 100000 -oX 11_3_172.18.9.0_24.xml 172.18.9.0/24"
        );
        assert_eq!(cmds[1].file_name, "11_3_172.18.9.2.xml");
    }

    #[test]
    fn test_nikto_and_masscan() {
        let p = params(&[("timing", ""), ("rate", "1")]);
        let mut nikto = scan(ScanTool::Nikto, false);
        nikto.ips = vec!["172.18.9.3".into()];
        let cmds = nikto.expand(&p, &[]).unwrap();
        assert!(cmds[0].command.ends_with("-h 172.18.9.3 -output 11_3_172.18.9.3.xml"));

        let cmds = scan(ScanTool::Masscan, true).expand(&p, &[]).unwrap();
        assert_eq!(cmds[0].file_name, "11_3.xml");
    }

    #[test]
    fn test_serde_keeps_template_source() {
        let command = scan(ScanTool::Nmap, false);
        let json = serde_json::to_string(&command).unwrap();
        assert!(json.contains("\"sudo nmap -sS {timing} --min-rate {rate}\""));
        let restored: AttackerCommand = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, command);
        assert!(restored.ips_match(&["172.18.9.0/24".to_string()]));
    }
}
