use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::debug;

use super::{DomainMemory, Hypervisor, PhysInfo};
use crate::core::domain::DomId;
use crate::errors::HypervisorError;
use crate::utils::{KIB, MIB};

/// Hypervisor access through the `xl` toolstack.
pub struct XlHypervisor {
    xl: PathBuf,
}

impl XlHypervisor {
    pub fn new(xl: &Path) -> Self {
        Self { xl: xl.to_path_buf() }
    }

    fn run(&self, args: &[&str], domid: Option<DomId>) -> Result<String, HypervisorError> {
        let command = format!("{} {}", self.xl.display(), args.join(" "));
        debug!("Running {}", command);

        let output = Command::new(&self.xl)
            .args(args)
            .output()
            .map_err(|e| HypervisorError::Command {
                command: command.clone(),
                message: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            if let Some(domid) = domid {
                if is_missing_domain(&stderr) {
                    return Err(HypervisorError::DomainGone { domid });
                }
            }
            return Err(HypervisorError::Command {
                command,
                message: stderr.trim().to_string(),
            });
        }

        String::from_utf8(output.stdout).map_err(|e| HypervisorError::Parse(e.to_string()))
    }
}

impl Hypervisor for XlHypervisor {
    fn list_domains(&self) -> Result<Vec<DomainMemory>, HypervisorError> {
        parse_list(&self.run(&["list"], None)?)
    }

    fn physinfo(&self) -> Result<PhysInfo, HypervisorError> {
        parse_info(&self.run(&["info"], None)?)
    }

    fn set_max_mem(&self, domid: DomId, bytes: u64) -> Result<(), HypervisorError> {
        let id = domid.to_string();
        let size = format!("{}k", bytes / KIB);
        self.run(&["mem-max", &id, &size], Some(domid)).map(|_| ())
    }

    fn set_target_mem(&self, domid: DomId, bytes: u64) -> Result<(), HypervisorError> {
        let id = domid.to_string();
        let size = format!("{}k", bytes / KIB);
        self.run(&["mem-set", &id, &size], Some(domid)).map(|_| ())
    }
}

fn is_missing_domain(stderr: &str) -> bool {
    let stderr = stderr.to_ascii_lowercase();
    stderr.contains("does not exist")
        || stderr.contains("invalid domain")
        || stderr.contains("no such domain")
}

/// `xl list`: `Name ID Mem VCPUs State Time(s)`, memory in MiB.
fn parse_list(output: &str) -> Result<Vec<DomainMemory>, HypervisorError> {
    let mut domains = Vec::new();
    for line in output.lines().skip(1) {
        let columns: Vec<&str> = line.split_whitespace().collect();
        if columns.len() < 3 {
            continue;
        }
        let domid = columns[1]
            .parse::<DomId>()
            .map_err(|_| HypervisorError::Parse(format!("bad domain id in {:?}", line)))?;
        let mem_mib = columns[2]
            .parse::<u64>()
            .map_err(|_| HypervisorError::Parse(format!("bad memory in {:?}", line)))?;
        domains.push(DomainMemory {
            domid,
            memory_actual: mem_mib * MIB,
        });
    }
    Ok(domains)
}

/// `xl info`: `key : value` lines, memory figures in MiB.
fn parse_info(output: &str) -> Result<PhysInfo, HypervisorError> {
    let field = |name: &str| -> Result<u64, HypervisorError> {
        output
            .lines()
            .filter_map(|line| line.split_once(':'))
            .find(|(key, _)| key.trim() == name)
            .and_then(|(_, value)| value.trim().parse::<u64>().ok())
            .map(|mib| mib * MIB)
            .ok_or_else(|| HypervisorError::Parse(format!("missing {} in xl info", name)))
    };

    Ok(PhysInfo {
        total_memory: field("total_memory")?,
        free_memory: field("free_memory")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_xl_list() {
        let output = "Name                                        ID   Mem VCPUs\tState\tTime(s)\n\
                      Domain-0                                     0  4096     4     r-----    1234.5\n\
                      work                                         7  2048     2     -b----      98.1\n";
        let domains = parse_list(output).unwrap();
        assert_eq!(
            domains,
            vec![
                DomainMemory { domid: 0, memory_actual: 4096 * MIB },
                DomainMemory { domid: 7, memory_actual: 2048 * MIB },
            ]
        );
    }

    #[test]
    fn parses_xl_info() {
        let output = "host                   : dom0\n\
                      total_memory           : 16254\n\
                      free_memory            : 120\n\
                      sharing_freed_memory   : 0\n";
        let info = parse_info(output).unwrap();
        assert_eq!(info.total_memory, 16254 * MIB);
        assert_eq!(info.free_memory, 120 * MIB);
    }

    #[test]
    fn missing_info_field_is_a_parse_error() {
        assert!(matches!(
            parse_info("total_memory : 10\n"),
            Err(HypervisorError::Parse(_))
        ));
    }

    #[test]
    fn recognises_vanished_domains() {
        assert!(is_missing_domain("libxl: error: Domain 12 does not exist."));
        assert!(!is_missing_domain("permission denied"));
    }

    #[test]
    fn missing_binary_is_an_unexpected_error() {
        let xl = XlHypervisor::new(Path::new("/nonexistent/xl"));
        let err = xl.set_target_mem(3, 1024 * KIB).unwrap_err();
        assert!(!err.is_transient());
    }
}
